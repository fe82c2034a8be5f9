//! Splitting engine.
//!
//! Grid projects split a tile into its four children at the next zoom level,
//! clipped to the project AOI. Arbitrary projects bisect the task polygon into
//! equal-area halves, recursively.

use super::{Engine, apply_transition};
use crate::config::SplittingConfig;
use crate::db::{projects, tasks};
use crate::error::{TaskError, TaskResult};
use crate::geometry::{BBox, Geometry, GeometryOps, child_tiles, tile_bounds};
use crate::state_machine::TaskEvent;
use crate::types::{
    GridMode, LockPurpose, NewTask, PrincipalId, Project, ProjectId, SplitOutcome, Task, TaskId,
    TaskStatus,
};
use tracing::info;

/// Relative area shortfall tolerated before a clipped square counts as partial.
const FULL_COVER_TOLERANCE: f64 = 1e-9;

/// Iteration cap for the bisection cut search.
const MAX_CUT_ITERATIONS: u32 = 64;

impl Engine {
    /// Split a task into children and mark it `SPLIT`.
    pub fn split(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
    ) -> TaskResult<SplitOutcome> {
        if !self.permissions.may_lock(principal, project_id, LockPurpose::Mapping) {
            return Err(TaskError::not_permitted(principal, project_id, "split tasks"));
        }

        let outcome = self.db.transaction(|tx| {
            let project = projects::require_project(tx, project_id)?;
            let task = tasks::require_task(tx, project_id, task_id)?;

            if task.status == TaskStatus::Split {
                return Err(TaskError::not_splittable(task_id, "task is already split"));
            }
            if task.status.is_locked() {
                return Err(TaskError::not_splittable(task_id, "task is locked"));
            }
            if self
                .geometry
                .intersect(&project.aoi, &task.geometry.bbox().to_geometry())
                .is_none()
            {
                return Err(TaskError::not_splittable(
                    task_id,
                    "task does not intersect the project area",
                ));
            }

            let children = match project.grid {
                GridMode::Square => self.grid_children(&project, &task)?,
                GridMode::Arbitrary => {
                    let generation = tasks::split_generation(tx, project_id, task_id)?;
                    if generation >= self.splitting.max_arbitrary_generations {
                        return Err(TaskError::not_splittable(
                            task_id,
                            format!("task is already {} splits deep", generation),
                        ));
                    }
                    arbitrary_children(self.geometry.as_ref(), &self.splitting, &task)
                }
            };
            if children.is_empty() {
                return Err(TaskError::not_splittable(
                    task_id,
                    "no child intersects the project area",
                ));
            }

            let mut created = Vec::with_capacity(children.len());
            let mut next_id = tasks::next_task_id(tx, project_id)?;
            for child in children {
                created.push(tasks::insert_task(tx, project_id, next_id, child)?);
                next_id += 1;
            }

            let (parent, _) = apply_transition(tx, &task, principal, TaskEvent::Split, None)?;
            Ok(SplitOutcome {
                parent,
                children: created,
            })
        })?;

        info!(
            project_id,
            task_id,
            principal,
            children = outcome.children.len(),
            "Task split"
        );
        Ok(outcome)
    }

    /// The next-zoom tiles of a grid task that survive clipping to the AOI.
    fn grid_children(&self, project: &Project, task: &Task) -> TaskResult<Vec<NewTask>> {
        let Some((x, y, zoom)) = task.grid_address() else {
            return Err(TaskError::not_splittable(task.id, "task has no grid address"));
        };
        if zoom >= project.max_zoom {
            return Err(TaskError::not_splittable(
                task.id,
                format!("zoom {} is the project maximum", zoom),
            ));
        }

        let children = child_tiles(x, y, zoom)
            .into_iter()
            .filter_map(|(cx, cy, cz)| {
                let (geometry, is_square) =
                    clip_tile(self.geometry.as_ref(), &project.aoi, &tile_bounds(cx, cy, cz))?;
                Some(NewTask {
                    geometry,
                    x: Some(cx),
                    y: Some(cy),
                    zoom: Some(cz),
                    is_square,
                    parent_id: Some(task.id),
                })
            })
            .collect();
        Ok(children)
    }
}

/// Clip a tile square to the AOI.
///
/// Returns the stored geometry (the full square when fully covered) and
/// whether it is square, or `None` when the tile misses the AOI.
pub(crate) fn clip_tile(
    geometry: &dyn GeometryOps,
    aoi: &Geometry,
    bounds: &BBox,
) -> Option<(Geometry, bool)> {
    let square = bounds.to_geometry();
    let clipped = geometry.intersect(aoi, &square)?;
    if clipped.area() >= square.area() * (1.0 - FULL_COVER_TOLERANCE) {
        Some((square, true))
    } else {
        Some((clipped, false))
    }
}

fn arbitrary_children(
    geometry: &dyn GeometryOps,
    splitting: &SplittingConfig,
    task: &Task,
) -> Vec<NewTask> {
    let mut pieces = vec![task.geometry.clone()];
    for _ in 0..splitting.arbitrary_split_depth {
        pieces = pieces
            .into_iter()
            .flat_map(|piece| match bisect(geometry, &piece, splitting.bisect_tolerance) {
                Some((a, b)) => vec![a, b],
                None => vec![piece],
            })
            .collect();
    }
    if pieces.len() < 2 {
        return Vec::new();
    }

    pieces
        .into_iter()
        .map(|geometry| NewTask {
            geometry,
            x: None,
            y: None,
            zoom: None,
            is_square: false,
            parent_id: Some(task.id),
        })
        .collect()
}

/// Cut `shape` across its longer axis into two halves of near-equal area.
///
/// Either half may come out in several parts when `shape` is concave.
fn bisect(
    geometry: &dyn GeometryOps,
    shape: &Geometry,
    tolerance: f64,
) -> Option<(Geometry, Geometry)> {
    let bbox = shape.bbox();
    let total = shape.area();
    let vertical_cut = bbox.width() >= bbox.height();
    let (mut low, mut high) = if vertical_cut {
        (bbox.min_x, bbox.max_x)
    } else {
        (bbox.min_y, bbox.max_y)
    };

    let mut cut = (low + high) / 2.0;
    for _ in 0..MAX_CUT_ITERATIONS {
        let first_area = geometry
            .intersect(shape, &cut_boxes(&bbox, cut, vertical_cut).0.to_geometry())
            .map(|p| p.area())
            .unwrap_or(0.0);
        let imbalance = first_area - total / 2.0;
        if imbalance.abs() <= tolerance * total {
            break;
        }
        if imbalance > 0.0 {
            high = cut;
        } else {
            low = cut;
        }
        cut = (low + high) / 2.0;
    }

    let (first, second) = cut_boxes(&bbox, cut, vertical_cut);
    let first = geometry.intersect(shape, &first.to_geometry())?;
    let second = geometry.intersect(shape, &second.to_geometry())?;
    Some((first, second))
}

/// The two boxes either side of `cut`.
fn cut_boxes(bbox: &BBox, cut: f64, vertical_cut: bool) -> (BBox, BBox) {
    if vertical_cut {
        (BBox { max_x: cut, ..*bbox }, BBox { min_x: cut, ..*bbox })
    } else {
        (BBox { max_y: cut, ..*bbox }, BBox { min_y: cut, ..*bbox })
    }
}
