//! Project creation and initial task grid generation.

use super::Engine;
use super::split::clip_tile;
use crate::db::{projects, tasks};
use crate::error::{TaskError, TaskResult};
use crate::geometry::{Geometry, tile_bounds, tile_count, tiles_covering};
use crate::types::{GridMode, NewTask, Project, Task};
use tracing::info;

/// Highest zoom the slippy-map tile scheme is used with.
const MAX_TILE_ZOOM: i32 = 24;

impl Engine {
    /// Create a project and its initial tasks.
    ///
    /// Square mode covers the AOI with tiles at `zoom`; arbitrary mode creates
    /// a single task shaped like the AOI.
    pub fn create_project(
        &self,
        aoi: &Geometry,
        grid: GridMode,
        zoom: i32,
        max_zoom: i32,
    ) -> TaskResult<(Project, Vec<Task>)> {
        aoi.validate()?;
        if !(0..=MAX_TILE_ZOOM).contains(&zoom) || !(zoom..=MAX_TILE_ZOOM).contains(&max_zoom) {
            return Err(TaskError::InvalidInput(format!(
                "zoom {} / max zoom {} out of range 0..={}",
                zoom, max_zoom, MAX_TILE_ZOOM
            )));
        }

        if grid == GridMode::Square {
            let tiles = tile_count(&aoi.bbox(), zoom);
            if tiles > self.grid.max_tasks {
                return Err(TaskError::InvalidInput(format!(
                    "grid at zoom {} needs {} tiles, limit is {}",
                    zoom, tiles, self.grid.max_tasks
                )));
            }
        }

        let new_tasks = match grid {
            GridMode::Square => tiles_covering(&aoi.bbox(), zoom)
                .into_iter()
                .filter_map(|(x, y)| {
                    let (geometry, is_square) =
                        clip_tile(self.geometry.as_ref(), aoi, &tile_bounds(x, y, zoom))?;
                    Some(NewTask {
                        geometry,
                        x: Some(x),
                        y: Some(y),
                        zoom: Some(zoom),
                        is_square,
                        parent_id: None,
                    })
                })
                .collect::<Vec<_>>(),
            GridMode::Arbitrary => vec![NewTask {
                geometry: aoi.clone(),
                x: None,
                y: None,
                zoom: None,
                is_square: false,
                parent_id: None,
            }],
        };
        if new_tasks.is_empty() {
            return Err(TaskError::InvalidInput(
                "area of interest produced no tasks".to_string(),
            ));
        }

        self.insert_project(aoi, grid, max_zoom, new_tasks)
    }

    /// Create an arbitrary-mode project from explicit task polygons.
    pub fn create_project_with_tasks(
        &self,
        aoi: &Geometry,
        polygons: Vec<Geometry>,
    ) -> TaskResult<(Project, Vec<Task>)> {
        aoi.validate()?;
        if polygons.is_empty() {
            return Err(TaskError::InvalidInput("no task polygons given".to_string()));
        }
        let mut new_tasks = Vec::with_capacity(polygons.len());
        for geometry in polygons {
            geometry.validate()?;
            new_tasks.push(NewTask {
                geometry,
                x: None,
                y: None,
                zoom: None,
                is_square: false,
                parent_id: None,
            });
        }
        self.insert_project(aoi, GridMode::Arbitrary, 0, new_tasks)
    }

    fn insert_project(
        &self,
        aoi: &Geometry,
        grid: GridMode,
        max_zoom: i32,
        new_tasks: Vec<NewTask>,
    ) -> TaskResult<(Project, Vec<Task>)> {
        let (project, created) = self.db.transaction(|tx| {
            let project = projects::insert_project(tx, aoi, grid, max_zoom)?;
            let mut created = Vec::with_capacity(new_tasks.len());
            for (id, task) in (1..).zip(new_tasks.iter().cloned()) {
                created.push(tasks::insert_task(tx, project.id, id, task)?);
            }
            Ok((project, created))
        })?;

        info!(
            project_id = project.id,
            grid = grid.as_str(),
            tasks = created.len(),
            "Project created"
        );
        Ok((project, created))
    }
}
