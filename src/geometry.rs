//! Task geometry, Web Mercator tile math and the intersection collaborator.
//!
//! A [`Geometry`] is one or more disjoint parts, each a single closed exterior
//! ring in lon/lat degrees. It serialises as a GeoJSON `Polygon` when it has
//! one part and as a `MultiPolygon` otherwise. Interior rings are not
//! supported.

use crate::error::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Fraction of the reference area below which a piece is treated as empty.
const EMPTY_AREA_RATIO: f64 = 1e-9;

type Ring = Vec<[f64; 2]>;

/// Wire form of [`Geometry`].
#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum GeoJson {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
}

/// A polygonal area made of one or more single-ring parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeoJson", into = "GeoJson")]
pub struct Geometry {
    parts: Vec<Ring>,
}

impl TryFrom<GeoJson> for Geometry {
    type Error = String;

    fn try_from(value: GeoJson) -> Result<Self, Self::Error> {
        let polygons = match value {
            GeoJson::Polygon { coordinates } => vec![coordinates],
            GeoJson::MultiPolygon { coordinates } => coordinates,
        };
        let mut parts = Vec::with_capacity(polygons.len());
        for mut rings in polygons {
            if rings.len() != 1 {
                return Err("each polygon must have exactly one ring".to_string());
            }
            parts.extend(rings.pop());
        }
        Ok(Self { parts })
    }
}

impl From<Geometry> for GeoJson {
    fn from(geometry: Geometry) -> Self {
        if geometry.parts.len() == 1 {
            GeoJson::Polygon {
                coordinates: geometry.parts,
            }
        } else {
            GeoJson::MultiPolygon {
                coordinates: geometry.parts.into_iter().map(|ring| vec![ring]).collect(),
            }
        }
    }
}

impl Geometry {
    /// Build a single-part geometry from an exterior ring, closing it if needed.
    pub fn from_ring(ring: Ring) -> Self {
        Self::from_rings(vec![ring])
    }

    /// Build a geometry with one part per ring, closing each if needed.
    pub fn from_rings(rings: Vec<Ring>) -> Self {
        Self {
            parts: rings.into_iter().map(close_ring).collect(),
        }
    }

    /// Parse a GeoJSON Polygon or MultiPolygon (bare or wrapped in a Feature).
    pub fn from_geojson(text: &str) -> TaskResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| TaskError::InvalidInput(format!("invalid GeoJSON: {}", e)))?;
        let is_feature = value.get("type").and_then(|t| t.as_str()) == Some("Feature");
        let geometry = if is_feature {
            value.get("geometry").cloned().unwrap_or_default()
        } else {
            value
        };
        let geometry: Geometry = serde_json::from_value(geometry).map_err(|e| {
            TaskError::InvalidInput(format!("expected a Polygon or MultiPolygon: {}", e))
        })?;
        geometry.validate()?;
        Ok(geometry)
    }

    /// Check every part is a closed ring of at least three points with area.
    pub fn validate(&self) -> TaskResult<()> {
        if self.parts.is_empty() {
            return Err(TaskError::InvalidInput("geometry has no parts".to_string()));
        }
        for ring in &self.parts {
            if ring.len() < 4 || ring.first() != ring.last() {
                return Err(TaskError::InvalidInput(
                    "polygon ring must be closed with at least three distinct points".to_string(),
                ));
            }
            if ring.iter().flatten().any(|c| !c.is_finite()) {
                return Err(TaskError::InvalidInput(
                    "polygon has non-finite coordinates".to_string(),
                ));
            }
        }
        let bbox = self.bbox();
        if self.area() <= bbox.width() * bbox.height() * EMPTY_AREA_RATIO {
            return Err(TaskError::InvalidInput("polygon has no area".to_string()));
        }
        Ok(())
    }

    /// Vertices of each part, without the closing duplicate.
    pub fn parts(&self) -> impl Iterator<Item = &[[f64; 2]]> {
        self.parts.iter().map(|ring| open_ring(ring))
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Total area of all parts.
    pub fn area(&self) -> f64 {
        self.parts().map(|part| signed_area(part).abs()).sum()
    }

    pub fn bbox(&self) -> BBox {
        let mut bbox = BBox {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for [x, y] in self.parts().flatten() {
            bbox.min_x = bbox.min_x.min(*x);
            bbox.min_y = bbox.min_y.min(*y);
            bbox.max_x = bbox.max_x.max(*x);
            bbox.max_y = bbox.max_y.max(*y);
        }
        bbox
    }
}

fn close_ring(mut ring: Ring) -> Ring {
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied())
        && first != last
    {
        ring.push(first);
    }
    ring
}

fn open_ring(ring: &[[f64; 2]]) -> &[[f64; 2]] {
    if ring.len() > 1 && ring.first() == ring.last() {
        &ring[..ring.len() - 1]
    } else {
        ring
    }
}

/// Shoelace area (positive for counter-clockwise rings).
///
/// Coordinates are taken relative to the first vertex so small rings far from
/// the origin keep their precision.
fn signed_area(points: &[[f64; 2]]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let [ox, oy] = points[0];
    let mut sum = 0.0;
    for i in 0..points.len() {
        let [x1, y1] = points[i];
        let [x2, y2] = points[(i + 1) % points.len()];
        sum += (x1 - ox) * (y2 - oy) - (x2 - ox) * (y1 - oy);
    }
    sum / 2.0
}

/// Counter-clockwise copy of an open ring.
fn counter_clockwise(points: &[[f64; 2]]) -> Ring {
    let mut ring = points.to_vec();
    if signed_area(&ring) < 0.0 {
        ring.reverse();
    }
    ring
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BBox {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Counter-clockwise rectangle geometry.
    pub fn to_geometry(&self) -> Geometry {
        Geometry::from_ring(vec![
            [self.min_x, self.min_y],
            [self.max_x, self.min_y],
            [self.max_x, self.max_y],
            [self.min_x, self.max_y],
        ])
    }
}

// =============================================================================
// Web Mercator (XYZ) tiles
// =============================================================================

/// Bounds of tile `(x, y)` at `zoom` in lon/lat degrees. `y` grows southwards.
pub fn tile_bounds(x: i32, y: i32, zoom: i32) -> BBox {
    BBox {
        min_x: tile_x_to_lon(x, zoom),
        max_x: tile_x_to_lon(x + 1, zoom),
        min_y: tile_y_to_lat(y + 1, zoom),
        max_y: tile_y_to_lat(y, zoom),
    }
}

fn tile_x_to_lon(x: i32, zoom: i32) -> f64 {
    x as f64 / 2f64.powi(zoom) * 360.0 - 180.0
}

fn tile_y_to_lat(y: i32, zoom: i32) -> f64 {
    let n = PI - 2.0 * PI * y as f64 / 2f64.powi(zoom);
    n.sinh().atan().to_degrees()
}

fn lon_to_tile_x(lon: f64, zoom: i32) -> i32 {
    let tiles = 2f64.powi(zoom);
    (((lon + 180.0) / 360.0 * tiles).floor() as i32).clamp(0, tiles as i32 - 1)
}

fn lat_to_tile_y(lat: f64, zoom: i32) -> i32 {
    let tiles = 2f64.powi(zoom);
    let lat = lat.to_radians();
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * tiles;
    (y.floor() as i32).clamp(0, tiles as i32 - 1)
}

/// Inclusive tile index ranges `(x_range, y_range)` overlapping `bbox`.
fn tile_ranges(bbox: &BBox, zoom: i32) -> ((i32, i32), (i32, i32)) {
    (
        (lon_to_tile_x(bbox.min_x, zoom), lon_to_tile_x(bbox.max_x, zoom)),
        (lat_to_tile_y(bbox.max_y, zoom), lat_to_tile_y(bbox.min_y, zoom)),
    )
}

/// Number of tiles [`tiles_covering`] would return, without building them.
pub fn tile_count(bbox: &BBox, zoom: i32) -> u64 {
    let ((min_x, max_x), (min_y, max_y)) = tile_ranges(bbox, zoom);
    let columns = (i64::from(max_x) - i64::from(min_x) + 1).max(0) as u64;
    let rows = (i64::from(max_y) - i64::from(min_y) + 1).max(0) as u64;
    columns * rows
}

/// Tiles at `zoom` whose bounds overlap `bbox`, row by row from the north.
pub fn tiles_covering(bbox: &BBox, zoom: i32) -> Vec<(i32, i32)> {
    let ((min_x, max_x), (min_y, max_y)) = tile_ranges(bbox, zoom);
    let mut tiles = Vec::new();
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            tiles.push((x, y));
        }
    }
    tiles
}

/// The four children of tile `(x, y, zoom)` at `zoom + 1`.
pub fn child_tiles(x: i32, y: i32, zoom: i32) -> [(i32, i32, i32); 4] {
    let z = zoom + 1;
    [
        (2 * x, 2 * y, z),
        (2 * x + 1, 2 * y, z),
        (2 * x, 2 * y + 1, z),
        (2 * x + 1, 2 * y + 1, z),
    ]
}

// =============================================================================
// Intersection collaborator
// =============================================================================

/// Polygon intersection supplied by a geometry component.
pub trait GeometryOps: Send + Sync {
    /// Intersection of `subject` with `clip`, or `None` when empty.
    fn intersect(&self, subject: &Geometry, clip: &Geometry) -> Option<Geometry>;
}

/// Sutherland-Hodgman clipping that separates disconnected pieces.
///
/// Every part of `clip` must be convex; tile squares and bisection rectangles
/// always are. `subject` parts may be any simple polygons. Pieces smaller than
/// a tiny fraction of the clip part's area are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipGeometry;

impl GeometryOps for ClipGeometry {
    fn intersect(&self, subject: &Geometry, clip: &Geometry) -> Option<Geometry> {
        let mut pieces = Vec::new();
        for clip_part in clip.parts() {
            if clip_part.len() < 3 {
                continue;
            }
            let clip_ring = counter_clockwise(clip_part);
            let min_area = signed_area(&clip_ring) * EMPTY_AREA_RATIO;
            for subject_part in subject.parts() {
                pieces.extend(
                    clip_convex(&counter_clockwise(subject_part), &clip_ring)
                        .into_iter()
                        .filter(|ring| signed_area(ring) > min_area),
                );
            }
        }
        if pieces.is_empty() {
            None
        } else {
            Some(Geometry::from_rings(pieces))
        }
    }
}

/// Clip a counter-clockwise ring by each edge of a counter-clockwise convex ring.
fn clip_convex(subject: &[[f64; 2]], clip: &[[f64; 2]]) -> Vec<Ring> {
    let mut rings = vec![subject.to_vec()];
    for i in 0..clip.len() {
        let edge = (clip[i], clip[(i + 1) % clip.len()]);
        rings = rings
            .iter()
            .flat_map(|ring| clip_half_plane(ring, edge))
            .collect();
        if rings.is_empty() {
            break;
        }
    }
    rings
}

/// A clipped vertex and whether it lies on the clip line.
type Vertex = ([f64; 2], bool);

/// Keep the part of `ring` left of the directed line `edge`.
///
/// A concave ring can leave several pieces. Plain Sutherland-Hodgman joins them
/// with zero-width edges along the line; those are removed and the remaining
/// chains are reconnected into separate rings.
fn clip_half_plane(ring: &[[f64; 2]], edge: ([f64; 2], [f64; 2])) -> Vec<Ring> {
    let (a, b) = edge;
    let mut clipped: Vec<Vertex> = Vec::with_capacity(ring.len() + 4);
    for j in 0..ring.len() {
        let current = ring[j];
        let previous = ring[(j + ring.len() - 1) % ring.len()];
        let (side_current, side_previous) = (side(a, b, current), side(a, b, previous));
        match (side_current >= 0.0, side_previous >= 0.0) {
            (true, true) => clipped.push((current, side_current == 0.0)),
            (true, false) => {
                clipped.push((line_intersection(previous, current, a, b), true));
                clipped.push((current, side_current == 0.0));
            }
            (false, true) => clipped.push((line_intersection(previous, current, a, b), true)),
            (false, false) => {}
        }
    }

    dedup_vertices(&mut clipped);
    if clipped.len() < 3 {
        return Vec::new();
    }
    separate_pieces(&clipped, a, b)
}

/// Collapse repeated points, including across the ring's wrap-around.
fn dedup_vertices(vertices: &mut Vec<Vertex>) {
    vertices.dedup_by(|next, kept| {
        if next.0 == kept.0 {
            kept.1 |= next.1;
            true
        } else {
            false
        }
    });
    while vertices.len() > 1 && vertices[0].0 == vertices[vertices.len() - 1].0 {
        if let Some((_, on_line)) = vertices.pop() {
            vertices[0].1 |= on_line;
        }
    }
}

/// Rebuild the rings of a half-plane clip from the chains between on-line edges.
fn separate_pieces(vertices: &[Vertex], a: [f64; 2], b: [f64; 2]) -> Vec<Ring> {
    let n = vertices.len();
    let on_line_edge = |j: usize| vertices[j].1 && vertices[(j + 1) % n].1;
    if !(0..n).any(on_line_edge) {
        return vec![vertices.iter().map(|v| v.0).collect()];
    }

    // Each chain starts where the ring leaves the line and ends where it returns.
    let mut chains: Vec<Ring> = Vec::new();
    for start in 0..n {
        if on_line_edge(start) || !on_line_edge((start + n - 1) % n) {
            continue;
        }
        let mut chain = vec![vertices[start].0];
        let mut k = start;
        while !on_line_edge(k) {
            k = (k + 1) % n;
            chain.push(vertices[k].0);
        }
        chains.push(chain);
    }
    if chains.is_empty() {
        return Vec::new();
    }

    // Along the line, the kept region's boundary runs from a chain end to the
    // next chain start. Ends sort before starts at the same position.
    let direction = [b[0] - a[0], b[1] - a[1]];
    let position = |p: [f64; 2]| (p[0] - a[0]) * direction[0] + (p[1] - a[1]) * direction[1];
    let mut events: Vec<(f64, bool, usize)> = Vec::with_capacity(chains.len() * 2);
    for (index, chain) in chains.iter().enumerate() {
        let (Some(&first), Some(&last)) = (chain.first(), chain.last()) else {
            continue;
        };
        events.push((position(last), false, index));
        events.push((position(first), true, index));
    }
    events.sort_by(|x, y| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1)));

    let mut next_chain = vec![0; chains.len()];
    for pair in events.chunks(2) {
        match pair {
            [(_, false, end), (_, true, start)] => next_chain[*end] = *start,
            // Numerically inconsistent crossings; fall back to the joined ring.
            _ => return vec![vertices.iter().map(|v| v.0).collect()],
        }
    }

    let mut visited = vec![false; chains.len()];
    let mut rings = Vec::new();
    for first in 0..chains.len() {
        if visited[first] {
            continue;
        }
        let mut ring: Ring = Vec::new();
        let mut current = first;
        while !visited[current] {
            visited[current] = true;
            ring.extend_from_slice(&chains[current]);
            current = next_chain[current];
        }
        ring.dedup();
        while ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() >= 3 {
            rings.push(ring);
        }
    }
    rings
}

/// Cross product sign: positive when `p` is left of `a -> b`.
fn side(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

fn line_intersection(p1: [f64; 2], p2: [f64; 2], a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    let d1 = side(a, b, p1);
    let d2 = side(a, b, p2);
    let t = d1 / (d1 - d2);
    [p1[0] + t * (p2[0] - p1[0]), p1[1] + t * (p2[1] - p1[1])]
}
