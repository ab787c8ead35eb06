use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type WorkspaceId = u64;
pub type PolygonId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    pub fn distance_to(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Point { x, y }
    }
}

impl From<Point> for [f64; 2] {
    fn from(point: Point) -> Self {
        [point.x, point.y]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.right() >= other.x
            && self.x <= other.right()
            && self.bottom() >= other.y
            && self.y <= other.bottom()
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x && point.x <= self.right() && point.y >= self.y && point.y <= self.bottom()
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSummary {
    pub id: WorkspaceId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub id: PolygonId,
    #[serde(default)]
    pub polygon_id: u64,
    pub page_number: usize,
    #[serde(rename = "vertices", with = "ring_wire", default)]
    pub ring: Vec<Point>,
}

pub const MIN_RING_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolygonUpdate {
    #[serde(skip)]
    pub polygon: PolygonId,
    #[serde(with = "ring_wire")]
    pub vertices: Vec<Point>,
}

/// Polygons are exchanged as a list of rings; only the outer ring is edited.
mod ring_wire {
    use super::*;

    pub fn serialize<S: Serializer>(ring: &[Point], serializer: S) -> Result<S::Ok, S::Error> {
        [ring].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Point>, D::Error> {
        let rings: Option<Vec<Vec<Point>>> = Option::deserialize(deserializer)?;
        Ok(rings
            .and_then(|rings| rings.into_iter().next())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolygonCollection {
    polygons: Vec<Polygon>,
    slots: HashMap<PolygonId, usize>,
}

impl PolygonCollection {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        let slots = polygons
            .iter()
            .enumerate()
            .map(|(slot, polygon)| (polygon.id, slot))
            .collect();
        Self { polygons, slots }
    }

    pub fn get(&self, id: PolygonId) -> Option<&Polygon> {
        self.slots.get(&id).map(|&slot| &self.polygons[slot])
    }

    pub fn ring(&self, id: PolygonId) -> Option<&[Point]> {
        self.get(id).map(|polygon| polygon.ring.as_slice())
    }

    pub(crate) fn ring_mut(&mut self, id: PolygonId) -> Option<&mut Vec<Point>> {
        let slot = *self.slots.get(&id)?;
        Some(&mut self.polygons[slot].ring)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Polygon> {
        self.polygons.iter()
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }
}
