use std::collections::HashMap;
use std::ops::Range;

use crate::layout::PageLayout;
use crate::model::{Point, Polygon, PolygonCollection, PolygonId, Rect};

const NODE_CAPACITY: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    const EMPTY: Bounds = Bounds {
        min_x: f64::INFINITY,
        min_y: f64::INFINITY,
        max_x: f64::NEG_INFINITY,
        max_y: f64::NEG_INFINITY,
    };

    pub fn of_points(points: &[Point]) -> Option<Bounds> {
        if points.is_empty() {
            return None;
        }
        Some(points.iter().fold(Bounds::EMPTY, |bounds, point| Bounds {
            min_x: bounds.min_x.min(point.x),
            min_y: bounds.min_y.min(point.y),
            max_x: bounds.max_x.max(point.x),
            max_y: bounds.max_y.max(point.y),
        }))
    }

    pub fn of_rect(rect: &Rect) -> Bounds {
        Bounds {
            min_x: rect.x,
            min_y: rect.y,
            max_x: rect.right(),
            max_y: rect.bottom(),
        }
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.max_x >= other.min_x
            && self.min_x <= other.max_x
            && self.max_y >= other.min_y
            && self.min_y <= other.max_y
    }

    fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedPolygon {
    pub id: PolygonId,
    pub polygon_id: u64,
    pub page_number: usize,
    pub bounds: Bounds,
    pub scaled: Vec<Point>,
}

impl IndexedPolygon {
    fn from_polygon(polygon: &Polygon, layout: &PageLayout) -> Option<Self> {
        let scaled: Vec<Point> = polygon
            .ring
            .iter()
            .map(|&vertex| layout.to_level(polygon.page_number, vertex))
            .collect();
        let bounds = Bounds::of_points(&scaled)?;
        Some(Self {
            id: polygon.id,
            polygon_id: polygon.polygon_id,
            page_number: polygon.page_number,
            bounds,
            scaled,
        })
    }

    pub fn contains(&self, point: Point) -> bool {
        let ring = &self.scaled;
        if ring.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = ring.len() - 1;
        for i in 0..ring.len() {
            let (a, b) = (ring[i], ring[j]);
            if (a.y > point.y) != (b.y > point.y)
                && point.x < (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    pub fn distance_to_outline(&self, point: Point) -> f64 {
        let ring = &self.scaled;
        match ring.len() {
            0 => f64::INFINITY,
            1 => ring[0].distance_to(point),
            len => (0..len)
                .map(|i| segment_distance(point, ring[i], ring[(i + 1) % len]))
                .fold(f64::INFINITY, f64::min),
        }
    }
}

fn segment_distance(point: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let length_sq = dx * dx + dy * dy;
    if length_sq == 0.0 {
        return point.distance_to(a);
    }
    let t = (((point.x - a.x) * dx + (point.y - a.y) * dy) / length_sq).clamp(0.0, 1.0);
    point.distance_to(Point::new(a.x + t * dx, a.y + t * dy))
}

#[derive(Debug, Clone)]
struct Node {
    bounds: Bounds,
    /// Indices into `entries` for leaves, into `nodes` otherwise.
    children: Range<usize>,
    leaf: bool,
}

/// Static R-tree over polygon bounding boxes.
#[derive(Debug, Clone, Default)]
pub struct PolygonIndex {
    entries: Vec<IndexedPolygon>,
    slots: HashMap<PolygonId, usize>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl PolygonIndex {
    pub fn build(polygons: &PolygonCollection, layout: &PageLayout) -> Self {
        let entries = polygons
            .iter()
            .filter_map(|polygon| IndexedPolygon::from_polygon(polygon, layout))
            .collect();
        Self::load(entries)
    }

    fn load(mut entries: Vec<IndexedPolygon>) -> Self {
        if entries.is_empty() {
            return Self::default();
        }

        sort_tile_recursive(&mut entries, |entry| entry.bounds);
        let mut level: Vec<Node> = chunk_ranges(entries.len())
            .map(|range| Node {
                bounds: enclose(entries[range.clone()].iter().map(|entry| entry.bounds)),
                children: range,
                leaf: true,
            })
            .collect();

        let mut nodes = Vec::new();
        while level.len() > 1 {
            sort_tile_recursive(&mut level, |node| node.bounds);
            let base = nodes.len();
            let parents = chunk_ranges(level.len())
                .map(|range| Node {
                    bounds: enclose(level[range.clone()].iter().map(|node| node.bounds)),
                    children: base + range.start..base + range.end,
                    leaf: false,
                })
                .collect();
            nodes.append(&mut level);
            level = parents;
        }
        nodes.append(&mut level);
        let root = nodes.len() - 1;
        let slots = entries
            .iter()
            .enumerate()
            .map(|(slot, entry)| (entry.id, slot))
            .collect();

        Self {
            entries,
            slots,
            nodes,
            root: Some(root),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: PolygonId) -> Option<&IndexedPolygon> {
        self.slots.get(&id).map(|&slot| &self.entries[slot])
    }

    pub fn search(&self, rect: &Rect) -> Vec<&IndexedPolygon> {
        self.search_bounds(&Bounds::of_rect(rect))
    }

    pub fn search_bounds(&self, query: &Bounds) -> Vec<&IndexedPolygon> {
        let mut found = Vec::new();
        let Some(root) = self.root else {
            return found;
        };
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !node.bounds.intersects(query) {
                continue;
            }
            if node.leaf {
                found.extend(
                    self.entries[node.children.clone()]
                        .iter()
                        .filter(|entry| entry.bounds.intersects(query)),
                );
            } else {
                stack.extend(node.children.clone());
            }
        }
        found
    }

    pub fn partition(&self, viewport: &Rect, selected: Option<PolygonId>) -> VisiblePolygons<'_> {
        let mut visible = VisiblePolygons::default();
        for entry in self.search(viewport) {
            if Some(entry.id) == selected {
                visible.selected = Some(entry);
            } else {
                visible.others.push(entry);
            }
        }
        visible
    }
}

#[derive(Debug, Default)]
pub struct VisiblePolygons<'a> {
    pub selected: Option<&'a IndexedPolygon>,
    pub others: Vec<&'a IndexedPolygon>,
}

fn enclose(bounds: impl Iterator<Item = Bounds>) -> Bounds {
    bounds.fold(Bounds::EMPTY, |acc, b| acc.union(&b))
}

fn chunk_ranges(len: usize) -> impl Iterator<Item = Range<usize>> {
    (0..len)
        .step_by(NODE_CAPACITY)
        .map(move |start| start..(start + NODE_CAPACITY).min(len))
}

fn sort_tile_recursive<T>(items: &mut [T], bounds: impl Fn(&T) -> Bounds) {
    let groups = items.len().div_ceil(NODE_CAPACITY);
    let slices = (groups as f64).sqrt().ceil().max(1.0) as usize;
    let slice_len = slices * NODE_CAPACITY;

    items.sort_by(|a, b| bounds(a).center().x.total_cmp(&bounds(b).center().x));
    for slice in items.chunks_mut(slice_len) {
        slice.sort_by(|a, b| bounds(a).center().y.total_cmp(&bounds(b).center().y));
    }
}
