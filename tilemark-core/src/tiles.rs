use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::layout::PageLayout;
use crate::model::{Page, Rect, WorkspaceId};
use crate::transform::ZoomLevel;

pub const TILE_SIZE: f64 = 256.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub workspace: WorkspaceId,
    pub page_index: usize,
    pub level: ZoomLevel,
    pub col: u32,
    pub row: u32,
}

impl TileKey {
    pub fn media_path(&self) -> String {
        format!(
            "media/tiles/workspace_{}/page_{}/{}/{}/{}.jpg",
            self.workspace,
            self.page_index + 1,
            self.level,
            self.col,
            self.row
        )
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}-{}-{}-{}",
            self.workspace, self.page_index, self.level, self.col, self.row
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleTile {
    pub key: TileKey,
    pub rect: Rect,
}

pub fn is_visible(tile: &Rect, viewport: &Rect) -> bool {
    tile.intersects(viewport)
}

pub fn scaled_page_size(page: &Page, level: ZoomLevel) -> (f64, f64) {
    let factor = level.factor();
    ((page.width * factor).floor(), (page.height * factor).floor())
}

pub fn visible_tiles(
    workspace: WorkspaceId,
    pages: &[Page],
    layout: &PageLayout,
    viewport: &Rect,
) -> Vec<VisibleTile> {
    let level = layout.level();
    let mut tiles = Vec::new();

    for (page_index, page) in pages.iter().enumerate() {
        let (width, height) = scaled_page_size(page, level);
        if width <= 0.0 || height <= 0.0 {
            continue;
        }
        let top = layout.page_offset(page_index + 1);
        if !Rect::new(0.0, top, width, height).intersects(viewport) {
            continue;
        }

        let cols = (width / TILE_SIZE).ceil() as u32;
        let rows = (height / TILE_SIZE).ceil() as u32;
        let (first_col, last_col) = candidate_span(viewport.x, viewport.right(), cols);
        let (first_row, last_row) = candidate_span(viewport.y - top, viewport.bottom() - top, rows);

        for row in first_row..=last_row {
            for col in first_col..=last_col {
                let x = f64::from(col) * TILE_SIZE;
                let y = f64::from(row) * TILE_SIZE;
                let rect = Rect::new(
                    x,
                    top + y,
                    TILE_SIZE.min(width - x),
                    TILE_SIZE.min(height - y),
                );
                if is_visible(&rect, viewport) {
                    tiles.push(VisibleTile {
                        key: TileKey {
                            workspace,
                            page_index,
                            level,
                            col,
                            row,
                        },
                        rect,
                    });
                }
            }
        }
    }

    tiles
}

fn candidate_span(start: f64, end: f64, count: u32) -> (u32, u32) {
    let last = count.saturating_sub(1);
    let first = ((start / TILE_SIZE).floor() - 1.0).clamp(0.0, f64::from(last)) as u32;
    let end_cell = (end / TILE_SIZE).floor().clamp(0.0, f64::from(last)) as u32;
    (first, end_cell.max(first))
}

#[derive(Debug)]
enum TileSlot<T> {
    Pending,
    Loaded(T),
    /// Resolved with nothing to draw: an absent edge tile or a failed load.
    Empty,
}

/// Tracks which tiles are wanted, in flight and loaded.
///
/// A completion is only applied while its key is still wanted; anything that
/// arrives after the viewport moved on is dropped.
#[derive(Debug)]
pub struct TileStore<T> {
    slots: HashMap<TileKey, TileSlot<T>>,
    wanted: HashSet<TileKey>,
    capacity: usize,
}

impl<T> TileStore<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            wanted: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn sync(&mut self, visible: &[VisibleTile]) -> Vec<TileKey> {
        self.wanted = visible.iter().map(|tile| tile.key).collect();

        let superseded: Vec<TileKey> = self
            .slots
            .iter()
            .filter(|(key, slot)| matches!(slot, TileSlot::Pending) && !self.wanted.contains(*key))
            .map(|(key, _)| *key)
            .collect();
        for key in superseded {
            self.slots.remove(&key);
        }
        self.slots
            .retain(|key, slot| !matches!(slot, TileSlot::Empty) || self.wanted.contains(key));

        let mut requests = Vec::new();
        for tile in visible {
            if !self.slots.contains_key(&tile.key) {
                self.slots.insert(tile.key, TileSlot::Pending);
                requests.push(tile.key);
            }
        }

        self.evict();
        requests
    }

    pub fn complete<E: fmt::Display>(&mut self, key: TileKey, result: Result<Option<T>, E>) -> bool {
        if !self.wanted.contains(&key) || !matches!(self.slots.get(&key), Some(TileSlot::Pending)) {
            debug!(tile = %key, "dropping superseded tile load");
            return false;
        }
        let slot = match result {
            Ok(Some(image)) => TileSlot::Loaded(image),
            Ok(None) => TileSlot::Empty,
            Err(err) => {
                debug!(tile = %key, %err, "tile load failed");
                TileSlot::Empty
            }
        };
        self.slots.insert(key, slot);
        true
    }

    pub fn get(&self, key: &TileKey) -> Option<&T> {
        match self.slots.get(key) {
            Some(TileSlot::Loaded(image)) => Some(image),
            _ => None,
        }
    }

    pub fn is_pending(&self, key: &TileKey) -> bool {
        matches!(self.slots.get(key), Some(TileSlot::Pending))
    }

    pub fn loaded_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, TileSlot::Loaded(_)))
            .count()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.wanted.clear();
    }

    fn evict(&mut self) {
        let loaded = self.loaded_count();
        if loaded <= self.capacity {
            return;
        }
        let mut excess = loaded - self.capacity;
        let stale: Vec<TileKey> = self
            .slots
            .iter()
            .filter(|(key, slot)| matches!(slot, TileSlot::Loaded(_)) && !self.wanted.contains(*key))
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if excess == 0 {
                break;
            }
            self.slots.remove(&key);
            excess -= 1;
        }
    }
}
