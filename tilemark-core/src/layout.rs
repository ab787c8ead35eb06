use crate::model::{Page, Point};
use crate::transform::ZoomLevel;

pub fn compute_offsets(pages: &[Page], level: ZoomLevel) -> Vec<f64> {
    let factor = level.factor();
    let mut offsets = Vec::with_capacity(pages.len());
    let mut top = 0.0;
    for page in pages {
        offsets.push(top);
        top += page.height * factor;
    }
    offsets
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageLayout {
    level: ZoomLevel,
    offsets: Vec<f64>,
    total_height: f64,
}

impl PageLayout {
    pub fn new(pages: &[Page], level: ZoomLevel) -> Self {
        let offsets = compute_offsets(pages, level);
        let total_height = pages
            .last()
            .zip(offsets.last())
            .map(|(page, top)| top + page.height * level.factor())
            .unwrap_or(0.0);
        Self {
            level,
            offsets,
            total_height,
        }
    }

    pub fn level(&self) -> ZoomLevel {
        self.level
    }

    pub fn zoom_factor(&self) -> f64 {
        self.level.factor()
    }

    pub fn total_height(&self) -> f64 {
        self.total_height
    }

    pub fn page_offset(&self, page_number: usize) -> f64 {
        page_number
            .checked_sub(1)
            .and_then(|index| self.offsets.get(index))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn to_level(&self, page_number: usize, vertex: Point) -> Point {
        let factor = self.zoom_factor();
        Point::new(
            vertex.x * factor,
            vertex.y * factor + self.page_offset(page_number),
        )
    }

    pub fn to_page(&self, page_number: usize, level: Point) -> Point {
        let factor = self.zoom_factor();
        Point::new(
            level.x / factor,
            (level.y - self.page_offset(page_number)) / factor,
        )
    }

    /// 1-based page whose vertical span contains `y`, clamped to the first and last page.
    pub fn page_at(&self, y: f64) -> Option<usize> {
        if self.offsets.is_empty() {
            return None;
        }
        let after = self.offsets.partition_point(|&top| top <= y);
        Some(after.max(1))
    }
}
