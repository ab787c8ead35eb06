use serde::{Deserialize, Serialize};

use crate::model::{Point, Rect};

pub const MIN_ZOOM_LEVEL: u8 = 0;
pub const MAX_ZOOM_LEVEL: u8 = 6;
pub const DEFAULT_ZOOM_STEP: f64 = 1.05;

/// Index into the tile pyramid. 0 is the coarsest level, 6 is native resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoomLevel(u8);

impl ZoomLevel {
    pub const MIN: ZoomLevel = ZoomLevel(MIN_ZOOM_LEVEL);
    pub const MAX: ZoomLevel = ZoomLevel(MAX_ZOOM_LEVEL);

    pub fn new(level: u8) -> Self {
        ZoomLevel(level.min(MAX_ZOOM_LEVEL))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn factor(self) -> f64 {
        2f64.powi(i32::from(self.0) - i32::from(MAX_ZOOM_LEVEL))
    }
}

impl std::fmt::Display for ZoomLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snaps a continuous scale to a pyramid level: `clamp(6 - floor(log2(1/scale)), 0, 6)`.
pub fn discretize(scale: f64) -> ZoomLevel {
    if scale.is_nan() || scale <= 0.0 {
        return ZoomLevel::MIN;
    }
    let level = f64::from(MAX_ZOOM_LEVEL) - (1.0 / scale).log2().floor();
    let level = level.clamp(f64::from(MIN_ZOOM_LEVEL), f64::from(MAX_ZOOM_LEVEL));
    ZoomLevel(level as u8)
}

pub fn visual_scale(scale: f64, level: ZoomLevel) -> f64 {
    scale / level.factor()
}

pub fn viewport_rect(scale: f64, position: Point, stage: StageSize) -> Rect {
    let visual = visual_scale(scale, discretize(scale));
    Rect {
        x: -position.x / visual,
        y: -position.y / visual,
        width: stage.width / visual,
        height: stage.height / visual,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageSize {
    pub width: f64,
    pub height: f64,
}

impl StageSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub scale: f64,
    pub position: Point,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            position: Point::ORIGIN,
        }
    }
}

impl Transform {
    pub fn zoom_level(&self) -> ZoomLevel {
        discretize(self.scale)
    }

    pub fn zoom_factor(&self) -> f64 {
        self.zoom_level().factor()
    }

    pub fn visual_scale(&self) -> f64 {
        visual_scale(self.scale, self.zoom_level())
    }

    pub fn viewport(&self, stage: StageSize) -> Rect {
        viewport_rect(self.scale, self.position, stage)
    }

    pub fn zoom_at(&mut self, pointer: Point, wheel_delta: f64, step: f64) {
        let new_scale = if wheel_delta > 0.0 {
            self.scale / step
        } else if wheel_delta < 0.0 {
            self.scale * step
        } else {
            return;
        };
        self.rescale_around(pointer, new_scale);
    }

    pub fn rescale_around(&mut self, anchor: Point, new_scale: f64) {
        if !new_scale.is_finite() || new_scale <= 0.0 {
            return;
        }
        let content = self.screen_to_native(anchor);
        self.position = Point::new(
            anchor.x - content.x * new_scale,
            anchor.y - content.y * new_scale,
        );
        self.scale = new_scale;
    }

    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        self.position.x += dx;
        self.position.y += dy;
    }

    pub fn screen_to_native(&self, screen: Point) -> Point {
        Point::new(
            (screen.x - self.position.x) / self.scale,
            (screen.y - self.position.y) / self.scale,
        )
    }

    pub fn screen_to_level(&self, screen: Point) -> Point {
        let visual = self.visual_scale();
        Point::new(
            (screen.x - self.position.x) / visual,
            (screen.y - self.position.y) / visual,
        )
    }

    pub fn level_to_screen(&self, level: Point) -> Point {
        let visual = self.visual_scale();
        Point::new(
            level.x * visual + self.position.x,
            level.y * visual + self.position.y,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn discretize_snaps_to_pyramid_levels() {
        assert_eq!(discretize(1.0), ZoomLevel::new(6));
        assert_eq!(discretize(4.0), ZoomLevel::new(6));
        assert_eq!(discretize(0.75), ZoomLevel::new(6));
        assert_eq!(discretize(0.5), ZoomLevel::new(5));
        assert_eq!(discretize(0.3), ZoomLevel::new(5));
        assert_eq!(discretize(0.25), ZoomLevel::new(4));
        assert_eq!(discretize(1.0 / 64.0), ZoomLevel::new(0));
        assert_eq!(discretize(1e-9), ZoomLevel::new(0));
        assert_eq!(discretize(0.0), ZoomLevel::MIN);
    }

    #[test]
    fn visual_scale_compensates_for_snapping() {
        let transform = Transform {
            scale: 0.4,
            position: Point::ORIGIN,
        };
        assert_eq!(transform.zoom_level(), ZoomLevel::new(5));
        assert!(close(transform.zoom_factor(), 0.5));
        assert!(close(transform.visual_scale(), 0.8));
    }

    #[test]
    fn viewport_is_expressed_in_level_coordinates() {
        let transform = Transform {
            scale: 0.5,
            position: Point::new(-100.0, -40.0),
        };
        let viewport = transform.viewport(StageSize::new(800.0, 600.0));
        assert!(close(viewport.x, 100.0));
        assert!(close(viewport.y, 40.0));
        assert!(close(viewport.width, 800.0));
        assert!(close(viewport.height, 600.0));
    }

    #[test]
    fn wheel_direction_matches_scroll_up_zooms_in() {
        let mut transform = Transform::default();
        transform.zoom_at(Point::new(10.0, 10.0), -1.0, DEFAULT_ZOOM_STEP);
        assert!(close(transform.scale, 1.05));
        transform.zoom_at(Point::new(10.0, 10.0), 1.0, DEFAULT_ZOOM_STEP);
        assert!(close(transform.scale, 1.0));
        transform.zoom_at(Point::new(10.0, 10.0), 0.0, DEFAULT_ZOOM_STEP);
        assert!(close(transform.scale, 1.0));
    }

    proptest! {
        #[test]
        fn zoom_keeps_pointer_anchored(
            scale in 0.001f64..50.0,
            px in -5_000.0f64..5_000.0,
            py in -5_000.0f64..5_000.0,
            pointer_x in 0.0f64..2_000.0,
            pointer_y in 0.0f64..2_000.0,
            delta in prop_oneof![Just(-1.0f64), Just(1.0f64)],
        ) {
            let mut transform = Transform { scale, position: Point::new(px, py) };
            let pointer = Point::new(pointer_x, pointer_y);
            let before = transform.screen_to_native(pointer);
            transform.zoom_at(pointer, delta, DEFAULT_ZOOM_STEP);
            let after = transform.screen_to_native(pointer);
            prop_assert!((before.x - after.x).abs() <= 1e-6 * before.x.abs().max(1.0));
            prop_assert!((before.y - after.y).abs() <= 1e-6 * before.y.abs().max(1.0));
        }

        #[test]
        fn zoom_level_is_monotonic_and_bounded(a in 1e-6f64..100.0, b in 1e-6f64..100.0) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let low_level = discretize(low);
            let high_level = discretize(high);
            prop_assert!(low_level <= high_level);
            prop_assert!(high_level.value() <= MAX_ZOOM_LEVEL);
        }
    }
}
