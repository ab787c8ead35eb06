use serde::{Deserialize, Serialize};

use crate::transform::DEFAULT_ZOOM_STEP;

/// Interaction constants. Every field may be omitted from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub zoom_step: f64,
    pub click_threshold: f64,
    pub handle_radius: f64,
    pub selected_handle_radius: f64,
    pub edge_hit_tolerance: f64,
    pub tile_cache_capacity: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            zoom_step: DEFAULT_ZOOM_STEP,
            click_threshold: 2.0,
            handle_radius: 6.0,
            selected_handle_radius: 8.0,
            edge_hit_tolerance: 4.0,
            tile_cache_capacity: 256,
        }
    }
}

impl ViewerConfig {
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !(self.zoom_step.is_finite() && self.zoom_step > 1.0) {
            self.zoom_step = defaults.zoom_step;
        }
        for (value, fallback) in [
            (&mut self.click_threshold, defaults.click_threshold),
            (&mut self.handle_radius, defaults.handle_radius),
            (&mut self.selected_handle_radius, defaults.selected_handle_radius),
            (&mut self.edge_hit_tolerance, defaults.edge_hit_tolerance),
        ] {
            if !(value.is_finite() && *value >= 0.0) {
                *value = fallback;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<ViewerConfig, toml::de::Error> {
        toml::from_str::<ViewerConfig>(raw).map(ViewerConfig::sanitized)
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = parse("zoom_step = 1.1\n").unwrap();
        assert_eq!(config.zoom_step, 1.1);
        assert_eq!(config.click_threshold, 2.0);
        assert_eq!(config.tile_cache_capacity, 256);
    }

    #[test]
    fn unusable_values_are_replaced() {
        let config = parse("zoom_step = 0.5\nhandle_radius = -3.0\n").unwrap();
        assert_eq!(config.zoom_step, DEFAULT_ZOOM_STEP);
        assert_eq!(config.handle_radius, 6.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(parse("zoom_step = \"fast\"").is_err());
    }
}
