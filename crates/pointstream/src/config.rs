//! Streaming configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetOptions;
use crate::error::ConfigError;
use crate::hierarchy::TreeShape;

/// Default global point budget.
pub const DEFAULT_POINT_BUDGET: u64 = 1_000_000;

/// Default number of simultaneous tile loads.
pub const DEFAULT_MAX_CONCURRENT_LOADS: usize = 4;

/// Default number of simultaneous hierarchy fetches.
pub const DEFAULT_MAX_CONCURRENT_HIERARCHY_LOADS: usize = 2;

/// Default minimum projected node size, in pixels, for refinement.
pub const DEFAULT_MIN_NODE_PIXEL_SIZE: f64 = 1.0;

/// Settings shared by every dataset of a [`StreamingContext`].
///
/// [`StreamingContext`]: crate::StreamingContext
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Upper bound on resident and visible points across all datasets.
    pub point_budget: u64,
    /// Maximum tile loads in flight at once.
    pub max_concurrent_loads: usize,
    /// Maximum hierarchy fetches in flight at once.
    pub max_concurrent_hierarchy_loads: usize,
    /// Nodes that project smaller than this are not refined.
    pub min_node_pixel_size: f64,
    /// Per tree-shape overrides.
    pub shape_overrides: HashMap<TreeShape, ShapeOverrides>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            point_budget: DEFAULT_POINT_BUDGET,
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            max_concurrent_hierarchy_loads: DEFAULT_MAX_CONCURRENT_HIERARCHY_LOADS,
            min_node_pixel_size: DEFAULT_MIN_NODE_PIXEL_SIZE,
            shape_overrides: HashMap::new(),
        }
    }
}

/// Settings that replace the global ones for one tree shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeOverrides {
    /// Minimum projected node size for refinement.
    pub min_node_pixel_size: Option<f64>,
    /// Deepest level that may be traversed.
    pub max_level: Option<u32>,
}

/// Limits in effect for one dataset after applying overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedLimits {
    /// Minimum projected node size for refinement.
    pub min_node_pixel_size: f64,
    /// Deepest level that may be traversed.
    pub max_level: u32,
}

impl StreamingConfig {
    /// Set the point budget.
    #[must_use]
    pub fn with_point_budget(mut self, point_budget: u64) -> Self {
        self.point_budget = point_budget;
        self
    }

    /// Set the maximum number of loads in flight.
    #[must_use]
    pub fn with_max_concurrent_loads(mut self, max: usize) -> Self {
        self.max_concurrent_loads = max;
        self
    }

    /// Set the minimum projected node size.
    #[must_use]
    pub fn with_min_node_pixel_size(mut self, pixels: f64) -> Self {
        self.min_node_pixel_size = pixels;
        self
    }

    /// Add overrides for one tree shape.
    #[must_use]
    pub fn with_shape_overrides(mut self, shape: TreeShape, overrides: ShapeOverrides) -> Self {
        self.shape_overrides.insert(shape, overrides);
        self
    }

    /// Check the configuration.
    ///
    /// A zero point budget is valid: nothing is loaded and everything
    /// resident is evicted.
    ///
    /// # Errors
    ///
    /// Returns an error for zero concurrency limits or a negative or
    /// non-finite pixel threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_loads == 0 {
            return Err(ConfigError::ZeroConcurrentLoads);
        }
        if self.max_concurrent_hierarchy_loads == 0 {
            return Err(ConfigError::ZeroConcurrentHierarchyLoads);
        }
        validate_pixel_size(self.min_node_pixel_size)?;
        for overrides in self.shape_overrides.values() {
            if let Some(pixels) = overrides.min_node_pixel_size {
                validate_pixel_size(pixels)?;
            }
        }
        Ok(())
    }

    /// Limits for a dataset: its own options win over shape overrides,
    /// which win over the global settings.
    #[must_use]
    pub fn resolve(&self, shape: TreeShape, options: &DatasetOptions) -> ResolvedLimits {
        let overrides = self.shape_overrides.get(&shape).copied().unwrap_or_default();
        ResolvedLimits {
            min_node_pixel_size: options
                .min_node_pixel_size
                .or(overrides.min_node_pixel_size)
                .unwrap_or(self.min_node_pixel_size),
            max_level: options
                .max_level
                .or(overrides.max_level)
                .unwrap_or(u32::MAX),
        }
    }
}

pub(crate) fn validate_pixel_size(pixels: f64) -> Result<(), ConfigError> {
    if pixels.is_finite() && pixels >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidPixelThreshold(pixels))
    }
}
