//! Node priority metrics.
//!
//! A metric turns a node's bounds (and nominal spacing) into a score for one
//! view. Larger scores are more important: they are expanded first, loaded
//! first and compared against the minimum pixel size to decide refinement.

use std::fmt;

use crate::bounds::Aabb;
use crate::camera::{Projection, View};

/// Scores a node for one view.
pub trait PriorityMetric: fmt::Debug + Send + Sync {
    /// Score of a node with the given bounds and spacing as seen from `view`.
    fn score(&self, view: &View, bounds: &Aabb, spacing: f64) -> f64;
}

/// Pixels covered by one world unit.
#[derive(Debug, Clone, Copy)]
enum PixelScale {
    /// At distance 1 from the camera.
    Perspective(f64),
    /// Everywhere.
    Orthographic(f64),
}

fn pixel_scale(view: &View) -> PixelScale {
    match view.projection {
        Projection::Perspective { fov_y, .. } => {
            // pixels_per_unit = screen_height / (2 * tan(fov_y / 2))
            PixelScale::Perspective(view.viewport_height / (2.0 * (fov_y / 2.0).tan()))
        }
        Projection::Orthographic { height, .. } => {
            PixelScale::Orthographic(view.viewport_height / height)
        }
    }
}

/// Approximate on-screen radius of the node's bounding sphere, in pixels.
///
/// Nodes that contain the camera score `f64::MAX`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectedSize;

impl PriorityMetric for ProjectedSize {
    fn score(&self, view: &View, bounds: &Aabb, _spacing: f64) -> f64 {
        let radius = bounds.radius();
        match pixel_scale(view) {
            PixelScale::Perspective(pixels) => {
                let distance = view.position.distance(bounds.center());
                if distance < radius {
                    return f64::MAX;
                }
                pixels * radius / distance
            }
            PixelScale::Orthographic(pixels) => pixels * radius,
        }
    }
}

/// Projected point spacing in pixels, i.e. the screen-space error of
/// drawing this node instead of its children.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenSpaceError;

impl PriorityMetric for ScreenSpaceError {
    fn score(&self, view: &View, bounds: &Aabb, spacing: f64) -> f64 {
        match pixel_scale(view) {
            PixelScale::Perspective(pixels) => {
                // Measure to the box surface so nodes around the camera refine.
                let nearest = view.position.clamp(bounds.min, bounds.max);
                let distance = view.position.distance(nearest);
                if distance <= 0.0 {
                    return f64::MAX;
                }
                spacing * pixels / distance
            }
            PixelScale::Orthographic(pixels) => spacing * pixels,
        }
    }
}
