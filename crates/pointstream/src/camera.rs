//! Views, projections and frustum culling.

use glam::{DMat4, DVec3};

use crate::bounds::Aabb;
use crate::error::{Error, Result};

/// Camera projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Perspective projection.
    Perspective {
        /// Vertical field of view in radians.
        fov_y: f64,
        /// Width over height.
        aspect: f64,
        /// Near plane distance.
        near: f64,
        /// Far plane distance.
        far: f64,
    },
    /// Orthographic projection.
    Orthographic {
        /// Visible world height.
        height: f64,
        /// Width over height.
        aspect: f64,
        /// Near plane distance.
        near: f64,
        /// Far plane distance.
        far: f64,
    },
}

impl Projection {
    /// Right-handed projection matrix with a `[0, 1]` depth range.
    #[must_use]
    pub fn matrix(&self) -> DMat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => DMat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                height,
                aspect,
                near,
                far,
            } => {
                let half_h = height * 0.5;
                let half_w = half_h * aspect;
                DMat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far)
            }
        }
    }

    fn is_finite(&self) -> bool {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => [fov_y, aspect, near, far].iter().all(|v| v.is_finite()),
            Projection::Orthographic {
                height,
                aspect,
                near,
                far,
            } => [height, aspect, near, far].iter().all(|v| v.is_finite()),
        }
    }
}

/// One active viewpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct View {
    /// Camera position in world space.
    pub position: DVec3,
    /// World-to-camera transform.
    pub view_matrix: DMat4,
    /// Projection.
    pub projection: Projection,
    /// Viewport height in physical pixels.
    pub viewport_height: f64,
}

impl View {
    /// Create a perspective view looking from `position` towards `target`.
    #[must_use]
    pub fn look_at(
        position: DVec3,
        target: DVec3,
        up: DVec3,
        fov_y: f64,
        viewport: (f64, f64),
    ) -> Self {
        let (width, height) = viewport;
        Self {
            position,
            view_matrix: DMat4::look_at_rh(position, target, up),
            projection: Projection::Perspective {
                fov_y,
                aspect: width / height,
                near: 0.1,
                far: 100_000.0,
            },
            viewport_height: height,
        }
    }

    /// Check that every part of the view is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCamera`] if any matrix element, the position,
    /// or the viewport is NaN or infinite, or the viewport is empty.
    pub fn validate(&self) -> Result<()> {
        if !self.position.is_finite() {
            return Err(Error::InvalidCamera {
                detail: format!("position {} is not finite", self.position),
            });
        }
        if !self.view_matrix.is_finite() {
            return Err(Error::InvalidCamera {
                detail: "view matrix is not finite".to_string(),
            });
        }
        if !self.projection.is_finite() || !self.projection.matrix().is_finite() {
            return Err(Error::InvalidCamera {
                detail: "projection is not finite".to_string(),
            });
        }
        if !self.viewport_height.is_finite() || self.viewport_height <= 0.0 {
            return Err(Error::InvalidCamera {
                detail: format!("viewport height {} is not positive", self.viewport_height),
            });
        }
        Ok(())
    }

    /// Frustum of this view in world space.
    #[must_use]
    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(self.projection.matrix() * self.view_matrix)
    }
}

/// A frustum for culling nodes by their bounding boxes.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    /// Six planes as (inward normal, distance).
    planes: [(DVec3, f64); 6],
}

impl Frustum {
    /// Create a frustum from a view-projection matrix.
    #[must_use]
    pub fn from_matrix(vp: DMat4) -> Self {
        let m = vp.to_cols_array_2d();
        let row = |r: usize| [m[0][r], m[1][r], m[2][r], m[3][r]];
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        let add = |a: [f64; 4], b: [f64; 4]| {
            Self::normalize_plane(a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3])
        };
        let sub = |a: [f64; 4], b: [f64; 4]| {
            Self::normalize_plane(a[0] - b[0], a[1] - b[1], a[2] - b[2], a[3] - b[3])
        };

        // Left, right, bottom, top, near, far. Depth runs 0..1, so the near
        // plane is the third row alone.
        let planes = [
            add(r3, r0),
            sub(r3, r0),
            add(r3, r1),
            sub(r3, r1),
            Self::normalize_plane(r2[0], r2[1], r2[2], r2[3]),
            sub(r3, r2),
        ];

        Self { planes }
    }

    fn normalize_plane(a: f64, b: f64, c: f64, d: f64) -> (DVec3, f64) {
        let normal = DVec3::new(a, b, c);
        let length = normal.length();
        if length > 0.0 {
            (normal / length, d / length)
        } else {
            (DVec3::ZERO, 0.0)
        }
    }

    /// Test if a box intersects the frustum.
    ///
    /// Degenerate boxes never intersect.
    #[must_use]
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        if aabb.is_degenerate() {
            return false;
        }
        for &(normal, distance) in &self.planes {
            // Corner furthest along the plane normal.
            let p = DVec3::select(normal.cmpge(DVec3::ZERO), aabb.max, aabb.min);
            if normal.dot(p) + distance < 0.0 {
                return false;
            }
        }
        true
    }
}
