//! Axis-aligned bounding boxes for hierarchy nodes.

use glam::DVec3;

/// World-space axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: DVec3,
    /// Maximum corner.
    pub max: DVec3,
}

impl Aabb {
    /// Create a box from its corners.
    #[must_use]
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Create a cube with the given minimum corner and edge length.
    #[must_use]
    pub fn cube(min: DVec3, edge: f64) -> Self {
        Self {
            min,
            max: min + DVec3::splat(edge),
        }
    }

    /// Box centre.
    #[must_use]
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    /// Edge lengths.
    #[must_use]
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    /// Radius of the bounding sphere.
    #[must_use]
    pub fn radius(&self) -> f64 {
        self.size().length() * 0.5
    }

    /// Whether the box is unusable for culling: non-finite, inverted, or
    /// collapsed to a single point.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        if !self.min.is_finite() || !self.max.is_finite() {
            return true;
        }
        let size = self.size();
        size.min_element() < 0.0 || size == DVec3::ZERO
    }

    /// Bounds of octant `index`.
    ///
    /// Bit 2 selects the upper half in x, bit 1 in y and bit 0 in z.
    #[must_use]
    pub fn octant(&self, index: u8) -> Self {
        let half = self.size() * 0.5;
        let mut min = self.min;
        let mut max = self.max;

        if index & 0b100 != 0 {
            min.x += half.x;
        } else {
            max.x -= half.x;
        }
        if index & 0b010 != 0 {
            min.y += half.y;
        } else {
            max.y -= half.y;
        }
        if index & 0b001 != 0 {
            min.z += half.z;
        } else {
            max.z -= half.z;
        }

        Self { min, max }
    }

    /// Bounds of half `index` (0 lower, 1 upper) when split across the
    /// longest axis.
    #[must_use]
    pub fn half(&self, index: u8) -> Self {
        let size = self.size();
        let axis = if size.x >= size.y && size.x >= size.z {
            0
        } else if size.y >= size.z {
            1
        } else {
            2
        };
        let split = self.min[axis] + size[axis] * 0.5;

        let mut out = *self;
        if index == 0 {
            out.max[axis] = split;
        } else {
            out.min[axis] = split;
        }
        out
    }
}
