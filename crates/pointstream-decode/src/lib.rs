//! Decode point cloud tiles and hierarchy index chunks.
//!
//! This crate provides pure synchronous decoding functions for turning the
//! raw bytes of an octree tile into typed attribute buffers, and for reading
//! the breadth-first hierarchy index that describes which children a node
//! has. All functions can be called from any threading context; the caller
//! decides where decoding runs.
//!
//! # Design principles
//!
//! - **Synchronous**: No async, no threading primitives
//! - **User-controlled parallelism**: The streaming layer decides how to parallelize
//! - **Fresh buffers**: Every decode allocates its own output, nothing is shared

mod error;
pub mod hierarchy;
pub mod normals;
pub mod points;
pub mod reader;

pub use error::{DecodeError, DecodeResult};
pub use hierarchy::{HierarchyRecord, parse_hierarchy};
pub use points::decode_points;

use glam::{DVec3, Vec3};

/// A single attribute stored per point in a tile record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointAttribute {
    /// Quantized position, 3 × `u32`, multiplied by the format scale.
    PositionCartesian,
    /// Colour, 4 × `u8`.
    ColorRgba,
    /// Intensity, `u16`.
    Intensity,
    /// Classification, `u8`.
    Classification,
    /// Sphere-mapped normal, 2 × `u8`.
    NormalSphereMapped,
    /// Octahedron-encoded normal, 2 × `u8`.
    NormalOct16,
    /// Uncompressed normal, 3 × `f32`.
    Normal,
    /// Bytes the decoder does not interpret.
    Padding(u8),
}

impl PointAttribute {
    /// Size of the attribute in bytes.
    #[must_use]
    pub fn byte_size(self) -> usize {
        match self {
            Self::PositionCartesian | Self::Normal => 12,
            Self::ColorRgba => 4,
            Self::Intensity | Self::NormalSphereMapped | Self::NormalOct16 => 2,
            Self::Classification => 1,
            Self::Padding(n) => usize::from(n),
        }
    }
}

/// Ordered list of attributes making up one point record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointLayout {
    /// Attributes in storage order.
    pub attributes: Vec<PointAttribute>,
}

impl PointLayout {
    /// Create a layout from attributes in storage order.
    #[must_use]
    pub fn new(attributes: Vec<PointAttribute>) -> Self {
        Self { attributes }
    }

    /// Size of one point record in bytes.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.attributes.iter().map(|a| a.byte_size()).sum()
    }
}

impl Default for PointLayout {
    fn default() -> Self {
        Self::new(vec![PointAttribute::PositionCartesian, PointAttribute::ColorRgba])
    }
}

/// How the records of a tile are encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFormat {
    /// Record layout.
    pub layout: PointLayout,
    /// World units per quantized position step.
    pub scale: DVec3,
}

impl Default for TileFormat {
    fn default() -> Self {
        Self {
            layout: PointLayout::default(),
            scale: DVec3::splat(0.001),
        }
    }
}

/// Axis-aligned bounds of the decoded points, relative to the tile origin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TightBounds {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

/// Typed attribute buffers decoded from one tile.
///
/// Positions are stored relative to `origin` so that they keep full `f32`
/// precision far away from the dataset origin.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedBuffers {
    /// World-space origin the positions are relative to.
    pub origin: DVec3,
    /// Point positions relative to `origin`.
    pub positions: Vec<Vec3>,
    /// RGBA colours, if present in the layout.
    pub colors: Option<Vec<[u8; 4]>>,
    /// Raw intensities, if present in the layout.
    pub intensities: Option<Vec<f32>>,
    /// Classification codes, if present in the layout.
    pub classifications: Option<Vec<u8>>,
    /// Unit normals, if present in the layout.
    pub normals: Option<Vec<Vec3>>,
    /// Tight bounds of `positions`.
    pub bounds: TightBounds,
    /// Mean of `positions`.
    pub mean: Vec3,
}

impl DecodedBuffers {
    /// Number of decoded points.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.positions.len()
    }
}
