//! Budgeted streaming of out-of-core point cloud octrees.
//!
//! A [`StreamingContext`] tracks any number of datasets, each described by a
//! [`Hierarchy`] of node descriptors. Every frame, [`StreamingContext::step`]
//! decides which nodes deserve to be resident under a global point budget,
//! loads the missing ones in priority order on background tasks, and evicts
//! the least recently used nodes when the budget is exceeded.
//!
//! # Design principles
//!
//! - **Never blocks**: Loads run on a caller-provided [`Spawner`]; results are
//!   drained at the start of the next step
//! - **Level order**: A node is only loaded while its parent is resident and
//!   only evicted once its children are gone
//! - **One budget**: All datasets and views compete in a single traversal
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use glam::DVec3;
//! use pointstream::{
//!     Aabb, DatasetOptions, DatasetSource, FrameContext, Hierarchy, LayoutDecoder,
//!     MemoryTileSource, StreamingConfig, StreamingContext, TokioSpawner, TreeShape, View,
//! };
//!
//! # async fn example() -> pointstream::Result<()> {
//! let mut ctx = StreamingContext::new(
//!     StreamingConfig::default().with_point_budget(2_000_000),
//!     Arc::new(TokioSpawner::current()),
//! )?;
//!
//! let hierarchy = Hierarchy::new(
//!     TreeShape::Octree,
//!     Aabb::cube(DVec3::ZERO, 100.0),
//!     1.0,
//!     50_000,
//!     0,
//! );
//! let source = DatasetSource::new(
//!     Arc::new(MemoryTileSource::new()),
//!     Arc::new(LayoutDecoder::default()),
//! );
//! ctx.add_dataset("scan", hierarchy, source, DatasetOptions::default())?;
//!
//! let view = View::look_at(
//!     DVec3::new(50.0, 50.0, 300.0),
//!     DVec3::splat(50.0),
//!     DVec3::Y,
//!     1.0,
//!     (1920.0, 1080.0),
//! );
//! let output = ctx.step(&FrameContext::single(view))?;
//! for node in &output.visible {
//!     let _geometry = ctx.geometry(node.key);
//! }
//! # Ok(())
//! # }
//! ```

mod bounds;
mod camera;
mod config;
mod dataset;
mod error;
mod hierarchy;
mod metric;
mod residency;
mod scheduler;
mod source;
mod streaming;
mod visibility;
mod worker;

#[cfg(test)]
mod test_support;

pub use bounds::Aabb;
pub use camera::{Frustum, Projection, View};
pub use config::{
    DEFAULT_MAX_CONCURRENT_HIERARCHY_LOADS, DEFAULT_MAX_CONCURRENT_LOADS,
    DEFAULT_MIN_NODE_PIXEL_SIZE, DEFAULT_POINT_BUDGET, ResolvedLimits, ShapeOverrides,
    StreamingConfig,
};
pub use dataset::{Dataset, DatasetId, DatasetOptions, DatasetSource, NodeKey};
pub use error::{ConfigError, Error, LoadError, Result};
pub use hierarchy::{
    ChildDescriptor, Expansion, Hierarchy, NodeDescriptor, NodeId, PayloadLocation, ROOT_NAME,
    TreeShape,
};
pub use metric::{PriorityMetric, ProjectedSize, ScreenSpaceError};
pub use residency::{EvictionReport, ResidencyCache, ResidentGeometry};
pub use scheduler::{Cancelled, Completed, LoadScheduler};
#[cfg(all(feature = "http", not(target_family = "wasm")))]
pub use source::{HttpHierarchySource, HttpTileSource};
pub use source::{LayoutDecoder, MemoryHierarchySource, MemoryTileSource};
pub use streaming::{
    FrameContext, FrameOutput, FrameStats, LoadFailure, LoadState, StreamingContext, VisibleNode,
};
pub use visibility::{Candidate, VisibilityPass};
#[cfg(feature = "tokio")]
pub use worker::TokioSpawner;
pub use worker::{
    BoxFuture, FetchFuture, HierarchyFuture, HierarchySource, LoadTicket, Spawner, TileDecoder,
    TileSource,
};

pub use pointstream_decode::{DecodeError, DecodedBuffers, PointAttribute, PointLayout, TileFormat};
