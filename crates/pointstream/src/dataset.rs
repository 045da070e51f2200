//! Tracked datasets and node identity.

use std::fmt;
use std::sync::Arc;

use crate::hierarchy::{Hierarchy, NodeDescriptor, NodeId};
use crate::worker::{HierarchySource, TileDecoder, TileSource};

/// Identifies a dataset within one streaming context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(u32);

impl DatasetId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node of a specific dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Owning dataset.
    pub dataset: DatasetId,
    /// Node within the dataset's hierarchy.
    pub node: NodeId,
}

impl NodeKey {
    /// Create a key.
    #[must_use]
    pub fn new(dataset: DatasetId, node: NodeId) -> Self {
        Self { dataset, node }
    }

    /// Root node of a dataset.
    #[must_use]
    pub fn root(dataset: DatasetId) -> Self {
        Self::new(dataset, NodeId::ROOT)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.node.index())
    }
}

/// Per-dataset settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetOptions {
    /// Hidden datasets are not traversed; their nodes age out of the cache.
    pub visible: bool,
    /// Deepest level that may be traversed.
    pub max_level: Option<u32>,
    /// Minimum projected node size for refinement.
    pub min_node_pixel_size: Option<f64>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            visible: true,
            max_level: None,
            min_node_pixel_size: None,
        }
    }
}

/// Collaborators that produce a dataset's data.
#[derive(Clone)]
pub struct DatasetSource {
    /// Fetches raw tile bytes.
    pub tiles: Arc<dyn TileSource>,
    /// Turns tile bytes into buffers.
    pub decoder: Arc<dyn TileDecoder>,
    /// Pages in children of pending nodes, if the hierarchy is not complete.
    pub hierarchy: Option<Arc<dyn HierarchySource>>,
}

impl DatasetSource {
    /// Source with a complete, eagerly loaded hierarchy.
    pub fn new(tiles: Arc<dyn TileSource>, decoder: Arc<dyn TileDecoder>) -> Self {
        Self {
            tiles,
            decoder,
            hierarchy: None,
        }
    }

    /// Add a source for lazily expanded hierarchy levels.
    #[must_use]
    pub fn with_hierarchy(mut self, hierarchy: Arc<dyn HierarchySource>) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }
}

impl fmt::Debug for DatasetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetSource")
            .field("hierarchy", &self.hierarchy.is_some())
            .finish_non_exhaustive()
    }
}

/// A point cloud tracked by a streaming context.
#[derive(Debug)]
pub struct Dataset {
    id: DatasetId,
    name: String,
    pub(crate) hierarchy: Hierarchy,
    pub(crate) options: DatasetOptions,
    pub(crate) source: DatasetSource,
}

impl Dataset {
    pub(crate) fn new(
        id: DatasetId,
        name: String,
        hierarchy: Hierarchy,
        options: DatasetOptions,
        source: DatasetSource,
    ) -> Self {
        Self {
            id,
            name,
            hierarchy,
            options,
            source,
        }
    }

    /// Dataset id.
    #[must_use]
    pub fn id(&self) -> DatasetId {
        self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor hierarchy.
    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Current options.
    #[must_use]
    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Descriptor of one node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.hierarchy.get(id)
    }

    /// Key of one node.
    #[must_use]
    pub fn key(&self, id: NodeId) -> NodeKey {
        NodeKey::new(self.id, id)
    }
}
