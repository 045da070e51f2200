//! Decode worker boundary.
//!
//! Fetching and decoding run as spawned tasks that own everything they
//! touch: each task receives a copy of the node descriptor and returns
//! freshly allocated buffers over a channel. The frame thread drains the
//! channels at the start of every step, so residency is only ever mutated
//! there.
//!
//! Task spawning is abstracted behind [`Spawner`] so the crate works with
//! any executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pointstream_decode::{DecodeError, DecodedBuffers};

use crate::dataset::{DatasetSource, NodeKey};
use crate::error::LoadError;
use crate::hierarchy::{ChildDescriptor, NodeDescriptor};

/// Boxed `Send` future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Future returned by [`TileSource::fetch`].
pub type FetchFuture = BoxFuture<Result<Vec<u8>, LoadError>>;

/// Future returned by [`HierarchySource::fetch_children`].
pub type HierarchyFuture = BoxFuture<Result<Vec<ChildDescriptor>, LoadError>>;

/// Runs background tasks to completion.
pub trait Spawner: Send + Sync {
    /// Spawn a task. Results travel back over channels, not return values.
    fn spawn(&self, future: BoxFuture<()>);
}

/// Fetches the raw bytes of a node's payload.
pub trait TileSource: Send + Sync {
    /// Fetch the payload of `node`.
    fn fetch(&self, node: &NodeDescriptor) -> FetchFuture;
}

/// Decodes a node's payload. Runs inside a background task.
pub trait TileDecoder: Send + Sync {
    /// Decode `bytes` belonging to `node`.
    fn decode(&self, node: &NodeDescriptor, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError>;
}

/// Produces child metadata for nodes whose children were not in the
/// eagerly loaded hierarchy.
pub trait HierarchySource: Send + Sync {
    /// Fetch the direct children of `node`.
    fn fetch_children(&self, node: &NodeDescriptor) -> HierarchyFuture;
}

/// [`Spawner`] backed by a Tokio runtime.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioSpawner(tokio::runtime::Handle);

#[cfg(feature = "tokio")]
impl TokioSpawner {
    /// Spawn onto the given runtime.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self(handle)
    }

    /// Spawn onto the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self(tokio::runtime::Handle::current())
    }
}

#[cfg(feature = "tokio")]
impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxFuture<()>) {
        // Detached: completion is observed through the channel.
        drop(self.0.spawn(future));
    }
}

/// Identifies one dispatched load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadTicket(pub(crate) u64);

/// Result of a tile load.
#[derive(Debug)]
pub(crate) struct LoadCompletion {
    pub key: NodeKey,
    pub ticket: LoadTicket,
    pub result: Result<DecodedBuffers, LoadError>,
}

/// Result of a hierarchy fetch.
#[derive(Debug)]
pub(crate) struct HierarchyCompletion {
    pub key: NodeKey,
    pub result: Result<Vec<ChildDescriptor>, LoadError>,
}

/// Dispatches loads to background tasks and collects their results.
pub(crate) struct WorkerPool {
    spawner: Arc<dyn Spawner>,
    load_tx: async_channel::Sender<LoadCompletion>,
    load_rx: async_channel::Receiver<LoadCompletion>,
    hierarchy_tx: async_channel::Sender<HierarchyCompletion>,
    hierarchy_rx: async_channel::Receiver<HierarchyCompletion>,
    next_ticket: u64,
}

impl WorkerPool {
    /// Channel capacities match the concurrency caps, so a finished task
    /// never waits to report.
    pub fn new(spawner: Arc<dyn Spawner>, max_loads: usize, max_hierarchy_loads: usize) -> Self {
        let (load_tx, load_rx) = async_channel::bounded(max_loads.max(1));
        let (hierarchy_tx, hierarchy_rx) = async_channel::bounded(max_hierarchy_loads.max(1));
        Self {
            spawner,
            load_tx,
            load_rx,
            hierarchy_tx,
            hierarchy_rx,
            next_ticket: 0,
        }
    }

    /// Fetch and decode `node` in the background.
    pub fn submit(
        &mut self,
        key: NodeKey,
        node: NodeDescriptor,
        source: &DatasetSource,
    ) -> LoadTicket {
        let ticket = LoadTicket(self.next_ticket);
        self.next_ticket += 1;

        let tiles = Arc::clone(&source.tiles);
        let decoder = Arc::clone(&source.decoder);
        let tx = self.load_tx.clone();

        self.spawner.spawn(Box::pin(async move {
            let result = match tiles.fetch(&node).await {
                Ok(bytes) => decoder.decode(&node, &bytes).map_err(LoadError::from),
                Err(e) => Err(e),
            };
            let _ = tx
                .send(LoadCompletion {
                    key,
                    ticket,
                    result,
                })
                .await;
        }));

        ticket
    }

    /// Fetch the children of `node` in the background.
    pub fn submit_hierarchy(
        &self,
        key: NodeKey,
        node: NodeDescriptor,
        source: Arc<dyn HierarchySource>,
    ) {
        let tx = self.hierarchy_tx.clone();
        self.spawner.spawn(Box::pin(async move {
            let result = source.fetch_children(&node).await;
            let _ = tx.send(HierarchyCompletion { key, result }).await;
        }));
    }

    pub fn try_recv_load(&self) -> Option<LoadCompletion> {
        self.load_rx.try_recv().ok()
    }

    pub fn try_recv_hierarchy(&self) -> Option<HierarchyCompletion> {
        self.hierarchy_rx.try_recv().ok()
    }

    /// Results waiting to be drained.
    pub fn pending_completions(&self) -> usize {
        self.load_rx.len() + self.hierarchy_rx.len()
    }
}
