//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use glam::{DVec3, Vec3};
use pointstream_decode::{DecodeError, DecodedBuffers};

use crate::bounds::Aabb;
use crate::camera::View;
use crate::dataset::{Dataset, DatasetId, DatasetOptions, DatasetSource, NodeKey};
use crate::hierarchy::{ChildDescriptor, Hierarchy, NodeDescriptor, NodeId, TreeShape};
use crate::source::{LayoutDecoder, MemoryTileSource};
use crate::worker::{BoxFuture, Spawner, TileDecoder};

pub fn node_id(n: u32) -> NodeId {
    NodeId::from_raw(n)
}

/// Node `n` of dataset 0.
pub fn key(n: u32) -> NodeKey {
    NodeKey::new(DatasetId::new(0), node_id(n))
}

/// Buffers holding `n` points at the origin.
pub fn buffers(n: usize) -> DecodedBuffers {
    DecodedBuffers {
        positions: vec![Vec3::ZERO; n],
        ..DecodedBuffers::default()
    }
}

/// Encode quantized positions in the default layout (position + RGBA).
pub fn encode_points(points: &[[u32; 3]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * 16);
    for p in points {
        for c in p {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out.extend_from_slice(&[255, 128, 0, 255]);
    }
    out
}

/// A tile of `n` points in the default layout.
pub fn tile(n: u64) -> Vec<u8> {
    let points: Vec<[u32; 3]> = (0..n)
        .map(|i| {
            let v = u32::try_from(i % 1000).unwrap();
            [v, v, v]
        })
        .collect();
    encode_points(&points)
}

pub fn block_on<F: Future>(f: F) -> F::Output {
    let mut cx = Context::from_waker(Waker::noop());
    let mut f = std::pin::pin!(f);
    loop {
        if let Poll::Ready(result) = f.as_mut().poll(&mut cx) {
            return result;
        }
    }
}

/// Spawner that only makes progress when the test asks it to.
#[derive(Default)]
pub struct ManualSpawner {
    tasks: Mutex<Vec<BoxFuture<()>>>,
}

impl ManualSpawner {
    /// Poll every task once. Returns the number that finished.
    pub fn run_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let mut cx = Context::from_waker(Waker::noop());
        let mut finished = 0;
        let mut pending = Vec::new();
        for mut task in tasks {
            match task.as_mut().poll(&mut cx) {
                Poll::Ready(()) => finished += 1,
                Poll::Pending => pending.push(task),
            }
        }
        self.tasks.lock().unwrap().extend(pending);
        finished
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl Spawner for ManualSpawner {
    fn spawn(&self, future: BoxFuture<()>) {
        self.tasks.lock().unwrap().push(future);
    }
}

/// Decoder that fails for the node names in its set.
#[derive(Default)]
pub struct FlakyDecoder {
    inner: LayoutDecoder,
    failing: Mutex<HashSet<String>>,
}

impl FlakyDecoder {
    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }
}

impl TileDecoder for FlakyDecoder {
    fn decode(&self, node: &NodeDescriptor, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError> {
        if self.failing.lock().unwrap().contains(&node.name) {
            return Err(DecodeError::InvalidFormat {
                context: "test",
                detail: format!("{} is corrupt", node.name),
            });
        }
        self.inner.decode(node, bytes)
    }
}

/// Camera at z = 50 looking at the origin.
pub fn viewer() -> View {
    View::look_at(
        DVec3::new(0.0, 0.0, 50.0),
        DVec3::ZERO,
        DVec3::Y,
        60f64.to_radians(),
        (800.0, 600.0),
    )
}

/// Tiles for every node of `hierarchy`, sized to match its point counts.
pub fn tiles_for(hierarchy: &Hierarchy) -> MemoryTileSource {
    let mut tiles = MemoryTileSource::new();
    for id in hierarchy.ids() {
        let node = hierarchy.get(id).unwrap();
        tiles.insert(format!("{}.bin", node.name), tile(node.point_count));
    }
    tiles
}

/// A 10-unit cube centred on the origin with all eight children present.
pub fn octree(root_points: u64, child_points: u64) -> Hierarchy {
    let mut hierarchy = Hierarchy::new(
        TreeShape::Octree,
        Aabb::cube(DVec3::splat(-5.0), 10.0),
        1.0,
        root_points,
        0xFF,
    );
    let children = (0..8).map(|i| ChildDescriptor::new(i, child_points, 0)).collect();
    hierarchy.expand(NodeId::ROOT, children).unwrap();
    hierarchy
}

/// Hierarchy and in-memory source for [`octree`].
pub fn octree_parts(root_points: u64, child_points: u64) -> (Hierarchy, DatasetSource) {
    let hierarchy = octree(root_points, child_points);
    let source = DatasetSource::new(
        Arc::new(tiles_for(&hierarchy)),
        Arc::new(LayoutDecoder::default()),
    );
    (hierarchy, source)
}

pub fn octree_dataset(id: u32, root_points: u64, child_points: u64) -> Dataset {
    let (hierarchy, source) = octree_parts(root_points, child_points);
    Dataset::new(
        DatasetId::new(id),
        format!("test-{id}"),
        hierarchy,
        DatasetOptions::default(),
        source,
    )
}
