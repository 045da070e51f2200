//! Per-frame visibility and budget pass.
//!
//! All datasets share one max-heap, so the budget is spent on the most
//! important nodes system-wide: a coarse node of one dataset always beats a
//! fine node of another with a lower score. Traversal reads the hierarchy and
//! residency state only; the caller applies the results.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::bounds::Aabb;
use crate::camera::{Frustum, View};
use crate::config::StreamingConfig;
use crate::dataset::{Dataset, NodeKey};
use crate::hierarchy::{Expansion, NodeDescriptor, NodeId};
use crate::metric::PriorityMetric;

/// A node that survived culling and fit into the budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// The node.
    pub key: NodeKey,
    /// Priority score, the maximum over all views.
    pub score: f64,
    /// Points the node contributes.
    pub point_count: u64,
    /// Depth below the root.
    pub level: u32,
    /// Nominal point spacing.
    pub spacing: f64,
}

/// Result of one traversal.
#[derive(Debug, Clone, Default)]
pub struct VisibilityPass {
    /// Resident nodes to draw, highest score first.
    pub visible: Vec<Candidate>,
    /// Wanted nodes without resident geometry, highest score first.
    pub load_candidates: Vec<Candidate>,
    /// Resident nodes that want refinement but whose children are unknown.
    pub hierarchy_requests: Vec<Candidate>,
    /// Points of every node in `visible` and `load_candidates`.
    pub visible_points: u64,
    /// Traversal stopped because the next node did not fit.
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    score: f64,
    level: u32,
    seq: u64,
    key: NodeKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Larger score, then shallower, then pushed earlier.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.level.cmp(&self.level))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Inputs shared by every dataset in one traversal.
pub(crate) struct Traversal<'a> {
    pub views: &'a [View],
    pub frustums: &'a [Frustum],
    pub metric: &'a dyn PriorityMetric,
    pub config: &'a StreamingConfig,
}

impl Traversal<'_> {
    /// Best score over the views that see `bounds`, or `None` if culled.
    fn score(&self, bounds: &Aabb, spacing: f64) -> Option<f64> {
        if bounds.is_degenerate() {
            return None;
        }
        self.views
            .iter()
            .zip(self.frustums)
            .filter(|(_, frustum)| frustum.intersects_aabb(bounds))
            .map(|(view, _)| self.metric.score(view, bounds, spacing))
            .filter(|score| !score.is_nan())
            .reduce(f64::max)
    }

    /// Run the pass over `datasets`.
    ///
    /// `resident_points` returns the point count of a node's resident
    /// geometry, or `None` if it has none. Resident nodes are budgeted by
    /// that count rather than the count their descriptor claims.
    pub fn run<'d, I, R>(&self, datasets: I, resident_points: R) -> VisibilityPass
    where
        I: IntoIterator<Item = &'d Dataset>,
        R: Fn(NodeKey) -> Option<u64>,
    {
        let budget = self.config.point_budget;
        let mut pass = VisibilityPass::default();
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;
        let mut push =
            |heap: &mut BinaryHeap<HeapEntry>, key: NodeKey, node: &NodeDescriptor, score| {
                heap.push(HeapEntry {
                    score,
                    level: node.level,
                    seq,
                    key,
                });
                seq += 1;
            };

        let datasets: Vec<&Dataset> = datasets
            .into_iter()
            .filter(|d| d.options().visible)
            .collect();
        for dataset in &datasets {
            let Some(root) = dataset.node(NodeId::ROOT) else {
                continue;
            };
            if let Some(score) = self.score(&root.bounds, root.spacing) {
                push(&mut heap, dataset.key(NodeId::ROOT), root, score);
            }
        }

        while let Some(entry) = heap.pop() {
            let Some(dataset) = datasets.iter().find(|d| d.id() == entry.key.dataset) else {
                continue;
            };
            let Some(node) = dataset.node(entry.key.node) else {
                continue;
            };

            let resident = resident_points(entry.key);
            let point_count = resident.unwrap_or(node.point_count);
            if pass.visible_points.saturating_add(point_count) > budget {
                pass.budget_exhausted = true;
                break;
            }
            pass.visible_points += point_count;

            let candidate = Candidate {
                key: entry.key,
                score: entry.score,
                point_count,
                level: node.level,
                spacing: node.spacing,
            };

            // Unloaded nodes are not expanded: their children could not be
            // loaded before them anyway.
            if resident.is_none() {
                pass.load_candidates.push(candidate);
                continue;
            }
            pass.visible.push(candidate);

            let limits = self
                .config
                .resolve(dataset.hierarchy().shape(), dataset.options());
            if entry.score < limits.min_node_pixel_size || node.level >= limits.max_level {
                continue;
            }

            match dataset.hierarchy().expansion(entry.key.node) {
                Expansion::Complete => {}
                Expansion::Pending => {
                    pass.hierarchy_requests.push(candidate);
                    continue;
                }
                Expansion::Loading => continue,
            }

            for child_id in node.children() {
                let Some(child) = dataset.node(child_id) else {
                    continue;
                };
                if let Some(score) = self.score(&child.bounds, child.spacing) {
                    push(&mut heap, dataset.key(child_id), child, score);
                }
            }
        }

        tracing::trace!(
            visible = pass.visible.len(),
            load_candidates = pass.load_candidates.len(),
            visible_points = pass.visible_points,
            budget_exhausted = pass.budget_exhausted,
            "visibility pass"
        );
        pass
    }
}
