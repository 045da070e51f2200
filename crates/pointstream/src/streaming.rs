//! Per-frame streaming orchestration.
//!
//! [`StreamingContext::step`] is the only place where residency changes.
//! Each step drains finished work, runs the visibility pass, reconciles the
//! load queue with it, dispatches new loads and evicts down to the budget.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use web_time::Instant;

use crate::camera::{Frustum, View};
use crate::config::{StreamingConfig, validate_pixel_size};
use crate::dataset::{Dataset, DatasetId, DatasetOptions, DatasetSource, NodeKey};
use crate::error::{Error, LoadError, Result};
use crate::hierarchy::{Expansion, Hierarchy, NodeId};
use crate::metric::{PriorityMetric, ProjectedSize};
use crate::residency::{ResidencyCache, ResidentGeometry};
use crate::scheduler::{Cancelled, Completed, LoadScheduler};
use crate::visibility::{Candidate, Traversal, VisibilityPass};
use crate::worker::{Spawner, WorkerPool};

/// Views to render this frame.
#[derive(Debug, Clone, Default)]
pub struct FrameContext {
    /// Active viewpoints. At least one is required.
    pub views: Vec<View>,
}

impl FrameContext {
    /// Frame with the given views.
    #[must_use]
    pub fn new(views: Vec<View>) -> Self {
        Self { views }
    }

    /// Frame with one view.
    #[must_use]
    pub fn single(view: View) -> Self {
        Self { views: vec![view] }
    }
}

/// A resident node to draw this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleNode {
    /// The node.
    pub key: NodeKey,
    /// Version of its resident buffers.
    pub version: u64,
    /// Points in the resident buffers.
    pub point_count: u64,
    /// Points the budget allots to the node.
    pub target_points: u64,
    /// Priority score.
    pub score: f64,
    /// Depth below the root.
    pub level: u32,
    /// Nominal point spacing.
    pub spacing: f64,
}

/// A load that failed. The node is unloaded again.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFailure {
    /// The node.
    pub key: NodeKey,
    /// What went wrong.
    pub error: LoadError,
}

/// Counters for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Points across visible nodes and wanted nodes not yet loaded.
    pub total_visible_points: u64,
    /// Largest spacing among visible nodes.
    pub coarsest_spacing: f64,
    /// Smallest spacing among visible nodes.
    pub finest_spacing: f64,
    /// Deepest visible level.
    pub deepest_level: u32,
    /// Requests waiting for a load slot.
    pub queued: usize,
    /// Loads in flight.
    pub loading: usize,
    /// Loads started this step.
    pub dispatched: usize,
    /// Hierarchy fetches started this step.
    pub hierarchy_dispatched: usize,
    /// Loads that became resident this step.
    pub completed: usize,
    /// Finished loads that were no longer wanted.
    pub discarded: usize,
    /// Loads and hierarchy fetches that failed.
    pub failed: usize,
    /// Nodes evicted this step.
    pub evicted: usize,
    /// Points resident after eviction.
    pub resident_points: u64,
    /// Nodes resident after eviction.
    pub resident_nodes: usize,
    /// Traversal stopped because the budget ran out.
    pub budget_exhausted: bool,
    /// Resident points still exceed the budget because nothing else could
    /// be evicted.
    pub over_budget: bool,
    /// Time spent in the step.
    pub duration: Duration,
}

/// What a step produced.
#[derive(Debug, Clone, Default)]
pub struct FrameOutput {
    /// Frame number, starting at 1.
    pub frame: u64,
    /// Resident nodes to draw, highest score first.
    pub visible: Vec<VisibleNode>,
    /// Loads that failed since the previous step.
    pub failures: Vec<LoadFailure>,
    /// Counters.
    pub stats: FrameStats,
}

/// Where a node is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadState {
    /// No geometry and no pending work.
    Unloaded,
    /// Waiting for a load slot.
    Queued {
        /// Current priority.
        priority: f64,
    },
    /// Fetch or decode in progress.
    Loading,
    /// Geometry is resident.
    Loaded {
        /// Buffer version.
        version: u64,
    },
}

/// Streams the nodes of any number of datasets under one point budget.
pub struct StreamingContext {
    config: StreamingConfig,
    metric: Box<dyn PriorityMetric>,
    datasets: BTreeMap<DatasetId, Dataset>,
    next_dataset: u32,
    scheduler: LoadScheduler,
    cache: ResidencyCache,
    pool: WorkerPool,
    hierarchy_loading: HashSet<NodeKey>,
    /// Nodes the latest traversal selected; completions for anything else
    /// are discarded.
    wanted: HashSet<NodeKey>,
    frame: u64,
}

impl StreamingContext {
    /// Create a context that runs loads on `spawner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: StreamingConfig, spawner: Arc<dyn Spawner>) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(
            spawner,
            config.max_concurrent_loads,
            config.max_concurrent_hierarchy_loads,
        );
        Ok(Self {
            config,
            metric: Box::new(ProjectedSize),
            datasets: BTreeMap::new(),
            next_dataset: 0,
            scheduler: LoadScheduler::new(),
            cache: ResidencyCache::new(),
            pool,
            hierarchy_loading: HashSet::new(),
            wanted: HashSet::new(),
            frame: 0,
        })
    }

    /// Use a different priority metric.
    #[must_use]
    pub fn with_metric(mut self, metric: impl PriorityMetric + 'static) -> Self {
        self.metric = Box::new(metric);
        self
    }

    /// Start tracking a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options carry an invalid pixel
    /// threshold.
    pub fn add_dataset(
        &mut self,
        name: impl Into<String>,
        hierarchy: Hierarchy,
        source: DatasetSource,
        options: DatasetOptions,
    ) -> Result<DatasetId> {
        if let Some(pixels) = options.min_node_pixel_size {
            validate_pixel_size(pixels)?;
        }
        let id = DatasetId::new(self.next_dataset);
        self.next_dataset += 1;

        let name = name.into();
        tracing::info!(dataset = %id, name = %name, nodes = hierarchy.len(), "added dataset");
        self.datasets
            .insert(id, Dataset::new(id, name, hierarchy, options, source));
        Ok(id)
    }

    /// Stop tracking a dataset.
    ///
    /// Resident geometry is released innermost first; queued requests are
    /// dropped and loads in flight are discarded when they finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDataset`] if the dataset is not tracked.
    pub fn remove_dataset(&mut self, id: DatasetId) -> Result<()> {
        let Some(dataset) = self.datasets.remove(&id) else {
            return Err(Error::UnknownDataset(id));
        };

        let mut released = 0u64;
        let mut cancelled = 0usize;
        for node in dataset.hierarchy().post_order(NodeId::ROOT) {
            let key = dataset.key(node);
            if self.scheduler.cancel(key) != Cancelled::NotPending {
                cancelled += 1;
            }
            if self.cache.contains(key) {
                released += self.cache.remove(key)?.point_count();
            }
        }
        self.hierarchy_loading.retain(|key| key.dataset != id);
        self.wanted.retain(|key| key.dataset != id);

        tracing::info!(
            dataset = %id,
            name = dataset.name(),
            released_points = released,
            cancelled,
            "removed dataset"
        );
        Ok(())
    }

    /// Show or hide a dataset. Hidden datasets are not traversed, so their
    /// nodes age out of the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDataset`] if the dataset is not tracked.
    pub fn set_dataset_visible(&mut self, id: DatasetId, visible: bool) -> Result<()> {
        let dataset = self.datasets.get_mut(&id).ok_or(Error::UnknownDataset(id))?;
        dataset.options.visible = visible;
        Ok(())
    }

    /// Replace a dataset's options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDataset`] if the dataset is not tracked and
    /// [`Error::Config`] for an invalid pixel threshold.
    pub fn set_dataset_options(&mut self, id: DatasetId, options: DatasetOptions) -> Result<()> {
        if let Some(pixels) = options.min_node_pixel_size {
            validate_pixel_size(pixels)?;
        }
        let dataset = self.datasets.get_mut(&id).ok_or(Error::UnknownDataset(id))?;
        dataset.options = options;
        Ok(())
    }

    /// Change the point budget. Takes effect on the next step.
    pub fn set_point_budget(&mut self, point_budget: u64) {
        tracing::debug!(point_budget, "point budget changed");
        self.config.point_budget = point_budget;
    }

    /// Advance one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveViews`] or [`Error::InvalidCamera`] if the
    /// frame cannot be traversed. State is left untouched in that case.
    pub fn step(&mut self, frame: &FrameContext) -> Result<FrameOutput> {
        let started = Instant::now();
        if frame.views.is_empty() {
            return Err(Error::NoActiveViews);
        }
        for view in &frame.views {
            view.validate()?;
        }

        self.frame += 1;
        let mut stats = FrameStats::default();
        let mut failures = Vec::new();

        let failed_hierarchy = self.drain_hierarchy_completions(&mut stats, &mut failures);
        let failed_now = self.drain_load_completions(&mut stats, &mut failures);

        let frustums: Vec<Frustum> = frame.views.iter().map(View::frustum).collect();
        let pass = Traversal {
            views: &frame.views,
            frustums: &frustums,
            metric: self.metric.as_ref(),
            config: &self.config,
        }
        .run(self.datasets.values(), |key| {
            self.cache.get(key).map(ResidentGeometry::point_count)
        });

        for candidate in &pass.visible {
            self.cache.touch(candidate.key, self.frame);
        }

        self.reconcile_queue(&pass, &failed_now);
        stats.dispatched = self.dispatch_loads();
        stats.hierarchy_dispatched =
            self.dispatch_hierarchy(&pass.hierarchy_requests, &failed_hierarchy);

        let eviction = self.cache.evict_until(self.config.point_budget, self.frame);
        stats.evicted = eviction.evicted.len();
        stats.over_budget = eviction.over_budget;

        self.wanted = pass
            .visible
            .iter()
            .chain(&pass.load_candidates)
            .map(|c| c.key)
            .collect();

        let visible: Vec<VisibleNode> = pass
            .visible
            .iter()
            .filter_map(|c| {
                let geometry = self.cache.get(c.key)?;
                Some(VisibleNode {
                    key: c.key,
                    version: geometry.version(),
                    point_count: geometry.point_count(),
                    target_points: c.point_count,
                    score: c.score,
                    level: c.level,
                    spacing: c.spacing,
                })
            })
            .collect();

        stats.total_visible_points = pass.visible_points;
        stats.budget_exhausted = pass.budget_exhausted;
        stats.coarsest_spacing = visible.iter().map(|v| v.spacing).fold(0.0, f64::max);
        stats.finest_spacing = visible
            .iter()
            .map(|v| v.spacing)
            .reduce(f64::min)
            .unwrap_or(0.0);
        stats.deepest_level = visible.iter().map(|v| v.level).max().unwrap_or(0);
        stats.queued = self.scheduler.queued_len();
        stats.loading = self.scheduler.in_flight();
        stats.resident_points = self.cache.resident_points();
        stats.resident_nodes = self.cache.len();
        stats.duration = started.elapsed();

        tracing::trace!(
            frame = self.frame,
            visible = visible.len(),
            visible_points = stats.total_visible_points,
            resident_points = stats.resident_points,
            dispatched = stats.dispatched,
            completed = stats.completed,
            evicted = stats.evicted,
            "frame"
        );

        Ok(FrameOutput {
            frame: self.frame,
            visible,
            failures,
            stats,
        })
    }

    /// Returns the nodes whose fetches failed, so they wait for the next step.
    fn drain_hierarchy_completions(
        &mut self,
        stats: &mut FrameStats,
        failures: &mut Vec<LoadFailure>,
    ) -> HashSet<NodeKey> {
        let mut failed = HashSet::new();

        while let Some(completion) = self.pool.try_recv_hierarchy() {
            let key = completion.key;
            self.hierarchy_loading.remove(&key);
            let Some(dataset) = self.datasets.get_mut(&key.dataset) else {
                continue;
            };

            match completion
                .result
                .and_then(|children| dataset.hierarchy.expand(key.node, children))
            {
                Ok(children) => {
                    tracing::debug!(node = %key, children = children.len(), "expanded hierarchy");
                }
                Err(error) => {
                    tracing::warn!(node = %key, %error, "hierarchy fetch failed");
                    dataset.hierarchy.set_expansion(key.node, Expansion::Pending);
                    stats.failed += 1;
                    failed.insert(key);
                    failures.push(LoadFailure { key, error });
                }
            }
        }

        failed
    }

    /// Returns the nodes whose loads failed, so they are not retried in the
    /// same step.
    fn drain_load_completions(
        &mut self,
        stats: &mut FrameStats,
        failures: &mut Vec<LoadFailure>,
    ) -> HashSet<NodeKey> {
        let mut failed = HashSet::new();

        while let Some(completion) = self.pool.try_recv_load() {
            let key = completion.key;
            match self.scheduler.complete(key, completion.ticket) {
                Completed::Accept => {}
                Completed::Discard => {
                    tracing::debug!(node = %key, "discarded cancelled load");
                    stats.discarded += 1;
                    continue;
                }
                Completed::Unknown => continue,
            }

            let buffers = match completion.result {
                Ok(buffers) => buffers,
                Err(error) => {
                    tracing::warn!(node = %key, %error, "load failed");
                    stats.failed += 1;
                    failed.insert(key);
                    failures.push(LoadFailure { key, error });
                    continue;
                }
            };

            let Some(node) = self
                .datasets
                .get(&key.dataset)
                .and_then(|d| d.node(key.node))
            else {
                stats.discarded += 1;
                continue;
            };
            if !self.wanted.contains(&key) {
                tracing::debug!(node = %key, "discarded load no longer wanted");
                stats.discarded += 1;
                continue;
            }

            let parent = node.parent().map(|p| NodeKey::new(key.dataset, p));
            match self.cache.insert(key, parent, buffers, self.frame) {
                Ok(version) => {
                    tracing::debug!(node = %key, version, "node resident");
                    stats.completed += 1;
                }
                Err(error) => {
                    tracing::debug!(node = %key, %error, "discarded load");
                    stats.discarded += 1;
                }
            }
        }

        failed
    }

    /// Drop queued work the traversal no longer wants, cancel loads that
    /// left the candidate set, and queue the new candidates.
    fn reconcile_queue(&mut self, pass: &VisibilityPass, failed_now: &HashSet<NodeKey>) {
        let candidates: HashSet<NodeKey> = pass.load_candidates.iter().map(|c| c.key).collect();

        let dropped = self.scheduler.retain_queued(|key| candidates.contains(&key));
        let stale: Vec<NodeKey> = self
            .scheduler
            .loading_keys()
            .filter(|key| !candidates.contains(key) && !self.scheduler.is_discarding(*key))
            .collect();
        for key in &stale {
            self.scheduler.cancel(*key);
        }
        if dropped > 0 || !stale.is_empty() {
            tracing::debug!(dropped, cancelled = stale.len(), "pruned load queue");
        }

        for Candidate { key, score, .. } in &pass.load_candidates {
            if failed_now.contains(key) {
                continue;
            }
            self.scheduler.enqueue(*key, *score);
        }
    }

    fn dispatch_loads(&mut self) -> usize {
        let datasets = &self.datasets;
        let cache = &self.cache;
        let pool = &mut self.pool;

        let started = self
            .scheduler
            .drain(self.config.max_concurrent_loads, |key, _| {
                let dataset = datasets.get(&key.dataset)?;
                let node = dataset.node(key.node)?;
                if let Some(parent) = node.parent()
                    && !cache.contains(dataset.key(parent))
                {
                    return None;
                }
                Some(pool.submit(key, node.clone(), &dataset.source))
            });

        for (key, priority) in &started {
            tracing::debug!(node = %key, priority, "dispatched load");
        }
        started.len()
    }

    fn dispatch_hierarchy(
        &mut self,
        requests: &[Candidate],
        failed_now: &HashSet<NodeKey>,
    ) -> usize {
        let mut dispatched = 0;
        for request in requests {
            if self.hierarchy_loading.len() >= self.config.max_concurrent_hierarchy_loads {
                break;
            }
            let key = request.key;
            if failed_now.contains(&key) {
                continue;
            }
            let Some(dataset) = self.datasets.get_mut(&key.dataset) else {
                continue;
            };
            let Some(source) = dataset.source.hierarchy.clone() else {
                continue;
            };
            let Some(node) = dataset.node(key.node).cloned() else {
                continue;
            };

            dataset.hierarchy.set_expansion(key.node, Expansion::Loading);
            self.pool.submit_hierarchy(key, node, source);
            self.hierarchy_loading.insert(key);
            dispatched += 1;
            tracing::debug!(node = %key, "dispatched hierarchy fetch");
        }
        dispatched
    }

    /// Resident geometry of a node.
    #[must_use]
    pub fn geometry(&self, key: NodeKey) -> Option<&ResidentGeometry> {
        self.cache.get(key)
    }

    /// Lifecycle state of a node.
    #[must_use]
    pub fn load_state(&self, key: NodeKey) -> LoadState {
        if let Some(geometry) = self.cache.get(key) {
            LoadState::Loaded {
                version: geometry.version(),
            }
        } else if let Some(priority) = self.scheduler.priority(key) {
            LoadState::Queued { priority }
        } else if self.scheduler.is_loading(key) {
            LoadState::Loading
        } else {
            LoadState::Unloaded
        }
    }

    /// A tracked dataset.
    #[must_use]
    pub fn dataset(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.get(&id)
    }

    /// All tracked datasets in id order.
    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Points currently resident.
    #[must_use]
    pub fn resident_points(&self) -> u64 {
        self.cache.resident_points()
    }

    /// Tile loads and hierarchy fetches in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight() + self.hierarchy_loading.len()
    }

    /// Finished loads waiting for the next step.
    #[must_use]
    pub fn pending_completions(&self) -> usize {
        self.pool.pending_completions()
    }

    /// Number of steps taken.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::*;
    use crate::bounds::Aabb;
    use crate::config::ShapeOverrides;
    use crate::hierarchy::{ChildDescriptor, TreeShape};
    use crate::metric::ScreenSpaceError;
    use crate::source::{LayoutDecoder, MemoryHierarchySource};
    use crate::test_support::{FlakyDecoder, ManualSpawner, octree_parts, tiles_for, viewer};

    fn context(config: StreamingConfig) -> (StreamingContext, Arc<ManualSpawner>) {
        let spawner = Arc::new(ManualSpawner::default());
        let ctx = StreamingContext::new(config, spawner.clone()).unwrap();
        (ctx, spawner)
    }

    fn frame() -> FrameContext {
        FrameContext::single(viewer())
    }

    /// Step, then let every spawned task finish.
    fn step_and_run(ctx: &mut StreamingContext, spawner: &ManualSpawner) -> FrameOutput {
        let output = ctx.step(&frame()).unwrap();
        spawner.run_all();
        output
    }

    fn assert_parents_resident(ctx: &StreamingContext) {
        for dataset in ctx.datasets() {
            for id in dataset.hierarchy().ids() {
                let key = dataset.key(id);
                if ctx.geometry(key).is_none() {
                    continue;
                }
                if let Some(parent) = dataset.node(id).unwrap().parent() {
                    assert!(ctx.geometry(dataset.key(parent)).is_some(), "{key} has no parent");
                }
            }
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let spawner = Arc::new(ManualSpawner::default());
        let config = StreamingConfig::default().with_max_concurrent_loads(0);
        assert!(matches!(
            StreamingContext::new(config, spawner),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_step_validates_views() {
        let (mut ctx, _) = context(StreamingConfig::default());
        assert!(matches!(ctx.step(&FrameContext::default()), Err(Error::NoActiveViews)));

        let mut view = viewer();
        view.position.x = f64::NAN;
        assert!(matches!(
            ctx.step(&FrameContext::single(view)),
            Err(Error::InvalidCamera { .. })
        ));
        assert_eq!(ctx.frame(), 0);
    }

    #[test]
    fn test_zero_budget_issues_no_loads() {
        let (mut ctx, spawner) = context(StreamingConfig::default().with_point_budget(0));
        let (hierarchy, source) = octree_parts(100, 10);
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();

        for _ in 0..3 {
            let out = step_and_run(&mut ctx, &spawner);
            assert_eq!(out.stats.dispatched, 0);
            assert!(out.visible.is_empty());
        }
        assert_eq!(ctx.in_flight(), 0);
        assert_eq!(ctx.load_state(NodeKey::root(id)), LoadState::Unloaded);
    }

    #[test]
    fn test_root_and_children_load_within_two_frames() {
        let config = StreamingConfig::default()
            .with_point_budget(1000)
            .with_max_concurrent_loads(8);
        let (mut ctx, spawner) = context(config);
        let (hierarchy, source) = octree_parts(100, 10);
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();
        let root = NodeKey::root(id);

        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.stats.dispatched, 1);
        assert_eq!(ctx.load_state(root), LoadState::Loading);
        spawner.run_all();

        let out = step_and_run(&mut ctx, &spawner);
        assert_eq!(out.stats.completed, 1);
        assert_eq!(out.visible.len(), 1);
        assert_eq!(out.stats.dispatched, 8);

        let out = step_and_run(&mut ctx, &spawner);
        assert_eq!(out.stats.completed, 8);
        assert_eq!(out.visible.len(), 9);
        assert_eq!(out.stats.evicted, 0);
        assert_eq!(out.stats.resident_points, 180);
        assert_eq!(out.stats.total_visible_points, 180);
        assert_eq!(out.stats.deepest_level, 1);
        assert_eq!(out.stats.coarsest_spacing, 1.0);
        assert_eq!(out.stats.finest_spacing, 0.5);
        assert!(!out.stats.over_budget);
        assert_parents_resident(&ctx);
    }

    #[test]
    fn test_concurrency_cap_limits_dispatch() {
        let config = StreamingConfig::default().with_max_concurrent_loads(3);
        let (mut ctx, spawner) = context(config);
        let (hierarchy, source) = octree_parts(100, 10);
        ctx.add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();

        step_and_run(&mut ctx, &spawner);
        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.stats.dispatched, 3);
        assert_eq!(out.stats.loading, 3);
        assert_eq!(out.stats.queued, 5);
        assert_eq!(spawner.pending(), 3);

        // Nothing has finished, so no slot frees up.
        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.stats.dispatched, 0);
        assert_eq!(out.stats.loading, 3);
        assert_eq!(spawner.pending(), 3);
    }

    #[test]
    fn test_failed_decode_is_retried_next_frame() {
        let (mut ctx, spawner) = context(StreamingConfig::default());
        let (hierarchy, _) = octree_parts(100, 10);
        let decoder = Arc::new(FlakyDecoder::default());
        decoder.fail("r");
        let source = DatasetSource::new(Arc::new(tiles_for(&hierarchy)), decoder.clone());
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();
        let root = NodeKey::root(id);

        step_and_run(&mut ctx, &spawner);
        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].key, root);
        assert!(matches!(out.failures[0].error, LoadError::Decode(_)));
        assert_eq!(out.stats.failed, 1);
        // Not retried within the failing step.
        assert_eq!(out.stats.dispatched, 0);
        assert_eq!(ctx.load_state(root), LoadState::Unloaded);

        decoder.heal("r");
        let out = step_and_run(&mut ctx, &spawner);
        assert_eq!(out.stats.dispatched, 1);
        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.stats.completed, 1);
        assert!(matches!(ctx.load_state(root), LoadState::Loaded { .. }));
    }

    #[test]
    fn test_lower_budget_evicts_untouched_nodes() {
        let config = StreamingConfig::default()
            .with_point_budget(1000)
            .with_max_concurrent_loads(8);
        let (mut ctx, spawner) = context(config);
        let (hierarchy, source) = octree_parts(100, 10);
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();
        for _ in 0..3 {
            step_and_run(&mut ctx, &spawner);
        }
        assert_eq!(ctx.resident_points(), 180);

        ctx.set_point_budget(100);
        let out = ctx.step(&frame()).unwrap();
        // The root stays visible and is never evicted in the frame it is drawn.
        assert_eq!(out.visible.len(), 1);
        assert_eq!(out.visible[0].key, NodeKey::root(id));
        assert_eq!(out.stats.evicted, 8);
        assert_eq!(out.stats.resident_points, 100);
        assert!(!out.stats.over_budget);
        assert!(out.stats.budget_exhausted);
    }

    #[test]
    fn test_budget_below_root_evicts_everything() {
        let config = StreamingConfig::default()
            .with_point_budget(1000)
            .with_max_concurrent_loads(8);
        let (mut ctx, spawner) = context(config);
        let (hierarchy, source) = octree_parts(100, 10);
        ctx.add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();
        for _ in 0..3 {
            step_and_run(&mut ctx, &spawner);
        }

        // Not even the root fits, so nothing is drawn or touched.
        ctx.set_point_budget(50);
        let out = ctx.step(&frame()).unwrap();
        assert!(out.visible.is_empty());
        assert_eq!(out.stats.resident_points, 0);
        assert_eq!(out.stats.evicted, 9);
    }

    #[test]
    fn test_converges_under_budget() {
        let config = StreamingConfig::default()
            .with_point_budget(150)
            .with_max_concurrent_loads(2);
        let (mut ctx, spawner) = context(config);
        let (hierarchy, source) = octree_parts(100, 10);
        ctx.add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();

        let mut last = FrameOutput::default();
        for _ in 0..10 {
            last = step_and_run(&mut ctx, &spawner);
            assert_parents_resident(&ctx);
            assert!(last.stats.resident_points <= 150);
        }
        assert_eq!(last.visible.len(), 6);
        assert_eq!(last.stats.resident_points, 150);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_hidden_dataset_cancels_in_flight_load() {
        let (mut ctx, spawner) = context(StreamingConfig::default());
        let (hierarchy, source) = octree_parts(100, 10);
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();
        let root = NodeKey::root(id);

        ctx.step(&frame()).unwrap();
        assert_eq!(ctx.load_state(root), LoadState::Loading);

        ctx.set_dataset_visible(id, false).unwrap();
        let out = step_and_run(&mut ctx, &spawner);
        assert!(out.visible.is_empty());

        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.stats.discarded, 1);
        assert_eq!(ctx.load_state(root), LoadState::Unloaded);
        assert_eq!(ctx.resident_points(), 0);
    }

    #[test]
    fn test_remove_dataset_releases_everything() {
        let config = StreamingConfig::default().with_max_concurrent_loads(8);
        let (mut ctx, spawner) = context(config);
        let (hierarchy, source) = octree_parts(100, 10);
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();

        step_and_run(&mut ctx, &spawner);
        // Children dispatched but not finished.
        ctx.step(&frame()).unwrap();
        assert!(ctx.in_flight() > 0);

        ctx.remove_dataset(id).unwrap();
        assert_eq!(ctx.resident_points(), 0);
        assert!(ctx.dataset(id).is_none());
        assert!(matches!(ctx.remove_dataset(id), Err(Error::UnknownDataset(_))));

        spawner.run_all();
        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.stats.discarded, 8);
        assert_eq!(out.stats.completed, 0);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_lazy_hierarchy_expansion() {
        let config = StreamingConfig::default().with_max_concurrent_loads(8);
        let (mut ctx, spawner) = context(config);

        let hierarchy = Hierarchy::new(
            TreeShape::Octree,
            Aabb::cube(DVec3::splat(-5.0), 10.0),
            1.0,
            100,
            0b0000_0011,
        );
        let mut full = hierarchy.clone();
        full.expand(
            NodeId::ROOT,
            vec![ChildDescriptor::new(0, 10, 0), ChildDescriptor::new(1, 10, 0)],
        )
        .unwrap();
        let mut children = MemoryHierarchySource::new();
        children.insert(
            "r",
            vec![ChildDescriptor::new(0, 10, 0), ChildDescriptor::new(1, 10, 0)],
        );
        let source = DatasetSource::new(
            Arc::new(tiles_for(&full)),
            Arc::new(LayoutDecoder::default()),
        )
        .with_hierarchy(Arc::new(children));
        let id = ctx
            .add_dataset("lazy", hierarchy, source, DatasetOptions::default())
            .unwrap();

        step_and_run(&mut ctx, &spawner);
        let out = step_and_run(&mut ctx, &spawner);
        assert_eq!(out.stats.completed, 1);
        assert_eq!(out.stats.hierarchy_dispatched, 1);
        assert_eq!(
            ctx.dataset(id).unwrap().hierarchy().expansion(NodeId::ROOT),
            Expansion::Loading
        );

        let out = step_and_run(&mut ctx, &spawner);
        assert_eq!(ctx.dataset(id).unwrap().hierarchy().len(), 3);
        assert_eq!(out.stats.dispatched, 2);

        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.visible.len(), 3);
    }

    #[test]
    fn test_failed_hierarchy_fetch_retries_next_step() {
        let (mut ctx, spawner) = context(StreamingConfig::default());
        let hierarchy = Hierarchy::new(
            TreeShape::Octree,
            Aabb::cube(DVec3::splat(-5.0), 10.0),
            1.0,
            100,
            0b0000_0001,
        );
        let source = DatasetSource::new(
            Arc::new(tiles_for(&hierarchy)),
            Arc::new(LayoutDecoder::default()),
        )
        .with_hierarchy(Arc::new(MemoryHierarchySource::new()));
        let id = ctx
            .add_dataset("lazy", hierarchy, source, DatasetOptions::default())
            .unwrap();

        step_and_run(&mut ctx, &spawner);
        step_and_run(&mut ctx, &spawner);
        let out = ctx.step(&frame()).unwrap();
        assert_eq!(out.failures.len(), 1);
        assert!(matches!(out.failures[0].error, LoadError::Hierarchy { .. }));
        assert_eq!(out.stats.hierarchy_dispatched, 0);
        assert_eq!(
            ctx.dataset(id).unwrap().hierarchy().expansion(NodeId::ROOT),
            Expansion::Pending
        );
        assert_eq!(ctx.dataset(id).unwrap().hierarchy().len(), 1);
        spawner.run_all();

        let out = ctx.step(&frame()).unwrap();
        assert!(out.failures.is_empty());
        assert_eq!(out.stats.hierarchy_dispatched, 1);
    }

    #[test]
    fn test_two_datasets_share_budget() {
        let config = StreamingConfig::default()
            .with_point_budget(200)
            .with_max_concurrent_loads(8);
        let (mut ctx, spawner) = context(config);
        let (h1, s1) = octree_parts(100, 10);
        let (h2, s2) = octree_parts(100, 10);
        let a = ctx.add_dataset("a", h1, s1, DatasetOptions::default()).unwrap();
        let b = ctx.add_dataset("b", h2, s2, DatasetOptions::default()).unwrap();

        for _ in 0..4 {
            step_and_run(&mut ctx, &spawner);
        }
        let out = ctx.step(&frame()).unwrap();
        let keys: Vec<NodeKey> = out.visible.iter().map(|v| v.key).collect();
        assert_eq!(keys, vec![NodeKey::root(a), NodeKey::root(b)]);
        assert_eq!(out.stats.resident_points, 200);
    }

    #[test]
    fn test_options_and_metric_overrides() {
        let config = StreamingConfig::default()
            .with_max_concurrent_loads(8)
            .with_shape_overrides(
                TreeShape::Octree,
                ShapeOverrides {
                    min_node_pixel_size: None,
                    max_level: Some(0),
                },
            );
        let spawner = Arc::new(ManualSpawner::default());
        let mut ctx = StreamingContext::new(config, spawner.clone())
            .unwrap()
            .with_metric(ScreenSpaceError);
        let (hierarchy, source) = octree_parts(100, 10);
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();

        for _ in 0..3 {
            step_and_run(&mut ctx, &spawner);
        }
        assert_eq!(ctx.resident_points(), 100);

        let bad = DatasetOptions {
            min_node_pixel_size: Some(f64::INFINITY),
            ..DatasetOptions::default()
        };
        assert!(matches!(ctx.set_dataset_options(id, bad), Err(Error::Config(_))));

        ctx.set_dataset_options(
            id,
            DatasetOptions {
                max_level: Some(1),
                ..DatasetOptions::default()
            },
        )
        .unwrap();
        for _ in 0..2 {
            step_and_run(&mut ctx, &spawner);
        }
        assert_eq!(ctx.resident_points(), 180);
    }

    #[test]
    fn test_versions_increase_across_reloads() {
        let (mut ctx, spawner) = context(StreamingConfig::default());
        let (hierarchy, source) = octree_parts(100, 10);
        let id = ctx
            .add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();
        let root = NodeKey::root(id);

        step_and_run(&mut ctx, &spawner);
        ctx.step(&frame()).unwrap();
        let LoadState::Loaded { version: first } = ctx.load_state(root) else {
            panic!("root not loaded");
        };
        assert_eq!(ctx.geometry(root).unwrap().buffers().point_count(), 100);

        ctx.set_point_budget(0);
        step_and_run(&mut ctx, &spawner);
        assert_eq!(ctx.load_state(root), LoadState::Unloaded);

        ctx.set_point_budget(1000);
        step_and_run(&mut ctx, &spawner);
        ctx.step(&frame()).unwrap();
        let LoadState::Loaded { version: second } = ctx.load_state(root) else {
            panic!("root not reloaded");
        };
        assert!(second > first);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_end_to_end() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let config = StreamingConfig::default()
            .with_point_budget(1000)
            .with_max_concurrent_loads(8);
        let spawner = Arc::new(crate::worker::TokioSpawner::current());
        let mut ctx = StreamingContext::new(config, spawner).unwrap();
        let (hierarchy, source) = octree_parts(100, 10);
        ctx.add_dataset("cloud", hierarchy, source, DatasetOptions::default())
            .unwrap();

        let mut visible = 0;
        for _ in 0..2000 {
            let out = ctx.step(&frame()).unwrap();
            visible = out.visible.len();
            if visible == 9 {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(visible, 9);
        assert_eq!(ctx.resident_points(), 180);
    }
}
