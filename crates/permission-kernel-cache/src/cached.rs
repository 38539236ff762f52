use std::sync::Arc;
use std::time::Duration;

use permission_kernel_core::{
    DefaultOverlay, InheritedNode, MetaData, PermissionData, QueryOptions, ResolutionPolicy,
};
use time::OffsetDateTime;

use crate::manager::{CacheManager, ReloadAll, ReloadHandle};
use crate::scheduler::Scheduler;

/// Where a holder's cached views get their raw material from.
pub trait ResolutionSource: Send + Sync {
    /// Distinct, precedence-sorted nodes for `holder` under `options`.
    fn resolve_distinct(&self, holder: &str, options: &QueryOptions) -> Vec<InheritedNode>;
    fn default_overlay(&self) -> Arc<dyn DefaultOverlay>;
    fn policy(&self) -> ResolutionPolicy;
}

/// Both views of one holder under one set of query options, derived from a
/// single resolution pass.
#[derive(Debug)]
pub struct CachedEntry {
    permissions: Arc<PermissionData>,
    meta: Arc<MetaData>,
    valid_until: Option<OffsetDateTime>,
}

impl CachedEntry {
    #[must_use]
    pub fn new(
        options: QueryOptions,
        distinct: &[InheritedNode],
        overlay: Arc<dyn DefaultOverlay>,
        policy: &ResolutionPolicy,
    ) -> Self {
        let valid_until = distinct.iter().filter_map(|entry| entry.node().expiry()).min();
        Self {
            permissions: Arc::new(PermissionData::new(options, distinct, overlay)),
            meta: Arc::new(MetaData::from_resolved(distinct, policy)),
            valid_until,
        }
    }

    #[must_use]
    pub fn permissions(&self) -> &Arc<PermissionData> {
        &self.permissions
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<MetaData> {
        &self.meta
    }

    /// Earliest expiry among the resolved nodes; `None` when all are permanent.
    #[must_use]
    pub fn valid_until(&self) -> Option<OffsetDateTime> {
        self.valid_until
    }

    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.valid_until.is_some_and(|expiry| expiry <= now)
    }
}

/// The cached permission and meta views of one holder.
#[derive(Debug)]
pub struct CachedData {
    holder: String,
    entries: CacheManager<CachedEntry>,
}

impl CachedData {
    #[must_use]
    pub fn new(holder: &str, source: Arc<dyn ResolutionSource>, scheduler: Arc<dyn Scheduler>) -> Self {
        let owner = holder.to_string();
        let calculator = move |options: &QueryOptions| {
            let distinct = source.resolve_distinct(&owner, options);
            CachedEntry::new(options.clone(), &distinct, source.default_overlay(), &source.policy())
        };
        Self { holder: holder.to_string(), entries: CacheManager::new(holder, Arc::new(calculator), scheduler) }
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    #[must_use]
    pub fn entries(&self) -> &CacheManager<CachedEntry> {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, options: &QueryOptions) -> Arc<CachedEntry> {
        self.entry_at(options, OffsetDateTime::now_utc())
    }

    /// Cached entry for `options`. An entry holding a node that expired by
    /// `now` is answered by a fresh computation while the cache is refreshed
    /// in the background.
    #[must_use]
    pub fn entry_at(&self, options: &QueryOptions, now: OffsetDateTime) -> Arc<CachedEntry> {
        let entry = self.entries.get(options);
        if !entry.is_expired(now) {
            return entry;
        }
        tracing::debug!(holder = %self.holder, context = %options.context(), "cached entry outlived a node expiry");
        self.entries.recalculate(options);
        Arc::new(self.entries.calculate(options))
    }

    #[must_use]
    pub fn permission_data(&self, options: &QueryOptions) -> Arc<PermissionData> {
        Arc::clone(self.entry(options).permissions())
    }

    #[must_use]
    pub fn meta_data(&self, options: &QueryOptions) -> Arc<MetaData> {
        Arc::clone(self.entry(options).meta())
    }

    #[must_use]
    pub fn calculate(&self, options: &QueryOptions) -> CachedEntry {
        self.entries.calculate(options)
    }

    pub fn recalculate(&self, options: &QueryOptions) {
        self.entries.recalculate(options);
    }

    pub fn recalculate_all(&self) {
        self.entries.recalculate_all();
    }

    pub fn reload(&self, options: &QueryOptions) -> ReloadHandle<CachedEntry> {
        self.entries.reload(options)
    }

    pub fn reload_all(&self) -> ReloadAll<CachedEntry> {
        self.entries.reload_all()
    }

    pub fn invalidate(&self, options: &QueryOptions) {
        self.entries.invalidate(options);
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.entries.evict_idle(max_idle)
    }

    /// Re-applies the default overlay on every ready permission view while
    /// keeping the resolved node sequences.
    pub fn invalidate_permission_calculators(&self) {
        let ready = self.entries.ready_values();
        for (_, entry) in &ready {
            entry.permissions().invalidate_calculator();
        }
        tracing::debug!(holder = %self.holder, refreshed = ready.len(), "permission calculators invalidated");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use permission_kernel_core::{DefaultGrants, Node, NodeBuilder, StaticDefaults, Tristate};

    use super::*;
    use crate::scheduler::ManualScheduler;

    fn build(builder: NodeBuilder) -> Node {
        match builder.build() {
            Ok(node) => node,
            Err(err) => panic!("fixture node failed to build: {err}"),
        }
    }

    struct FixedSource {
        nodes: Vec<InheritedNode>,
        overlay: Arc<StaticDefaults>,
        resolutions: AtomicUsize,
    }

    impl ResolutionSource for FixedSource {
        fn resolve_distinct(&self, _holder: &str, _options: &QueryOptions) -> Vec<InheritedNode> {
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            self.nodes.clone()
        }

        fn default_overlay(&self) -> Arc<dyn DefaultOverlay> {
            self.overlay.clone()
        }

        fn policy(&self) -> ResolutionPolicy {
            ResolutionPolicy::default()
        }
    }

    fn source() -> Arc<FixedSource> {
        Arc::new(FixedSource {
            nodes: vec![
                InheritedNode::new(build(Node::permission("perm.fly")), "steve", 0),
                InheritedNode::new(build(Node::prefix(3, "[VIP]")), "vip", 1),
            ],
            overlay: Arc::new(StaticDefaults::default()),
            resolutions: AtomicUsize::new(0),
        })
    }

    #[test]
    fn both_views_come_from_one_resolution() {
        let source = source();
        let scheduler = Arc::new(ManualScheduler::new());
        let cached = CachedData::new("steve", source.clone(), scheduler.clone());
        let options = QueryOptions::global();

        assert_eq!(cached.permission_data(&options).check_permission("perm.fly"), Tristate::True);
        assert_eq!(cached.meta_data(&options).prefix(), Some("[VIP]"));
        assert_eq!(source.resolutions.load(Ordering::SeqCst), 1);

        cached.recalculate(&options);
        cached.recalculate(&options);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(source.resolutions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn entries_past_their_earliest_expiry_are_recomputed() {
        let now = OffsetDateTime::now_utc();
        let source = Arc::new(FixedSource {
            nodes: vec![
                InheritedNode::new(build(Node::permission("perm.fly")), "steve", 0),
                InheritedNode::new(
                    build(Node::permission("perm.vip").expiry(now + time::Duration::hours(1))),
                    "steve",
                    0,
                ),
                InheritedNode::new(
                    build(Node::permission("perm.trial").expiry(now + time::Duration::hours(2))),
                    "vip",
                    1,
                ),
            ],
            overlay: Arc::new(StaticDefaults::default()),
            resolutions: AtomicUsize::new(0),
        });
        let scheduler = Arc::new(ManualScheduler::new());
        let cached = CachedData::new("steve", source.clone(), scheduler.clone());
        let options = QueryOptions::global();

        let entry = cached.entry_at(&options, now);
        assert_eq!(entry.valid_until(), Some(now + time::Duration::hours(1)));
        let _ = cached.entry_at(&options, now + time::Duration::minutes(59));
        assert_eq!(source.resolutions.load(Ordering::SeqCst), 1);

        let _ = cached.entry_at(&options, now + time::Duration::minutes(61));
        assert_eq!(source.resolutions.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn invalidating_calculators_skips_the_inheritance_walk() {
        let source = source();
        let cached = CachedData::new("steve", source.clone(), Arc::new(ManualScheduler::new()));
        let options = QueryOptions::global();
        let data = cached.permission_data(&options);
        assert_eq!(data.check_permission("spawn.use"), Tristate::Undefined);

        source.overlay.set(DefaultGrants::new().with("spawn.use", true));
        cached.invalidate_permission_calculators();

        assert_eq!(cached.permission_data(&options).check_permission("spawn.use"), Tristate::True);
        assert_eq!(source.resolutions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reload_all_refreshes_every_entry() {
        let source = source();
        let scheduler = Arc::new(ManualScheduler::new());
        let cached = CachedData::new("steve", source, scheduler.clone());
        let options = QueryOptions::global();
        let _ = cached.permission_data(&options);
        let _ = cached.meta_data(&options);

        let reload = cached.reload_all();
        assert_eq!(reload.len(), 1);
        assert!(!reload.is_complete());
        assert_eq!(scheduler.run_pending(), 1);
        assert!(reload.is_complete());

        cached.invalidate_all();
        assert!(cached.entries().known_keys().is_empty());
    }
}
