use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use permission_kernel_cache::{CachedData, CachedEntry, ReloadAll, ResolutionSource, Scheduler, TokioScheduler};
use permission_kernel_core::{
    DataType, DefaultOverlay, GroupRanking, Holder, HolderArena, InheritanceResolver, InheritedNode,
    MetaData, MutationListener, NoDefaults, Node, NodeEquality, NodeMap, QueryOptions, ResolutionObserver,
    ResolutionPolicy, TracingObserver, Tristate,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::{KernelConfig, DEFAULT_CACHE_IDLE_SECS};
use crate::storage::{HolderStorage, MemoryStorage, StoredHolder};

struct KernelInner {
    arena: HolderArena,
    caches: RwLock<HashMap<String, Arc<CachedData>>>,
    storage: Arc<dyn HolderStorage>,
    scheduler: Arc<dyn Scheduler>,
    overlay: Arc<dyn DefaultOverlay>,
    observer: Arc<dyn ResolutionObserver>,
    ranking: Option<Arc<dyn GroupRanking>>,
    policy: ResolutionPolicy,
    cache_idle: Duration,
}

impl KernelInner {
    fn with_resolver<R>(&self, run: impl FnOnce(&InheritanceResolver<'_>) -> R) -> R {
        let ranking: &dyn GroupRanking = match &self.ranking {
            Some(ranking) => ranking.as_ref(),
            None => &self.arena,
        };
        let resolver = InheritanceResolver::new(&self.arena, ranking, self.observer.as_ref(), &self.policy);
        run(&resolver)
    }

    fn cache(&self, id: &str) -> Option<Arc<CachedData>> {
        self.caches.read().get(id).cloned()
    }

    /// Recalculates the caches of `id` and of every loaded holder inheriting from it.
    fn propagate(&self, id: &str) -> usize {
        let mut affected = vec![id.to_string()];
        affected.extend(self.arena.dependants(id));
        let mut recalculated = 0;
        for holder in &affected {
            if let Some(cache) = self.cache(holder) {
                cache.recalculate_all();
                recalculated += 1;
            }
        }
        tracing::debug!(holder = id, recalculated, "propagated holder change");
        recalculated
    }
}

struct KernelSource {
    inner: Weak<KernelInner>,
}

impl ResolutionSource for KernelSource {
    fn resolve_distinct(&self, holder: &str, options: &QueryOptions) -> Vec<InheritedNode> {
        let Some(inner) = self.inner.upgrade() else {
            return Vec::new();
        };
        let Some(holder) = inner.arena.get(holder) else {
            return Vec::new();
        };
        inner.with_resolver(|resolver| resolver.resolve_distinct_inherited_nodes(&holder, options))
    }

    fn default_overlay(&self) -> Arc<dyn DefaultOverlay> {
        match self.inner.upgrade() {
            Some(inner) => Arc::clone(&inner.overlay),
            None => Arc::new(NoDefaults),
        }
    }

    fn policy(&self) -> ResolutionPolicy {
        self.inner.upgrade().map(|inner| inner.policy.clone()).unwrap_or_default()
    }
}

struct KernelListener {
    inner: Weak<KernelInner>,
}

impl MutationListener for KernelListener {
    fn on_mutation(&self, holder: &str, data_type: DataType) {
        if let Some(inner) = self.inner.upgrade() {
            tracing::debug!(holder, partition = data_type.as_str(), "holder data mutated");
            inner.propagate(holder);
        }
    }
}

pub struct PermissionKernelBuilder {
    storage: Option<Arc<dyn HolderStorage>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    overlay: Option<Arc<dyn DefaultOverlay>>,
    observer: Option<Arc<dyn ResolutionObserver>>,
    ranking: Option<Arc<dyn GroupRanking>>,
    policy: ResolutionPolicy,
    cache_idle: Duration,
}

impl Default for PermissionKernelBuilder {
    fn default() -> Self {
        Self {
            storage: None,
            scheduler: None,
            overlay: None,
            observer: None,
            ranking: None,
            policy: ResolutionPolicy::default(),
            cache_idle: Duration::from_secs(DEFAULT_CACHE_IDLE_SECS),
        }
    }
}

impl PermissionKernelBuilder {
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn HolderStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    #[must_use]
    pub fn default_overlay(mut self, overlay: Arc<dyn DefaultOverlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn ResolutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replaces the default ranking, which reads each loaded holder's `weight` meta.
    #[must_use]
    pub fn group_ranking(mut self, ranking: Arc<dyn GroupRanking>) -> Self {
        self.ranking = Some(ranking);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long a cached entry may go unread before the audit task evicts it.
    #[must_use]
    pub fn cache_idle(mut self, cache_idle: Duration) -> Self {
        self.cache_idle = cache_idle;
        self
    }

    #[must_use]
    pub fn config(self, config: &KernelConfig) -> Self {
        self.policy(config.policy.clone()).cache_idle(config.cache_idle())
    }

    /// # Errors
    /// Returns an error when no scheduler was supplied and the caller is not
    /// running inside a tokio runtime.
    pub fn build(self) -> Result<PermissionKernel> {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => {
                let runtime = TokioScheduler::current()
                    .ok_or_else(|| anyhow!("no scheduler configured and no tokio runtime is running"))?;
                Arc::new(runtime)
            }
        };
        let storage: Arc<dyn HolderStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new()),
        };
        let overlay: Arc<dyn DefaultOverlay> = match self.overlay {
            Some(overlay) => overlay,
            None => Arc::new(NoDefaults),
        };
        let observer: Arc<dyn ResolutionObserver> = match self.observer {
            Some(observer) => observer,
            None => Arc::new(TracingObserver),
        };
        let inner = KernelInner {
            arena: HolderArena::new(),
            caches: RwLock::new(HashMap::new()),
            storage,
            scheduler,
            overlay,
            observer,
            ranking: self.ranking,
            policy: self.policy,
            cache_idle: self.cache_idle,
        };
        Ok(PermissionKernel { inner: Arc::new(inner) })
    }
}

/// Registry of loaded holders and their caches.
///
/// Holder writes are pushed to the kernel, which recalculates (never
/// invalidates) the caches of the written holder and of every loaded holder
/// whose inheritance graph reaches it.
#[derive(Clone)]
pub struct PermissionKernel {
    inner: Arc<KernelInner>,
}

impl std::fmt::Debug for PermissionKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionKernel")
            .field("holders", &self.inner.arena.len())
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl PermissionKernel {
    #[must_use]
    pub fn builder() -> PermissionKernelBuilder {
        PermissionKernelBuilder::default()
    }

    #[must_use]
    pub fn policy(&self) -> &ResolutionPolicy {
        &self.inner.policy
    }

    /// Load `id` from storage, or create an empty holder when it was never saved.
    /// Returns the already-loaded holder when present; concurrent loads of one
    /// id all receive the same holder.
    ///
    /// # Errors
    /// Returns an error when the storage collaborator fails.
    pub fn load_holder(&self, id: &str) -> Result<Arc<Holder>> {
        let id = normalize_id(id)?;
        if let Some(existing) = self.inner.arena.get(&id) {
            return Ok(existing);
        }

        let stored = self.inner.storage.load(&id).with_context(|| format!("failed to load holder `{id}`"))?;
        let nodes = stored.map(|stored| stored.nodes).unwrap_or_default();

        // Held until the cache exists, so a holder is never visible without one.
        let mut caches = self.inner.caches.write();
        let (holder, created) = self.inner.arena.get_or_insert_with(&id, || {
            let holder = Arc::new(Holder::with_enduring(&id, NodeMap::from_nodes(nodes)));
            holder.attach_listener(Arc::new(KernelListener { inner: Arc::downgrade(&self.inner) }));
            holder
        });
        if !created {
            return Ok(holder);
        }
        let source: Arc<dyn ResolutionSource> = Arc::new(KernelSource { inner: Arc::downgrade(&self.inner) });
        caches.insert(id.clone(), Arc::new(CachedData::new(&id, source, Arc::clone(&self.inner.scheduler))));
        drop(caches);

        tracing::info!(holder = %id, nodes = holder.enduring().len(), "loaded holder");
        self.inner.propagate(&id);
        Ok(holder)
    }

    #[must_use]
    pub fn holder(&self, id: &str) -> Option<Arc<Holder>> {
        self.inner.arena.get(&id.trim().to_lowercase())
    }

    #[must_use]
    pub fn loaded_holders(&self) -> Vec<String> {
        self.inner.arena.ids()
    }

    /// Drop the holder, its transient data, and its caches. Unsaved enduring
    /// changes are lost.
    pub fn unload_holder(&self, id: &str) -> bool {
        let id = id.trim().to_lowercase();
        let dependants = self.inner.arena.dependants(&id);
        let Some(holder) = self.inner.arena.remove(&id) else {
            return false;
        };
        holder.detach_listener();
        if let Some(cache) = self.inner.caches.write().remove(&id) {
            cache.invalidate_all();
        }
        for dependant in &dependants {
            if let Some(cache) = self.inner.cache(dependant) {
                cache.recalculate_all();
            }
        }
        tracing::info!(holder = %id, dependants = dependants.len(), "unloaded holder");
        true
    }

    /// Audit expired nodes, then persist the enduring partition.
    ///
    /// # Errors
    /// Returns an error when the holder is not loaded or storage fails.
    pub fn save_holder(&self, id: &str) -> Result<()> {
        let holder = self.require(id)?;
        holder.audit_temporary_permissions();
        let stored = StoredHolder { id: holder.id().to_string(), nodes: holder.enduring().nodes() };
        self.inner.storage.save(&stored).with_context(|| format!("failed to save holder `{}`", holder.id()))
    }

    fn require(&self, id: &str) -> Result<Arc<Holder>> {
        self.holder(id).ok_or_else(|| anyhow!("holder `{id}` is not loaded"))
    }

    fn require_cache(&self, id: &str) -> Result<Arc<CachedData>> {
        self.inner.cache(&id.trim().to_lowercase()).ok_or_else(|| anyhow!("holder `{id}` is not loaded"))
    }

    #[must_use]
    pub fn cached_data(&self, id: &str) -> Option<Arc<CachedData>> {
        self.inner.cache(&id.trim().to_lowercase())
    }

    /// # Errors
    /// Returns an error when the holder is not loaded.
    pub fn check_permission(&self, id: &str, permission: &str, options: &QueryOptions) -> Result<Tristate> {
        Ok(self.require_cache(id)?.permission_data(options).check_permission(permission))
    }

    /// # Errors
    /// Returns an error when the holder is not loaded.
    pub fn meta_data(&self, id: &str, options: &QueryOptions) -> Result<Arc<MetaData>> {
        Ok(self.require_cache(id)?.meta_data(options))
    }

    /// # Errors
    /// Returns an error when the holder is not loaded.
    pub fn resolve_inherited_nodes(&self, id: &str, options: &QueryOptions) -> Result<Vec<InheritedNode>> {
        let holder = self.require(id)?;
        Ok(self.inner.with_resolver(|resolver| resolver.resolve_inherited_nodes(&holder, options)))
    }

    /// # Errors
    /// Returns an error when the holder is not loaded.
    pub fn resolve_distinct_inherited_nodes(
        &self,
        id: &str,
        options: &QueryOptions,
    ) -> Result<Vec<InheritedNode>> {
        let holder = self.require(id)?;
        Ok(self.inner.with_resolver(|resolver| resolver.resolve_distinct_inherited_nodes(&holder, options)))
    }

    /// # Errors
    /// Returns an error when the holder is not loaded.
    pub fn inherits_node(
        &self,
        id: &str,
        node: &Node,
        equality: NodeEquality,
        options: &QueryOptions,
    ) -> Result<Tristate> {
        let holder = self.require(id)?;
        Ok(self.inner.with_resolver(|resolver| resolver.inherits_node(&holder, node, equality, options)))
    }

    /// Reload every cached entry of `id`; readers block until the returned handle completes.
    ///
    /// # Errors
    /// Returns an error when the holder is not loaded.
    pub fn refresh_cached_data(&self, id: &str) -> Result<ReloadAll<CachedEntry>> {
        Ok(self.require_cache(id)?.reload_all())
    }

    /// Re-apply the default overlay on every cached permission view.
    pub fn invalidate_permission_calculators(&self) {
        let caches = self.inner.caches.read().values().cloned().collect::<Vec<_>>();
        for cache in caches {
            cache.invalidate_permission_calculators();
        }
    }

    /// Remove expired nodes from every loaded holder; returns how many were removed.
    pub fn audit_all(&self) -> usize {
        let mut removed = 0;
        for id in self.inner.arena.ids() {
            if let Some(holder) = self.inner.arena.get(&id) {
                removed += holder.audit_temporary_permissions();
            }
        }
        if removed > 0 {
            tracing::info!(removed, "audit sweep removed expired nodes");
        }
        removed
    }

    /// Forget cached entries that were not read within the configured idle time.
    pub fn evict_idle_caches(&self) -> usize {
        let caches = self.inner.caches.read().values().cloned().collect::<Vec<_>>();
        let evicted = caches.iter().map(|cache| cache.evict_idle(self.inner.cache_idle)).sum::<usize>();
        if evicted > 0 {
            tracing::info!(evicted, "evicted idle cache entries");
        }
        evicted
    }

    /// Run [`Self::audit_all`] and [`Self::evict_idle_caches`] every `interval`
    /// on `handle`. The task stops once every clone of the kernel has been dropped.
    #[must_use]
    pub fn spawn_audit_task(&self, handle: &Handle, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("kernel dropped; audit task exiting");
                    return;
                };
                let kernel = PermissionKernel { inner };
                kernel.audit_all();
                kernel.evict_idle_caches();
            }
        })
    }
}

fn normalize_id(raw: &str) -> Result<String> {
    let id = raw.trim().to_lowercase();
    if id.is_empty() {
        return Err(anyhow!("holder id MUST be non-empty"));
    }
    Ok(id)
}
