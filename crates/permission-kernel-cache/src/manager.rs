use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use permission_kernel_core::QueryOptions;
use tokio::sync::Notify;

use crate::scheduler::Scheduler;

/// Computes a fresh value for one query-options key.
pub trait Calculator<T>: Send + Sync {
    fn calculate(&self, options: &QueryOptions) -> T;
}

impl<T, F> Calculator<T> for F
where
    F: Fn(&QueryOptions) -> T + Send + Sync,
{
    fn calculate(&self, options: &QueryOptions) -> T {
        self(options)
    }
}

/// Lifecycle of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Absent,
    Computing,
    Ready,
    /// Dropped by a reload; readers block until the reload's computation lands.
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Idle,
    Queued,
    Running { rerun: bool },
}

struct SlotState<T> {
    phase: EntryState,
    value: Option<Arc<T>>,
    task: TaskState,
    /// Set once the slot has been removed from its manager by an invalidation.
    detached: bool,
    /// Reload handles not yet picked up by a pass.
    completions: Vec<Arc<Completion<T>>>,
    /// Number of reloads requested so far.
    reloads: u64,
    /// Highest reload count covered by a finished pass, and that pass's value.
    served: u64,
    served_value: Option<Arc<T>>,
    touched: Instant,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                phase: EntryState::Absent,
                value: None,
                task: TaskState::Idle,
                detached: false,
                completions: Vec::new(),
                reloads: 0,
                served: 0,
                served_value: None,
                touched: Instant::now(),
            }),
            ready: Condvar::new(),
        }
    }
}

struct Completion<T> {
    value: Mutex<Option<Arc<T>>>,
    done: Condvar,
    notify: Notify,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self { value: Mutex::new(None), done: Condvar::new(), notify: Notify::new() }
    }

    fn complete(&self, value: Arc<T>) {
        *self.value.lock() = Some(value);
        self.done.notify_all();
        self.notify.notify_waiters();
    }
}

/// Completion handle returned by [`CacheManager::reload`].
///
/// The recomputation always runs to completion whether or not the handle is
/// awaited. If the entry is invalidated meanwhile, the handle still resolves
/// with the value that was computed, even though it was never installed.
pub struct ReloadHandle<T> {
    completion: Arc<Completion<T>>,
}

impl<T> Clone for ReloadHandle<T> {
    fn clone(&self) -> Self {
        Self { completion: Arc::clone(&self.completion) }
    }
}

impl<T> fmt::Debug for ReloadHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadHandle").field("complete", &self.is_complete()).finish()
    }
}

impl<T> ReloadHandle<T> {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completion.value.lock().is_some()
    }

    #[must_use]
    pub fn try_get(&self) -> Option<Arc<T>> {
        self.completion.value.lock().clone()
    }

    /// Blocks the calling thread until the reload completes.
    #[must_use]
    pub fn wait(&self) -> Arc<T> {
        let mut value = self.completion.value.lock();
        loop {
            if let Some(value) = value.as_ref() {
                return Arc::clone(value);
            }
            self.completion.done.wait(&mut value);
        }
    }

    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<T>> {
        let mut value = self.completion.value.lock();
        if value.is_none() {
            let _ = self.completion.done.wait_while_for(&mut value, |value| value.is_none(), timeout);
        }
        value.clone()
    }

    /// Awaits completion without blocking an async worker.
    pub async fn completed(&self) -> Arc<T> {
        loop {
            let notified = self.completion.notify.notified();
            if let Some(value) = self.try_get() {
                return value;
            }
            notified.await;
        }
    }
}

/// Handles for every entry reloaded by [`CacheManager::reload_all`].
pub struct ReloadAll<T> {
    handles: Vec<(QueryOptions, ReloadHandle<T>)>,
}

impl<T> fmt::Debug for ReloadAll<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadAll").field("entries", &self.handles.len()).finish()
    }
}

impl<T> ReloadAll<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.handles.iter().all(|(_, handle)| handle.is_complete())
    }

    #[must_use]
    pub fn wait(&self) -> Vec<(QueryOptions, Arc<T>)> {
        self.handles.iter().map(|(options, handle)| (options.clone(), handle.wait())).collect()
    }

    pub async fn completed(&self) -> Vec<(QueryOptions, Arc<T>)> {
        let mut values = Vec::with_capacity(self.handles.len());
        for (options, handle) in &self.handles {
            values.push((options.clone(), handle.completed().await));
        }
        values
    }
}

/// Per-holder cache of one derived view, keyed by query options.
///
/// Each key owns its own slot lock, so unrelated keys never contend. Background
/// recomputation for a key is single-flight: triggers that arrive while a task
/// is queued coalesce into it, and triggers that arrive while it runs queue
/// exactly one more pass once it has installed its value.
pub struct CacheManager<T> {
    label: String,
    calculator: Arc<dyn Calculator<T>>,
    scheduler: Arc<dyn Scheduler>,
    slots: RwLock<HashMap<QueryOptions, Arc<Slot<T>>>>,
}

impl<T> fmt::Debug for CacheManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("label", &self.label)
            .field("entries", &self.slots.read().len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> CacheManager<T> {
    #[must_use]
    pub fn new(label: &str, calculator: Arc<dyn Calculator<T>>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { label: label.to_string(), calculator, scheduler, slots: RwLock::new(HashMap::new()) }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn slot(&self, options: &QueryOptions) -> Arc<Slot<T>> {
        if let Some(slot) = self.slots.read().get(options) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(options.clone()).or_insert_with(|| Arc::new(Slot::new())))
    }

    /// Cached value for `options`, computing it on the caller's thread on a miss.
    ///
    /// Blocks only while the entry is `Invalidated` by a pending reload.
    #[must_use]
    pub fn get(&self, options: &QueryOptions) -> Arc<T> {
        loop {
            let slot = self.slot(options);
            if let Some(value) = self.get_from(&slot, options) {
                return value;
            }
        }
    }

    fn get_from(&self, slot: &Slot<T>, options: &QueryOptions) -> Option<Arc<T>> {
        let mut state = slot.state.lock();
        state.touched = Instant::now();
        let target = state.reloads;
        while !state.detached && state.phase == EntryState::Invalidated && state.served < target {
            slot.ready.wait(&mut state);
        }
        if state.detached {
            return None;
        }
        match state.phase {
            EntryState::Ready => {
                if let Some(value) = state.value.as_ref() {
                    return Some(Arc::clone(value));
                }
            }
            // A later reload is pending; the pass covering ours has finished.
            EntryState::Invalidated => {
                if let Some(value) = state.served_value.as_ref() {
                    return Some(Arc::clone(value));
                }
            }
            EntryState::Absent | EntryState::Computing => {}
        }
        if state.phase != EntryState::Invalidated {
            state.phase = EntryState::Computing;
        }
        drop(state);

        let value = Arc::new(self.calculator.calculate(options));

        let mut state = slot.state.lock();
        if !state.detached && state.phase == EntryState::Computing {
            state.phase = EntryState::Ready;
            state.value = Some(Arc::clone(&value));
            drop(state);
            slot.ready.notify_all();
            tracing::debug!(cache = %self.label, context = %options.context(), "installed value on miss");
        }
        Some(value)
    }

    /// Current value without computing or blocking.
    #[must_use]
    pub fn peek(&self, options: &QueryOptions) -> Option<Arc<T>> {
        let slot = self.slots.read().get(options).cloned()?;
        let state = slot.state.lock();
        match state.phase {
            EntryState::Ready => state.value.clone(),
            _ => None,
        }
    }

    /// Fresh value that bypasses and leaves the cache untouched.
    #[must_use]
    pub fn calculate(&self, options: &QueryOptions) -> T {
        self.calculator.calculate(options)
    }

    /// Schedules a background refresh; readers keep seeing the previous value
    /// until it is replaced.
    pub fn recalculate(&self, options: &QueryOptions) {
        let slot = self.slot(options);
        let mut state = slot.state.lock();
        if state.phase == EntryState::Absent {
            state.phase = EntryState::Computing;
        }
        let schedule = Self::request_run(&mut state);
        drop(state);
        if schedule {
            self.spawn(options, slot);
        }
    }

    /// Drops the current value and schedules a recomputation. Readers block
    /// until it lands; the returned handle resolves at the same moment.
    pub fn reload(&self, options: &QueryOptions) -> ReloadHandle<T> {
        let slot = self.slot(options);
        let completion = Arc::new(Completion::new());
        let mut state = slot.state.lock();
        state.phase = EntryState::Invalidated;
        state.value = None;
        state.reloads += 1;
        state.completions.push(Arc::clone(&completion));
        let schedule = Self::request_run(&mut state);
        drop(state);
        if schedule {
            self.spawn(options, slot);
        }
        ReloadHandle { completion }
    }

    fn request_run(state: &mut SlotState<T>) -> bool {
        match state.task {
            TaskState::Idle => {
                state.task = TaskState::Queued;
                true
            }
            TaskState::Queued => false,
            TaskState::Running { .. } => {
                state.task = TaskState::Running { rerun: true };
                false
            }
        }
    }

    fn spawn(&self, options: &QueryOptions, slot: Arc<Slot<T>>) {
        tracing::debug!(cache = %self.label, context = %options.context(), "scheduled recomputation");
        Pass {
            label: self.label.clone(),
            calculator: Arc::clone(&self.calculator),
            scheduler: Arc::clone(&self.scheduler),
            slot,
            options: options.clone(),
        }
        .schedule();
    }

    pub fn recalculate_all(&self) {
        for options in self.known_keys() {
            self.recalculate(&options);
        }
    }

    pub fn reload_all(&self) -> ReloadAll<T> {
        let handles = self.known_keys().into_iter().map(|options| {
            let handle = self.reload(&options);
            (options, handle)
        });
        ReloadAll { handles: handles.collect() }
    }

    /// Forgets the entry. No recomputation is scheduled; blocked readers wake
    /// and compute for themselves.
    pub fn invalidate(&self, options: &QueryOptions) {
        let removed = self.slots.write().remove(options);
        if let Some(slot) = removed {
            detach(&slot);
        }
    }

    pub fn invalidate_all(&self) {
        let drained = std::mem::take(&mut *self.slots.write());
        for slot in drained.values() {
            detach(slot);
        }
    }

    /// Forgets entries no reader has touched for `max_idle`. Entries with a
    /// queued or running pass, a pending reload, or a reader computing them
    /// are kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut evicted = Vec::new();
        self.slots.write().retain(|_, slot| {
            let state = slot.state.lock();
            let idle = state.task == TaskState::Idle
                && matches!(state.phase, EntryState::Ready | EntryState::Absent)
                && state.touched.elapsed() >= max_idle;
            if idle {
                evicted.push(Arc::clone(slot));
            }
            !idle
        });
        for slot in &evicted {
            detach(slot);
        }
        if !evicted.is_empty() {
            tracing::debug!(cache = %self.label, evicted = evicted.len(), "evicted idle entries");
        }
        evicted.len()
    }

    #[must_use]
    pub fn entry_state(&self, options: &QueryOptions) -> EntryState {
        self.slots.read().get(options).map_or(EntryState::Absent, |slot| slot.state.lock().phase)
    }

    #[must_use]
    pub fn known_keys(&self) -> Vec<QueryOptions> {
        self.slots.read().keys().cloned().collect()
    }

    /// Every entry currently holding a ready value.
    #[must_use]
    pub fn ready_values(&self) -> Vec<(QueryOptions, Arc<T>)> {
        let slots = self.slots.read().iter().map(|(key, slot)| (key.clone(), Arc::clone(slot))).collect::<Vec<_>>();
        slots
            .into_iter()
            .filter_map(|(options, slot)| {
                let state = slot.state.lock();
                match (state.phase, state.value.as_ref()) {
                    (EntryState::Ready, Some(value)) => Some((options, Arc::clone(value))),
                    _ => None,
                }
            })
            .collect()
    }
}

fn detach<T>(slot: &Slot<T>) {
    let mut state = slot.state.lock();
    state.detached = true;
    state.phase = EntryState::Absent;
    state.value = None;
    drop(state);
    slot.ready.notify_all();
}

/// One background recomputation of a single key.
struct Pass<T> {
    label: String,
    calculator: Arc<dyn Calculator<T>>,
    scheduler: Arc<dyn Scheduler>,
    slot: Arc<Slot<T>>,
    options: QueryOptions,
}

impl<T: Send + Sync + 'static> Pass<T> {
    fn schedule(self) {
        let scheduler = Arc::clone(&self.scheduler);
        scheduler.schedule(Box::new(move || self.run()));
    }

    /// Computes once, installs, and resolves the reload handles present when
    /// the pass started. A trigger that arrived meanwhile queues one more pass.
    fn run(self) {
        let (epoch, waiting) = {
            let mut state = self.slot.state.lock();
            state.task = TaskState::Running { rerun: false };
            (state.reloads, std::mem::take(&mut state.completions))
        };

        let value = Arc::new(self.calculator.calculate(&self.options));

        let mut state = self.slot.state.lock();
        let rerun = state.task == (TaskState::Running { rerun: true });
        state.served = epoch;
        state.served_value = Some(Arc::clone(&value));
        // A reload issued during the pass keeps readers waiting for the next one.
        let installed = !state.detached && state.reloads == epoch;
        if installed {
            state.phase = EntryState::Ready;
            state.value = Some(Arc::clone(&value));
        }
        state.task = if rerun { TaskState::Queued } else { TaskState::Idle };
        drop(state);

        self.slot.ready.notify_all();
        for completion in waiting {
            completion.complete(Arc::clone(&value));
        }
        tracing::debug!(cache = %self.label, context = %self.options.context(), installed, rerun, "recomputation finished");
        if rerun {
            self.schedule();
        }
    }
}
