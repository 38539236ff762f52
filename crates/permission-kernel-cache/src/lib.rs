//! Context-keyed caching of resolved holder views.

mod cached;
mod manager;
mod scheduler;

pub use cached::{CachedData, CachedEntry, ResolutionSource};
pub use manager::{CacheManager, Calculator, EntryState, ReloadAll, ReloadHandle};
pub use scheduler::{ManualScheduler, Scheduler, Task, TokioScheduler};
