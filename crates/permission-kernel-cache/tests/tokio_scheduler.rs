use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use permission_kernel_cache::{CacheManager, EntryState, Scheduler, TokioScheduler};
use permission_kernel_core::{ContextSet, QueryOptions};

fn counting_manager(delay: Duration) -> (Arc<CacheManager<usize>>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let calculator = move |_: &QueryOptions| {
        std::thread::sleep(delay);
        counter.fetch_add(1, Ordering::SeqCst) + 1
    };
    let Some(scheduler) = TokioScheduler::current() else {
        panic!("tests run inside a tokio runtime");
    };
    let scheduler: Arc<dyn Scheduler> = Arc::new(scheduler);
    let manager: Arc<CacheManager<usize>> = Arc::new(CacheManager::new("steve", Arc::new(calculator), scheduler));
    (manager, calls)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_completes_on_blocking_pool_and_unblocks_readers() {
    let (manager, calls) = counting_manager(Duration::from_millis(20));
    let options = QueryOptions::new(ContextSet::of("world", "nether"));
    assert_eq!(*manager.get(&options), 1);

    let handle = manager.reload(&options);
    let reader = {
        let manager = Arc::clone(&manager);
        let options = options.clone();
        tokio::task::spawn_blocking(move || *manager.get(&options))
    };

    assert_eq!(*handle.completed().await, 2);
    match reader.await {
        Ok(value) => assert_eq!(value, 2),
        Err(err) => panic!("reader failed: {err}"),
    }
    assert_eq!(manager.entry_state(&options), EntryState::Ready);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_block_during_recalculate() {
    let (manager, calls) = counting_manager(Duration::from_millis(50));
    let options = QueryOptions::global();
    assert_eq!(*manager.get(&options), 1);

    for _ in 0..8 {
        manager.recalculate(&options);
    }
    let stale = {
        let manager = Arc::clone(&manager);
        let options = options.clone();
        tokio::task::spawn_blocking(move || (0..100).map(|_| *manager.get(&options)).collect::<Vec<_>>())
    };
    let seen = match stale.await {
        Ok(seen) => seen,
        Err(err) => panic!("reader failed: {err}"),
    };
    assert!(seen.iter().all(|value| *value <= 3));

    let settled = manager.reload(&options).completed().await;
    assert!(*settled >= 2);
    assert!(calls.load(Ordering::SeqCst) <= 4);
}
