//! Resetting and destroying the caller's own arena under the jemalloc global allocator

use std::thread;
use store_arena::ArenaAllocator;

#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

// Untagged allocations of a bound thread land in its pool arena
fn churn_heap(count: usize) -> usize {
    let boxes: Vec<Box<[u8; 48]>> = (0..count).map(|i| Box::new([i as u8; 48])).collect();
    boxes.iter().map(|b| b[47] as usize).sum()
}

#[test]
fn reset_own_arena_keeps_binding_intact() {
    // Goal: the pool's own bookkeeping survives a reset of the caller's arena
    let pool = ArenaAllocator::with_pool_size(2);
    let worker = pool.clone();

    let (own, after_reset, after_churn) = thread::spawn(move || {
        let own = worker.request_arena().unwrap();
        churn_heap(1_000);

        worker.reset_arena(own).unwrap();
        let after_reset = worker.current_arena();
        churn_heap(20_000);
        let after_churn = worker.current_arena();
        (own, after_reset, after_churn)
    })
    .join()
    .unwrap();

    assert_eq!(after_reset, Some(own));
    assert_eq!(after_churn, Some(own));

    let status = pool.status();
    assert_eq!(status.created, 2);
    assert_eq!(status.free.len(), 2);
    assert!(status.bound.is_empty());
}

#[test]
fn destroy_own_arena_then_rebind() {
    // Goal: destroying the caller's arena leaves the cache and pool usable
    let pool = ArenaAllocator::with_pool_size(2);
    let worker = pool.clone();

    let (unbound, rebound, still_bound) = thread::spawn(move || {
        let own = worker.request_arena().unwrap();
        churn_heap(1_000);

        worker.destroy_arena(own).unwrap();
        let unbound = worker.current_arena();
        churn_heap(20_000);

        let rebound = worker.request_arena().unwrap();
        churn_heap(20_000);
        let still_bound = worker.current_arena() == Some(rebound);

        let ptr = worker.allocate(64).unwrap();
        assert_eq!(worker.look_up(ptr.as_ptr()).unwrap(), rebound);
        unsafe { worker.free(ptr.as_ptr(), 64) };
        (unbound, rebound, still_bound)
    })
    .join()
    .unwrap();

    assert_eq!(unbound, None);
    assert!(still_bound);

    let status = pool.status();
    assert_eq!(status.created, 2);
    assert!(status.free.contains(&rebound));
    assert!(status.bound.is_empty());
}
