//! Multi-threaded pool scenarios

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use store_arena::{ArenaAllocator, Error};

#[test]
fn concurrent_threads_get_distinct_arenas() {
    // Goal: four threads holding bindings at once never share an arena
    let pool = ArenaAllocator::with_pool_size(4);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let ptr = pool.allocate(256).unwrap();
                let arena = pool.look_up(ptr.as_ptr()).unwrap();
                assert_eq!(pool.current_arena(), Some(arena));
                // Hold the binding until every thread is bound
                barrier.wait();
                unsafe { pool.free(ptr.as_ptr(), 256) };
                arena
            })
        })
        .collect();

    let mut arenas: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    arenas.sort_unstable();
    arenas.dedup();
    assert_eq!(arenas.len(), 4);

    // Thread exit returned every arena
    let status = pool.status();
    assert_eq!(status.free.len(), 4);
    assert!(status.bound.is_empty());
}

#[test]
fn fifth_thread_fails_until_an_arena_is_released() {
    // Goal: exhaustion is reported immediately and clears after a release
    let pool = ArenaAllocator::with_pool_size(4);
    let bound = Arc::new(Barrier::new(5));
    let mut releases = Vec::new();
    let mut handles = Vec::new();

    for _ in 0..4 {
        let pool = pool.clone();
        let bound = bound.clone();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        releases.push(release_tx);
        handles.push(thread::spawn(move || {
            let arena = pool.request_arena().unwrap();
            bound.wait();
            release_rx.recv().unwrap();
            assert_eq!(pool.release_arena(), Some(arena));
            arena
        }));
    }
    bound.wait();

    let fifth = pool.clone();
    let result = thread::spawn(move || fifth.request_arena()).join().unwrap();
    assert!(matches!(result, Err(Error::PoolExhausted { pool_size: 4 })));

    // Release one binding and wait for it to land back in the free set
    releases[0].send(()).unwrap();
    let released = handles.remove(0).join().unwrap();

    let sixth = pool.clone();
    let rebound = thread::spawn(move || {
        let arena = sixth.request_arena().unwrap();
        sixth.release_arena();
        arena
    })
    .join()
    .unwrap();
    assert_eq!(rebound, released);

    for release in &releases[1..] {
        release.send(()).unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.status().free.len(), 4);
}

#[test]
fn reused_arena_is_never_bound_twice() {
    // Goal: across many short-lived threads, no arena is handed to two live threads
    let pool = ArenaAllocator::with_pool_size(2);

    for _ in 0..16 {
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let arena = pool.request_arena().unwrap();
                    barrier.wait();
                    let status = pool.status();
                    assert!(!status.free.contains(&arena));
                    arena
                })
            })
            .collect();

        let arenas: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_ne!(arenas[0], arenas[1]);
    }
}

#[test]
fn memory_freed_on_another_thread() {
    // Goal: a pointer allocated on one thread can be released from another
    let pool = ArenaAllocator::with_pool_size(2);
    let worker = pool.clone();
    let addr = thread::spawn(move || worker.allocate(512).unwrap().as_ptr() as usize)
        .join()
        .unwrap();

    unsafe { pool.free(addr as *mut u8, 512) };
    assert_eq!(pool.current_arena(), None);
}
