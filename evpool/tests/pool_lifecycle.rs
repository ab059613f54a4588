// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Pool construction, accessors, and shutdown.

use evpool::{PoolConfig, ThreadPool};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn settle() {
    std::thread::sleep(Duration::from_millis(300));
}

#[test]
fn single_worker_lifecycle() {
    let pool = ThreadPool::new(PoolConfig { threads_max: 1, bind_to_cpu: true }).unwrap();
    pool.spawn_threads(false).unwrap();
    settle();

    assert_eq!(pool.thread_count_max(), 1);
    assert_eq!(pool.thread_count(), 1);
    assert!(pool.worker(0).is_running());

    pool.shutdown();
    pool.shutdown_wait();
    assert_eq!(pool.thread_count(), 0);
    assert!(!pool.worker(0).is_running());
}

#[test]
fn sixteen_worker_accessors() {
    let pool = ThreadPool::new(PoolConfig { threads_max: 16, bind_to_cpu: true }).unwrap();
    pool.spawn_threads(false).unwrap();
    settle();

    assert_eq!(pool.thread_count_max(), 16);
    assert_eq!(pool.thread_count(), 16);
    for i in 0..16 {
        assert_eq!(pool.worker(i).thread_num(), Some(i));
    }
    // Out-of-range indexes clamp to the last worker.
    assert_eq!(pool.worker(100).thread_num(), Some(15));
    // Worker 0 is pinned to CPU 0 when affinity is on.
    assert_eq!(pool.worker(0).cpu_id(), 0);
    // The pool virtual thread is not an indexed worker.
    assert_eq!(pool.pvt().thread_num(), None);
    // Round-robin hands out some worker every time.
    for _ in 0..40 {
        assert!(pool.worker_rr().thread_num().is_some());
    }
    // The test thread is not a pool thread.
    assert!(ThreadPool::current().is_none());
    // Workers know their pool.
    assert!(pool.worker(0).pool().is_some());

    pool.shutdown();
    pool.shutdown_wait();
    assert_eq!(pool.thread_count(), 0);
}

#[test]
fn threads_max_zero_defaults_to_cpu_count() {
    let pool = ThreadPool::new(PoolConfig { threads_max: 0, bind_to_cpu: false }).unwrap();
    assert!(pool.thread_count_max() >= 1);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn ticks_advance_while_working() {
    let pool = ThreadPool::new(PoolConfig { threads_max: 1, bind_to_cpu: false }).unwrap();
    pool.spawn_threads(false).unwrap();
    settle();

    let wkr = pool.worker(0);
    let before = wkr.tick_count();
    wkr.send_msg(None, evpool::MsgFlags::empty(), |_w| {}).unwrap();
    settle();
    assert!(wkr.tick_count() > before);

    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn shutdown_token_outlives_nothing() {
    let pool = ThreadPool::new(PoolConfig { threads_max: 2, bind_to_cpu: false }).unwrap();
    pool.spawn_threads(false).unwrap();
    settle();

    let token = pool.shutdown_token();
    token.request_shutdown();
    pool.shutdown_wait();
    assert_eq!(pool.thread_count(), 0);

    // After the pool is gone the token is inert.
    drop(pool);
    token.request_shutdown();
}
