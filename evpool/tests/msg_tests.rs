// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words bsend cbsend

//! Cross-thread message matrix: unicast, broadcast (plain, synchronous,
//! sleeping-synchronous), and callback broadcast (plain and one-by-one) on
//! single-worker and 16-worker pools.

use evpool::{MsgFlags, PoolConfig, ThreadPool};
use pretty_assertions::assert_eq;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const UNSET: usize = usize::MAX;

fn mark_array(n: usize) -> Arc<Vec<AtomicUsize>> {
    Arc::new((0..n).map(|_| AtomicUsize::new(UNSET)).collect())
}

fn pool_of(n: usize) -> ThreadPool {
    let pool = ThreadPool::new(PoolConfig { threads_max: n, bind_to_cpu: false }).unwrap();
    pool.spawn_threads(false).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    pool
}

fn settle() {
    std::thread::sleep(Duration::from_millis(500));
}

fn check_marks(marks: &[AtomicUsize], n: usize) {
    for (i, slot) in marks.iter().take(n).enumerate() {
        assert_eq!(slot.load(Ordering::Acquire), i, "worker {i} did not run the callback");
    }
}

fn run_unicast(threads: usize) {
    let pool = pool_of(threads);
    let marks = mark_array(threads);
    for i in 0..threads {
        let marks = Arc::clone(&marks);
        pool.worker(i)
            .send_msg(None, MsgFlags::empty(), move |w| {
                let num = w.thread_num().expect("message ran off-pool");
                marks[num].store(num, Ordering::Release);
            })
            .unwrap();
    }
    settle();
    check_marks(&marks, threads);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn unicast_one_worker() {
    run_unicast(1);
}

#[test]
fn unicast_sixteen_workers() {
    run_unicast(16);
}

#[test]
fn unicast_to_stopped_worker_fails_without_force() {
    let pool = ThreadPool::new(PoolConfig { threads_max: 1, bind_to_cpu: false }).unwrap();
    // No threads spawned: the worker is not running.
    let err = pool.worker(0).send_msg(None, MsgFlags::empty(), |_w| {}).unwrap_err();
    assert!(matches!(err, evpool::Error::WorkerDown));

    // FORCE dispatches inline instead.
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    pool.worker(0)
        .send_msg(None, MsgFlags::FORCE, move |_w| {
            ran2.store(1, Ordering::Release);
        })
        .unwrap();
    assert_eq!(ran.load(Ordering::Acquire), 1);
}

fn run_bsend(threads: usize, flags: MsgFlags) {
    let pool = pool_of(threads);
    let marks = mark_array(threads);
    let marks_cb = Arc::clone(&marks);
    let report = pool
        .bsend(None, flags, move |w| {
            let num = w.thread_num().expect("broadcast ran off-pool");
            marks_cb[num].store(num, Ordering::Release);
        })
        .unwrap();
    if !flags.contains(MsgFlags::SYNC) {
        settle();
    }
    assert_eq!(report.sent, threads);
    assert_eq!(report.errors, 0);
    check_marks(&marks, threads);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn bsend_plain_one_worker() {
    run_bsend(1, MsgFlags::empty());
}

#[test]
fn bsend_plain_sixteen_workers() {
    run_bsend(16, MsgFlags::empty());
}

#[test]
fn bsend_sync_sixteen_workers() {
    run_bsend(16, MsgFlags::SYNC);
}

#[test]
fn bsend_sync_usleep_sixteen_workers() {
    run_bsend(16, MsgFlags::SYNC | MsgFlags::SYNC_USLEEP);
}

fn run_cbsend(threads: usize, flags: MsgFlags) {
    let pool = pool_of(threads);
    // One mark per worker plus one for the completion callback.
    let marks = mark_array(threads + 1);
    let marks_cb = Arc::clone(&marks);
    let marks_done = Arc::clone(&marks);
    let expected = threads;
    let src = pool.worker(0);
    pool.cbsend(
        Some(&src),
        flags,
        move |w| {
            let num = w.thread_num().expect("broadcast ran off-pool");
            marks_cb[num].store(num, Ordering::Release);
        },
        move |_w, sent, errors| {
            assert_eq!(sent, expected);
            assert_eq!(errors, 0);
            marks_done[expected].store(expected, Ordering::Release);
        },
    )
    .unwrap();
    settle();
    check_marks(&marks, threads + 1);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn cbsend_plain_sixteen_workers() {
    run_cbsend(16, MsgFlags::empty());
}

#[test]
fn cbsend_one_by_one_sixteen_workers() {
    run_cbsend(16, MsgFlags::ONE_BY_ONE);
}

#[test]
fn cbsend_one_worker_runs_inline() {
    let pool = pool_of(1);
    let marks = mark_array(2);
    let marks_cb = Arc::clone(&marks);
    let marks_done = Arc::clone(&marks);
    let src = pool.worker(0);
    pool.cbsend(
        Some(&src),
        MsgFlags::empty(),
        move |w| {
            let num = w.thread_num().unwrap();
            marks_cb[num].store(num, Ordering::Release);
        },
        move |_w, sent, errors| {
            assert_eq!((sent, errors), (1, 0));
            marks_done[1].store(1, Ordering::Release);
        },
    )
    .unwrap();
    check_marks(&marks, 2);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn one_by_one_is_serialized() {
    // Each callback observes the number of workers that ran before it; a
    // serialized traversal means strictly increasing observation counts.
    let pool = pool_of(8);
    let progress = Arc::new(AtomicUsize::new(0));
    let order_ok = Arc::new(AtomicUsize::new(1));
    let progress_cb = Arc::clone(&progress);
    let order_cb = Arc::clone(&order_ok);
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let src = pool.worker(0);
    pool.cbsend(
        Some(&src),
        MsgFlags::ONE_BY_ONE,
        move |_w| {
            let before = progress_cb.fetch_add(1, Ordering::AcqRel);
            // Another worker running concurrently would break the count.
            if before >= 8 {
                order_cb.store(0, Ordering::Release);
            }
            std::thread::sleep(Duration::from_millis(10));
        },
        move |_w, sent, errors| {
            assert_eq!((sent, errors), (8, 0));
            drop(done_tx.send(()));
        },
    )
    .unwrap();
    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(progress.load(Ordering::Acquire), 8);
    assert_eq!(order_ok.load(Ordering::Acquire), 1);
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn async_op_carries_arguments() {
    let pool = pool_of(2);
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_cb = Arc::clone(&seen);
    let mut aop = evpool::AsyncOp::new(Some(pool.worker(1)), move |w, args| {
        assert_eq!(w.thread_num(), Some(1));
        seen_cb.store(args[0] as usize + args[5] as usize, Ordering::Release);
    })
    .unwrap();
    aop.set_arg(0, 40);
    aop.set_arg(5, 2);
    assert_eq!(aop.arg(0), 40);
    assert_eq!(aop.arg(usize::from(u16::MAX)), 0);
    aop.dispatch(None);
    settle();
    assert_eq!(seen.load(Ordering::Acquire), 42);
    pool.shutdown();
    pool.shutdown_wait();
}
