// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words ONESHOT evpool

//! Reactor registration matrix: read/write/timer events under each of
//! `{none, ONESHOT, DISPATCH, EDGE}`, delivery counts, and
//! delete-after-oneshot behavior. Mirrors the original pipe-driven suite.

use evpool::{Ev, EvFlags, EvKind, Event, PoolConfig, ThreadPool, TimerFlags, Worker};
use pretty_assertions::assert_eq;
use std::{
    os::fd::RawFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const MAX_DELIVERIES: usize = 12;
const TIMER_IDENT: u64 = 36_434_632;
const TIMER_INTERVAL_MS: u64 = 14;

struct Pipe {
    rd: RawFd,
    wr: RawFd,
}

impl Pipe {
    fn new() -> Self {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        Self { rd: fds[0], wr: fds[1] }
    }

    fn write_byte(&self) {
        assert_eq!(unsafe { libc::write(self.wr, [0x31u8].as_ptr().cast(), 1) }, 1);
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while unsafe { libc::read(self.rd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rd);
            libc::close(self.wr);
        }
    }
}

fn pool_of_one() -> ThreadPool {
    let pool = ThreadPool::new(PoolConfig { threads_max: 1, bind_to_cpu: false }).unwrap();
    pool.spawn_threads(false).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    pool
}

fn settle() {
    std::thread::sleep(Duration::from_millis(500));
}

/// Counts deliveries, disabling the registration once the cap is reached
/// so level-triggered sources stop storming.
fn counting_cb(
    expected_kind: EvKind,
    counter: Arc<AtomicUsize>,
) -> impl Fn(&Arc<Worker>, &Event) + Send + Sync + 'static {
    move |wkr, ev| {
        assert_eq!(ev.kind, expected_kind);
        assert_ne!(ev.data.limit(), 0);
        let n = counter.fetch_add(1, Ordering::AcqRel) + 1;
        if n >= MAX_DELIVERIES {
            let _ = wkr.ev_enable(false, &Ev { kind: ev.kind, ..Ev::read(EvFlags::empty()) }, ev.ident);
        }
    }
}

fn run_pipe_case(kind: EvKind, flags: EvFlags, expected: usize, remove_ok: bool) {
    let pool = pool_of_one();
    let pipe = Pipe::new();
    let wkr = pool.worker(0);
    let counter = Arc::new(AtomicUsize::new(0));

    let ident = match kind {
        EvKind::Read => pipe.rd as u64,
        EvKind::Write => pipe.wr as u64,
        EvKind::Timer => unreachable!(),
    };
    let ev = Ev { kind, flags, fflags: TimerFlags::empty(), data: 0 };
    wkr.ev_add(&ev, ident, Arc::new(counting_cb(kind, Arc::clone(&counter)))).unwrap();

    if kind == EvKind::Read {
        pipe.write_byte();
    }
    settle();
    assert_eq!(counter.load(Ordering::Acquire), expected);

    pipe.drain();
    if remove_ok {
        wkr.ev_del(kind, ident).unwrap();
    }
    // A second (or post-oneshot) delete has nothing left to remove.
    assert!(wkr.ev_del(kind, ident).is_err());

    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn read_level_triggered() {
    run_pipe_case(EvKind::Read, EvFlags::empty(), MAX_DELIVERIES, true);
}

#[test]
fn read_oneshot() {
    run_pipe_case(EvKind::Read, EvFlags::ONESHOT, 1, false);
}

#[test]
fn read_dispatch() {
    run_pipe_case(EvKind::Read, EvFlags::DISPATCH, 1, true);
}

#[test]
fn read_edge() {
    run_pipe_case(EvKind::Read, EvFlags::EDGE, 1, true);
}

#[test]
fn write_level_triggered() {
    run_pipe_case(EvKind::Write, EvFlags::empty(), MAX_DELIVERIES, true);
}

#[test]
fn write_oneshot() {
    run_pipe_case(EvKind::Write, EvFlags::ONESHOT, 1, false);
}

#[test]
fn write_dispatch() {
    run_pipe_case(EvKind::Write, EvFlags::DISPATCH, 1, true);
}

fn run_timer_case(flags: EvFlags, expected: usize, remove_ok: bool) {
    let pool = pool_of_one();
    let wkr = pool.worker(0);
    let counter = Arc::new(AtomicUsize::new(0));

    let ev = Ev::timer(flags, TimerFlags::empty(), TIMER_INTERVAL_MS);
    let counter_cb = Arc::clone(&counter);
    wkr.ev_add(
        &ev,
        TIMER_IDENT,
        Arc::new(move |wkr: &Arc<Worker>, ev: &Event| {
            assert_eq!(ev.kind, EvKind::Timer);
            assert_eq!(ev.ident, TIMER_IDENT);
            let n = counter_cb.fetch_add(1, Ordering::AcqRel) + 1;
            if n >= MAX_DELIVERIES {
                let _ = wkr.ev_enable(
                    false,
                    &Ev::timer(EvFlags::empty(), TimerFlags::empty(), 0),
                    ev.ident,
                );
            }
        }),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(counter.load(Ordering::Acquire), expected);

    if remove_ok {
        wkr.ev_del(EvKind::Timer, TIMER_IDENT).unwrap();
    }
    assert!(wkr.ev_del(EvKind::Timer, TIMER_IDENT).is_err());

    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn timer_periodic() {
    run_timer_case(EvFlags::empty(), MAX_DELIVERIES, true);
}

#[test]
fn timer_oneshot() {
    run_timer_case(EvFlags::ONESHOT, 1, false);
}

#[test]
fn timer_dispatch() {
    run_timer_case(EvFlags::DISPATCH, 1, true);
}

#[test]
fn timer_edge() {
    run_timer_case(EvFlags::EDGE, MAX_DELIVERIES, true);
}

#[test]
fn pipe_ping_pong() {
    // Register READ on a pipe, write one byte, observe exactly one
    // callback that reads the byte back.
    let pool = pool_of_one();
    let pipe = Pipe::new();
    let wkr = pool.worker(0);
    let (tx, rx) = std::sync::mpsc::channel::<u8>();

    let rd = pipe.rd;
    wkr.ev_add(
        &Ev::read(EvFlags::empty()),
        rd as u64,
        Arc::new(move |_wkr: &Arc<Worker>, ev: &Event| {
            assert!(ev.data.limit() >= 1);
            let mut byte = 0u8;
            let n = unsafe { libc::read(rd, (&raw mut byte).cast(), 1) };
            if n == 1 {
                drop(tx.send(byte));
            }
        }),
    )
    .unwrap();

    pipe.write_byte();
    let byte = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(byte, 0x31);

    wkr.ev_del(EvKind::Read, rd as u64).unwrap();
    pool.shutdown();
    pool.shutdown_wait();
}

#[test]
fn pvt_events_are_served_by_real_workers() {
    // A registration on the pool virtual thread is picked up by some
    // worker even though the PVT itself never runs.
    let pool = ThreadPool::new(PoolConfig { threads_max: 4, bind_to_cpu: false }).unwrap();
    pool.spawn_threads(false).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let pipe = Pipe::new();
    let (tx, rx) = std::sync::mpsc::channel::<usize>();
    let rd = pipe.rd;
    pool.pvt()
        .ev_add(
            &Ev::read(EvFlags::ONESHOT),
            rd as u64,
            Arc::new(move |wkr: &Arc<Worker>, _ev: &Event| {
                let mut byte = 0u8;
                drop(unsafe { libc::read(rd, (&raw mut byte).cast(), 1) });
                drop(tx.send(wkr.thread_num().expect("pvt event ran off-pool")));
            }),
        )
        .unwrap();

    pipe.write_byte();
    let served_by = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(served_by < 4);

    pool.shutdown();
    pool.shutdown_wait();
}
