// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGPIPE sigmask sched setaffinity NPROCESSORS sigemptyset
// cspell:words sigaddset nprocs

//! Pool lifecycle: worker construction, thread spawn/attach, CPU affinity,
//! shutdown, and the thread-local current-worker slot.

use super::worker::{Worker, PVT_THREAD_NUM};
use crate::error::{Error, Result};
use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

thread_local! {
    /// The worker owning the calling thread, when it is a pool thread.
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

/// Pool construction settings.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Worker thread count; `0` means the online CPU count.
    pub threads_max: usize,
    /// Pin each worker to one CPU, round-robin over the online set.
    pub bind_to_cpu: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { threads_max: 0, bind_to_cpu: true }
    }
}

/// Shared pool state: the worker array, the pool virtual thread, and the
/// counters every accessor reads.
pub(crate) struct PoolShared {
    pub(crate) bind_to_cpu: bool,
    pub(crate) cpu_count: usize,
    /// Descriptor-count limit used to validate read/write idents.
    pub(crate) fd_count: u64,
    pub(crate) rr_idx: AtomicUsize,
    /// Live worker threads; decremented by each thread on exit.
    pub(crate) threads_cnt: AtomicUsize,
    pub(crate) workers: Vec<Arc<Worker>>,
    pub(crate) pvt: Arc<Worker>,
}

impl std::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("threads_max", &self.workers.len())
            .field("threads_cnt", &self.threads_cnt.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Handle to an event-driven worker-thread pool.
///
/// Cloning is cheap; the pool state is shared. The expected lifecycle is
/// `new` → `spawn_threads` (optionally followed by [`attach_first`]) →
/// register work → [`shutdown`] → [`shutdown_wait`] → drop.
///
/// [`attach_first`]: Self::attach_first
/// [`shutdown`]: Self::shutdown
/// [`shutdown_wait`]: Self::shutdown_wait
#[derive(Debug, Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Builds the pool: `threads_max` workers (`0` → online CPU count) plus
    /// the pool virtual thread, each with its own multiplexer handle and
    /// message pipe; every real worker subscribes to the PVT's handle.
    pub fn new(cfg: PoolConfig) -> Result<Self> {
        let cpu_count = online_cpu_count();
        let threads_max = if cfg.threads_max == 0 { cpu_count } else { cfg.threads_max };
        let fd_count = fd_limit();

        let pvt = Worker::new(PVT_THREAD_NUM, -1)?;
        let mut workers = Vec::with_capacity(threads_max);
        let mut cur_cpu = 0usize;
        for i in 0..threads_max {
            let cpu_id = if cfg.bind_to_cpu {
                let id = (cur_cpu % cpu_count) as i32;
                cur_cpu += 1;
                id
            } else {
                -1
            };
            let wkr = Worker::new(i, cpu_id)?;
            wkr.poller.subscribe_pvt(pvt.poller.raw_fd())?;
            workers.push(wkr);
        }

        let shared = Arc::new(PoolShared {
            bind_to_cpu: cfg.bind_to_cpu,
            cpu_count,
            fd_count,
            rr_idx: AtomicUsize::new(0),
            threads_cnt: AtomicUsize::new(0),
            workers,
            pvt,
        });
        for wkr in shared.workers.iter().chain(std::iter::once(&shared.pvt)) {
            drop(wkr.pool.set(Arc::downgrade(&shared)));
        }
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    /// Spawns OS threads for the workers. With `skip_first` the caller
    /// keeps worker 0 for itself (see [`Self::attach_first`]) and it is
    /// counted as live immediately.
    ///
    /// A failed spawn leaves that worker stopped and the pool running with
    /// fewer threads; this mirrors the original's best-effort semantics.
    pub fn spawn_threads(&self, skip_first: bool) -> Result<()> {
        let shared = &self.shared;
        if skip_first {
            shared.threads_cnt.fetch_add(1, Ordering::AcqRel);
        }
        let first = usize::from(skip_first);
        for wkr in &shared.workers[first..] {
            wkr.running.store(1, Ordering::Release);
            match spawn_retry(Arc::clone(shared), Arc::clone(wkr)) {
                Ok(()) => {
                    shared.threads_cnt.fetch_add(1, Ordering::AcqRel);
                }
                Err(e) => {
                    wkr.running.store(0, Ordering::Release);
                    tracing::warn!(
                        thread_num = wkr.thread_num,
                        error = %e,
                        "failed to spawn worker thread"
                    );
                }
            }
        }
        Ok(())
    }

    /// Runs worker 0's reactor on the calling thread. Blocks until the pool
    /// shuts down (or the worker detaches).
    pub fn attach_first(&self) -> Result<()> {
        let wkr = Arc::clone(&self.shared.workers[0]);
        if wkr.is_running() {
            return Err(Error::AlreadyAttached);
        }
        wkr.running.store(2, Ordering::Release);
        thread_proc(Arc::clone(&self.shared), wkr);
        Ok(())
    }

    /// Number of workers the pool was built with.
    #[must_use]
    pub fn thread_count_max(&self) -> usize {
        self.shared.workers.len()
    }

    /// Online CPU count observed at pool construction.
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.shared.cpu_count
    }

    /// Whether workers pin themselves to CPUs.
    #[must_use]
    pub fn binds_to_cpu(&self) -> bool {
        self.shared.bind_to_cpu
    }

    /// Descriptor-count limit used to validate read/write registrations.
    #[must_use]
    pub fn fd_count(&self) -> u64 {
        self.shared.fd_count
    }

    /// Number of live worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.threads_cnt.load(Ordering::Acquire)
    }

    /// Worker by index; out-of-range indexes clamp to the last worker.
    #[must_use]
    pub fn worker(&self, thread_num: usize) -> Arc<Worker> {
        let workers = &self.shared.workers;
        Arc::clone(&workers[thread_num.min(workers.len() - 1)])
    }

    /// Next worker in advisory round-robin order. The cursor is racy on
    /// purpose; exact rotation is not required.
    #[must_use]
    pub fn worker_rr(&self) -> Arc<Worker> {
        let workers = &self.shared.workers;
        let idx = self.shared.rr_idx.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&workers[idx % workers.len()])
    }

    /// The pool virtual thread: registrations on it are delivered on
    /// whichever worker wakes first, in unspecified order.
    #[must_use]
    pub fn pvt(&self) -> Arc<Worker> {
        Arc::clone(&self.shared.pvt)
    }

    /// The worker owning the calling thread, when it is a pool thread.
    #[must_use]
    pub fn current() -> Option<Arc<Worker>> {
        CURRENT_WORKER.with(|slot| slot.borrow().clone())
    }

    /// Posts a stop message to every running worker. Returns immediately;
    /// pair with [`Self::shutdown_wait`].
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Waits until every worker thread has exited, polling every 100 ms.
    pub fn shutdown_wait(&self) {
        while self.shared.threads_cnt.load(Ordering::Acquire) != 0 {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    /// A weak handle process owners can wire to their own signal handling.
    #[must_use]
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken { pool: Arc::downgrade(&self.shared) }
    }
}

impl PoolShared {
    pub(crate) fn shutdown(self: &Arc<Self>) {
        for wkr in &self.workers {
            if !wkr.is_running() {
                continue;
            }
            if let Err(e) =
                super::msg::send(wkr, None, super::MsgFlags::empty(), |wkr: &Arc<Worker>| {
                    wkr.detach();
                })
            {
                tracing::warn!(thread_num = wkr.thread_num, error = %e, "shutdown message failed");
            }
        }
    }
}

/// Weak pool handle for external shutdown wiring (signal handlers, admin
/// endpoints). Replaces the original's process-global pool pointer.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    pool: Weak<PoolShared>,
}

impl ShutdownToken {
    /// Requests pool shutdown; a no-op once the pool is gone.
    pub fn request_shutdown(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.shutdown();
        }
    }
}

/// `std::thread` refuses nothing, but the kernel can transiently refuse a
/// clone with `EAGAIN` under resource pressure; retry a bounded number of
/// times before giving up.
fn spawn_retry(pool: Arc<PoolShared>, wkr: Arc<Worker>) -> Result<()> {
    const ATTEMPTS: usize = 20;
    let mut last = None;
    for _ in 0..ATTEMPTS {
        let pool = Arc::clone(&pool);
        let wkr_for_thread = Arc::clone(&wkr);
        match std::thread::Builder::new()
            .name(format!("evpool-worker-{}", wkr.thread_num))
            .spawn(move || thread_proc(pool, wkr_for_thread))
        {
            Ok(handle) => {
                // Workers are never joined; they account for themselves via
                // threads_cnt.
                drop(handle);
                return Ok(());
            }
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                last = Some(e);
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                last = Some(e);
                break;
            }
        }
    }
    Err(Error::Os(rustix::io::Errno::from_raw_os_error(
        last.and_then(|e| e.raw_os_error()).unwrap_or(libc::EAGAIN),
    )))
}

/// Body of every worker thread (and of [`ThreadPool::attach_first`]).
fn thread_proc(pool: Arc<PoolShared>, wkr: Arc<Worker>) {
    CURRENT_WORKER.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&wkr)));
    wkr.running.fetch_add(1, Ordering::AcqRel);
    tracing::info!(thread_num = wkr.thread_num, "worker started");

    block_sigpipe();
    if wkr.cpu_id >= 0 {
        bind_to_cpu(wkr.thread_num, wkr.cpu_id);
    }

    wkr.run();

    wkr.running.store(0, Ordering::Release);
    pool.threads_cnt.fetch_sub(1, Ordering::AcqRel);
    CURRENT_WORKER.with(|slot| *slot.borrow_mut() = None);
    tracing::info!(thread_num = wkr.thread_num, "worker exited");
}

/// Workers write to message pipes that may close first during teardown;
/// `SIGPIPE` is blocked in every worker's signal mask as a second line of
/// defense behind `MSG_NOSIGNAL`.
fn block_sigpipe() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPIPE);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            tracing::warn!("failed to block SIGPIPE in worker sigmask");
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_to_cpu(thread_num: usize, cpu_id: i32) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id as usize, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) == 0 {
            tracing::info!(thread_num, cpu_id, "worker bound to cpu");
        } else {
            tracing::warn!(thread_num, cpu_id, "failed to bind worker to cpu");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_cpu(thread_num: usize, cpu_id: i32) {
    tracing::debug!(thread_num, cpu_id, "cpu binding not supported on this platform");
}

fn online_cpu_count() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        // At least one processor is available.
        1
    } else {
        n as usize
    }
}

fn fd_limit() -> u64 {
    let mut rl = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } == 0 && rl.rlim_cur > 0 {
        rl.rlim_cur
    } else {
        1024
    }
}
