// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EBADF tpt

//! Per-thread worker record and its reactor loop.
//!
//! A worker owns exactly one multiplexer handle, one message pipe, and the
//! registry of everything armed on it. The loop waits for **one** event per
//! iteration - fairness across descriptors is the kernel's job - and never
//! blocks anywhere except inside the wait call and user callbacks.

use super::{msg::MsgQueue, pool::PoolShared};
use crate::{
    error::{Error, Result},
    event::{Ev, EvFlags, EvKind, EventCb, Ident, TimerFlags, IDENT_NONE},
    os::{Poller, Wake},
};
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, OnceLock, Weak,
};

/// `thread_num` of the pool virtual thread.
pub(crate) const PVT_THREAD_NUM: usize = usize::MAX;

/// One pool worker: reactor handle, registry, message pipe, and liveness
/// counters. Real workers run [`Worker::run`] on a dedicated OS thread; the
/// pool virtual thread (PVT) owns the same state but is never scheduled -
/// every real worker subscribes to its handle and drains it opportunistically.
pub struct Worker {
    pub(crate) thread_num: usize,
    pub(crate) cpu_id: i32,
    /// 0 = stopped, 1 = starting, 2 = attached-external, >= 1 running.
    pub(crate) running: AtomicUsize,
    /// Incremented once per loop iteration; external watchdogs read it to
    /// detect a stuck worker.
    pub(crate) tick_cnt: AtomicU64,
    pub(crate) poller: Poller,
    pub(crate) msgq: MsgQueue,
    pub(crate) pool: OnceLock<Weak<PoolShared>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("thread_num", &self.thread_num)
            .field("cpu_id", &self.cpu_id)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub(crate) fn new(thread_num: usize, cpu_id: i32) -> Result<Arc<Self>> {
        let wkr = Arc::new(Self {
            thread_num,
            cpu_id,
            running: AtomicUsize::new(0),
            tick_cnt: AtomicU64::new(0),
            poller: Poller::new()?,
            msgq: MsgQueue::new()?,
            pool: OnceLock::new(),
        });
        // The message pipe's read end is just another READ registration.
        // The queue owner is captured explicitly: PVT messages are drained
        // by whichever real worker wakes, yet must come off the PVT's pipe
        // and run against the PVT.
        let owner = Arc::downgrade(&wkr);
        let rd = wkr.msgq.read_ident();
        wkr.poller.ev_add(
            &Ev::read(EvFlags::empty()),
            rd,
            Arc::new(move |_wkr, ev| {
                if let Some(owner) = owner.upgrade() {
                    super::msg::recv_and_process(&owner, ev);
                }
            }),
        )?;
        Ok(wkr)
    }

    /// Index of this worker within its pool; `None` for the PVT.
    #[must_use]
    pub fn thread_num(&self) -> Option<usize> {
        (self.thread_num != PVT_THREAD_NUM).then_some(self.thread_num)
    }

    /// CPU this worker is pinned to, or `-1` when unbound.
    #[must_use]
    pub fn cpu_id(&self) -> i32 {
        self.cpu_id
    }

    /// Whether a loop is currently attached to this worker.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) != 0
    }

    /// Loop-iteration counter for hang watchdogs.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.tick_cnt.load(Ordering::Relaxed)
    }

    /// The owning pool, if it is still alive.
    #[must_use]
    pub fn pool(&self) -> Option<super::ThreadPool> {
        self.pool_shared().map(super::ThreadPool::from_shared)
    }

    pub(crate) fn pool_shared(&self) -> Option<Arc<PoolShared>> {
        self.pool.get().and_then(Weak::upgrade)
    }

    /// Asks this worker's loop to exit after the current iteration.
    pub fn detach(&self) {
        self.running.store(0, Ordering::Release);
    }

    fn check_ident(&self, ev: &Ev, ident: Ident) -> Result<()> {
        if ident == IDENT_NONE {
            return Err(Error::InvalidArg("event registered without an ident"));
        }
        if matches!(ev.kind, EvKind::Read | EvKind::Write) {
            if let Some(pool) = self.pool_shared() {
                if ident >= pool.fd_count {
                    return Err(Error::BadIdent);
                }
            }
        }
        Ok(())
    }

    /// Registers `cb` for the readiness described by `ev` on `ident`.
    ///
    /// Registering on an ident that already carries an I/O registration
    /// replaces it; timers are namespaced separately and re-arm in place.
    pub fn ev_add(&self, ev: &Ev, ident: Ident, cb: EventCb) -> Result<()> {
        ev.validate()?;
        self.check_ident(ev, ident)?;
        self.poller.ev_add(ev, ident, cb)
    }

    /// Removes a registration; all associated kernel state is freed.
    pub fn ev_del(&self, kind: EvKind, ident: Ident) -> Result<()> {
        self.poller.ev_del(kind, ident)
    }

    /// Enables or disables a registration without removing it. Enabling
    /// re-arms `ONESHOT`/`DISPATCH` delivery and rewinds timers with the
    /// value in `ev.data`.
    pub fn ev_enable(&self, enable: bool, ev: &Ev, ident: Ident) -> Result<()> {
        ev.validate()?;
        self.poller.ev_enable(enable, ev, ident)
    }

    /// Registers a timer in one call; `enable == false` leaves it armed but
    /// disabled until [`Self::ev_enable`].
    pub fn timer_add(
        &self,
        enable: bool,
        ident: Ident,
        timeout: u64,
        flags: EvFlags,
        fflags: TimerFlags,
        cb: EventCb,
    ) -> Result<()> {
        let ev = Ev::timer(flags, fflags, timeout);
        self.ev_add(&ev, ident, cb)?;
        if !enable {
            self.ev_enable(false, &Ev::timer(flags, fflags, 0), ident)?;
        }
        Ok(())
    }

    /// The reactor loop. Runs until [`Self::detach`] (usually via the
    /// shutdown message) flips `running` to zero.
    pub(crate) fn run(self: &Arc<Self>) {
        let pvt = self.pool_shared().map(|p| p.pvt.clone());
        while self.running.load(Ordering::Acquire) != 0 {
            self.tick_cnt.fetch_add(1, Ordering::Relaxed); // Tick-tock.
            match self.poller.wait(-1) {
                Ok(Wake::Nothing) => {}
                Ok(Wake::Delivery(cb, ev)) => cb(self, &ev),
                Ok(Wake::PvtReady) => {
                    let Some(pvt) = pvt.as_ref() else { continue };
                    // First worker woken re-arms the trigger, then drains
                    // exactly one event from the shared handle.
                    if let Err(e) = self.poller.rearm_pvt(pvt.poller.raw_fd()) {
                        tracing::debug!(error = %e, "pvt re-arm failed");
                    }
                    match pvt.poller.wait(0) {
                        Ok(Wake::Delivery(cb, ev)) => cb(self, &ev),
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "pvt drain failed"),
                    }
                }
                Err(e) => {
                    tracing::error!(thread_num = self.thread_num, error = %e, "reactor wait failed");
                    break;
                }
            }
        }
    }
}
