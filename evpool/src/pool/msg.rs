// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words bsend cbsend chksum resync resynchronize

//! Cross-thread message queue.
//!
//! Every worker owns a non-blocking anonymous pipe whose read end is a
//! plain READ registration on its own reactor. A message is a heap-boxed
//! closure; what travels through the pipe is a fixed-size packet
//! `{magic, ptr, chksum}` written with a single `write` call (far below
//! `PIPE_BUF`, so the kernel writes it atomically). The magic word and
//! checksum let the receiver resynchronize if a packet is ever torn -
//! POSIX forbids that for this size, but the receiver hardens against it
//! anyway.
//!
//! Unicast is FIFO per (source, destination) pair. Broadcast comes in
//! three disciplines: fire-and-forget, synchronous wait, and
//! callback-on-completion, the latter optionally serialized worker by
//! worker ([`MsgFlags::ONE_BY_ONE`]).

use super::{pool::ThreadPool, worker::Worker};
use crate::{
    error::{last_errno, Error, Result},
    event::Event,
};
use rustix::io::Errno;
use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{Arc, Mutex},
    time::Duration,
};

bitflags::bitflags! {
    /// Unicast and broadcast message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Run the closure inline when the destination is the calling
        /// thread's own worker.
        const SELF_DIRECT = 1 << 0;
        /// Run the closure inline when the destination worker is not
        /// running (instead of failing with `WorkerDown`).
        const FORCE = 1 << 1;
        /// Run the closure inline when the pipe write fails.
        const FAIL_DIRECT = 1 << 2;
        /// Broadcast: do not deliver to the calling thread's worker.
        const SELF_SKIP = 1 << 8;
        /// Broadcast: return only after every selected worker ran the
        /// closure. Deadlock-prone if the caller holds worker state.
        const SYNC = 1 << 9;
        /// With `SYNC`: sleep 10 ms between checks instead of yielding.
        const SYNC_USLEEP = 1 << 10;
        /// Callback-broadcast: deliver to one worker at a time, each
        /// forwarding to the next after its callback ran.
        const ONE_BY_ONE = 1 << 16;
    }
}

/// Broadcast delivery counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BsendReport {
    /// Messages successfully enqueued (or direct-dispatched).
    pub sent: usize,
    /// Workers that could not be reached.
    pub errors: usize,
}

const MSG_PKT_MAGIC: u64 = 0xffdd_aa00_ffdd_aa00;
const MSG_CHK_XOR: u64 = 0x5ac3_3ca5_0ff0_9669;
/// Packets copied out of the pipe per `read` call.
const MSG_BATCH: usize = 1024;
const PKT_SIZE: usize = 3 * size_of::<u64>();

/// The heap cell a packet points at.
struct MsgCell {
    f: Box<dyn FnOnce(&Arc<Worker>) + Send>,
}

fn pkt_bytes(ptr: u64) -> [u8; PKT_SIZE] {
    let mut out = [0u8; PKT_SIZE];
    out[0..8].copy_from_slice(&MSG_PKT_MAGIC.to_ne_bytes());
    out[8..16].copy_from_slice(&ptr.to_ne_bytes());
    out[16..24].copy_from_slice(&(ptr ^ MSG_CHK_XOR).to_ne_bytes());
    out
}

fn pkt_parse(bytes: &[u8]) -> Option<u64> {
    let magic = u64::from_ne_bytes(bytes[0..8].try_into().ok()?);
    let ptr = u64::from_ne_bytes(bytes[8..16].try_into().ok()?);
    let chk = u64::from_ne_bytes(bytes[16..24].try_into().ok()?);
    (magic == MSG_PKT_MAGIC && chk == (ptr ^ MSG_CHK_XOR)).then_some(ptr)
}

/// One worker's message pipe.
pub(crate) struct MsgQueue {
    rd: OwnedFd,
    wr: OwnedFd,
}

impl std::fmt::Debug for MsgQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgQueue").field("rd", &self.rd).field("wr", &self.wr).finish()
    }
}

impl MsgQueue {
    pub(crate) fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) } < 0 {
            return Err(Error::Os(last_errno()));
        }
        Ok(Self {
            rd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            wr: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }

    pub(crate) fn read_ident(&self) -> u64 {
        self.rd.as_raw_fd() as u64
    }

    /// Reads and dispatches packets until the pipe would block.
    fn drain(&self, mut sink: impl FnMut(Box<MsgCell>)) {
        let mut buf = vec![0u8; PKT_SIZE * MSG_BATCH];
        loop {
            let n = unsafe {
                libc::read(self.rd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n < PKT_SIZE as isize {
                return;
            }
            let filled = n as usize;
            let mut i = 0usize;
            while i + PKT_SIZE <= filled {
                if let Some(ptr) = pkt_parse(&buf[i..i + PKT_SIZE]) {
                    sink(unsafe { Box::from_raw(ptr as usize as *mut MsgCell) });
                    i += PKT_SIZE;
                    continue;
                }
                // Torn packet: scan forward for the magic word and restart
                // from the first position that checks out.
                tracing::warn!("damaged message packet, resynchronizing");
                let mut j = i + size_of::<u64>();
                loop {
                    if j + PKT_SIZE > filled {
                        return; // No intact packet left.
                    }
                    if pkt_parse(&buf[j..j + PKT_SIZE]).is_some() {
                        break;
                    }
                    j += size_of::<u64>();
                }
                i = j;
            }
            if filled < buf.len() {
                return; // Pipe drained.
            }
        }
    }
}

impl Drop for MsgQueue {
    fn drop(&mut self) {
        // Undelivered closures are dropped without running.
        self.drain(drop);
    }
}

/// READ-event callback for the pipe's read end. `owner` is the worker the
/// queue belongs to; message closures always see it, even when a PVT queue
/// is drained by some other worker.
pub(crate) fn recv_and_process(owner: &Arc<Worker>, _ev: &Event) {
    owner.msgq.drain(|cell| (cell.f)(owner));
}

/// Unicast send. See [`MsgFlags`] for the inline-dispatch escape hatches.
pub(crate) fn send<F>(
    dst: &Arc<Worker>,
    src: Option<&Arc<Worker>>,
    flags: MsgFlags,
    f: F,
) -> Result<()>
where
    F: FnOnce(&Arc<Worker>) + Send + 'static,
{
    if flags.contains(MsgFlags::SELF_DIRECT) {
        let cur;
        let src = match src {
            Some(s) => Some(s),
            None => {
                cur = ThreadPool::current();
                cur.as_ref()
            }
        };
        if let Some(src) = src {
            if Arc::ptr_eq(src, dst) {
                f(dst);
                return Ok(());
            }
        }
    }
    if !dst.is_running() {
        if !flags.contains(MsgFlags::FORCE) {
            return Err(Error::WorkerDown);
        }
        f(dst);
        return Ok(());
    }

    let ptr = Box::into_raw(Box::new(MsgCell { f: Box::new(f) })) as usize as u64;
    let pkt = pkt_bytes(ptr);
    let n = unsafe { libc::write(dst.msgq.wr.as_raw_fd(), pkt.as_ptr().cast(), PKT_SIZE) };
    if n == PKT_SIZE as isize {
        return Ok(());
    }
    if n < 0 {
        let e = last_errno();
        // The packet never reached the pipe; the cell is ours again.
        let cell = unsafe { Box::from_raw(ptr as usize as *mut MsgCell) };
        if flags.contains(MsgFlags::FAIL_DIRECT) {
            (cell.f)(dst);
            return Ok(());
        }
        drop(cell);
        return Err(Error::Os(e));
    }
    // Short write: cannot happen below PIPE_BUF, but if it ever does the
    // receiver will resynchronize past the torn packet. The cell must leak;
    // reclaiming it could race a receiver inspecting the bytes.
    Err(Error::Os(Errno::IO))
}

#[derive(Debug, Default)]
struct BcastCounts {
    active: usize,
    cur_thr_idx: usize,
    sent: usize,
    errors: usize,
}

type DoneCb = Box<dyn FnOnce(&Arc<Worker>, usize, usize) + Send>;
type BcastCb = Arc<dyn Fn(&Arc<Worker>) + Send + Sync>;

/// Broadcast control record, shared by every worker the broadcast reaches.
/// `active` reaches zero at most once; whoever gets it there posts the
/// completion callback (when present) to the caller's worker.
struct BcastCtl {
    msg_cb: BcastCb,
    flags: MsgFlags,
    counts: Mutex<BcastCounts>,
    /// Caller's worker; completion is delivered here.
    src: Option<Arc<Worker>>,
    done_cb: Mutex<Option<DoneCb>>,
}

impl BcastCtl {
    fn new(msg_cb: BcastCb, flags: MsgFlags, active: usize, src: Option<Arc<Worker>>,
           done_cb: Option<DoneCb>) -> Arc<Self> {
        Arc::new(Self {
            msg_cb,
            flags,
            counts: Mutex::new(BcastCounts { active, ..Default::default() }),
            src,
            done_cb: Mutex::new(done_cb),
        })
    }

    fn counts(&self) -> BcastCounts {
        let c = self.counts.lock().expect("broadcast counts poisoned");
        BcastCounts { active: c.active, cur_thr_idx: c.cur_thr_idx, sent: c.sent, errors: c.errors }
    }
}

/// Decrements the active-worker count; the thread that reaches zero posts
/// the completion callback. Returns the remaining count.
fn bcast_dec(ctl: &Arc<BcastCtl>, cur: &Arc<Worker>, by: usize) -> usize {
    let remaining = {
        let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
        c.active = c.active.saturating_sub(by);
        c.active
    };
    if remaining != 0 {
        return remaining;
    }
    let Some(dst) = ctl.src.clone() else { return 0 };
    if ctl.done_cb.lock().expect("broadcast done_cb poisoned").is_none() {
        return 0;
    }
    let ctl = Arc::clone(ctl);
    drop(send(
        &dst,
        Some(cur),
        MsgFlags::FAIL_DIRECT | MsgFlags::SELF_DIRECT,
        move |w| run_done(&ctl, w),
    ));
    0
}

fn run_done(ctl: &Arc<BcastCtl>, w: &Arc<Worker>) {
    let done = ctl.done_cb.lock().expect("broadcast done_cb poisoned").take();
    if let Some(done) = done {
        let c = ctl.counts();
        done(w, c.sent, c.errors);
    }
}

/// The per-worker proxy used by `SYNC` broadcasts and plain `cbsend`.
fn sync_proxy(ctl: Arc<BcastCtl>) -> impl FnOnce(&Arc<Worker>) + Send {
    move |w| {
        (ctl.msg_cb)(w);
        bcast_dec(&ctl, w, 1);
    }
}

/// Enqueues one message per worker, recording counts in `ctl`. With
/// `counted` (the `SYNC`/`cbsend` disciplines), `SELF_SKIP` pre-decrements
/// the active count since the caller's slot never runs a proxy. Returns the
/// number of failed enqueues; the caller settles those against the active
/// count.
fn broadcast_int<F, M>(
    tp: &ThreadPool,
    src: Option<&Arc<Worker>>,
    counted: bool,
    flags: MsgFlags,
    mut mk_msg: M,
    ctl: &Arc<BcastCtl>,
) -> usize
where
    F: FnOnce(&Arc<Worker>) + Send + 'static,
    M: FnMut() -> F,
{
    if counted && src.is_some() && flags.contains(MsgFlags::SELF_SKIP) {
        let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
        c.active = c.active.saturating_sub(1);
    }
    let mut failed = 0usize;
    for i in 0..tp.thread_count_max() {
        let wkr = tp.worker(i);
        if let Some(src) = src {
            if Arc::ptr_eq(src, &wkr) && flags.contains(MsgFlags::SELF_SKIP) {
                continue;
            }
        }
        {
            let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
            c.sent += 1;
        }
        if send(&wkr, src, flags, mk_msg()).is_ok() {
            continue;
        }
        // Not-running workers land here too (WorkerDown).
        let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
        c.sent -= 1;
        c.errors += 1;
        failed += 1;
    }
    failed
}

/// Broadcast to every worker. See [`MsgFlags`] for the disciplines.
pub(crate) fn bsend(
    tp: &ThreadPool,
    src: Option<&Arc<Worker>>,
    flags: MsgFlags,
    cb: BcastCb,
) -> Result<BsendReport> {
    let cur;
    let src = match src {
        Some(s) => Some(s),
        None => {
            cur = ThreadPool::current();
            cur.as_ref()
        }
    };
    let threads_max = tp.thread_count_max();

    // Single-worker pools: a worker broadcasting to itself short-circuits.
    if threads_max == 1 {
        if let Some(src) = src {
            if flags.contains(MsgFlags::SELF_SKIP) {
                return Ok(BsendReport::default());
            }
            if flags.contains(MsgFlags::SYNC) {
                // An async wait on itself cannot complete; run inline.
                cb(src);
                return Ok(BsendReport { sent: 0, errors: 0 });
            }
            let cb = Arc::clone(&cb);
            send(&tp.worker(0), Some(src), flags, move |w| cb(w))?;
            return Ok(BsendReport { sent: 1, errors: 0 });
        }
    }

    let ctl = BcastCtl::new(Arc::clone(&cb), flags, threads_max, None, None);
    let failed = if flags.contains(MsgFlags::SYNC) {
        let proxy_ctl = Arc::clone(&ctl);
        broadcast_int(tp, src, true, flags, || sync_proxy(Arc::clone(&proxy_ctl)), &ctl)
    } else {
        broadcast_int(
            tp,
            src,
            false,
            flags,
            || {
                let cb = Arc::clone(&cb);
                move |w: &Arc<Worker>| cb(w)
            },
            &ctl,
        )
    };

    if flags.contains(MsgFlags::SYNC) {
        let fallback;
        let cur_wkr = match src {
            Some(s) => s,
            None => {
                // No worker context; completion is count-based only.
                fallback = tp.worker(0);
                &fallback
            }
        };
        let mut remaining = bcast_dec(&ctl, cur_wkr, failed);
        while remaining != 0 {
            if flags.contains(MsgFlags::SYNC_USLEEP) {
                std::thread::sleep(Duration::from_millis(10));
            } else {
                std::thread::yield_now();
            }
            remaining = ctl.counts().active;
        }
    }

    let c = ctl.counts();
    if c.sent == 0 {
        return Err(Error::NoneDelivered);
    }
    Ok(BsendReport { sent: c.sent, errors: c.errors })
}

/// Broadcast with a completion callback delivered on the caller's worker
/// once every selected worker ran (or failed). `ONE_BY_ONE` serializes the
/// traversal in round-robin order.
pub(crate) fn cbsend(
    tp: &ThreadPool,
    src: Option<&Arc<Worker>>,
    flags: MsgFlags,
    cb: BcastCb,
    done: DoneCb,
) -> Result<()> {
    if flags.intersects(MsgFlags::SYNC | MsgFlags::SYNC_USLEEP) {
        return Err(Error::InvalidArg("cbsend cannot be synchronous"));
    }
    let cur;
    let src = match src {
        Some(s) => Some(s),
        None => {
            cur = ThreadPool::current();
            cur.as_ref()
        }
    };
    // Completion needs a worker to land on.
    let Some(src) = src else {
        return Err(Error::InvalidArg("cbsend requires a worker context"));
    };
    let threads_max = tp.thread_count_max();

    if threads_max == 1 {
        if flags.contains(MsgFlags::SELF_SKIP) {
            done(src, 0, 0);
        } else {
            cb(src);
            done(src, 1, 0);
        }
        return Ok(());
    }

    let ctl = BcastCtl::new(cb, flags, threads_max, Some(Arc::clone(src)), Some(done));

    if flags.contains(MsgFlags::ONE_BY_ONE) {
        let self_direct = flags.contains(MsgFlags::SELF_DIRECT)
            && !flags.contains(MsgFlags::SELF_SKIP);
        if self_direct {
            {
                let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
                c.sent += 1;
            }
            (ctl.msg_cb)(src);
        }
        if one_by_one_send_next(tp, src, &ctl).is_ok() {
            return Ok(());
        }
        if self_direct {
            run_done(&ctl, src);
            return Ok(());
        }
        return Err(Error::NoneDelivered);
    }

    let proxy_ctl = Arc::clone(&ctl);
    let failed =
        broadcast_int(tp, Some(src), true, flags, || sync_proxy(Arc::clone(&proxy_ctl)), &ctl);
    if failed == 0 {
        return Ok(());
    }
    let sent = ctl.counts().sent;
    bcast_dec(&ctl, src, failed);
    if sent == 0 {
        return Err(Error::NoneDelivered);
    }
    Ok(())
}

/// Advances a one-by-one broadcast to the next unvisited worker.
fn one_by_one_send_next(tp: &ThreadPool, cur: &Arc<Worker>, ctl: &Arc<BcastCtl>) -> Result<()> {
    let threads_max = tp.thread_count_max();
    loop {
        let idx = {
            let c = ctl.counts.lock().expect("broadcast counts poisoned");
            c.cur_thr_idx
        };
        if idx >= threads_max {
            return Err(Error::InvalidArg("one-by-one traversal exhausted"));
        }
        let wkr = tp.worker(idx);
        if ctl.src.as_ref().is_some_and(|s| Arc::ptr_eq(s, &wkr)) {
            let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
            c.cur_thr_idx += 1;
            continue;
        }
        {
            let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
            c.sent += 1;
        }
        let next = Arc::clone(ctl);
        if send(&wkr, Some(cur), ctl.flags, move |w| one_by_one_run(&next, w)).is_ok() {
            return Ok(());
        }
        // Also lands here for not-running workers.
        let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
        c.sent -= 1;
        c.errors += 1;
        c.cur_thr_idx += 1;
    }
}

/// Per-worker body of a one-by-one broadcast: run the callback, pass the
/// baton onward, and fall back to completion when the ring is exhausted.
fn one_by_one_run(ctl: &Arc<BcastCtl>, w: &Arc<Worker>) {
    (ctl.msg_cb)(w);
    {
        let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
        c.cur_thr_idx += 1;
    }
    let Some(tp) = w.pool() else {
        run_done(ctl, w);
        return;
    };
    if one_by_one_send_next(&tp, w, ctl).is_ok() {
        return;
    }
    // Everyone except the caller is done; optionally schedule the caller
    // itself as the last stop.
    let is_caller = ctl.src.as_ref().is_some_and(|s| Arc::ptr_eq(s, w));
    if !ctl.flags.intersects(MsgFlags::SELF_SKIP | MsgFlags::SELF_DIRECT) && !is_caller {
        if let Some(dst) = ctl.src.clone() {
            {
                let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
                c.cur_thr_idx = tp.thread_count_max();
                c.sent += 1;
            }
            let next = Arc::clone(ctl);
            if send(&dst, Some(w), ctl.flags, move |w| one_by_one_run(&next, w)).is_ok() {
                return;
            }
            let mut c = ctl.counts.lock().expect("broadcast counts poisoned");
            c.sent -= 1;
            c.errors += 1;
        }
    }
    if let Some(dst) = ctl.src.clone() {
        let next = Arc::clone(ctl);
        drop(send(
            &dst,
            Some(w),
            MsgFlags::FAIL_DIRECT | MsgFlags::SELF_DIRECT,
            move |w| run_done(&next, w),
        ));
    }
}

/// Number of word-sized argument slots in an [`AsyncOp`].
pub const AOP_ARG_COUNT: usize = 6;

/// A fixed-layout box for shuttling a small argument bundle between
/// threads without per-field allocation: an operation callback plus
/// [`AOP_ARG_COUNT`] word-sized slots.
pub struct AsyncOp {
    dst: Arc<Worker>,
    op_cb: Box<dyn FnOnce(&Arc<Worker>, &[u64; AOP_ARG_COUNT]) + Send>,
    args: [u64; AOP_ARG_COUNT],
}

impl std::fmt::Debug for AsyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOp").field("args", &self.args).finish_non_exhaustive()
    }
}

impl AsyncOp {
    /// Allocates an operation bound to `dst` (or the calling thread's
    /// worker when `None`).
    pub fn new<F>(dst: Option<Arc<Worker>>, op_cb: F) -> Result<Box<Self>>
    where
        F: FnOnce(&Arc<Worker>, &[u64; AOP_ARG_COUNT]) + Send + 'static,
    {
        let dst = match dst {
            Some(d) => d,
            None => ThreadPool::current()
                .ok_or(Error::InvalidArg("async op needs a destination worker"))?,
        };
        Ok(Box::new(Self { dst, op_cb: Box::new(op_cb), args: [0; AOP_ARG_COUNT] }))
    }

    /// Argument slot value; out-of-range indexes read as zero.
    #[must_use]
    pub fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Sets an argument slot; out-of-range indexes are ignored.
    pub fn set_arg(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.args.get_mut(index) {
            *slot = value;
        }
    }

    /// Posts the operation to its destination worker and consumes the box.
    /// Delivery is unconditional: self-sends and dead workers dispatch
    /// inline.
    pub fn dispatch(self: Box<Self>, src: Option<&Arc<Worker>>) {
        let dst = Arc::clone(&self.dst);
        drop(send(
            &dst,
            src,
            MsgFlags::SELF_DIRECT | MsgFlags::FORCE | MsgFlags::FAIL_DIRECT,
            move |w| {
                let this = *self;
                (this.op_cb)(w, &this.args);
            },
        ));
    }
}

impl Worker {
    /// Sends a closure to run on this worker's thread. FIFO with respect
    /// to other messages from the same source.
    pub fn send_msg<F>(self: &Arc<Self>, src: Option<&Arc<Worker>>, flags: MsgFlags, f: F) -> Result<()>
    where
        F: FnOnce(&Arc<Worker>) + Send + 'static,
    {
        send(self, src, flags, f)
    }
}

impl ThreadPool {
    /// Broadcasts a closure to every worker. See [`MsgFlags`] for the
    /// `SYNC`/`SELF_SKIP` disciplines.
    pub fn bsend<F>(&self, src: Option<&Arc<Worker>>, flags: MsgFlags, cb: F) -> Result<BsendReport>
    where
        F: Fn(&Arc<Worker>) + Send + Sync + 'static,
    {
        bsend(self, src, flags, Arc::new(cb))
    }

    /// Broadcasts a closure and delivers a completion callback
    /// `(sent, errors)` on the caller's worker once every selected worker
    /// ran. `MsgFlags::ONE_BY_ONE` serializes the traversal.
    pub fn cbsend<F, D>(&self, src: Option<&Arc<Worker>>, flags: MsgFlags, cb: F, done: D) -> Result<()>
    where
        F: Fn(&Arc<Worker>) + Send + Sync + 'static,
        D: FnOnce(&Arc<Worker>, usize, usize) + Send + 'static,
    {
        cbsend(self, src, flags, Arc::new(cb), Box::new(done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn packet_round_trip() {
        let bytes = pkt_bytes(0xdead_beef);
        assert_eq!(pkt_parse(&bytes), Some(0xdead_beef));
    }

    #[test]
    fn packet_rejects_corruption() {
        let mut bytes = pkt_bytes(0x1234);
        bytes[9] ^= 0x01;
        assert_eq!(pkt_parse(&bytes), None);
    }
}
