// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words rcvr ONESHOT

//! Task state, the owning [`IoTask`] handle, and the [`TaskCtx`] view
//! callbacks operate through.

use super::{
    buf::IoBuf,
    connect_ex::{ConnExState, ConnExStatus, ConnectParams},
    handlers,
};
use crate::{
    error::{Error, Result},
    event::{Ev, EvFlags, EvKind, EventCb, Ident, TimerFlags, IDENT_NONE},
    pool::Worker,
};
use rustix::io::Errno;
use std::{
    net::SocketAddr,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

bitflags::bitflags! {
    /// Task-level flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u32 {
        /// Close the task's descriptor when the task is dropped.
        const CLOSE_ON_DESTROY = 1 << 0;
        /// Invoke the callback after each successful read, not only when
        /// the buffer fills or the stream ends. For connect-ex: report
        /// every failed attempt, not just the terminal outcome.
        const CB_AFTER_EVERY_READ = 1 << 1;
    }
}

bitflags::bitflags! {
    /// End-of-stream indications handed to task callbacks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EofFlags: u32 {
        /// The kernel reported EOF / remote half-close.
        const SYS = 1 << 0;
        /// EOF with the transfer window still open (short read).
        const BUF = 1 << 1;
    }
}

/// What a task callback tells the handler to do next.
///
/// Only [`Continue`] re-arms a `DISPATCH` event or rewinds the timer; any
/// other value leaves the task as the handler put it (disabled for
/// `DISPATCH` registrations, still armed otherwise - stop or drop the task
/// before returning a terminal value from a non-`DISPATCH` registration).
///
/// [`Continue`]: TaskFlow::Continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFlow {
    /// Terminal failure; the owner will tear the task down.
    Error,
    /// Done, success.
    Done,
    /// Done with end-of-stream semantics.
    Eof,
    /// Reschedule and keep delivering.
    Continue,
}

/// The canned I/O discipline a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Discipline {
    /// Positional `pread`/`pwrite` against any descriptor.
    ReadWrite,
    /// Socket `recv`/`send` (`MSG_DONTWAIT`, sends add `MSG_NOSIGNAL`).
    SendRecv,
    /// Readiness notification only; no transfer.
    Notify,
    /// Datagram receive loop, one callback per packet.
    PktRcvr,
    /// Accept loop delivering new sockets.
    Accept,
    /// One-shot write readiness after a non-blocking connect.
    Connect,
    /// Multi-address connect with retries and a wall-clock deadline.
    ConnectEx,
}

/// Buffer/read-write tasks transfer through an [`IoBuf`]; connect-ex tasks
/// carry their parameter block and cursors instead.
pub(crate) enum TaskPayload {
    None,
    Buf(IoBuf),
    Connect(ConnExState),
}

/// Callback for read/write and send/recv tasks:
/// `(ctx, error, eof, transferred_total)`.
pub type IoCb = Box<dyn FnMut(&mut TaskCtx<'_>, Option<Errno>, EofFlags, usize) -> TaskFlow + Send>;
/// Callback for notify tasks: `(ctx, error, eof, readiness)`.
pub type NotifyCb = Box<dyn FnMut(&mut TaskCtx<'_>, Option<Errno>, EofFlags, u64) -> TaskFlow + Send>;
/// Callback for datagram receivers: `(ctx, error, peer, packet_len)`.
pub type PktRcvrCb =
    Box<dyn FnMut(&mut TaskCtx<'_>, Option<Errno>, Option<SocketAddr>, usize) -> TaskFlow + Send>;
/// Callback for accept tasks: `(ctx, error, accepted socket + peer)`.
pub type AcceptCb = Box<
    dyn FnMut(&mut TaskCtx<'_>, Option<Errno>, Option<(OwnedFd, Option<SocketAddr>)>) -> TaskFlow
        + Send,
>;
/// Callback for connect tasks. The task is already stopped when it runs;
/// there is nothing to reschedule, so nothing is returned.
pub type ConnectCb = Box<dyn FnMut(&mut TaskCtx<'_>, Option<Errno>) + Send>;
/// Callback for connect-ex tasks: `(ctx, status, addr_index)`.
pub type ConnectExCb = Box<dyn FnMut(&mut TaskCtx<'_>, ConnExStatus, usize) -> TaskFlow + Send>;

pub(crate) enum TaskCb {
    /// Placeholder while the real callback is running.
    Vacant,
    Io(IoCb),
    Notify(NotifyCb),
    PktRcvr(PktRcvrCb),
    Accept(AcceptCb),
    Connect(ConnectCb),
    ConnectEx(ConnectExCb),
}

/// Mutable task record; one mutex guards it, taken by the dispatching
/// worker and by handle methods called from other threads.
pub(crate) struct TaskState {
    pub(crate) wkr: Arc<Worker>,
    pub(crate) ident: Ident,
    /// Synthesized process-unique timer key; never collides with a
    /// descriptor.
    pub(crate) timer_ident: Ident,
    pub(crate) discipline: Discipline,
    pub(crate) flags: TaskFlags,
    pub(crate) ev_kind: EvKind,
    pub(crate) ev_flags: EvFlags,
    pub(crate) timeout_ms: u64,
    /// Positional file offset for read/write tasks.
    pub(crate) offset: u64,
    /// Bytes moved across reactor wakeups, folded into the next callback.
    pub(crate) total: usize,
    pub(crate) payload: TaskPayload,
    pub(crate) cb: TaskCb,
    pub(crate) armed: bool,
    /// The reactor callback re-used for both the I/O and timer
    /// registrations.
    pub(crate) reactor_cb: Option<EventCb>,
}

pub(crate) struct TaskShared {
    pub(crate) state: Mutex<TaskState>,
}

/// Timer idents start above the descriptor range so they can never clash
/// with a registered fd.
fn next_timer_ident() -> Ident {
    static NEXT: AtomicU64 = AtomicU64::new(1 << 32);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Owning handle to an I/O task.
///
/// Dropping the handle stops the task; with
/// [`TaskFlags::CLOSE_ON_DESTROY`] it also closes the descriptor.
pub struct IoTask {
    pub(crate) shared: Arc<TaskShared>,
}

impl std::fmt::Debug for IoTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock().expect("task state poisoned");
        f.debug_struct("IoTask")
            .field("ident", &st.ident)
            .field("discipline", &st.discipline)
            .field("armed", &st.armed)
            .finish_non_exhaustive()
    }
}

impl IoTask {
    pub(crate) fn new_raw(
        wkr: Arc<Worker>,
        ident: Ident,
        discipline: Discipline,
        flags: TaskFlags,
    ) -> Self {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState {
                wkr,
                ident,
                timer_ident: next_timer_ident(),
                discipline,
                flags,
                ev_kind: EvKind::Read,
                ev_flags: EvFlags::empty(),
                timeout_ms: 0,
                offset: 0,
                total: 0,
                payload: TaskPayload::None,
                cb: TaskCb::Vacant,
                armed: false,
                reactor_cb: None,
            }),
        });
        let weak = Arc::downgrade(&shared);
        let cb: EventCb = Arc::new(move |wkr, ev| {
            if let Some(shared) = weak.upgrade() {
                handlers::dispatch(&shared, wkr, ev);
            }
        });
        shared.state.lock().expect("task state poisoned").reactor_cb = Some(cb);
        Self { shared }
    }

    /// A positional read/write task over an arbitrary descriptor. Wire it
    /// up with [`Self::start`].
    #[must_use]
    pub fn rw(wkr: &Arc<Worker>, ident: Ident, flags: TaskFlags) -> Self {
        Self::new_raw(Arc::clone(wkr), ident, Discipline::ReadWrite, flags)
    }

    /// A socket send/recv task. Wire it up with [`Self::start`].
    #[must_use]
    pub fn sr(wkr: &Arc<Worker>, ident: Ident, flags: TaskFlags) -> Self {
        Self::new_raw(Arc::clone(wkr), ident, Discipline::SendRecv, flags)
    }

    /// Arms the task: `timeout_ms > 0` registers a `DISPATCH` timer first,
    /// then the I/O event; a failure of the second rolls the timer back
    /// out before returning.
    pub fn start(
        &self,
        kind: EvKind,
        ev_flags: EvFlags,
        timeout_ms: u64,
        offset: u64,
        buf: Option<IoBuf>,
        cb: IoCb,
    ) -> Result<()> {
        self.start_inner(true, kind, ev_flags, timeout_ms, offset, buf, cb)
    }

    /// Like [`Self::start`], but tries the first transfer inline before
    /// touching the reactor. Used when readiness is already known, e.g. a
    /// socket delivered by an accept filter / deferred accept.
    pub fn start_immediate(
        &self,
        kind: EvKind,
        ev_flags: EvFlags,
        timeout_ms: u64,
        offset: u64,
        buf: Option<IoBuf>,
        cb: IoCb,
    ) -> Result<()> {
        self.start_inner(false, kind, ev_flags, timeout_ms, offset, buf, cb)
    }

    fn start_inner(
        &self,
        schedule_first_io: bool,
        kind: EvKind,
        ev_flags: EvFlags,
        timeout_ms: u64,
        offset: u64,
        buf: Option<IoBuf>,
        cb: IoCb,
    ) -> Result<()> {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        if !matches!(st.discipline, Discipline::ReadWrite | Discipline::SendRecv) {
            return Err(Error::InvalidArg("start() is for read/write and send/recv tasks"));
        }
        st.ev_kind = kind;
        st.ev_flags = ev_flags;
        st.timeout_ms = timeout_ms;
        st.offset = offset;
        st.total = 0;
        st.payload = match buf {
            Some(b) => TaskPayload::Buf(b),
            None => TaskPayload::None,
        };
        st.cb = TaskCb::Io(cb);

        if !schedule_first_io {
            let window = match &st.payload {
                TaskPayload::Buf(b) => {
                    if b.offset() + b.transfer_size() > b.size() {
                        return Err(Error::InvalidArg("buffer transfer window exceeds capacity"));
                    }
                    Some(b.transfer_size())
                }
                _ => None,
            };
            if let Some(tr) = window {
                // Readiness is asserted by the caller: run the handler
                // inline; only a CONTINUE outcome reaches the reactor.
                if handlers::run_direct_io(&mut st, kind, tr as u64) != TaskFlow::Continue {
                    return Ok(());
                }
            }
        }
        handlers::restart_locked(&mut st)
    }

    /// Re-arms the task from its stored parameters. Usable after
    /// [`Self::stop`].
    pub fn restart(&self) -> Result<()> {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        if matches!(st.cb, TaskCb::Vacant) {
            return Err(Error::InvalidArg("task has no callback; start it first"));
        }
        handlers::restart_locked(&mut st)
    }

    /// Removes the task's I/O event and timer. Idempotent; safe from any
    /// thread.
    pub fn stop(&self) {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        handlers::stop_locked(&mut st);
    }

    /// Enables or disables delivery without forgetting the registrations.
    pub fn enable(&self, enable: bool) -> Result<()> {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        handlers::enable_locked(&mut st, enable)
    }

    /// The worker this task is bound to.
    #[must_use]
    pub fn worker(&self) -> Arc<Worker> {
        Arc::clone(&self.shared.state.lock().expect("task state poisoned").wkr)
    }

    /// Rebinds the task to another worker. Only legal while the task is
    /// not armed on any reactor.
    pub fn set_worker(&self, wkr: &Arc<Worker>) -> Result<()> {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        if st.armed {
            return Err(Error::InvalidArg("stop the task before moving it"));
        }
        st.wkr = Arc::clone(wkr);
        Ok(())
    }

    /// The task's descriptor (or timer key), [`IDENT_NONE`] when vacant.
    #[must_use]
    pub fn ident(&self) -> Ident {
        self.shared.state.lock().expect("task state poisoned").ident
    }

    /// Replaces the descriptor. Only legal while the task is stopped.
    pub fn set_ident(&self, ident: Ident) -> Result<()> {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        if st.armed {
            return Err(Error::InvalidArg("stop the task before changing its ident"));
        }
        st.ident = ident;
        Ok(())
    }

    /// Stops the task and closes its descriptor, leaving the task vacant.
    pub fn ident_close(&self) {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        handlers::stop_locked(&mut st);
        if st.ident != IDENT_NONE {
            drop(unsafe { OwnedFd::from_raw_fd(st.ident as RawFd) });
            st.ident = IDENT_NONE;
        }
    }

    /// Task flag accessors.
    #[must_use]
    pub fn flags(&self) -> TaskFlags {
        self.shared.state.lock().expect("task state poisoned").flags
    }

    /// Replaces the task flags.
    pub fn set_flags(&self, flags: TaskFlags) {
        self.shared.state.lock().expect("task state poisoned").flags = flags;
    }

    /// Positional offset for read/write tasks.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.shared.state.lock().expect("task state poisoned").offset
    }

    /// Sets the positional offset.
    pub fn set_offset(&self, offset: u64) {
        self.shared.state.lock().expect("task state poisoned").offset = offset;
    }

    /// I/O timeout in milliseconds; `0` means no timer. Applied on the
    /// next start/re-arm, not to an event already in flight.
    #[must_use]
    pub fn timeout(&self) -> u64 {
        self.shared.state.lock().expect("task state poisoned").timeout_ms
    }

    /// Sets the I/O timeout.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.shared.state.lock().expect("task state poisoned").timeout_ms = timeout_ms;
    }

    /// Takes the buffer out of the task (e.g. after completion).
    #[must_use]
    pub fn take_buf(&self) -> Option<IoBuf> {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        match std::mem::replace(&mut st.payload, TaskPayload::None) {
            TaskPayload::Buf(b) => Some(b),
            other => {
                st.payload = other;
                None
            }
        }
    }

    /// Installs a buffer for the next transfer.
    pub fn set_buf(&self, buf: IoBuf) {
        self.shared.state.lock().expect("task state poisoned").payload = TaskPayload::Buf(buf);
    }
}

impl Drop for IoTask {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock().expect("task state poisoned");
        handlers::stop_locked(&mut st);
        // A delivery already in flight must find nothing left to run.
        st.reactor_cb = None;
        st.cb = TaskCb::Vacant;
        if st.flags.contains(TaskFlags::CLOSE_ON_DESTROY) && st.ident != IDENT_NONE {
            drop(unsafe { OwnedFd::from_raw_fd(st.ident as RawFd) });
            st.ident = IDENT_NONE;
        }
    }
}

/// The view of a task a callback operates through. All accessors work on
/// the already-locked task record, so callbacks never re-enter the task
/// lock (and must not clone/stash the handle to try).
pub struct TaskCtx<'a> {
    pub(crate) st: &'a mut TaskState,
    pub(crate) wkr: &'a Arc<Worker>,
}

impl std::fmt::Debug for TaskCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCtx").field("ident", &self.st.ident).finish_non_exhaustive()
    }
}

impl TaskCtx<'_> {
    /// The worker the event was delivered on.
    #[must_use]
    pub fn worker(&self) -> &Arc<Worker> {
        self.wkr
    }

    /// The task's descriptor.
    #[must_use]
    pub fn ident(&self) -> Ident {
        self.st.ident
    }

    /// The task's buffer, when it has one.
    #[must_use]
    pub fn buf(&mut self) -> Option<&mut IoBuf> {
        match &mut self.st.payload {
            TaskPayload::Buf(b) => Some(b),
            _ => None,
        }
    }

    /// Positional offset (read/write tasks).
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.st.offset
    }

    /// Task flags.
    #[must_use]
    pub fn flags(&self) -> TaskFlags {
        self.st.flags
    }

    /// Updates the task flags.
    pub fn set_flags(&mut self, flags: TaskFlags) {
        self.st.flags = flags;
    }

    /// The connect parameter block (connect-ex tasks).
    #[must_use]
    pub fn connect_params(&self) -> Option<&ConnectParams> {
        match &self.st.payload {
            TaskPayload::Connect(cs) => Some(&cs.prms),
            _ => None,
        }
    }

    /// Stops the task from inside a callback (events and timer removed).
    pub fn stop(&mut self) {
        handlers::stop_locked(self.st);
    }
}

/// The stock disposition check for generic receivers: done when the
/// buffer is full, EOF when the stream ended, terminal when nothing moved,
/// keep receiving otherwise.
#[must_use]
pub fn default_cb_check(buf: Option<&IoBuf>, eof: EofFlags, transferred: usize) -> TaskFlow {
    if buf.is_some_and(|b| b.transfer_size() == 0) {
        return TaskFlow::Done;
    }
    if !eof.is_empty() {
        return TaskFlow::Eof;
    }
    if transferred == 0 {
        // No free space in the receive buffer / nothing transferable.
        return TaskFlow::Error;
    }
    TaskFlow::Continue
}

impl TaskState {
    pub(crate) fn buf(&mut self) -> Option<&mut IoBuf> {
        match &mut self.payload {
            TaskPayload::Buf(b) => Some(b),
            _ => None,
        }
    }

    pub(crate) fn connect_state_mut(&mut self) -> Option<&mut ConnExState> {
        match &mut self.payload {
            TaskPayload::Connect(cs) => Some(cs),
            _ => None,
        }
    }

    pub(crate) fn io_ev(&self) -> Ev {
        Ev { kind: self.ev_kind, flags: self.ev_flags, fflags: TimerFlags::empty(), data: 0 }
    }
}
