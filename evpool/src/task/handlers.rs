// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words DONTWAIT NOSIGNAL rcvr recvfrom ONESHOT

//! The canned task handlers: the shared pre/post frame, the read/write
//! transfer loop, and the notify / datagram / accept / connect
//! disciplines. Connect-ex lives in its own module.

use super::task::{
    AcceptCb, ConnectCb, Discipline, EofFlags, IoCb, IoTask, NotifyCb, PktRcvrCb, TaskCb, TaskCtx,
    TaskFlags, TaskFlow, TaskShared, TaskState,
};
use crate::{
    error::{last_errno, Error, Result},
    event::{Ev, EvFlags, EvKind, Event, Ident, Readiness, TimerFlags},
    net::socket as skt,
    pool::Worker,
};
use rustix::io::Errno;
use std::{os::fd::RawFd, sync::Arc};

/// Reactor entry point for every task registration (I/O and timer alike).
pub(crate) fn dispatch(shared: &Arc<TaskShared>, wkr: &Arc<Worker>, ev: &Event) {
    let mut st = shared.state.lock().expect("task state poisoned");
    match st.discipline {
        Discipline::ReadWrite | Discipline::SendRecv => {
            let _ = io_transfer(&mut st, wkr, ev, false);
        }
        Discipline::Notify => notify_handler(&mut st, wkr, ev),
        Discipline::PktRcvr => pkt_rcvr_handler(&mut st, wkr, ev),
        Discipline::Accept => accept_handler(&mut st, wkr, ev),
        Discipline::Connect => connect_handler(&mut st, wkr, ev),
        Discipline::ConnectEx => super::connect_ex::handler(&mut st, wkr, ev),
    }
}

/// Arms the task from its stored parameters: timer first (when a timeout
/// is configured), then the I/O event; a failed I/O registration rolls the
/// timer back out.
pub(crate) fn restart_locked(st: &mut TaskState) -> Result<()> {
    let Some(cb) = st.reactor_cb.clone() else {
        return Err(Error::InvalidArg("task is being torn down"));
    };
    if st.timeout_ms != 0 {
        st.wkr.ev_add(
            &Ev::timer(EvFlags::DISPATCH, TimerFlags::empty(), st.timeout_ms),
            st.timer_ident,
            Arc::clone(&cb),
        )?;
    }
    if let Err(e) = st.wkr.ev_add(&st.io_ev(), st.ident, cb) {
        if st.timeout_ms != 0 {
            let _ = st.wkr.ev_del(EvKind::Timer, st.timer_ident);
        }
        return Err(e);
    }
    st.armed = true;
    Ok(())
}

/// Removes the I/O event and (when configured) the timer. Events that are
/// not present are simply not there to remove.
pub(crate) fn stop_locked(st: &mut TaskState) {
    let _ = st.wkr.ev_del(st.ev_kind, st.ident);
    if st.timeout_ms != 0 {
        let _ = st.wkr.ev_del(EvKind::Timer, st.timer_ident);
    }
    st.armed = false;
}

/// Enables or disables the task's registrations in place.
pub(crate) fn enable_locked(st: &mut TaskState, enable: bool) -> Result<()> {
    if st.timeout_ms != 0 {
        st.wkr.ev_enable(
            enable,
            &Ev::timer(EvFlags::DISPATCH, TimerFlags::empty(), st.timeout_ms),
            st.timer_ident,
        )?;
    }
    if let Err(e) = st.wkr.ev_enable(enable, &st.io_ev(), st.ident) {
        if st.timeout_ms != 0 {
            let _ = st.wkr.ev_enable(
                false,
                &Ev::timer(EvFlags::DISPATCH, TimerFlags::empty(), 0),
                st.timer_ident,
            );
        }
        return Err(e);
    }
    Ok(())
}

/// Shared handler preamble: timeout detection, timer parking, error and
/// EOF extraction, transfer budget.
fn handler_pre(st: &mut TaskState, ev: &Event) -> (Option<Errno>, EofFlags, u64) {
    let eof =
        if ev.flags.contains(EvFlags::EOF) { EofFlags::SYS } else { EofFlags::empty() };
    if ev.kind == EvKind::Timer {
        // Timeout: park or remove the I/O side before reporting.
        if st.ev_flags.contains(EvFlags::ONESHOT) {
            stop_locked(st);
        } else {
            let _ = st.wkr.ev_enable(false, &st.io_ev(), st.ident);
        }
        return (Some(Errno::TIMEDOUT), eof, 0);
    }
    if st.timeout_ms != 0 {
        if st.ev_flags.contains(EvFlags::ONESHOT) {
            let _ = st.wkr.ev_del(EvKind::Timer, st.timer_ident);
        } else {
            let _ = st.wkr.ev_enable(
                false,
                &Ev::timer(EvFlags::DISPATCH, TimerFlags::empty(), 0),
                st.timer_ident,
            );
        }
    }
    let error =
        ev.flags.contains(EvFlags::ERROR).then(|| ev.errno.unwrap_or(Errno::INVAL));
    (error, eof, ev.data.limit())
}

/// Shared handler epilogue: only a `Continue` outcome rewinds the timer
/// and re-enables a `DISPATCH` (or timer-parked) registration.
fn handler_post(st: &mut TaskState, ev_kind: EvKind, flow: TaskFlow) {
    if flow != TaskFlow::Continue {
        return;
    }
    if st.timeout_ms != 0 {
        let _ = st.wkr.ev_enable(
            true,
            &Ev::timer(EvFlags::DISPATCH, TimerFlags::empty(), st.timeout_ms),
            st.timer_ident,
        );
    }
    if st.ev_flags.contains(EvFlags::DISPATCH) || ev_kind == EvKind::Timer {
        let _ = st.wkr.ev_enable(true, &st.io_ev(), st.ident);
    }
}

fn call_io_cb(
    st: &mut TaskState,
    wkr: &Arc<Worker>,
    error: Option<Errno>,
    eof: EofFlags,
    transferred: usize,
) -> TaskFlow {
    let transferred = transferred + st.total;
    st.total = 0;
    let mut cb = std::mem::replace(&mut st.cb, TaskCb::Vacant);
    let flow = if let TaskCb::Io(f) = &mut cb {
        f(&mut TaskCtx { st, wkr }, error, eof, transferred)
    } else {
        TaskFlow::Error
    };
    if matches!(st.cb, TaskCb::Vacant) {
        st.cb = cb;
    }
    flow
}

fn sys_read(st: &mut TaskState, positional: bool) -> std::result::Result<usize, Errno> {
    let fd = st.ident as RawFd;
    let offset = st.offset;
    let b = st.buf().expect("transfer loop without a buffer");
    let (ptr, len) = (b.chunk_mut_ptr(), b.transfer_size());
    let n = if positional {
        unsafe { libc::pread(fd, ptr.cast(), len, offset as libc::off_t) }
    } else {
        unsafe { libc::recv(fd, ptr.cast(), len, libc::MSG_DONTWAIT) }
    };
    if n < 0 { Err(last_errno()) } else { Ok(n as usize) }
}

fn sys_write(st: &mut TaskState, positional: bool) -> std::result::Result<usize, Errno> {
    let fd = st.ident as RawFd;
    let offset = st.offset;
    let b = st.buf().expect("transfer loop without a buffer");
    let (ptr, len) = (b.chunk_ptr(), b.transfer_size());
    let n = if positional {
        unsafe { libc::pwrite(fd, ptr.cast(), len, offset as libc::off_t) }
    } else {
        unsafe { libc::send(fd, ptr.cast(), len, libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL) }
    };
    if n < 0 { Err(last_errno()) } else { Ok(n as usize) }
}

/// First-transfer-inline entry for [`IoTask::start_immediate`]: readiness
/// is asserted by the caller, so the pre-frame is skipped.
pub(crate) fn run_direct_io(st: &mut TaskState, kind: EvKind, window: u64) -> TaskFlow {
    let wkr = Arc::clone(&st.wkr);
    if window == 0 {
        // Nothing to move: report an empty completion right away.
        return call_io_cb(st, &wkr, None, EofFlags::empty(), 0);
    }
    let mut ev = Event::new(kind, st.ident);
    ev.data = Readiness::Count(window);
    io_transfer(st, &wkr, &ev, true)
}

/// The read/write ⁄ send/recv engine. Transfers until the budget, the
/// buffer window, a transient would-block, EOF, or an error ends the
/// round, then reports to the application callback and (outside direct
/// mode) runs the epilogue.
fn io_transfer(st: &mut TaskState, wkr: &Arc<Worker>, ev: &Event, direct: bool) -> TaskFlow {
    let (mut error, mut eof, budget) = if direct {
        (None, EofFlags::empty(), ev.data.limit())
    } else {
        handler_pre(st, ev)
    };
    let positional = st.discipline == Discipline::ReadWrite;
    let window = st.buf().map_or(0, |b| b.transfer_size());
    let mut transferred: usize = 0;

    // An error reported alongside readable data does not stop the
    // transfer; it is carried into the callback afterwards.
    if budget != 0 && window != 0 {
        let budget = budget.min(window as u64);
        loop {
            if transferred as u64 >= budget {
                // Budget exhausted; continue at the next wakeup. (With an
                // unbounded budget the loop ends at would-block instead.)
                st.total += transferred;
                let flow = TaskFlow::Continue;
                if !direct {
                    handler_post(st, ev.kind, flow);
                }
                return flow;
            }
            let res = match ev.kind {
                EvKind::Read => sys_read(st, positional),
                EvKind::Write => sys_write(st, positional),
                EvKind::Timer => Err(Errno::NOSYS),
            };
            match res {
                Err(e) => match skt::err_filter(e) {
                    None => {
                        // Transient: save progress, go back to the reactor.
                        st.total += transferred;
                        let flow = TaskFlow::Continue;
                        if !direct {
                            handler_post(st, ev.kind, flow);
                        }
                        return flow;
                    }
                    Some(e) => {
                        error = Some(e);
                        break;
                    }
                },
                Ok(0) => {
                    if ev.kind == EvKind::Read
                        && st.buf().is_some_and(|b| b.transfer_size() > 0)
                    {
                        // Stream ended with the window still open.
                        eof |= EofFlags::BUF;
                    }
                    break;
                }
                Ok(n) => {
                    st.offset += n as u64;
                    transferred += n;
                    let read_side = ev.kind == EvKind::Read;
                    let b = st.buf().expect("transfer loop without a buffer");
                    if read_side {
                        b.advance(n);
                    } else {
                        b.consume(n);
                    }
                    if b.transfer_size() == 0 {
                        break;
                    }
                    if read_side && st.flags.contains(TaskFlags::CB_AFTER_EVERY_READ) {
                        break;
                    }
                }
            }
        }
    }

    let flow = call_io_cb(st, wkr, error, eof, transferred);
    if !direct {
        handler_post(st, ev.kind, flow);
    }
    flow
}

fn notify_handler(st: &mut TaskState, wkr: &Arc<Worker>, ev: &Event) {
    let (error, eof, available) = handler_pre(st, ev);
    let mut cb = std::mem::replace(&mut st.cb, TaskCb::Vacant);
    let flow = if let TaskCb::Notify(f) = &mut cb {
        f(&mut TaskCtx { st, wkr }, error, eof, available)
    } else {
        TaskFlow::Error
    };
    if matches!(st.cb, TaskCb::Vacant) {
        st.cb = cb;
    }
    handler_post(st, ev.kind, flow);
}

fn call_pkt_cb(
    st: &mut TaskState,
    wkr: &Arc<Worker>,
    error: Option<Errno>,
    peer: Option<std::net::SocketAddr>,
    len: usize,
) -> TaskFlow {
    let mut cb = std::mem::replace(&mut st.cb, TaskCb::Vacant);
    let flow = if let TaskCb::PktRcvr(f) = &mut cb {
        f(&mut TaskCtx { st, wkr }, error, peer, len)
    } else {
        TaskFlow::Error
    };
    if matches!(st.cb, TaskCb::Vacant) {
        st.cb = cb;
    }
    flow
}

fn pkt_rcvr_handler(st: &mut TaskState, wkr: &Arc<Worker>, ev: &Event) {
    let (mut error, _eof, budget) = handler_pre(st, ev);
    if ev.kind == EvKind::Write {
        error = Some(Errno::INVAL);
    }
    let mut flow = TaskFlow::Continue;
    if let Some(e) = error {
        flow = call_pkt_cb(st, wkr, Some(e), None, 0);
        if flow != TaskFlow::Continue {
            return;
        }
        if budget == 0 {
            handler_post(st, ev.kind, flow);
            return;
        }
        // The callback wants to keep going; try to receive anyway.
    }

    let mut transferred: u64 = 0;
    while transferred < budget {
        let fd = st.ident as RawFd;
        let (ptr, len) = match st.buf() {
            Some(b) => (b.chunk_mut_ptr(), b.transfer_size()),
            None => break,
        };
        match skt::recvfrom_raw(fd, ptr, len) {
            Err(e) => {
                match skt::err_filter(e) {
                    None => {
                        // Queue drained.
                        flow = TaskFlow::Continue;
                        break;
                    }
                    Some(e) => {
                        flow = call_pkt_cb(st, wkr, Some(e), None, 0);
                        if flow != TaskFlow::Continue {
                            return;
                        }
                        // As above: the callback asked to keep receiving.
                    }
                }
            }
            Ok((0, _)) => break,
            Ok((n, peer)) => {
                transferred += n as u64;
                st.buf().expect("datagram task without a buffer").advance(n);
                flow = call_pkt_cb(st, wkr, None, peer, n);
                if flow != TaskFlow::Continue {
                    return;
                }
            }
        }
    }
    handler_post(st, ev.kind, flow);
}

fn call_accept_cb(
    st: &mut TaskState,
    wkr: &Arc<Worker>,
    error: Option<Errno>,
    conn: Option<(std::os::fd::OwnedFd, Option<std::net::SocketAddr>)>,
) -> TaskFlow {
    let mut cb = std::mem::replace(&mut st.cb, TaskCb::Vacant);
    let flow = if let TaskCb::Accept(f) = &mut cb {
        f(&mut TaskCtx { st, wkr }, error, conn)
    } else {
        TaskFlow::Error
    };
    if matches!(st.cb, TaskCb::Vacant) {
        st.cb = cb;
    }
    flow
}

fn accept_handler(st: &mut TaskState, wkr: &Arc<Worker>, ev: &Event) {
    let (mut error, _eof, budget) = handler_pre(st, ev);
    if ev.kind == EvKind::Write {
        error = Some(Errno::INVAL);
    }
    if let Some(e) = error {
        let flow = call_accept_cb(st, wkr, Some(e), None);
        handler_post(st, ev.kind, flow);
        return;
    }

    // Accept everything the kernel reported (or everything there is).
    let mut flow = TaskFlow::Continue;
    let mut accepted: u64 = 0;
    while accepted < budget {
        match skt::accept(st.ident as RawFd) {
            Err(e) => {
                match skt::err_filter(e) {
                    None => {
                        // No more pending connections.
                        flow = TaskFlow::Continue;
                        break;
                    }
                    Some(e) => {
                        let flow = call_accept_cb(st, wkr, Some(e), None);
                        handler_post(st, ev.kind, flow);
                        return;
                    }
                }
            }
            Ok((fd, peer)) => {
                accepted += 1;
                flow = call_accept_cb(st, wkr, None, Some((fd, peer)));
                if flow != TaskFlow::Continue {
                    return;
                }
            }
        }
    }
    handler_post(st, ev.kind, flow);
}

fn connect_handler(st: &mut TaskState, wkr: &Arc<Worker>, ev: &Event) {
    let error = if ev.kind == EvKind::Timer {
        Some(Errno::TIMEDOUT)
    } else {
        ev.flags.contains(EvFlags::ERROR).then(|| ev.errno.unwrap_or(Errno::INVAL))
    };
    // Stopped on both readiness and timeout; the callback owns what
    // happens to the socket next.
    stop_locked(st);
    let mut cb = std::mem::replace(&mut st.cb, TaskCb::Vacant);
    if let TaskCb::Connect(f) = &mut cb {
        f(&mut TaskCtx { st, wkr }, error);
    }
    if matches!(st.cb, TaskCb::Vacant) {
        st.cb = cb;
    }
}

impl IoTask {
    /// Creates and starts a readiness notifier: the callback fires when
    /// `ident` becomes ready for `kind`, with no transfer performed.
    pub fn notify(
        wkr: &Arc<Worker>,
        ident: Ident,
        flags: TaskFlags,
        kind: EvKind,
        timeout_ms: u64,
        cb: NotifyCb,
    ) -> Result<Self> {
        let task = Self::new_raw(
            Arc::clone(wkr),
            ident,
            Discipline::Notify,
            flags & TaskFlags::CLOSE_ON_DESTROY,
        );
        {
            let mut st = task.shared.state.lock().expect("task state poisoned");
            st.ev_kind = kind;
            st.timeout_ms = timeout_ms;
            st.cb = TaskCb::Notify(cb);
            restart_locked(&mut st)?;
        }
        Ok(task)
    }

    /// Creates and starts a datagram receiver: one callback per packet,
    /// with the peer address of each.
    pub fn pkt_rcvr(
        wkr: &Arc<Worker>,
        ident: Ident,
        flags: TaskFlags,
        timeout_ms: u64,
        buf: super::IoBuf,
        cb: PktRcvrCb,
    ) -> Result<Self> {
        let flags = (flags & TaskFlags::CLOSE_ON_DESTROY) | TaskFlags::CB_AFTER_EVERY_READ;
        let task = Self::new_raw(Arc::clone(wkr), ident, Discipline::PktRcvr, flags);
        {
            let mut st = task.shared.state.lock().expect("task state poisoned");
            st.ev_kind = EvKind::Read;
            st.timeout_ms = timeout_ms;
            st.payload = super::task::TaskPayload::Buf(buf);
            st.cb = TaskCb::PktRcvr(cb);
            restart_locked(&mut st)?;
        }
        Ok(task)
    }

    /// Creates and starts an accept loop on a listening socket.
    pub fn accept(
        wkr: &Arc<Worker>,
        ident: Ident,
        flags: TaskFlags,
        timeout_ms: u64,
        cb: AcceptCb,
    ) -> Result<Self> {
        let task = Self::new_raw(
            Arc::clone(wkr),
            ident,
            Discipline::Accept,
            flags & TaskFlags::CLOSE_ON_DESTROY,
        );
        {
            let mut st = task.shared.state.lock().expect("task state poisoned");
            st.ev_kind = EvKind::Read;
            st.timeout_ms = timeout_ms;
            st.cb = TaskCb::Accept(cb);
            restart_locked(&mut st)?;
        }
        Ok(task)
    }

    /// Creates and starts a connect watcher: one callback when the
    /// non-blocking connect on `ident` resolves (writable, error, or
    /// timeout). The task stops itself before the callback runs.
    pub fn connect(
        wkr: &Arc<Worker>,
        ident: Ident,
        flags: TaskFlags,
        timeout_ms: u64,
        cb: ConnectCb,
    ) -> Result<Self> {
        let task = Self::new_raw(
            Arc::clone(wkr),
            ident,
            Discipline::Connect,
            flags & TaskFlags::CLOSE_ON_DESTROY,
        );
        {
            let mut st = task.shared.state.lock().expect("task state poisoned");
            st.ev_kind = EvKind::Write;
            st.ev_flags = EvFlags::ONESHOT;
            st.timeout_ms = timeout_ms;
            st.cb = TaskCb::Connect(cb);
            restart_locked(&mut st)?;
        }
        Ok(task)
    }

    /// Creates and starts a send task over a just-connected socket:
    /// `timeout_ms` covers the connect completion, then each write round.
    pub fn connect_send(
        wkr: &Arc<Worker>,
        ident: Ident,
        flags: TaskFlags,
        timeout_ms: u64,
        buf: super::IoBuf,
        cb: IoCb,
    ) -> Result<Self> {
        let task = Self::sr(wkr, ident, flags & TaskFlags::CLOSE_ON_DESTROY);
        task.start(EvKind::Write, EvFlags::empty(), timeout_ms, 0, Some(buf), cb)?;
        Ok(task)
    }
}
