// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words sockaddrs ONESHOT

//! Multi-address connect with bounded retries, inter-attempt delay,
//! round-robin traversal, and a wall-clock deadline.
//!
//! Each attempt is an ordinary one-shot write-readiness task over a fresh
//! non-blocking connect; between attempts the task parks on its timer with
//! the socket slot vacant, which is how the handler tells a retry delay
//! from an I/O timeout.

use super::task::{ConnectExCb, Discipline, IoTask, TaskCb, TaskCtx, TaskFlags, TaskState};
use crate::{
    error::{Error, Result},
    event::{Ev, EvFlags, EvKind, Event, TimerFlags, IDENT_NONE},
    net::socket as skt,
    pool::Worker,
};
use rustix::io::Errno;
use std::{
    net::SocketAddr,
    os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd},
    sync::Arc,
    time::Instant,
};

bitflags::bitflags! {
    /// Traversal options for [`ConnectParams`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnectExFlags: u32 {
        /// Wait `retry_delay_ms` before the first attempt; requires a
        /// nonzero delay.
        const INITIAL_DELAY = 1 << 0;
        /// After a failure move to the next address; one round across the
        /// list counts as one try. Implied by `max_tries == 0`.
        const ROUND_ROBIN = 1 << 1;
    }
}

/// Destination list and retry policy for [`IoTask::connect_ex`].
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Wall-clock budget for the whole run, in milliseconds; `0` = none.
    pub time_limit_ms: u64,
    /// Delay between attempts (or rounds, in round-robin mode), ms.
    pub retry_delay_ms: u64,
    /// Attempts per address (or rounds, in round-robin mode); `0` =
    /// unlimited and forces round-robin.
    pub max_tries: u64,
    pub flags: ConnectExFlags,
    /// Socket protocol; `0` lets the OS pick (TCP for stream sockets).
    pub protocol: i32,
    /// Addresses to try, in order.
    pub addrs: Vec<SocketAddr>,
}

impl ConnectParams {
    fn round_robin(&self) -> bool {
        self.max_tries == 0 || self.flags.contains(ConnectExFlags::ROUND_ROBIN)
    }
}

/// Terminal and per-attempt outcomes delivered to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnExStatus {
    /// Connected; the task's ident is the live socket.
    Connected,
    /// One attempt failed (reported only with
    /// [`TaskFlags::CB_AFTER_EVERY_READ`]).
    Failed(Errno),
    /// Out of tries, addresses, or wall-clock budget. Always terminal.
    Exhausted,
}

/// Connect-ex cursors, carried in the task payload.
pub(crate) struct ConnExState {
    pub(crate) prms: ConnectParams,
    /// Index into `prms.addrs` of the attempt in flight.
    pub(crate) addr_cur: usize,
    /// Tries burned on the current address (per-address mode) or rounds
    /// completed (round-robin mode).
    pub(crate) try_no: u64,
    /// Set when a time limit is configured.
    pub(crate) started: Option<Instant>,
}

/// Why an attempt could not be scheduled.
enum StartErr {
    /// Out of tries/addresses/time; terminal.
    Exhausted,
    /// This attempt failed to set up; the caller advances and retries.
    Os(Errno),
}

fn call_cb(st: &mut TaskState, wkr: &Arc<Worker>, status: ConnExStatus) -> super::TaskFlow {
    let addr_idx = st.connect_state_mut().map_or(0, |cs| cs.addr_cur);
    let mut cb = std::mem::replace(&mut st.cb, TaskCb::Vacant);
    let flow = if let TaskCb::ConnectEx(f) = &mut cb {
        f(&mut TaskCtx { st, wkr }, status, addr_idx)
    } else {
        super::TaskFlow::Error
    };
    if matches!(st.cb, TaskCb::Vacant) {
        st.cb = cb;
    }
    flow
}

fn close_ident(st: &mut TaskState) {
    if st.ident != IDENT_NONE {
        drop(unsafe { OwnedFd::from_raw_fd(st.ident as RawFd) });
        st.ident = IDENT_NONE;
    }
}

fn advance(st: &mut TaskState) {
    let Some(cs) = st.connect_state_mut() else { return };
    if cs.prms.round_robin() {
        cs.addr_cur += 1;
    } else {
        cs.try_no += 1;
    }
}

/// Parks the task on its timer for the retry delay, bounded by whatever is
/// left of the wall clock.
fn schedule_delay(st: &mut TaskState, remaining_ms: Option<u64>) -> std::result::Result<(), StartErr> {
    let delay = st.connect_state_mut().map_or(0, |cs| cs.prms.retry_delay_ms);
    if let Some(remaining) = remaining_ms {
        if delay >= remaining {
            return Err(StartErr::Exhausted);
        }
    }
    let cb = st.reactor_cb.clone().ok_or(StartErr::Os(Errno::INVAL))?;
    st.wkr
        .ev_add(&Ev::timer(EvFlags::DISPATCH, TimerFlags::empty(), delay), st.timer_ident, cb)
        .map_err(|e| StartErr::Os(e.errno().unwrap_or(Errno::INVAL)))
}

/// Advances the schedule (deadline, cursors, inter-attempt delay) and,
/// when an attempt is due now, creates the socket and arms the one-shot
/// write watch. `do_connect` skips the schedule checks - used when the
/// delay timer has just fired.
fn start_attempt(st: &mut TaskState, do_connect: bool) -> std::result::Result<(), StartErr> {
    enum Next {
        Connect,
        Delay(Option<u64>),
    }
    if !do_connect {
        let next = {
            let Some(cs) = st.connect_state_mut() else {
                return Err(StartErr::Os(Errno::INVAL));
            };
            if cs.try_no == 0 && cs.addr_cur == 0 {
                // First attempt; only the optional initial delay applies.
                if cs.prms.flags.contains(ConnectExFlags::INITIAL_DELAY)
                    && cs.prms.retry_delay_ms != 0
                {
                    Next::Delay(None)
                } else {
                    Next::Connect
                }
            } else {
                let mut remaining = None;
                if cs.prms.time_limit_ms != 0 {
                    let elapsed = cs
                        .started
                        .map_or(0, |t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX));
                    if cs.prms.time_limit_ms <= elapsed {
                        return Err(StartErr::Exhausted);
                    }
                    remaining = Some(cs.prms.time_limit_ms - elapsed);
                }
                if cs.prms.round_robin() {
                    if cs.addr_cur >= cs.prms.addrs.len() {
                        // Round complete: next pass, after the delay.
                        cs.addr_cur = 0;
                        cs.try_no += 1;
                        if cs.prms.max_tries != 0 && cs.try_no >= cs.prms.max_tries {
                            return Err(StartErr::Exhausted);
                        }
                        if cs.prms.retry_delay_ms != 0 {
                            Next::Delay(remaining)
                        } else {
                            Next::Connect
                        }
                    } else {
                        Next::Connect
                    }
                } else {
                    if cs.try_no >= cs.prms.max_tries {
                        cs.addr_cur += 1;
                        cs.try_no = 0;
                        if cs.addr_cur >= cs.prms.addrs.len() {
                            return Err(StartErr::Exhausted);
                        }
                    }
                    if cs.prms.retry_delay_ms != 0 {
                        Next::Delay(remaining)
                    } else {
                        Next::Connect
                    }
                }
            }
        };
        if let Next::Delay(remaining) = next {
            return schedule_delay(st, remaining);
        }
    }

    // Create the socket and watch for writability.
    let (addr, protocol) = {
        let cs = st.connect_state_mut().expect("connect task without parameters");
        let Some(addr) = cs.prms.addrs.get(cs.addr_cur).copied() else {
            return Err(StartErr::Exhausted);
        };
        (addr, cs.prms.protocol)
    };
    let fd = skt::connect(&addr, libc::SOCK_STREAM, protocol, crate::net::SoFlags::NONBLOCK)
        .map_err(|e| StartErr::Os(e.errno().unwrap_or(Errno::INVAL)))?;
    st.ident = fd.into_raw_fd() as u64;
    st.ev_kind = EvKind::Write;
    st.ev_flags = EvFlags::ONESHOT;
    if let Err(e) = super::handlers::restart_locked(st) {
        close_ident(st);
        return Err(StartErr::Os(e.errno().unwrap_or(Errno::INVAL)));
    }
    Ok(())
}

/// Reactor callback body: readiness resolves the attempt in flight, the
/// timer is either the per-attempt timeout or the retry delay.
pub(crate) fn handler(st: &mut TaskState, wkr: &Arc<Worker>, ev: &Event) {
    let mut from_delay = false;
    let error: Option<Errno>;
    if ev.kind == EvKind::Timer {
        if st.ident == IDENT_NONE {
            // No socket in flight: the retry delay expired.
            from_delay = true;
            error = None;
        } else {
            error = Some(Errno::TIMEDOUT);
        }
    } else {
        error =
            ev.flags.contains(EvFlags::ERROR).then(|| ev.errno.unwrap_or(Errno::INVAL));
    }

    if !from_delay {
        super::handlers::stop_locked(st);
        if error.is_none() {
            // Connected: terminal report, the socket stays with the task.
            let _ = call_cb(st, wkr, ConnExStatus::Connected);
            return;
        }
        close_ident(st);
    }

    let mut pending: Option<StartErr> =
        if from_delay { None } else { error.map(StartErr::Os) };
    let mut do_connect = from_delay;
    loop {
        if let Some(e) = pending.take() {
            let (status, terminal) = match e {
                StartErr::Exhausted => (ConnExStatus::Exhausted, true),
                StartErr::Os(errno) => (ConnExStatus::Failed(errno), false),
            };
            if terminal || st.flags.contains(TaskFlags::CB_AFTER_EVERY_READ) {
                let flow = call_cb(st, wkr, status);
                if terminal || flow != super::TaskFlow::Continue {
                    return;
                }
            }
            advance(st);
        }
        match start_attempt(st, do_connect) {
            Ok(()) => return, // Attempt (or delay) scheduled.
            Err(e) => {
                pending = Some(e);
                do_connect = false;
            }
        }
    }
}

impl IoTask {
    /// Creates and starts a retrying multi-address connect.
    ///
    /// `timeout_ms` bounds each individual attempt. With a nonzero
    /// `time_limit_ms` the parameters must satisfy
    /// `0 < timeout_ms < time_limit_ms` and
    /// `retry_delay_ms < time_limit_ms`. The callback fires exactly once
    /// with [`ConnExStatus::Connected`] or [`ConnExStatus::Exhausted`];
    /// with [`TaskFlags::CB_AFTER_EVERY_READ`] it additionally fires per
    /// failed attempt.
    pub fn connect_ex(
        wkr: &Arc<Worker>,
        flags: TaskFlags,
        timeout_ms: u64,
        prms: ConnectParams,
        cb: ConnectExCb,
    ) -> Result<Self> {
        if prms.addrs.is_empty() {
            return Err(Error::InvalidArg("connect_ex needs at least one address"));
        }
        if prms.flags.contains(ConnectExFlags::INITIAL_DELAY) && prms.retry_delay_ms == 0 {
            return Err(Error::InvalidArg("INITIAL_DELAY requires a nonzero retry delay"));
        }
        if prms.time_limit_ms != 0 {
            if timeout_ms == 0 || timeout_ms >= prms.time_limit_ms {
                return Err(Error::InvalidArg(
                    "attempt timeout must be nonzero and below the time limit",
                ));
            }
            if prms.retry_delay_ms >= prms.time_limit_ms {
                return Err(Error::InvalidArg("retry delay must be below the time limit"));
            }
        }
        let flags = flags & (TaskFlags::CLOSE_ON_DESTROY | TaskFlags::CB_AFTER_EVERY_READ);
        let task = Self::new_raw(Arc::clone(wkr), IDENT_NONE, Discipline::ConnectEx, flags);
        {
            let mut st = task.shared.state.lock().expect("task state poisoned");
            st.timeout_ms = timeout_ms;
            let started = (prms.time_limit_ms != 0).then(Instant::now);
            st.payload = super::task::TaskPayload::Connect(ConnExState {
                prms,
                addr_cur: 0,
                try_no: 0,
                started,
            });
            st.cb = TaskCb::ConnectEx(cb);

            // Schedule the first attempt, walking the address list for
            // immediately-failing setups.
            loop {
                match start_attempt(&mut st, false) {
                    Ok(()) => break,
                    Err(StartErr::Exhausted) => return Err(Error::Exhausted),
                    Err(StartErr::Os(_)) => advance(&mut st),
                }
            }
        }
        Ok(task)
    }
}
