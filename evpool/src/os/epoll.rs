// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EPOLLIN EPOLLOUT EPOLLERR EPOLLHUP EPOLLRDHUP EPOLLPRI
// cspell:words EPOLLET EPOLLONESHOT timerfd itimerspec ABSTIME

//! Linux backend: epoll for readiness, one timerfd per timer registration.
//!
//! epoll does not hand back the registered kind/flags on delivery, so the
//! dispatcher reconstructs them from the worker's [`Registry`]. Timers are
//! emulated: each timer registration owns a non-blocking timerfd added to
//! the epoll set; the expiration count read from it becomes the event's
//! readiness magnitude.

use super::{
    registry::{Registration, Registry, SlotClass, PVT_SLOT},
    Wake,
};
use crate::{
    error::{last_errno, Error, Result},
    event::{Ev, EvFlags, EvKind, Event, EventCb, Ident, Readiness},
};
use rustix::io::Errno;
use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Mutex,
};

const EP_IN: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLPRI) as u32;
const EP_OUT: u32 = libc::EPOLLOUT as u32;
const EP_HUP: u32 = (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
const EP_ERR: u32 = libc::EPOLLERR as u32;
const EP_ET: u32 = 1u32 << 31; // EPOLLET; the libc constant is a negative i32.

/// Per-worker epoll handle plus the registration table.
pub(crate) struct Poller {
    epfd: OwnedFd,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("epfd", &self.epfd).finish_non_exhaustive()
    }
}

/// Interest bits for a read/write registration.
fn io_interest(kind: EvKind, flags: EvFlags) -> u32 {
    let mut ev = match kind {
        EvKind::Read => EP_IN,
        EvKind::Write => EP_OUT,
        EvKind::Timer => unreachable!("timers use timerfd"),
    };
    if flags.intersects(EvFlags::ONESHOT | EvFlags::DISPATCH) {
        ev |= libc::EPOLLONESHOT as u32;
    }
    if flags.contains(EvFlags::EDGE) {
        ev |= EP_ET;
    }
    ev
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(Error::Os(last_errno()));
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            registry: Mutex::new(Registry::new()),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.epfd.as_raw_fd()
    }

    /// Subscribes another poller's handle (the PVT) as a level-triggered
    /// readable source under the reserved slot.
    pub(crate) fn subscribe_pvt(&self, pvt_fd: RawFd) -> Result<()> {
        self.ctl_raw(libc::EPOLL_CTL_ADD, pvt_fd, libc::EPOLLIN as u32, PVT_SLOT)
    }

    /// Level-triggered PVT subscription needs no re-arm on this backend.
    pub(crate) fn rearm_pvt(&self, _pvt_fd: RawFd) -> Result<()> {
        Ok(())
    }

    fn ctl_raw(&self, op: libc::c_int, fd: RawFd, events: u32, slot: u64) -> Result<()> {
        let mut epev = libc::epoll_event { events, u64: slot };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut epev) } < 0 {
            return Err(Error::Os(last_errno()));
        }
        Ok(())
    }

    /// `epoll_ctl` with the usual cross-retry: `ADD` landing on `EEXIST`
    /// becomes `MOD`, `MOD` landing on `ENOENT` becomes `ADD`.
    fn ctl_io(&self, op: libc::c_int, fd: RawFd, events: u32, slot: u64) -> Result<()> {
        match self.ctl_raw(op, fd, events, slot) {
            Ok(()) => Ok(()),
            Err(Error::Os(e)) if e == Errno::EXIST && op == libc::EPOLL_CTL_ADD => {
                self.ctl_raw(libc::EPOLL_CTL_MOD, fd, events, slot)
            }
            Err(Error::Os(e)) if e == Errno::NOENT && op == libc::EPOLL_CTL_MOD => {
                self.ctl_raw(libc::EPOLL_CTL_ADD, fd, events, slot)
            }
            Err(e) => Err(e),
        }
    }

    fn arm_timerfd(tfd: RawFd, ev: &Ev) -> Result<()> {
        let (sec, nsec) = ev.fflags.to_timespec_parts(ev.data);
        let value = libc::timespec { tv_sec: sec as libc::time_t, tv_nsec: nsec as libc::c_long };
        let interval = if ev.flags.intersects(EvFlags::ONESHOT | EvFlags::DISPATCH) {
            // One-time expiration.
            libc::timespec { tv_sec: 0, tv_nsec: 0 }
        } else {
            value
        };
        let spec = libc::itimerspec { it_interval: interval, it_value: value };
        let flags = if ev.fflags.contains(crate::event::TimerFlags::ABSTIME) {
            libc::TFD_TIMER_ABSTIME
        } else {
            0
        };
        if unsafe { libc::timerfd_settime(tfd, flags, &spec, std::ptr::null_mut()) } < 0 {
            return Err(Error::Os(last_errno()));
        }
        Ok(())
    }

    fn disarm_timerfd(tfd: RawFd) -> Result<()> {
        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let spec = libc::itimerspec { it_interval: zero, it_value: zero };
        if unsafe { libc::timerfd_settime(tfd, 0, &spec, std::ptr::null_mut()) } < 0 {
            return Err(Error::Os(last_errno()));
        }
        Ok(())
    }

    /// Adds (or replaces) a registration.
    pub(crate) fn ev_add(&self, ev: &Ev, ident: Ident, cb: EventCb) -> Result<()> {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        match ev.kind {
            EvKind::Timer => {
                if let Some(slot) = reg.lookup(ident, SlotClass::Timer) {
                    // Re-arm the existing timer in place.
                    let r = reg.get_mut(slot).expect("indexed slot must exist");
                    let tfd =
                        r.timer_fd.as_ref().expect("timer registration without timerfd").as_raw_fd();
                    Self::arm_timerfd(tfd, ev)?;
                    r.flags = ev.flags;
                    r.disabled = false;
                    r.cb = cb;
                    return Ok(());
                }
                let clockid = if ev.fflags.contains(crate::event::TimerFlags::ABSTIME) {
                    libc::CLOCK_REALTIME
                } else {
                    libc::CLOCK_MONOTONIC
                };
                let tfd = unsafe { libc::timerfd_create(clockid, libc::TFD_NONBLOCK) };
                if tfd < 0 {
                    return Err(Error::Os(last_errno()));
                }
                let tfd = unsafe { OwnedFd::from_raw_fd(tfd) };
                let slot = reg.insert(Registration {
                    ident,
                    kind: EvKind::Timer,
                    flags: ev.flags,
                    disabled: false,
                    timer_fd: None, // installed below, after epoll add succeeds
                    cb,
                });
                // Never EPOLLONESHOT here: expiration control stays with
                // timerfd_settime.
                if let Err(e) =
                    self.ctl_raw(libc::EPOLL_CTL_ADD, tfd.as_raw_fd(), libc::EPOLLIN as u32, slot)
                {
                    reg.remove(slot);
                    return Err(e);
                }
                if let Err(e) = Self::arm_timerfd(tfd.as_raw_fd(), ev) {
                    reg.remove(slot);
                    return Err(e);
                }
                reg.get_mut(slot).expect("slot just inserted").timer_fd = Some(tfd);
                Ok(())
            }
            EvKind::Read | EvKind::Write => {
                let interest = io_interest(ev.kind, ev.flags);
                if let Some(slot) = reg.lookup(ident, SlotClass::Io) {
                    self.ctl_io(libc::EPOLL_CTL_MOD, ident as RawFd, interest, slot)?;
                    let r = reg.get_mut(slot).expect("indexed slot must exist");
                    r.kind = ev.kind;
                    r.flags = ev.flags;
                    r.disabled = false;
                    r.cb = cb;
                    return Ok(());
                }
                let slot = reg.insert(Registration {
                    ident,
                    kind: ev.kind,
                    flags: ev.flags,
                    disabled: false,
                    timer_fd: None,
                    cb,
                });
                if let Err(e) = self.ctl_io(libc::EPOLL_CTL_ADD, ident as RawFd, interest, slot) {
                    reg.remove(slot);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Removes a registration, freeing its kernel state.
    pub(crate) fn ev_del(&self, kind: EvKind, ident: Ident) -> Result<()> {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        let class = SlotClass::of(kind);
        let Some(slot) = reg.lookup(ident, class) else {
            return Err(Error::Os(Errno::NOENT));
        };
        let removed = reg.remove(slot).expect("indexed slot must exist");
        match class {
            // Dropping the timerfd also detaches it from epoll.
            SlotClass::Timer => Ok(()),
            SlotClass::Io => {
                drop(removed);
                self.ctl_raw(libc::EPOLL_CTL_DEL, ident as RawFd, 0, slot)
            }
        }
    }

    /// Enables or disables a registration in place.
    pub(crate) fn ev_enable(&self, enable: bool, ev: &Ev, ident: Ident) -> Result<()> {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        let class = SlotClass::of(ev.kind);
        let Some(slot) = reg.lookup(ident, class) else {
            return Err(Error::Os(Errno::NOENT));
        };
        let r = reg.get_mut(slot).expect("indexed slot must exist");
        match class {
            SlotClass::Timer => {
                let tfd =
                    r.timer_fd.as_ref().expect("timer registration without timerfd").as_raw_fd();
                if enable {
                    r.disabled = false;
                    r.flags = ev.flags;
                    Self::arm_timerfd(tfd, ev)
                } else {
                    r.disabled = true;
                    Self::disarm_timerfd(tfd)
                }
            }
            SlotClass::Io => {
                if enable {
                    r.disabled = false;
                    r.kind = ev.kind;
                    r.flags = ev.flags;
                    let interest = io_interest(ev.kind, ev.flags);
                    self.ctl_io(libc::EPOLL_CTL_MOD, ident as RawFd, interest, slot)
                } else {
                    r.disabled = true;
                    // Keep the entry installed but interest-free;
                    // edge-triggered so HUP/ERR report at most once.
                    self.ctl_io(libc::EPOLL_CTL_MOD, ident as RawFd, EP_ET, slot)
                }
            }
        }
    }

    /// Waits for at most one delivery. `timeout_ms < 0` blocks.
    pub(crate) fn wait(&self, timeout_ms: i32) -> Result<Wake> {
        let mut epev = libc::epoll_event { events: 0, u64: 0 };
        let n = unsafe { libc::epoll_wait(self.epfd.as_raw_fd(), &mut epev, 1, timeout_ms) };
        if n < 0 {
            let e = last_errno();
            if e == Errno::INTR {
                return Ok(Wake::Nothing);
            }
            return Err(Error::Os(e));
        }
        if n == 0 {
            return Ok(Wake::Nothing);
        }
        let slot = epev.u64;
        if slot == PVT_SLOT {
            return Ok(Wake::PvtReady);
        }
        Ok(self.deliver(slot, epev.events))
    }

    /// Translates one kernel delivery into an [`Event`], applying the
    /// oneshot/dispatch bookkeeping before the callback can run.
    fn deliver(&self, slot: u64, epbits: u32) -> Wake {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        let (ident, kind, set_flags, cb, tfd) = {
            let Some(r) = reg.get_mut(slot) else {
                tracing::debug!(slot, "delivery for unknown registration slot");
                return Wake::Nothing;
            };
            if r.disabled {
                return Wake::Nothing;
            }
            if r.flags.contains(EvFlags::DISPATCH) {
                r.disabled = true;
            }
            (
                r.ident,
                r.kind,
                r.flags,
                r.cb.clone(),
                r.timer_fd.as_ref().map(AsRawFd::as_raw_fd),
            )
        };
        let mut ev = Event::new(kind, ident);
        match kind {
            EvKind::Timer => {
                let tfd = tfd.expect("timer registration without timerfd");
                let mut expirations: u64 = 0;
                let n = unsafe {
                    libc::read(tfd, (&raw mut expirations).cast(), size_of::<u64>())
                };
                ev.data = Readiness::Count(if n == size_of::<u64>() as isize {
                    expirations
                } else {
                    0
                });
                if set_flags.contains(EvFlags::ONESHOT) {
                    // Dropping the timerfd detaches it from epoll.
                    reg.remove(slot);
                }
            }
            EvKind::Read | EvKind::Write => {
                ev.data = Readiness::Unbounded;
                if epbits & EP_HUP != 0 {
                    ev.flags |= EvFlags::EOF;
                }
                if epbits & EP_ERR != 0 {
                    ev.flags |= EvFlags::ERROR;
                    ev.errno = Some(socket_error(ident as RawFd));
                }
                if set_flags.contains(EvFlags::ONESHOT) {
                    reg.remove(slot);
                    drop(self.ctl_raw(libc::EPOLL_CTL_DEL, ident as RawFd, 0, slot));
                }
            }
        }
        drop(reg);
        Wake::Delivery(cb, ev)
    }
}

/// Pending error for a descriptor, via `SO_ERROR` when it is a socket.
fn socket_error(fd: RawFd) -> Errno {
    let mut val: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut val).cast(),
            &mut len,
        )
    };
    if rc == 0 && val != 0 {
        Errno::from_raw_os_error(val)
    } else {
        Errno::INVAL
    }
}
