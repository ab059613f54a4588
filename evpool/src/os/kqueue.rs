// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words kqueue kevent EVFILT ONESHOT NSECONDS USECONDS MSECONDS ABSTIME

//! BSD-family backend: kqueue with native read/write/timer filters.
//!
//! The mapping is direct - `Read/Write/Timer` onto
//! `EVFILT_READ/EVFILT_WRITE/EVFILT_TIMER`, `ONESHOT/DISPATCH/EDGE` onto
//! `EV_ONESHOT/EV_DISPATCH/EV_CLEAR` - and events are posted one at a
//! time. The registry still carries the explicit per-registration record
//! so the dispatch surface matches the epoll backend.

use super::{
    registry::{Registration, Registry, SlotClass, PVT_SLOT},
    Wake,
};
use crate::{
    error::{last_errno, Error, Result},
    event::{Ev, EvFlags, EvKind, Event, EventCb, Ident, Readiness, TimerFlags},
};
use rustix::io::Errno;
use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Mutex,
};

/// Per-worker kqueue handle plus the registration table.
pub(crate) struct Poller {
    kq: OwnedFd,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("kq", &self.kq).finish_non_exhaustive()
    }
}

fn kq_filter(kind: EvKind) -> i16 {
    match kind {
        EvKind::Read => libc::EVFILT_READ as i16,
        EvKind::Write => libc::EVFILT_WRITE as i16,
        EvKind::Timer => libc::EVFILT_TIMER as i16,
    }
}

fn kq_flags(flags: EvFlags) -> u16 {
    let mut ret: u16 = 0;
    if flags.contains(EvFlags::ONESHOT) {
        ret |= libc::EV_ONESHOT as u16;
    }
    if flags.contains(EvFlags::DISPATCH) {
        ret |= libc::EV_DISPATCH as u16;
    }
    if flags.contains(EvFlags::EDGE) {
        ret |= libc::EV_CLEAR as u16;
    }
    ret
}

fn kq_timer_fflags(fflags: TimerFlags) -> u32 {
    let mut ret: u32 = 0;
    if fflags.contains(TimerFlags::ABSTIME) {
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            ret |= libc::NOTE_ABSOLUTE;
        }
        #[cfg(target_os = "freebsd")]
        {
            ret |= libc::NOTE_ABSTIME;
        }
    }
    let unit = fflags.intersection(TimerFlags::UNIT_MASK);
    if unit == TimerFlags::SEC {
        ret |= libc::NOTE_SECONDS;
    } else if unit == TimerFlags::USEC {
        ret |= libc::NOTE_USECONDS;
    } else if unit == TimerFlags::NSEC {
        ret |= libc::NOTE_NSECONDS;
    } else {
        // Milliseconds are the kqueue timer default.
        #[cfg(target_os = "freebsd")]
        {
            ret |= libc::NOTE_MSECONDS;
        }
    }
    ret
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::Os(last_errno()));
        }
        Ok(Self {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
            registry: Mutex::new(Registry::new()),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }

    /// Posts one change to the kqueue and surfaces in-kevent errors.
    fn post(&self, ident: u64, filter: i16, flags: u16, fflags: u32, data: i64, slot: u64) -> Result<()> {
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
        kev.ident = ident as libc::uintptr_t;
        kev.filter = filter as _;
        kev.flags = flags as _;
        kev.fflags = fflags as _;
        kev.data = data as _;
        kev.udata = slot as _;
        let rc = unsafe {
            libc::kevent(self.kq.as_raw_fd(), &kev, 1, std::ptr::null_mut(), 0, std::ptr::null())
        };
        if rc < 0 {
            return Err(Error::Os(last_errno()));
        }
        if u32::from(kev.flags as u16) & u32::from(libc::EV_ERROR as u16) != 0 && kev.data != 0 {
            return Err(Error::Os(Errno::from_raw_os_error(kev.data as i32)));
        }
        Ok(())
    }

    /// Subscribes the PVT's kqueue handle as an edge-triggered readable
    /// source; [`Self::rearm_pvt`] re-posts it after each wakeup.
    pub(crate) fn subscribe_pvt(&self, pvt_fd: RawFd) -> Result<()> {
        self.post(
            pvt_fd as u64,
            libc::EVFILT_READ as i16,
            (libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR) as u16,
            0,
            0,
            PVT_SLOT,
        )
    }

    /// Re-arms the edge trigger on the PVT handle after a wakeup, so a
    /// not-yet-drained queue wakes another worker.
    pub(crate) fn rearm_pvt(&self, pvt_fd: RawFd) -> Result<()> {
        self.subscribe_pvt(pvt_fd)
    }

    pub(crate) fn ev_add(&self, ev: &Ev, ident: Ident, cb: EventCb) -> Result<()> {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        let class = SlotClass::of(ev.kind);
        let mut flags = libc::EV_ADD as u16 | libc::EV_ENABLE as u16 | kq_flags(ev.flags);
        if ev.kind == EvKind::Timer {
            // Timer: force update semantics.
            flags |= (libc::EV_ADD | libc::EV_ENABLE) as u16;
        }
        let fflags = if ev.kind == EvKind::Timer { kq_timer_fflags(ev.fflags) } else { 0 };
        let data = if ev.kind == EvKind::Timer { ev.data as i64 } else { 0 };
        if let Some(slot) = reg.lookup(ident, class) {
            let r = reg.get_mut(slot).expect("indexed slot must exist");
            if class == SlotClass::Io && r.kind != ev.kind {
                // Kind changed: drop the old kernel filter first.
                drop(self.post(ident, kq_filter(r.kind), libc::EV_DELETE as u16, 0, 0, slot));
            }
            self.post(ident, kq_filter(ev.kind), flags, fflags, data, slot)?;
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
        if let Err(e) = self.post(ident, kq_filter(ev.kind), flags, fflags, data, slot) {
            reg.remove(slot);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn ev_del(&self, kind: EvKind, ident: Ident) -> Result<()> {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        let Some(slot) = reg.lookup(ident, SlotClass::of(kind)) else {
            return Err(Error::Os(Errno::NOENT));
        };
        let removed = reg.remove(slot).expect("indexed slot must exist");
        self.post(ident, kq_filter(removed.kind), libc::EV_DELETE as u16, 0, 0, slot)
    }

    pub(crate) fn ev_enable(&self, enable: bool, ev: &Ev, ident: Ident) -> Result<()> {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        let Some(slot) = reg.lookup(ident, SlotClass::of(ev.kind)) else {
            return Err(Error::Os(Errno::NOENT));
        };
        let r = reg.get_mut(slot).expect("indexed slot must exist");
        if enable {
            let mut flags = libc::EV_ENABLE as u16 | kq_flags(ev.flags);
            let (fflags, data) = if ev.kind == EvKind::Timer {
                // Timer enable re-adds, which re-arms the expiration.
                flags |= libc::EV_ADD as u16;
                (kq_timer_fflags(ev.fflags), ev.data as i64)
            } else {
                (0, 0)
            };
            self.post(ident, kq_filter(ev.kind), flags, fflags, data, slot)?;
            r.kind = ev.kind;
            r.flags = ev.flags;
            r.disabled = false;
        } else {
            self.post(ident, kq_filter(r.kind), libc::EV_DISABLE as u16, 0, 0, slot)?;
            r.disabled = true;
        }
        Ok(())
    }

    pub(crate) fn wait(&self, timeout_ms: i32) -> Result<Wake> {
        let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
        let ts;
        let ts_ptr: *const libc::timespec = if timeout_ms < 0 {
            std::ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1_000) as libc::time_t,
                tv_nsec: (timeout_ms % 1_000) as libc::c_long * 1_000_000,
            };
            &ts
        };
        let n = unsafe {
            libc::kevent(self.kq.as_raw_fd(), std::ptr::null(), 0, &mut kev, 1, ts_ptr)
        };
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
        let slot = kev.udata as u64;
        if slot == PVT_SLOT {
            return Ok(Wake::PvtReady);
        }
        Ok(self.deliver(slot, &kev))
    }

    fn deliver(&self, slot: u64, kev: &libc::kevent) -> Wake {
        let mut reg = self.registry.lock().expect("poller registry poisoned");
        let Some(r) = reg.get_mut(slot) else {
            tracing::debug!(slot, "delivery for unknown registration slot");
            return Wake::Nothing;
        };
        if r.disabled {
            return Wake::Nothing;
        }
        if r.ident != kev.ident as u64 {
            tracing::debug!(
                kq_ident = kev.ident as u64,
                reg_ident = r.ident,
                "delivery with mismatched ident"
            );
            return Wake::Nothing;
        }
        let (ident, kind, set_flags, cb) = (r.ident, r.kind, r.flags, r.cb.clone());
        if set_flags.contains(EvFlags::DISPATCH) {
            r.disabled = true;
        }
        if set_flags.contains(EvFlags::ONESHOT) {
            // The kernel dropped its side already.
            reg.remove(slot);
        }
        let mut ev = Event::new(kind, ident);
        ev.data = Readiness::Count(kev.data as u64);
        if u32::from(kev.flags as u16) & u32::from(libc::EV_EOF as u16) != 0 {
            ev.flags |= EvFlags::EOF;
            if kev.fflags != 0 {
                // Socket closed with an error pending.
                ev.flags |= EvFlags::ERROR;
                ev.errno = Some(Errno::from_raw_os_error(kev.fflags as i32));
            }
        }
        drop(reg);
        Wake::Delivery(cb, ev)
    }
}
