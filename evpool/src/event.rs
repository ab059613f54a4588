// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words ONESHOT ABSTIME fflags

//! Event model shared by every multiplexer backend: kinds, flags, timer
//! units, readiness magnitudes, and the registration/delivery records.

use crate::{
    error::{Error, Result},
    pool::Worker,
};
use rustix::io::Errno;
use std::sync::Arc;

/// Registration identifier: a descriptor for read/write events, or any
/// process-unique number for timers.
pub type Ident = u64;

/// Sentinel for "no descriptor bound" (a task before connect-ex picks an
/// address, or after its socket was closed for a retry).
pub const IDENT_NONE: Ident = u64::MAX;

/// What readiness the registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvKind {
    /// Descriptor readable.
    Read,
    /// Descriptor writable.
    Write,
    /// Timer expiration.
    Timer,
}

bitflags::bitflags! {
    /// Event action flags. The set-side bits select delivery semantics; the
    /// return-side bits are filled in by the reactor on delivery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EvFlags: u16 {
        /// Remove the registration after one delivery.
        const ONESHOT = 1 << 0;
        /// Disable (but keep) the registration after one delivery; the
        /// owner must re-enable it.
        const DISPATCH = 1 << 1;
        /// Edge-triggered: deliver only on readiness transitions.
        const EDGE = 1 << 2;
        /// Return only: peer closed / end of file.
        const EOF = 1 << 3;
        /// Return only: an error is pending; see [`Event::errno`].
        const ERROR = 1 << 4;
    }
}

impl EvFlags {
    /// Bits a caller may pass at registration time.
    pub const SET_MASK: Self = Self::ONESHOT.union(Self::DISPATCH).union(Self::EDGE);
}

bitflags::bitflags! {
    /// Timer filter flags: the unit of [`Ev::data`], plus absolute-deadline
    /// mode. No unit bit selects milliseconds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimerFlags: u32 {
        /// `data` is seconds.
        const SEC = 1 << 0;
        /// `data` is milliseconds (the default).
        const MSEC = 1 << 1;
        /// `data` is microseconds.
        const USEC = 1 << 2;
        /// `data` is nanoseconds.
        const NSEC = 1 << 3;
        /// `data` is an absolute wall-clock deadline.
        const ABSTIME = 1 << 4;
    }
}

impl TimerFlags {
    /// The unit-selecting bits.
    pub const UNIT_MASK: Self = Self::SEC
        .union(Self::MSEC)
        .union(Self::USEC)
        .union(Self::NSEC);

    /// Converts `data` in the selected unit into `(seconds, nanoseconds)`.
    #[must_use]
    pub(crate) fn to_timespec_parts(self, data: u64) -> (u64, u64) {
        let unit = self.intersection(Self::UNIT_MASK);
        if unit == Self::SEC {
            (data, 0)
        } else if unit == Self::USEC {
            (data / 1_000_000, (data % 1_000_000) * 1_000)
        } else if unit == Self::NSEC {
            (data / 1_000_000_000, data % 1_000_000_000)
        } else {
            // MSEC and "no unit bit" both mean milliseconds.
            (data / 1_000, (data % 1_000) * 1_000_000)
        }
    }
}

/// Readiness magnitude reported on delivery: bytes readable, send-buffer
/// space, pending connections, or timer expirations.
///
/// `Unbounded` means "transfer until the kernel reports would-block"; the
/// epoll backend reports it for all read/write deliveries because epoll
/// does not return a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// No kernel-reported bound; drain until would-block.
    Unbounded,
    /// Kernel-reported magnitude.
    Count(u64),
}

impl Readiness {
    /// The magnitude as a saturating limit for transfer loops.
    #[must_use]
    pub fn limit(self) -> u64 {
        match self {
            Self::Unbounded => u64::MAX,
            Self::Count(n) => n,
        }
    }
}

/// A registration request: what to wait for and how to deliver it.
#[derive(Debug, Clone, Copy)]
pub struct Ev {
    /// Readiness kind.
    pub kind: EvKind,
    /// Set-side action flags.
    pub flags: EvFlags,
    /// Timer unit/mode flags; empty for read/write events.
    pub fflags: TimerFlags,
    /// Timer value in the selected unit; unused for read/write events.
    pub data: u64,
}

impl Ev {
    /// A read-readiness registration.
    #[must_use]
    pub fn read(flags: EvFlags) -> Self {
        Self { kind: EvKind::Read, flags, fflags: TimerFlags::empty(), data: 0 }
    }

    /// A write-readiness registration.
    #[must_use]
    pub fn write(flags: EvFlags) -> Self {
        Self { kind: EvKind::Write, flags, fflags: TimerFlags::empty(), data: 0 }
    }

    /// A timer registration; `data` is interpreted per `fflags`.
    #[must_use]
    pub fn timer(flags: EvFlags, fflags: TimerFlags, data: u64) -> Self {
        Self { kind: EvKind::Timer, flags, fflags, data }
    }

    /// Validates the set-side flag and timer-unit combinations.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.flags.intersects(EvFlags::EOF | EvFlags::ERROR) {
            return Err(Error::InvalidArg("return-only event flags passed at registration"));
        }
        match self.kind {
            EvKind::Read | EvKind::Write => {
                if !self.fflags.is_empty() {
                    return Err(Error::InvalidArg("timer flags on a read/write event"));
                }
            }
            EvKind::Timer => {
                let unit = self.fflags.intersection(TimerFlags::UNIT_MASK);
                if unit.bits().count_ones() > 1 {
                    return Err(Error::InvalidArg("more than one timer unit selected"));
                }
                if self.fflags.contains(TimerFlags::ABSTIME)
                    && !self.flags.contains(EvFlags::ONESHOT)
                {
                    // A periodic absolute-deadline timer has no meaning.
                    return Err(Error::InvalidArg("ABSTIME timer requires ONESHOT"));
                }
            }
        }
        Ok(())
    }
}

/// A delivered event, handed to the registered callback.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Readiness kind of the registration that fired.
    pub kind: EvKind,
    /// Return-side flags (`EOF`, `ERROR`).
    pub flags: EvFlags,
    /// Pending socket error when `ERROR` is set.
    pub errno: Option<Errno>,
    /// Readiness magnitude.
    pub data: Readiness,
    /// The ident the callback was registered under.
    pub ident: Ident,
}

impl Event {
    pub(crate) fn new(kind: EvKind, ident: Ident) -> Self {
        Self { kind, flags: EvFlags::empty(), errno: None, data: Readiness::Unbounded, ident }
    }
}

/// A reactor callback. The registry owns it; dispatch clones the `Arc` and
/// releases all internal locks before invoking, so callbacks are free to
/// register, remove, or re-enable events on any worker.
pub type EventCb = Arc<dyn Fn(&Arc<Worker>, &Event) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn timer_unit_conversion() {
        assert_eq!(TimerFlags::SEC.to_timespec_parts(3), (3, 0));
        assert_eq!(TimerFlags::empty().to_timespec_parts(1_500), (1, 500_000_000));
        assert_eq!(TimerFlags::MSEC.to_timespec_parts(14), (0, 14_000_000));
        assert_eq!(TimerFlags::USEC.to_timespec_parts(2_000_001), (2, 1_000));
        assert_eq!(TimerFlags::NSEC.to_timespec_parts(1_000_000_007), (1, 7));
    }

    #[test]
    fn validation_rejects_bad_combinations() {
        assert!(Ev::read(EvFlags::EOF).validate().is_err());
        assert!(
            Ev::timer(EvFlags::empty(), TimerFlags::SEC | TimerFlags::MSEC, 1)
                .validate()
                .is_err()
        );
        assert!(
            Ev::timer(EvFlags::empty(), TimerFlags::ABSTIME, 1)
                .validate()
                .is_err()
        );
        assert!(
            Ev::timer(EvFlags::ONESHOT, TimerFlags::ABSTIME, 1)
                .validate()
                .is_ok()
        );
        assert!(Ev::read(EvFlags::ONESHOT | EvFlags::EDGE).validate().is_ok());
    }

    #[test]
    fn readiness_limit() {
        assert_eq!(Readiness::Unbounded.limit(), u64::MAX);
        assert_eq!(Readiness::Count(7).limit(), 7);
    }
}
