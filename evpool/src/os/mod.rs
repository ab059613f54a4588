// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! OS event-multiplexer backends. One `Poller` per worker; epoll on
//! Linux, kqueue on the BSD family and macOS. Both backends expose the
//! same surface, keep per-registration state in explicit registration
//! records, and translate kernel readiness into [`Event`] deliveries.
//!
//! [`Event`]: crate::event::Event

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::Poller;

mod registry;

use crate::event::{Event, EventCb};

/// One turn of a worker's wait call.
pub(crate) enum Wake {
    /// A registration fired; invoke `cb` with the translated event.
    Delivery(EventCb, Event),
    /// The subscribed pool-virtual-thread poll handle is readable; the
    /// worker should drain one event from it.
    PvtReady,
    /// Timeout, interruption, or a stale/disabled delivery; go around.
    Nothing,
}
