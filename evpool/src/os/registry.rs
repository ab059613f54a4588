// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-worker registration bookkeeping, shared by both backends.
//!
//! The kernel only carries an opaque slot number per registration; every
//! piece of state the reactor needs on delivery (the original kind and
//! flags, the disabled bit, the Linux timer descriptor) lives here in an
//! explicit record instead of being packed into a machine word.

use crate::event::{EvFlags, EvKind, EventCb, Ident};
use std::{collections::HashMap, os::fd::OwnedFd};

/// Slot number reserved for the subscribed pool-virtual-thread handle.
pub(crate) const PVT_SLOT: u64 = 0;

/// Registration namespace: one I/O registration per ident (read or write,
/// whichever was added last) plus one timer registration per ident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SlotClass {
    Io,
    Timer,
}

impl SlotClass {
    pub(crate) fn of(kind: EvKind) -> Self {
        match kind {
            EvKind::Read | EvKind::Write => Self::Io,
            EvKind::Timer => Self::Timer,
        }
    }
}

/// One live registration.
pub(crate) struct Registration {
    pub(crate) ident: Ident,
    pub(crate) kind: EvKind,
    /// Set-side flags as passed at registration/enable time.
    pub(crate) flags: EvFlags,
    /// Disabled registrations swallow deliveries without invoking the
    /// callback (`DISPATCH` auto-disable, explicit disable).
    pub(crate) disabled: bool,
    /// Linux: the timerfd backing a timer registration.
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub(crate) timer_fd: Option<OwnedFd>,
    pub(crate) cb: EventCb,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("ident", &self.ident)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

/// Slot table plus the ident index used by add/delete/enable.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    slots: HashMap<u64, Registration>,
    by_ident: HashMap<(Ident, SlotClass), u64>,
    next_slot: u64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        // Slot 0 is the PVT subscription.
        Self { slots: HashMap::new(), by_ident: HashMap::new(), next_slot: PVT_SLOT + 1 }
    }

    pub(crate) fn lookup(&self, ident: Ident, class: SlotClass) -> Option<u64> {
        self.by_ident.get(&(ident, class)).copied()
    }

    pub(crate) fn get_mut(&mut self, slot: u64) -> Option<&mut Registration> {
        self.slots.get_mut(&slot)
    }

    /// Inserts a fresh registration and returns its slot.
    pub(crate) fn insert(&mut self, reg: Registration) -> u64 {
        let slot = self.next_slot;
        self.next_slot = self.next_slot.wrapping_add(1).max(PVT_SLOT + 1);
        self.by_ident.insert((reg.ident, SlotClass::of(reg.kind)), slot);
        self.slots.insert(slot, reg);
        slot
    }

    /// Removes a registration by slot, returning it.
    pub(crate) fn remove(&mut self, slot: u64) -> Option<Registration> {
        let reg = self.slots.remove(&slot)?;
        self.by_ident.remove(&(reg.ident, SlotClass::of(reg.kind)));
        Some(reg)
    }
}
