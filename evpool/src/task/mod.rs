// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Descriptor-bound I/O tasks: a task composes a reactor registration, an
//! optional timeout timer, a buffer, and one of the canned I/O disciplines
//! into a unit that drives readiness events into an application callback.

mod buf;
mod connect_ex;
mod handlers;
mod listen;
#[allow(clippy::module_inception)]
mod task;

pub use buf::IoBuf;
pub use connect_ex::{ConnExStatus, ConnectExFlags, ConnectParams};
pub use task::{
    default_cb_check, AcceptCb, ConnectCb, ConnectExCb, EofFlags, IoCb, IoTask, NotifyCb,
    PktRcvrCb, TaskCtx, TaskFlags, TaskFlow,
};
