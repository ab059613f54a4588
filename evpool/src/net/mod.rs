// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Socket helpers consumed by the task layer: creation/bind/listen/accept/
//! connect primitives and the declarative socket-option applier.

mod opts;
pub(crate) mod socket;

pub use opts::{OptsMult, SktOpts, SoFlags};
pub use socket::{bind, connect, create, is_connect_error, listen};
