// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Thread pool: worker records and reactor loops, pool lifecycle, and the
//! cross-thread message queue.

mod msg;
mod pool;
mod worker;

pub use msg::{AsyncOp, BsendReport, MsgFlags, AOP_ARG_COUNT};
pub use pool::{PoolConfig, ShutdownToken, ThreadPool};
pub use worker::Worker;
