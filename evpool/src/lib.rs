// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue rcvr bsend cbsend

//! # evpool
//!
//! An event-driven worker-thread pool with descriptor-bound I/O tasks.
//!
//! Every worker runs its own reactor loop over the OS event multiplexer
//! (epoll on Linux, kqueue on the BSD family), waiting for **one** event
//! per iteration - fairness across descriptors is delegated to the
//! kernel. A *pool virtual thread* owns a multiplexer handle of its own
//! that every real worker subscribes to, so events registered on it are
//! picked up by whichever worker wakes first.
//!
//! On top of the reactor sit:
//!
//! - **Cross-thread messages** ([`MsgFlags`], [`Worker::send_msg`],
//!   [`ThreadPool::bsend`], [`ThreadPool::cbsend`]): closures shipped over
//!   per-worker pipes, with unicast, broadcast, synchronous-wait, and
//!   serialized one-by-one delivery.
//! - **I/O tasks** ([`IoTask`]): a descriptor, an optional timeout timer,
//!   a buffer, and one of the canned disciplines - positional read/write,
//!   socket send/recv, readiness notify, datagram receive, accept, plain
//!   connect, and retrying multi-address connect
//!   ([`IoTask::connect_ex`]).
//! - **Declarative socket options** ([`SktOpts`]): a mask of options
//!   applied in one pass, with error-mask accumulation so callers can
//!   downgrade optional features.
//!
//! ```no_run
//! use evpool::{EvFlags, EvKind, IoBuf, IoTask, PoolConfig, TaskFlags, TaskFlow, ThreadPool};
//!
//! # fn main() -> evpool::Result<()> {
//! let pool = ThreadPool::new(PoolConfig { threads_max: 2, bind_to_cpu: false })?;
//! pool.spawn_threads(false)?;
//!
//! // Watch a descriptor for readability and pull bytes off it.
//! # let fd: u64 = 0;
//! let task = IoTask::sr(&pool.worker_rr(), fd, TaskFlags::empty());
//! task.start(
//!     EvKind::Read,
//!     EvFlags::empty(),
//!     5_000,
//!     0,
//!     Some(IoBuf::new(4096)),
//!     Box::new(|_ctx, err, _eof, transferred| {
//!         println!("read {transferred} bytes, err {err:?}");
//!         TaskFlow::Continue
//!     }),
//! )?;
//!
//! pool.shutdown();
//! pool.shutdown_wait();
//! # Ok(())
//! # }
//! ```

mod error;
mod event;
mod net;
mod os;
mod pool;
mod task;

pub use error::{Error, Result};
pub use event::{Ev, EvFlags, EvKind, Event, EventCb, Ident, Readiness, TimerFlags, IDENT_NONE};
pub use net::{bind, connect, create, is_connect_error, listen, OptsMult, SktOpts, SoFlags};
pub use pool::{
    AsyncOp, BsendReport, MsgFlags, PoolConfig, ShutdownToken, ThreadPool, Worker, AOP_ARG_COUNT,
};
pub use task::{
    default_cb_check, AcceptCb, ConnExStatus, ConnectCb, ConnectExCb, ConnectExFlags,
    ConnectParams, EofFlags, IoBuf, IoCb, IoTask, NotifyCb, PktRcvrCb, TaskCtx, TaskFlags,
    TaskFlow,
};
