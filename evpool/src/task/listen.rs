// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words REUSEPORT

//! Bind-and-accept helpers: one listen socket with an accept task, or a
//! per-worker fan-out when `REUSEPORT` lets the kernel balance incoming
//! connections.

use super::task::{AcceptCb, IoTask, TaskFlags};
use crate::{
    error::{Error, Result},
    event::Ident,
    net::{socket as skt, SktOpts, SoFlags},
    pool::ThreadPool,
    pool::Worker,
};
use std::{
    net::SocketAddr,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    sync::Arc,
};

impl IoTask {
    /// Binds a listening socket and attaches an accept task to `wkr`.
    ///
    /// The socket is non-blocking; `REUSEADDR`/`REUSEPORT` apply per
    /// `opts` before bind, `listen` runs for stream sockets
    /// (`backlog == 0` → unbounded), and the listen-phase option mask is
    /// applied afterwards. Option-apply failures are not fatal: the failed
    /// bits are cleared from `opts` so callers can observe the downgrade
    /// (accept-filter on kernels without it being the canonical case).
    pub fn bind_accept(
        wkr: &Arc<Worker>,
        addr: &SocketAddr,
        ty: i32,
        protocol: i32,
        opts: &mut SktOpts,
        flags: TaskFlags,
        timeout_ms: u64,
        cb: AcceptCb,
    ) -> Result<Self> {
        let bind_flags = SoFlags::NONBLOCK | opts.flag_vals(SoFlags::BIND_MASK);
        let fd = skt::bind(addr, ty, protocol, bind_flags)?;
        if ty == libc::SOCK_STREAM {
            skt::listen(fd.as_raw_fd(), opts.backlog)?;
        }
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        match opts.apply_ex(fd.as_raw_fd(), SoFlags::TCP_LISTEN_AF_MASK, family) {
            Ok(err_mask) => {
                opts.bit_vals &= !(err_mask & SoFlags::ACC_FILTER);
            }
            Err(e) => {
                // Non-fatal: downgrade and carry on without the filter.
                if let Error::SockOpt { failed, .. } = &e {
                    opts.bit_vals &=
                        !(SoFlags::from_bits_truncate(*failed) & SoFlags::ACC_FILTER);
                }
                tracing::warn!(error = %e, "listen-phase socket options partially applied");
            }
        }
        let ident = fd.into_raw_fd() as Ident;
        match Self::accept(wkr, ident, flags, timeout_ms, cb) {
            Ok(task) => Ok(task),
            Err(e) => {
                drop(unsafe { OwnedFd::from_raw_fd(ident as RawFd) });
                Err(e)
            }
        }
    }

    /// Binds one listen socket per worker when `REUSEPORT` is active (the
    /// kernel then balances incoming connections across workers), or a
    /// single socket on a round-robin worker otherwise. `mk_cb` supplies
    /// one accept callback per created task.
    ///
    /// Partial failure closes and destroys everything created so far.
    pub fn multi_bind_accept<M>(
        tp: &ThreadPool,
        addr: &SocketAddr,
        ty: i32,
        protocol: i32,
        opts: &mut SktOpts,
        flags: TaskFlags,
        timeout_ms: u64,
        mut mk_cb: M,
    ) -> Result<Vec<Self>>
    where
        M: FnMut() -> AcceptCb,
    {
        let fan_out = opts.is_flag_active(SoFlags::REUSEPORT);
        let count = if fan_out { tp.thread_count_max() } else { 1 };
        let mut tasks = Vec::with_capacity(count);
        for i in 0..count {
            let wkr = if fan_out { tp.worker(i) } else { tp.worker_rr() };
            match Self::bind_accept(&wkr, addr, ty, protocol, opts, flags, timeout_ms, mk_cb()) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    for task in &tasks {
                        // Sockets close regardless of CLOSE_ON_DESTROY.
                        task.ident_close();
                    }
                    return Err(e);
                }
            }
        }
        Ok(tasks)
    }
}
