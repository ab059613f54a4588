// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Crate-wide error type. One sum type covers the reactor, the message
//! queue, the task layer, and the socket helpers; raw OS errno values ride
//! along in [`Os`] for passthrough diagnostics.
//!
//! [`Os`]: Error::Os

use rustix::io::Errno;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the pool, the message queue, the task layer, and the
/// socket helpers.
///
/// | Variant             | Cause                                                  | Recoverable? |
/// | :------------------ | :----------------------------------------------------- | :----------- |
/// | [`InvalidArg`]      | bad flag combination, out-of-range value, missing cb   | No           |
/// | [`Os`]              | a syscall failed; the errno is carried verbatim        | Depends      |
/// | [`Timeout`]         | a task's I/O timer fired before the I/O completed      | Yes          |
/// | [`WorkerDown`]      | unicast to a worker that is not running, no `FORCE`    | Maybe        |
/// | [`NoneDelivered`]   | a broadcast failed to enqueue on every worker          | Maybe        |
/// | [`AlreadyAttached`] | worker 0 is already running a reactor loop             | No           |
/// | [`BadIdent`]        | descriptor outside the pool's descriptor-count limit   | No           |
/// | [`Exhausted`]       | connect-ex ran out of tries, addresses, or wall clock  | No           |
/// | [`SockOpt`]         | socket-option apply stopped on its first failure       | Maybe        |
///
/// [`AlreadyAttached`]: Error::AlreadyAttached
/// [`BadIdent`]: Error::BadIdent
/// [`Exhausted`]: Error::Exhausted
/// [`InvalidArg`]: Error::InvalidArg
/// [`NoneDelivered`]: Error::NoneDelivered
/// [`Os`]: Error::Os
/// [`SockOpt`]: Error::SockOpt
/// [`Timeout`]: Error::Timeout
/// [`WorkerDown`]: Error::WorkerDown
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum Error {
    /// An argument failed validation before reaching the OS.
    #[error("invalid argument: {0}")]
    #[diagnostic(code(evpool::invalid_arg))]
    InvalidArg(&'static str),

    /// A syscall failed; the errno is preserved.
    #[error("os error: {0}")]
    #[diagnostic(code(evpool::os))]
    Os(#[from] Errno),

    /// A task's I/O timer fired before the I/O completed.
    #[error("operation timed out")]
    #[diagnostic(code(evpool::timeout))]
    Timeout,

    /// The destination worker is not running and `MsgFlags::FORCE` was not
    /// set.
    #[error("destination worker is not running")]
    #[diagnostic(
        code(evpool::worker_down),
        help("spawn the pool's threads first, or pass MsgFlags::FORCE")
    )]
    WorkerDown,

    /// Every per-worker enqueue of a broadcast failed.
    #[error("broadcast delivered to no worker")]
    #[diagnostic(code(evpool::none_delivered))]
    NoneDelivered,

    /// `attach_first` was called while worker 0 already runs a loop.
    #[error("worker 0 is already attached")]
    #[diagnostic(code(evpool::already_attached))]
    AlreadyAttached,

    /// A read/write registration named a descriptor outside the pool's
    /// descriptor-count limit.
    #[error("descriptor out of range")]
    #[diagnostic(code(evpool::bad_ident))]
    BadIdent,

    /// Connect-ex exhausted its tries, addresses, or wall-clock budget.
    #[error("no more connect attempts possible")]
    #[diagnostic(code(evpool::exhausted))]
    Exhausted,

    /// Socket-option apply stopped on its first failure (`FAIL_ON_ERR`).
    /// `failed` holds the option bits that could not be applied.
    #[error("socket option apply failed (mask {failed:#x}): {source}")]
    #[diagnostic(code(evpool::sock_opt))]
    SockOpt {
        /// Option bits that failed, in [`SoFlags`] representation.
        ///
        /// [`SoFlags`]: crate::net::SoFlags
        failed: u32,
        /// The first errno encountered.
        #[source]
        source: Errno,
    },
}

impl Error {
    /// The raw errno when this error wraps one.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os(e) | Self::SockOpt { source: e, .. } => Some(*e),
            Self::Timeout => Some(Errno::TIMEDOUT),
            Self::WorkerDown => Some(Errno::HOSTDOWN),
            _ => None,
        }
    }
}

/// Fetches the calling thread's errno after a failed libc call.
pub(crate) fn last_errno() -> Errno {
    Errno::from_raw_os_error(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::Timeout.errno(), Some(Errno::TIMEDOUT));
        assert_eq!(Error::WorkerDown.errno(), Some(Errno::HOSTDOWN));
        assert_eq!(Error::Os(Errno::AGAIN).errno(), Some(Errno::AGAIN));
        assert_eq!(Error::InvalidArg("x").errno(), None);
    }
}
