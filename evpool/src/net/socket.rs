// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EINPROGRESS EISCONN EALREADY recvfrom getpeername sockaddr

//! Raw socket primitives: create/bind/listen/accept/connect plus the
//! transient-error filter shared with the task handlers.

use super::opts::SoFlags;
use crate::error::{last_errno, Error, Result};
use rustix::io::Errno;
use rustix::net::sockopt;
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

/// Normalizes would-block conditions to "no progress, try again":
/// `EAGAIN`, `EWOULDBLOCK`, `EBUSY` (sendfile), and `EINTR` filter to
/// `None`; anything else passes through.
pub(crate) fn err_filter(e: Errno) -> Option<Errno> {
    if e == Errno::AGAIN || e == Errno::WOULDBLOCK || e == Errno::BUSY || e == Errno::INTR {
        None
    } else {
        Some(e)
    }
}

/// Whether an errno from a connect attempt is a real failure (as opposed
/// to "still in progress" / "already done").
#[must_use]
pub fn is_connect_error(e: Errno) -> bool {
    !matches!(
        e,
        Errno::INPROGRESS | Errno::ALREADY | Errno::ISCONN | Errno::AGAIN | Errno::INTR
    )
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblock: bool) -> std::result::Result<(), Errno> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_errno());
    }
    let flags =
        if nonblock { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub(crate) fn sockaddr_from_std(
    addr: &SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from(*a.ip()).to_be();
            unsafe { std::ptr::write((&raw mut ss).cast::<libc::sockaddr_in>(), sin) };
            (ss, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            unsafe { std::ptr::write((&raw mut ss).cast::<libc::sockaddr_in6>(), sin6) };
            (ss, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

pub(crate) fn sockaddr_to_std(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(ss.ss_family) {
        libc::AF_INET => {
            let sin = unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(ss as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Creates a socket; `NONBLOCK` and `BROADCAST` are honored from `flags`.
pub fn create(domain: i32, ty: i32, protocol: i32, flags: SoFlags) -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(Error::Os(last_errno()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if flags.contains(SoFlags::NONBLOCK) {
        set_nonblocking(fd.as_raw_fd(), true)?;
    }
    if flags.contains(SoFlags::BROADCAST) {
        sockopt::set_socket_broadcast(&fd, true)?;
    }
    Ok(fd)
}

/// Creates and binds a socket; `REUSEADDR`/`REUSEPORT` apply before bind.
pub fn bind(addr: &SocketAddr, ty: i32, protocol: i32, flags: SoFlags) -> Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = create(domain, ty, protocol, flags)?;
    if flags.contains(SoFlags::REUSEADDR) {
        sockopt::set_socket_reuseaddr(&fd, true)?;
    }
    if flags.contains(SoFlags::REUSEPORT) {
        sockopt::set_socket_reuseport(&fd, true)?;
    }
    let (ss, len) = sockaddr_from_std(addr);
    if unsafe { libc::bind(fd.as_raw_fd(), (&raw const ss).cast(), len) } < 0 {
        return Err(Error::Os(last_errno()));
    }
    Ok(fd)
}

/// Starts listening; `backlog == 0` requests an unbounded queue.
pub fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    let backlog = if backlog == 0 { i32::MAX } else { backlog };
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(Error::Os(last_errno()));
    }
    Ok(())
}

/// Creates a socket and starts a connect; `EINPROGRESS`/`EINTR` count as
/// success-pending (the caller watches for write readiness).
pub fn connect(addr: &SocketAddr, ty: i32, protocol: i32, flags: SoFlags) -> Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = create(domain, ty, protocol, flags)?;
    let (ss, len) = sockaddr_from_std(addr);
    if unsafe { libc::connect(fd.as_raw_fd(), (&raw const ss).cast(), len) } < 0 {
        let e = last_errno();
        if e != Errno::INPROGRESS && e != Errno::INTR {
            return Err(Error::Os(e));
        }
    }
    Ok(fd)
}

/// Accepts one pending connection, non-blocking, returning the new socket
/// and peer address.
pub(crate) fn accept(
    fd: RawFd,
) -> std::result::Result<(OwnedFd, Option<SocketAddr>), Errno> {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let new_fd = unsafe {
        libc::accept4(fd, (&raw mut ss).cast(), &mut len, libc::SOCK_NONBLOCK)
    };
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let new_fd = unsafe { libc::accept(fd, (&raw mut ss).cast(), &mut len) };
    if new_fd < 0 {
        return Err(last_errno());
    }
    let new_fd = unsafe { OwnedFd::from_raw_fd(new_fd) };
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    set_nonblocking(new_fd.as_raw_fd(), true)?;
    Ok((new_fd, sockaddr_to_std(&ss)))
}

/// One non-blocking `recvfrom` into a raw chunk, returning the byte count
/// and peer address.
pub(crate) fn recvfrom_raw(
    fd: RawFd,
    ptr: *mut u8,
    len: usize,
) -> std::result::Result<(usize, Option<SocketAddr>), Errno> {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut ss_len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            ptr.cast(),
            len,
            libc::MSG_DONTWAIT,
            (&raw mut ss).cast(),
            &mut ss_len,
        )
    };
    if n < 0 {
        return Err(last_errno());
    }
    Ok((n as usize, sockaddr_to_std(&ss)))
}

/// The socket's address family via `getsockname`; `0` when unknown.
pub(crate) fn family_of(fd: RawFd) -> i32 {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { libc::getsockname(fd, (&raw mut ss).cast(), &mut len) } == 0 {
        i32::from(ss.ss_family)
    } else {
        0
    }
}

/// A borrowed-fd view for the typed `rustix` option setters.
pub(crate) fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (ss, _len) = sockaddr_from_std(&addr);
        assert_eq!(sockaddr_to_std(&ss), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let (ss, _len) = sockaddr_from_std(&addr);
        assert_eq!(sockaddr_to_std(&ss), Some(addr));
    }

    #[test]
    fn transient_errors_filter_to_none() {
        assert_eq!(err_filter(Errno::AGAIN), None);
        assert_eq!(err_filter(Errno::INTR), None);
        assert_eq!(err_filter(Errno::BUSY), None);
        assert_eq!(err_filter(Errno::CONNREFUSED), Some(Errno::CONNREFUSED));
    }

    #[test]
    fn connect_errno_classification() {
        assert!(!is_connect_error(Errno::INPROGRESS));
        assert!(!is_connect_error(Errno::ISCONN));
        assert!(is_connect_error(Errno::CONNREFUSED));
    }
}
