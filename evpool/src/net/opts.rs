// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words RCVBUF RCVLOWAT RCVTIMEO SNDBUF SNDLOWAT SNDTIMEO HOPLIM
// cspell:words KEEPIDLE KEEPINTVL KEEPCNT NOPUSH setsockopt sockopt

//! Declarative socket options: a mask of options to touch, a bit-value
//! word for the boolean ones, typed fields for the rest, applied in one
//! fixed-order pass.

use super::socket::{borrowed, family_of, set_nonblocking};
use crate::error::{last_errno, Error, Result};
use rustix::io::Errno;
use rustix::net::sockopt;
use std::{os::fd::RawFd, time::Duration};

bitflags::bitflags! {
    /// Socket option selector/value bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SoFlags: u32 {
        /// `O_NONBLOCK`.
        const NONBLOCK = 1 << 0;
        /// `SO_BROADCAST`.
        const BROADCAST = 1 << 1;
        /// `SO_REUSEADDR`.
        const REUSEADDR = 1 << 2;
        /// `SO_REUSEPORT`.
        const REUSEPORT = 1 << 3;
        /// `shutdown(SHUT_RD)`.
        const HALFCLOSE_RD = 1 << 4;
        /// `shutdown(SHUT_WR)`.
        const HALFCLOSE_WR = 1 << 5;
        /// The listen backlog was configured.
        const BACKLOG = 1 << 6;
        /// `SO_KEEPALIVE`.
        const KEEPALIVE = 1 << 7;
        /// `SO_RCVBUF`.
        const RCVBUF = 1 << 8;
        /// `SO_RCVLOWAT`.
        const RCVLOWAT = 1 << 9;
        /// Receive timeout; held for application use, never set on the
        /// socket.
        const RCVTIMEO = 1 << 10;
        /// `SO_SNDBUF`.
        const SNDBUF = 1 << 11;
        /// `SO_SNDLOWAT` (BSD only; Linux rejects it).
        const SNDLOWAT = 1 << 12;
        /// Send timeout; held for application use, never set on the
        /// socket.
        const SNDTIMEO = 1 << 13;
        /// `IP_TTL` / `IPV6_UNICAST_HOPS`.
        const IP_HOPLIM_U = 1 << 16;
        /// `IP_MULTICAST_TTL` / `IPV6_MULTICAST_HOPS`.
        const IP_HOPLIM_M = 1 << 17;
        /// `IP_MULTICAST_LOOP` / `IPV6_MULTICAST_LOOP`.
        const IP_MULTICAST_LOOP = 1 << 18;
        /// Accept filter: `TCP_DEFER_ACCEPT` on Linux, `SO_ACCEPTFILTER`
        /// on FreeBSD.
        const ACC_FILTER = 1 << 24;
        /// `TCP_KEEPIDLE`; only applied when `KEEPALIVE` is active.
        const TCP_KEEPIDLE = 1 << 25;
        /// `TCP_KEEPINTVL`; only applied when `KEEPALIVE` is active.
        const TCP_KEEPINTVL = 1 << 26;
        /// `TCP_KEEPCNT`; only applied when `KEEPALIVE` is active.
        const TCP_KEEPCNT = 1 << 27;
        /// `TCP_NODELAY`.
        const TCP_NODELAY = 1 << 28;
        /// `TCP_NOPUSH` / `TCP_CORK`.
        const TCP_NOPUSH = 1 << 29;
        /// `TCP_CONGESTION`.
        const TCP_CONGESTION = 1 << 30;
        /// Stop on the first failed option instead of accumulating.
        const FAIL_ON_ERR = 1 << 31;
    }
}

impl SoFlags {
    /// Both half-close directions.
    pub const HALFCLOSE_RDWR: Self = Self::HALFCLOSE_RD.union(Self::HALFCLOSE_WR);
    /// Options whose value is a bit in `bit_vals`.
    pub const BIT_VALS_MASK: Self = Self::NONBLOCK
        .union(Self::BROADCAST)
        .union(Self::REUSEADDR)
        .union(Self::REUSEPORT)
        .union(Self::KEEPALIVE)
        .union(Self::IP_MULTICAST_LOOP)
        .union(Self::ACC_FILTER)
        .union(Self::TCP_NODELAY)
        .union(Self::TCP_NOPUSH);
    /// Flags consumed at socket-creation time.
    pub const CREATE_MASK: Self = Self::NONBLOCK.union(Self::BROADCAST);
    /// Flags consumed by `bind`.
    pub const BIND_MASK: Self =
        Self::CREATE_MASK.union(Self::REUSEADDR).union(Self::REUSEPORT);
    /// The IP-level options.
    pub const IP_MASK: Self = Self::IP_HOPLIM_U
        .union(Self::IP_HOPLIM_M)
        .union(Self::IP_MULTICAST_LOOP);
    /// The keepalive family.
    pub const KEEPALIVE_MASK: Self = Self::KEEPALIVE
        .union(Self::TCP_KEEPIDLE)
        .union(Self::TCP_KEEPINTVL)
        .union(Self::TCP_KEEPCNT);
    /// Receive-side tunables.
    pub const RCV_MASK: Self = Self::RCVBUF.union(Self::RCVLOWAT).union(Self::RCVTIMEO);
    /// Send-side tunables.
    pub const SND_MASK: Self = Self::SNDBUF.union(Self::SNDLOWAT).union(Self::SNDTIMEO);
    /// Applied to datagram sockets after bind.
    pub const UDP_BIND_AF_MASK: Self = Self::RCV_MASK
        .union(Self::SND_MASK)
        .union(Self::IP_HOPLIM_U)
        .union(Self::IP_HOPLIM_M)
        .union(Self::IP_MULTICAST_LOOP);
    /// Applied to stream sockets after listen.
    pub const TCP_LISTEN_AF_MASK: Self = Self::IP_HOPLIM_U
        .union(Self::ACC_FILTER)
        .union(Self::KEEPALIVE_MASK);
    /// Applied to established connections.
    pub const TCP_ES_CONN_MASK: Self = Self::HALFCLOSE_RDWR
        .union(Self::KEEPALIVE_MASK)
        .union(Self::RCV_MASK)
        .union(Self::SND_MASK)
        .union(Self::IP_HOPLIM_U)
        .union(Self::TCP_NODELAY)
        .union(Self::TCP_NOPUSH)
        .union(Self::TCP_CONGESTION);
}

/// Scale for configurations expressed in kilo/mega/giga units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptsMult {
    /// No scaling.
    #[default]
    None,
    /// ×1 000.
    K,
    /// ×1 000 000.
    M,
    /// ×1 000 000 000.
    G,
}

impl OptsMult {
    fn factor(self) -> u64 {
        match self {
            Self::None => 1,
            Self::K => 1_000,
            Self::M => 1_000_000,
            Self::G => 1_000_000_000,
        }
    }
}

/// A bundle of socket options to apply in one pass.
#[derive(Debug, Clone, Default)]
pub struct SktOpts {
    /// Which options to touch.
    pub mask: SoFlags,
    /// Values for the boolean options in [`SoFlags::BIT_VALS_MASK`].
    pub bit_vals: SoFlags,
    /// Listen queue length; `0` = unbounded.
    pub backlog: i32,
    /// `SO_RCVBUF`, bytes (after [`Self::cvt`]).
    pub rcv_buf: u32,
    /// `SO_RCVLOWAT`, bytes.
    pub rcv_lowat: u32,
    /// Receive timeout, seconds; application-consumed.
    pub rcv_timeout: u64,
    /// `SO_SNDBUF`, bytes.
    pub snd_buf: u32,
    /// `SO_SNDLOWAT`, bytes.
    pub snd_lowat: u32,
    /// Send timeout, seconds; application-consumed.
    pub snd_timeout: u64,
    /// Unicast hop limit (`IP_TTL` / `IPV6_UNICAST_HOPS`).
    pub hop_limit_u: u8,
    /// Multicast hop limit (`IP_MULTICAST_TTL` / `IPV6_MULTICAST_HOPS`).
    pub hop_limit_m: u8,
    /// `TCP_DEFER_ACCEPT` seconds (the Linux accept-filter analogue).
    pub tcp_acc_defer: u32,
    /// `TCP_KEEPIDLE` seconds.
    pub tcp_keep_idle: u32,
    /// `TCP_KEEPINTVL` seconds.
    pub tcp_keep_intvl: u32,
    /// `TCP_KEEPCNT`.
    pub tcp_keep_cnt: u32,
    /// Congestion-control algorithm name for `TCP_CONGESTION`.
    pub tcp_cc: Option<String>,
}

fn setsockopt_int(fd: RawFd, level: i32, name: i32, value: i32) -> std::result::Result<(), Errno> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&raw const value).cast(),
            size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(last_errno()) } else { Ok(()) }
}

impl SktOpts {
    /// A bundle touching `mask` with boolean values from `bit_vals`.
    #[must_use]
    pub fn new(mask: SoFlags, bit_vals: SoFlags) -> Self {
        Self { mask, bit_vals, ..Self::default() }
    }

    /// Whether `flag` is both selected and set.
    #[must_use]
    pub fn is_flag_active(&self, flag: SoFlags) -> bool {
        !(flag & self.mask & self.bit_vals).is_empty()
    }

    /// The active boolean flags within `fmask`.
    #[must_use]
    pub fn flag_vals(&self, fmask: SoFlags) -> SoFlags {
        fmask & SoFlags::BIT_VALS_MASK & self.mask & self.bit_vals
    }

    /// Scales buffer sizes and timeouts so configurations can be written
    /// in K/M/G units.
    pub fn cvt(&mut self, mult: OptsMult) {
        let f = mult.factor();
        let f32b = |v: u32| u32::try_from(u64::from(v).saturating_mul(f)).unwrap_or(u32::MAX);
        self.rcv_buf = f32b(self.rcv_buf);
        self.rcv_lowat = f32b(self.rcv_lowat);
        self.snd_buf = f32b(self.snd_buf);
        self.snd_lowat = f32b(self.snd_lowat);
        self.rcv_timeout = self.rcv_timeout.saturating_mul(f);
        self.snd_timeout = self.snd_timeout.saturating_mul(f);
    }

    /// Applies the selected subset of boolean options only.
    pub fn apply(fd: RawFd, mask: SoFlags, bit_vals: SoFlags, family: i32) -> Result<SoFlags> {
        Self::new(mask & SoFlags::BIT_VALS_MASK, bit_vals).apply_ex(fd, mask, family)
    }

    /// Applies every option selected by both `mask` and `self.mask`, in a
    /// fixed order, and returns the mask of options that failed.
    ///
    /// IP-level options on a possibly dual-stack socket try IPv6 first,
    /// then IPv4, until one succeeds. Without
    /// [`SoFlags::FAIL_ON_ERR`] failures accumulate into the returned
    /// mask and the call succeeds, so callers can downgrade features;
    /// with it, the first failure aborts with [`Error::SockOpt`].
    pub fn apply_ex(&self, fd: RawFd, mask: SoFlags, family: i32) -> Result<SoFlags> {
        let m = mask & (self.mask | SoFlags::FAIL_ON_ERR);
        let bfd = borrowed(fd);
        let mut err_mask = SoFlags::empty();
        // Returns the error to surface when fail-fast is on.
        let fail_fast = m.contains(SoFlags::FAIL_ON_ERR);
        macro_rules! record {
            ($bit:expr, $res:expr) => {
                if let Err(e) = $res {
                    err_mask |= $bit;
                    if fail_fast {
                        return Err(Error::SockOpt { failed: err_mask.bits(), source: e });
                    }
                }
            };
        }

        if m.contains(SoFlags::NONBLOCK) {
            record!(
                SoFlags::NONBLOCK,
                set_nonblocking(fd, self.bit_vals.contains(SoFlags::NONBLOCK))
            );
        }
        if m.intersects(SoFlags::HALFCLOSE_RDWR) {
            let sel = self.bit_vals & m & SoFlags::HALFCLOSE_RDWR;
            let how = if sel == SoFlags::HALFCLOSE_RDWR {
                Some(libc::SHUT_RDWR)
            } else if sel == SoFlags::HALFCLOSE_RD {
                Some(libc::SHUT_RD)
            } else if sel == SoFlags::HALFCLOSE_WR {
                Some(libc::SHUT_WR)
            } else {
                None
            };
            if let Some(how) = how {
                let res = if unsafe { libc::shutdown(fd, how) } < 0 {
                    Err(last_errno())
                } else {
                    Ok(())
                };
                record!(self.bit_vals & m & SoFlags::HALFCLOSE_RDWR, res);
            }
        }
        // BACKLOG is consumed by listen(), not here.
        if m.contains(SoFlags::BROADCAST) {
            record!(
                SoFlags::BROADCAST,
                sockopt::set_socket_broadcast(bfd, self.bit_vals.contains(SoFlags::BROADCAST))
            );
        }
        if m.contains(SoFlags::REUSEADDR) {
            record!(
                SoFlags::REUSEADDR,
                sockopt::set_socket_reuseaddr(bfd, self.bit_vals.contains(SoFlags::REUSEADDR))
            );
        }
        if m.contains(SoFlags::REUSEPORT) {
            record!(
                SoFlags::REUSEPORT,
                sockopt::set_socket_reuseport(bfd, self.bit_vals.contains(SoFlags::REUSEPORT))
            );
        }
        if m.contains(SoFlags::KEEPALIVE) {
            record!(
                SoFlags::KEEPALIVE,
                sockopt::set_socket_keepalive(bfd, self.bit_vals.contains(SoFlags::KEEPALIVE))
            );
            if self.is_flag_active(SoFlags::KEEPALIVE) {
                if m.contains(SoFlags::TCP_KEEPIDLE) && self.tcp_keep_idle != 0 {
                    record!(
                        SoFlags::TCP_KEEPIDLE,
                        sockopt::set_tcp_keepidle(
                            bfd,
                            Duration::from_secs(u64::from(self.tcp_keep_idle)),
                        )
                    );
                }
                if m.contains(SoFlags::TCP_KEEPINTVL) && self.tcp_keep_intvl != 0 {
                    record!(
                        SoFlags::TCP_KEEPINTVL,
                        sockopt::set_tcp_keepintvl(
                            bfd,
                            Duration::from_secs(u64::from(self.tcp_keep_intvl)),
                        )
                    );
                }
                if m.contains(SoFlags::TCP_KEEPCNT) && self.tcp_keep_cnt != 0 {
                    record!(
                        SoFlags::TCP_KEEPCNT,
                        sockopt::set_tcp_keepcnt(bfd, self.tcp_keep_cnt)
                    );
                }
            }
        }
        if m.contains(SoFlags::RCVBUF) && self.rcv_buf != 0 {
            record!(
                SoFlags::RCVBUF,
                sockopt::set_socket_recv_buffer_size(bfd, self.rcv_buf as usize)
            );
        }
        if m.contains(SoFlags::RCVLOWAT) && self.rcv_lowat != 0 {
            record!(
                SoFlags::RCVLOWAT,
                setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVLOWAT, self.rcv_lowat as i32)
            );
        }
        // RCVTIMEO is never set on the socket.
        if m.contains(SoFlags::SNDBUF) && self.snd_buf != 0 {
            record!(
                SoFlags::SNDBUF,
                sockopt::set_socket_send_buffer_size(bfd, self.snd_buf as usize)
            );
        }
        // Linux always fails SO_SNDLOWAT.
        #[cfg(not(target_os = "linux"))]
        if m.contains(SoFlags::SNDLOWAT) && self.snd_lowat != 0 {
            record!(
                SoFlags::SNDLOWAT,
                setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDLOWAT, self.snd_lowat as i32)
            );
        }
        // SNDTIMEO is never set on the socket.

        // IP level: prefer IPv6, fall back to IPv4, on sockets whose
        // family is unknown (possibly dual-stack).
        let fam = if family == 0 && m.intersects(SoFlags::IP_MASK) { family_of(fd) } else { family };
        if m.contains(SoFlags::IP_HOPLIM_U) {
            let v = i32::from(self.hop_limit_u);
            let ok = ((fam == 0 || fam == libc::AF_INET6)
                && setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, v).is_ok())
                || ((fam == 0 || fam == libc::AF_INET)
                    && setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, v).is_ok());
            record!(SoFlags::IP_HOPLIM_U, if ok { Ok(()) } else { Err(last_errno()) });
        }
        if m.contains(SoFlags::IP_HOPLIM_M) {
            let v = i32::from(self.hop_limit_m);
            let ok = ((fam == 0 || fam == libc::AF_INET6)
                && setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, v).is_ok())
                || ((fam == 0 || fam == libc::AF_INET)
                    && set_ip_multicast_ttl(fd, self.hop_limit_m).is_ok());
            record!(SoFlags::IP_HOPLIM_M, if ok { Ok(()) } else { Err(last_errno()) });
        }
        if m.contains(SoFlags::IP_MULTICAST_LOOP) {
            let on = self.bit_vals.contains(SoFlags::IP_MULTICAST_LOOP);
            let ok = ((fam == 0 || fam == libc::AF_INET6)
                && setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, i32::from(on))
                    .is_ok())
                || ((fam == 0 || fam == libc::AF_INET)
                    && set_ip_multicast_loop(fd, on).is_ok());
            record!(SoFlags::IP_MULTICAST_LOOP, if ok { Ok(()) } else { Err(last_errno()) });
        }

        if m.contains(SoFlags::ACC_FILTER) && self.is_flag_active(SoFlags::ACC_FILTER) {
            let res = apply_accept_filter(fd, self.tcp_acc_defer);
            record!(SoFlags::ACC_FILTER, res);
        }
        if m.contains(SoFlags::TCP_NODELAY) {
            record!(
                SoFlags::TCP_NODELAY,
                sockopt::set_tcp_nodelay(bfd, self.bit_vals.contains(SoFlags::TCP_NODELAY))
            );
        }
        if m.contains(SoFlags::TCP_NOPUSH) {
            let on = i32::from(self.bit_vals.contains(SoFlags::TCP_NOPUSH));
            record!(SoFlags::TCP_NOPUSH, apply_nopush(fd, on));
        }
        if m.contains(SoFlags::TCP_CONGESTION) {
            if let Some(cc) = &self.tcp_cc {
                let res = unsafe {
                    if libc::setsockopt(
                        fd,
                        libc::IPPROTO_TCP,
                        libc::TCP_CONGESTION,
                        cc.as_ptr().cast(),
                        cc.len() as libc::socklen_t,
                    ) < 0
                    {
                        Err(last_errno())
                    } else {
                        Ok(())
                    }
                };
                record!(SoFlags::TCP_CONGESTION, res);
            }
        }

        Ok(err_mask)
    }
}

/// `IP_MULTICAST_TTL` takes a byte-sized value on the IPv4 level.
fn set_ip_multicast_ttl(fd: RawFd, ttl: u8) -> std::result::Result<(), Errno> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_TTL,
            (&raw const ttl).cast(),
            size_of::<u8>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(last_errno()) } else { Ok(()) }
}

fn set_ip_multicast_loop(fd: RawFd, on: bool) -> std::result::Result<(), Errno> {
    let val = u8::from(on);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_LOOP,
            (&raw const val).cast(),
            size_of::<u8>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(last_errno()) } else { Ok(()) }
}

#[cfg(target_os = "linux")]
fn apply_accept_filter(fd: RawFd, defer_secs: u32) -> std::result::Result<(), Errno> {
    if defer_secs == 0 {
        return Ok(());
    }
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, defer_secs as i32)
}

#[cfg(not(target_os = "linux"))]
fn apply_accept_filter(_fd: RawFd, _defer_secs: u32) -> std::result::Result<(), Errno> {
    // SO_ACCEPTFILTER needs a loaded filter module; left to the caller's
    // platform glue.
    Ok(())
}

#[cfg(target_os = "linux")]
fn apply_nopush(fd: RawFd, on: i32) -> std::result::Result<(), Errno> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_CORK, on)
}

#[cfg(not(target_os = "linux"))]
fn apply_nopush(fd: RawFd, on: i32) -> std::result::Result<(), Errno> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NOPUSH, on)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flag_vals_respects_all_three_masks() {
        let opts = SktOpts::new(
            SoFlags::NONBLOCK | SoFlags::REUSEADDR | SoFlags::RCVBUF,
            SoFlags::REUSEADDR | SoFlags::REUSEPORT,
        );
        assert_eq!(opts.flag_vals(SoFlags::BIND_MASK), SoFlags::REUSEADDR);
        assert!(opts.is_flag_active(SoFlags::REUSEADDR));
        assert!(!opts.is_flag_active(SoFlags::REUSEPORT)); // not in mask
        assert!(!opts.is_flag_active(SoFlags::NONBLOCK)); // not in bit_vals
    }

    #[test]
    fn cvt_scales_buffers_and_timeouts() {
        let mut opts = SktOpts { rcv_buf: 64, snd_buf: 2, rcv_timeout: 3, ..SktOpts::default() };
        opts.cvt(OptsMult::K);
        assert_eq!(opts.rcv_buf, 64_000);
        assert_eq!(opts.snd_buf, 2_000);
        assert_eq!(opts.rcv_timeout, 3_000);
    }

    #[test]
    fn cvt_saturates() {
        let mut opts = SktOpts { rcv_buf: u32::MAX, ..SktOpts::default() };
        opts.cvt(OptsMult::G);
        assert_eq!(opts.rcv_buf, u32::MAX);
    }

    #[test]
    fn apply_reuseaddr_on_a_real_socket() {
        use crate::net::socket::create;
        let fd = create(libc::AF_INET, libc::SOCK_STREAM, 0, SoFlags::NONBLOCK).unwrap();
        let opts = SktOpts::new(
            SoFlags::REUSEADDR | SoFlags::TCP_NODELAY,
            SoFlags::REUSEADDR | SoFlags::TCP_NODELAY,
        );
        let err_mask = opts
            .apply_ex(
                std::os::fd::AsRawFd::as_raw_fd(&fd),
                SoFlags::REUSEADDR | SoFlags::TCP_NODELAY,
                libc::AF_INET,
            )
            .unwrap();
        assert_eq!(err_mask, SoFlags::empty());
    }
}
