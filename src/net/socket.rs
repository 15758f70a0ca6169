// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Raw socket construction and option plumbing.
//!
//! Sockets are built with `socket2` (matching the teacher's
//! `transport/udp.rs`), configured while still a `socket2::Socket`, then
//! converted to `std::net` types and handed to [`super::poller::Poller`]
//! via `mio::net`'s `from_std` constructors. MTU discovery is the one
//! corner reached through `libc` directly — `socket2`/`mio` don't expose
//! `SIOCGIFMTU`, and the teacher's `ShmSegment` sets the same precedent
//! of dropping to `libc` for the one syscall no wrapper crate covers.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

/// Resolves the host's primary non-loopback IPv4 address, for callers
/// that leave `mcast_interface`/`tcp_bind` unspecified and want the
/// sender/receiver to pick a sensible outbound interface automatically.
pub fn local_ipv4() -> Result<Ipv4Addr> {
    match local_ip_address::local_ip() {
        Ok(std::net::IpAddr::V4(v4)) => Ok(v4),
        Ok(std::net::IpAddr::V6(_)) => Err(Error::ProtocolError(
            "local_ipv4: host's primary address is IPv6",
        )),
        Err(e) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            e.to_string(),
        ))),
    }
}

pub fn new_udp() -> Result<Socket> {
    Ok(Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?)
}

pub fn new_tcp() -> Result<Socket> {
    Ok(Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?)
}

pub fn set_reuse_addr(sock: &Socket, reuse: bool) -> Result<()> {
    sock.set_reuse_address(reuse)?;
    Ok(())
}

pub fn set_rx_buf(sock: &Socket, bytes: usize) -> Result<()> {
    sock.set_recv_buffer_size(bytes)?;
    Ok(())
}

pub fn set_tx_buf(sock: &Socket, bytes: usize) -> Result<()> {
    sock.set_send_buffer_size(bytes)?;
    Ok(())
}

pub fn set_tcp_nodelay(sock: &Socket, disable_delay: bool) -> Result<()> {
    sock.set_tcp_nodelay(disable_delay)?;
    Ok(())
}

pub fn set_mcast_ttl(sock: &Socket, ttl: u32) -> Result<()> {
    sock.set_multicast_ttl_v4(ttl)?;
    Ok(())
}

pub fn set_mcast_loopback(sock: &Socket, allow_loop: bool) -> Result<()> {
    sock.set_multicast_loop_v4(allow_loop)?;
    Ok(())
}

pub fn set_mcast_interface(sock: &Socket, iface: Ipv4Addr) -> Result<()> {
    sock.set_multicast_if_v4(&iface)?;
    Ok(())
}

pub fn join_multicast(sock: &Socket, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    sock.join_multicast_v4(&group, &iface)?;
    Ok(())
}

pub fn leave_multicast(sock: &Socket, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    sock.leave_multicast_v4(&group, &iface)?;
    Ok(())
}

/// The layout the kernel expects for an `SIOCGIFMTU` `ioctl`: an
/// interface name followed by a union whose first member (the only one
/// this call touches) is the `c_int` MTU. Defined locally rather than
/// trusting `libc`'s `ifreq` binding to expose the same field name on
/// every target.
#[repr(C)]
struct IfReqMtu {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_mtu: libc::c_int,
}

/// Standard Linux `ioctl` request number for `SIOCGIFMTU`.
const SIOCGIFMTU: libc::c_ulong = 0x8921;

/// Discover the MTU of the named network interface (e.g. `"eth0"`) via
/// `ioctl(SIOCGIFMTU)` on `fd`, matching `sock_get_mtu` in
/// `original_source/src/socket.c`.
pub fn interface_mtu(fd: RawFd, device: &str) -> Result<usize> {
    if device.len() >= libc::IF_NAMESIZE {
        return Err(Error::InvalidArg("interface_mtu: device name too long"));
    }
    // SAFETY: zero-initialized plain-old-data struct; every field is an
    // integer type for which all-zero bits are valid.
    let mut ifr: IfReqMtu = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(device.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    // SAFETY: `fd` is a valid open socket descriptor for the duration of
    // the call; `ifr` is a valid, fully-initialized `ioctl` argument of
    // the shape the kernel expects for `SIOCGIFMTU`.
    let rc = unsafe { libc::ioctl(fd, SIOCGIFMTU as _, &mut ifr) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(ifr.ifr_mtu as usize)
}

/// `true` if `err` represents "operation would block" on a non-blocking
/// socket — a normal control-flow signal, not a crate [`Error`], per
/// `SPEC_FULL.md` §7.
pub fn is_blocked(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/// `true` if `err` represents the peer having closed its half of a TCP
/// connection.
pub fn is_peer_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    )
}
