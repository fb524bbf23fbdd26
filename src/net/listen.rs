//! Listening socket setup

use super::{Error, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Bind a non-blocking listening socket on the any-address for `port`.
///
/// An IPv6 socket with `IPV6_V6ONLY` cleared is tried first so one socket
/// serves both families; hosts without IPv6 fall back to `0.0.0.0`. Both
/// `SO_REUSEADDR` and `SO_REUSEPORT` are set.
pub fn bind_dual_stack(port: u16, backlog: i32) -> Result<Socket> {
    match bind_on(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), backlog) {
        Ok(socket) => Ok(socket),
        Err(e) => {
            tracing::debug!(port, error = %e, "dual-stack bind failed, falling back to IPv4");
            bind_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), backlog)
                .map_err(|source| Error::Bind { port, source })
        }
    }
}

fn bind_on(addr: SocketAddr, backlog: i32) -> std::io::Result<Socket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket)
}

/// Local port a bound socket ended up on (useful after binding port 0).
pub fn local_port(socket: &Socket) -> Result<u16> {
    let addr = socket.local_addr()?;
    addr.as_socket()
        .map(|a| a.port())
        .ok_or_else(|| Error::NoAddress("listener has no inet address".to_string()))
}
