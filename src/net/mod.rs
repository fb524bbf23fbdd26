//! Socket-level plumbing
//!
//! Name resolution, connect-any over every resolved address, the dual-stack
//! listening socket and the readiness wait primitive shared by plain and TLS
//! connections.

pub mod listen;

pub use listen::{bind_dual_stack, local_port};

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::RawFd;
use std::time::Duration;

/// Result type for socket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Socket-level errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("No addresses found for {0}")]
    NoAddress(String),

    #[error("Unable to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Poll failed: {0}")]
    Poll(io::Error),
}

/// Address family of a connected socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::Ipv4,
            SocketAddr::V6(_) => Family::Ipv6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Ipv4 => "IPv4",
            Family::Ipv6 => "IPv6",
        }
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Wait until `fd` is ready for `events` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. `None` waits forever, a zero duration
/// only checks current readiness. Hang-up and error conditions count as
/// ready so the following read or write observes them.
pub fn wait_ready(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, EINTR, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    loop {
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(EINTR) {
                continue;
            }
            return Err(Error::Poll(err));
        }
        return Ok(result > 0);
    }
}

/// Resolve `host:port` into every candidate address, in resolver order.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            port,
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::NoAddress(format!("{}:{}", host, port)));
    }
    Ok(addrs)
}

/// Try each resolved address in turn and keep the first one for which both
/// the TCP connect and `establish` succeed.
///
/// `establish` runs on the freshly connected stream, so a TLS handshake
/// failure on one address moves on to the next candidate. Exhausting every
/// candidate fails with [`Error::Connect`] carrying the last failure.
pub fn connect_any<T, E, F>(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
    mut establish: F,
) -> Result<(T, SocketAddr)>
where
    E: std::fmt::Display,
    F: FnMut(TcpStream, SocketAddr) -> std::result::Result<T, E>,
{
    let target = format!("{}:{}", host, port);
    let mut last_failure = String::from("no candidates tried");

    for addr in resolve(host, port)? {
        let stream = match timeout {
            Some(t) if !t.is_zero() => TcpStream::connect_timeout(&addr, t),
            _ => TcpStream::connect(addr),
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_failure = e.to_string();
                continue;
            }
        };

        match establish(stream, addr) {
            Ok(established) => return Ok((established, addr)),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connection setup failed");
                last_failure = e.to_string();
            }
        }
    }

    Err(Error::Connect {
        target,
        reason: last_failure,
    })
}
