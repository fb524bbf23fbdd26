//! Transport connections
//!
//! This module provides the [`Connection`] capability trait that lets every
//! piece of HTTP code run unchanged over plain TCP or TLS.
//!
//! Sockets are always switched to non-blocking mode once connected.
//! "Blocking" I/O is emulated on top of that: an operation that would block
//! waits for readiness and retries until the connection timeout runs out,
//! then fails with [`Error::Timeout`]. In non-blocking mode the same
//! situation fails immediately with [`Error::Timeout`]; either way it is
//! retryable and distinct from end-of-stream, which reads report as `Ok(0)`.

use super::tls::{TlsConfig, TlsConnection};
use super::{Error, Result};
use crate::net::{self, Family, PollEvents};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Default I/O timeout of a new connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte-stream transport used by the HTTP layer
///
/// A connection is owned by one logical user at a time; it is `Send` but not
/// internally synchronized.
pub trait Connection: Send {
    /// Connect to `host:port`, trying every resolved address in turn
    fn open(&mut self, host: &str, port: u16) -> Result<()>;

    /// Take ownership of an accepted socket (server side)
    fn adopt(&mut self, stream: TcpStream) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the connection; closing twice is a no-op
    fn close(&mut self) -> Result<()>;

    /// Read into `buf`; `Ok(0)` means the peer closed the stream
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write from `buf`, returning how many bytes were accepted
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Choose emulated-blocking (wait up to `timeout`, `None` waits forever)
    /// or non-blocking I/O
    fn set_blocking(&mut self, blocking: bool, timeout: Option<Duration>);

    /// Human-readable identity, e.g. `tls example.com:443 (IPv4)`
    fn description(&self) -> String;

    /// Whether bytes travel encrypted
    fn is_secure(&self) -> bool;

    /// Message of the most recent failure
    fn last_error(&self) -> Option<&str>;

    /// Whether the most recent failure may succeed on retry
    fn is_retryable(&self) -> bool;

    /// Write the whole buffer
    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Create an unopened connection for a plain or TLS target.
///
/// TLS targets without an explicit configuration get a default client
/// configuration.
pub fn create(secure: bool, tls: Option<&TlsConfig>) -> Result<Box<dyn Connection>> {
    if !secure {
        return Ok(Box::new(PlainConnection::new()));
    }
    let config = match tls {
        Some(config) => config.clone(),
        None => TlsConfig::client().build()?,
    };
    Ok(Box::new(TlsConnection::new(config)))
}

/// Identity and mutable I/O state shared by both connection variants
#[derive(Debug, Clone)]
pub(crate) struct ConnState {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) family: Option<Family>,
    pub(crate) blocking: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) last_error: Option<String>,
    pub(crate) retryable: bool,
}

impl ConnState {
    pub(crate) fn new() -> Self {
        ConnState {
            host: String::new(),
            port: 0,
            family: None,
            blocking: true,
            timeout: Some(DEFAULT_TIMEOUT),
            last_error: None,
            retryable: false,
        }
    }

    pub(crate) fn connected(&mut self, host: &str, addr: SocketAddr) {
        self.host = host.to_string();
        self.port = addr.port();
        self.family = Some(Family::of(&addr));
        self.last_error = None;
        self.retryable = false;
    }

    /// Remember the outcome of an operation for `last_error`/`is_retryable`
    pub(crate) fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.retryable = false,
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.retryable = e.is_retryable();
            }
        }
        result
    }

    pub(crate) fn describe(&self, scheme: &str) -> String {
        let family = self.family.map(|f| f.as_str()).unwrap_or("unconnected");
        format!("{} {}:{} ({})", scheme, self.host, self.port, family)
    }
}

/// Result of one attempt at a non-blocking operation
pub(crate) enum Attempt<T> {
    Ready(T),
    Wait(PollEvents),
}

/// Run `attempt` until it completes, waiting for readiness in between.
///
/// In blocking mode the total wait is bounded by `timeout`; in non-blocking
/// mode a single readiness check with zero timeout is made.
pub(crate) fn drive<T>(
    fd: RawFd,
    blocking: bool,
    timeout: Option<Duration>,
    mut attempt: impl FnMut() -> Result<Attempt<T>>,
) -> Result<T> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let events = match attempt()? {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Wait(events) => events,
        };

        let wait = if !blocking {
            Some(Duration::ZERO)
        } else {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            }
        };

        if !net::wait_ready(fd, events, wait)? {
            return Err(Error::Timeout);
        }
    }
}

/// Map a raw socket result onto an [`Attempt`]
fn socket_attempt(result: io::Result<usize>, events: PollEvents) -> Result<Attempt<usize>> {
    match result {
        Ok(n) => Ok(Attempt::Ready(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
            Ok(Attempt::Wait(events))
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Plain TCP connection
pub struct PlainConnection {
    stream: Option<TcpStream>,
    state: ConnState,
}

impl PlainConnection {
    /// Create an unopened plain connection
    pub fn new() -> Self {
        PlainConnection {
            stream: None,
            state: ConnState::new(),
        }
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    fn install(&mut self, stream: TcpStream, host: &str, addr: SocketAddr) -> Result<()> {
        stream.set_nonblocking(true)?;
        self.state.connected(host, addr);
        self.stream = Some(stream);
        tracing::debug!(connection = %self.description(), "connection open");
        Ok(())
    }
}

impl Default for PlainConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for PlainConnection {
    fn open(&mut self, host: &str, port: u16) -> Result<()> {
        self.close()?;
        let result = net::connect_any(host, port, self.state.timeout, |stream, _| {
            stream.set_nodelay(true)?;
            Ok::<_, io::Error>(stream)
        })
        .map_err(Error::from);

        let (stream, addr) = self.state.record(result)?;
        self.install(stream, host, addr)
    }

    fn adopt(&mut self, stream: TcpStream) -> Result<()> {
        self.close()?;
        let peer = stream.peer_addr()?;
        self.install(stream, &peer.ip().to_string(), peer)
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            tracing::debug!(connection = %self.state.describe("plain"), "connection closed");
            match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(Error::Io(e)),
                _ => {}
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::NotConnected);
        };
        let fd = stream.as_raw_fd();
        let result = drive(fd, self.state.blocking, self.state.timeout, || {
            socket_attempt(stream.read(buf), PollEvents::Read)
        });
        self.state.record(result)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::NotConnected);
        };
        let fd = stream.as_raw_fd();
        let result = drive(fd, self.state.blocking, self.state.timeout, || {
            socket_attempt(stream.write(buf), PollEvents::Write)
        });
        self.state.record(result)
    }

    fn set_blocking(&mut self, blocking: bool, timeout: Option<Duration>) {
        self.state.blocking = blocking;
        self.state.timeout = timeout;
    }

    fn description(&self) -> String {
        self.state.describe("plain")
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn last_error(&self) -> Option<&str> {
        self.state.last_error.as_deref()
    }

    fn is_retryable(&self) -> bool {
        self.state.retryable
    }
}

impl Drop for PlainConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_plain_open_read_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").unwrap();
        });

        let mut conn = PlainConnection::new();
        conn.open("127.0.0.1", port).unwrap();
        assert!(conn.is_open());
        assert!(!conn.is_secure());
        assert_eq!(conn.description(), format!("plain 127.0.0.1:{} (IPv4)", port));

        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += conn.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"pong");

        handle.join().unwrap();
        // Peer is gone: end of stream
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_blocking_read_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(1));
        });

        let mut conn = PlainConnection::new();
        conn.open("127.0.0.1", port).unwrap();
        conn.set_blocking(true, Some(Duration::from_millis(100)));

        let started = Instant::now();
        let mut buf = [0u8; 8];
        let result = conn.read(&mut buf);
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(conn.is_retryable());
        assert_eq!(conn.last_error(), Some("Timeout"));
    }

    #[test]
    fn test_non_blocking_read_returns_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(1));
        });

        let mut conn = PlainConnection::new();
        conn.open("127.0.0.1", port).unwrap();
        conn.set_blocking(false, Some(Duration::from_secs(5)));

        let started = Instant::now();
        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf), Err(Error::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_adopt_and_idempotent_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"hi").unwrap();
        });

        let (accepted, _) = listener.accept().unwrap();
        let mut conn = PlainConnection::new();
        conn.adopt(accepted).unwrap();

        let mut buf = [0u8; 2];
        let mut got = 0;
        while got < 2 {
            got += conn.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"hi");

        conn.close().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_open());
        assert!(matches!(conn.read(&mut buf), Err(Error::NotConnected)));
        client.join().unwrap();
    }

    #[test]
    fn test_open_refused() {
        // Grab a free port, then release it so nothing listens there
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let mut conn = PlainConnection::new();
        let result = conn.open("127.0.0.1", port);
        assert!(matches!(result, Err(Error::Network(net::Error::Connect { .. }))));
        assert!(!conn.is_open());
        assert!(conn.last_error().is_some());
    }

    #[test]
    fn test_factory_picks_variant() {
        assert!(!create(false, None).unwrap().is_secure());
        assert!(create(true, None).unwrap().is_secure());
    }
}
