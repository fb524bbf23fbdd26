//! TLS connection
//!
//! Implements [`Connection`] over an OpenSSL stream. The handshake runs with
//! the socket in OS-blocking mode bounded by the connection timeout; the
//! socket is then switched to non-blocking and reads/writes map OpenSSL's
//! want-read/want-write conditions onto readiness waits.

use super::config::{TlsConfig, TlsError};
use crate::http::connection::{drive, Attempt, ConnState, Connection};
use crate::http::{Error, Result};
use crate::net::{self, PollEvents};
use openssl::ssl::{ErrorCode, Ssl, SslStream};
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// TLS connection
pub struct TlsConnection {
    stream: Option<SslStream<TcpStream>>,
    config: TlsConfig,
    state: ConnState,
    failed: bool,
}

impl TlsConnection {
    /// Create an unopened TLS connection
    pub fn new(config: TlsConfig) -> Self {
        TlsConnection {
            stream: None,
            config,
            state: ConnState::new(),
            failed: false,
        }
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Negotiated protocol version, e.g. `TLSv1.3`
    pub fn protocol_version(&self) -> Option<&'static str> {
        self.stream.as_ref().map(|s| s.ssl().version_str())
    }

    /// Negotiated cipher name
    pub fn cipher(&self) -> Option<&'static str> {
        self.stream
            .as_ref()
            .and_then(|s| s.ssl().current_cipher())
            .map(|c| c.name())
    }

    fn install(&mut self, stream: SslStream<TcpStream>, host: &str, addr: SocketAddr) {
        self.state.connected(host, addr);
        self.stream = Some(stream);
        self.failed = false;
        tracing::debug!(
            connection = %self.description(),
            version = self.protocol_version().unwrap_or("unknown"),
            "TLS connection open"
        );
    }

    /// Map a failed `ssl_read`/`ssl_write` onto an [`Attempt`]
    fn classify(e: openssl::ssl::Error, failed: &mut bool) -> Result<Attempt<usize>> {
        match e.code() {
            ErrorCode::ZERO_RETURN => Ok(Attempt::Ready(0)),
            ErrorCode::WANT_READ => Ok(Attempt::Wait(PollEvents::Read)),
            ErrorCode::WANT_WRITE => Ok(Attempt::Wait(PollEvents::Write)),
            ErrorCode::SYSCALL => match e.io_error() {
                // Peer vanished without close_notify
                None => Ok(Attempt::Ready(0)),
                Some(io) if io.kind() == io::ErrorKind::Interrupted => {
                    Ok(Attempt::Wait(PollEvents::Read))
                }
                Some(_) => {
                    *failed = true;
                    match e.into_io_error() {
                        Ok(io) => Err(Error::Io(io)),
                        Err(e) => Err(TlsError::OperationFailed(e.to_string()).into()),
                    }
                }
            },
            _ => {
                *failed = true;
                Err(TlsError::OperationFailed(e.to_string()).into())
            }
        }
    }
}

/// Put `tcp` in OS-blocking mode bounded by `timeout` for the handshake
fn prepare_handshake(tcp: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    tcp.set_nonblocking(false)?;
    tcp.set_read_timeout(timeout.filter(|t| !t.is_zero()))?;
    tcp.set_write_timeout(timeout.filter(|t| !t.is_zero()))?;
    Ok(())
}

fn finish_handshake(tcp: &TcpStream) -> io::Result<()> {
    tcp.set_read_timeout(None)?;
    tcp.set_write_timeout(None)?;
    tcp.set_nonblocking(true)
}

/// Client-side handshake on a freshly connected stream
fn handshake_client(
    tcp: TcpStream,
    config: &TlsConfig,
    host: &str,
    timeout: Option<Duration>,
) -> std::result::Result<SslStream<TcpStream>, TlsError> {
    prepare_handshake(&tcp, timeout)?;
    tcp.set_nodelay(true)?;

    let mut ssl = Ssl::new(&config.ctx)?;
    let name = config.servername().unwrap_or(host);
    // SNI carries DNS names only
    if name.parse::<IpAddr>().is_err() {
        ssl.set_hostname(name)?;
    }
    if config.verify_peer() {
        let param = ssl.param_mut();
        match name.parse::<IpAddr>() {
            Ok(ip) => param.set_ip(ip)?,
            Err(_) => param.set_host(name)?,
        }
    }

    let stream = ssl
        .connect(tcp)
        .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;
    finish_handshake(stream.get_ref())?;
    Ok(stream)
}

impl Connection for TlsConnection {
    fn open(&mut self, host: &str, port: u16) -> Result<()> {
        self.close()?;
        if self.config.is_server() {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            )
            .into());
        }

        let config = &self.config;
        let timeout = self.state.timeout;
        let result = net::connect_any(host, port, timeout, |tcp, _| {
            handshake_client(tcp, config, host, timeout)
        })
        .map_err(Error::from);

        let (stream, addr) = self.state.record(result)?;
        self.install(stream, host, addr);
        Ok(())
    }

    fn adopt(&mut self, tcp: TcpStream) -> Result<()> {
        self.close()?;
        if !self.config.is_server() {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            )
            .into());
        }

        let peer = tcp.peer_addr()?;
        let result = (|| -> std::result::Result<SslStream<TcpStream>, TlsError> {
            prepare_handshake(&tcp, self.state.timeout)?;
            let ssl = Ssl::new(&self.config.ctx)?;
            let stream = ssl
                .accept(tcp)
                .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;
            finish_handshake(stream.get_ref())?;
            Ok(stream)
        })()
        .map_err(Error::from);

        let stream = self.state.record(result)?;
        self.install(stream, &peer.ip().to_string(), peer);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(connection = %self.state.describe("tls"), "TLS connection closed");
            // close_notify goes out before the socket is torn down
            if !self.failed {
                let _ = stream.shutdown();
            }
            match stream.get_ref().shutdown(Shutdown::Both) {
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
        let fd = stream.get_ref().as_raw_fd();
        let failed = &mut self.failed;
        let result = drive(fd, self.state.blocking, self.state.timeout, || {
            match stream.ssl_read(buf) {
                Ok(n) => Ok(Attempt::Ready(n)),
                Err(e) => Self::classify(e, failed),
            }
        });
        self.state.record(result)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::NotConnected);
        };
        let fd = stream.get_ref().as_raw_fd();
        let failed = &mut self.failed;
        let result = drive(fd, self.state.blocking, self.state.timeout, || {
            match stream.ssl_write(buf) {
                Ok(n) => Ok(Attempt::Ready(n)),
                Err(e) => match Self::classify(e, failed)? {
                    // A zero-return on write means the peer shut the session
                    Attempt::Ready(_) => Err(Error::ConnectionClosed),
                    wait => Ok(wait),
                },
            }
        });
        self.state.record(result)
    }

    fn set_blocking(&mut self, blocking: bool, timeout: Option<Duration>) {
        self.state.blocking = blocking;
        self.state.timeout = timeout;
    }

    fn description(&self) -> String {
        self.state.describe("tls")
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn last_error(&self) -> Option<&str> {
        self.state.last_error.as_deref()
    }

    fn is_retryable(&self) -> bool {
        self.state.retryable
    }
}

impl Drop for TlsConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn client_config() -> TlsConfig {
        TlsConfig::client().verify_peer(false).build().unwrap()
    }

    #[test]
    fn test_tls_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server_config = TlsConfig::server().build().unwrap();

        let handle = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let mut conn = TlsConnection::new(server_config);
            conn.adopt(tcp).unwrap();
            assert!(conn.is_secure());

            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < 5 {
                got += conn.read(&mut buf[got..]).unwrap();
            }
            conn.write_all(&buf).unwrap();
            conn.close().unwrap();
        });

        let mut conn = TlsConnection::new(client_config());
        conn.open("127.0.0.1", port).unwrap();
        assert!(conn.protocol_version().is_some());
        assert!(conn.cipher().is_some());
        assert!(conn.description().starts_with("tls 127.0.0.1:"));

        conn.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            got += conn.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"hello");

        // close_notify from the server reads as end of stream
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
        handle.join().unwrap();

        conn.close().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_open());
    }

    #[test]
    fn test_handshake_failure_against_plain_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            use std::io::Write;
            let (mut tcp, _) = listener.accept().unwrap();
            let _ = tcp.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
        });

        let mut conn = TlsConnection::new(client_config());
        let result = conn.open("127.0.0.1", port);
        assert!(matches!(result, Err(Error::Network(net::Error::Connect { .. }))));
        assert!(!conn.is_open());
        handle.join().unwrap();
    }

    #[test]
    fn test_role_mismatch() {
        let mut conn = TlsConnection::new(client_config());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let tcp = TcpStream::connect(addr).unwrap();
        assert!(matches!(conn.adopt(tcp), Err(Error::Tls(TlsError::InvalidConfig(_)))));

        let mut conn = TlsConnection::new(TlsConfig::server().build().unwrap());
        assert!(matches!(
            conn.open("127.0.0.1", addr.port()),
            Err(Error::Tls(TlsError::InvalidConfig(_)))
        ));
    }
}
