//! Server accept loop
//!
//! [`Listener`] owns one dual-stack, non-blocking listening socket. Its
//! [`run`](Listener::run) loop polls with a short timeout so an exit
//! predicate is checked regularly, accepts every pending connection, wraps
//! each in a plain or TLS [`Connection`] and hands it to the caller's
//! handler on a thread of its own.
//!
//! ```no_run
//! use h1wire::http::{HttpServer, Listener, ServerConfig};
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let stop = Arc::new(AtomicBool::new(false));
//! let mut listener = Listener::bind(ServerConfig::builder().port(8080).build()).unwrap();
//! let flag = stop.clone();
//! listener
//!     .run(
//!         |conn| {
//!             let mut server = HttpServer::new(conn);
//!             if server.receive_request().is_ok() {
//!                 let _ = server.send_ok(b"hello");
//!             }
//!         },
//!         move || flag.load(Ordering::Relaxed),
//!     )
//!     .unwrap();
//! ```

use super::connection::{self, Connection};
use super::tls::TlsConfig;
use super::{Error, Result};
use crate::net::{self, PollEvents};
use socket2::Socket;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Accept loop configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) port: u16,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) poll_interval: Duration,
    pub(crate) io_timeout: Option<Duration>,
    pub(crate) shutdown_grace: Duration,
    pub(crate) backlog: i32,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfigBuilder::default().build()
    }
}

/// Builder for [`ServerConfig`]
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    port: u16,
    tls: Option<TlsConfig>,
    poll_interval: Duration,
    io_timeout: Option<Duration>,
    shutdown_grace: Duration,
    backlog: i32,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        ServerConfigBuilder {
            port: 0,
            tls: None,
            poll_interval: Duration::from_millis(50),
            io_timeout: Some(connection::DEFAULT_TIMEOUT),
            shutdown_grace: Duration::from_secs(5),
            backlog: 128,
        }
    }
}

impl ServerConfigBuilder {
    /// Port to listen on; 0 picks an ephemeral port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Serve TLS with the given server configuration
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// How long each poll waits before the exit predicate is checked again
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// I/O timeout of accepted connections (`None` waits forever)
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// How long shutdown waits for running handlers
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn build(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            tls: self.tls,
            poll_interval: self.poll_interval.max(Duration::from_millis(1)),
            io_timeout: self.io_timeout,
            shutdown_grace: self.shutdown_grace,
            backlog: self.backlog.max(1),
        }
    }
}

/// Listening socket plus the accept loop driving it
pub struct Listener {
    socket: Option<Socket>,
    port: u16,
    config: ServerConfig,
}

impl Listener {
    /// Bind the listening socket
    pub fn bind(config: ServerConfig) -> Result<Self> {
        if let Some(tls) = &config.tls {
            if !tls.is_server() {
                return Err(Error::Protocol(
                    "Listener needs a server TLS configuration".to_string(),
                ));
            }
        }

        let socket = net::bind_dual_stack(config.port, config.backlog)?;
        let port = net::local_port(&socket)?;
        tracing::info!(port, tls = config.tls.is_some(), "listener bound");

        Ok(Listener {
            socket: Some(socket),
            port,
            config,
        })
    }

    /// Port the listener is bound to
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections until `should_exit` returns true.
    ///
    /// Each connection is set up (including the TLS handshake) and handled
    /// on its own thread, so a slow client never holds up accepting. A
    /// failure on one connection is logged and that connection closed; only
    /// poll failures end the loop with an error. On exit the listening
    /// socket is closed and running handlers get up to the configured grace
    /// period to finish.
    pub fn run<H, P>(&mut self, handler: H, mut should_exit: P) -> Result<()>
    where
        H: Fn(Box<dyn Connection>) + Send + Sync + 'static,
        P: FnMut() -> bool,
    {
        let socket = self.socket.take().ok_or(Error::NotConnected)?;
        let handler = Arc::new(handler);
        let mut workers = Vec::new();

        let result = self.accept_loop(&socket, &handler, &mut workers, &mut should_exit);

        let _ = socket.shutdown(Shutdown::Both);
        drop(socket);
        tracing::info!(port = self.port, running = workers.len(), "listener closed");
        self.drain(workers);
        result
    }

    fn accept_loop<H>(
        &self,
        socket: &Socket,
        handler: &Arc<H>,
        workers: &mut Vec<JoinHandle<()>>,
        should_exit: &mut dyn FnMut() -> bool,
    ) -> Result<()>
    where
        H: Fn(Box<dyn Connection>) + Send + Sync + 'static,
    {
        let fd = socket.as_raw_fd();

        while !should_exit() {
            reap(workers);

            if !net::wait_ready(fd, PollEvents::Read, Some(self.config.poll_interval))? {
                continue;
            }

            loop {
                match socket.accept() {
                    Ok((accepted, addr)) => {
                        let peer = addr.as_socket();
                        self.dispatch(accepted.into(), peer, handler, workers);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EMFILE and friends stay readable; wait before polling again
                        tracing::warn!(error = %e, "accept failed");
                        thread::sleep(self.config.poll_interval);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch<H>(
        &self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
        handler: &Arc<H>,
        workers: &mut Vec<JoinHandle<()>>,
    ) where
        H: Fn(Box<dyn Connection>) + Send + Sync + 'static,
    {
        let peer_name = peer.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string());
        tracing::debug!(peer = %peer_name, "connection accepted");

        let tls = self.config.tls.clone();
        let timeout = self.config.io_timeout;
        let handler = Arc::clone(handler);
        let name = peer_name.clone();

        let spawned = thread::Builder::new()
            .name(format!("conn-{}", peer_name))
            .spawn(move || {
                let mut conn = match connection::create(tls.is_some(), tls.as_ref()) {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(peer = %name, error = %e, "connection setup failed");
                        return;
                    }
                };
                conn.set_blocking(true, timeout);
                if let Err(e) = conn.adopt(stream) {
                    tracing::warn!(peer = %name, error = %e, "connection setup failed");
                    return;
                }
                (*handler)(conn);
            });

        match spawned {
            Ok(worker) => workers.push(worker),
            Err(e) => tracing::warn!(peer = %peer_name, error = %e, "could not spawn handler"),
        }
    }

    /// Wait for running handlers, up to the grace period
    fn drain(&self, mut workers: Vec<JoinHandle<()>>) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            reap(&mut workers);
            if workers.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(running = workers.len(), "handlers still running after grace period");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Join finished handler threads, logging panics
fn reap(workers: &mut Vec<JoinHandle<()>>) {
    let mut index = 0;
    while index < workers.len() {
        if workers[index].is_finished() {
            let worker = workers.swap_remove(index);
            if worker.join().is_err() {
                tracing::warn!("connection handler panicked");
            }
        } else {
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpServer;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn fast_config() -> ServerConfigBuilder {
        ServerConfig::builder()
            .poll_interval(Duration::from_millis(10))
            .shutdown_grace(Duration::from_secs(2))
    }

    fn roundtrip(port: u16) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_serves_until_exit() {
        let mut listener = Listener::bind(fast_config().build()).unwrap();
        let port = listener.local_port();
        let stop = Arc::new(AtomicBool::new(false));
        let served = Arc::new(AtomicUsize::new(0));

        let flag = stop.clone();
        let count = served.clone();
        let loop_thread = thread::spawn(move || {
            listener.run(
                move |conn| {
                    let mut server = HttpServer::new(conn);
                    server.receive_request().unwrap();
                    server.send_ok(b"hi").unwrap();
                    server.close().unwrap();
                    count.fetch_add(1, Ordering::SeqCst);
                },
                move || flag.load(Ordering::SeqCst),
            )
        });

        for _ in 0..3 {
            assert!(roundtrip(port).ends_with("\r\n\r\nhi"));
        }

        stop.store(true, Ordering::SeqCst);
        loop_thread.join().unwrap().unwrap();
        assert_eq!(served.load(Ordering::SeqCst), 3);

        // The listening socket is gone
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
    }

    #[test]
    fn test_slow_client_does_not_block_accept() {
        let mut listener = Listener::bind(fast_config().build()).unwrap();
        let port = listener.local_port();
        let stop = Arc::new(AtomicBool::new(false));

        let flag = stop.clone();
        let loop_thread = thread::spawn(move || {
            listener.run(
                |conn| {
                    let mut server = HttpServer::new(conn);
                    if server.receive_request().is_ok() {
                        let _ = server.send_ok(b"fast");
                    }
                    let _ = server.close();
                },
                move || flag.load(Ordering::SeqCst),
            )
        });

        // Connects but never sends a request
        let _idle = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(roundtrip(port).ends_with("fast"));

        stop.store(true, Ordering::SeqCst);
        drop(_idle);
        loop_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let mut listener = Listener::bind(fast_config().build()).unwrap();
        let port = listener.local_port();
        let stop = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let flag = stop.clone();
        let count = calls.clone();
        let loop_thread = thread::spawn(move || {
            listener.run(
                move |conn| {
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first handler fails");
                    }
                    let mut server = HttpServer::new(conn);
                    server.receive_request().unwrap();
                    server.send_ok(b"second").unwrap();
                    server.close().unwrap();
                },
                move || flag.load(Ordering::SeqCst),
            )
        });

        let mut first = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut sink = Vec::new();
        // Handler panicked and dropped the connection
        first.read_to_end(&mut sink).unwrap();

        assert!(roundtrip(port).ends_with("second"));

        stop.store(true, Ordering::SeqCst);
        loop_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_grace_period_bounds_shutdown() {
        let mut listener = Listener::bind(
            fast_config()
                .shutdown_grace(Duration::from_millis(100))
                .build(),
        )
        .unwrap();
        let port = listener.local_port();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let entered_tx = std::sync::Mutex::new(entered_tx);
        let stop = Arc::new(AtomicBool::new(false));

        let flag = stop.clone();
        let loop_thread = thread::spawn(move || {
            listener.run(
                move |_conn| {
                    let _ = entered_tx.lock().unwrap().send(());
                    thread::sleep(Duration::from_secs(2));
                },
                move || flag.load(Ordering::SeqCst),
            )
        });

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        entered_rx.recv().unwrap();

        let started = Instant::now();
        stop.store(true, Ordering::SeqCst);
        loop_thread.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_client_tls_config() {
        let tls = TlsConfig::client().verify_peer(false).build().unwrap();
        let result = Listener::bind(ServerConfig::builder().tls(tls).build());
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_run_twice_fails() {
        let mut listener = Listener::bind(fast_config().build()).unwrap();
        listener.run(|_| {}, || true).unwrap();
        assert!(matches!(listener.run(|_| {}, || true), Err(Error::NotConnected)));
    }
}
