//! TLS support for HTTP connections
//!
//! [`TlsConnection`] implements the [`Connection`](crate::http::Connection)
//! trait over OpenSSL, so all HTTP code runs unchanged over TLS.
//!
//! 1. [`TlsConfig`] holds the settings (versions, ciphers, certificates)
//! 2. [`TlsConnection`] performs the handshake and the encrypted I/O
//!
//! # Examples
//!
//! ## Client with TLS
//!
//! ```no_run
//! use h1wire::http::tls::{TlsConfig, TlsConnection, TlsVersion};
//! use h1wire::http::{Connection, HttpClient};
//!
//! let tls_config = TlsConfig::client()
//!     .version(TlsVersion::Tls13)
//!     .servername("example.com")
//!     .build()
//!     .unwrap();
//!
//! let mut conn = TlsConnection::new(tls_config);
//! conn.open("example.com", 443).unwrap();
//! let mut client = HttpClient::new(Box::new(conn));
//! ```
//!
//! ## Server with TLS
//!
//! ```no_run
//! use h1wire::http::tls::{TlsConfig, TlsConnection};
//! use h1wire::http::{Connection, HttpServer};
//! use std::net::TcpListener;
//!
//! let tls_config = TlsConfig::server().cert_file("server.pem").unwrap().build().unwrap();
//!
//! let listener = TcpListener::bind("127.0.0.1:8443").unwrap();
//! let (tcp_stream, _) = listener.accept().unwrap();
//! let mut conn = TlsConnection::new(tls_config);
//! conn.adopt(tcp_stream).unwrap();
//! let mut server = HttpServer::new(Box::new(conn));
//! ```

pub mod builtin_cert;
pub mod config;
pub mod connection;

pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use connection::TlsConnection;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
