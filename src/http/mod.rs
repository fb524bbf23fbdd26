//! HTTP/1.x implementation
//!
//! This module provides the HTTP/1.0 and HTTP/1.1 client and server roles.
//!
//! # Architecture
//!
//! The HTTP layer is written against the [`Connection`] capability trait so
//! every piece of I/O code is transparent to the underlying transport:
//!
//! - [`PlainConnection`] speaks directly over a TCP socket
//! - [`tls::TlsConnection`] routes reads and writes through OpenSSL
//! - [`connection::create`] picks the variant for a target
//!
//! On top of the transport sit the incremental [`ResponseParser`], the
//! single-connection [`HttpClient`], the [`Exchange`] orchestrator that
//! follows redirects and answers authentication challenges, and the
//! server-side [`HttpServer`] and [`Listener`] accept loop.
//!
//! # Examples
//!
//! ```no_run
//! use h1wire::http::{ClientConfig, Exchange, Method, Request};
//!
//! let mut exchange = Exchange::new("http://127.0.0.1:8080/", ClientConfig::default()).unwrap();
//! let request = Request::builder()
//!     .method(Method::Get)
//!     .target("/index.html")
//!     .build();
//! let response = exchange.execute(request).unwrap();
//! assert_eq!(response.status().code(), 200);
//! ```

pub mod auth;
pub mod chunked;
pub mod client;
pub mod connection;
pub mod cookie;
pub mod date;
pub mod exchange;
pub mod headers;
pub mod listener;
pub mod message;
pub mod parser;
pub mod server;
pub mod tls;

pub use client::HttpClient;
pub use connection::{Connection, PlainConnection};
pub use cookie::{Cookie, CookieJar};
pub use exchange::{ClientConfig, Exchange, LastError, Origin};
pub use headers::Headers;
pub use listener::{Listener, ServerConfig};
pub use message::{Body, ContentEncoding, Credentials, Method, Request, Response, Status, Version};
pub use parser::{ParseEvent, ParseStatus, RequestParser, ResponseParser};
pub use server::HttpServer;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Redirect response {0} has no Location header")]
    MissingLocation(u16),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection is not open")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server responded with {}", .0.status())]
    Status(Box<Response>),
}

/// Coarse classification of an [`Error`]
///
/// Separates "never reached the server" from "the server spoke garbage" from
/// "the server answered with an error status".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Status,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::Network(_)
            | Error::Tls(_)
            | Error::Timeout
            | Error::ConnectionClosed
            | Error::NotConnected => ErrorKind::Transport,
            Error::Status(_) => ErrorKind::Status,
            _ => ErrorKind::Protocol,
        }
    }

    /// Whether repeating the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// The final response carried by a status failure
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Status(response) => Some(response),
            _ => None,
        }
    }
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 100;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Timeout.kind(), ErrorKind::Transport);
        assert!(Error::Timeout.is_retryable());
        assert_eq!(Error::InvalidChunkSize("zz".into()).kind(), ErrorKind::Protocol);
        assert_eq!(Error::MissingLocation(302).kind(), ErrorKind::Protocol);

        let response = Response::new(Status::NOT_FOUND);
        let err = Error::Status(Box::new(response));
        assert_eq!(err.kind(), ErrorKind::Status);
        assert_eq!(err.response().unwrap().status().code(), 404);
        assert!(!err.is_retryable());
    }
}
