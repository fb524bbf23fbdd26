//! HTTP client implementation
//!
//! [`HttpClient`] runs requests and responses over one open connection.
//! Bytes that arrive past the end of a response (for instance the final
//! response right behind an interim `100 Continue`) are kept for the next
//! receive.

use super::parser::Observer;
use super::{Connection, Error, Method, ParseStatus, Request, Response, ResponseParser, Result};
use bytes::BytesMut;
use std::time::Duration;

const READ_CHUNK: usize = 8192;

/// HTTP client over a single connection
pub struct HttpClient {
    conn: Box<dyn Connection>,
    leftover: BytesMut,
}

impl HttpClient {
    /// Create a new HTTP client over an open connection
    pub fn new(conn: Box<dyn Connection>) -> Self {
        HttpClient {
            conn,
            leftover: BytesMut::new(),
        }
    }

    /// Set the timeout for blocking reads and writes
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.conn.set_blocking(true, timeout);
    }

    /// Send the request head, followed by the body when `include_body` is set
    pub fn send_request(&mut self, request: &Request, include_body: bool) -> Result<()> {
        let wire = request.to_wire(include_body)?;
        tracing::trace!(
            method = %request.method(),
            target = request.target(),
            bytes = wire.len(),
            "sending request"
        );
        self.conn.write_all(&wire)
    }

    /// Send only the request body (after a `100 Continue`)
    pub fn send_body(&mut self, request: &Request) -> Result<()> {
        let body = request.body().to_bytes()?;
        if body.is_empty() {
            return Ok(());
        }
        self.conn.write_all(&body)
    }

    /// Receive one response to a request sent with `method`
    pub fn receive_response(&mut self, method: &Method) -> Result<Response> {
        self.receive_response_with(method, &mut |_| true)
    }

    /// Receive one response, reporting parse progress to `observer`.
    ///
    /// End-of-stream completes a read-until-close body and is an error
    /// anywhere else. Timeouts from the connection are passed through.
    pub fn receive_response_with(
        &mut self,
        method: &Method,
        observer: &mut Observer<'_>,
    ) -> Result<Response> {
        let mut parser = ResponseParser::for_method(method);
        let pending = std::mem::take(&mut self.leftover);
        let mut status = parser.feed_with(&pending, observer)?;

        let mut buf = vec![0u8; READ_CHUNK];
        while status == ParseStatus::Incomplete {
            let n = self.conn.read(&mut buf)?;
            status = if n == 0 {
                tracing::trace!("end of stream while receiving response");
                parser.finish_with(observer)?
            } else {
                parser.feed_with(&buf[..n], observer)?
            };
        }

        self.leftover = parser.take_backlog();
        match status {
            ParseStatus::Stopped => Err(Error::Protocol(
                "Response parsing stopped by observer".to_string(),
            )),
            _ => parser.into_response(),
        }
    }

    /// Bytes received past the last response
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<()> {
        self.leftover.clear();
        self.conn.close()
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    /// Get a mutable reference to the underlying connection
    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }

    /// Give the connection back
    pub fn into_connection(self) -> Box<dyn Connection> {
        self.conn
    }
}
