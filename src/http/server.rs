//! HTTP server implementation
//!
//! [`HttpServer`] serves requests on one accepted connection. It is what a
//! [`Listener`](super::Listener) handler typically wraps around the
//! connection it is given.

use super::chunked::ChunkedEncoder;
use super::date::format_http_date;
use super::{
    Connection, CookieJar, Error, Headers, Request, RequestParser, Response, Result, Status,
};
use bytes::BytesMut;
use std::time::{Duration, SystemTime};

const READ_CHUNK: usize = 8192;

/// HTTP server side of one connection
pub struct HttpServer {
    conn: Box<dyn Connection>,
    leftover: BytesMut,
    cookie_jar: Option<CookieJar>,
}

impl HttpServer {
    /// Create a new HTTP server over an accepted connection
    pub fn new(conn: Box<dyn Connection>) -> Self {
        HttpServer {
            conn,
            leftover: BytesMut::new(),
            cookie_jar: None,
        }
    }

    /// Record the `Cookie` headers of received requests in `jar`, keyed by
    /// the request's Host
    pub fn with_cookie_jar(mut self, jar: CookieJar) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    /// Set the timeout for blocking reads and writes
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.conn.set_blocking(true, timeout);
    }

    /// Receive the next request.
    ///
    /// Pipelined bytes past the request are kept for the following call.
    /// End-of-stream before a complete request is [`Error::ConnectionClosed`].
    pub fn receive_request(&mut self) -> Result<Request> {
        let mut parser = RequestParser::with_backlog(std::mem::take(&mut self.leftover));
        let mut buf = vec![0u8; READ_CHUNK];

        let request = loop {
            if let Some(request) = parser.feed(&[])? {
                break request;
            }
            let n = self.conn.read(&mut buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            if let Some(request) = parser.feed(&buf[..n])? {
                break request;
            }
        };

        self.leftover = parser.take_backlog();
        tracing::debug!(
            connection = %self.conn.description(),
            method = %request.method(),
            target = request.target(),
            "request received"
        );

        if let Some(jar) = &self.cookie_jar {
            match request.headers().get("Host").map(host_of) {
                Some(host) => jar.capture_request_cookies(host, request.headers()),
                None => tracing::debug!("no Host header, request cookies not captured"),
            }
        }
        Ok(request)
    }

    /// Send a response.
    ///
    /// `Date` is added when missing, and so is `Content-Length` unless the
    /// response is chunked or its status forbids a body.
    pub fn send_response(&mut self, response: &Response) -> Result<()> {
        let mut response = response.clone();
        let headers = response.headers_mut();
        if !headers.exists("Date") {
            headers.insert("Date", format_http_date(SystemTime::now()));
        }
        let framed = headers.exists("Content-Length") || headers.exists("Transfer-Encoding");
        if !framed && !response.status().forbids_body() {
            let len = response.body().len();
            response.headers_mut().insert("Content-Length", len.to_string());
        }

        let wire = response.to_wire()?;
        self.conn.write_all(&wire)
    }

    /// Send a simple 200 OK response
    pub fn send_ok(&mut self, body: &[u8]) -> Result<()> {
        let response = Response::builder()
            .status(Status::OK)
            .header("Content-Type", "text/plain")
            .body(body.to_vec())
            .build();

        self.send_response(&response)
    }

    /// Send a simple error response
    pub fn send_error(&mut self, status: Status, message: &str) -> Result<()> {
        let response = Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(message.as_bytes().to_vec())
            .build();

        self.send_response(&response)
    }

    /// Send an interim `100 Continue`
    pub fn send_continue(&mut self) -> Result<()> {
        let wire = Response::new(Status::CONTINUE).to_wire()?;
        self.conn.write_all(&wire)
    }

    /// Send a response whose body goes out in `chunks` with chunked encoding
    pub fn send_chunked_response(
        &mut self,
        status: Status,
        headers: &Headers,
        chunks: &[&[u8]],
    ) -> Result<()> {
        let mut response = Response::new(status);
        *response.headers_mut() = headers.clone();
        let headers = response.headers_mut();
        headers.remove_all("Content-Length");
        headers.set("Transfer-Encoding", "chunked");
        if !headers.exists("Date") {
            headers.insert("Date", format_http_date(SystemTime::now()));
        }

        let mut wire = response.to_wire()?;
        let mut encoder = ChunkedEncoder::new(&mut wire);
        for chunk in chunks {
            encoder.write_chunk(chunk)?;
        }
        encoder.finish()?;

        self.conn.write_all(&wire)
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
}

/// Host part of a Host header value
fn host_of(value: &str) -> &str {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    value.split(':').next().unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, PlainConnection};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn accept_with<F>(client: F) -> (HttpServer, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || client(TcpStream::connect(addr).unwrap()));

        let (stream, _) = listener.accept().unwrap();
        let mut conn = PlainConnection::new();
        conn.adopt(stream).unwrap();
        (HttpServer::new(Box::new(conn)), handle)
    }

    fn read_to_end(mut stream: TcpStream) -> String {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_receive_request() {
        let (mut server, handle) = accept_with(|mut stream| {
            stream
                .write_all(b"GET /test HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .unwrap();
            let response = read_to_end(stream);
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("Content-Length: 2\r\n"));
            assert!(response.contains("Date: "));
            assert!(response.ends_with("\r\n\r\nOK"));
        });

        let request = server.receive_request().unwrap();
        assert_eq!(request.method(), &Method::Get);
        assert_eq!(request.target(), "/test");
        assert_eq!(request.headers().get("Host"), Some("localhost"));

        server.send_ok(b"OK").unwrap();
        server.close().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_pipelined_requests() {
        let (mut server, handle) = accept_with(|mut stream| {
            stream
                .write_all(
                    b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n",
                )
                .unwrap();
            read_to_end(stream);
        });

        let first = server.receive_request().unwrap();
        assert_eq!(first.target(), "/a");
        assert_eq!(first.body().to_bytes().unwrap(), b"abc");

        let second = server.receive_request().unwrap();
        assert_eq!(second.method(), &Method::Get);
        assert_eq!(second.target(), "/b");

        server.close().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_before_request() {
        let (mut server, handle) = accept_with(|mut stream| {
            stream.write_all(b"GET /partial HTT").unwrap();
        });
        handle.join().unwrap();
        assert!(matches!(server.receive_request(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_chunked_response() {
        let (mut server, handle) = accept_with(|mut stream| {
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
            let response = read_to_end(stream);
            assert!(response.contains("Transfer-Encoding: chunked\r\n"));
            assert!(!response.contains("Content-Length"));
            assert!(response.ends_with("\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"));
        });

        server.receive_request().unwrap();
        let mut headers = Headers::new();
        headers.insert("Content-Length", "99");
        server
            .send_chunked_response(Status::OK, &headers, &[b"hello", b"", b" world"])
            .unwrap();
        server.close().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_no_content_has_no_length() {
        let (mut server, handle) = accept_with(|mut stream| {
            stream.write_all(b"DELETE /x HTTP/1.1\r\n\r\n").unwrap();
            let response = read_to_end(stream);
            assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"));
            assert!(!response.contains("Content-Length"));
        });

        server.receive_request().unwrap();
        server.send_response(&Response::new(Status::NO_CONTENT)).unwrap();
        server.close().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_cookie_capture() {
        let jar = CookieJar::new();
        let (server, handle) = accept_with(|mut stream| {
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: app.local:8080\r\nCookie: sid=42; theme=dark\r\n\r\n")
                .unwrap();
            read_to_end(stream);
        });
        let mut server = server.with_cookie_jar(jar.clone());

        server.receive_request().unwrap();
        let cookies = jar.get("app.local");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].value(), "42");

        server.close().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("example.com:8080"), "example.com");
        assert_eq!(host_of("[::1]:8080"), "::1");
    }
}
