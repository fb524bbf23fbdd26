//! HTTP message types
//!
//! This module defines the core types for HTTP requests and responses.

use super::{Error, Headers, RequestParser, Result, CRLF};
use std::fmt;
use std::path::{Path, PathBuf};

/// HTTP methods
///
/// Tokens outside the standard set are kept verbatim as [`Method::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Custom(String),
}

impl Method {
    /// Map a wire token to a method
    pub fn from_token(s: &str) -> Self {
        match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            other => Method::Custom(other.to_string()),
        }
    }

    /// Convert method to its wire token
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Custom(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Parse version from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Parse the three-digit status token of a status line
    pub fn from_token(token: &str) -> Result<Self> {
        if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidStatus(token.to_string()));
        }
        let code = token
            .parse::<u16>()
            .map_err(|_| Error::InvalidStatus(token.to_string()))?;
        Status::new(code)
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase, if the code is a registered one
    pub fn reason_phrase(&self) -> Option<&'static str> {
        let phrase = match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            102 => "Processing",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Range Not Satisfiable",
            417 => "Expectation Failed",
            421 => "Misdirected Request",
            422 => "Unprocessable Entity",
            425 => "Too Early",
            426 => "Upgrade Required",
            428 => "Precondition Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => return None,
        };
        Some(phrase)
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is a redirection status (3xx)
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Responses with this status never carry a body
    pub fn forbids_body(&self) -> bool {
        self.is_informational() || self.code == 204 || self.code == 304
    }

    // Common status codes as constants
    pub const CONTINUE: Status = Status { code: 100 };
    pub const OK: Status = Status { code: 200 };
    pub const NO_CONTENT: Status = Status { code: 204 };
    pub const MOVED_PERMANENTLY: Status = Status { code: 301 };
    pub const FOUND: Status = Status { code: 302 };
    pub const SEE_OTHER: Status = Status { code: 303 };
    pub const NOT_MODIFIED: Status = Status { code: 304 };
    pub const TEMPORARY_REDIRECT: Status = Status { code: 307 };
    pub const PERMANENT_REDIRECT: Status = Status { code: 308 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const UNAUTHORIZED: Status = Status { code: 401 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase().unwrap_or("Unknown"))
    }
}

/// Content-Encoding label of a body
///
/// Only detected from headers; bodies are never decoded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Other(String),
}

impl ContentEncoding {
    /// Label the final coding listed in a Content-Encoding header value
    pub fn from_header(value: Option<&str>) -> Self {
        let token = match value.and_then(|v| v.rsplit(',').next()) {
            Some(t) => t.trim(),
            None => return ContentEncoding::Identity,
        };
        match token.to_ascii_lowercase().as_str() {
            "" | "identity" => ContentEncoding::Identity,
            "gzip" | "x-gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            "br" => ContentEncoding::Brotli,
            _ => ContentEncoding::Other(token.to_string()),
        }
    }
}

/// Request body source
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Body length in bytes (stats the file for file-backed bodies)
    pub fn len(&self) -> Result<u64> {
        match self {
            Body::Empty => Ok(0),
            Body::Bytes(bytes) => Ok(bytes.len() as u64),
            Body::File(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    /// Load the body into memory
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::File(path) => Ok(std::fs::read(path)?),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(bytes)
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::from(s.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::from(s.into_bytes())
    }
}

/// Username and password answered to an authentication challenge
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    headers: Headers,
    body: Body,
    credentials: Option<Credentials>,
}

impl Request {
    /// Create a new HTTP request
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Request {
            method,
            target: target.into(),
            version: Version::default(),
            headers: Headers::new(),
            body: Body::Empty,
            credentials: None,
        }
    }

    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Parse one complete request from `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut parser = RequestParser::new();
        parser.feed(data)?.ok_or(Error::Incomplete)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Get the request target (origin-form path and query)
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = target.into();
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Use a file as the request body
    pub fn set_body_file(&mut self, path: impl AsRef<Path>) {
        self.body = Body::File(path.as_ref().to_path_buf());
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }

    /// Whether the request asks for a `100 Continue` before sending its body
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("Expect")
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    /// Label of the body's Content-Encoding header
    pub fn content_encoding(&self) -> ContentEncoding {
        ContentEncoding::from_header(self.headers.get("Content-Encoding"))
    }

    /// Convert the request head to wire format, followed by the body when
    /// `include_body` is set
    pub fn to_wire(&self, include_body: bool) -> Result<Vec<u8>> {
        let mut buf = Vec::new();

        // Request line
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.target.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        self.headers.write_wire(&mut buf);
        buf.extend_from_slice(CRLF.as_bytes());

        if include_body {
            buf.extend_from_slice(&self.body.to_bytes()?);
        }

        Ok(buf)
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Body,
    credentials: Option<Credentials>,
}

impl RequestBuilder {
    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the request target
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the HTTP version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Stream the body from a file
    pub fn body_file(mut self, path: impl AsRef<Path>) -> Self {
        self.body = Body::File(path.as_ref().to_path_buf());
        self
    }

    /// Credentials used if the server challenges the request
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Build the request
    pub fn build(self) -> Request {
        Request {
            method: self.method.unwrap_or_default(),
            target: self.target.unwrap_or_else(|| "/".to_string()),
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            body: self.body,
            credentials: self.credentials,
        }
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    /// Create a new HTTP response
    pub fn new(status: Status) -> Self {
        Response {
            version: Version::default(),
            status,
            reason: status.reason_phrase().unwrap_or_default().to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Create a builder for constructing responses
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    pub(crate) fn from_parts(version: Version, status: Status, reason: String, headers: Headers) -> Self {
        Response {
            version,
            status,
            reason,
            headers,
            body: Vec::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Reason phrase as received (or the canonical one for built responses)
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub(crate) fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    /// Label of the body's Content-Encoding header
    pub fn content_encoding(&self) -> ContentEncoding {
        ContentEncoding::from_header(self.headers.get("Content-Encoding"))
    }

    /// Whether the connection cannot carry another exchange after this one
    pub fn closes_connection(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return true;
        }
        match self.version {
            Version::Http10 => !self.headers.has_token("Connection", "keep-alive"),
            Version::Http11 => false,
        }
    }

    /// Convert the response to wire format
    ///
    /// Fails with [`Error::InvalidStatus`] when the status code has no
    /// registered reason phrase.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let canonical = self.status.reason_phrase().ok_or_else(|| {
            Error::InvalidStatus(format!("No reason phrase for status {}", self.status.code()))
        })?;
        let reason = if self.reason.is_empty() {
            canonical
        } else {
            self.reason.as_str()
        };

        let mut buf = Vec::new();
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.code().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(reason.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        self.headers.write_wire(&mut buf);
        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(&self.body);

        Ok(buf)
    }
}

/// Builder for HTTP responses
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    version: Option<Version>,
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Response {
        let status = self.status.unwrap_or(Status::OK);
        let reason = self
            .reason
            .unwrap_or_else(|| status.reason_phrase().unwrap_or_default().to_string());
        Response {
            version: self.version.unwrap_or_default(),
            status,
            reason,
            headers: self.headers,
            body: self.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_tokens() {
        assert_eq!(Method::from_token("GET"), Method::Get);
        assert_eq!(Method::from_token("PATCH"), Method::Patch);
        assert_eq!(Method::from_token("PURGE"), Method::Custom("PURGE".to_string()));
        assert_eq!(Method::from_token("PURGE").as_str(), "PURGE");
        // Tokens are case-sensitive
        assert_eq!(Method::from_token("get"), Method::Custom("get".to_string()));
    }

    #[test]
    fn test_version_from_str() {
        assert_eq!(Version::from_str("HTTP/1.0").unwrap(), Version::Http10);
        assert_eq!(Version::from_str("HTTP/1.1").unwrap(), Version::Http11);
        assert!(Version::from_str("HTTP/2.0").is_err());
    }

    #[test]
    fn test_status() {
        let status = Status::new(200).unwrap();
        assert_eq!(status.reason_phrase(), Some("OK"));
        assert!(status.is_success());
        assert!(Status::from_token("404").unwrap().is_client_error());
        assert!(Status::from_token("4x4").is_err());
        assert!(Status::from_token("99").is_err());
        assert!(Status::new(600).is_err());
        assert_eq!(Status::new(299).unwrap().reason_phrase(), None);
        assert!(Status::CONTINUE.forbids_body());
        assert!(Status::NOT_MODIFIED.forbids_body());
        assert!(!Status::OK.forbids_body());
    }

    #[test]
    fn test_content_encoding_labels() {
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::from_header(Some("GZIP")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some("deflate, br")), ContentEncoding::Brotli);
        assert_eq!(
            ContentEncoding::from_header(Some("zstd")),
            ContentEncoding::Other("zstd".to_string())
        );
    }

    #[test]
    fn test_request_builder() {
        let req = Request::builder()
            .method(Method::Post)
            .target("/test")
            .header("Content-Type", "text/plain")
            .body("Hello")
            .credentials("user", "secret")
            .build();

        assert_eq!(req.method(), &Method::Post);
        assert_eq!(req.target(), "/test");
        assert_eq!(req.body(), &Body::Bytes(b"Hello".to_vec()));
        assert_eq!(req.credentials().unwrap().username, "user");
        assert!(!format!("{:?}", req.credentials()).contains("secret"));
    }

    #[test]
    fn test_request_to_wire() {
        let req = Request::builder()
            .method(Method::Put)
            .target("/upload")
            .header("Host", "example.com")
            .header("Content-Length", "3")
            .body("abc")
            .build();

        let head = req.to_wire(false).unwrap();
        assert_eq!(
            head,
            b"PUT /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\n"
        );
        let full = req.to_wire(true).unwrap();
        assert!(full.ends_with(b"\r\n\r\nabc"));
    }

    #[test]
    fn test_request_wire_round_trip() {
        let req = Request::builder()
            .method(Method::Custom("PROPFIND".to_string()))
            .target("/dav/file?x=1")
            .version(Version::Http10)
            .header("Host", "example.com")
            .header("X-Dup", "1")
            .header("x-dup", "2")
            .build();

        let parsed = Request::parse(&req.to_wire(true).unwrap()).unwrap();
        assert_eq!(parsed.method(), req.method());
        assert_eq!(parsed.target(), req.target());
        assert_eq!(parsed.version(), req.version());
        assert_eq!(parsed.headers(), req.headers());
    }

    #[test]
    fn test_file_body() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"from disk").unwrap();

        let req = Request::builder()
            .method(Method::Post)
            .body_file(file.path())
            .build();

        assert_eq!(req.body().len().unwrap(), 9);
        assert!(req.to_wire(true).unwrap().ends_with(b"from disk"));
    }

    #[test]
    fn test_response_to_wire() {
        let resp = Response::builder()
            .status(Status::new(200).unwrap())
            .header("Content-Length", "2")
            .body(b"OK".to_vec())
            .build();

        let wire = resp.to_wire().unwrap();
        assert_eq!(wire, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
    }

    #[test]
    fn test_response_unknown_status_fails_to_format() {
        let resp = Response::new(Status::new(299).unwrap());
        assert!(matches!(resp.to_wire(), Err(Error::InvalidStatus(_))));
    }

    #[test]
    fn test_closes_connection() {
        let mut resp = Response::new(Status::OK);
        assert!(!resp.closes_connection());
        resp.headers_mut().insert("Connection", "close");
        assert!(resp.closes_connection());

        let old = Response::builder().version(Version::Http10).build();
        assert!(old.closes_connection());
        let kept = Response::builder()
            .version(Version::Http10)
            .header("Connection", "Keep-Alive")
            .build();
        assert!(!kept.closes_connection());
    }
}
