//! HTTP message parsing
//!
//! Incremental parsers for responses and requests. Both accept arbitrary
//! slices of the byte stream: a delivery may end in the middle of a status
//! line, a header, a chunk-size line, chunk data or the CRLF that closes a
//! chunk. Bytes that cannot be consumed yet stay in the parser's backlog and
//! are picked up by the next feed; nothing is discarded.
//!
//! "Need more data" is an ordinary [`ParseStatus::Incomplete`] value, while
//! malformed input is an [`Error`]. Body framing (fixed length, chunked,
//! read-until-close) lives in [`BodyDecoder`], shared by both directions.

use super::chunked::parse_chunk_size;
use super::{
    Error, Headers, Method, Request, Response, Result, Status, Version, MAX_HEADERS,
};
use bytes::{Buf, BytesMut};

/// Upper bound on the trailer section of a chunked body
const MAX_TRAILER_SIZE: usize = 64 * 1024;

/// Find the next CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Outcome of feeding bytes to a parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are needed
    Incomplete,
    /// The message is complete
    Done,
    /// An observer asked the parser to stop
    Stopped,
}

/// Progress notifications delivered to a parse observer
///
/// The observer returns `false` to halt parsing immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseEvent<'a> {
    Status {
        version: Version,
        status: Status,
        reason: &'a str,
    },
    Header {
        name: &'a str,
        value: &'a str,
    },
    HeadersComplete,
    ChunkStart(usize),
    ChunkEnd(usize),
    Complete,
}

/// Callback receiving [`ParseEvent`]s
pub type Observer<'o> = dyn for<'e> FnMut(ParseEvent<'e>) -> bool + 'o;

/// How the end of a message body is found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all (HEAD, 1xx, 204, 304, requests without length)
    Empty,
    /// Content-Length bytes
    Fixed(usize),
    /// Transfer-Encoding: chunked
    Chunked,
    /// Everything until the peer closes the connection
    UntilClose,
}

impl Framing {
    /// Pick the framing announced by a header block.
    ///
    /// Transfer-Encoding: chunked takes priority over Content-Length; without
    /// either, `fallback` applies.
    pub fn from_headers(headers: &Headers, fallback: Framing) -> Result<Framing> {
        if headers.has_token("Transfer-Encoding", "chunked") {
            if headers.exists("Content-Length") {
                tracing::debug!("both Transfer-Encoding and Content-Length present, using chunked");
            }
            return Ok(Framing::Chunked);
        }

        let lengths = headers.get_all("Content-Length");
        if let Some(first) = lengths.first() {
            let length = parse_content_length(first)?;
            for other in &lengths[1..] {
                if parse_content_length(other)? != length {
                    return Err(Error::Parse(format!(
                        "Conflicting Content-Length values: {} and {}",
                        first, other
                    )));
                }
            }
            return Ok(Framing::Fixed(length));
        }

        Ok(fallback)
    }
}

fn parse_content_length(value: &str) -> Result<usize> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Parse(format!("Invalid Content-Length: {}", value)));
    }
    value
        .parse::<usize>()
        .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", value)))
}

/// Progress of a body decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyProgress {
    NeedMore,
    Complete,
    Stopped,
}

/// Incremental body decoder
///
/// For chunked bodies `chunk_remaining` counts the data bytes still due for
/// the chunk in progress. Once the data is in, the counter goes to zero and
/// then negative: `-n` means `n` bytes of the CRLF closing the chunk have
/// already been consumed, so a CRLF split across two deliveries resumes at
/// the right byte.
///
/// After the last chunk the decoder stays in the trailer section until its
/// blank line has arrived.
#[derive(Debug)]
pub(crate) struct BodyDecoder {
    framing: Framing,
    received: usize,
    chunk_active: bool,
    chunk_remaining: isize,
    chunk: Vec<u8>,
    in_trailers: bool,
    trailer_bytes: usize,
    done: bool,
}

impl BodyDecoder {
    pub(crate) fn new(framing: Framing) -> Self {
        BodyDecoder {
            framing,
            received: 0,
            chunk_active: false,
            chunk_remaining: 0,
            chunk: Vec::new(),
            in_trailers: false,
            trailer_bytes: 0,
            done: false,
        }
    }

    pub(crate) fn chunked() -> Self {
        Self::new(Framing::Chunked)
    }

    pub(crate) fn framing(&self) -> Framing {
        self.framing
    }

    /// Move decodable bytes from `backlog` into `content`.
    pub(crate) fn decode(
        &mut self,
        backlog: &mut BytesMut,
        content: &mut Vec<u8>,
        observer: &mut Observer<'_>,
    ) -> Result<BodyProgress> {
        if self.done {
            return Ok(BodyProgress::Complete);
        }

        match self.framing {
            Framing::Empty => {
                self.done = true;
                Ok(BodyProgress::Complete)
            }
            Framing::Fixed(length) => {
                // Never take more than the declared length; the rest belongs
                // to whatever follows on the connection.
                let take = (length - self.received).min(backlog.len());
                content.extend_from_slice(&backlog[..take]);
                backlog.advance(take);
                self.received += take;

                if self.received == length {
                    self.done = true;
                    Ok(BodyProgress::Complete)
                } else {
                    Ok(BodyProgress::NeedMore)
                }
            }
            Framing::UntilClose => {
                content.extend_from_slice(backlog);
                self.received += backlog.len();
                backlog.clear();
                Ok(BodyProgress::NeedMore)
            }
            Framing::Chunked => self.decode_chunked(backlog, content, observer),
        }
    }

    fn decode_chunked(
        &mut self,
        backlog: &mut BytesMut,
        content: &mut Vec<u8>,
        observer: &mut Observer<'_>,
    ) -> Result<BodyProgress> {
        loop {
            if self.in_trailers {
                return self.skip_trailers(backlog);
            }

            if !self.chunk_active {
                let Some(pos) = find_crlf(backlog) else {
                    return Ok(BodyProgress::NeedMore);
                };
                let size = parse_chunk_size(&backlog[..pos])?;
                backlog.advance(pos + 2);

                if size == 0 {
                    self.in_trailers = true;
                    continue;
                }

                self.chunk_active = true;
                self.chunk_remaining = size as isize;
                self.chunk.clear();
                self.chunk.reserve(size.min(64 * 1024));

                if !observer(ParseEvent::ChunkStart(size)) {
                    return Ok(BodyProgress::Stopped);
                }
            }

            if self.chunk_remaining > 0 {
                let due = self.chunk_remaining as usize;
                if backlog.len() < due {
                    self.chunk.extend_from_slice(backlog);
                    self.chunk_remaining -= backlog.len() as isize;
                    backlog.clear();
                    return Ok(BodyProgress::NeedMore);
                }
                self.chunk.extend_from_slice(&backlog[..due]);
                backlog.advance(due);
                self.chunk_remaining = 0;
            }

            while self.chunk_remaining > -2 {
                let Some(&byte) = backlog.first() else {
                    return Ok(BodyProgress::NeedMore);
                };
                let expected = if self.chunk_remaining == 0 { b'\r' } else { b'\n' };
                if byte != expected {
                    return Err(Error::Protocol("Expected CRLF after chunk data".to_string()));
                }
                backlog.advance(1);
                self.chunk_remaining -= 1;
            }

            let size = self.chunk.len();
            content.append(&mut self.chunk);
            self.received += size;
            self.chunk_active = false;
            self.chunk_remaining = 0;

            if !observer(ParseEvent::ChunkEnd(size)) {
                return Ok(BodyProgress::Stopped);
            }
        }
    }

    /// The peer closed the connection.
    pub(crate) fn finish(&mut self) -> Result<BodyProgress> {
        match self.framing {
            Framing::UntilClose => {
                self.done = true;
                Ok(BodyProgress::Complete)
            }
            _ if self.done => Ok(BodyProgress::Complete),
            _ => Err(Error::ConnectionClosed),
        }
    }
}

impl BodyDecoder {
    /// Consume trailer lines up to and including the blank line ending the
    /// chunked body
    fn skip_trailers(&mut self, backlog: &mut BytesMut) -> Result<BodyProgress> {
        while let Some(pos) = find_crlf(backlog) {
            backlog.advance(pos + 2);
            if pos == 0 {
                self.in_trailers = false;
                self.done = true;
                return Ok(BodyProgress::Complete);
            }
            self.trailer_bytes += pos + 2;
            if self.trailer_bytes > MAX_TRAILER_SIZE {
                return Err(Error::Protocol("Trailer section too large".to_string()));
            }
        }
        if self.trailer_bytes + backlog.len() > MAX_TRAILER_SIZE {
            return Err(Error::Protocol("Trailer section too large".to_string()));
        }
        Ok(BodyProgress::NeedMore)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StartLine,
    Headers,
    Body,
    Done,
}

/// Pull the next complete line out of the backlog
fn take_line(backlog: &mut BytesMut) -> Option<String> {
    let pos = find_crlf(backlog)?;
    let line = String::from_utf8_lossy(&backlog[..pos]).into_owned();
    backlog.advance(pos + 2);
    Some(line)
}

/// Skip empty lines in front of a start line
fn skip_leading_crlf(backlog: &mut BytesMut) {
    while backlog.starts_with(b"\r\n") {
        backlog.advance(2);
    }
}

/// Parse HTTP response status line
///
/// Format: VERSION SP STATUS [SP REASON]
/// Example: HTTP/1.1 200 OK
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!("Invalid status line: {:?}", line)));
    }

    let version = Version::from_str(parts[0])?;
    let status = Status::from_token(parts[1])?;
    let reason = parts.get(2).map(|r| r.trim().to_string()).unwrap_or_default();

    Ok((version, status, reason))
}

/// Parse HTTP request line
///
/// Format: METHOD SP TARGET SP VERSION
/// Example: GET /index.html HTTP/1.1
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split(' ').collect();

    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Parse(format!("Invalid request line: {:?}", line)));
    }

    let method = Method::from_token(parts[0]);
    let version = Version::from_str(parts[2])?;

    Ok((method, parts[1].to_string(), version))
}

/// HTTP response parser
///
/// One instance reconstructs one response:
///
/// ```
/// use h1wire::http::{ParseStatus, ResponseParser};
///
/// let mut parser = ResponseParser::new();
/// assert_eq!(parser.feed(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap(), ParseStatus::Incomplete);
/// assert_eq!(parser.feed(b"ngth: 2\r\n\r\nhi").unwrap(), ParseStatus::Done);
/// assert_eq!(parser.into_response().unwrap().body(), b"hi");
/// ```
#[derive(Debug)]
pub struct ResponseParser {
    backlog: BytesMut,
    phase: Phase,
    head_request: bool,
    response: Option<Response>,
    headers: Headers,
    body: Option<BodyDecoder>,
    force_stop: bool,
}

impl ResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        ResponseParser {
            backlog: BytesMut::with_capacity(8192),
            phase: Phase::StartLine,
            head_request: false,
            response: None,
            headers: Headers::new(),
            body: None,
            force_stop: false,
        }
    }

    /// Parser for the response to a request sent with `method`
    ///
    /// Responses to HEAD finish right after the header block whatever the
    /// framing headers say.
    pub fn for_method(method: &Method) -> Self {
        let mut parser = Self::new();
        parser.head_request = *method == Method::Head;
        parser
    }

    /// Feed data to the parser
    pub fn feed(&mut self, data: &[u8]) -> Result<ParseStatus> {
        self.feed_with(data, &mut |_| true)
    }

    /// Feed data to the parser, reporting progress to `observer`
    pub fn feed_with(&mut self, data: &[u8], observer: &mut Observer<'_>) -> Result<ParseStatus> {
        self.backlog.extend_from_slice(data);
        self.resume(observer)
    }

    fn resume(&mut self, observer: &mut Observer<'_>) -> Result<ParseStatus> {
        loop {
            if self.force_stop {
                return Ok(ParseStatus::Stopped);
            }

            match self.phase {
                Phase::StartLine => {
                    skip_leading_crlf(&mut self.backlog);
                    let Some(line) = take_line(&mut self.backlog) else {
                        return Ok(ParseStatus::Incomplete);
                    };

                    let (version, status, reason) = parse_status_line(&line)?;
                    tracing::trace!(%status, "status line parsed");
                    self.phase = Phase::Headers;

                    let keep_going = observer(ParseEvent::Status {
                        version,
                        status,
                        reason: &reason,
                    });
                    self.response = Some(Response::from_parts(version, status, reason, Headers::new()));
                    self.stop_unless(keep_going);
                }
                Phase::Headers => {
                    let Some(line) = take_line(&mut self.backlog) else {
                        return Ok(ParseStatus::Incomplete);
                    };

                    if line.is_empty() {
                        let framing = self.select_framing()?;
                        tracing::trace!(?framing, "header block complete");
                        self.body = Some(BodyDecoder::new(framing));
                        self.phase = Phase::Body;
                        let keep_going = observer(ParseEvent::HeadersComplete);
                        self.stop_unless(keep_going);
                        continue;
                    }

                    if self.headers.len() >= MAX_HEADERS {
                        return Err(Error::Protocol(format!(
                            "More than {} header lines",
                            MAX_HEADERS
                        )));
                    }
                    let (name, value) = Headers::parse_header_line(&line)?;
                    let keep_going = observer(ParseEvent::Header {
                        name: &name,
                        value: &value,
                    });
                    self.headers.insert(name, value);
                    self.stop_unless(keep_going);
                }
                Phase::Body => {
                    let (Some(body), Some(response)) = (self.body.as_mut(), self.response.as_mut())
                    else {
                        return Err(Error::Protocol("Body phase without a status line".to_string()));
                    };

                    match body.decode(&mut self.backlog, response.body_mut(), observer)? {
                        BodyProgress::NeedMore => return Ok(ParseStatus::Incomplete),
                        BodyProgress::Stopped => {
                            self.force_stop = true;
                            return Ok(ParseStatus::Stopped);
                        }
                        BodyProgress::Complete => return Ok(self.complete(observer)),
                    }
                }
                Phase::Done => return Ok(ParseStatus::Done),
            }
        }
    }

    fn stop_unless(&mut self, keep_going: bool) {
        if !keep_going {
            self.force_stop = true;
        }
    }

    fn select_framing(&self) -> Result<Framing> {
        let bodyless = self
            .response
            .as_ref()
            .map(|r| r.status().forbids_body())
            .unwrap_or(false);

        if self.head_request || bodyless {
            return Ok(Framing::Empty);
        }
        Framing::from_headers(&self.headers, Framing::UntilClose)
    }

    fn complete(&mut self, observer: &mut Observer<'_>) -> ParseStatus {
        self.phase = Phase::Done;
        if let Some(response) = self.response.as_mut() {
            *response.headers_mut() = std::mem::take(&mut self.headers);
        }
        if !observer(ParseEvent::Complete) {
            self.force_stop = true;
        }
        ParseStatus::Done
    }

    /// The driving read loop observed end-of-stream.
    ///
    /// Completes a read-until-close body; for any other framing, or before
    /// the header block is complete, the stream ended too early.
    pub fn finish(&mut self) -> Result<ParseStatus> {
        self.finish_with(&mut |_| true)
    }

    pub fn finish_with(&mut self, observer: &mut Observer<'_>) -> Result<ParseStatus> {
        match self.phase {
            Phase::Done => Ok(ParseStatus::Done),
            Phase::Body => match self.body.as_mut() {
                Some(body) => {
                    body.finish()?;
                    Ok(self.complete(observer))
                }
                None => Err(Error::ConnectionClosed),
            },
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Whether the full response has been parsed
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Whether an observer halted parsing
    pub fn is_stopped(&self) -> bool {
        self.force_stop
    }

    /// Whether the header block has been fully parsed
    pub fn headers_complete(&self) -> bool {
        matches!(self.phase, Phase::Body | Phase::Done)
    }

    /// Body framing chosen for this response, once headers are complete
    pub fn framing(&self) -> Option<Framing> {
        self.body.as_ref().map(|b| b.framing())
    }

    /// Status parsed so far
    pub fn status(&self) -> Option<Status> {
        self.response.as_ref().map(|r| r.status())
    }

    /// Headers parsed so far
    pub fn headers(&self) -> &Headers {
        match (&self.response, self.phase) {
            (Some(response), Phase::Done) => response.headers(),
            _ => &self.headers,
        }
    }

    /// Body bytes reconstructed so far
    pub fn content(&self) -> &[u8] {
        self.response.as_ref().map(|r| r.body()).unwrap_or_default()
    }

    /// Bytes received but not consumed
    pub fn backlog(&self) -> &[u8] {
        &self.backlog
    }

    /// Take the unconsumed bytes, e.g. the start of the next response on a
    /// connection after an interim `100 Continue`
    pub fn take_backlog(&mut self) -> BytesMut {
        std::mem::take(&mut self.backlog)
    }

    /// Extract the completed response
    pub fn into_response(self) -> Result<Response> {
        match (self.phase, self.response) {
            (Phase::Done, Some(response)) => Ok(response),
            _ => Err(Error::Incomplete),
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request parser
///
/// Requests without Content-Length or chunked Transfer-Encoding have no body.
#[derive(Debug)]
pub struct RequestParser {
    backlog: BytesMut,
    phase: Phase,
    start: Option<(Method, String, Version)>,
    headers: Headers,
    body: Option<BodyDecoder>,
    content: Vec<u8>,
}

impl RequestParser {
    /// Create a new request parser
    pub fn new() -> Self {
        RequestParser {
            backlog: BytesMut::with_capacity(8192),
            phase: Phase::StartLine,
            start: None,
            headers: Headers::new(),
            body: None,
            content: Vec::new(),
        }
    }

    /// Start a parser with bytes left over from a previous message
    pub fn with_backlog(backlog: BytesMut) -> Self {
        let mut parser = Self::new();
        parser.backlog = backlog;
        parser
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(request)) when a complete request is parsed,
    /// Ok(None) if more data is needed, or Err on parse error.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Request>> {
        self.backlog.extend_from_slice(data);

        loop {
            match self.phase {
                Phase::StartLine => {
                    skip_leading_crlf(&mut self.backlog);
                    let Some(line) = take_line(&mut self.backlog) else {
                        return Ok(None);
                    };
                    self.start = Some(parse_request_line(&line)?);
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let Some(line) = take_line(&mut self.backlog) else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        let framing = Framing::from_headers(&self.headers, Framing::Empty)?;
                        self.body = Some(BodyDecoder::new(framing));
                        self.phase = Phase::Body;
                        continue;
                    }
                    if self.headers.len() >= MAX_HEADERS {
                        return Err(Error::Protocol(format!(
                            "More than {} header lines",
                            MAX_HEADERS
                        )));
                    }
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                Phase::Body => {
                    let Some(body) = self.body.as_mut() else {
                        return Err(Error::Protocol("Body phase without headers".to_string()));
                    };
                    match body.decode(&mut self.backlog, &mut self.content, &mut |_| true)? {
                        BodyProgress::Complete => {
                            self.phase = Phase::Done;
                            return Ok(Some(self.build()?));
                        }
                        _ => return Ok(None),
                    }
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    fn build(&mut self) -> Result<Request> {
        let (method, target, version) = self
            .start
            .take()
            .ok_or_else(|| Error::Protocol("Request without request line".to_string()))?;

        let mut request = Request::new(method, target);
        request.set_version(version);
        *request.headers_mut() = std::mem::take(&mut self.headers);
        request.set_body(std::mem::take(&mut self.content));
        Ok(request)
    }

    /// Take the unconsumed bytes (pipelined follow-up requests)
    pub fn take_backlog(&mut self) -> BytesMut {
        std::mem::take(&mut self.backlog)
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}
