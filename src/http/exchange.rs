//! Client exchange orchestration
//!
//! An [`Exchange`] drives one logical request to completion: it sends the
//! request, receives the response and then decides what to do next.
//!
//! - `100 Continue` to a request carrying `Expect: 100-continue` releases
//!   the deferred body.
//! - `401` with a `WWW-Authenticate` challenge is answered once with the
//!   request's credentials (Digest preferred over Basic). This does not
//!   count as a redirect hop.
//! - `301`, `302`, `303`, `307` and `308` are followed on a fresh
//!   connection when redirects are enabled. `301` and `308` move the
//!   exchange's primary origin.
//! - Anything else ends the exchange: `2xx` is success, every other final
//!   status is [`Error::Status`].
//!
//! Cookies from `Set-Cookie` headers are captured into the configured
//! [`CookieJar`] while the response is parsed, and the matching `Cookie`
//! header is generated for every hop.

use super::client::HttpClient;
use super::connection::{self, DEFAULT_TIMEOUT};
use super::tls::TlsConfig;
use super::{
    auth, Body, CookieJar, Error, ErrorKind, Method, ParseEvent, Request, Response, Result, Status,
    DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
};
use std::fmt;
use std::time::Duration;
use url::{Host, Url};

/// Callback run on every redirected request before it is sent
pub type RedirectHook = Box<dyn FnMut(&mut Request, &Origin) -> Result<()> + Send>;

/// Client-side configuration of an [`Exchange`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) follow_redirects: bool,
    pub(crate) max_redirects: usize,
    pub(crate) io_timeout: Option<Duration>,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) user_agent: Option<String>,
    pub(crate) cookie_jar: Option<CookieJar>,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn cookie_jar(&self) -> Option<&CookieJar> {
        self.cookie_jar.as_ref()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::default().build()
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        ClientConfigBuilder {
            config: ClientConfig {
                follow_redirects: true,
                max_redirects: 10,
                io_timeout: Some(DEFAULT_TIMEOUT),
                tls: None,
                user_agent: Some(concat!("h1wire/", env!("CARGO_PKG_VERSION")).to_string()),
                cookie_jar: None,
            },
        }
    }
}

impl ClientConfigBuilder {
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Maximum number of redirect hops per exchange
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// I/O timeout of every connection (`None` waits forever)
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    /// TLS configuration for `https` origins
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// `User-Agent` added to requests that carry none; `None` adds nothing
    pub fn user_agent(mut self, agent: Option<String>) -> Self {
        self.config.user_agent = agent;
        self
    }

    pub fn cookie_jar(mut self, jar: CookieJar) -> Self {
        self.config.cookie_jar = Some(jar);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Scheme, host and port of a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    secure: bool,
    host: String,
    port: u16,
}

impl Origin {
    pub fn new(secure: bool, host: impl Into<String>, port: u16) -> Self {
        Origin {
            secure,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Parse an absolute `http` or `https` URL into its origin and request
    /// target (path plus query)
    pub fn parse(url: &str) -> Result<(Origin, String)> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        Origin::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Result<(Origin, String)> {
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::InvalidUrl(format!("unsupported scheme: {}", other))),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(Error::InvalidUrl(format!("no host in {}", url))),
        };
        let port = url.port().unwrap_or(if secure {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        });

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        Ok((Origin::new(secure, host, port), target))
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Value of the `Host` header; the port is left out when it is the
    /// scheme's default
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default = if self.secure {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        };
        if self.port == default {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Absolute URL of `target` on this origin
    pub fn url(&self, target: &str) -> Result<Url> {
        let raw = format!("{}://{}{}", self.scheme(), self.host_header(), target);
        Url::parse(&raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.host_header())
    }
}

/// Terminal failure of the most recent [`Exchange::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    kind: ErrorKind,
    message: String,
    status: Option<Status>,
}

impl LastError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Final status, for [`ErrorKind::Status`] failures
    pub fn status(&self) -> Option<Status> {
        self.status
    }
}

impl From<&Error> for LastError {
    fn from(err: &Error) -> Self {
        LastError {
            kind: err.kind(),
            message: err.to_string(),
            status: err.response().map(Response::status),
        }
    }
}

/// Redirect, authentication and continue logic around [`HttpClient`]
pub struct Exchange {
    primary: Origin,
    client: Option<HttpClient>,
    config: ClientConfig,
    on_redirect: Option<RedirectHook>,
    last_error: Option<LastError>,
}

impl Exchange {
    /// Create an exchange whose primary origin is taken from `url`.
    ///
    /// No connection is opened until the first request.
    pub fn new(url: &str, config: ClientConfig) -> Result<Self> {
        let (primary, _) = Origin::parse(url)?;
        Ok(Exchange {
            primary,
            client: None,
            config,
            on_redirect: None,
            last_error: None,
        })
    }

    /// Share `jar` for cookie capture and generation
    pub fn with_cookie_jar(mut self, jar: CookieJar) -> Self {
        self.config.cookie_jar = Some(jar);
        self
    }

    /// Install a callback that may rewrite each redirected request, for
    /// example to recompute a signature for the new target
    pub fn on_redirect<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Request, &Origin) -> Result<()> + Send + 'static,
    {
        self.on_redirect = Some(Box::new(hook));
    }

    /// Origin requests are sent to; moved by permanent redirects
    pub fn origin(&self) -> &Origin {
        &self.primary
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Failure of the most recent [`execute`](Exchange::execute), if it failed
    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Close the primary connection
    pub fn close(&mut self) -> Result<()> {
        match self.client.take() {
            Some(mut client) => client.close(),
            None => Ok(()),
        }
    }

    /// Run `request` through to a final response.
    ///
    /// Returns the final `2xx` response, or the error that ended the
    /// exchange. The error is also kept in [`last_error`](Exchange::last_error).
    pub fn execute(&mut self, request: Request) -> Result<Response> {
        self.last_error = None;
        let result = self.run(request);
        if let Err(e) = &result {
            tracing::debug!(origin = %self.primary, error = %e, "exchange failed");
            self.last_error = Some(LastError::from(e));
        }
        result
    }

    fn run(&mut self, mut request: Request) -> Result<Response> {
        let mut origin = self.primary.clone();
        let mut fresh = false;
        let mut hops = 0;

        loop {
            self.prepare(&mut request, &origin)?;

            let mut client = self.checkout(&origin, fresh)?;
            let (response, body_sent) = match self.round_trip(&mut client, &request, &origin) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = client.close();
                    return Err(e);
                }
            };
            self.checkin(client, &origin, &response, body_sent);

            let code = response.status().code();
            tracing::debug!(origin = %origin, target = request.target(), status = code, "response received");

            if code == 401 && self.authorize(&mut request, &response)? {
                fresh = false;
                continue;
            }

            if self.config.follow_redirects && is_redirect(code) {
                hops += 1;
                if hops > self.config.max_redirects {
                    return Err(Error::TooManyRedirects(self.config.max_redirects));
                }
                origin = self.redirect(&mut request, &response, &origin)?;
                if code == 301 || code == 308 {
                    self.primary = origin.clone();
                }
                fresh = true;
                continue;
            }

            return if response.status().is_success() {
                Ok(response)
            } else {
                Err(Error::Status(Box::new(response)))
            };
        }
    }

    /// Add the headers every hop needs: Host, User-Agent, framing and cookies
    fn prepare(&self, request: &mut Request, origin: &Origin) -> Result<()> {
        let body_len = request.body().len()?;
        let headers = request.headers_mut();

        if !headers.exists("Host") {
            headers.set("Host", origin.host_header());
        }
        if let Some(agent) = &self.config.user_agent {
            if !headers.exists("User-Agent") {
                headers.set("User-Agent", agent.as_str());
            }
        }
        if body_len > 0 && !headers.exists("Content-Length") && !headers.exists("Transfer-Encoding")
        {
            headers.set("Content-Length", body_len.to_string());
        }

        if let Some(jar) = &self.config.cookie_jar {
            if !request.headers().exists("Cookie") {
                if let Some(cookies) =
                    jar.cookie_header(origin.host(), request.target(), origin.is_secure())
                {
                    request.headers_mut().set("Cookie", cookies);
                }
            }
        }
        Ok(())
    }

    /// Connection for `origin`: the cached primary one when possible, a new
    /// one after a redirect
    fn checkout(&mut self, origin: &Origin, fresh: bool) -> Result<HttpClient> {
        if *origin == self.primary {
            if let Some(mut client) = self.client.take() {
                if !fresh && client.connection().is_open() {
                    return Ok(client);
                }
                let _ = client.close();
            }
        }

        let mut conn = connection::create(origin.is_secure(), self.config.tls.as_ref())?;
        conn.set_blocking(true, self.config.io_timeout);
        conn.open(origin.host(), origin.port())?;
        tracing::debug!(connection = %conn.description(), "exchange connected");
        Ok(HttpClient::new(conn))
    }

    /// Keep the connection as primary when it can carry another request
    fn checkin(&mut self, mut client: HttpClient, origin: &Origin, response: &Response, body_sent: bool) {
        let reusable = body_sent && !response.closes_connection() && !reads_until_close(response);
        if reusable && *origin == self.primary {
            self.client = Some(client);
        } else {
            let _ = client.close();
        }
    }

    /// Send the request and receive its final response.
    ///
    /// The flag is false when a final status arrived before a deferred body
    /// was released; the connection cannot be reused then.
    fn round_trip(
        &self,
        client: &mut HttpClient,
        request: &Request,
        origin: &Origin,
    ) -> Result<(Response, bool)> {
        let method = request.method();
        let jar = self.config.cookie_jar.clone();
        let host = origin.host();
        let mut observer = |event: ParseEvent<'_>| {
            if let (Some(jar), ParseEvent::Header { name, value }) = (&jar, event) {
                if name.eq_ignore_ascii_case("Set-Cookie") {
                    jar.capture_set_cookie(host, value);
                }
            }
            true
        };

        let mut body_pending = request.expects_continue() && !request.body().is_empty();
        client.send_request(request, !body_pending)?;

        loop {
            let response = client.receive_response_with(method, &mut observer)?;
            let status = response.status();
            if !status.is_informational() || status.code() == 101 {
                return Ok((response, !body_pending));
            }
            if status == Status::CONTINUE && body_pending {
                tracing::trace!(target = request.target(), "sending deferred body");
                client.send_body(request)?;
                body_pending = false;
            }
        }
    }

    /// Attach credentials answering the response's challenges.
    ///
    /// Returns false when the request has no credentials, already carries
    /// an Authorization header or no challenge was offered.
    fn authorize(&self, request: &mut Request, response: &Response) -> Result<bool> {
        if request.headers().exists("Authorization") {
            return Ok(false);
        }
        let credentials = match request.credentials() {
            Some(credentials) => credentials.clone(),
            None => return Ok(false),
        };

        let mut challenges = Vec::new();
        for value in response.headers().get_all("WWW-Authenticate") {
            match auth::parse_challenges(value) {
                Ok(parsed) => challenges.extend(parsed),
                Err(e) => tracing::debug!(error = %e, "ignoring malformed challenge"),
            }
        }
        if challenges.is_empty() {
            return Ok(false);
        }

        let body = request.body().to_bytes()?;
        // An unanswerable challenge leaves the 401 as the final response
        let value = match auth::authorization(
            &challenges,
            &credentials,
            request.method().as_str(),
            request.target(),
            &body,
        ) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "cannot answer challenge");
                return Ok(false);
            }
        };
        tracing::debug!(target = request.target(), "retrying with credentials");
        request.headers_mut().set("Authorization", value);
        Ok(true)
    }

    /// Rewrite `request` for the response's Location and return the origin
    /// it now targets
    fn redirect(&mut self, request: &mut Request, response: &Response, from: &Origin) -> Result<Origin> {
        let code = response.status().code();
        let location = response
            .headers()
            .get("Location")
            .ok_or(Error::MissingLocation(code))?;
        let base = from.url(request.target())?;
        let next = base
            .join(location.trim())
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", location, e)))?;
        let (origin, target) = Origin::from_url(&next)?;

        tracing::debug!(status = code, from = %from, to = %next, "following redirect");

        if switches_to_get(code, request.method()) {
            request.set_method(Method::Get);
            request.set_body(Body::Empty);
            let headers = request.headers_mut();
            for name in ["Content-Length", "Content-Type", "Transfer-Encoding", "Expect"] {
                headers.remove_all(name);
            }
        }

        let headers = request.headers_mut();
        headers.remove_all("Host");
        headers.remove_all("Cookie");
        // Digest answers are bound to the old target; a 401 regenerates them
        if origin.host() != from.host() || request.credentials().is_some() {
            request.headers_mut().remove_all("Authorization");
        }
        request.set_target(target);

        if let Some(hook) = self.on_redirect.as_mut() {
            hook(request, &origin)?;
        }
        Ok(origin)
    }
}

fn is_redirect(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307 | 308)
}

/// 303 always becomes GET (HEAD stays HEAD); 301 and 302 turn other
/// methods into GET; 307 and 308 keep method and body
fn switches_to_get(code: u16, method: &Method) -> bool {
    match code {
        303 => *method != Method::Head,
        301 | 302 => !matches!(method, Method::Get | Method::Head),
        _ => false,
    }
}

/// Whether the body of `response` was delimited by the peer closing
fn reads_until_close(response: &Response) -> bool {
    let headers = response.headers();
    !response.status().forbids_body()
        && !headers.exists("Content-Length")
        && !headers.has_token("Transfer-Encoding", "chunked")
}
