//! HTTP authentication (Basic and Digest)
//!
//! Parses `WWW-Authenticate` challenges and computes the matching
//! `Authorization` value. Digest supports MD5 and MD5-sess with qop
//! `auth`, `auth-int` or none.

use super::message::Credentials;
use super::{Error, Result};
use openssl::hash::{hash, MessageDigest};
use std::fmt::Write as _;

/// Nonce count sent with the first (and only) use of a server nonce
pub const INITIAL_NONCE_COUNT: u32 = 1;

/// One authentication challenge: a scheme and its parameters, or a
/// token68 blob for schemes such as `Negotiate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    token68: Option<String>,
    params: Vec<(String, String)>,
}

impl Challenge {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Look up a parameter (case-insensitive name)
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    pub fn token68(&self) -> Option<&str> {
        self.token68.as_deref()
    }

    fn is(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_token68_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-._~+/".contains(&b)
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b',')) {
            self.pos += 1;
        }
    }

    fn token(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(is_token_char) {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    /// Consume a token68 (`YII==`) if one starts here.
    ///
    /// A run that turns out to be `name=value` or `name = value` is left for
    /// the parameter parser.
    fn token68(&mut self) -> Option<&'a str> {
        let bytes = self.input.as_bytes();
        let start = self.pos;
        let mut end = start;
        while bytes.get(end).copied().is_some_and(is_token68_char) {
            end += 1;
        }
        if end == start {
            return None;
        }
        let body_end = end;
        while bytes.get(end) == Some(&b'=') {
            end += 1;
        }
        if !matches!(bytes.get(end), None | Some(b',' | b' ' | b'\t')) {
            return None;
        }
        if end == body_end {
            let mut ahead = end;
            while matches!(bytes.get(ahead), Some(b' ' | b'\t')) {
                ahead += 1;
            }
            if bytes.get(ahead) == Some(&b'=') {
                return None;
            }
        }
        self.pos = end;
        Some(&self.input[start..end])
    }

    fn quoted(&mut self) -> Result<String> {
        // Opening quote
        self.pos += 1;
        let mut value = String::new();
        let input = self.input;
        let mut chars = input[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    self.pos += offset + 1;
                    return Ok(value);
                }
                _ => value.push(c),
            }
        }
        Err(Error::Auth("unterminated quoted string in challenge".to_string()))
    }
}

/// Parse one `WWW-Authenticate` header value into its challenges.
///
/// ```
/// use h1wire::http::auth::parse_challenges;
///
/// let challenges = parse_challenges(r#"Basic realm="a", Digest realm="b", nonce="n""#).unwrap();
/// assert_eq!(challenges.len(), 2);
/// assert_eq!(challenges[1].param("nonce"), Some("n"));
/// ```
pub fn parse_challenges(input: &str) -> Result<Vec<Challenge>> {
    let mut cursor = Cursor { input, pos: 0 };
    let mut challenges: Vec<Challenge> = Vec::new();

    loop {
        cursor.skip_separators();
        if cursor.peek().is_none() {
            break;
        }

        let token = cursor.token();
        if token.is_empty() {
            return Err(Error::Auth(format!("unexpected character in challenge: {}", input)));
        }

        let mark = cursor.pos;
        cursor.skip_ws();
        if cursor.peek() != Some(b'=') {
            let token68 = cursor.token68().map(str::to_string);
            if token68.is_none() {
                cursor.pos = mark;
            }
            challenges.push(Challenge {
                scheme: token.to_string(),
                token68,
                params: Vec::new(),
            });
            continue;
        }

        // token '=' value: a parameter of the current challenge
        cursor.pos += 1;
        cursor.skip_ws();
        let value = if cursor.peek() == Some(b'"') {
            cursor.quoted()?
        } else {
            cursor.token().to_string()
        };
        let current = challenges
            .last_mut()
            .ok_or_else(|| Error::Auth(format!("parameter before scheme: {}", input)))?;
        current.params.push((token.to_string(), value));
    }

    if challenges.is_empty() {
        return Err(Error::Auth("empty challenge".to_string()));
    }
    Ok(challenges)
}

fn md5_hex(data: &[u8]) -> Result<String> {
    let digest = hash(MessageDigest::md5(), data)
        .map_err(|e| Error::Auth(format!("MD5 unavailable: {}", e)))?;
    let mut out = String::with_capacity(32);
    for b in digest.iter() {
        let _ = write!(out, "{:02x}", b);
    }
    Ok(out)
}

/// Fresh client nonce: 8 random bytes, hex encoded
pub fn generate_cnonce() -> Result<String> {
    let mut bytes = [0u8; 8];
    openssl::rand::rand_bytes(&mut bytes)
        .map_err(|e| Error::Auth(format!("no randomness for cnonce: {}", e)))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// `Basic` credentials value
pub fn basic_authorization(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.username, credentials.password);
    format!("Basic {}", openssl::base64::encode_block(raw.as_bytes()))
}

/// Quality of protection chosen for a Digest response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }

    /// Pick from a challenge's `qop` list, preferring `auth`
    fn choose(offered: Option<&str>) -> Result<Option<Qop>> {
        let Some(offered) = offered else {
            return Ok(None);
        };
        let options: Vec<&str> = offered.split(',').map(str::trim).collect();
        if options.iter().any(|o| o.eq_ignore_ascii_case("auth")) {
            Ok(Some(Qop::Auth))
        } else if options.iter().any(|o| o.eq_ignore_ascii_case("auth-int")) {
            Ok(Some(Qop::AuthInt))
        } else {
            Err(Error::Auth(format!("unsupported qop: {}", offered)))
        }
    }
}

/// Everything a Digest response hash depends on
#[derive(Debug, Clone)]
pub struct DigestInput<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub qop: Option<Qop>,
    pub nc: u32,
    pub cnonce: &'a str,
    pub session: bool,
    pub body: &'a [u8],
}

/// Compute the Digest `response` value (RFC 2617 section 3.2.2.1)
pub fn digest_response(input: &DigestInput<'_>) -> Result<String> {
    let mut ha1 = md5_hex(format!("{}:{}:{}", input.username, input.realm, input.password).as_bytes())?;
    if input.session {
        ha1 = md5_hex(format!("{}:{}:{}", ha1, input.nonce, input.cnonce).as_bytes())?;
    }

    let ha2 = match input.qop {
        Some(Qop::AuthInt) => {
            let body_hash = md5_hex(input.body)?;
            md5_hex(format!("{}:{}:{}", input.method, input.uri, body_hash).as_bytes())?
        }
        _ => md5_hex(format!("{}:{}", input.method, input.uri).as_bytes())?,
    };

    match input.qop {
        Some(qop) => md5_hex(
            format!(
                "{}:{}:{:08x}:{}:{}:{}",
                ha1,
                input.nonce,
                input.nc,
                input.cnonce,
                qop.as_str(),
                ha2
            )
            .as_bytes(),
        ),
        None => md5_hex(format!("{}:{}:{}", ha1, input.nonce, ha2).as_bytes()),
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Answer a Digest challenge with the given client nonce
pub fn digest_authorization_with_cnonce(
    challenge: &Challenge,
    credentials: &Credentials,
    method: &str,
    uri: &str,
    body: &[u8],
    cnonce: &str,
) -> Result<String> {
    let realm = challenge.realm().unwrap_or_default();
    let nonce = challenge
        .param("nonce")
        .ok_or_else(|| Error::Auth("Digest challenge without nonce".to_string()))?;
    let algorithm = challenge.param("algorithm").unwrap_or("MD5");
    let session = if algorithm.eq_ignore_ascii_case("MD5") {
        false
    } else if algorithm.eq_ignore_ascii_case("MD5-sess") {
        true
    } else {
        return Err(Error::Auth(format!("unsupported Digest algorithm: {}", algorithm)));
    };
    let qop = Qop::choose(challenge.param("qop"))?;

    let response = digest_response(&DigestInput {
        username: &credentials.username,
        password: &credentials.password,
        realm,
        nonce,
        method,
        uri,
        qop,
        nc: INITIAL_NONCE_COUNT,
        cnonce,
        session,
        body,
    })?;

    let mut value = format!(
        "Digest username={}, realm={}, nonce={}, uri={}",
        quote(&credentials.username),
        quote(realm),
        quote(nonce),
        quote(uri)
    );
    if challenge.param("algorithm").is_some() {
        let _ = write!(value, ", algorithm={}", algorithm);
    }
    if let Some(qop) = qop {
        let _ = write!(
            value,
            ", qop={}, nc={:08x}, cnonce={}",
            qop.as_str(),
            INITIAL_NONCE_COUNT,
            quote(cnonce)
        );
    }
    let _ = write!(value, ", response={}", quote(&response));
    if let Some(opaque) = challenge.param("opaque") {
        let _ = write!(value, ", opaque={}", quote(opaque));
    }
    Ok(value)
}

/// Answer a Digest challenge with a freshly generated client nonce
pub fn digest_authorization(
    challenge: &Challenge,
    credentials: &Credentials,
    method: &str,
    uri: &str,
    body: &[u8],
) -> Result<String> {
    let cnonce = generate_cnonce()?;
    digest_authorization_with_cnonce(challenge, credentials, method, uri, body, &cnonce)
}

/// Build an `Authorization` value for the best challenge offered.
///
/// Digest is preferred over Basic. Fails when no offered scheme is
/// supported.
pub fn authorization(
    challenges: &[Challenge],
    credentials: &Credentials,
    method: &str,
    uri: &str,
    body: &[u8],
) -> Result<String> {
    let basic = challenges.iter().any(|c| c.is("Basic"));
    if let Some(digest) = challenges.iter().find(|c| c.is("Digest")) {
        match digest_authorization(digest, credentials, method, uri, body) {
            Err(e) if basic => {
                tracing::debug!(error = %e, "digest challenge unusable, falling back to basic");
            }
            answer => return answer,
        }
    }
    if basic {
        return Ok(basic_authorization(credentials));
    }

    let offered: Vec<&str> = challenges.iter().map(Challenge::scheme).collect();
    Err(Error::Auth(format!("no supported scheme in {:?}", offered)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC2617_CHALLENGE: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    fn mufasa() -> Credentials {
        Credentials::new("Mufasa", "Circle Of Life")
    }

    #[test]
    fn test_rfc2617_vector() {
        let response = digest_response(&DigestInput {
            username: "Mufasa",
            password: "Circle Of Life",
            realm: "testrealm@host.com",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            method: "GET",
            uri: "/dir/index.html",
            qop: Some(Qop::Auth),
            nc: 1,
            cnonce: "0a4f113b",
            session: false,
            body: b"",
        })
        .unwrap();
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_digest_header() {
        let challenges = parse_challenges(RFC2617_CHALLENGE).unwrap();
        let value = digest_authorization_with_cnonce(
            &challenges[0],
            &mufasa(),
            "GET",
            "/dir/index.html",
            b"",
            "0a4f113b",
        )
        .unwrap();

        assert!(value.starts_with("Digest username=\"Mufasa\""));
        assert!(value.contains("qop=auth, nc=00000001, cnonce=\"0a4f113b\""));
        assert!(value.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(value.ends_with("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_digest_without_qop() {
        let challenges = parse_challenges(r#"Digest realm="r", nonce="n""#).unwrap();
        let value = digest_authorization(&challenges[0], &mufasa(), "GET", "/", b"").unwrap();
        assert!(!value.contains("qop="));
        assert!(!value.contains("cnonce="));

        let expected = digest_response(&DigestInput {
            username: "Mufasa",
            password: "Circle Of Life",
            realm: "r",
            nonce: "n",
            method: "GET",
            uri: "/",
            qop: None,
            nc: 1,
            cnonce: "",
            session: false,
            body: b"",
        })
        .unwrap();
        assert!(value.contains(&format!("response=\"{}\"", expected)));
    }

    #[test]
    fn test_digest_variants_differ() {
        let base = DigestInput {
            username: "u",
            password: "p",
            realm: "r",
            nonce: "n",
            method: "POST",
            uri: "/submit",
            qop: Some(Qop::Auth),
            nc: 1,
            cnonce: "c",
            session: false,
            body: b"payload",
        };
        let plain = digest_response(&base).unwrap();
        let sess = digest_response(&DigestInput { session: true, ..base.clone() }).unwrap();
        let int = digest_response(&DigestInput { qop: Some(Qop::AuthInt), ..base.clone() }).unwrap();
        let int_other_body = digest_response(&DigestInput {
            qop: Some(Qop::AuthInt),
            body: b"other",
            ..base
        })
        .unwrap();

        assert_ne!(plain, sess);
        assert_ne!(plain, int);
        assert_ne!(int, int_other_body);
    }

    #[test]
    fn test_unsupported_digest() {
        let challenges = parse_challenges(r#"Digest realm="r", nonce="n", algorithm=SHA-256"#).unwrap();
        assert!(digest_authorization(&challenges[0], &mufasa(), "GET", "/", b"").is_err());

        let challenges = parse_challenges(r#"Digest realm="r", qop="auth-conf""#).unwrap();
        assert!(digest_authorization(&challenges[0], &mufasa(), "GET", "/", b"").is_err());
    }

    #[test]
    fn test_basic() {
        let credentials = Credentials::new("Aladdin", "open sesame");
        assert_eq!(
            basic_authorization(&credentials),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn test_parse_multiple_challenges() {
        let challenges =
            parse_challenges(r#"Newauth realm="apps", type=1, title="Login to \"apps\"", Basic realm="simple""#)
                .unwrap();
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme(), "Newauth");
        assert_eq!(challenges[0].param("TYPE"), Some("1"));
        assert_eq!(challenges[0].param("title"), Some("Login to \"apps\""));
        assert_eq!(challenges[1].scheme(), "Basic");
        assert_eq!(challenges[1].realm(), Some("simple"));
    }

    #[test]
    fn test_parse_token68() {
        let challenges = parse_challenges(r#"Negotiate YII==, Basic realm="simple""#).unwrap();
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme(), "Negotiate");
        assert_eq!(challenges[0].token68(), Some("YII=="));
        assert_eq!(challenges[1].realm(), Some("simple"));

        let challenges = parse_challenges("Negotiate abc/+9=").unwrap();
        assert_eq!(challenges[0].token68(), Some("abc/+9="));

        // Spaced parameters are still parameters
        let challenges = parse_challenges(r#"Basic realm = "spaced""#).unwrap();
        assert_eq!(challenges[0].token68(), None);
        assert_eq!(challenges[0].realm(), Some("spaced"));

        let value = authorization(
            &parse_challenges(r#"Negotiate YII==, Basic realm="b""#).unwrap(),
            &mufasa(),
            "GET",
            "/",
            b"",
        )
        .unwrap();
        assert!(value.starts_with("Basic "));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_challenges("").is_err());
        assert!(parse_challenges(r#"realm="x""#).is_err());
        assert!(parse_challenges(r#"Digest realm="unterminated"#).is_err());
    }

    #[test]
    fn test_prefers_digest() {
        let challenges =
            parse_challenges(r#"Basic realm="b", Digest realm="d", nonce="abc", qop="auth""#).unwrap();
        let value = authorization(&challenges, &mufasa(), "GET", "/", b"").unwrap();
        assert!(value.starts_with("Digest "));

        let challenges = parse_challenges(r#"Basic realm="b""#).unwrap();
        let value = authorization(&challenges, &mufasa(), "GET", "/", b"").unwrap();
        assert!(value.starts_with("Basic "));

        let challenges = parse_challenges("Bearer").unwrap();
        assert!(authorization(&challenges, &mufasa(), "GET", "/", b"").is_err());

        let challenges =
            parse_challenges(r#"Digest realm="d", nonce="n", algorithm=SHA-256, Basic realm="b""#)
                .unwrap();
        let value = authorization(&challenges, &mufasa(), "GET", "/", b"").unwrap();
        assert!(value.starts_with("Basic "));
    }

    #[test]
    fn test_cnonce_random() {
        let a = generate_cnonce().unwrap();
        let b = generate_cnonce().unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
