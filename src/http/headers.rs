//! HTTP headers handling
//!
//! This module provides a type for managing HTTP headers with case-insensitive
//! lookups and support for multiple values per header name.

use super::{Error, Result, CRLF, MAX_HEADERS};
use std::fmt;

/// HTTP headers collection
///
/// Headers are stored in insertion order and support:
/// - Case-insensitive header name lookups
/// - Duplicate names (several `Set-Cookie` lines, for instance)
/// - Serialization back to wire format in the original order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Append a header
    ///
    /// Existing entries with the same name are kept. Returns `false` when the
    /// collection is already at [`MAX_HEADERS`] and the header was dropped.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        if self.headers.len() >= MAX_HEADERS {
            return false;
        }
        self.headers.push((name.into(), value.into()));
        true
    }

    /// Replace every value of `name` with a single one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove_all(&name);
        self.insert(name, value);
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a header exists
    pub fn exists(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Whether a comma-separated header carries `token` (case-insensitive)
    ///
    /// `Connection: keep-alive, Upgrade` contains both `keep-alive` and
    /// `upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Remove all instances of a header (case-insensitive)
    pub fn remove_all(&mut self, name: &str) -> usize {
        let initial_len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.headers.len()
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Clear all headers
    pub fn clear(&mut self) {
        self.headers.clear();
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Append every header as `Name: value\r\n`
    pub fn write_wire(&self, buf: &mut Vec<u8>) {
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }
    }

    /// Parse a header line into name and value
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        if let Some(colon_pos) = line.find(':') {
            let raw_name = &line[..colon_pos];
            let value = line[colon_pos + 1..].trim().to_string();

            if raw_name.is_empty() || raw_name.trim() != raw_name {
                return Err(Error::InvalidHeader(format!("Bad header name: {:?}", raw_name)));
            }

            Ok((raw_name.to_string(), value))
        } else {
            Err(Error::InvalidHeader(format!("No colon in header: {}", line)))
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");
        headers.insert("Content-Length", "42");

        assert_eq!(headers.get("Content-Type"), Some("text/html"));
        assert_eq!(headers.get("content-length"), Some("42"));
        assert_eq!(headers.get("Missing"), None);
    }

    #[test]
    fn test_duplicates_keep_order() {
        let mut headers = Headers::new();
        headers.insert("Set-Cookie", "a=1");
        headers.insert("X-Other", "x");
        headers.insert("set-cookie", "b=2");

        assert_eq!(headers.get_all("SET-COOKIE"), vec!["a=1", "b=2"]);
        assert_eq!(headers.get("Set-Cookie"), Some("a=1"));
    }

    #[test]
    fn test_set_replaces_all() {
        let mut headers = Headers::new();
        headers.insert("Host", "a.example");
        headers.insert("host", "b.example");
        headers.set("Host", "c.example");

        assert_eq!(headers.get_all("host"), vec!["c.example"]);
    }

    #[test]
    fn test_remove_all() {
        let mut headers = Headers::new();
        headers.insert("X-Remove", "value1");
        headers.insert("X-Keep", "value2");
        headers.insert("x-remove", "value3");

        assert_eq!(headers.remove_all("X-REMOVE"), 2);
        assert!(!headers.exists("X-Remove"));
        assert!(headers.exists("x-keep"));
    }

    #[test]
    fn test_has_token() {
        let mut headers = Headers::new();
        headers.insert("Connection", "keep-alive, Upgrade");

        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("Connection", "Keep-Alive"));
        assert!(!headers.has_token("Connection", "close"));
    }

    #[test]
    fn test_write_wire() {
        let mut headers = Headers::new();
        headers.insert("A", "1");
        headers.insert("B", "2");

        let mut buf = Vec::new();
        headers.write_wire(&mut buf);
        assert_eq!(buf, b"A: 1\r\nB: 2\r\n");
    }

    #[test]
    fn test_parse_header_line() {
        let (name, value) = Headers::parse_header_line("Content-Type: text/html").unwrap();
        assert_eq!(name, "Content-Type");
        assert_eq!(value, "text/html");

        let (name, value) = Headers::parse_header_line("X-Custom:  value  ").unwrap();
        assert_eq!(name, "X-Custom");
        assert_eq!(value, "value");

        let (_, value) = Headers::parse_header_line("Empty:").unwrap();
        assert_eq!(value, "");

        assert!(Headers::parse_header_line("Invalid").is_err());
        assert!(Headers::parse_header_line(": value").is_err());
        assert!(Headers::parse_header_line("Bad Name : value").is_err());
    }

    #[test]
    fn test_max_headers() {
        let mut headers = Headers::new();
        for i in 0..MAX_HEADERS {
            assert!(headers.insert(format!("Header-{}", i), "value"));
        }
        assert!(!headers.insert("One-Too-Many", "value"));
        assert_eq!(headers.len(), MAX_HEADERS);
    }
}
