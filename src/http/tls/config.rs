//! TLS configuration
//!
//! Client and server builders collect settings and only touch OpenSSL in
//! `build()`, so every failure surfaces as a [`TlsError`] from one place.

use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fmt;
use std::path::{Path, PathBuf};

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    fn to_openssl(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("TLS operation failed: {0}")]
    OperationFailed(String),
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// SNI name sent instead of the connection host
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("is_server", &self.is_server)
            .field("servername", &self.servername)
            .field("verify_peer", &self.verify_peer)
            .finish_non_exhaustive()
    }
}

/// Protocol settings shared by both builders
#[derive(Debug, Clone, Default)]
struct Protocol {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    cipher_list: Option<String>,
    ciphersuites: Option<String>,
}

impl Protocol {
    fn apply(&self, ctx: &mut SslContextBuilder) -> Result<(), TlsError> {
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(TlsError::InvalidConfig(format!(
                    "minimum version {} is above maximum {}",
                    min.as_str(),
                    max.as_str()
                )));
            }
        }
        ctx.set_min_proto_version(self.min_version.map(TlsVersion::to_openssl))?;
        ctx.set_max_proto_version(self.max_version.map(TlsVersion::to_openssl))?;
        if let Some(ciphers) = &self.cipher_list {
            ctx.set_cipher_list(ciphers)?;
        }
        if let Some(suites) = &self.ciphersuites {
            ctx.set_ciphersuites(suites)?;
        }
        Ok(())
    }
}

/// Install a certificate (plus chain) and private key from one PEM bundle
fn load_identity(ctx: &mut SslContextBuilder, pem: &[u8], origin: &str) -> Result<(), TlsError> {
    let mut certs = X509::stack_from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("{}: {}", origin, e)))?
        .into_iter();
    let leaf = certs
        .next()
        .ok_or_else(|| TlsError::Certificate(format!("{}: no certificate found", origin)))?;
    ctx.set_certificate(&leaf)?;
    for extra in certs {
        ctx.add_extra_chain_cert(extra)?;
    }

    let key = PKey::private_key_from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("{}: private key: {}", origin, e)))?;
    ctx.set_private_key(&key)?;
    ctx.check_private_key()?;
    Ok(())
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|e| {
        TlsError::Certificate(format!("Failed to read {}: {}", path.display(), e))
    })
}

/// Client configuration builder
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    protocol: Protocol,
    servername: Option<String>,
    verify_peer: bool,
    ca_file: Option<PathBuf>,
    identity: Option<Vec<u8>>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        ClientConfigBuilder {
            protocol: Protocol::default(),
            servername: None,
            verify_peer: true,
            ca_file: None,
            identity: None,
        }
    }
}

impl ClientConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.protocol.min_version = Some(min);
        self.protocol.max_version = Some(max);
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.protocol.cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(mut self, suites: impl Into<String>) -> Self {
        self.protocol.ciphersuites = Some(suites.into());
        self
    }

    /// Set SNI servername (defaults to the connection host)
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate and hostname verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Trust the CA certificates in `path` instead of the system store
    pub fn ca_file(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Present a client certificate from a PEM file holding cert and key
    pub fn cert_file(mut self, path: impl AsRef<Path>) -> Result<Self, TlsError> {
        self.identity = Some(read_pem(path.as_ref())?);
        Ok(self)
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;
        self.protocol.apply(&mut ctx)?;

        if self.verify_peer {
            ctx.set_verify(SslVerifyMode::PEER);
            match &self.ca_file {
                Some(path) => ctx.set_ca_file(path)?,
                None => ctx.set_default_verify_paths()?,
            }
        } else {
            ctx.set_verify(SslVerifyMode::NONE);
        }

        if let Some(pem) = &self.identity {
            load_identity(&mut ctx, pem, "client certificate")?;
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: false,
            servername: self.servername,
            verify_peer: self.verify_peer,
        })
    }
}

/// Server configuration builder
///
/// Without an explicit certificate the built-in self-signed one is used.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    protocol: Protocol,
    identity: Option<Vec<u8>>,
}

impl ServerConfigBuilder {
    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.protocol.min_version = Some(min);
        self.protocol.max_version = Some(max);
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.protocol.cipher_list = Some(ciphers.into());
        self
    }

    /// Set cipher suites (for TLS 1.3)
    pub fn ciphersuites(mut self, suites: impl Into<String>) -> Self {
        self.protocol.ciphersuites = Some(suites.into());
        self
    }

    /// Load certificate and key from a PEM file
    pub fn cert_file(mut self, path: impl AsRef<Path>) -> Result<Self, TlsError> {
        self.identity = Some(read_pem(path.as_ref())?);
        Ok(self)
    }

    /// Use certificate and key from an in-memory PEM bundle
    pub fn cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.identity = Some(pem.into());
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;
        self.protocol.apply(&mut ctx)?;

        match &self.identity {
            Some(pem) => load_identity(&mut ctx, pem, "server certificate")?,
            None => load_identity(
                &mut ctx,
                super::builtin_cert::BUILTIN_CERT.as_bytes(),
                "built-in certificate",
            )?,
        }

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: true,
            servername: None,
            verify_peer: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!(TlsVersion::from_str("TLSv1.2").unwrap(), TlsVersion::Tls12);
        assert_eq!(TlsVersion::from_str("tlsv1.3").unwrap(), TlsVersion::Tls13);
        assert_eq!(TlsVersion::from_str("TLS1.0").unwrap(), TlsVersion::Tls10);
        assert!(TlsVersion::from_str("SSLv3").is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .servername("example.com")
            .verify_peer(false)
            .build()
            .unwrap();

        assert!(!config.is_server());
        assert_eq!(config.servername(), Some("example.com"));
        assert!(!config.verify_peer());
    }

    #[test]
    fn test_client_verifies_by_default() {
        let config = TlsConfig::client().build().unwrap();
        assert!(config.verify_peer());
    }

    #[test]
    fn test_inverted_version_range_rejected() {
        let result = TlsConfig::client()
            .version_range(TlsVersion::Tls13, TlsVersion::Tls12)
            .build();
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_cipher_list_rejected() {
        let result = TlsConfig::client().cipher_list("NOT-A-CIPHER").build();
        assert!(matches!(result, Err(TlsError::OpenSsl(_))));
    }

    #[test]
    fn test_server_builtin_cert() {
        let config = TlsConfig::server()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .build()
            .unwrap();
        assert!(config.is_server());
    }

    #[test]
    fn test_server_cert_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(super::super::builtin_cert::BUILTIN_CERT.as_bytes())
            .unwrap();

        let config = TlsConfig::server().cert_file(file.path()).unwrap().build();
        assert!(config.is_ok());
    }

    #[test]
    fn test_server_garbage_pem() {
        let result = TlsConfig::server().cert_pem("not a pem bundle").build();
        assert!(matches!(result, Err(TlsError::Certificate(_))));
    }
}
