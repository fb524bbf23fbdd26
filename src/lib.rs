//! h1wire - HTTP/1.x protocol engine
//!
//! This crate provides blocking HTTP/1.0 and HTTP/1.1 client and server
//! roles over plain TCP and TLS transports: an incremental response parser,
//! a client exchange orchestrator (redirects, 100-continue, Basic/Digest
//! authentication, cookies) and a polling server accept loop.

pub mod http;
pub mod net;
