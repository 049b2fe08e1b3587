//! An instrumented TLS server engine.
//!
//! Speaks SSL 3.0 through TLS 1.2 on the wire and deliberately accepts
//! obsolete cipher suites, because its purpose is not to be secure but to
//! watch what connecting clients offer. Alongside a normal handshake it
//! retains the ClientHello's cipher suite list, compression methods, ticket
//! and supported_versions extensions, and observes whether the client splits
//! its first application-data record, exposing it all as a
//! [`HandshakeSnapshot`](tlsgauge_core::HandshakeSnapshot) for
//! classification.
//!
//! ```no_run
//! # async fn demo(key: rsa::RsaPrivateKey) {
//! # let (socket, _peer) = tokio::io::duplex(4096);
//! use std::sync::Arc;
//! use tlsgauge_tls::{CertifiedKey, ServerConfig, TlsAcceptor};
//!
//! let config = Arc::new(ServerConfig::new(CertifiedKey {
//!     certificate_chain: vec![/* DER certificates */],
//!     private_key: key,
//! }));
//! let acceptor = TlsAcceptor::new(config);
//! let mut conn = acceptor.accept(socket);
//! let mut buf = [0u8; 4096];
//! let _n = conn.read(&mut buf).await.unwrap();
//! let snapshot = conn.snapshot().unwrap();
//! # let _ = snapshot;
//! # }
//! ```

mod cipher;
mod codec;
mod config;
mod error;
mod handshake;
mod prf;
mod record;
mod session;
mod stream;
mod suites;

pub use config::{CertifiedKey, ServerConfig};
pub use error::{HandshakeFailure, TlsError};
pub use stream::{TlsAcceptor, TlsStream};
pub use suites::DEFAULT_SERVER_SUITES;

// Re-exported so the binary can load keys without pinning its own copy of
// the crate.
pub use rsa;
