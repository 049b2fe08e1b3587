//! Error taxonomy for the engine.

use thiserror::Error;

/// Why a handshake failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Malformed record or handshake message, bad MAC, bad padding,
    /// unexpected message for the current state.
    BadRecord,
    /// A parseable ClientHello carried a malformed extension body.
    BadExtension,
    /// The client's version range does not overlap ours.
    UnsupportedVersion,
    /// No cipher suite both sides support.
    NoSharedSuite,
    /// The configured certificate or key could not be used.
    CertificateError,
    /// The peer sent a fatal alert; payload is the alert description.
    PeerAlert(u8),
}

impl std::fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeFailure::BadRecord => f.write_str("malformed record"),
            HandshakeFailure::BadExtension => f.write_str("malformed extension"),
            HandshakeFailure::UnsupportedVersion => f.write_str("unsupported protocol version"),
            HandshakeFailure::NoSharedSuite => f.write_str("no shared cipher suite"),
            HandshakeFailure::CertificateError => f.write_str("certificate error"),
            HandshakeFailure::PeerAlert(desc) => write!(f, "peer sent fatal alert {desc}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(HandshakeFailure),
    #[error("i/o failed")]
    IoFailed(#[source] std::io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl TlsError {
    pub(crate) fn bad_record() -> Self {
        TlsError::HandshakeFailed(HandshakeFailure::BadRecord)
    }

    pub(crate) fn bad_extension() -> Self {
        TlsError::HandshakeFailed(HandshakeFailure::BadExtension)
    }

    /// The failure kind, if this is a handshake failure.
    pub fn handshake_failure(&self) -> Option<HandshakeFailure> {
        match self {
            TlsError::HandshakeFailed(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TlsError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TlsError::PeerClosed
        } else {
            TlsError::IoFailed(err)
        }
    }
}
