//! The connection adapter: lazy handshake on first use, snapshot access,
//! normal encrypted I/O afterwards.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{alert, content_type};
use crate::config::ServerConfig;
use crate::error::{HandshakeFailure, TlsError};
use crate::handshake::{serve_handshake, Established};
use tlsgauge_core::snapshot::{BeastObservation, HandshakeSnapshot};

/// Hands out [`TlsStream`]s for accepted connections.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn accept<IO>(&self, io: IO) -> TlsStream<IO>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        TlsStream {
            config: self.config.clone(),
            state: State::Pending(Some(io)),
            read_buf: Vec::new(),
            read_pos: 0,
            sent_close: false,
        }
    }
}

/// One-shot latch: the handshake runs at most once, and its failure is
/// replayed to every later call instead of retrying.
enum State<IO> {
    Pending(Option<IO>),
    Established(Established<IO>),
    Failed(FailedKind),
}

enum FailedKind {
    Handshake(HandshakeFailure),
    Io(std::io::ErrorKind),
    PeerClosed,
}

impl FailedKind {
    fn of(err: &TlsError) -> Self {
        match err {
            TlsError::HandshakeFailed(kind) => FailedKind::Handshake(*kind),
            TlsError::IoFailed(io) => FailedKind::Io(io.kind()),
            TlsError::PeerClosed => FailedKind::PeerClosed,
            TlsError::ShutdownInProgress => FailedKind::Io(std::io::ErrorKind::Other),
        }
    }

    fn to_error(&self) -> TlsError {
        match self {
            FailedKind::Handshake(kind) => TlsError::HandshakeFailed(*kind),
            FailedKind::Io(kind) => TlsError::IoFailed(std::io::Error::from(*kind)),
            FailedKind::PeerClosed => TlsError::PeerClosed,
        }
    }
}

/// A server-side TLS connection. The handshake is driven by the first call
/// to [`read`](TlsStream::read), [`write`](TlsStream::write) or
/// [`handshake`](TlsStream::handshake).
pub struct TlsStream<IO> {
    config: Arc<ServerConfig>,
    state: State<IO>,
    read_buf: Vec<u8>,
    read_pos: usize,
    sent_close: bool,
}

impl<IO> TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Drive the handshake to completion if it has not run yet.
    pub async fn handshake(&mut self) -> Result<(), TlsError> {
        self.ensure_established().await.map(|_| ())
    }

    async fn ensure_established(&mut self) -> Result<&mut Established<IO>, TlsError> {
        if let State::Pending(io_slot) = &mut self.state {
            match io_slot.take() {
                Some(io) => match serve_handshake(io, &self.config).await {
                    Ok(established) => self.state = State::Established(established),
                    Err(err) => {
                        self.state = State::Failed(FailedKind::of(&err));
                        return Err(err);
                    }
                },
                // A cancelled handshake future left the latch armed but the
                // socket gone; treat as failed.
                None => self.state = State::Failed(FailedKind::Io(std::io::ErrorKind::Other)),
            }
        }
        match &mut self.state {
            State::Established(established) => Ok(established),
            State::Failed(kind) => Err(kind.to_error()),
            State::Pending(_) => unreachable!("handshake latch resolved above"),
        }
    }

    /// Read decrypted application data. Returns the number of bytes placed
    /// in `buf`; reading after the peer's close_notify yields
    /// [`TlsError::PeerClosed`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_established().await?;
        while self.read_pos >= self.read_buf.len() {
            let (ct, plaintext) = match &mut self.state {
                State::Established(established) => {
                    established.record_layer.read_record().await?
                }
                _ => return Err(TlsError::bad_record()),
            };
            match ct {
                content_type::APPLICATION_DATA => {
                    // 0-length records are legal (and what a splitting
                    // client's first write may look like).
                    if !plaintext.is_empty() {
                        self.read_buf = plaintext;
                        self.read_pos = 0;
                    }
                }
                // Ignore post-handshake handshake traffic; this server
                // never renegotiates.
                content_type::HANDSHAKE => {}
                _ => return Err(TlsError::bad_record()),
            }
        }
        let n = (self.read_buf.len() - self.read_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        Ok(n)
    }

    /// Encrypt and send application data.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let established = self.ensure_established().await?;
        established
            .record_layer
            .write_record(content_type::APPLICATION_DATA, data)
            .await?;
        established.record_layer.flush().await
    }

    /// Send close_notify and shut the transport down.
    pub async fn shutdown(&mut self) -> Result<(), TlsError> {
        if let State::Established(established) = &mut self.state {
            if !self.sent_close {
                self.sent_close = true;
                established
                    .record_layer
                    .send_alert(alert::LEVEL_WARNING, alert::CLOSE_NOTIFY)
                    .await
                    .ok();
            }
            established.record_layer.shutdown_io().await?;
        }
        Ok(())
    }

    /// The handshake observations, available once the handshake succeeded.
    /// The splitting observation reflects what has been seen so far, so this
    /// is meant to be called after the first application read.
    pub fn snapshot(&self) -> Option<HandshakeSnapshot> {
        match &self.state {
            State::Established(established) => Some(HandshakeSnapshot {
                negotiated_version: established.negotiated_version,
                client_offered_suites: established.capture.cipher_suites.clone(),
                compression_methods: established.capture.compression_methods.clone(),
                session_ticket_extension_present: established.capture.session_ticket,
                supported_versions_extension: established.capture.supported_versions.clone(),
                beast_observation: BeastObservation {
                    detection_possible: established.record_layer.probe.armed,
                    splitting_detected: established.record_layer.probe.splitting_detected(),
                },
            }),
            _ => None,
        }
    }
}
