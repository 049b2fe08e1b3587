//! TLS record layer over an async byte stream.
//!
//! Owns framing, protection state and the two per-direction sequence
//! counters, plus the one deliberate deviation from a stock record layer:
//! the length of the first application-data record is observed so the
//! classifier can tell whether the client does 1/n-1 record splitting.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::RecordCipher;
use crate::codec::{alert, content_type};
use crate::error::{HandshakeFailure, TlsError};

/// Record plaintext cap plus slack for MAC, padding and AEAD expansion.
const MAX_FRAGMENT: usize = 16384;
const MAX_WIRE_PAYLOAD: usize = MAX_FRAGMENT + 2048;
const MAX_HANDSHAKE_MESSAGE: usize = 65536 + 4;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SplitProbe {
    /// Armed at suite selection when the connection qualifies.
    pub armed: bool,
    /// Plaintext length of the first application-data record, once seen.
    pub first_record_len: Option<usize>,
}

impl SplitProbe {
    pub fn splitting_detected(&self) -> bool {
        matches!(self.first_record_len, Some(0) | Some(1))
    }
}

pub(crate) struct RecordLayer<IO> {
    io: IO,
    read_cipher: Option<RecordCipher>,
    write_cipher: Option<RecordCipher>,
    read_seq: u64,
    write_seq: u64,
    write_version: u16,
    /// Reassembly buffer for handshake messages spanning record boundaries.
    hs_buf: Vec<u8>,
    pub probe: SplitProbe,
    peer_closed: bool,
    alert_sent: bool,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> RecordLayer<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            io,
            read_cipher: None,
            write_cipher: None,
            read_seq: 0,
            write_seq: 0,
            // Pre-negotiation records go out as TLS 1.0 for maximum
            // intolerance-avoidance; set_write_version pins the real one.
            write_version: 0x0301,
            hs_buf: Vec::new(),
            probe: SplitProbe::default(),
            peer_closed: false,
            alert_sent: false,
        }
    }

    pub fn set_write_version(&mut self, version: u16) {
        self.write_version = version;
    }

    /// Install read protection (the peer just sent ChangeCipherSpec).
    pub fn activate_read(&mut self, cipher: RecordCipher) {
        self.read_cipher = Some(cipher);
        self.read_seq = 0;
    }

    /// Install write protection (we just sent ChangeCipherSpec).
    pub fn activate_write(&mut self, cipher: RecordCipher) {
        self.write_cipher = Some(cipher);
        self.write_seq = 0;
    }

    pub fn alert_already_sent(&self) -> bool {
        self.alert_sent
    }

    pub async fn write_record(&mut self, ct: u8, payload: &[u8]) -> Result<(), TlsError> {
        // chunks() refuses an empty payload, which is a legal record.
        let mut remaining = payload;
        loop {
            let take = remaining.len().min(MAX_FRAGMENT);
            let (fragment, rest) = remaining.split_at(take);
            let on_wire = match &mut self.write_cipher {
                Some(cipher) => cipher.seal(self.write_seq, ct, self.write_version, fragment),
                None => fragment.to_vec(),
            };
            self.write_seq = self.write_seq.wrapping_add(1);

            let mut header = [0u8; 5];
            header[0] = ct;
            header[1..3].copy_from_slice(&self.write_version.to_be_bytes());
            header[3..5].copy_from_slice(&(on_wire.len() as u16).to_be_bytes());
            self.io.write_all(&header).await?;
            self.io.write_all(&on_wire).await?;

            if rest.is_empty() {
                break;
            }
            remaining = rest;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), TlsError> {
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown_io(&mut self) -> Result<(), TlsError> {
        self.io.shutdown().await?;
        Ok(())
    }

    pub async fn send_alert(&mut self, level: u8, description: u8) -> Result<(), TlsError> {
        self.alert_sent = true;
        self.write_record(content_type::ALERT, &[level, description])
            .await?;
        self.flush().await
    }

    /// Read and decrypt the next record, transparently consuming warning
    /// alerts. close_notify and fatal alerts surface as errors.
    pub async fn read_record(&mut self) -> Result<(u8, Vec<u8>), TlsError> {
        loop {
            if self.peer_closed {
                return Err(TlsError::PeerClosed);
            }

            let mut header = [0u8; 5];
            self.io.read_exact(&mut header).await?;
            let ct = header[0];
            if !(content_type::CHANGE_CIPHER_SPEC..=content_type::APPLICATION_DATA).contains(&ct) {
                return Err(TlsError::bad_record());
            }
            let len = u16::from_be_bytes([header[3], header[4]]) as usize;
            if len > MAX_WIRE_PAYLOAD {
                return Err(TlsError::bad_record());
            }
            let mut payload = vec![0u8; len];
            self.io.read_exact(&mut payload).await?;

            let record_version = u16::from_be_bytes([header[1], header[2]]);
            let opened = match &mut self.read_cipher {
                Some(cipher) => cipher.open(self.read_seq, ct, record_version, &payload),
                None => Ok(payload),
            };
            let plaintext = match opened {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    self.send_alert(alert::LEVEL_FATAL, alert::BAD_RECORD_MAC)
                        .await
                        .ok();
                    return Err(err);
                }
            };
            self.read_seq = self.read_seq.wrapping_add(1);

            match ct {
                content_type::ALERT => {
                    if plaintext.len() < 2 {
                        return Err(TlsError::bad_record());
                    }
                    let (level, description) = (plaintext[0], plaintext[1]);
                    if description == alert::CLOSE_NOTIFY {
                        self.peer_closed = true;
                        return Err(TlsError::PeerClosed);
                    }
                    if level == alert::LEVEL_FATAL {
                        return Err(TlsError::HandshakeFailed(HandshakeFailure::PeerAlert(
                            description,
                        )));
                    }
                    // Warning alert: keep reading.
                }
                content_type::APPLICATION_DATA => {
                    if self.probe.first_record_len.is_none() {
                        self.probe.first_record_len = Some(plaintext.len());
                    }
                    return Ok((ct, plaintext));
                }
                _ => return Ok((ct, plaintext)),
            }
        }
    }

    /// Next complete handshake message, reassembled across records. Returns
    /// the message type and the full message including its 4-byte header.
    pub async fn read_handshake_message(&mut self) -> Result<(u8, Vec<u8>), TlsError> {
        loop {
            if self.hs_buf.len() >= 4 {
                let len =
                    u32::from_be_bytes([0, self.hs_buf[1], self.hs_buf[2], self.hs_buf[3]]) as usize;
                if 4 + len > MAX_HANDSHAKE_MESSAGE {
                    return Err(TlsError::bad_record());
                }
                if self.hs_buf.len() >= 4 + len {
                    let rest = self.hs_buf.split_off(4 + len);
                    let msg = std::mem::replace(&mut self.hs_buf, rest);
                    return Ok((msg[0], msg));
                }
            }
            let (ct, payload) = self.read_record().await?;
            if ct != content_type::HANDSHAKE {
                return Err(TlsError::bad_record());
            }
            if payload.is_empty() {
                return Err(TlsError::bad_record());
            }
            self.hs_buf.extend_from_slice(&payload);
        }
    }

    /// Expect a ChangeCipherSpec record; no handshake data may straddle it.
    pub async fn read_change_cipher_spec(&mut self) -> Result<(), TlsError> {
        if !self.hs_buf.is_empty() {
            return Err(TlsError::bad_record());
        }
        let (ct, payload) = self.read_record().await?;
        if ct != content_type::CHANGE_CIPHER_SPEC || payload != [1] {
            return Err(TlsError::bad_record());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plaintext_records_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = RecordLayer::new(client);
        let mut rx = RecordLayer::new(server);
        tx.write_record(content_type::HANDSHAKE, b"hello").await.unwrap();
        tx.flush().await.unwrap();
        let (ct, payload) = rx.read_record().await.unwrap();
        assert_eq!(ct, content_type::HANDSHAKE);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn oversized_records_are_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut rx = RecordLayer::new(server);
        let mut header = [0u8; 5];
        header[0] = content_type::HANDSHAKE;
        header[1..3].copy_from_slice(&0x0301u16.to_be_bytes());
        header[3..5].copy_from_slice(&0xFFFFu16.to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();
        let err = rx.read_record().await.unwrap_err();
        assert!(matches!(
            err,
            TlsError::HandshakeFailed(HandshakeFailure::BadRecord)
        ));
    }

    #[tokio::test]
    async fn unknown_content_type_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut rx = RecordLayer::new(server);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x99, 3, 1, 0, 1, 0])
            .await
            .unwrap();
        assert!(rx.read_record().await.is_err());
    }

    #[tokio::test]
    async fn handshake_messages_reassemble_across_records() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = RecordLayer::new(client);
        let mut rx = RecordLayer::new(server);

        // One 10-byte message body, delivered in two records.
        let mut msg = vec![42u8, 0, 0, 10];
        msg.extend_from_slice(&[7; 10]);
        tx.write_record(content_type::HANDSHAKE, &msg[..6]).await.unwrap();
        tx.write_record(content_type::HANDSHAKE, &msg[6..]).await.unwrap();
        tx.flush().await.unwrap();

        let (msg_type, full) = rx.read_handshake_message().await.unwrap();
        assert_eq!(msg_type, 42);
        assert_eq!(full, msg);
    }

    #[tokio::test]
    async fn two_messages_in_one_record_are_split() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = RecordLayer::new(client);
        let mut rx = RecordLayer::new(server);

        let mut payload = vec![1u8, 0, 0, 2, 0xAA, 0xBB];
        payload.extend_from_slice(&[2u8, 0, 0, 1, 0xCC]);
        tx.write_record(content_type::HANDSHAKE, &payload).await.unwrap();
        tx.flush().await.unwrap();

        let (t1, m1) = rx.read_handshake_message().await.unwrap();
        assert_eq!((t1, m1.len()), (1, 6));
        let (t2, m2) = rx.read_handshake_message().await.unwrap();
        assert_eq!((t2, m2.len()), (2, 5));
    }

    #[tokio::test]
    async fn close_notify_reads_as_peer_closed() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = RecordLayer::new(client);
        let mut rx = RecordLayer::new(server);
        tx.send_alert(alert::LEVEL_WARNING, alert::CLOSE_NOTIFY).await.unwrap();
        assert!(matches!(rx.read_record().await, Err(TlsError::PeerClosed)));
        // And it stays closed.
        assert!(matches!(rx.read_record().await, Err(TlsError::PeerClosed)));
    }

    #[tokio::test]
    async fn fatal_alert_surfaces_its_description() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = RecordLayer::new(client);
        let mut rx = RecordLayer::new(server);
        tx.send_alert(alert::LEVEL_FATAL, alert::HANDSHAKE_FAILURE).await.unwrap();
        let err = rx.read_record().await.unwrap_err();
        assert!(matches!(
            err,
            TlsError::HandshakeFailed(HandshakeFailure::PeerAlert(alert::HANDSHAKE_FAILURE))
        ));
    }

    #[tokio::test]
    async fn first_application_record_length_is_observed_once() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = RecordLayer::new(client);
        let mut rx = RecordLayer::new(server);
        tx.write_record(content_type::APPLICATION_DATA, &[9]).await.unwrap();
        tx.write_record(content_type::APPLICATION_DATA, &[0; 100]).await.unwrap();
        tx.flush().await.unwrap();
        rx.read_record().await.unwrap();
        rx.read_record().await.unwrap();
        assert_eq!(rx.probe.first_record_len, Some(1));
        assert!(rx.probe.splitting_detected());
    }

    #[tokio::test]
    async fn large_writes_fragment() {
        let (client, server) = tokio::io::duplex(usize::pow(2, 20));
        let mut tx = RecordLayer::new(client);
        let mut rx = RecordLayer::new(server);
        let big = vec![5u8; MAX_FRAGMENT + 10];
        tx.write_record(content_type::APPLICATION_DATA, &big).await.unwrap();
        tx.flush().await.unwrap();
        let (_, first) = rx.read_record().await.unwrap();
        let (_, second) = rx.read_record().await.unwrap();
        assert_eq!(first.len(), MAX_FRAGMENT);
        assert_eq!(second.len(), 10);
    }
}
