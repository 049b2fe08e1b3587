//! Server-side handshake state machine.
//!
//! Standard SSL 3.0 - TLS 1.2 server flow with one instrumented branch: at
//! ClientHello processing, a connection at TLS 1.0 or below offering one of
//! the static-RSA CBC probe suites gets pinned to it and the record-splitting
//! probe armed. Everything the ClientHello offered is retained for the
//! post-handshake snapshot.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256, Sha384};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::cipher::RecordCipher;
use crate::codec::{
    alert, content_type, decode_client_hello, decode_client_key_exchange, encode_certificate,
    encode_finished, encode_server_hello, encode_server_hello_done, encode_server_key_exchange,
    ext, handshake_type, ske_params, ClientHello, ClientKeyExchange, ServerHello,
};
use crate::config::{CertifiedKey, ServerConfig};
use crate::error::{HandshakeFailure, TlsError};
use crate::prf::{extended_master_secret, key_block, master_secret, Transcript};
use crate::record::RecordLayer;
use crate::session::SessionEntry;
use crate::suites::{KeyExchangeAlg, SuiteParams, BEAST_PROBE_SUITES};
use tlsgauge_core::version;

const CURVE_X25519: u16 = 0x001D;
const CURVE_SECP256R1: u16 = 0x0017;
const SIG_RSA_PKCS1_SHA256: u16 = 0x0401;
const SIG_RSA_PKCS1_SHA384: u16 = 0x0501;

/// ClientHello fields retained for the snapshot, wire-verbatim.
#[derive(Debug, Clone)]
pub(crate) struct ClientCapture {
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub session_ticket: bool,
    pub supported_versions: Vec<u16>,
}

pub(crate) struct Established<IO> {
    pub record_layer: RecordLayer<IO>,
    pub capture: ClientCapture,
    pub negotiated_version: u16,
}

impl<IO> std::fmt::Debug for Established<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("capture", &self.capture)
            .field("negotiated_version", &self.negotiated_version)
            .finish()
    }
}

/// Run the server handshake to completion, emitting the proper fatal alert
/// on the way out of any failure.
pub(crate) async fn serve_handshake<IO>(
    io: IO,
    config: &ServerConfig,
) -> Result<Established<IO>, TlsError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut record_layer = RecordLayer::new(io);
    match drive(&mut record_layer, config).await {
        Ok((capture, negotiated_version)) => Ok(Established {
            record_layer,
            capture,
            negotiated_version,
        }),
        Err(err) => {
            if let Some(desc) = alert_for(&err) {
                if !record_layer.alert_already_sent() {
                    record_layer.send_alert(alert::LEVEL_FATAL, desc).await.ok();
                }
            }
            Err(err)
        }
    }
}

fn alert_for(err: &TlsError) -> Option<u8> {
    match err.handshake_failure()? {
        HandshakeFailure::BadRecord => Some(alert::DECODE_ERROR),
        HandshakeFailure::BadExtension => Some(alert::ILLEGAL_PARAMETER),
        HandshakeFailure::UnsupportedVersion => Some(alert::PROTOCOL_VERSION),
        HandshakeFailure::NoSharedSuite => Some(alert::HANDSHAKE_FAILURE),
        HandshakeFailure::CertificateError => Some(alert::INTERNAL_ERROR),
        HandshakeFailure::PeerAlert(_) => None,
    }
}

async fn drive<IO>(
    rl: &mut RecordLayer<IO>,
    config: &ServerConfig,
) -> Result<(ClientCapture, u16), TlsError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (msg_type, ch_msg) = rl.read_handshake_message().await?;
    if msg_type != handshake_type::CLIENT_HELLO {
        return Err(TlsError::bad_record());
    }
    let ch = decode_client_hello(&ch_msg[4..])?;
    let capture = ClientCapture {
        cipher_suites: ch.cipher_suites.clone(),
        compression_methods: ch.compression_methods.clone(),
        session_ticket: ch.session_ticket,
        supported_versions: ch.supported_versions.clone(),
    };

    if ch.client_version < config.min_version {
        return Err(TlsError::HandshakeFailed(HandshakeFailure::UnsupportedVersion));
    }
    let negotiated = ch.client_version.min(version::TLS12);
    if !ch.compression_methods.contains(&0) {
        return Err(TlsError::HandshakeFailed(HandshakeFailure::NoSharedSuite));
    }

    trace!(
        "client hello: version {:#06x}, negotiating {:#06x}, {} suites offered",
        ch.client_version,
        negotiated,
        ch.cipher_suites.len()
    );

    // Session-ID resumption, disabled at TLS 1.0 and below so those clients
    // always run a full handshake past the record-splitting probe.
    if negotiated >= version::TLS11 && !ch.session_id.is_empty() {
        if let Some(entry) = config.session_cache.get(&ch.session_id) {
            if entry.version == negotiated
                && ch.cipher_suites.contains(&entry.suite)
                && entry.extended_master_secret == ch.extended_master_secret
            {
                debug!("resuming cached session");
                resume(rl, &ch_msg, &ch, &entry, negotiated).await?;
                return Ok((capture, negotiated));
            }
        }
    }

    full_handshake(rl, config, &ch_msg, &ch, negotiated).await?;
    Ok((capture, negotiated))
}

struct Selection {
    params: &'static SuiteParams,
    curve: Option<u16>,
    probe_armed: bool,
}

fn common_curve(ch: &ClientHello) -> Option<u16> {
    if !ch.ec_point_formats.is_empty() && !ch.ec_point_formats.contains(&0) {
        return None;
    }
    [CURVE_X25519, CURVE_SECP256R1]
        .into_iter()
        .find(|c| ch.supported_groups.contains(c))
}

fn select_suite(
    ch: &ClientHello,
    config: &ServerConfig,
    negotiated: u16,
) -> Result<Selection, TlsError> {
    // Instrumented branch: pin a static-RSA CBC suite on old protocols so
    // the first application record tells us about client-side splitting.
    if negotiated <= version::TLS10 {
        for &candidate in BEAST_PROBE_SUITES {
            if !config.cipher_suites.contains(&candidate)
                || !ch.cipher_suites.contains(&candidate)
            {
                continue;
            }
            let Some(params) = SuiteParams::from_id(candidate) else {
                continue;
            };
            if params.min_version > negotiated {
                continue;
            }
            return Ok(Selection {
                params,
                curve: None,
                probe_armed: true,
            });
        }
    }

    let curve = common_curve(ch);
    for &id in &config.cipher_suites {
        let Some(params) = SuiteParams::from_id(id) else {
            continue;
        };
        if params.min_version > negotiated {
            continue;
        }
        match params.kx {
            // The serving key is RSA.
            KeyExchangeAlg::EcdheEcdsa => continue,
            KeyExchangeAlg::EcdheRsa if curve.is_none() => continue,
            _ => {}
        }
        if ch.cipher_suites.contains(&id) {
            let curve = match params.kx {
                KeyExchangeAlg::EcdheRsa => curve,
                _ => None,
            };
            return Ok(Selection {
                params,
                curve,
                probe_armed: false,
            });
        }
    }
    Err(TlsError::HandshakeFailed(HandshakeFailure::NoSharedSuite))
}

enum EphemeralKey {
    X25519(x25519_dalek::EphemeralSecret),
    P256(p256::ecdh::EphemeralSecret),
}

impl EphemeralKey {
    fn generate(curve: u16) -> Self {
        match curve {
            CURVE_X25519 => Self::X25519(x25519_dalek::EphemeralSecret::random_from_rng(OsRng)),
            _ => Self::P256(p256::ecdh::EphemeralSecret::random(&mut OsRng)),
        }
    }

    fn public_bytes(&self) -> Vec<u8> {
        match self {
            Self::X25519(secret) => x25519_dalek::PublicKey::from(secret).as_bytes().to_vec(),
            Self::P256(secret) => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                secret.public_key().to_encoded_point(false).as_bytes().to_vec()
            }
        }
    }

    fn shared_secret(self, peer_point: &[u8]) -> Result<Vec<u8>, TlsError> {
        match self {
            Self::X25519(secret) => {
                let peer: [u8; 32] = peer_point
                    .try_into()
                    .map_err(|_| TlsError::bad_record())?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                Ok(shared.as_bytes().to_vec())
            }
            Self::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_point)
                    .map_err(|_| TlsError::bad_record())?;
                let shared = secret.diffie_hellman(&peer);
                Ok(shared.raw_secret_bytes().to_vec())
            }
        }
    }
}

/// Sign ECDHE parameters with the serving RSA key. TLS 1.2 negotiates the
/// hash; older versions take the raw MD5+SHA1 concatenation without a
/// DigestInfo wrapper.
fn sign_ske(
    key: &RsaPrivateKey,
    negotiated: u16,
    client_sig_algs: &[u16],
    data: &[u8],
) -> Result<(Option<u16>, Vec<u8>), TlsError> {
    if negotiated >= version::TLS12 {
        let alg = if client_sig_algs.is_empty() || client_sig_algs.contains(&SIG_RSA_PKCS1_SHA256) {
            SIG_RSA_PKCS1_SHA256
        } else if client_sig_algs.contains(&SIG_RSA_PKCS1_SHA384) {
            SIG_RSA_PKCS1_SHA384
        } else {
            SIG_RSA_PKCS1_SHA256
        };
        let signature = if alg == SIG_RSA_PKCS1_SHA256 {
            let digest = Sha256::digest(data);
            key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        } else {
            let digest = Sha384::digest(data);
            key.sign(Pkcs1v15Sign::new::<Sha384>(), &digest)
        }
        .map_err(|_| TlsError::HandshakeFailed(HandshakeFailure::CertificateError))?;
        Ok((Some(alg), signature))
    } else {
        let mut digest = md5::Md5::digest(data).to_vec();
        digest.extend_from_slice(&sha1::Sha1::digest(data));
        let signature = key
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
            .map_err(|_| TlsError::HandshakeFailed(HandshakeFailure::CertificateError))?;
        Ok((None, signature))
    }
}

/// Unwrap the RSA-encrypted premaster. Decryption failures and version
/// mismatches silently continue with a random premaster so padding oracles
/// learn nothing; the handshake then dies at Finished verification.
fn decrypt_premaster(key: &RsaPrivateKey, encrypted: &[u8], client_version: u16) -> Vec<u8> {
    let ok = key
        .decrypt(Pkcs1v15Encrypt, encrypted)
        .ok()
        .filter(|pms| pms.len() == 48 && pms[..2] == client_version.to_be_bytes());
    match ok {
        Some(pms) => pms,
        None => {
            let mut pms = vec![0u8; 48];
            OsRng.fill_bytes(&mut pms);
            pms[..2].copy_from_slice(&client_version.to_be_bytes());
            pms
        }
    }
}

struct DirectionKeys {
    client: RecordCipher,
    server: RecordCipher,
}

fn derive_direction_keys(
    negotiated: u16,
    params: &SuiteParams,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> DirectionKeys {
    let mac_len = params.mac_key_len();
    let key_len = params.key_len();
    let iv_len = params.fixed_iv_len();
    let kb = key_block(
        negotiated,
        params.prf_hash,
        master,
        client_random,
        server_random,
        params.key_material_len(),
    );
    let (client_mac, rest) = kb.split_at(mac_len);
    let (server_mac, rest) = rest.split_at(mac_len);
    let (client_key, rest) = rest.split_at(key_len);
    let (server_key, rest) = rest.split_at(key_len);
    let (client_iv, server_iv) = rest.split_at(iv_len);
    DirectionKeys {
        client: RecordCipher::new(params, negotiated, client_key, client_iv, client_mac),
        server: RecordCipher::new(params, negotiated, server_key, server_iv, server_mac),
    }
}

fn server_hello_extensions(ch: &ClientHello, use_ems: bool, ecdhe: bool) -> Vec<(u16, Vec<u8>)> {
    let mut extensions = Vec::new();
    if ch.offers_renegotiation_protection() {
        extensions.push((ext::RENEGOTIATION_INFO, vec![0]));
    }
    if use_ems {
        extensions.push((ext::EXTENDED_MASTER_SECRET, vec![]));
    }
    if ecdhe && !ch.ec_point_formats.is_empty() {
        extensions.push((ext::EC_POINT_FORMATS, vec![1, 0]));
    }
    extensions
}

async fn full_handshake<IO>(
    rl: &mut RecordLayer<IO>,
    config: &ServerConfig,
    ch_msg: &[u8],
    ch: &ClientHello,
    negotiated: u16,
) -> Result<(), TlsError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let selection = select_suite(ch, config, negotiated)?;
    let params = selection.params;
    rl.probe.armed = selection.probe_armed;
    debug!(
        "negotiated suite {:#06x}, splitting probe armed: {}",
        params.id, selection.probe_armed
    );

    // The certificate pair is pinned for the whole handshake even if the
    // provider swaps mid-flight.
    let cert: std::sync::Arc<CertifiedKey> = config.current_certificate();

    let mut transcript = Transcript::new();
    transcript.update(ch_msg);

    let client_random = ch.random;
    let mut server_random = [0u8; 32];
    OsRng.fill_bytes(&mut server_random);

    let session_id = if negotiated >= version::TLS11 {
        let mut id = vec![0u8; 32];
        OsRng.fill_bytes(&mut id);
        id
    } else {
        Vec::new()
    };

    // RFC 7627 is defined for TLS only.
    let use_ems = ch.extended_master_secret && negotiated >= version::TLS10;
    let ecdhe = matches!(params.kx, KeyExchangeAlg::EcdheRsa);

    rl.set_write_version(negotiated);

    let sh = encode_server_hello(&ServerHello {
        version: negotiated,
        random: server_random,
        session_id: session_id.clone(),
        cipher_suite: params.id,
        extensions: server_hello_extensions(ch, use_ems, ecdhe),
    });
    transcript.update(&sh);
    let cert_msg = encode_certificate(&cert.certificate_chain);
    transcript.update(&cert_msg);

    let mut flight = Vec::with_capacity(sh.len() + cert_msg.len() + 16);
    flight.extend_from_slice(&sh);
    flight.extend_from_slice(&cert_msg);

    let mut ephemeral = None;
    if ecdhe {
        let curve = selection
            .curve
            .ok_or(TlsError::HandshakeFailed(HandshakeFailure::NoSharedSuite))?;
        let key = EphemeralKey::generate(curve);
        let params_bytes = ske_params(curve, &key.public_bytes());
        let mut signed_data = Vec::with_capacity(64 + params_bytes.len());
        signed_data.extend_from_slice(&client_random);
        signed_data.extend_from_slice(&server_random);
        signed_data.extend_from_slice(&params_bytes);
        let (sig_alg, signature) = sign_ske(
            &cert.private_key,
            negotiated,
            &ch.signature_algorithms,
            &signed_data,
        )?;
        let ske = encode_server_key_exchange(&params_bytes, sig_alg, &signature);
        transcript.update(&ske);
        flight.extend_from_slice(&ske);
        ephemeral = Some(key);
    }

    let shd = encode_server_hello_done();
    transcript.update(&shd);
    flight.extend_from_slice(&shd);
    rl.write_record(content_type::HANDSHAKE, &flight).await?;
    rl.flush().await?;

    let (msg_type, cke_msg) = rl.read_handshake_message().await?;
    if msg_type != handshake_type::CLIENT_KEY_EXCHANGE {
        return Err(TlsError::bad_record());
    }
    let rsa_kx = matches!(params.kx, KeyExchangeAlg::Rsa);
    let cke = decode_client_key_exchange(
        &cke_msg[4..],
        rsa_kx,
        negotiated == version::SSL30,
    )?;
    let premaster = match cke {
        ClientKeyExchange::Rsa(encrypted) => {
            decrypt_premaster(&cert.private_key, &encrypted, ch.client_version)
        }
        ClientKeyExchange::Ecdh(point) => ephemeral
            .take()
            .ok_or_else(TlsError::bad_record)?
            .shared_secret(&point)?,
    };
    transcript.update(&cke_msg);

    let master = if use_ems {
        let session_hash = transcript.handshake_hash(negotiated, params.prf_hash);
        extended_master_secret(negotiated, params.prf_hash, &premaster, &session_hash)
    } else {
        master_secret(
            negotiated,
            params.prf_hash,
            &premaster,
            &client_random,
            &server_random,
        )
    };

    let keys = derive_direction_keys(negotiated, params, &master, &client_random, &server_random);

    rl.read_change_cipher_spec().await?;
    rl.activate_read(keys.client);

    let (msg_type, fin_msg) = rl.read_handshake_message().await?;
    if msg_type != handshake_type::FINISHED {
        return Err(TlsError::bad_record());
    }
    let expected = transcript.finished_verify_data(negotiated, params.prf_hash, &master, true);
    if fin_msg[4..].ct_eq(&expected).unwrap_u8() == 0 {
        return Err(TlsError::bad_record());
    }
    transcript.update(&fin_msg);

    if !session_id.is_empty() {
        config.session_cache.insert(
            session_id,
            SessionEntry {
                master_secret: master.clone(),
                suite: params.id,
                version: negotiated,
                extended_master_secret: use_ems,
            },
        );
    }

    rl.write_record(content_type::CHANGE_CIPHER_SPEC, &[1]).await?;
    rl.activate_write(keys.server);
    let verify = transcript.finished_verify_data(negotiated, params.prf_hash, &master, false);
    rl.write_record(content_type::HANDSHAKE, &encode_finished(&verify))
        .await?;
    rl.flush().await?;

    Ok(())
}

/// Abbreviated handshake against a cached session. The server Finished
/// flight goes first.
async fn resume<IO>(
    rl: &mut RecordLayer<IO>,
    ch_msg: &[u8],
    ch: &ClientHello,
    entry: &SessionEntry,
    negotiated: u16,
) -> Result<(), TlsError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let params = SuiteParams::from_id(entry.suite)
        .ok_or(TlsError::HandshakeFailed(HandshakeFailure::NoSharedSuite))?;

    let mut transcript = Transcript::new();
    transcript.update(ch_msg);

    let client_random = ch.random;
    let mut server_random = [0u8; 32];
    OsRng.fill_bytes(&mut server_random);

    rl.set_write_version(negotiated);
    let sh = encode_server_hello(&ServerHello {
        version: negotiated,
        random: server_random,
        session_id: ch.session_id.clone(),
        cipher_suite: params.id,
        extensions: server_hello_extensions(ch, entry.extended_master_secret, false),
    });
    transcript.update(&sh);
    rl.write_record(content_type::HANDSHAKE, &sh).await?;

    let keys = derive_direction_keys(
        negotiated,
        params,
        &entry.master_secret,
        &client_random,
        &server_random,
    );

    rl.write_record(content_type::CHANGE_CIPHER_SPEC, &[1]).await?;
    rl.activate_write(keys.server);
    let verify =
        transcript.finished_verify_data(negotiated, params.prf_hash, &entry.master_secret, false);
    let fin = encode_finished(&verify);
    transcript.update(&fin);
    rl.write_record(content_type::HANDSHAKE, &fin).await?;
    rl.flush().await?;

    rl.read_change_cipher_spec().await?;
    rl.activate_read(keys.client);
    let (msg_type, client_fin) = rl.read_handshake_message().await?;
    if msg_type != handshake_type::FINISHED {
        return Err(TlsError::bad_record());
    }
    let expected =
        transcript.finished_verify_data(negotiated, params.prf_hash, &entry.master_secret, true);
    if client_fin[4..].ct_eq(&expected).unwrap_u8() == 0 {
        return Err(TlsError::bad_record());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPublicKey;
    use std::sync::{Arc, OnceLock};

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).expect("test key generation"))
    }

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::new(CertifiedKey {
            // The raw clients below never parse the certificate; any DER
            // bytes will do.
            certificate_chain: vec![vec![0x30, 0x82, 0x01, 0x00]],
            private_key: test_key().clone(),
        }))
    }

    fn build_client_hello(
        client_version: u16,
        suites: &[u16],
        extensions: &[(u16, Vec<u8>)],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&client_version.to_be_bytes());
        body.extend_from_slice(&[0x11; 32]);
        body.push(0);
        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for s in suites {
            body.extend_from_slice(&s.to_be_bytes());
        }
        body.extend_from_slice(&[1, 0]);
        if !extensions.is_empty() {
            let mut exts = Vec::new();
            for (t, b) in extensions {
                exts.extend_from_slice(&t.to_be_bytes());
                exts.extend_from_slice(&(b.len() as u16).to_be_bytes());
                exts.extend_from_slice(b);
            }
            body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
            body.extend_from_slice(&exts);
        }
        let mut msg = vec![handshake_type::CLIENT_HELLO];
        msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        msg.extend_from_slice(&body);
        msg
    }

    struct RawClient<IO> {
        rl: RecordLayer<IO>,
        transcript: Transcript,
        master: Vec<u8>,
        negotiated: u16,
        selected_suite: u16,
    }

    /// Drive a static-RSA handshake from the client side using the crate's
    /// own primitives, the way an archaeological client would.
    async fn run_raw_client<IO: AsyncRead + AsyncWrite + Unpin>(
        io: IO,
        client_version: u16,
        suites: &[u16],
        extensions: &[(u16, Vec<u8>)],
    ) -> RawClient<IO> {
        let mut rl = RecordLayer::new(io);
        let mut transcript = Transcript::new();
        let client_random = [0x11u8; 32];

        let ch = build_client_hello(client_version, suites, extensions);
        transcript.update(&ch);
        rl.write_record(content_type::HANDSHAKE, &ch).await.unwrap();
        rl.flush().await.unwrap();

        let (t, sh) = rl.read_handshake_message().await.unwrap();
        assert_eq!(t, handshake_type::SERVER_HELLO);
        transcript.update(&sh);
        let negotiated = u16::from_be_bytes([sh[4], sh[5]]);
        let mut server_random = [0u8; 32];
        server_random.copy_from_slice(&sh[6..38]);
        let sid_len = sh[38] as usize;
        let selected_suite = u16::from_be_bytes([sh[39 + sid_len], sh[40 + sid_len]]);
        rl.set_write_version(negotiated);

        let (t, cert_msg) = rl.read_handshake_message().await.unwrap();
        assert_eq!(t, handshake_type::CERTIFICATE);
        transcript.update(&cert_msg);
        let (t, shd) = rl.read_handshake_message().await.unwrap();
        assert_eq!(t, handshake_type::SERVER_HELLO_DONE);
        transcript.update(&shd);

        // Encrypt a premaster to the server's public key.
        let mut pms = vec![0u8; 48];
        OsRng.fill_bytes(&mut pms);
        pms[..2].copy_from_slice(&client_version.to_be_bytes());
        let public = RsaPublicKey::new(test_key().n().clone(), test_key().e().clone()).unwrap();
        let encrypted = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &pms).unwrap();
        let mut cke_body = Vec::new();
        cke_body.extend_from_slice(&(encrypted.len() as u16).to_be_bytes());
        cke_body.extend_from_slice(&encrypted);
        let mut cke = vec![handshake_type::CLIENT_KEY_EXCHANGE];
        cke.extend_from_slice(&(cke_body.len() as u32).to_be_bytes()[1..]);
        cke.extend_from_slice(&cke_body);
        transcript.update(&cke);
        rl.write_record(content_type::HANDSHAKE, &cke).await.unwrap();

        let params = SuiteParams::from_id(selected_suite).unwrap();
        let master = master_secret(
            negotiated,
            params.prf_hash,
            &pms,
            &client_random,
            &server_random,
        );
        let keys =
            derive_direction_keys(negotiated, params, &master, &client_random, &server_random);

        rl.write_record(content_type::CHANGE_CIPHER_SPEC, &[1]).await.unwrap();
        rl.activate_write(keys.client);
        let verify = transcript.finished_verify_data(negotiated, params.prf_hash, &master, true);
        let fin = encode_finished(&verify);
        transcript.update(&fin);
        rl.write_record(content_type::HANDSHAKE, &fin).await.unwrap();
        rl.flush().await.unwrap();

        rl.read_change_cipher_spec().await.unwrap();
        rl.activate_read(keys.server);
        let (t, server_fin) = rl.read_handshake_message().await.unwrap();
        assert_eq!(t, handshake_type::FINISHED);
        let expected =
            transcript.finished_verify_data(negotiated, params.prf_hash, &master, false);
        assert_eq!(&server_fin[4..], &expected[..]);
        transcript.update(&server_fin);

        RawClient {
            rl,
            transcript,
            master,
            negotiated,
            selected_suite,
        }
    }

    #[tokio::test]
    async fn tls10_rsa_cbc_handshake_arms_the_probe() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);

        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let est = serve_handshake(server_io, &server_config).await.unwrap();
            let mut rl = est.record_layer;
            let (ct, data) = rl.read_record().await.unwrap();
            assert_eq!(ct, content_type::APPLICATION_DATA);
            (est.capture, est.negotiated_version, rl.probe, data)
        });

        let mut client = run_raw_client(client_io, version::TLS10, &[0x002F], &[]).await;
        assert_eq!(client.negotiated, version::TLS10);
        assert_eq!(client.selected_suite, 0x002F);
        // An unsplit 16-byte first write: a BEAST-vulnerable client.
        client
            .rl
            .write_record(content_type::APPLICATION_DATA, &[b'A'; 16])
            .await
            .unwrap();
        client.rl.flush().await.unwrap();

        let (capture, negotiated, probe, data) = server.await.unwrap();
        assert_eq!(negotiated, version::TLS10);
        assert_eq!(capture.cipher_suites, vec![0x002F]);
        assert_eq!(data, vec![b'A'; 16]);
        assert!(probe.armed);
        assert_eq!(probe.first_record_len, Some(16));
        assert!(!probe.splitting_detected());
        let _ = (client.transcript, client.master);
    }

    #[tokio::test]
    async fn split_first_write_reads_as_mitigated() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);

        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let est = serve_handshake(server_io, &server_config).await.unwrap();
            let mut rl = est.record_layer;
            // 1/n-1 split arrives as two records.
            let (_, first) = rl.read_record().await.unwrap();
            let (_, rest) = rl.read_record().await.unwrap();
            (rl.probe, first, rest)
        });

        let mut client = run_raw_client(client_io, version::TLS10, &[0x002F], &[]).await;
        client
            .rl
            .write_record(content_type::APPLICATION_DATA, &[b'G'])
            .await
            .unwrap();
        client
            .rl
            .write_record(content_type::APPLICATION_DATA, &[b'X'; 15])
            .await
            .unwrap();
        client.rl.flush().await.unwrap();

        let (probe, first, rest) = server.await.unwrap();
        assert!(probe.armed);
        assert_eq!(probe.first_record_len, Some(1));
        assert!(probe.splitting_detected());
        assert_eq!(first, vec![b'G']);
        assert_eq!(rest.len(), 15);
    }

    #[tokio::test]
    async fn probe_pin_priority_prefers_aes128() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server_config = config.clone();
        let server = tokio::spawn(async move {
            serve_handshake(server_io, &server_config).await.map(|e| e.negotiated_version)
        });
        // Client prefers AES-256 first; the pin still lands on 0x002F.
        let client = run_raw_client(client_io, version::TLS10, &[0x0035, 0x002F], &[]).await;
        assert_eq!(client.selected_suite, 0x002F);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tls12_static_rsa_works_and_does_not_arm_probe() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let est = serve_handshake(server_io, &server_config).await.unwrap();
            (est.capture, est.record_layer.probe)
        });
        let client = run_raw_client(
            client_io,
            version::TLS12,
            &[0x002F, 0x000A],
            &[
                (ext::SESSION_TICKET, vec![]),
                (ext::SUPPORTED_VERSIONS, vec![4, 0x03, 0x04, 0x03, 0x03]),
            ],
        )
        .await;
        assert_eq!(client.negotiated, version::TLS12);
        // Server preference: 0x002F sits ahead of 0x000A in the default list.
        assert_eq!(client.selected_suite, 0x002F);

        let (capture, probe) = server.await.unwrap();
        assert!(!probe.armed);
        assert_eq!(capture.cipher_suites, vec![0x002F, 0x000A]);
        assert!(capture.session_ticket);
        assert_eq!(capture.supported_versions, vec![0x0304, 0x0303]);
    }

    #[tokio::test]
    async fn ssl3_handshake_completes() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let est = serve_handshake(server_io, &server_config).await.unwrap();
            est.negotiated_version
        });
        // SSL 3.0 ClientKeyExchange omits the length prefix, so the raw
        // client differs; exercise it inline.
        let mut rl = RecordLayer::new(client_io);
        rl.set_write_version(version::SSL30);
        let mut transcript = Transcript::new();
        let client_random = [0x11u8; 32];
        let ch = build_client_hello(version::SSL30, &[0x002F], &[]);
        transcript.update(&ch);
        rl.write_record(content_type::HANDSHAKE, &ch).await.unwrap();
        rl.flush().await.unwrap();

        let (_, sh) = rl.read_handshake_message().await.unwrap();
        transcript.update(&sh);
        assert_eq!(u16::from_be_bytes([sh[4], sh[5]]), version::SSL30);
        let mut server_random = [0u8; 32];
        server_random.copy_from_slice(&sh[6..38]);
        let (_, cert_msg) = rl.read_handshake_message().await.unwrap();
        transcript.update(&cert_msg);
        let (_, shd) = rl.read_handshake_message().await.unwrap();
        transcript.update(&shd);

        let mut pms = vec![0u8; 48];
        OsRng.fill_bytes(&mut pms);
        pms[..2].copy_from_slice(&version::SSL30.to_be_bytes());
        let public = RsaPublicKey::new(test_key().n().clone(), test_key().e().clone()).unwrap();
        let encrypted = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &pms).unwrap();
        // Bare encrypted premaster: no length prefix in SSL 3.0.
        let mut cke = vec![handshake_type::CLIENT_KEY_EXCHANGE];
        cke.extend_from_slice(&(encrypted.len() as u32).to_be_bytes()[1..]);
        cke.extend_from_slice(&encrypted);
        transcript.update(&cke);
        rl.write_record(content_type::HANDSHAKE, &cke).await.unwrap();

        let params = SuiteParams::from_id(0x002F).unwrap();
        let master = master_secret(
            version::SSL30,
            params.prf_hash,
            &pms,
            &client_random,
            &server_random,
        );
        let keys = derive_direction_keys(
            version::SSL30,
            params,
            &master,
            &client_random,
            &server_random,
        );
        rl.write_record(content_type::CHANGE_CIPHER_SPEC, &[1]).await.unwrap();
        rl.activate_write(keys.client);
        let verify =
            transcript.finished_verify_data(version::SSL30, params.prf_hash, &master, true);
        assert_eq!(verify.len(), 36);
        let fin = encode_finished(&verify);
        transcript.update(&fin);
        rl.write_record(content_type::HANDSHAKE, &fin).await.unwrap();
        rl.flush().await.unwrap();

        rl.read_change_cipher_spec().await.unwrap();
        rl.activate_read(keys.server);
        let (t, server_fin) = rl.read_handshake_message().await.unwrap();
        assert_eq!(t, handshake_type::FINISHED);
        let expected =
            transcript.finished_verify_data(version::SSL30, params.prf_hash, &master, false);
        assert_eq!(&server_fin[4..], &expected[..]);

        assert_eq!(server.await.unwrap(), version::SSL30);
    }

    #[tokio::test]
    async fn tls13_only_client_gets_handshake_failure() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server_config = config.clone();
        let server = tokio::spawn(async move { serve_handshake(server_io, &server_config).await });

        let mut rl = RecordLayer::new(client_io);
        let ch = build_client_hello(version::TLS12, &[0x1301], &[]);
        rl.write_record(content_type::HANDSHAKE, &ch).await.unwrap();
        rl.flush().await.unwrap();
        let err = rl.read_record().await.unwrap_err();
        assert!(matches!(
            err,
            TlsError::HandshakeFailed(HandshakeFailure::PeerAlert(alert::HANDSHAKE_FAILURE))
        ));

        let server_err = server.await.unwrap().unwrap_err();
        assert!(matches!(
            server_err,
            TlsError::HandshakeFailed(HandshakeFailure::NoSharedSuite)
        ));
    }

    #[tokio::test]
    async fn malformed_supported_versions_fails_with_bad_extension() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server_config = config.clone();
        let server = tokio::spawn(async move { serve_handshake(server_io, &server_config).await });

        let mut rl = RecordLayer::new(client_io);
        let ch = build_client_hello(
            version::TLS12,
            &[0x002F],
            &[(ext::SUPPORTED_VERSIONS, vec![3, 0x03, 0x04, 0x03])],
        );
        rl.write_record(content_type::HANDSHAKE, &ch).await.unwrap();
        rl.flush().await.unwrap();
        let err = rl.read_record().await.unwrap_err();
        assert!(matches!(
            err,
            TlsError::HandshakeFailed(HandshakeFailure::PeerAlert(alert::ILLEGAL_PARAMETER))
        ));

        let server_err = server.await.unwrap().unwrap_err();
        assert!(matches!(
            server_err,
            TlsError::HandshakeFailed(HandshakeFailure::BadExtension)
        ));
    }

    #[tokio::test]
    async fn pre_ssl3_clients_are_refused() {
        let config = test_config();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server_config = config.clone();
        let server = tokio::spawn(async move { serve_handshake(server_io, &server_config).await });

        let mut rl = RecordLayer::new(client_io);
        let ch = build_client_hello(0x0002, &[0x002F], &[]);
        rl.write_record(content_type::HANDSHAKE, &ch).await.unwrap();
        rl.flush().await.unwrap();
        let err = rl.read_record().await.unwrap_err();
        assert!(matches!(
            err,
            TlsError::HandshakeFailed(HandshakeFailure::PeerAlert(alert::PROTOCOL_VERSION))
        ));
        assert!(matches!(
            server.await.unwrap().unwrap_err(),
            TlsError::HandshakeFailed(HandshakeFailure::UnsupportedVersion)
        ));
    }
}
