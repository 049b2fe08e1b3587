//! Handshake message encoding and decoding.
//!
//! Hand-rolled rather than delegated to a parser crate: the engine has to
//! keep parsing mid-handshake, reject precisely the malformations the
//! protocol calls out, and retain fields a fingerprinting parser would
//! normalise away.

use crate::error::TlsError;

pub(crate) mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
}

pub(crate) mod handshake_type {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
}

pub(crate) mod ext {
    pub const SUPPORTED_GROUPS: u16 = 10;
    pub const EC_POINT_FORMATS: u16 = 11;
    pub const SIGNATURE_ALGORITHMS: u16 = 13;
    pub const EXTENDED_MASTER_SECRET: u16 = 23;
    pub const SESSION_TICKET: u16 = 35;
    pub const SUPPORTED_VERSIONS: u16 = 43;
    pub const RENEGOTIATION_INFO: u16 = 0xFF01;
}

pub(crate) mod alert {
    pub const CLOSE_NOTIFY: u8 = 0;
    pub const BAD_RECORD_MAC: u8 = 20;
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const ILLEGAL_PARAMETER: u8 = 47;
    pub const DECODE_ERROR: u8 = 50;
    pub const PROTOCOL_VERSION: u8 = 70;
    pub const INTERNAL_ERROR: u8 = 80;

    pub const LEVEL_WARNING: u8 = 1;
    pub const LEVEL_FATAL: u8 = 2;
}

/// The renegotiation SCSV occupies a suite code point, not an extension.
pub(crate) const RENEGOTIATION_SCSV: u16 = 0x00FF;

/// Cursor over a message body. Every accessor fails with `BadRecord` on
/// truncation; nothing panics on attacker input.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], TlsError> {
        if self.remaining() < n {
            return Err(TlsError::bad_record());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, TlsError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, TlsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Slice prefixed by a one-byte length.
    pub fn vec8(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// Slice prefixed by a two-byte length.
    pub fn vec16(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn expect_done(&self) -> Result<(), TlsError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(TlsError::bad_record())
        }
    }
}

fn u16s(bytes: &[u8]) -> Result<Vec<u16>, TlsError> {
    if bytes.len() % 2 != 0 {
        return Err(TlsError::bad_record());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// A parsed ClientHello, keeping both the wire-verbatim lists the snapshot
/// needs and the negotiation inputs the handshake needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientHello {
    pub client_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,

    pub session_ticket: bool,
    pub supported_versions: Vec<u16>,
    pub supported_groups: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub extended_master_secret: bool,
    pub renegotiation_info: bool,
}

impl ClientHello {
    pub fn offers_renegotiation_protection(&self) -> bool {
        self.renegotiation_info || self.cipher_suites.contains(&RENEGOTIATION_SCSV)
    }
}

/// Decode a ClientHello body (handshake header already stripped).
pub(crate) fn decode_client_hello(body: &[u8]) -> Result<ClientHello, TlsError> {
    let mut r = Reader::new(body);
    let mut ch = ClientHello {
        client_version: r.u16()?,
        ..ClientHello::default()
    };
    ch.random.copy_from_slice(r.take(32)?);

    let session_id = r.vec8()?;
    if session_id.len() > 32 {
        return Err(TlsError::bad_record());
    }
    ch.session_id = session_id.to_vec();

    let suites = r.vec16()?;
    if suites.is_empty() || suites.len() % 2 != 0 {
        return Err(TlsError::bad_record());
    }
    ch.cipher_suites = u16s(suites)?;

    let compressions = r.vec8()?;
    if compressions.is_empty() {
        return Err(TlsError::bad_record());
    }
    ch.compression_methods = compressions.to_vec();

    // SSL 3.0 hellos legitimately stop here.
    if r.remaining() == 0 {
        return Ok(ch);
    }

    let extensions = r.vec16()?;
    r.expect_done()?;
    let mut er = Reader::new(extensions);
    while er.remaining() > 0 {
        let ext_type = er.u16()?;
        let ext_body = er.vec16()?;
        match ext_type {
            ext::SESSION_TICKET => ch.session_ticket = true,
            ext::SUPPORTED_VERSIONS => {
                // One-byte list length, then 16-bit versions. Parsed whatever
                // the negotiated version ends up being; reject odd or
                // mismatched lengths outright.
                let mut vr = Reader::new(ext_body);
                let list = vr.vec8().map_err(|_| TlsError::bad_extension())?;
                if vr.remaining() != 0 || list.len() % 2 != 0 {
                    return Err(TlsError::bad_extension());
                }
                ch.supported_versions = u16s(list).map_err(|_| TlsError::bad_extension())?;
            }
            ext::SUPPORTED_GROUPS => {
                let mut gr = Reader::new(ext_body);
                ch.supported_groups = u16s(gr.vec16()?)?;
                gr.expect_done()?;
            }
            ext::SIGNATURE_ALGORITHMS => {
                let mut sr = Reader::new(ext_body);
                ch.signature_algorithms = u16s(sr.vec16()?)?;
                sr.expect_done()?;
            }
            ext::EC_POINT_FORMATS => {
                let mut pr = Reader::new(ext_body);
                ch.ec_point_formats = pr.vec8()?.to_vec();
                pr.expect_done()?;
            }
            ext::EXTENDED_MASTER_SECRET => ch.extended_master_secret = true,
            ext::RENEGOTIATION_INFO => ch.renegotiation_info = true,
            _ => {} // skipped by length
        }
    }

    Ok(ch)
}

/// Append a handshake message (type + 24-bit length + body) to `out`.
fn put_handshake(out: &mut Vec<u8>, msg_type: u8, body: &[u8]) {
    out.push(msg_type);
    let len = body.len() as u32;
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(body);
}

pub(crate) struct ServerHello {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    /// (type, body) pairs, already encoded.
    pub extensions: Vec<(u16, Vec<u8>)>,
}

pub(crate) fn encode_server_hello(sh: &ServerHello) -> Vec<u8> {
    let mut body = Vec::with_capacity(48);
    body.extend_from_slice(&sh.version.to_be_bytes());
    body.extend_from_slice(&sh.random);
    body.push(sh.session_id.len() as u8);
    body.extend_from_slice(&sh.session_id);
    body.extend_from_slice(&sh.cipher_suite.to_be_bytes());
    body.push(0); // null compression
    if !sh.extensions.is_empty() {
        let mut exts = Vec::new();
        for (ext_type, ext_body) in &sh.extensions {
            exts.extend_from_slice(&ext_type.to_be_bytes());
            exts.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
            exts.extend_from_slice(ext_body);
        }
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);
    }
    let mut msg = Vec::with_capacity(body.len() + 4);
    put_handshake(&mut msg, handshake_type::SERVER_HELLO, &body);
    msg
}

pub(crate) fn encode_certificate(chain: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = chain.iter().map(|c| c.len() + 3).sum();
    let mut body = Vec::with_capacity(total + 3);
    body.extend_from_slice(&(total as u32).to_be_bytes()[1..]);
    for cert in chain {
        body.extend_from_slice(&(cert.len() as u32).to_be_bytes()[1..]);
        body.extend_from_slice(cert);
    }
    let mut msg = Vec::new();
    put_handshake(&mut msg, handshake_type::CERTIFICATE, &body);
    msg
}

/// ECDHE ServerKeyExchange parameters: named-curve form only.
pub(crate) fn ske_params(named_curve: u16, public_point: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(4 + public_point.len());
    params.push(3); // curve_type: named_curve
    params.extend_from_slice(&named_curve.to_be_bytes());
    params.push(public_point.len() as u8);
    params.extend_from_slice(public_point);
    params
}

/// Assemble the full ServerKeyExchange message. `signature_algorithm` is the
/// TLS 1.2 (hash, signature) pair; below TLS 1.2 the field is absent.
pub(crate) fn encode_server_key_exchange(
    params: &[u8],
    signature_algorithm: Option<u16>,
    signature: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(params.len() + signature.len() + 4);
    body.extend_from_slice(params);
    if let Some(alg) = signature_algorithm {
        body.extend_from_slice(&alg.to_be_bytes());
    }
    body.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    body.extend_from_slice(signature);
    let mut msg = Vec::new();
    put_handshake(&mut msg, handshake_type::SERVER_KEY_EXCHANGE, &body);
    msg
}

pub(crate) fn encode_server_hello_done() -> Vec<u8> {
    let mut msg = Vec::new();
    put_handshake(&mut msg, handshake_type::SERVER_HELLO_DONE, &[]);
    msg
}

pub(crate) fn encode_finished(verify_data: &[u8]) -> Vec<u8> {
    let mut msg = Vec::new();
    put_handshake(&mut msg, handshake_type::FINISHED, verify_data);
    msg
}

pub(crate) enum ClientKeyExchange {
    /// RSA-encrypted premaster secret.
    Rsa(Vec<u8>),
    /// Client's ephemeral public point.
    Ecdh(Vec<u8>),
}

/// Decode a ClientKeyExchange body. The RSA form carries a two-byte length
/// prefix from TLS 1.0 on but not in SSL 3.0.
pub(crate) fn decode_client_key_exchange(
    body: &[u8],
    rsa_kx: bool,
    ssl3: bool,
) -> Result<ClientKeyExchange, TlsError> {
    let mut r = Reader::new(body);
    if rsa_kx {
        let encrypted = if ssl3 { r.take(r.remaining())? } else { r.vec16()? };
        r.expect_done()?;
        if encrypted.is_empty() {
            return Err(TlsError::bad_record());
        }
        Ok(ClientKeyExchange::Rsa(encrypted.to_vec()))
    } else {
        let point = r.vec8()?;
        r.expect_done()?;
        if point.is_empty() {
            return Err(TlsError::bad_record());
        }
        Ok(ClientKeyExchange::Ecdh(point.to_vec()))
    }
}
