//! Parameters for the cipher suites this server can actually negotiate.
//!
//! Distinct from the catalogue in `tlsgauge-core`: that table names every
//! suite a client might mention, this one describes the deliberately
//! permissive set we terminate, modern AEAD suites next to RC4 and 3DES.

use crate::prf::PrfHash;
use tlsgauge_core::version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyExchangeAlg {
    /// Static RSA: client encrypts the premaster to the certificate key.
    Rsa,
    /// Ephemeral ECDH signed with the server's RSA key.
    EcdheRsa,
    /// Ephemeral ECDH signed with an ECDSA key. Listed for configuration
    /// parity but skipped during selection while the serving key is RSA.
    EcdheEcdsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BulkCipher {
    Rc4,
    TripleDesCbc,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MacAlg {
    /// AEAD suites carry no separate MAC.
    None,
    HmacSha1,
    HmacSha256,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SuiteParams {
    pub id: u16,
    pub kx: KeyExchangeAlg,
    pub cipher: BulkCipher,
    pub mac: MacAlg,
    pub prf_hash: PrfHash,
    /// Oldest protocol version the suite is defined for.
    pub min_version: u16,
}

impl SuiteParams {
    pub fn from_id(id: u16) -> Option<&'static SuiteParams> {
        NEGOTIABLE.iter().find(|p| p.id == id)
    }

    pub fn key_len(&self) -> usize {
        match self.cipher {
            BulkCipher::Rc4 | BulkCipher::Aes128Cbc | BulkCipher::Aes128Gcm => 16,
            BulkCipher::TripleDesCbc => 24,
            BulkCipher::Aes256Cbc | BulkCipher::Aes256Gcm | BulkCipher::ChaCha20Poly1305 => 32,
        }
    }

    /// IV bytes taken from the key block: the CBC block size, the 4-byte GCM
    /// salt, the full 12-byte ChaCha20 nonce, nothing for RC4.
    pub fn fixed_iv_len(&self) -> usize {
        match self.cipher {
            BulkCipher::Rc4 => 0,
            BulkCipher::TripleDesCbc => 8,
            BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc => 16,
            BulkCipher::Aes128Gcm | BulkCipher::Aes256Gcm => 4,
            BulkCipher::ChaCha20Poly1305 => 12,
        }
    }

    pub fn mac_key_len(&self) -> usize {
        match self.mac {
            MacAlg::None => 0,
            MacAlg::HmacSha1 => 20,
            MacAlg::HmacSha256 => 32,
        }
    }

    pub fn key_material_len(&self) -> usize {
        2 * (self.mac_key_len() + self.key_len() + self.fixed_iv_len())
    }
}

macro_rules! suite {
    ($id:expr, $kx:ident, $cipher:ident, $mac:ident, $prf:ident, $min:expr) => {
        SuiteParams {
            id: $id,
            kx: KeyExchangeAlg::$kx,
            cipher: BulkCipher::$cipher,
            mac: MacAlg::$mac,
            prf_hash: PrfHash::$prf,
            min_version: $min,
        }
    };
}

static NEGOTIABLE: &[SuiteParams] = &[
    suite!(0xCCA9, EcdheEcdsa, ChaCha20Poly1305, None, Sha256, version::TLS12),
    suite!(0xCCA8, EcdheRsa, ChaCha20Poly1305, None, Sha256, version::TLS12),
    suite!(0xC02F, EcdheRsa, Aes128Gcm, None, Sha256, version::TLS12),
    suite!(0xC02B, EcdheEcdsa, Aes128Gcm, None, Sha256, version::TLS12),
    suite!(0xC030, EcdheRsa, Aes256Gcm, None, Sha384, version::TLS12),
    suite!(0xC02C, EcdheEcdsa, Aes256Gcm, None, Sha384, version::TLS12),
    suite!(0xC011, EcdheRsa, Rc4, HmacSha1, Sha256, version::TLS10),
    suite!(0xC007, EcdheEcdsa, Rc4, HmacSha1, Sha256, version::TLS10),
    suite!(0xC013, EcdheRsa, Aes128Cbc, HmacSha1, Sha256, version::TLS10),
    suite!(0xC009, EcdheEcdsa, Aes128Cbc, HmacSha1, Sha256, version::TLS10),
    suite!(0xC023, EcdheEcdsa, Aes128Cbc, HmacSha256, Sha256, version::TLS12),
    suite!(0xC014, EcdheRsa, Aes256Cbc, HmacSha1, Sha256, version::TLS10),
    suite!(0xC027, EcdheRsa, Aes128Cbc, HmacSha256, Sha256, version::TLS12),
    suite!(0xC00A, EcdheEcdsa, Aes256Cbc, HmacSha1, Sha256, version::TLS10),
    suite!(0x009C, Rsa, Aes128Gcm, None, Sha256, version::TLS12),
    suite!(0x009D, Rsa, Aes256Gcm, None, Sha384, version::TLS12),
    suite!(0x0005, Rsa, Rc4, HmacSha1, Sha256, version::SSL30),
    suite!(0x002F, Rsa, Aes128Cbc, HmacSha1, Sha256, version::SSL30),
    suite!(0x003C, Rsa, Aes128Cbc, HmacSha256, Sha256, version::TLS12),
    suite!(0x0035, Rsa, Aes256Cbc, HmacSha1, Sha256, version::SSL30),
    suite!(0xC012, EcdheRsa, TripleDesCbc, HmacSha1, Sha256, version::TLS10),
    suite!(0x000A, Rsa, TripleDesCbc, HmacSha1, Sha256, version::SSL30),
];

/// Default serving order: modern AEAD suites first, then the weak suites we
/// accept on purpose, 3DES last.
pub const DEFAULT_SERVER_SUITES: &[u16] = &[
    0xCCA9, 0xCCA8, 0xC02F, 0xC02B, 0xC030, 0xC02C, 0xC011, 0xC007, 0xC013, 0xC009, 0xC023,
    0xC014, 0xC027, 0xC00A, 0x009C, 0x009D, 0x0005, 0x002F, 0x003C, 0x0035, 0xC012, 0x000A,
];

/// Static RSA CBC suites whose selection arms the record-splitting probe, in
/// pin priority order. Kept to exactly these three; ECDHE CBC suites at
/// TLS 1.0 do not arm it.
pub(crate) const BEAST_PROBE_SUITES: &[u16] = &[0x002F, 0x0035, 0x003C];
