//! Record protection: MAC-then-encrypt stream and block modes plus the two
//! AEAD families, covering every suite in the negotiable table.

use aes::{Aes128, Aes256};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::ChaCha20Poly1305;
use des::TdesEde3;
use hmac::digest::KeyInit as MacKeyInit;
use hmac::{Hmac, Mac};
use md5::Digest;
use rand::rngs::OsRng;
use rand::RngCore;
use rc4::{consts::U16, Key as Rc4Key, Rc4, StreamCipher};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::TlsError;
use crate::suites::{BulkCipher, MacAlg, SuiteParams};
use tlsgauge_core::version;

const GCM_EXPLICIT_NONCE_LEN: usize = 8;
const AEAD_TAG_LEN: usize = 16;

/// Pseudo-header covered by the record MAC. SSL 3.0 leaves the protocol
/// version out.
fn mac_header(seq: u64, content_type: u8, record_version: u16, len: usize, ssl3: bool) -> Vec<u8> {
    let mut h = Vec::with_capacity(13);
    h.extend_from_slice(&seq.to_be_bytes());
    h.push(content_type);
    if !ssl3 {
        h.extend_from_slice(&record_version.to_be_bytes());
    }
    h.extend_from_slice(&(len as u16).to_be_bytes());
    h
}

pub(crate) enum MacKey {
    HmacSha1(Vec<u8>),
    HmacSha256(Vec<u8>),
    Ssl3Sha1(Vec<u8>),
}

impl MacKey {
    fn new(alg: MacAlg, negotiated: u16, key: &[u8]) -> Option<Self> {
        match alg {
            MacAlg::None => None,
            MacAlg::HmacSha1 if negotiated == version::SSL30 => Some(Self::Ssl3Sha1(key.to_vec())),
            MacAlg::HmacSha1 => Some(Self::HmacSha1(key.to_vec())),
            MacAlg::HmacSha256 => Some(Self::HmacSha256(key.to_vec())),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::HmacSha1(_) | Self::Ssl3Sha1(_) => 20,
            Self::HmacSha256(_) => 32,
        }
    }

    fn compute(&self, seq: u64, content_type: u8, record_version: u16, fragment: &[u8]) -> Vec<u8> {
        match self {
            Self::HmacSha1(key) => {
                let header = mac_header(seq, content_type, record_version, fragment.len(), false);
                let mut m = <Hmac<Sha1> as MacKeyInit>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                m.update(&header);
                m.update(fragment);
                m.finalize().into_bytes().to_vec()
            }
            Self::HmacSha256(key) => {
                let header = mac_header(seq, content_type, record_version, fragment.len(), false);
                let mut m = <Hmac<Sha256> as MacKeyInit>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                m.update(&header);
                m.update(fragment);
                m.finalize().into_bytes().to_vec()
            }
            Self::Ssl3Sha1(key) => {
                // hash(key || pad2 || hash(key || pad1 || seq || type || len || data))
                let header = mac_header(seq, content_type, record_version, fragment.len(), true);
                let mut inner = Sha1::new();
                inner.update(key);
                inner.update([0x36u8; 40]);
                inner.update(&header);
                inner.update(fragment);
                let inner = inner.finalize();
                let mut outer = Sha1::new();
                outer.update(key);
                outer.update([0x5Cu8; 40]);
                outer.update(inner);
                outer.finalize().to_vec()
            }
        }
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        match self {
            Self::HmacSha1(k) | Self::HmacSha256(k) | Self::Ssl3Sha1(k) => k.zeroize(),
        }
    }
}

enum Rc4State {
    Rc4(Rc4<U16>),
}

struct StreamState {
    cipher: Rc4State,
    mac: MacKey,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockAlg {
    Aes128,
    Aes256,
    TripleDes,
}

impl BlockAlg {
    fn block_size(self) -> usize {
        match self {
            BlockAlg::Aes128 | BlockAlg::Aes256 => 16,
            BlockAlg::TripleDes => 8,
        }
    }
}

struct BlockState {
    alg: BlockAlg,
    key: Vec<u8>,
    mac: MacKey,
    /// Running IV when the protocol chains IVs across records (SSL 3.0 and
    /// TLS 1.0). Unused once explicit per-record IVs apply.
    chained_iv: Vec<u8>,
    explicit_iv: bool,
    ssl3_padding: bool,
}

impl Drop for BlockState {
    fn drop(&mut self) {
        self.key.zeroize();
        self.chained_iv.zeroize();
    }
}

enum AeadAlg {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20(Box<ChaCha20Poly1305>),
}

struct AeadState {
    alg: AeadAlg,
    fixed_iv: Vec<u8>,
    /// GCM sends the 8-byte nonce on the wire; ChaCha20 derives it from the
    /// sequence number (RFC 7905).
    explicit_nonce: bool,
}

pub(crate) enum RecordCipher {
    Stream(StreamState),
    Block(BlockState),
    Aead(AeadState),
}

impl RecordCipher {
    /// Build one direction's protection from its key block slice.
    pub fn new(
        params: &SuiteParams,
        negotiated: u16,
        key: &[u8],
        iv: &[u8],
        mac_key: &[u8],
    ) -> Self {
        match params.cipher {
            BulkCipher::Rc4 => RecordCipher::Stream(StreamState {
                cipher: Rc4State::Rc4(Rc4::new(Rc4Key::<U16>::from_slice(key))),
                mac: MacKey::new(params.mac, negotiated, mac_key)
                    .expect("stream suites carry a MAC"),
            }),
            BulkCipher::TripleDesCbc | BulkCipher::Aes128Cbc | BulkCipher::Aes256Cbc => {
                let alg = match params.cipher {
                    BulkCipher::TripleDesCbc => BlockAlg::TripleDes,
                    BulkCipher::Aes128Cbc => BlockAlg::Aes128,
                    _ => BlockAlg::Aes256,
                };
                RecordCipher::Block(BlockState {
                    alg,
                    key: key.to_vec(),
                    mac: MacKey::new(params.mac, negotiated, mac_key)
                        .expect("block suites carry a MAC"),
                    chained_iv: iv.to_vec(),
                    explicit_iv: negotiated >= version::TLS11,
                    ssl3_padding: negotiated == version::SSL30,
                })
            }
            BulkCipher::Aes128Gcm => RecordCipher::Aead(AeadState {
                alg: AeadAlg::Aes128Gcm(Box::new(
                    Aes128Gcm::new_from_slice(key).expect("16-byte GCM key"),
                )),
                fixed_iv: iv.to_vec(),
                explicit_nonce: true,
            }),
            BulkCipher::Aes256Gcm => RecordCipher::Aead(AeadState {
                alg: AeadAlg::Aes256Gcm(Box::new(
                    Aes256Gcm::new_from_slice(key).expect("32-byte GCM key"),
                )),
                fixed_iv: iv.to_vec(),
                explicit_nonce: true,
            }),
            BulkCipher::ChaCha20Poly1305 => RecordCipher::Aead(AeadState {
                alg: AeadAlg::ChaCha20(Box::new(
                    ChaCha20Poly1305::new_from_slice(key).expect("32-byte ChaCha20 key"),
                )),
                fixed_iv: iv.to_vec(),
                explicit_nonce: false,
            }),
        }
    }

    pub fn seal(
        &mut self,
        seq: u64,
        content_type: u8,
        record_version: u16,
        plaintext: &[u8],
    ) -> Vec<u8> {
        match self {
            RecordCipher::Stream(s) => s.seal(seq, content_type, record_version, plaintext),
            RecordCipher::Block(b) => b.seal(seq, content_type, record_version, plaintext),
            RecordCipher::Aead(a) => a.seal(seq, content_type, record_version, plaintext),
        }
    }

    pub fn open(
        &mut self,
        seq: u64,
        content_type: u8,
        record_version: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        match self {
            RecordCipher::Stream(s) => s.open(seq, content_type, record_version, payload),
            RecordCipher::Block(b) => b.open(seq, content_type, record_version, payload),
            RecordCipher::Aead(a) => a.open(seq, content_type, record_version, payload),
        }
    }
}

impl StreamState {
    fn seal(&mut self, seq: u64, ct: u8, ver: u16, plaintext: &[u8]) -> Vec<u8> {
        let mac = self.mac.compute(seq, ct, ver, plaintext);
        let mut data = Vec::with_capacity(plaintext.len() + mac.len());
        data.extend_from_slice(plaintext);
        data.extend_from_slice(&mac);
        let Rc4State::Rc4(cipher) = &mut self.cipher;
        cipher.apply_keystream(&mut data);
        data
    }

    fn open(&mut self, seq: u64, ct: u8, ver: u16, payload: &[u8]) -> Result<Vec<u8>, TlsError> {
        let mac_len = self.mac.len();
        if payload.len() < mac_len {
            return Err(TlsError::bad_record());
        }
        let mut data = payload.to_vec();
        let Rc4State::Rc4(cipher) = &mut self.cipher;
        cipher.apply_keystream(&mut data);
        let (fragment, received_mac) = data.split_at(data.len() - mac_len);
        let expected = self.mac.compute(seq, ct, ver, fragment);
        if received_mac.ct_eq(&expected).unwrap_u8() == 0 {
            return Err(TlsError::bad_record());
        }
        Ok(fragment.to_vec())
    }
}

impl BlockState {
    fn encrypt(&self, iv: &[u8], data: &[u8]) -> Vec<u8> {
        match self.alg {
            BlockAlg::Aes128 => cbc::Encryptor::<Aes128>::new_from_slices(&self.key, iv)
                .expect("key and IV sizes fixed by suite")
                .encrypt_padded_vec_mut::<NoPadding>(data),
            BlockAlg::Aes256 => cbc::Encryptor::<Aes256>::new_from_slices(&self.key, iv)
                .expect("key and IV sizes fixed by suite")
                .encrypt_padded_vec_mut::<NoPadding>(data),
            BlockAlg::TripleDes => cbc::Encryptor::<TdesEde3>::new_from_slices(&self.key, iv)
                .expect("key and IV sizes fixed by suite")
                .encrypt_padded_vec_mut::<NoPadding>(data),
        }
    }

    fn decrypt(&self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, TlsError> {
        let out = match self.alg {
            BlockAlg::Aes128 => cbc::Decryptor::<Aes128>::new_from_slices(&self.key, iv)
                .expect("key and IV sizes fixed by suite")
                .decrypt_padded_vec_mut::<NoPadding>(data),
            BlockAlg::Aes256 => cbc::Decryptor::<Aes256>::new_from_slices(&self.key, iv)
                .expect("key and IV sizes fixed by suite")
                .decrypt_padded_vec_mut::<NoPadding>(data),
            BlockAlg::TripleDes => cbc::Decryptor::<TdesEde3>::new_from_slices(&self.key, iv)
                .expect("key and IV sizes fixed by suite")
                .decrypt_padded_vec_mut::<NoPadding>(data),
        };
        out.map_err(|_| TlsError::bad_record())
    }

    fn seal(&mut self, seq: u64, ct: u8, ver: u16, plaintext: &[u8]) -> Vec<u8> {
        let block = self.alg.block_size();
        let mac = self.mac.compute(seq, ct, ver, plaintext);

        let mut data = Vec::with_capacity(plaintext.len() + mac.len() + block);
        data.extend_from_slice(plaintext);
        data.extend_from_slice(&mac);
        let pad_total = block - data.len() % block;
        let pad_byte = (pad_total - 1) as u8;
        if self.ssl3_padding {
            // SSL 3.0 pad bytes are arbitrary; only the count byte matters.
            data.resize(data.len() + pad_total - 1, 0);
            data.push(pad_byte);
        } else {
            data.resize(data.len() + pad_total, pad_byte);
        }

        if self.explicit_iv {
            let mut iv = vec![0u8; block];
            OsRng.fill_bytes(&mut iv);
            let ciphertext = self.encrypt(&iv, &data);
            let mut out = iv;
            out.extend_from_slice(&ciphertext);
            out
        } else {
            let ciphertext = self.encrypt(&self.chained_iv.clone(), &data);
            self.chained_iv
                .copy_from_slice(&ciphertext[ciphertext.len() - block..]);
            ciphertext
        }
    }

    fn open(&mut self, seq: u64, ct: u8, ver: u16, payload: &[u8]) -> Result<Vec<u8>, TlsError> {
        let block = self.alg.block_size();
        let mac_len = self.mac.len();

        let (iv, ciphertext): (Vec<u8>, &[u8]) = if self.explicit_iv {
            if payload.len() < block {
                return Err(TlsError::bad_record());
            }
            (payload[..block].to_vec(), &payload[block..])
        } else {
            let iv = self.chained_iv.clone();
            if payload.len() >= block {
                self.chained_iv
                    .copy_from_slice(&payload[payload.len() - block..]);
            }
            (iv, payload)
        };

        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(TlsError::bad_record());
        }
        let data = self.decrypt(&iv, ciphertext)?;

        let pad_byte = *data.last().ok_or_else(TlsError::bad_record)? as usize;
        if data.len() < pad_byte + 1 + mac_len {
            return Err(TlsError::bad_record());
        }
        if self.ssl3_padding {
            if pad_byte + 1 > block {
                return Err(TlsError::bad_record());
            }
        } else {
            let pad_region = &data[data.len() - pad_byte - 1..];
            let reference = vec![pad_byte as u8; pad_byte + 1];
            if pad_region.ct_eq(&reference).unwrap_u8() == 0 {
                return Err(TlsError::bad_record());
            }
        }

        let unpadded = &data[..data.len() - pad_byte - 1];
        let (fragment, received_mac) = unpadded.split_at(unpadded.len() - mac_len);
        let expected = self.mac.compute(seq, ct, ver, fragment);
        if received_mac.ct_eq(&expected).unwrap_u8() == 0 {
            return Err(TlsError::bad_record());
        }
        Ok(fragment.to_vec())
    }
}

impl AeadState {
    fn nonce(&self, seq: u64, explicit: Option<&[u8]>) -> Vec<u8> {
        if self.explicit_nonce {
            let mut nonce = self.fixed_iv.clone();
            match explicit {
                Some(bytes) => nonce.extend_from_slice(bytes),
                None => nonce.extend_from_slice(&seq.to_be_bytes()),
            }
            nonce
        } else {
            let mut nonce = self.fixed_iv.clone();
            let seq_bytes = seq.to_be_bytes();
            for (n, s) in nonce[4..].iter_mut().zip(seq_bytes) {
                *n ^= s;
            }
            nonce
        }
    }

    fn run(&self, nonce: &[u8], payload: Payload<'_, '_>, encrypt: bool) -> Result<Vec<u8>, TlsError> {
        let nonce = GenericArray::from_slice(nonce);
        let result = match &self.alg {
            AeadAlg::Aes128Gcm(c) => {
                if encrypt {
                    c.encrypt(nonce, payload)
                } else {
                    c.decrypt(nonce, payload)
                }
            }
            AeadAlg::Aes256Gcm(c) => {
                if encrypt {
                    c.encrypt(nonce, payload)
                } else {
                    c.decrypt(nonce, payload)
                }
            }
            AeadAlg::ChaCha20(c) => {
                if encrypt {
                    c.encrypt(nonce, payload)
                } else {
                    c.decrypt(nonce, payload)
                }
            }
        };
        result.map_err(|_| TlsError::bad_record())
    }

    fn seal(&mut self, seq: u64, ct: u8, ver: u16, plaintext: &[u8]) -> Vec<u8> {
        let aad = mac_header(seq, ct, ver, plaintext.len(), false);
        let nonce = self.nonce(seq, None);
        let sealed = self
            .run(&nonce, Payload { msg: plaintext, aad: &aad }, true)
            .expect("AEAD encryption cannot fail");
        if self.explicit_nonce {
            let mut out = Vec::with_capacity(GCM_EXPLICIT_NONCE_LEN + sealed.len());
            out.extend_from_slice(&seq.to_be_bytes());
            out.extend_from_slice(&sealed);
            out
        } else {
            sealed
        }
    }

    fn open(&mut self, seq: u64, ct: u8, ver: u16, payload: &[u8]) -> Result<Vec<u8>, TlsError> {
        let (nonce, ciphertext) = if self.explicit_nonce {
            if payload.len() < GCM_EXPLICIT_NONCE_LEN + AEAD_TAG_LEN {
                return Err(TlsError::bad_record());
            }
            let (explicit, rest) = payload.split_at(GCM_EXPLICIT_NONCE_LEN);
            (self.nonce(seq, Some(explicit)), rest)
        } else {
            if payload.len() < AEAD_TAG_LEN {
                return Err(TlsError::bad_record());
            }
            (self.nonce(seq, None), payload)
        };
        let plaintext_len = ciphertext.len() - AEAD_TAG_LEN;
        let aad = mac_header(seq, ct, ver, plaintext_len, false);
        self.run(&nonce, Payload { msg: ciphertext, aad: &aad }, false)
    }
}
