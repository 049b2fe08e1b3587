//! Key derivation for SSL 3.0 through TLS 1.2.
//!
//! Three generations coexist: the SSL 3.0 MD5/SHA1 construction, the
//! TLS 1.0/1.1 split PRF (P_MD5 xor P_SHA1 over the two halves of the
//! secret), and the TLS 1.2 PRF over the suite's hash. The transcript keeps
//! all four digests running because the Finished computation only learns
//! which one it needs after version and suite negotiation.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::{Sha256, Sha384};

use tlsgauge_core::version;

/// Hash backing the TLS 1.2 PRF for the negotiated suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrfHash {
    Sha256,
    Sha384,
}

const SSL3_SENDER_CLIENT: &[u8; 4] = b"CLNT";
const SSL3_SENDER_SERVER: &[u8; 4] = b"SRVR";

fn mac_of<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut m = <M as KeyInit>::new_from_slice(key).expect("HMAC accepts any key length");
    for p in parts {
        m.update(p);
    }
    m.finalize().into_bytes().to_vec()
}

fn p_hash<M: Mac + KeyInit>(secret: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len);
    let mut a = mac_of::<M>(secret, &[seed]);
    while out.len() < out_len {
        let block = mac_of::<M>(secret, &[&a, seed]);
        let take = block.len().min(out_len - out.len());
        out.extend_from_slice(&block[..take]);
        a = mac_of::<M>(secret, &[&a]);
    }
    out
}

/// TLS 1.0/1.1 PRF: secret split into overlapping halves, MD5 and SHA1
/// streams xored together.
fn prf_legacy(secret: &[u8], label_seed: &[u8], out_len: usize) -> Vec<u8> {
    let half = secret.len().div_ceil(2);
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];
    let md5_stream = p_hash::<Hmac<Md5>>(s1, label_seed, out_len);
    let sha_stream = p_hash::<Hmac<Sha1>>(s2, label_seed, out_len);
    md5_stream
        .into_iter()
        .zip(sha_stream)
        .map(|(a, b)| a ^ b)
        .collect()
}

/// The TLS PRF for `tls_version` >= TLS 1.0.
pub(crate) fn prf(
    tls_version: u16,
    hash: PrfHash,
    secret: &[u8],
    label: &str,
    seed: &[u8],
    out_len: usize,
) -> Vec<u8> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label.as_bytes());
    label_seed.extend_from_slice(seed);
    if tls_version >= version::TLS12 {
        match hash {
            PrfHash::Sha256 => p_hash::<Hmac<Sha256>>(secret, &label_seed, out_len),
            PrfHash::Sha384 => p_hash::<Hmac<Sha384>>(secret, &label_seed, out_len),
        }
    } else {
        prf_legacy(secret, &label_seed, out_len)
    }
}

/// SSL 3.0 derivation: block i is MD5(secret || SHA1(salt_i || secret || r1 || r2))
/// with salt_i the letter 'A'+i repeated i+1 times.
fn ssl3_kdf(secret: &[u8], r1: &[u8], r2: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + 16);
    let mut i = 0u8;
    while out.len() < out_len {
        let salt = vec![b'A' + i; i as usize + 1];
        let mut sha = Sha1::new();
        sha.update(&salt);
        sha.update(secret);
        sha.update(r1);
        sha.update(r2);
        let inner = sha.finalize();
        let mut md5 = Md5::new();
        md5.update(secret);
        md5.update(inner);
        out.extend_from_slice(&md5.finalize());
        i += 1;
    }
    out.truncate(out_len);
    out
}

/// Premaster -> master secret, full handshake.
pub(crate) fn master_secret(
    negotiated: u16,
    hash: PrfHash,
    premaster: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Vec<u8> {
    if negotiated == version::SSL30 {
        return ssl3_kdf(premaster, client_random, server_random, 48);
    }
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    prf(negotiated, hash, premaster, "master secret", &seed, 48)
}

/// Premaster -> master secret under RFC 7627 extended master secret.
pub(crate) fn extended_master_secret(
    negotiated: u16,
    hash: PrfHash,
    premaster: &[u8],
    session_hash: &[u8],
) -> Vec<u8> {
    prf(
        negotiated,
        hash,
        premaster,
        "extended master secret",
        session_hash,
        48,
    )
}

/// Master secret -> key block. Note the random order flips relative to the
/// master derivation.
pub(crate) fn key_block(
    negotiated: u16,
    hash: PrfHash,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    out_len: usize,
) -> Vec<u8> {
    if negotiated == version::SSL30 {
        return ssl3_kdf(master, server_random, client_random, out_len);
    }
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    prf(negotiated, hash, master, "key expansion", &seed, out_len)
}

/// Running hash of every handshake message, all digests in parallel.
#[derive(Clone)]
pub(crate) struct Transcript {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha384: Sha384,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha384: Sha384::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha384.update(data);
    }

    /// The handshake hash as the negotiated version defines it: MD5 || SHA1
    /// below TLS 1.2, the PRF hash at TLS 1.2. Also serves as the RFC 7627
    /// session hash.
    pub fn handshake_hash(&self, negotiated: u16, hash: PrfHash) -> Vec<u8> {
        if negotiated >= version::TLS12 {
            match hash {
                PrfHash::Sha256 => self.sha256.clone().finalize().to_vec(),
                PrfHash::Sha384 => self.sha384.clone().finalize().to_vec(),
            }
        } else {
            let mut out = Vec::with_capacity(36);
            out.extend_from_slice(&self.md5.clone().finalize());
            out.extend_from_slice(&self.sha1.clone().finalize());
            out
        }
    }

    /// SSL 3.0 Finished hash: both digests continued over the sender tag,
    /// the master secret and the inner pad, then wrapped once more.
    fn ssl3_finished(&self, master: &[u8], sender: &[u8; 4]) -> Vec<u8> {
        let mut md5 = self.md5.clone();
        md5.update(sender);
        md5.update(master);
        md5.update([0x36u8; 48]);
        let md5_inner = md5.finalize();
        let mut md5_outer = Md5::new();
        md5_outer.update(master);
        md5_outer.update([0x5Cu8; 48]);
        md5_outer.update(md5_inner);

        let mut sha = self.sha1.clone();
        sha.update(sender);
        sha.update(master);
        sha.update([0x36u8; 40]);
        let sha_inner = sha.finalize();
        let mut sha_outer = Sha1::new();
        sha_outer.update(master);
        sha_outer.update([0x5Cu8; 40]);
        sha_outer.update(sha_inner);

        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(&md5_outer.finalize());
        out.extend_from_slice(&sha_outer.finalize());
        out
    }

    /// The Finished verify_data for either side at the current transcript
    /// point: 12 PRF bytes for TLS, the 36-byte construction for SSL 3.0.
    pub fn finished_verify_data(
        &self,
        negotiated: u16,
        hash: PrfHash,
        master: &[u8],
        from_client: bool,
    ) -> Vec<u8> {
        if negotiated == version::SSL30 {
            let sender = if from_client {
                SSL3_SENDER_CLIENT
            } else {
                SSL3_SENDER_SERVER
            };
            return self.ssl3_finished(master, sender);
        }
        let label = if from_client {
            "client finished"
        } else {
            "server finished"
        };
        let transcript_hash = self.handshake_hash(negotiated, hash);
        prf(negotiated, hash, master, label, &transcript_hash, 12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prf_output_length_is_exact() {
        for len in [1, 12, 31, 32, 33, 48, 104, 136] {
            let out = prf(version::TLS12, PrfHash::Sha256, b"secret", "test", b"seed", len);
            assert_eq!(out.len(), len);
        }
    }

    #[test]
    fn prf_is_deterministic_and_label_sensitive() {
        let a = prf(version::TLS12, PrfHash::Sha256, b"s", "master secret", b"r", 48);
        let b = prf(version::TLS12, PrfHash::Sha256, b"s", "master secret", b"r", 48);
        let c = prf(version::TLS12, PrfHash::Sha256, b"s", "key expansion", b"r", 48);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn versions_use_distinct_prfs() {
        let tls10 = prf(version::TLS10, PrfHash::Sha256, b"s", "l", b"r", 48);
        let tls12 = prf(version::TLS12, PrfHash::Sha256, b"s", "l", b"r", 48);
        assert_ne!(tls10, tls12);
        // TLS 1.0 and 1.1 share the split PRF.
        let tls11 = prf(version::TLS11, PrfHash::Sha256, b"s", "l", b"r", 48);
        assert_eq!(tls10, tls11);
    }

    #[test]
    fn master_secret_is_48_bytes_for_every_version() {
        let pms = [0x11u8; 48];
        let cr = [1u8; 32];
        let sr = [2u8; 32];
        for v in [version::SSL30, version::TLS10, version::TLS11, version::TLS12] {
            let ms = master_secret(v, PrfHash::Sha256, &pms, &cr, &sr);
            assert_eq!(ms.len(), 48, "version {v:#06x}");
        }
    }

    #[test]
    fn key_block_random_order_differs_from_master() {
        let master = [0x22u8; 48];
        let cr = [1u8; 32];
        let sr = [2u8; 32];
        let kb = key_block(version::TLS12, PrfHash::Sha256, &master, &cr, &sr, 104);
        assert_eq!(kb.len(), 104);
        // Swapping the randoms must change the output.
        let swapped = key_block(version::TLS12, PrfHash::Sha256, &master, &sr, &cr, 104);
        assert_ne!(kb, swapped);
    }

    #[test]
    fn ssl3_kdf_produces_requested_length() {
        let kb = key_block(version::SSL30, PrfHash::Sha256, &[3u8; 48], &[1; 32], &[2; 32], 136);
        assert_eq!(kb.len(), 136);
    }

    #[test]
    fn finished_sizes_match_the_protocol_generation() {
        let mut t = Transcript::new();
        t.update(b"client hello bytes");
        let master = [9u8; 48];
        let ssl3 = t.finished_verify_data(version::SSL30, PrfHash::Sha256, &master, true);
        assert_eq!(ssl3.len(), 36);
        let tls = t.finished_verify_data(version::TLS12, PrfHash::Sha256, &master, true);
        assert_eq!(tls.len(), 12);
    }

    #[test]
    fn finished_distinguishes_directions() {
        let mut t = Transcript::new();
        t.update(b"hello");
        let master = [9u8; 48];
        for v in [version::SSL30, version::TLS10, version::TLS12] {
            let client = t.finished_verify_data(v, PrfHash::Sha256, &master, true);
            let server = t.finished_verify_data(v, PrfHash::Sha256, &master, false);
            assert_ne!(client, server, "version {v:#06x}");
        }
    }

    #[test]
    fn transcript_hash_tracks_updates() {
        let mut a = Transcript::new();
        let mut b = Transcript::new();
        a.update(b"one");
        b.update(b"one");
        assert_eq!(
            a.handshake_hash(version::TLS12, PrfHash::Sha256),
            b.handshake_hash(version::TLS12, PrfHash::Sha256)
        );
        b.update(b"two");
        assert_ne!(
            a.handshake_hash(version::TLS12, PrfHash::Sha256),
            b.handshake_hash(version::TLS12, PrfHash::Sha256)
        );
        // Pre-1.2 hash is the 36-byte MD5||SHA1 concatenation.
        assert_eq!(a.handshake_hash(version::TLS10, PrfHash::Sha256).len(), 36);
    }
}
