//! The per-connection report returned to clients.

use std::collections::BTreeMap;

use serde::Serialize;

// The reason sentences are part of the public API: downstream consumers match
// on them, so they must stay byte-for-byte stable.
pub const FEW_BIT_REASON: &str = "The cipher uses broken encryption algorithms.";
pub const NULL_REASON: &str = "The cipher specifies that no encryption should be used on the connection, therefore the cipher provides no data confidentiality.";
pub const NULL_AUTH_REASON: &str = "The cipher specifies that no authentication should be used on the connection, therefore the cipher provides no data integrity guarantees.";
pub const RC4_REASON: &str = "The cipher uses the broken RC4 encryption algorithm.";
pub const SWEET32_REASON: &str = "The cipher uses the broken 3DES encryption algorithm in a way that makes it highly vulnerable to the Sweet32 attack.";
pub const CBC_REASON: &str = "The cipher uses cipher block chaining (CBC) mode, which is often implemented improperly, leading to padding oracle attacks.";
pub const NO_EPHEMERAL_REASON: &str = "The cipher does not support ephemeral keys. Use of ephemeral keys greatly improves data confidentiality by generating keys that only last for the duration of the connection.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rating {
    #[serde(rename = "excellent")]
    Excellent,
    #[serde(rename = "not bad")]
    Improvable,
    #[serde(rename = "bad")]
    Bad,
}

impl Rating {
    pub fn score(self) -> u8 {
        match self {
            Rating::Excellent => 10,
            Rating::Improvable => 5,
            Rating::Bad => 0,
        }
    }
}

/// What we tell the client about its own TLS stack. Field order is the JSON
/// field order.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub supported_cipher_suites: Vec<String>,
    pub weak_cipher_suites: BTreeMap<String, Vec<String>>,
    pub broken_cipher_suites: BTreeMap<String, Vec<String>>,
    pub ephemeral_keys_supported: bool,
    pub session_ticket_supported: bool,
    pub tls_compression_supported: bool,
    pub unknown_cipher_suite_supported: bool,
    pub beast_vuln: bool,
    pub able_to_detect_n_minus_one_splitting: bool,
    pub tls_version: String,
    pub tls_version_float: f64,
    pub rating: Rating,
    pub rating_score: u8,
}

impl Report {
    /// Render as JSON with four-space indentation, the format the original
    /// service shipped.
    pub fn to_json(&self) -> String {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)
            .expect("report serialization is infallible");
        String::from_utf8(out).expect("serde_json emits UTF-8")
    }
}
