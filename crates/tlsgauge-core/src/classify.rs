//! Turns a [`HandshakeSnapshot`] into a [`Report`].

use std::collections::BTreeMap;

use crate::catalogue::{self, PolicyTags};
use crate::report::{
    Rating, Report, CBC_REASON, FEW_BIT_REASON, NO_EPHEMERAL_REASON, NULL_AUTH_REASON, NULL_REASON,
    RC4_REASON, SWEET32_REASON,
};
use crate::snapshot::HandshakeSnapshot;
use crate::version;

/// Classify one connection. Total function: unknown suite codes become part
/// of the report, never an error.
pub fn classify(snapshot: &HandshakeSnapshot) -> Report {
    let mut supported = Vec::with_capacity(snapshot.client_offered_suites.len());
    let mut weak: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut broken: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut ephemeral_keys = false;
    let mut unknown_suite = false;
    let mut beast_vuln = false;
    let mut able_to_detect = false;

    // 3DES suites seen but not yet followed by a suite the client would
    // actually prefer them over. A 3DES suite trailing the whole list is
    // tolerated; one followed by a real, modern suite means the client is
    // genuinely willing to negotiate 3DES.
    let mut sweet32_pending: Vec<&str> = Vec::new();

    for &code in &snapshot.client_offered_suites {
        let display: String = match catalogue::lookup(code) {
            Some(entry) => {
                let name = entry.name;
                if entry.ephemeral() {
                    ephemeral_keys = true;
                }

                if entry.has_tag(PolicyTags::CBC) {
                    push_reason(&mut weak, name, CBC_REASON);
                }
                if entry.has_tag(PolicyTags::NO_EPHEMERAL) {
                    push_reason(&mut weak, name, NO_EPHEMERAL_REASON);
                }

                if entry.has_tag(PolicyTags::CBC) && snapshot.negotiated_version <= version::TLS10 {
                    beast_vuln = !snapshot.beast_observation.splitting_detected;
                    able_to_detect = snapshot.beast_observation.detection_possible;
                }

                if entry.has_tag(PolicyTags::FEW_BIT) {
                    push_reason(&mut broken, name, FEW_BIT_REASON);
                }
                if entry.has_tag(PolicyTags::NULL_CIPHER) {
                    push_reason(&mut broken, name, NULL_REASON);
                }
                if entry.has_tag(PolicyTags::NULL_AUTH) {
                    push_reason(&mut broken, name, NULL_AUTH_REASON);
                }
                if entry.has_tag(PolicyTags::RC4) {
                    push_reason(&mut broken, name, RC4_REASON);
                }

                if entry.has_tag(PolicyTags::SWEET32) {
                    sweet32_pending.push(name);
                } else if !sweet32_pending.is_empty()
                    && !entry.has_tag(PolicyTags::META)
                    && !entry.has_tag(PolicyTags::TLS13_ONLY)
                {
                    for seen in sweet32_pending.drain(..) {
                        push_reason(&mut broken, seen, SWEET32_REASON);
                    }
                }

                name.to_owned()
            }
            None => match catalogue::weird_nss_name(code) {
                Some(name) => {
                    // The NSS FIPS list also rests on DES, so report it as
                    // insufficient key bits.
                    push_reason(&mut broken, name, FEW_BIT_REASON);
                    name.to_owned()
                }
                None => {
                    unknown_suite = true;
                    format!("An unknown cipher suite: {code:#06x}")
                }
            },
        };
        supported.push(display);
    }
    // Pending 3DES suites trailed everything else: no Sweet32 finding.

    let compression = snapshot.compression_methods.iter().any(|&m| m != 0);

    let (_, version_name) = version::reported_version(
        snapshot.negotiated_version,
        &snapshot.supported_versions_extension,
    );
    let tls_version = version_name
        .unwrap_or("an unknown version of SSL/TLS")
        .to_owned();
    let tls_version_float = version_name
        .and_then(|n| n[4..].parse::<f64>().ok())
        .unwrap_or(0.0);

    // The rating judges the connection the server actually got, so both
    // version checks use the negotiated version; only the displayed version
    // above is upgraded by supported_versions.
    let negotiated = snapshot.negotiated_version;
    let mut rating = Rating::Excellent;
    if !ephemeral_keys
        || negotiated == version::TLS12
        || !snapshot.session_ticket_extension_present
    {
        rating = Rating::Improvable;
    }
    if compression
        || unknown_suite
        || beast_vuln
        || !broken.is_empty()
        || negotiated <= version::TLS11
    {
        rating = Rating::Bad;
    }

    Report {
        supported_cipher_suites: supported,
        weak_cipher_suites: weak,
        broken_cipher_suites: broken,
        ephemeral_keys_supported: ephemeral_keys,
        session_ticket_supported: snapshot.session_ticket_extension_present,
        tls_compression_supported: compression,
        unknown_cipher_suite_supported: unknown_suite,
        beast_vuln,
        able_to_detect_n_minus_one_splitting: able_to_detect,
        tls_version,
        tls_version_float,
        rating,
        rating_score: rating.score(),
    }
}

fn push_reason(map: &mut BTreeMap<String, Vec<String>>, name: &str, reason: &str) {
    map.entry(name.to_owned()).or_default().push(reason.to_owned());
}
