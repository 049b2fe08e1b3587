//! What the TLS engine observed during one handshake.

/// Outcome of the record-layer probe for 1/n-1 record splitting, the client
/// side mitigation for BEAST.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeastObservation {
    /// The probe was armed: the connection ran at TLS 1.0 or below with one
    /// of the probe cipher suites, so the first application record is
    /// meaningful.
    pub detection_possible: bool,
    /// The first application-data record was 0 or 1 bytes of plaintext,
    /// i.e. the client split its first write.
    pub splitting_detected: bool,
}

/// Immutable record of the ClientHello fields and record-layer observations
/// made during a server handshake.
///
/// Everything is exactly as offered on the wire: the suite list keeps its
/// order, duplicates, signalling values and unknown code points.
#[derive(Debug, Clone, Default)]
pub struct HandshakeSnapshot {
    /// Version the server actually negotiated.
    pub negotiated_version: u16,
    /// Cipher suites from the ClientHello, wire order preserved.
    pub client_offered_suites: Vec<u16>,
    /// Compression methods from the ClientHello (0 = null).
    pub compression_methods: Vec<u8>,
    /// The session_ticket extension (35) was present.
    pub session_ticket_extension_present: bool,
    /// Values of the supported_versions extension (43), empty if absent.
    pub supported_versions_extension: Vec<u16>,
    /// Record splitting probe outcome.
    pub beast_observation: BeastObservation,
}
