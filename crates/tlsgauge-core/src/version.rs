//! Protocol version codes and display names.

pub const SSL30: u16 = 0x0300;
pub const TLS10: u16 = 0x0301;
pub const TLS11: u16 = 0x0302;
pub const TLS12: u16 = 0x0303;
pub const TLS13: u16 = 0x0304;

/// The draft codes browsers shipped while TLS 1.3 was being finalised
/// (draft-18 through draft-33). All of them display as "TLS 1.3".
pub const TLS13_DRAFT_LOW: u16 = 0x7F12;
pub const TLS13_DRAFT_HIGH: u16 = 0x7F21;

/// Display name for a recognised version code, `None` otherwise.
pub fn display_name(code: u16) -> Option<&'static str> {
    match code {
        SSL30 => Some("SSL 3.0"),
        TLS10 => Some("TLS 1.0"),
        TLS11 => Some("TLS 1.1"),
        TLS12 => Some("TLS 1.2"),
        TLS13 => Some("TLS 1.3"),
        TLS13_DRAFT_LOW..=TLS13_DRAFT_HIGH => Some("TLS 1.3"),
        _ => None,
    }
}

/// Resolve the version to report for a connection.
///
/// Starts from what the server negotiated, then walks the client's
/// supported_versions extension and upgrades whenever a recognised value is
/// numerically greater. This credits clients that offered TLS 1.3 but were
/// downgraded by our TLS-1.2-max stack.
pub fn reported_version(negotiated: u16, supported_versions: &[u16]) -> (u16, Option<&'static str>) {
    let mut code = negotiated;
    let mut name = display_name(negotiated);
    for &v in supported_versions {
        if let Some(n) = display_name(v) {
            if v > code {
                code = v;
                name = Some(n);
            }
        }
    }
    (code, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!(display_name(SSL30), Some("SSL 3.0"));
        assert_eq!(display_name(TLS12), Some("TLS 1.2"));
        assert_eq!(display_name(TLS13), Some("TLS 1.3"));
        assert_eq!(display_name(0x0305), None);
        assert_eq!(display_name(0x0299), None);
    }

    #[test]
    fn every_draft_code_reads_as_tls13() {
        for code in TLS13_DRAFT_LOW..=TLS13_DRAFT_HIGH {
            assert_eq!(display_name(code), Some("TLS 1.3"));
        }
        assert_eq!(display_name(TLS13_DRAFT_LOW - 1), None);
        assert_eq!(display_name(TLS13_DRAFT_HIGH + 1), None);
    }

    #[test]
    fn extension_upgrades_the_reported_version() {
        let (code, name) = reported_version(TLS12, &[TLS13]);
        assert_eq!(code, TLS13);
        assert_eq!(name, Some("TLS 1.3"));
    }

    #[test]
    fn extension_never_downgrades() {
        let (code, name) = reported_version(TLS12, &[TLS10, TLS11]);
        assert_eq!(code, TLS12);
        assert_eq!(name, Some("TLS 1.2"));
    }

    #[test]
    fn unrecognised_extension_values_are_ignored() {
        let (code, name) = reported_version(TLS12, &[0x7A7A, 0xFFFF]);
        assert_eq!(code, TLS12);
        assert_eq!(name, Some("TLS 1.2"));
    }

    #[test]
    fn unknown_negotiated_version_has_no_name() {
        let (_, name) = reported_version(0x0200, &[]);
        assert_eq!(name, None);
    }
}
