//! Server configuration: certificate provider, permitted suites, version
//! floor, session cache.

use std::sync::{Arc, RwLock};

use rsa::RsaPrivateKey;

use crate::session::SessionCache;
use crate::suites::DEFAULT_SERVER_SUITES;
use tlsgauge_core::version;

const SESSION_CACHE_CAPACITY: usize = 1024;

/// A DER certificate chain and the RSA key it certifies.
pub struct CertifiedKey {
    pub certificate_chain: Vec<Vec<u8>>,
    pub private_key: RsaPrivateKey,
}

/// Shared server configuration. The certificate can be swapped atomically
/// while serving; each handshake pins the pair it started with.
pub struct ServerConfig {
    certificate: RwLock<Arc<CertifiedKey>>,
    /// Permitted suites in server preference order. Deliberately includes
    /// RC4, CBC and 3DES suites; that is the point of this server.
    pub cipher_suites: Vec<u16>,
    /// Oldest protocol version accepted. Defaults to SSL 3.0 so obsolete
    /// clients can be observed.
    pub min_version: u16,
    pub(crate) session_cache: SessionCache,
}

impl ServerConfig {
    pub fn new(certified_key: CertifiedKey) -> Self {
        Self {
            certificate: RwLock::new(Arc::new(certified_key)),
            cipher_suites: DEFAULT_SERVER_SUITES.to_vec(),
            min_version: version::SSL30,
            session_cache: SessionCache::new(SESSION_CACHE_CAPACITY),
        }
    }

    /// Replace the serving certificate. In-flight handshakes keep the pair
    /// they snapshotted.
    pub fn swap_certificate(&self, certified_key: CertifiedKey) {
        let mut slot = self.certificate.write().expect("certificate lock poisoned");
        *slot = Arc::new(certified_key);
    }

    pub(crate) fn current_certificate(&self) -> Arc<CertifiedKey> {
        self.certificate
            .read()
            .expect("certificate lock poisoned")
            .clone()
    }
}
