//! Bounded in-memory session cache for session-ID resumption.
//!
//! Resumption is only offered to clients speaking TLS 1.1 or newer: below
//! that a resumed handshake would skip the key exchange and rob the
//! record-splitting probe of its full handshake. The gate lives in the
//! handshake driver; this is plain storage.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use zeroize::Zeroize;

#[derive(Clone)]
pub(crate) struct SessionEntry {
    pub master_secret: Vec<u8>,
    pub suite: u16,
    pub version: u16,
    pub extended_master_secret: bool,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

pub(crate) struct SessionCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    entries: HashMap<Vec<u8>, SessionEntry>,
    order: VecDeque<Vec<u8>>,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn get(&self, session_id: &[u8]) -> Option<SessionEntry> {
        let inner = self.inner.lock().expect("session cache poisoned");
        inner.entries.get(session_id).cloned()
    }

    pub fn insert(&self, session_id: Vec<u8>, entry: SessionEntry) {
        let mut inner = self.inner.lock().expect("session cache poisoned");
        while inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
        if inner.entries.insert(session_id.clone(), entry).is_none() {
            inner.order.push_back(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(suite: u16) -> SessionEntry {
        SessionEntry {
            master_secret: vec![1; 48],
            suite,
            version: 0x0303,
            extended_master_secret: true,
        }
    }

    #[test]
    fn stores_and_returns_entries() {
        let cache = SessionCache::new(4);
        cache.insert(vec![1, 2, 3], entry(0xC02F));
        let got = cache.get(&[1, 2, 3]).unwrap();
        assert_eq!(got.suite, 0xC02F);
        assert!(cache.get(&[9, 9]).is_none());
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let cache = SessionCache::new(2);
        cache.insert(vec![1], entry(1));
        cache.insert(vec![2], entry(2));
        cache.insert(vec![3], entry(3));
        assert!(cache.get(&[1]).is_none());
        assert!(cache.get(&[2]).is_some());
        assert!(cache.get(&[3]).is_some());
    }
}
