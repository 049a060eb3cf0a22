//! Resumable sessions and the hash-keyed session store.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ferric_types::TlsError;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::{CipherSuite, TlsVersion};

/// Maximum session identifier length.
pub const MAX_SESSION_ID_LEN: usize = 32;
/// Maximum session-id-context (application tag) length.
pub const MAX_SID_CTX_LEN: usize = 32;

/// Session cache behavior, a small bit set on the shared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMode(pub u32);

impl CacheMode {
    pub const OFF: Self = Self(0);
    /// Cache sessions produced by client-side connects.
    pub const CLIENT: Self = Self(0x0001);
    /// Cache sessions produced by server-side accepts.
    pub const SERVER: Self = Self(0x0002);
    pub const BOTH: Self = Self(0x0003);
    /// Never add sessions to the internal store.
    pub const NO_INTERNAL_STORE: Self = Self(0x0010);
    /// Disable the coarse auto-flush of expired entries.
    pub const NO_AUTO_CLEAR: Self = Self(0x0080);

    pub fn contains(&self, other: CacheMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: CacheMode) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for CacheMode {
    type Output = CacheMode;
    fn bitor(self, rhs: CacheMode) -> CacheMode {
        CacheMode(self.0 | rhs.0)
    }
}

/// Seconds since the UNIX epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A resumable session descriptor. Immutable once cached except for
/// administrative invalidation via [`mark_not_resumable`](Self::mark_not_resumable).
#[derive(Debug)]
pub struct Session {
    pub id: Vec<u8>,
    /// Application context tag binding resumption to one application policy.
    pub sid_ctx: Vec<u8>,
    pub version: TlsVersion,
    pub cipher_suite: CipherSuite,
    pub master_secret: Vec<u8>,
    /// DER encoding of the peer's leaf certificate, when one was presented.
    pub peer_identity: Option<Vec<u8>>,
    pub created_at: u64,
    /// Lifetime in seconds; 0 means the session never expires.
    pub lifetime_secs: u64,
    /// Maximum early-data size the peer will accept on resumption.
    pub max_early_data: u32,
    not_resumable: AtomicBool,
}

impl Session {
    pub fn new(version: TlsVersion, cipher_suite: CipherSuite) -> Self {
        Self {
            id: Vec::new(),
            sid_ctx: Vec::new(),
            version,
            cipher_suite,
            master_secret: Vec::new(),
            peer_identity: None,
            created_at: now_secs(),
            lifetime_secs: 7200,
            max_early_data: 0,
            not_resumable: AtomicBool::new(false),
        }
    }

    /// Fill `id` with a fresh random identifier.
    pub fn generate_id(&mut self) -> Result<(), TlsError> {
        let mut id = vec![0u8; MAX_SESSION_ID_LEN];
        getrandom::getrandom(&mut id)
            .map_err(|e| TlsError::Resource(format!("session id generation: {e}")))?;
        self.id = id;
        Ok(())
    }

    /// Administratively forbid resumption from this session.
    pub fn mark_not_resumable(&self) {
        self.not_resumable.store(true, Ordering::Relaxed);
    }

    pub fn is_resumable(&self) -> bool {
        !self.not_resumable.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.lifetime_secs != 0 && now.saturating_sub(self.created_at) > self.lifetime_secs
    }

    /// Value copy carrying everything except accumulated resumability state.
    pub fn duplicate(&self) -> Self {
        Self {
            id: self.id.clone(),
            sid_ctx: self.sid_ctx.clone(),
            version: self.version,
            cipher_suite: self.cipher_suite,
            master_secret: self.master_secret.clone(),
            peer_identity: self.peer_identity.clone(),
            created_at: self.created_at,
            lifetime_secs: self.lifetime_secs,
            max_early_data: self.max_early_data,
            not_resumable: AtomicBool::new(self.not_resumable.load(Ordering::Relaxed)),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

/// Cache key: protocol version plus session identifier.
///
/// The hash folds only the first four identifier bytes (zero-padded when
/// shorter). Identifiers are attacker-influenced but length-bounded, so the
/// weak hash trades collision resistance for O(1) lookups at low cost;
/// changing it changes cache-sharing semantics across implementations.
#[derive(Debug, Clone)]
pub struct SessionKey {
    version: TlsVersion,
    id: Vec<u8>,
}

impl SessionKey {
    pub fn new(version: TlsVersion, id: &[u8]) -> Self {
        Self {
            version,
            id: id.to_vec(),
        }
    }

    pub fn for_session(session: &Session) -> Self {
        Self::new(session.version, &session.id)
    }
}

impl Hash for SessionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut four = [0u8; 4];
        let n = self.id.len().min(4);
        four[..n].copy_from_slice(&self.id[..n]);
        state.write_u32(u32::from_le_bytes(four));
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        // Length first to avoid over-reads; bytes in constant time because
        // identifiers are attacker-influenced.
        self.version == other.version
            && self.id.len() == other.id.len()
            && bool::from(self.id.ct_eq(&other.id))
    }
}

impl Eq for SessionKey {}

/// Hash-keyed store of resumable sessions, owned by the shared context.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<SessionKey, Arc<Session>>,
    max_size: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(1024 * 20)
    }
}

impl SessionStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Insert a session, evicting an arbitrary entry when full. Returns the
    /// session previously stored under the same key, if any.
    pub fn put(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        let key = SessionKey::for_session(&session);
        if self.sessions.len() >= self.max_size && !self.sessions.contains_key(&key) {
            if let Some(victim) = self.sessions.keys().next().cloned() {
                self.sessions.remove(&victim);
            }
        }
        self.sessions.insert(key, session)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).cloned()
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.remove(key)
    }

    /// Empty the store, returning everything it held.
    pub fn drain_all(&mut self) -> Vec<Arc<Session>> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    /// Remove every expired entry, returning the evicted sessions so the
    /// caller can run removal notifications outside this store.
    pub fn flush_expired(&mut self, now: u64) -> Vec<Arc<Session>> {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.sessions.remove(&k))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    pub(crate) fn make_session(id: &[u8]) -> Session {
        let mut s = Session::new(TlsVersion::Tls13, CipherSuite::TLS_AES_128_GCM_SHA256);
        s.id = id.to_vec();
        s.master_secret = vec![0xAB; 48];
        s
    }

    fn hash_of(key: &SessionKey) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_key_equality() {
        let a = SessionKey::new(TlsVersion::Tls13, b"abcd");
        let b = SessionKey::new(TlsVersion::Tls13, b"abcd");
        let c = SessionKey::new(TlsVersion::Tls12, b"abcd");
        let d = SessionKey::new(TlsVersion::Tls13, b"abcde");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_key_hash_uses_first_four_bytes_only() {
        let a = SessionKey::new(TlsVersion::Tls13, b"abcdXXXX");
        let b = SessionKey::new(TlsVersion::Tls13, b"abcdYYYY");
        assert_eq!(hash_of(&a), hash_of(&b));
        let c = SessionKey::new(TlsVersion::Tls13, b"abce");
        assert_ne!(hash_of(&a), hash_of(&c));
    }

    #[test]
    fn test_key_hash_zero_pads_short_ids() {
        let short = SessionKey::new(TlsVersion::Tls13, b"ab");
        let padded = SessionKey::new(TlsVersion::Tls13, &[b'a', b'b', 0, 0]);
        assert_eq!(hash_of(&short), hash_of(&padded));
        // Equality still distinguishes them by length.
        assert_ne!(short, padded);
    }

    #[test]
    fn test_store_put_get_remove() {
        let mut store = SessionStore::new(16);
        let s = Arc::new(make_session(b"id-1"));
        store.put(Arc::clone(&s));
        let key = SessionKey::new(TlsVersion::Tls13, b"id-1");
        assert!(store.get(&key).is_some());
        assert!(store.remove(&key).is_some());
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_store_eviction_bounds_len() {
        let mut store = SessionStore::new(2);
        for i in 0..5u8 {
            store.put(Arc::new(make_session(&[i, i, i, i])));
        }
        assert!(store.len() <= 2);
    }

    #[test]
    fn test_store_overwrite_same_key() {
        let mut store = SessionStore::new(16);
        store.put(Arc::new(make_session(b"same")));
        let prev = store.put(Arc::new(make_session(b"same")));
        assert!(prev.is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_flush_expired() {
        let mut store = SessionStore::new(16);
        let mut old = make_session(b"old-");
        old.created_at = now_secs() - 10_000;
        old.lifetime_secs = 3600;
        store.put(Arc::new(old));
        store.put(Arc::new(make_session(b"new-")));
        let removed = store.flush_expired(now_secs());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, b"old-");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_zero_lifetime_never_expires() {
        let mut s = make_session(b"eternal-");
        s.created_at = 1;
        s.lifetime_secs = 0;
        assert!(!s.is_expired(now_secs()));
    }

    #[test]
    fn test_not_resumable_flag() {
        let s = make_session(b"flag");
        assert!(s.is_resumable());
        s.mark_not_resumable();
        assert!(!s.is_resumable());
        // Duplication carries the flag.
        assert!(!s.duplicate().is_resumable());
    }

    #[test]
    fn test_generate_id() {
        let mut s = Session::new(TlsVersion::Tls13, CipherSuite::TLS_AES_128_GCM_SHA256);
        s.generate_id().unwrap();
        assert_eq!(s.id.len(), MAX_SESSION_ID_LEN);
        let first = s.id.clone();
        s.generate_id().unwrap();
        assert_ne!(s.id, first);
    }

    #[test]
    fn test_cache_mode_bits() {
        let m = CacheMode::SERVER | CacheMode::NO_INTERNAL_STORE;
        assert!(m.contains(CacheMode::SERVER));
        assert!(m.contains(CacheMode::NO_INTERNAL_STORE));
        assert!(!m.contains(CacheMode::CLIENT));
        assert!(m.intersects(CacheMode::BOTH));
        assert!(!CacheMode::OFF.intersects(CacheMode::BOTH));
    }
}
