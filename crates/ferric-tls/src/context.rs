//! Shared configuration context.
//!
//! A context is built once, then shared by many connections through an
//! `Arc`. It owns the session store, the DANE matching-type table, the
//! certificate material, the async job pool, and the statistics counters.
//! Mutable configuration lives behind a mutex so callbacks and cipher lists
//! can be adjusted while connections are live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ferric_types::TlsError;

use crate::dane::DaneTable;
use crate::job::{JobPool, JobStatusCallback};
use crate::keylog;
use crate::provider::{DerCheckProvider, ProviderHandle};
use crate::session::{
    now_secs, CacheMode, Session, SessionKey, SessionStore, MAX_SID_CTX_LEN,
};
use crate::{CipherSuite, ProtocolMethod, TlsRole, TlsVersion};

/// Invoked when a handshake produces a session; return `true` when the
/// application keeps its own reference in an external cache.
pub type NewSessionCallback = Arc<dyn Fn(&Arc<Session>) -> bool + Send + Sync>;
/// Invoked when a session leaves the internal store.
pub type RemoveSessionCallback = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;
/// Supplies an externally established session for a client to offer as a
/// pre-shared key.
pub type PskOfferCallback = Arc<dyn Fn() -> Option<Arc<Session>> + Send + Sync>;

/// Contexts participating in key logging. The process-wide sink is torn
/// down when the last one goes away.
static KEYLOG_CONTEXTS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
pub(crate) struct ContextConfig {
    pub cipher_suites: Vec<CipherSuite>,
    pub dane: DaneTable,
    pub cache_mode: CacheMode,
    pub sid_ctx: Vec<u8>,
    /// DER certificate chain presented by connections of this context.
    pub cert_chain: Vec<Vec<u8>>,
    /// Registered custom extension identifiers.
    pub custom_extensions: Vec<u16>,
    pub new_session_cb: Option<NewSessionCallback>,
    pub remove_session_cb: Option<RemoveSessionCallback>,
    pub psk_offer_cb: Option<PskOfferCallback>,
    pub job_status_cb: Option<JobStatusCallback>,
}

impl std::fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextConfig")
            .field("cipher_suites", &self.cipher_suites)
            .field("cache_mode", &self.cache_mode)
            .field("sid_ctx_len", &self.sid_ctx.len())
            .field("cert_chain_len", &self.cert_chain.len())
            .field("custom_extensions", &self.custom_extensions)
            .finish()
    }
}

/// Handshake and cache statistics, updated without taking the config lock.
#[derive(Debug, Default)]
pub struct Stats {
    pub connect_good: AtomicU64,
    pub accept_good: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub connect_good: u64,
    pub accept_good: u64,
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
}

/// Inputs to the post-handshake cache decision, gathered by the connection.
#[derive(Debug)]
pub struct CacheUpdate<'a> {
    pub session: &'a Arc<Session>,
    pub role: TlsRole,
    /// The handshake resumed an earlier session.
    pub resumed: bool,
    /// Peer verification was requested.
    pub verify_peer: bool,
    pub tls13: bool,
    /// Whether this session is worth holding in the internal store. A
    /// TLS 1.3 server issuing stateless tickets has nothing to store unless
    /// replay detection or stateful tickets demand it.
    pub internal_store_ok: bool,
}

pub struct TlsContext {
    method: ProtocolMethod,
    min_version: TlsVersion,
    max_version: TlsVersion,
    config: Mutex<ContextConfig>,
    store: RwLock<SessionStore>,
    stats: Stats,
    ex_data: Mutex<HashMap<usize, Vec<u8>>>,
    provider: ProviderHandle,
    job_pool: Arc<JobPool>,
    session_lifetime: u64,
    keylog: bool,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("method", &self.method)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("sessions", &self.session_count())
            .field("session_lifetime", &self.session_lifetime)
            .field("keylog", &self.keylog)
            .finish()
    }
}

/// Builder for [`TlsContext`]. The protocol method is the one mandatory
/// field.
pub struct TlsContextBuilder {
    method: Option<ProtocolMethod>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    cipher_suites: Vec<CipherSuite>,
    cache_mode: CacheMode,
    cache_size: usize,
    session_lifetime: u64,
    sid_ctx: Vec<u8>,
    provider: Option<ProviderHandle>,
    max_jobs: usize,
    keylog: bool,
}

impl Default for TlsContextBuilder {
    fn default() -> Self {
        Self {
            method: None,
            min_version: None,
            max_version: None,
            cipher_suites: vec![
                CipherSuite::TLS_AES_128_GCM_SHA256,
                CipherSuite::TLS_AES_256_GCM_SHA384,
                CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
            ],
            cache_mode: CacheMode::SERVER,
            cache_size: 1024 * 20,
            session_lifetime: 7200,
            sid_ctx: Vec::new(),
            provider: None,
            max_jobs: 16,
            keylog: false,
        }
    }
}

impl TlsContextBuilder {
    pub fn method(mut self, method: ProtocolMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn version_bounds(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    pub fn cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Default lifetime in seconds for sessions minted by this context.
    pub fn session_lifetime(mut self, secs: u64) -> Self {
        self.session_lifetime = secs;
        self
    }

    pub fn session_id_context(mut self, sid_ctx: &[u8]) -> Self {
        self.sid_ctx = sid_ctx.to_vec();
        self
    }

    pub fn provider(mut self, provider: ProviderHandle) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Upper bound on concurrently parked async jobs across all connections.
    pub fn max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Participate in process-wide key material logging.
    pub fn keylog(mut self, enabled: bool) -> Self {
        self.keylog = enabled;
        self
    }

    pub fn build(self) -> Result<Arc<TlsContext>, TlsError> {
        let method = self
            .method
            .ok_or_else(|| TlsError::Config("protocol method is required".into()))?;
        if self.sid_ctx.len() > MAX_SID_CTX_LEN {
            return Err(TlsError::Config(format!(
                "session id context exceeds {MAX_SID_CTX_LEN} bytes"
            )));
        }
        if self.cipher_suites.is_empty() {
            return Err(TlsError::Config("no cipher suites configured".into()));
        }
        let (def_min, def_max) = method.version_bounds();
        let ctx = TlsContext {
            method,
            min_version: self.min_version.unwrap_or(def_min),
            max_version: self.max_version.unwrap_or(def_max),
            config: Mutex::new(ContextConfig {
                cipher_suites: self.cipher_suites,
                cache_mode: self.cache_mode,
                sid_ctx: self.sid_ctx,
                ..ContextConfig::default()
            }),
            store: RwLock::new(SessionStore::new(self.cache_size)),
            stats: Stats::default(),
            ex_data: Mutex::new(HashMap::new()),
            provider: self
                .provider
                .unwrap_or_else(|| Arc::new(DerCheckProvider)),
            job_pool: Arc::new(JobPool::new(self.max_jobs)),
            session_lifetime: self.session_lifetime,
            keylog: self.keylog,
        };
        if ctx.keylog {
            KEYLOG_CONTEXTS.fetch_add(1, Ordering::AcqRel);
        }
        Ok(Arc::new(ctx))
    }
}

impl TlsContext {
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::default()
    }

    pub fn method(&self) -> ProtocolMethod {
        self.method
    }

    pub fn version_bounds(&self) -> (TlsVersion, TlsVersion) {
        (self.min_version, self.max_version)
    }

    pub fn provider(&self) -> &ProviderHandle {
        &self.provider
    }

    pub(crate) fn job_pool(&self) -> Arc<JobPool> {
        Arc::clone(&self.job_pool)
    }

    pub fn session_lifetime(&self) -> u64 {
        self.session_lifetime
    }

    pub(crate) fn with_config<R>(&self, f: impl FnOnce(&mut ContextConfig) -> R) -> R {
        let mut guard = match self.config.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn cipher_suites(&self) -> Vec<CipherSuite> {
        self.with_config(|c| c.cipher_suites.clone())
    }

    pub fn set_cipher_suites(&self, suites: Vec<CipherSuite>) -> Result<(), TlsError> {
        if suites.is_empty() {
            return Err(TlsError::Config("no cipher suites configured".into()));
        }
        self.with_config(|c| c.cipher_suites = suites);
        Ok(())
    }

    pub fn set_certificate_chain(&self, chain: Vec<Vec<u8>>) {
        self.with_config(|c| c.cert_chain = chain);
    }

    pub fn certificate_chain(&self) -> Vec<Vec<u8>> {
        self.with_config(|c| c.cert_chain.clone())
    }

    /// Register a custom extension identifier. Duplicate registration is a
    /// configuration error.
    pub fn register_custom_extension(&self, ext_type: u16) -> Result<(), TlsError> {
        self.with_config(|c| {
            if c.custom_extensions.contains(&ext_type) {
                return Err(TlsError::Config(format!(
                    "custom extension {ext_type} already registered"
                )));
            }
            c.custom_extensions.push(ext_type);
            Ok(())
        })
    }

    pub fn custom_extensions(&self) -> Vec<u16> {
        self.with_config(|c| c.custom_extensions.clone())
    }

    pub fn set_session_id_context(&self, sid_ctx: &[u8]) -> Result<(), TlsError> {
        if sid_ctx.len() > MAX_SID_CTX_LEN {
            return Err(TlsError::Config(format!(
                "session id context exceeds {MAX_SID_CTX_LEN} bytes"
            )));
        }
        self.with_config(|c| c.sid_ctx = sid_ctx.to_vec());
        Ok(())
    }

    pub fn session_id_context(&self) -> Vec<u8> {
        self.with_config(|c| c.sid_ctx.clone())
    }

    pub fn set_cache_mode(&self, mode: CacheMode) -> CacheMode {
        self.with_config(|c| std::mem::replace(&mut c.cache_mode, mode))
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.with_config(|c| c.cache_mode)
    }

    pub fn set_new_session_callback(&self, cb: NewSessionCallback) {
        self.with_config(|c| c.new_session_cb = Some(cb));
    }

    pub fn set_remove_session_callback(&self, cb: RemoveSessionCallback) {
        self.with_config(|c| c.remove_session_cb = Some(cb));
    }

    pub fn set_psk_offer_callback(&self, cb: PskOfferCallback) {
        self.with_config(|c| c.psk_offer_cb = Some(cb));
    }

    pub(crate) fn psk_offer_callback(&self) -> Option<PskOfferCallback> {
        self.with_config(|c| c.psk_offer_cb.clone())
    }

    pub fn set_job_status_callback(&self, cb: JobStatusCallback) {
        self.with_config(|c| c.job_status_cb = Some(cb));
    }

    pub(crate) fn job_status_callback(&self) -> Option<JobStatusCallback> {
        self.with_config(|c| c.job_status_cb.clone())
    }

    // DANE matching-type table

    /// Install the built-in DANE matching types on this context.
    pub fn dane_enable(&self) {
        self.with_config(|c| c.dane.enable());
    }

    pub fn dane_is_enabled(&self) -> bool {
        self.with_config(|c| c.dane.is_enabled())
    }

    /// Register or update a DANE matching type.
    pub fn dane_mtype_set(
        &self,
        md: Option<crate::HashAlgId>,
        mtype: u8,
        ord: u8,
    ) -> Result<(), TlsError> {
        self.with_config(|c| c.dane.set_mtype(md, mtype, ord))
    }

    pub fn dane_set_flags(&self, flags: u32) -> u32 {
        self.with_config(|c| c.dane.set_flags(flags))
    }

    pub fn dane_clear_flags(&self, flags: u32) -> u32 {
        self.with_config(|c| c.dane.clear_flags(flags))
    }

    /// Copy of the matching-type table for record validation.
    pub(crate) fn dane_snapshot(&self) -> DaneTable {
        self.with_config(|c| c.dane.clone())
    }

    pub(crate) fn dane_flags(&self) -> u32 {
        self.with_config(|c| c.dane.flags())
    }

    // Session store

    /// Insert a session into the internal store. Returns `true` when the
    /// session was not already present under its key.
    pub fn add_session(&self, session: Arc<Session>) -> bool {
        let displaced = match self.store.write() {
            Ok(mut store) => store.put(Arc::clone(&session)),
            Err(_) => return false,
        };
        match displaced {
            Some(old) if Arc::ptr_eq(&old, &session) => false,
            Some(old) => {
                // Same key, different session: the old one must not resume.
                old.mark_not_resumable();
                self.notify_removed(&old);
                true
            }
            None => true,
        }
    }

    /// Remove a session, invalidating it for resumption.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let key = SessionKey::for_session(session);
        let removed = match self.store.write() {
            Ok(mut store) => match store.get(&key) {
                Some(found) if Arc::ptr_eq(&found, session) => store.remove(&key),
                _ => None,
            },
            Err(_) => None,
        };
        match removed {
            Some(old) => {
                old.mark_not_resumable();
                self.notify_removed(&old);
                true
            }
            None => false,
        }
    }

    /// Look up a resumable session, expiring it on the spot when stale.
    pub fn lookup_session(&self, version: TlsVersion, id: &[u8]) -> Option<Arc<Session>> {
        let key = SessionKey::new(version, id);
        let found = self.store.read().ok().and_then(|s| s.get(&key));
        match found {
            Some(session) if session.is_expired(now_secs()) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut store) = self.store.write() {
                    store.remove(&key);
                }
                session.mark_not_resumable();
                self.notify_removed(&session);
                None
            }
            Some(session) if !session.is_resumable() => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(session) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(session)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Expire stale sessions, notifying the removal callback for each.
    pub fn flush_sessions(&self, now: u64) {
        let removed = match self.store.write() {
            Ok(mut store) => store.flush_expired(now),
            Err(_) => return,
        };
        for session in removed {
            session.mark_not_resumable();
            self.notify_removed(&session);
        }
    }

    fn notify_removed(&self, session: &Arc<Session>) {
        let cb = self.with_config(|c| c.remove_session_cb.clone());
        if let Some(cb) = cb {
            cb(session);
        }
    }

    /// Post-handshake cache decision.
    ///
    /// Sessions without an identifier cannot be cached. When peer
    /// verification is on, a session with no application context tag is
    /// skipped as well, since resuming it later could not be tied back to
    /// one application policy. Resumed handshakes are not re-cached below
    /// TLS 1.3. Every 256th successful handshake on a cached side also
    /// sweeps expired entries, unless auto-clear is disabled.
    pub fn update_cache(&self, update: CacheUpdate<'_>) {
        if update.session.id.is_empty() || !update.session.is_resumable() {
            return;
        }
        // Server only: a client resuming an untagged session fails the whole
        // handshake when it is asked to verify, not just the resumption.
        if update.role == TlsRole::Server
            && update.session.sid_ctx.is_empty()
            && update.verify_peer
        {
            return;
        }

        let side = match update.role {
            TlsRole::Client => CacheMode::CLIENT,
            TlsRole::Server => CacheMode::SERVER,
        };
        let mode = self.cache_mode();

        if mode.intersects(side) && (!update.resumed || update.tls13) {
            // A registered removal callback wants timeout notifications, so
            // the session must pass through the internal store to get them.
            let internal_store_ok = update.internal_store_ok
                || self.with_config(|c| c.remove_session_cb.is_some());
            if !mode.contains(CacheMode::NO_INTERNAL_STORE) && internal_store_ok {
                self.add_session(Arc::clone(update.session));
            }
            let cb = self.with_config(|c| c.new_session_cb.clone());
            if let Some(cb) = cb {
                // The callback keeping a reference is its own business; the
                // shared ownership model needs no explicit balancing here.
                let _ = cb(update.session);
            }
        }

        if !mode.contains(CacheMode::NO_AUTO_CLEAR) && mode.intersects(side) {
            let counter = match update.role {
                TlsRole::Client => self.stats.connect_good.load(Ordering::Relaxed),
                TlsRole::Server => self.stats.accept_good.load(Ordering::Relaxed),
            };
            if counter & 0xff == 0xff {
                self.flush_sessions(now_secs());
            }
        }
    }

    // Statistics

    pub(crate) fn count_handshake_success(&self, role: TlsRole) {
        let counter = match role {
            TlsRole::Client => &self.stats.connect_good,
            TlsRole::Server => &self.stats.accept_good,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            connect_good: self.stats.connect_good.load(Ordering::Relaxed),
            accept_good: self.stats.accept_good.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }

    // Application data slots

    pub fn set_ex_data(&self, index: usize, data: Vec<u8>) {
        if let Ok(mut map) = self.ex_data.lock() {
            map.insert(index, data);
        }
    }

    pub fn ex_data(&self, index: usize) -> Option<Vec<u8>> {
        self.ex_data.lock().ok().and_then(|m| m.get(&index).cloned())
    }
}

impl Drop for TlsContext {
    fn drop(&mut self) {
        // Removal callbacks run while application data slots are still
        // readable; only afterwards is the rest torn down.
        let held = match self.store.write() {
            Ok(mut store) => store.drain_all(),
            Err(_) => Vec::new(),
        };
        for session in held {
            session.mark_not_resumable();
            self.notify_removed(&session);
        }
        if let Ok(mut map) = self.ex_data.lock() {
            map.clear();
        }
        if self.keylog && KEYLOG_CONTEXTS.fetch_sub(1, Ordering::AcqRel) == 1 {
            keylog::teardown();
        }
    }
}
