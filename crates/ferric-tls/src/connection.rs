//! Per-connection state and lifecycle.
//!
//! A [`TlsConnection`] is a cloneable handle over the connection state. An
//! established connection duplicates by sharing the handle; a connection
//! still in or before its handshake duplicates by deep copy, because
//! in-flight handshake state cannot be shared.

use std::sync::{Arc, Mutex, MutexGuard};

use ferric_types::TlsError;

use crate::context::{CacheUpdate, TlsContext};
use crate::dane::DaneStore;
use crate::early_data::{EarlyData, EarlyDataRead, EarlyDataState};
use crate::engine::{ProtocolEngine, UnboundEngine};
use crate::job::{Dispatcher, JobKind};
use crate::session::{Session, MAX_SID_CTX_LEN};
use crate::{CipherSuite, TlsRole, TlsVersion};

/// Per-connection behavior options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnOptions(pub u32);

impl ConnOptions {
    /// Use stateful session ids instead of stateless tickets.
    pub const NO_TICKET: Self = Self(0x0001);
    /// Skip early-data replay detection.
    pub const NO_ANTI_REPLAY: Self = Self(0x0002);

    pub fn contains(&self, other: ConnOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ConnOptions {
    type Output = ConnOptions;
    fn bitor(self, rhs: ConnOptions) -> ConnOptions {
        ConnOptions(self.0 | rhs.0)
    }
}

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Before,
    Handshaking,
    Established,
    ShutdownSent,
}

/// DANE state carried by one connection.
#[derive(Debug, Clone)]
struct DaneBinding {
    base_domain: String,
    store: DaneStore,
}

pub(crate) struct ConnectionInner {
    ctx: Arc<TlsContext>,
    engine: Box<dyn ProtocolEngine>,
    role: TlsRole,
    phase: Phase,
    version: Option<TlsVersion>,
    min_version: TlsVersion,
    max_version: TlsVersion,
    session: Option<Arc<Session>>,
    dane: Option<DaneBinding>,
    early: EarlyData,
    dispatcher: Option<Dispatcher>,
    partial_write: bool,
    options: ConnOptions,
    verify_peer: bool,
    /// The current handshake resumed an offered session.
    hit: bool,
    sid_ctx: Vec<u8>,
    cipher_suites: Vec<CipherSuite>,
    cert_chain: Vec<Vec<u8>>,
    custom_extensions: Vec<u16>,
}

impl ConnectionInner {
    fn new(ctx: Arc<TlsContext>, role: TlsRole) -> Self {
        let (min_version, max_version) = ctx.version_bounds();
        Self {
            role,
            phase: Phase::Before,
            version: None,
            min_version,
            max_version,
            session: None,
            dane: None,
            early: EarlyData::default(),
            dispatcher: None,
            partial_write: false,
            options: ConnOptions::default(),
            verify_peer: false,
            hit: false,
            sid_ctx: ctx.session_id_context(),
            cipher_suites: ctx.cipher_suites(),
            cert_chain: ctx.certificate_chain(),
            custom_extensions: ctx.custom_extensions(),
            engine: Box::new(UnboundEngine),
            ctx,
        }
    }

    /// Copy for a not-yet-established connection. The record layer and the
    /// early-data machine start fresh; DANE records are rebuilt so that
    /// accumulated verification results do not carry over.
    fn deep_clone(&self) -> Result<Self, TlsError> {
        let dane = match &self.dane {
            Some(binding) => {
                let mut store = DaneStore::new(binding.store.flags());
                let table = self.ctx.dane_snapshot();
                let provider = Arc::clone(self.ctx.provider());
                for rec in binding.store.records() {
                    store.add_record(
                        &table,
                        provider.as_ref(),
                        rec.usage as u8,
                        rec.selector as u8,
                        rec.mtype,
                        &rec.data,
                    )?;
                }
                Some(DaneBinding {
                    base_domain: binding.base_domain.clone(),
                    store,
                })
            }
            None => None,
        };
        Ok(Self {
            ctx: Arc::clone(&self.ctx),
            engine: Box::new(UnboundEngine),
            role: self.role,
            phase: Phase::Before,
            version: None,
            min_version: self.min_version,
            max_version: self.max_version,
            session: self.session.clone(),
            dane,
            early: EarlyData::default(),
            dispatcher: self.dispatcher.as_ref().map(|_| {
                let mut d = Dispatcher::new(self.ctx.job_pool());
                if let Some(cb) = self.ctx.job_status_callback() {
                    d.set_status_callback(cb);
                }
                d
            }),
            partial_write: self.partial_write,
            options: self.options,
            verify_peer: self.verify_peer,
            hit: false,
            sid_ctx: self.sid_ctx.clone(),
            cipher_suites: self.cipher_suites.clone(),
            cert_chain: self.cert_chain.clone(),
            custom_extensions: self.custom_extensions.clone(),
        })
    }

    fn handshake_step(&mut self) -> Result<(), TlsError> {
        match self.phase {
            Phase::Established => return Ok(()),
            Phase::ShutdownSent => {
                return Err(TlsError::Sequence("connection is shut down".into()))
            }
            Phase::Before => {
                self.hit = self.role == TlsRole::Client && self.session.is_some();
                self.phase = Phase::Handshaking;
            }
            Phase::Handshaking => {}
        }
        let role = self.role;
        let result = match self.dispatcher.as_mut() {
            Some(d) => d
                .dispatch(self.engine.as_mut(), JobKind::Other, |e| {
                    match role {
                        TlsRole::Client => e.connect()?,
                        TlsRole::Server => e.accept()?,
                    }
                    Ok(0)
                })
                .map(|_| ()),
            None => match role {
                TlsRole::Client => self.engine.connect(),
                TlsRole::Server => self.engine.accept(),
            },
        };
        result?;
        self.finish_handshake()
    }

    fn finish_handshake(&mut self) -> Result<(), TlsError> {
        self.phase = Phase::Established;
        let negotiated = self.max_version;
        self.version = Some(negotiated);
        self.ctx.count_handshake_success(self.role);

        if self.session.is_none() {
            let suite = self
                .cipher_suites
                .first()
                .copied()
                .ok_or_else(|| TlsError::Config("no cipher suites configured".into()))?;
            let mut session = Session::new(negotiated, suite);
            session.generate_id()?;
            session.sid_ctx = self.sid_ctx.clone();
            session.lifetime_secs = self.ctx.session_lifetime();
            self.session = Some(Arc::new(session));
        }
        let session = match &self.session {
            Some(s) => Arc::clone(s),
            None => return Ok(()),
        };

        let tls13 = negotiated == TlsVersion::Tls13;
        // A TLS 1.3 server handing out stateless tickets has nothing worth
        // storing unless replay detection or stateful resumption needs it.
        let internal_store_ok = !tls13
            || self.role == TlsRole::Client
            || (session.max_early_data > 0 && !self.options.contains(ConnOptions::NO_ANTI_REPLAY))
            || self.options.contains(ConnOptions::NO_TICKET);
        self.ctx.update_cache(CacheUpdate {
            session: &session,
            role: self.role,
            resumed: self.hit,
            verify_peer: self.verify_peer,
            tls13,
            internal_store_ok,
        });
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if self.phase == Phase::ShutdownSent {
            return Err(TlsError::Sequence("read after shutdown".into()));
        }
        if self.phase != Phase::Established {
            self.handshake_step()?;
        }
        match self.dispatcher.as_mut() {
            Some(d) => d.dispatch(self.engine.as_mut(), JobKind::Read, |e| e.read(buf)),
            None => self.engine.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        if self.phase == Phase::ShutdownSent {
            return Err(TlsError::Fatal("write after shutdown".into()));
        }
        if self.phase != Phase::Established {
            self.handshake_step()?;
        }
        let mut written = 0;
        loop {
            let n = match self.dispatcher.as_mut() {
                Some(d) => {
                    d.dispatch(self.engine.as_mut(), JobKind::Write, |e| e.write(&buf[written..]))?
                }
                None => self.engine.write(&buf[written..])?,
            };
            if n == 0 && !buf[written..].is_empty() {
                return Err(TlsError::Resource(
                    "record layer accepted no data".into(),
                ));
            }
            written += n;
            if self.partial_write || written >= buf.len() {
                return Ok(written);
            }
        }
    }

    fn shutdown(&mut self) -> Result<(), TlsError> {
        if self.phase == Phase::ShutdownSent {
            return Ok(());
        }
        self.engine.shutdown()?;
        self.phase = Phase::ShutdownSent;
        Ok(())
    }

    fn write_early_data(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        if self.role == TlsRole::Client && self.session.is_none() {
            if let Some(cb) = self.ctx.psk_offer_callback() {
                self.session = cb();
            }
        }
        let can_offer = self
            .session
            .as_ref()
            .map(|s| s.max_early_data > 0)
            .unwrap_or(false)
            || self.ctx.psk_offer_callback().is_some();
        let handshake_started = self.phase != Phase::Before;
        self.early.write(
            self.engine.as_mut(),
            self.role,
            can_offer,
            handshake_started,
            &mut self.partial_write,
            buf,
        )
    }

    fn read_early_data(&mut self, buf: &mut [u8]) -> Result<EarlyDataRead, TlsError> {
        let handshake_started = self.phase != Phase::Before;
        self.early
            .read(self.engine.as_mut(), self.role, handshake_started, buf)
    }

    fn rebind_context(&mut self, new_ctx: &Arc<TlsContext>) -> Result<(), TlsError> {
        if self.early.in_progress() {
            return Err(TlsError::Sequence(
                "cannot rebind context during an early-data exchange".into(),
            ));
        }
        if new_ctx.method() != self.ctx.method() {
            return Err(TlsError::Config(
                "context rebind across protocol methods".into(),
            ));
        }
        if Arc::ptr_eq(&self.ctx, new_ctx) {
            return Ok(());
        }
        self.cert_chain = new_ctx.certificate_chain();
        self.custom_extensions = new_ctx.custom_extensions();
        // A connection still carrying the old context's application tag
        // follows the new context; an explicitly set tag stays.
        if self.sid_ctx == self.ctx.session_id_context() {
            self.sid_ctx = new_ctx.session_id_context();
        }
        self.ctx = Arc::clone(new_ctx);
        Ok(())
    }

    /// Return the connection to its pre-handshake state, keeping its
    /// configuration and any offered session. Accumulated DANE verification
    /// results are dropped and a parked async job is forfeited.
    fn reset(&mut self) {
        self.phase = Phase::Before;
        self.version = None;
        self.hit = false;
        self.early = EarlyData::default();
        if let Some(d) = self.dispatcher.as_mut() {
            d.forfeit();
        }
        if let Some(binding) = self.dane.as_mut() {
            binding.store.clear_verify_state();
        }
    }

    fn dane_enable(&mut self, base_domain: &str) -> Result<(), TlsError> {
        if !self.ctx.dane_is_enabled() {
            return Err(TlsError::Sequence(
                "context has no DANE matching table".into(),
            ));
        }
        if self.dane.is_some() {
            return Err(TlsError::Sequence(
                "DANE already enabled on this connection".into(),
            ));
        }
        if base_domain.is_empty() {
            return Err(TlsError::Validation("empty DANE base domain".into()));
        }
        self.dane = Some(DaneBinding {
            base_domain: base_domain.to_string(),
            store: DaneStore::new(self.ctx.dane_flags()),
        });
        Ok(())
    }

    fn dane_tlsa_add(
        &mut self,
        usage: u8,
        selector: u8,
        mtype: u8,
        data: &[u8],
    ) -> Result<(), TlsError> {
        let table = self.ctx.dane_snapshot();
        let provider = Arc::clone(self.ctx.provider());
        let binding = self.dane.as_mut().ok_or_else(|| {
            TlsError::Sequence("DANE is not enabled on this connection".into())
        })?;
        binding
            .store
            .add_record(&table, provider.as_ref(), usage, selector, mtype, data)
    }
}

impl std::fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("version", &self.version)
            .field("early", &self.early.state())
            .finish()
    }
}

/// Handle to one TLS connection.
#[derive(Debug)]
pub struct TlsConnection {
    inner: Arc<Mutex<ConnectionInner>>,
}

impl TlsConnection {
    pub fn new(ctx: Arc<TlsContext>, role: TlsRole) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionInner::new(ctx, role))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bind the record/handshake layer this connection drives.
    pub fn set_engine(&self, engine: Box<dyn ProtocolEngine>) {
        self.lock().engine = engine;
    }

    pub fn context(&self) -> Arc<TlsContext> {
        Arc::clone(&self.lock().ctx)
    }

    pub fn role(&self) -> TlsRole {
        self.lock().role
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_established(&self) -> bool {
        self.lock().phase == Phase::Established
    }

    pub fn version(&self) -> Option<TlsVersion> {
        self.lock().version
    }

    /// Allow short writes instead of retrying until the whole buffer lands.
    pub fn set_partial_write(&self, enabled: bool) {
        self.lock().partial_write = enabled;
    }

    /// Route operations through the async job dispatcher.
    pub fn set_async(&self, enabled: bool) {
        let mut inner = self.lock();
        if enabled {
            if inner.dispatcher.is_none() {
                let mut d = Dispatcher::new(inner.ctx.job_pool());
                if let Some(cb) = inner.ctx.job_status_callback() {
                    d.set_status_callback(cb);
                }
                inner.dispatcher = Some(d);
            }
        } else {
            inner.dispatcher = None;
        }
    }

    pub fn set_options(&self, options: ConnOptions) {
        self.lock().options = options;
    }

    pub fn set_verify_peer(&self, enabled: bool) {
        self.lock().verify_peer = enabled;
    }

    /// Offer a session for resumption on the next client handshake.
    pub fn set_session(&self, session: Arc<Session>) -> Result<(), TlsError> {
        let mut inner = self.lock();
        if inner.phase != Phase::Before {
            return Err(TlsError::Sequence(
                "session can only be offered before the handshake".into(),
            ));
        }
        inner.session = Some(session);
        Ok(())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.lock().session.clone()
    }

    /// Whether the last handshake resumed an offered session.
    pub fn is_resumed(&self) -> bool {
        self.lock().hit
    }

    pub fn set_session_id_context(&self, sid_ctx: &[u8]) -> Result<(), TlsError> {
        if sid_ctx.len() > MAX_SID_CTX_LEN {
            return Err(TlsError::Config(format!(
                "session id context exceeds {MAX_SID_CTX_LEN} bytes"
            )));
        }
        self.lock().sid_ctx = sid_ctx.to_vec();
        Ok(())
    }

    pub fn session_id_context(&self) -> Vec<u8> {
        self.lock().sid_ctx.clone()
    }

    pub fn certificate_chain(&self) -> Vec<Vec<u8>> {
        self.lock().cert_chain.clone()
    }

    pub fn custom_extensions(&self) -> Vec<u16> {
        self.lock().custom_extensions.clone()
    }

    /// Drive the handshake one step; retryable conditions surface as
    /// `TlsError::Retry`.
    pub fn handshake(&self) -> Result<(), TlsError> {
        self.lock().handshake_step()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, TlsError> {
        self.lock().read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, TlsError> {
        self.lock().write(buf)
    }

    pub fn shutdown(&self) -> Result<(), TlsError> {
        self.lock().shutdown()
    }

    /// Return the connection to its pre-handshake state for reuse.
    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn write_early_data(&self, buf: &[u8]) -> Result<usize, TlsError> {
        self.lock().write_early_data(buf)
    }

    pub fn read_early_data(&self, buf: &mut [u8]) -> Result<EarlyDataRead, TlsError> {
        self.lock().read_early_data(buf)
    }

    pub fn early_data_status(&self) -> EarlyDataState {
        self.lock().early.state()
    }

    /// Duplicate the connection.
    ///
    /// An established connection is shared: the returned handle operates on
    /// the same underlying state. Otherwise a deep copy is made with the
    /// same configuration, the shared session reference, and rebuilt DANE
    /// records, but a fresh record layer and no accumulated verification or
    /// early-data state.
    pub fn duplicate(&self) -> Result<TlsConnection, TlsError> {
        let inner = self.lock();
        if inner.phase == Phase::Established {
            return Ok(TlsConnection {
                inner: Arc::clone(&self.inner),
            });
        }
        let copy = inner.deep_clone()?;
        Ok(TlsConnection {
            inner: Arc::new(Mutex::new(copy)),
        })
    }

    /// Whether two handles drive the same underlying connection.
    pub fn same_connection(&self, other: &TlsConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Move this connection to another context of the same protocol method.
    ///
    /// Certificate material and custom extensions are taken from the new
    /// context. The application tag is inherited from the new context only
    /// when the connection was still carrying the old context's tag. Not
    /// permitted while an early-data exchange is in progress.
    pub fn rebind_context(&self, new_ctx: &Arc<TlsContext>) -> Result<(), TlsError> {
        self.lock().rebind_context(new_ctx)
    }

    /// Enable DANE verification against TLSA records for `base_domain`.
    pub fn dane_enable(&self, base_domain: &str) -> Result<(), TlsError> {
        self.lock().dane_enable(base_domain)
    }

    pub fn dane_base_domain(&self) -> Option<String> {
        self.lock().dane.as_ref().map(|b| b.base_domain.clone())
    }

    /// Add one TLSA record to this connection's DANE store.
    pub fn dane_tlsa_add(
        &self,
        usage: u8,
        selector: u8,
        mtype: u8,
        data: &[u8],
    ) -> Result<(), TlsError> {
        self.lock().dane_tlsa_add(usage, selector, mtype, data)
    }

    /// Snapshot of the DANE store for the verification engine.
    pub fn dane_store(&self) -> Option<DaneStore> {
        self.lock().dane.as_ref().map(|b| b.store.clone())
    }

    /// Record a verification match on the DANE store.
    pub fn dane_record_match(&self, index: usize, depth: i32) {
        if let Some(binding) = self.lock().dane.as_mut() {
            binding.store.record_match(index, depth);
        }
    }
}

impl Clone for TlsConnection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
