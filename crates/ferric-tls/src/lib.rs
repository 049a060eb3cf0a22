#![forbid(unsafe_code)]
#![doc = "Connection and session control plane for the ferric TLS engine."]

pub mod connection;
pub mod context;
pub mod dane;
pub mod early_data;
pub mod engine;
pub mod job;
pub mod keylog;
pub mod provider;
pub mod session;

pub use ferric_types::{HashAlgId, Retry, TlsError};

pub use connection::{ConnOptions, Phase, TlsConnection};
pub use context::{CacheUpdate, StatsSnapshot, TlsContext, TlsContextBuilder};
pub use dane::{DaneStore, DaneTable, TlsaRecord, TlsaSelector, TlsaUsage};
pub use early_data::{EarlyDataRead, EarlyDataState};
pub use engine::{EarlyDataDisposition, ProtocolEngine, UnboundEngine};
pub use job::{JobKind, JobPool, JobStatus};
pub use provider::{CryptoProvider, DerCheckProvider, PeerCertificate, PeerPublicKey};
pub use session::{CacheMode, Session, SessionKey, SessionStore};

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Tls12,
    Tls13,
    Dtls12,
}

/// TLS cipher suite identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    // TLS 1.3 cipher suites
    pub const TLS_AES_128_GCM_SHA256: Self = Self(0x1301);
    pub const TLS_AES_256_GCM_SHA384: Self = Self(0x1302);
    pub const TLS_CHACHA20_POLY1305_SHA256: Self = Self(0x1303);

    // TLS 1.2 cipher suites (representative)
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02F);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02B);
}

/// The role of a TLS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// Protocol method selecting which family of state machines a context drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMethod {
    Tls,
    Dtls,
}

impl ProtocolMethod {
    /// Default protocol version bounds for this method.
    pub fn version_bounds(&self) -> (TlsVersion, TlsVersion) {
        match self {
            ProtocolMethod::Tls => (TlsVersion::Tls12, TlsVersion::Tls13),
            ProtocolMethod::Dtls => (TlsVersion::Dtls12, TlsVersion::Dtls12),
        }
    }
}
