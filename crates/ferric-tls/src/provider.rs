//! Crypto provider seam: digest lookup and certificate/public-key parsing.
//!
//! The control plane never implements cryptography. It resolves digest sizes
//! and validates full-data TLSA payloads through this trait, so the backing
//! implementation can be swapped without touching connection logic.

use std::sync::Arc;

use ferric_types::{HashAlgId, TlsError};

/// A parsed peer certificate, opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    der: Vec<u8>,
}

impl PeerCertificate {
    pub fn new(der: Vec<u8>) -> Self {
        Self { der }
    }

    /// The DER encoding this certificate was parsed from.
    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// A parsed subject public key, opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPublicKey {
    der: Vec<u8>,
}

impl PeerPublicKey {
    pub fn new(der: Vec<u8>) -> Self {
        Self { der }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// Digest lookup and parse-from-bytes primitives consumed by the control
/// plane. A `None` digest length means the algorithm is unavailable.
pub trait CryptoProvider: Send + Sync {
    /// Output size of the given digest, or `None` if unsupported.
    fn digest_len(&self, alg: HashAlgId) -> Option<usize>;

    /// Parse a DER-encoded X.509 certificate.
    fn parse_certificate(&self, der: &[u8]) -> Result<PeerCertificate, TlsError>;

    /// Parse a DER-encoded SubjectPublicKeyInfo.
    fn parse_public_key(&self, der: &[u8]) -> Result<PeerPublicKey, TlsError>;
}

/// Shared handle to a crypto provider.
pub type ProviderHandle = Arc<dyn CryptoProvider>;

/// Structural DER validation: the payload must be a single definite-length
/// SEQUENCE spanning the whole buffer. Chain building and signature checks
/// belong to the verification engine, not here.
#[derive(Debug, Default)]
pub struct DerCheckProvider;

impl DerCheckProvider {
    fn check_envelope(der: &[u8], what: &str) -> Result<(), TlsError> {
        let err = || TlsError::Validation(format!("malformed {what}"));
        if der.len() < 2 || der[0] != 0x30 {
            return Err(err());
        }
        let first = der[1];
        let (len, hdr) = if first < 0x80 {
            (first as usize, 2)
        } else if first == 0x80 {
            // Indefinite length is not valid DER
            return Err(err());
        } else {
            let num_bytes = (first & 0x7F) as usize;
            if num_bytes > 4 || der.len() < 2 + num_bytes {
                return Err(err());
            }
            let mut len = 0usize;
            for &b in &der[2..2 + num_bytes] {
                len = (len << 8) | b as usize;
            }
            (len, 2 + num_bytes)
        };
        // Trailing or missing bytes mean the value is not a lone DER object.
        if hdr + len != der.len() {
            return Err(err());
        }
        Ok(())
    }
}

impl CryptoProvider for DerCheckProvider {
    fn digest_len(&self, alg: HashAlgId) -> Option<usize> {
        Some(alg.output_len())
    }

    fn parse_certificate(&self, der: &[u8]) -> Result<PeerCertificate, TlsError> {
        Self::check_envelope(der, "certificate")?;
        Ok(PeerCertificate::new(der.to_vec()))
    }

    fn parse_public_key(&self, der: &[u8]) -> Result<PeerPublicKey, TlsError> {
        Self::check_envelope(der, "public key")?;
        Ok(PeerPublicKey::new(der.to_vec()))
    }
}
