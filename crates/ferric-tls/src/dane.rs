//! DANE/TLSA authentication records.
//!
//! The context owns a matching-type table mapping each matching-type
//! identifier to a digest algorithm and an ordinal preference. Each
//! connection owns an ordered list of TLSA records built against that table.
//! The verification engine consumes the list; this module only validates,
//! orders, and stores it.

use ferric_types::{HashAlgId, TlsError};

use crate::provider::{CryptoProvider, PeerCertificate, PeerPublicKey};

/// Matching type: compare the full data.
pub const MATCHING_FULL: u8 = 0;
/// Matching type: compare a SHA-256 digest.
pub const MATCHING_SHA256: u8 = 1;
/// Matching type: compare a SHA-512 digest.
pub const MATCHING_SHA512: u8 = 2;

const MATCHING_LAST: u8 = MATCHING_SHA512;

/// TLSA certificate usage (RFC 6698).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TlsaUsage {
    /// CA constraint: PKIX validation plus a matching trust anchor.
    PkixTa = 0,
    /// Service certificate constraint: PKIX validation plus a matching leaf.
    PkixEe = 1,
    /// Trust anchor assertion: DANE-supplied trust anchor.
    DaneTa = 2,
    /// Domain-issued certificate: matching leaf, no chain building.
    DaneEe = 3,
}

impl TlsaUsage {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TlsaUsage::PkixTa),
            1 => Some(TlsaUsage::PkixEe),
            2 => Some(TlsaUsage::DaneTa),
            3 => Some(TlsaUsage::DaneEe),
            _ => None,
        }
    }

    /// Whether this usage augments the chain with trust-anchor material.
    /// For end-entity usages the peer always presents the leaf, so cached
    /// certificate material would never be consulted.
    pub fn augments_trust_anchors(&self) -> bool {
        matches!(self, TlsaUsage::PkixTa | TlsaUsage::DaneTa)
    }

    /// Bit for the per-connection usage mask.
    pub fn bit(&self) -> u32 {
        1 << (*self as u8)
    }
}

/// TLSA selector (RFC 6698).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TlsaSelector {
    /// Match against the full certificate.
    Cert = 0,
    /// Match against the SubjectPublicKeyInfo.
    Spki = 1,
}

impl TlsaSelector {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TlsaSelector::Cert),
            1 => Some(TlsaSelector::Spki),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MatchSlot {
    md: Option<HashAlgId>,
    ord: u8,
}

/// Context-wide matching-type table: digest algorithm and ordinal preference
/// per matching-type identifier. Sparse; grows on demand with zero-filled
/// gaps.
#[derive(Debug, Clone, Default)]
pub struct DaneTable {
    slots: Vec<MatchSlot>,
    flags: u32,
}

impl DaneTable {
    /// Whether [`enable`](Self::enable) has been called on this table.
    pub fn is_enabled(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Install the built-in matching types. Idempotent.
    pub fn enable(&mut self) {
        if self.is_enabled() {
            return;
        }
        self.slots = vec![MatchSlot::default(); MATCHING_LAST as usize + 1];
        self.slots[MATCHING_SHA256 as usize] = MatchSlot {
            md: Some(HashAlgId::Sha256),
            ord: 1,
        };
        self.slots[MATCHING_SHA512 as usize] = MatchSlot {
            md: Some(HashAlgId::Sha512),
            ord: 2,
        };
        // MATCHING_FULL keeps a null digest and ordinal 0.
    }

    /// Register or update a matching type.
    ///
    /// The full-match type cannot carry a digest. A null digest disables the
    /// type; its ordinal is coerced to zero so disabled types sort last.
    pub fn set_mtype(
        &mut self,
        md: Option<HashAlgId>,
        mtype: u8,
        ord: u8,
    ) -> Result<(), TlsError> {
        if mtype == MATCHING_FULL && md.is_some() {
            return Err(TlsError::Config(
                "cannot override the full matching type with a digest".into(),
            ));
        }
        if mtype as usize >= self.slots.len() {
            self.slots.resize(mtype as usize + 1, MatchSlot::default());
        }
        self.slots[mtype as usize] = MatchSlot {
            md,
            ord: if md.is_none() { 0 } else { ord },
        };
        Ok(())
    }

    /// Digest algorithm for a matching type, if registered and enabled.
    pub fn digest_for(&self, mtype: u8) -> Option<HashAlgId> {
        self.slots.get(mtype as usize).and_then(|s| s.md)
    }

    /// Ordinal preference for a matching type (0 for unknown/disabled).
    pub fn ordinal(&self, mtype: u8) -> u8 {
        self.slots.get(mtype as usize).map(|s| s.ord).unwrap_or(0)
    }

    /// Set DANE behavior flags; returns the previous flags.
    pub fn set_flags(&mut self, flags: u32) -> u32 {
        let orig = self.flags;
        self.flags |= flags;
        orig
    }

    /// Clear DANE behavior flags; returns the previous flags.
    pub fn clear_flags(&mut self, flags: u32) -> u32 {
        let orig = self.flags;
        self.flags &= !flags;
        orig
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

/// One TLSA record held by a connection.
#[derive(Debug, Clone)]
pub struct TlsaRecord {
    pub usage: TlsaUsage,
    pub selector: TlsaSelector,
    pub mtype: u8,
    pub data: Vec<u8>,
    /// Bare trust-anchor key, cached only for DANE-TA SPKI records.
    pub spki: Option<PeerPublicKey>,
}

/// Per-connection store of TLSA records and accumulated verification state.
#[derive(Debug, Clone, Default)]
pub struct DaneStore {
    records: Vec<TlsaRecord>,
    /// Trust-anchor certificates recovered from full-data records, used to
    /// augment the presented chain.
    ta_certs: Vec<PeerCertificate>,
    usage_mask: u32,
    flags: u32,
    /// Depth of the matched record within the verified chain; -1 when no
    /// match has been recorded.
    match_depth: i32,
    /// Depth reached by PKIX policy evaluation; -1 before verification.
    pkix_depth: i32,
    matched: Option<usize>,
}

impl DaneStore {
    pub fn new(flags: u32) -> Self {
        Self {
            flags,
            match_depth: -1,
            pkix_depth: -1,
            ..Self::default()
        }
    }

    /// Records in verification order (descending usage, selector, ordinal).
    pub fn records(&self) -> &[TlsaRecord] {
        &self.records
    }

    /// Trust-anchor certificates recovered from full-data records.
    pub fn trust_anchor_certs(&self) -> &[PeerCertificate] {
        &self.ta_certs
    }

    /// Bitmask of usages present in the record list.
    pub fn usage_mask(&self) -> u32 {
        self.usage_mask
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Verification outcome written by the verification engine.
    pub fn record_match(&mut self, index: usize, depth: i32) {
        self.matched = Some(index);
        self.match_depth = depth;
    }

    pub fn set_pkix_depth(&mut self, depth: i32) {
        self.pkix_depth = depth;
    }

    pub fn matched(&self) -> Option<(usize, i32)> {
        self.matched.map(|i| (i, self.match_depth))
    }

    pub fn pkix_depth(&self) -> i32 {
        self.pkix_depth
    }

    /// Drop accumulated verification results, keeping the configuration.
    pub fn clear_verify_state(&mut self) {
        self.matched = None;
        self.match_depth = -1;
        self.pkix_depth = -1;
    }

    /// Validate and insert a TLSA record at its sorted position.
    ///
    /// Digest-type records must match the digest's output length exactly.
    /// Full-data records must parse as a certificate or public key; a parsed
    /// certificate is cached only for trust-anchor-augmenting usages, a
    /// parsed key only for DANE-TA.
    ///
    /// `Err(Validation)` is recoverable (bad input, list unchanged);
    /// `Err(Config)`/`Err(Resource)` are not.
    pub fn add_record(
        &mut self,
        table: &DaneTable,
        provider: &dyn CryptoProvider,
        usage: u8,
        selector: u8,
        mtype: u8,
        data: &[u8],
    ) -> Result<(), TlsError> {
        let usage = TlsaUsage::from_u8(usage)
            .ok_or_else(|| TlsError::Validation(format!("bad certificate usage {usage}")))?;
        let selector = TlsaSelector::from_u8(selector)
            .ok_or_else(|| TlsError::Validation(format!("bad selector {selector}")))?;

        if data.is_empty() {
            return Err(TlsError::Validation("empty record data".into()));
        }

        if mtype != MATCHING_FULL {
            let md = table
                .digest_for(mtype)
                .ok_or_else(|| TlsError::Validation(format!("bad matching type {mtype}")))?;
            let mdsize = provider
                .digest_len(md)
                .ok_or_else(|| TlsError::Config(format!("digest {md:?} unavailable")))?;
            if data.len() != mdsize {
                return Err(TlsError::Validation(format!(
                    "bad digest length: expected {mdsize}, got {}",
                    data.len()
                )));
            }
        }

        let mut record = TlsaRecord {
            usage,
            selector,
            mtype,
            data: data.to_vec(),
            spki: None,
        };

        // Full-data payloads must be well formed even though they are
        // otherwise opaque blobs for matching.
        let mut ta_cert = None;
        if mtype == MATCHING_FULL {
            match selector {
                TlsaSelector::Cert => {
                    let cert = provider.parse_certificate(data)?;
                    if usage.augments_trust_anchors() {
                        ta_cert = Some(cert);
                    }
                }
                TlsaSelector::Spki => {
                    let key = provider.parse_public_key(data)?;
                    if usage == TlsaUsage::DaneTa {
                        record.spki = Some(key);
                    }
                }
            }
        }

        // Descending sort by usage, then selector, then matching ordinal.
        // DANE-EE(3) is numerically largest so it lands first, letting the
        // verifier inspect records that need no chain building before any
        // others. Insert before the first record that is not >= the new one.
        let ord = table.ordinal(mtype);
        let mut at = self.records.len();
        for (i, rec) in self.records.iter().enumerate() {
            if rec.usage > record.usage {
                continue;
            }
            if rec.usage < record.usage {
                at = i;
                break;
            }
            if rec.selector > record.selector {
                continue;
            }
            if rec.selector < record.selector {
                at = i;
                break;
            }
            if table.ordinal(rec.mtype) > ord {
                continue;
            }
            at = i;
            break;
        }

        self.records.insert(at, record);
        self.usage_mask |= usage.bit();
        if let Some(cert) = ta_cert {
            self.ta_certs.push(cert);
        }
        Ok(())
    }
}
