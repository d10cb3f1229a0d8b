//! CRL parsing and revocation lookup (RFC 5280)
//!
//! CRLs are loaded once at startup into a [`CrlStore`] and consulted on
//! every peer chain. Serial number lookup is O(1) via HashSet; freshness
//! is judged against the nextUpdate field at check time, not load time,
//! so a long-running server notices when its static CRLs go stale.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::error::RevocationError;

/// One parsed certificate revocation list.
#[derive(Debug, Clone)]
pub struct Crl {
    /// Issuer distinguished name
    pub issuer: String,

    /// When this CRL was issued
    pub this_update: DateTime<Utc>,

    /// When the next CRL is due; optional per RFC 5280
    pub next_update: Option<DateTime<Utc>>,

    /// Revoked certificate serial numbers (raw DER integer bytes)
    pub(crate) revoked_serials: HashSet<Vec<u8>>,
}

impl Crl {
    /// Parse a DER-encoded CRL.
    ///
    /// Signature verification is out of scope here; static CRL files are
    /// trusted as configured.
    pub fn parse_der(crl_der: &[u8]) -> Result<Self, RevocationError> {
        let (_, crl) = parse_x509_crl(crl_der)
            .map_err(|e| RevocationError::CrlParse(format!("failed to parse CRL DER: {}", e)))?;

        let issuer = crl.issuer().to_string();

        let this_update = asn1_time_to_chrono(&crl.last_update())
            .ok_or_else(|| RevocationError::CrlParse("invalid thisUpdate time".to_string()))?;
        let next_update = crl.next_update().and_then(|t| asn1_time_to_chrono(&t));

        let mut revoked_serials = HashSet::new();
        for revoked in crl.iter_revoked_certificates() {
            revoked_serials.insert(revoked.raw_serial().to_vec());
        }

        Ok(Crl {
            issuer,
            this_update,
            next_update,
            revoked_serials,
        })
    }

    /// Parse a PEM-encoded CRL.
    pub fn parse_pem(pem_data: &[u8]) -> Result<Self, RevocationError> {
        let pem = x509_parser::pem::parse_x509_pem(pem_data)
            .map_err(|e| RevocationError::CrlParse(format!("failed to parse CRL PEM: {}", e)))?;
        Self::parse_der(&pem.1.contents)
    }

    /// Parse a CRL file, sniffing PEM vs DER from the leading bytes.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self, RevocationError> {
        let contents = fs::read(path)?;
        if contents.starts_with(b"-----BEGIN") {
            Self::parse_pem(&contents)
        } else {
            Self::parse_der(&contents)
        }
    }

    /// O(1) revocation check against this CRL.
    pub fn is_revoked(&self, serial: &[u8]) -> bool {
        self.revoked_serials.contains(serial)
    }

    /// True once `now` has passed nextUpdate. A CRL without nextUpdate
    /// never expires (discouraged but legal per RFC 5280).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.next_update {
            Some(next_update) => next_update <= now,
            None => false,
        }
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked_serials.len()
    }
}

/// Outcome of consulting the CRL store for one serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlStatus {
    /// No loaded CRL lists this serial
    NotRevoked,
    /// A loaded CRL lists this serial
    Revoked,
    /// The serial is not listed, but at least one CRL has expired so the
    /// answer cannot be trusted
    Expired,
}

/// All CRLs loaded from configuration.
#[derive(Debug, Default)]
pub struct CrlStore {
    crls: Vec<Crl>,
}

impl CrlStore {
    pub fn empty() -> Self {
        CrlStore::default()
    }

    /// Load every configured CRL file. Any unreadable or unparseable file
    /// fails the load; a server silently missing a CRL would fail open.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, RevocationError> {
        let mut crls = Vec::with_capacity(paths.len());
        for path in paths {
            let crl = Crl::parse_file(path)?;
            debug!(
                issuer = %crl.issuer,
                revoked = crl.revoked_count(),
                "loaded CRL"
            );
            crls.push(crl);
        }
        Ok(CrlStore { crls })
    }

    /// Check one serial against every loaded CRL.
    ///
    /// Revocation wins over expiry: a serial listed on any CRL is
    /// [`CrlStatus::Revoked`] even if another CRL has lapsed. An empty
    /// store reports [`CrlStatus::NotRevoked`].
    pub fn status(&self, serial: &[u8], now: DateTime<Utc>) -> CrlStatus {
        let mut any_expired = false;
        for crl in &self.crls {
            if crl.is_revoked(serial) {
                return CrlStatus::Revoked;
            }
            if crl.is_expired_at(now) {
                warn!(issuer = %crl.issuer, "CRL has expired");
                any_expired = true;
            }
        }
        if any_expired {
            CrlStatus::Expired
        } else {
            CrlStatus::NotRevoked
        }
    }

    pub fn is_empty(&self) -> bool {
        self.crls.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn from_crls(crls: Vec<Crl>) -> Self {
        CrlStore { crls }
    }
}

fn asn1_time_to_chrono(asn1_time: &ASN1Time) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(asn1_time.timestamp(), 0).single()
}
