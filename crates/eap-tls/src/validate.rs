//! Certificate policy pipeline
//!
//! Runs after the TLS library has verified chain signatures and path
//! building. Checks are ordered CRL, then issuer/CN policy, then OCSP, and
//! a verdict can only get worse as the pipeline runs: Accept may become
//! Reject or Defer, but a Reject is never softened by a later stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::config::EapTlsConfig;
use crate::crl::{CrlStatus, CrlStore};
use crate::error::{DeferReason, EapTlsError, RejectReason, RevocationError};
use crate::ocsp::{extract_ocsp_url, CertStatus, OcspClient, OcspRequest, OcspResponse,
    OcspResponseStatus, OcspTransport};

/// Final disposition of a peer certificate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Chain passed every enabled check
    Accept,
    /// Chain failed a definitive check
    Reject(RejectReason),
    /// A check could not be completed; fail closed without a definitive
    /// revocation claim
    Defer(DeferReason),
}

impl Verdict {
    /// Apply `next` only if it is worse than `self`. Reject is sticky.
    fn downgrade(self, next: Verdict) -> Verdict {
        match self {
            Verdict::Reject(_) => self,
            Verdict::Defer(_) => match next {
                Verdict::Reject(_) => next,
                _ => self,
            },
            Verdict::Accept => next,
        }
    }
}

/// Fields extracted from one certificate for policy checks.
#[derive(Debug, Clone)]
pub struct CertFacts {
    /// Raw DER serial number bytes
    pub serial: Vec<u8>,
    /// Issuer distinguished name, rendered as a string
    pub issuer: String,
    /// First common name in the subject, if any
    pub subject_cn: Option<String>,
    /// Leaf certificates additionally face CN and OCSP checks
    pub is_leaf: bool,
}

impl CertFacts {
    pub fn from_der(der: &[u8], is_leaf: bool) -> Result<Self, EapTlsError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| EapTlsError::Certificate(format!("failed to parse certificate: {}", e)))?;

        let subject_cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(|cn| cn.to_string());

        Ok(CertFacts {
            serial: cert.raw_serial().to_vec(),
            issuer: cert.issuer().to_string(),
            subject_cn,
            is_leaf,
        })
    }
}

/// Policy validator shared by every conversation.
pub struct CertValidator {
    config: Arc<EapTlsConfig>,
    crl_store: CrlStore,
    ocsp: Option<Box<dyn OcspTransport>>,
}

impl std::fmt::Debug for CertValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertValidator")
            .field("check_crl", &self.config.check_crl)
            .field("ocsp_enable", &self.config.ocsp_enable)
            .finish_non_exhaustive()
    }
}

impl CertValidator {
    /// Build a validator from configuration, loading static CRLs and
    /// standing up the OCSP transport as enabled.
    pub fn new(config: Arc<EapTlsConfig>) -> Result<Self, EapTlsError> {
        let crl_store = if config.check_crl {
            CrlStore::load(&config.crl_files)?
        } else {
            CrlStore::empty()
        };

        let ocsp: Option<Box<dyn OcspTransport>> = if config.ocsp_enable {
            let client = OcspClient::new(std::time::Duration::from_secs(config.ocsp_timeout_secs))?;
            Some(Box::new(client))
        } else {
            None
        };

        Ok(CertValidator {
            config,
            crl_store,
            ocsp,
        })
    }

    /// Swap in a scripted OCSP transport.
    #[cfg(test)]
    pub(crate) fn with_transport(
        config: Arc<EapTlsConfig>,
        crl_store: CrlStore,
        ocsp: Option<Box<dyn OcspTransport>>,
    ) -> Self {
        CertValidator {
            config,
            crl_store,
            ocsp,
        }
    }

    /// Run the policy pipeline over a verified chain, leaf first.
    ///
    /// `preliminary` is the verdict carried in from earlier processing;
    /// the result only ever downgrades it.
    pub fn verify_chain(
        &self,
        end_entity: &[u8],
        intermediates: &[&[u8]],
        preliminary: Verdict,
    ) -> Result<Verdict, EapTlsError> {
        let now = Utc::now();
        let mut verdict = preliminary;

        let leaf_facts = CertFacts::from_der(end_entity, true)?;
        verdict = verdict.downgrade(self.check_cert(&leaf_facts, now));

        for der in intermediates {
            let facts = CertFacts::from_der(der, false)?;
            verdict = verdict.downgrade(self.check_cert(&facts, now));
        }

        if self.config.ocsp_enable {
            if let Verdict::Reject(_) = verdict {
                // Already rejected; skip the network round trip
            } else {
                let issuer = intermediates.first().copied();
                verdict = verdict.downgrade(self.check_ocsp_leaf(end_entity, issuer));
            }
        }

        if verdict != Verdict::Accept {
            warn!(
                cn = leaf_facts.subject_cn.as_deref().unwrap_or("<none>"),
                ?verdict,
                "peer certificate failed policy checks"
            );
        }
        Ok(verdict)
    }

    /// Per-certificate checks: CRL status, then issuer and CN policy.
    pub fn check_cert(&self, facts: &CertFacts, now: DateTime<Utc>) -> Verdict {
        if self.config.check_crl {
            match self.crl_store.status(&facts.serial, now) {
                CrlStatus::Revoked => return Verdict::Reject(RejectReason::Revoked),
                CrlStatus::Expired => {
                    if !self.config.allow_expired_crl {
                        return Verdict::Reject(RejectReason::CrlExpired);
                    }
                    debug!("accepting certificate despite expired CRL");
                }
                CrlStatus::NotRevoked => {}
            }
        }

        if let Some(expected_issuer) = &self.config.check_cert_issuer {
            if &facts.issuer != expected_issuer {
                debug!(got = %facts.issuer, want = %expected_issuer, "issuer mismatch");
                return Verdict::Reject(RejectReason::IssuerMismatch);
            }
        }

        if facts.is_leaf {
            if let Some(expected_cn) = &self.config.check_cert_cn {
                match &facts.subject_cn {
                    Some(cn) if cn == expected_cn => {}
                    _ => {
                        debug!(
                            got = facts.subject_cn.as_deref().unwrap_or("<none>"),
                            want = %expected_cn,
                            "common name mismatch"
                        );
                        return Verdict::Reject(RejectReason::CnMismatch);
                    }
                }
            }
        }

        Verdict::Accept
    }

    /// Query the OCSP responder about the leaf certificate.
    ///
    /// Any failure to get a definitive answer is a Defer, never an Accept:
    /// no responder URL, transport errors, and non-Successful statuses all
    /// fail closed.
    pub fn check_ocsp_leaf(&self, leaf_der: &[u8], issuer_der: Option<&[u8]>) -> Verdict {
        let transport = match &self.ocsp {
            Some(transport) => transport,
            None => return Verdict::Accept,
        };

        let url = match self.responder_url(leaf_der) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "failed to determine OCSP responder URL");
                return Verdict::Defer(DeferReason::OcspUnreachable);
            }
        };

        // Without the issuer certificate the CertID hashes cannot be built
        let issuer_der = match issuer_der {
            Some(der) => der,
            None => {
                warn!("no issuer certificate available for OCSP request");
                return Verdict::Defer(DeferReason::OcspUnreachable);
            }
        };

        let response = match self.query_responder(transport.as_ref(), &url, leaf_der, issuer_der) {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "OCSP query failed");
                return Verdict::Defer(DeferReason::OcspUnreachable);
            }
        };

        if response.status != OcspResponseStatus::Successful {
            warn!(status = ?response.status, "OCSP responder did not answer");
            return Verdict::Defer(DeferReason::OcspUnreachable);
        }

        match response.cert_status {
            Some(CertStatus::Good) => Verdict::Accept,
            Some(CertStatus::Revoked { revocation_time, .. }) => {
                warn!(%revocation_time, "OCSP reports certificate revoked");
                Verdict::Reject(RejectReason::OcspRevoked)
            }
            Some(CertStatus::Unknown) => Verdict::Reject(RejectReason::OcspUnknown),
            None => Verdict::Defer(DeferReason::OcspUnreachable),
        }
    }

    fn responder_url(&self, leaf_der: &[u8]) -> Result<String, RevocationError> {
        if self.config.ocsp_override_url {
            return self
                .config
                .ocsp_url
                .clone()
                .ok_or(RevocationError::NoResponderUrl);
        }
        match extract_ocsp_url(leaf_der)? {
            Some(url) => Ok(url),
            None => self
                .config
                .ocsp_url
                .clone()
                .ok_or(RevocationError::NoResponderUrl),
        }
    }

    fn query_responder(
        &self,
        transport: &dyn OcspTransport,
        url: &str,
        leaf_der: &[u8],
        issuer_der: &[u8],
    ) -> Result<OcspResponse, RevocationError> {
        let request = OcspRequest::new(leaf_der, issuer_der)?.build();
        let raw = transport.query(url, &request)?;
        OcspResponse::parse(&raw)
    }
}
