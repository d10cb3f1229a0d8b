//! Client certificate verifier with policy checks
//!
//! [`PolicyVerifier`] wraps rustls's `WebPkiClientVerifier`: chain building,
//! expiry, and signatures stay with webpki, then the policy pipeline from
//! [`crate::validate`] runs over the verified chain. Because rustls only
//! lets a verifier answer pass or fail, the detailed [`Verdict`] is parked
//! in a slot for the conversation engine to collect after the handshake
//! attempt.

use std::sync::{Arc, Mutex};

use pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error as RustlsError};
use tracing::warn;

use crate::validate::{CertValidator, Verdict};

/// One verifier instance serves one TLS connection; the verdict slot is
/// not meaningful across connections.
#[derive(Debug)]
pub struct PolicyVerifier {
    webpki_verifier: Arc<dyn ClientCertVerifier>,
    validator: Arc<CertValidator>,
    verdict: Mutex<Option<Verdict>>,
}

impl PolicyVerifier {
    pub fn new(webpki_verifier: Arc<dyn ClientCertVerifier>, validator: Arc<CertValidator>) -> Self {
        PolicyVerifier {
            webpki_verifier,
            validator,
            verdict: Mutex::new(None),
        }
    }

    /// The verdict recorded by the last `verify_client_cert` call, if any.
    pub fn verdict(&self) -> Option<Verdict> {
        match self.verdict.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn record(&self, verdict: Verdict) {
        match self.verdict.lock() {
            Ok(mut guard) => *guard = Some(verdict),
            Err(poisoned) => *poisoned.into_inner() = Some(verdict),
        }
    }
}

impl ClientCertVerifier for PolicyVerifier {
    fn offer_client_auth(&self) -> bool {
        self.webpki_verifier.offer_client_auth()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.webpki_verifier.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, RustlsError> {
        // webpki handles chain building, expiry, and signatures first
        self.webpki_verifier
            .verify_client_cert(end_entity, intermediates, now)?;

        let intermediate_ders: Vec<&[u8]> =
            intermediates.iter().map(|der| der.as_ref()).collect();

        let verdict = self
            .validator
            .verify_chain(end_entity.as_ref(), &intermediate_ders, Verdict::Accept)
            .map_err(|e| {
                warn!(error = %e, "policy pipeline failed");
                RustlsError::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
            })?;

        self.record(verdict);

        match verdict {
            Verdict::Accept => Ok(ClientCertVerified::assertion()),
            Verdict::Reject(_) => Err(RustlsError::InvalidCertificate(
                rustls::CertificateError::Revoked,
            )),
            Verdict::Defer(_) => Err(RustlsError::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, RustlsError> {
        self.webpki_verifier
            .verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, RustlsError> {
        self.webpki_verifier
            .verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.webpki_verifier.supported_verify_schemes()
    }
}
