//! EAP-TLS Authentication Method Engine
//!
//! This crate implements the EAP-TLS method (RFC 5216) for a RADIUS server:
//! the fragmentation and reassembly state machine that carries TLS records
//! over EAP, a TLS engine abstraction backed by rustls, a certificate policy
//! pipeline (CRL, issuer/CN matching, OCSP), and a bounded session
//! resumption cache.
//!
//! # Conversation flow
//!
//! 1. The server opens a conversation with an EAP-TLS Start request
//! 2. TLS records flow in both directions, fragmented to `fragment_size`
//!    and acknowledged with empty EAP-TLS packets
//! 3. During the handshake the peer chain passes webpki verification and
//!    then the policy pipeline
//! 4. On success the MSK and EMSK are derived via the RFC 5705 exporter
//!    and the session is cached for resumption
//!
//! # Example
//!
//! ```no_run
//! use eap_tls::{CertValidator, EapTlsConfig, EapTlsMethod, RustlsBackend};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), eap_tls::EapTlsError> {
//! let config = Arc::new(EapTlsConfig::from_file("eap-tls.json")?);
//! let validator = Arc::new(CertValidator::new(config.clone())?);
//! let backend = Arc::new(RustlsBackend::from_config(&config, validator)?);
//!
//! let mut method = EapTlsMethod::new(config, backend);
//! let start = method.begin(b"user@example.com")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conversation;
pub mod crl;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod ocsp;
pub mod reassembly;
pub mod session;
pub mod validate;
pub mod verifier;

pub use config::EapTlsConfig;
pub use conversation::{ConversationEngine, EapTlsMethod, EapTlsOutput, FailureReason};
pub use crl::{Crl, CrlStatus, CrlStore};
pub use engine::{Emsk, Msk, RustlsBackend, RustlsEngine, TlsBackend, TlsEngine};
pub use error::{DeferReason, EapTlsError, ProtocolViolation, RejectReason, RevocationError};
pub use fragment::{EapTlsPacket, FragmentBuffer, TlsFlags, MAX_MESSAGE_SIZE};
pub use ocsp::{CertStatus, OcspClient, OcspRequest, OcspResponse, OcspTransport};
pub use reassembly::{ReassemblyPhase, ReassemblyState};
pub use session::{SessionCache, SessionMaterial, MAX_SESSION_ID_LEN};
pub use validate::{CertFacts, CertValidator, Verdict};
pub use verifier::PolicyVerifier;
