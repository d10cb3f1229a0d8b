//! Error taxonomy for the EAP-TLS method engine
//!
//! Errors fall into four families with distinct handling:
//!
//! - [`ProtocolViolation`]: malformed or out-of-sequence fragment framing.
//!   Always fatal to the conversation, surfaced as EAP-Failure.
//! - [`RejectReason`]: the certificate validation pipeline rejected the peer.
//!   Fatal, with the reason preserved for audit logging.
//! - [`DeferReason`]: a revocation check could not be completed (e.g. the
//!   OCSP responder was unreachable). Not retried here; the caller decides
//!   policy, typically fail-closed.
//! - Resource pressure (session cache at capacity) is handled internally by
//!   eviction and never surfaces to the peer.

use thiserror::Error;

/// Fragment-framing violations. Each one terminates the conversation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("malformed EAP-TLS fragment framing")]
    MalformedFraming,

    #[error("fragment data would exceed the declared total length")]
    LengthOverflow,

    #[error("reassembled length does not match the declared total length")]
    LengthMismatch,

    #[error("fragment arrived in an unexpected state")]
    OutOfOrderFragment,

    #[error("peer sent TLS data while our outbound fragment series is still outstanding")]
    UnexpectedFragmentWhileSending,
}

/// Reasons the validation pipeline rejects a certificate. Closed set.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("certificate is listed in a CRL")]
    Revoked,

    #[error("CRL covering the certificate has expired")]
    CrlExpired,

    #[error("certificate issuer does not match the configured pattern")]
    IssuerMismatch,

    #[error("certificate common name does not match the configured pattern")]
    CnMismatch,

    #[error("OCSP responder reported the certificate revoked")]
    OcspRevoked,

    #[error("OCSP responder does not know the certificate")]
    OcspUnknown,
}

/// Reasons a validation stage defers rather than deciding. Closed set.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    #[error("OCSP responder unreachable or timed out")]
    OcspUnreachable,
}

/// Errors raised while loading or querying revocation data (CRL files,
/// OCSP requests and responses).
#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("CRL parse error: {0}")]
    CrlParse(String),

    #[error("OCSP parse error: {0}")]
    OcspParse(String),

    #[error("OCSP transport error: {0}")]
    Transport(String),

    #[error("certificate parse error: {0}")]
    Certificate(String),

    #[error("no OCSP responder URL available for certificate")]
    NoResponderUrl,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for the EAP-TLS method engine.
#[derive(Debug, Error)]
pub enum EapTlsError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("certificate validation failed: {0}")]
    Validation(RejectReason),

    #[error("validation deferred: {0}")]
    Transient(DeferReason),

    #[error("revocation data error: {0}")]
    Revocation(#[from] RevocationError),

    #[error("TLS engine error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("conversation is finished and cannot accept packets")]
    ConversationDone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
