//! EAP-TLS method configuration
//!
//! One [`EapTlsConfig`] is loaded per server instance and shared read-only by
//! every conversation. Options mirror the classic EAP-TLS module surface:
//! key/certificate material, fragment sizing, session caching, CRL/OCSP
//! revocation checking, and issuer/CN policy patterns.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::EapTlsError;
use crate::session::MAX_SESSION_ID_LEN;

/// Upper bound on the fragment size. The RADIUS transport caps EAP-Message
/// payloads well below 4096 bytes.
pub const MAX_FRAGMENT_SIZE: usize = 4096;

/// EAP-TLS server configuration.
///
/// Immutable once loaded; per-conversation state only holds a shared
/// reference to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EapTlsConfig {
    /// Server private key (PEM)
    pub private_key_file: String,

    /// Optional passphrase for the private key
    #[serde(default)]
    pub private_key_password: Option<String>,

    /// Server certificate chain (PEM)
    pub certificate_file: String,

    /// CA certificate(s) used to verify the peer chain (PEM)
    pub ca_file: String,

    /// Directory of additional CA certificates
    #[serde(default)]
    pub ca_path: Option<String>,

    /// Diffie-Hellman parameter file for ephemeral key exchange
    #[serde(default)]
    pub dh_file: Option<String>,

    /// OpenSSL-style cipher list; `None` uses the TLS backend defaults
    #[serde(default)]
    pub cipher_list: Option<String>,

    /// Maximum peer chain depth accepted during verification
    #[serde(default = "default_verify_depth")]
    pub verify_depth: usize,

    /// Maximum TLS data bytes per EAP-TLS fragment.
    ///
    /// Must be below the RADIUS transport ceiling (practically < 4096).
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    /// Set the Length-Included flag even on unfragmented outbound packets
    #[serde(default)]
    pub include_length: bool,

    /// Enable the TLS session resumption cache
    #[serde(default = "default_true")]
    pub session_cache_enable: bool,

    /// Cached sessions become unusable after this many seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Maximum number of cached sessions; oldest evicted first
    #[serde(default = "default_session_cache_size")]
    pub session_cache_size: usize,

    /// Label prefixed to session cache keys, isolating instances that share
    /// a cache. Must not exceed [`MAX_SESSION_ID_LEN`] bytes.
    #[serde(default = "default_session_id_label")]
    pub session_id_label: String,

    /// Check peer certificates against the loaded CRLs
    #[serde(default)]
    pub check_crl: bool,

    /// Accept certificates whose covering CRL has expired
    #[serde(default)]
    pub allow_expired_crl: bool,

    /// Static CRL files to load at startup (PEM or DER)
    #[serde(default)]
    pub crl_files: Vec<String>,

    /// If set, the peer chain issuer must match this value exactly
    #[serde(default)]
    pub check_cert_issuer: Option<String>,

    /// If set, the leaf certificate common name must match this value exactly
    #[serde(default)]
    pub check_cert_cn: Option<String>,

    /// Enable OCSP revocation checking of the leaf certificate
    #[serde(default)]
    pub ocsp_enable: bool,

    /// Ignore the certificate's AIA responder URL and always use `ocsp_url`
    #[serde(default)]
    pub ocsp_override_url: bool,

    /// OCSP responder URL; fallback when the certificate carries no AIA
    /// entry, or the only URL when `ocsp_override_url` is set
    #[serde(default)]
    pub ocsp_url: Option<String>,

    /// HTTP timeout for OCSP queries in seconds
    #[serde(default = "default_ocsp_timeout")]
    pub ocsp_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_verify_depth() -> usize {
    6
}

fn default_fragment_size() -> usize {
    2048
}

fn default_session_timeout() -> u64 {
    86400
}

fn default_session_cache_size() -> usize {
    255
}

fn default_session_id_label() -> String {
    "eap-tls".to_string()
}

fn default_ocsp_timeout() -> u64 {
    5
}

impl EapTlsConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, EapTlsError> {
        let contents = fs::read_to_string(path)?;
        let config: EapTlsConfig = serde_json::from_str(&contents)
            .map_err(|e| EapTlsError::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    ///
    /// Rejects out-of-range values outright rather than clamping or
    /// truncating them.
    pub fn validate(&self) -> Result<(), EapTlsError> {
        if self.fragment_size == 0 || self.fragment_size >= MAX_FRAGMENT_SIZE {
            return Err(EapTlsError::Config(format!(
                "fragment_size must be between 1 and {} (got {})",
                MAX_FRAGMENT_SIZE - 1,
                self.fragment_size
            )));
        }

        if self.session_id_label.len() > MAX_SESSION_ID_LEN {
            return Err(EapTlsError::Config(format!(
                "session_id_label exceeds {} bytes (got {})",
                MAX_SESSION_ID_LEN,
                self.session_id_label.len()
            )));
        }

        if self.session_cache_enable && self.session_cache_size == 0 {
            return Err(EapTlsError::Config(
                "session_cache_size must be non-zero when the cache is enabled".to_string(),
            ));
        }

        if self.verify_depth == 0 {
            return Err(EapTlsError::Config(
                "verify_depth must be at least 1".to_string(),
            ));
        }

        if self.ocsp_override_url && self.ocsp_url.is_none() {
            return Err(EapTlsError::Config(
                "ocsp_override_url requires ocsp_url to be set".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for EapTlsConfig {
    fn default() -> Self {
        EapTlsConfig {
            private_key_file: "server-key.pem".to_string(),
            private_key_password: None,
            certificate_file: "server-cert.pem".to_string(),
            ca_file: "ca.pem".to_string(),
            ca_path: None,
            dh_file: None,
            cipher_list: None,
            verify_depth: default_verify_depth(),
            fragment_size: default_fragment_size(),
            include_length: false,
            session_cache_enable: true,
            session_timeout_secs: default_session_timeout(),
            session_cache_size: default_session_cache_size(),
            session_id_label: default_session_id_label(),
            check_crl: false,
            allow_expired_crl: false,
            crl_files: vec![],
            check_cert_issuer: None,
            check_cert_cn: None,
            ocsp_enable: false,
            ocsp_override_url: false,
            ocsp_url: None,
            ocsp_timeout_secs: default_ocsp_timeout(),
        }
    }
}
