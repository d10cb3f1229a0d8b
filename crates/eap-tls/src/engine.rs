//! TLS engine abstraction and the rustls backend
//!
//! The conversation layer never touches rustls directly. It feeds complete
//! reassembled TLS records into a [`TlsEngine`], drains whatever the engine
//! wants to send back, and asks for keys and a verdict once the handshake
//! settles. The indirection keeps the fragmentation and conversation logic
//! testable without certificates or a network.

use std::fs;
use std::io::{BufReader, Cursor};
use std::sync::Arc;

use pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use tracing::debug;

use crate::config::EapTlsConfig;
use crate::error::EapTlsError;
use crate::session::SessionMaterial;
use crate::validate::{CertValidator, Verdict};
use crate::verifier::PolicyVerifier;

/// Master Session Key, RFC 5216 section 2.3.
pub type Msk = [u8; 64];
/// Extended Master Session Key.
pub type Emsk = [u8; 64];

/// RFC 5705 exporter label for EAP-TLS key derivation.
const KEY_EXPORT_LABEL: &[u8] = b"client EAP encryption";
/// Exporter label used to derive the opaque session handle.
const SESSION_EXPORT_LABEL: &[u8] = b"EXPORTER-eap-tls-session";

/// One TLS handshake in progress, owned by one conversation.
pub trait TlsEngine: Send {
    /// Feed a complete reassembled TLS record from the peer.
    fn feed(&mut self, record: &[u8]) -> Result<(), EapTlsError>;

    /// Drain bytes the engine wants sent to the peer.
    fn drain_output(&mut self) -> Result<Vec<u8>, EapTlsError>;

    fn is_handshaking(&self) -> bool;

    /// Offer previously cached material ahead of the handshake. Backends
    /// that resume internally may ignore it.
    fn offer_resumption(&mut self, material: &SessionMaterial);

    /// Opaque material for the session cache, once the handshake is done.
    fn export_session(&self) -> Option<SessionMaterial>;

    /// Derive the MSK and EMSK from the established session.
    fn export_keys(&self) -> Result<(Msk, Emsk), EapTlsError>;

    /// Disposition of the peer certificate, once known.
    fn verdict(&self) -> Option<Verdict>;

    /// The peer chain as presented, leaf first, once available.
    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>>;
}

/// Factory for per-conversation engines.
pub trait TlsBackend: Send + Sync {
    fn new_engine(&self) -> Result<Box<dyn TlsEngine>, EapTlsError>;
}

/// [`TlsEngine`] over a rustls server connection.
pub struct RustlsEngine {
    conn: ServerConnection,
    verifier: Arc<PolicyVerifier>,
}

impl TlsEngine for RustlsEngine {
    fn feed(&mut self, record: &[u8]) -> Result<(), EapTlsError> {
        let mut cursor = Cursor::new(record);
        while (cursor.position() as usize) < record.len() {
            let read = self.conn.read_tls(&mut cursor)?;
            if let Err(e) = self.conn.process_new_packets() {
                // A certificate the policy pipeline turned down surfaces
                // here as a generic TLS error; recover the recorded verdict
                // so the caller can report the real reason.
                return Err(match self.verifier.verdict() {
                    Some(Verdict::Reject(reason)) => EapTlsError::Validation(reason),
                    Some(Verdict::Defer(reason)) => EapTlsError::Transient(reason),
                    _ => EapTlsError::Tls(e.to_string()),
                });
            }
            if read == 0 {
                break;
            }
        }
        Ok(())
    }

    fn drain_output(&mut self) -> Result<Vec<u8>, EapTlsError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok(out)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn offer_resumption(&mut self, _material: &SessionMaterial) {
        // rustls resumes via its own ticketing; externally cached material
        // only gates whether the server advertises resumption at all.
    }

    fn export_session(&self) -> Option<SessionMaterial> {
        if self.conn.is_handshaking() {
            return None;
        }
        let exported = self
            .conn
            .export_keying_material(vec![0u8; 32], SESSION_EXPORT_LABEL, None)
            .ok()?;
        Some(SessionMaterial(exported))
    }

    fn export_keys(&self) -> Result<(Msk, Emsk), EapTlsError> {
        if self.conn.is_handshaking() {
            return Err(EapTlsError::Tls(
                "cannot export keys before handshake completion".to_string(),
            ));
        }

        // 128 bytes of exporter output: first 64 are the MSK, next 64 the
        // EMSK (RFC 5216 section 2.3).
        let material = self
            .conn
            .export_keying_material(vec![0u8; 128], KEY_EXPORT_LABEL, None)
            .map_err(|e| EapTlsError::Tls(format!("key export failed: {}", e)))?;

        let mut msk: Msk = [0u8; 64];
        let mut emsk: Emsk = [0u8; 64];
        msk.copy_from_slice(&material[..64]);
        emsk.copy_from_slice(&material[64..]);
        Ok((msk, emsk))
    }

    fn verdict(&self) -> Option<Verdict> {
        if let Some(verdict) = self.verifier.verdict() {
            Some(verdict)
        } else if !self.conn.is_handshaking() {
            Some(Verdict::Accept)
        } else {
            None
        }
    }

    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        self.conn
            .peer_certificates()
            .map(|certs| certs.iter().map(|der| der.as_ref().to_vec()).collect())
    }
}

/// Builds a [`RustlsEngine`] per conversation.
///
/// Each engine gets its own [`PolicyVerifier`] so a verdict from one
/// conversation can never leak into another.
pub struct RustlsBackend {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
    validator: Arc<CertValidator>,
}

impl RustlsBackend {
    /// Load key material and the trust store named by configuration.
    pub fn from_config(
        config: &EapTlsConfig,
        validator: Arc<CertValidator>,
    ) -> Result<Self, EapTlsError> {
        let certs = load_certificates_from_pem(&config.certificate_file)?;
        let key = load_private_key_from_pem(&config.private_key_file)?;

        let mut roots = RootCertStore::empty();
        for ca_cert in load_certificates_from_pem(&config.ca_file)? {
            roots.add(ca_cert).map_err(|e| {
                EapTlsError::Config(format!("failed to add CA certificate: {}", e))
            })?;
        }
        if let Some(ca_path) = &config.ca_path {
            for entry in fs::read_dir(ca_path)? {
                let path = entry?.path();
                if path.extension().map(|ext| ext == "pem").unwrap_or(false) {
                    for ca_cert in load_certificates_from_pem(&path.to_string_lossy())? {
                        roots.add(ca_cert).map_err(|e| {
                            EapTlsError::Config(format!("failed to add CA certificate: {}", e))
                        })?;
                    }
                }
            }
        }
        if roots.is_empty() {
            return Err(EapTlsError::Config(
                "no CA certificates loaded; cannot verify peers".to_string(),
            ));
        }
        debug!(roots = roots.len(), "loaded trust store");

        Ok(RustlsBackend {
            certs,
            key,
            roots: Arc::new(roots),
            validator,
        })
    }
}

impl TlsBackend for RustlsBackend {
    fn new_engine(&self) -> Result<Box<dyn TlsEngine>, EapTlsError> {
        let webpki = WebPkiClientVerifier::builder(self.roots.clone())
            .build()
            .map_err(|e| EapTlsError::Config(format!("failed to build verifier: {}", e)))?;
        let verifier = Arc::new(PolicyVerifier::new(webpki, self.validator.clone()));

        let tls_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier.clone())
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| EapTlsError::Config(format!("invalid server key material: {}", e)))?;

        let conn = ServerConnection::new(Arc::new(tls_config))
            .map_err(|e| EapTlsError::Tls(format!("failed to create TLS connection: {}", e)))?;

        Ok(Box::new(RustlsEngine { conn, verifier }))
    }
}

/// Read every certificate from a PEM file.
pub fn load_certificates_from_pem(path: &str) -> Result<Vec<CertificateDer<'static>>, EapTlsError> {
    let file = fs::File::open(path)
        .map_err(|e| EapTlsError::Config(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs
        .map_err(|e| EapTlsError::Config(format!("cannot parse certificates in {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(EapTlsError::Config(format!(
            "no certificates found in {}",
            path
        )));
    }
    Ok(certs)
}

/// Read the first private key from a PEM file.
pub fn load_private_key_from_pem(path: &str) -> Result<PrivateKeyDer<'static>, EapTlsError> {
    let file = fs::File::open(path)
        .map_err(|e| EapTlsError::Config(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EapTlsError::Config(format!("cannot parse private key in {}: {}", path, e)))?
        .ok_or_else(|| EapTlsError::Config(format!("no private key found in {}", path)))
}
