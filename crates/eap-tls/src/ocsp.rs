//! OCSP request building, response parsing, and responder transport (RFC 6960)
//!
//! Requests are minimal and unsigned: a single CertID hashed with SHA-256.
//! Responses are walked with der-parser down to the first SingleResponse,
//! which is all a per-connection leaf check needs.
//!
//! ```asn1
//! CertID ::= SEQUENCE {
//!     hashAlgorithm       AlgorithmIdentifier,
//!     issuerNameHash      OCTET STRING,
//!     issuerKeyHash       OCTET STRING,
//!     serialNumber        INTEGER
//! }
//!
//! CertStatus ::= CHOICE {
//!     good                [0] IMPLICIT NULL,
//!     revoked             [1] IMPLICIT RevokedInfo,
//!     unknown             [2] IMPLICIT UnknownInfo
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_parser::oid_registry::asn1_rs::oid;
use x509_parser::prelude::*;

use crate::error::RevocationError;

/// Cap on OCSP responder reply size.
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// OCSP response status (RFC 6960 section 2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspResponseStatus {
    Successful = 0,
    MalformedRequest = 1,
    InternalError = 2,
    TryLater = 3,
    SigRequired = 5,
    Unauthorized = 6,
}

impl OcspResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Successful),
            1 => Some(Self::MalformedRequest),
            2 => Some(Self::InternalError),
            3 => Some(Self::TryLater),
            5 => Some(Self::SigRequired),
            6 => Some(Self::Unauthorized),
            _ => None,
        }
    }
}

/// Certificate status reported by the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked {
        revocation_time: DateTime<Utc>,
        reason: Option<u8>,
    },
    Unknown,
}

/// Builds a minimal unsigned OCSP request for one certificate.
pub struct OcspRequest {
    serial_number: Vec<u8>,
    issuer_name_hash: Vec<u8>,
    issuer_key_hash: Vec<u8>,
}

impl OcspRequest {
    /// Derive a request from the certificate under test and its issuer,
    /// both DER-encoded.
    pub fn new(cert: &[u8], issuer: &[u8]) -> Result<Self, RevocationError> {
        let (_, cert_parsed) = parse_x509_certificate(cert).map_err(|e| {
            RevocationError::Certificate(format!("failed to parse certificate: {}", e))
        })?;
        let (_, issuer_parsed) = parse_x509_certificate(issuer).map_err(|e| {
            RevocationError::Certificate(format!("failed to parse issuer certificate: {}", e))
        })?;

        let serial_number = cert_parsed.serial.to_bytes_be();
        let issuer_name_hash = sha256(issuer_parsed.subject().as_raw());
        let issuer_key_hash = sha256(&issuer_parsed.public_key().subject_public_key.data);

        Ok(OcspRequest {
            serial_number,
            issuer_name_hash,
            issuer_key_hash,
        })
    }

    /// Encode the OCSPRequest to DER.
    pub fn build(&self) -> Vec<u8> {
        let cert_id = self.build_cert_id();
        // Request wraps CertID; requestList wraps Request; TBSRequest wraps
        // the list; OCSPRequest wraps the unsigned TBSRequest.
        let request = der_sequence(&cert_id);
        let request_list = der_sequence(&request);
        let tbs_request = der_sequence(&request_list);
        der_sequence(&tbs_request)
    }

    fn build_cert_id(&self) -> Vec<u8> {
        let mut cert_id = Vec::new();

        // hashAlgorithm: SEQUENCE { OID sha256, NULL }
        let mut hash_algo = Vec::new();
        hash_algo.extend_from_slice(&der_oid(&[2, 16, 840, 1, 101, 3, 4, 2, 1]));
        hash_algo.extend_from_slice(&der_null());
        cert_id.extend_from_slice(&der_sequence(&hash_algo));

        cert_id.extend_from_slice(&der_octet_string(&self.issuer_name_hash));
        cert_id.extend_from_slice(&der_octet_string(&self.issuer_key_hash));
        cert_id.extend_from_slice(&der_integer(&self.serial_number));

        der_sequence(&cert_id)
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn der_sequence(contents: &[u8]) -> Vec<u8> {
    der_tlv(0x30, contents)
}

fn der_octet_string(contents: &[u8]) -> Vec<u8> {
    der_tlv(0x04, contents)
}

fn der_integer(value: &[u8]) -> Vec<u8> {
    // Pad with a leading zero if the high bit would flip the sign
    let mut int_value = value.to_vec();
    if let Some(&first_byte) = int_value.first() {
        if first_byte & 0x80 != 0 {
            int_value.insert(0, 0x00);
        }
    }
    der_tlv(0x02, &int_value)
}

fn der_oid(components: &[u64]) -> Vec<u8> {
    if components.len() < 2 {
        return der_tlv(0x06, &[]);
    }

    let mut encoded = Vec::new();
    encoded.push((40 * components[0] + components[1]) as u8);
    for &component in &components[2..] {
        encoded.extend_from_slice(&encode_base128(component));
    }
    der_tlv(0x06, &encoded)
}

fn der_null() -> Vec<u8> {
    vec![0x05, 0x00]
}

fn der_tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut result = vec![tag];
    result.extend_from_slice(&der_length(contents.len()));
    result.extend_from_slice(contents);
    result
}

fn der_length(length: usize) -> Vec<u8> {
    if length < 128 {
        vec![length as u8]
    } else {
        let mut length_bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            length_bytes.insert(0, (len & 0xFF) as u8);
            len >>= 8;
        }
        let mut result = vec![0x80 | length_bytes.len() as u8];
        result.extend_from_slice(&length_bytes);
        result
    }
}

fn encode_base128(mut value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }

    let mut result = Vec::new();
    let mut first = true;
    while value > 0 || first {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if !first {
            byte |= 0x80;
        }
        result.insert(0, byte);
        first = false;
    }
    result
}

/// Parsed OCSP response, reduced to the first SingleResponse.
#[derive(Debug, Clone)]
pub struct OcspResponse {
    pub status: OcspResponseStatus,
    /// Populated only when `status` is Successful
    pub cert_status: Option<CertStatus>,
    pub this_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
}

impl OcspResponse {
    /// Parse a DER-encoded OCSPResponse.
    ///
    /// Signature verification is not performed; the transport to the
    /// responder is trusted as configured.
    pub fn parse(der_bytes: &[u8]) -> Result<Self, RevocationError> {
        let (_, outer) = der_parser::parse_der(der_bytes).map_err(|e| {
            RevocationError::OcspParse(format!("failed to parse OCSP response: {:?}", e))
        })?;

        let outer_seq = outer
            .as_sequence()
            .map_err(|_| RevocationError::OcspParse("response is not a SEQUENCE".to_string()))?;
        if outer_seq.is_empty() {
            return Err(RevocationError::OcspParse(
                "response SEQUENCE is empty".to_string(),
            ));
        }

        let status_int = outer_seq[0]
            .as_u32()
            .map_err(|_| RevocationError::OcspParse("invalid responseStatus".to_string()))?;
        let status = OcspResponseStatus::from_u8(status_int as u8).ok_or_else(|| {
            RevocationError::OcspParse(format!("unknown response status {}", status_int))
        })?;

        if status != OcspResponseStatus::Successful {
            return Ok(OcspResponse {
                status,
                cert_status: None,
                this_update: None,
                next_update: None,
            });
        }

        if outer_seq.len() < 2 {
            return Err(RevocationError::OcspParse(
                "successful response missing responseBytes".to_string(),
            ));
        }

        // responseBytes [0] EXPLICIT: SEQUENCE { responseType OID, response OCTET STRING }
        let response_bytes = outer_seq[1].as_sequence().map_err(|_| {
            RevocationError::OcspParse("responseBytes is not a SEQUENCE".to_string())
        })?;
        if response_bytes.len() < 2 {
            return Err(RevocationError::OcspParse(
                "responseBytes SEQUENCE too short".to_string(),
            ));
        }

        let response_type = response_bytes[0]
            .as_oid()
            .map_err(|_| RevocationError::OcspParse("invalid responseType OID".to_string()))?;
        let basic_ocsp_oid = oid!(1.3.6.1.5.5.7.48.1.1);
        if *response_type != basic_ocsp_oid {
            return Err(RevocationError::OcspParse(format!(
                "unsupported OCSP response type {}",
                response_type
            )));
        }

        let basic_bytes = response_bytes[1]
            .as_slice()
            .map_err(|_| RevocationError::OcspParse("invalid response octet string".to_string()))?;

        let (_, basic) = der_parser::parse_der(basic_bytes).map_err(|e| {
            RevocationError::OcspParse(format!("failed to parse BasicOCSPResponse: {:?}", e))
        })?;
        let basic_seq = basic.as_sequence().map_err(|_| {
            RevocationError::OcspParse("BasicOCSPResponse is not a SEQUENCE".to_string())
        })?;
        if basic_seq.is_empty() {
            return Err(RevocationError::OcspParse(
                "BasicOCSPResponse SEQUENCE is empty".to_string(),
            ));
        }

        // ResponseData ::= SEQUENCE {
        //     version [0] DEFAULT v1, responderID, producedAt,
        //     responses SEQUENCE OF SingleResponse, extensions [1] OPTIONAL }
        let tbs = basic_seq[0].as_sequence().map_err(|_| {
            RevocationError::OcspParse("tbsResponseData is not a SEQUENCE".to_string())
        })?;

        let mut idx = 0;
        if !tbs.is_empty() && tbs[idx].header.tag().0 == 0xA0 {
            idx += 1; // explicit version
        }
        idx += 1; // responderID
        idx += 1; // producedAt

        let responses = tbs
            .get(idx)
            .ok_or_else(|| {
                RevocationError::OcspParse("tbsResponseData missing responses".to_string())
            })?
            .as_sequence()
            .map_err(|_| RevocationError::OcspParse("responses is not a SEQUENCE".to_string()))?;
        if responses.is_empty() {
            return Err(RevocationError::OcspParse(
                "no SingleResponse in OCSP response".to_string(),
            ));
        }

        // SingleResponse ::= SEQUENCE {
        //     certID, certStatus, thisUpdate, nextUpdate [0] OPTIONAL, ... }
        let single = responses[0].as_sequence().map_err(|_| {
            RevocationError::OcspParse("SingleResponse is not a SEQUENCE".to_string())
        })?;
        if single.len() < 3 {
            return Err(RevocationError::OcspParse(
                "SingleResponse SEQUENCE too short".to_string(),
            ));
        }

        let cert_status = parse_cert_status(&single[1])?;

        let this_update = single[2].as_str().ok().and_then(parse_generalized_time);

        let mut next_update = None;
        if single.len() > 3 && single[3].header.tag().0 == 0xA0 {
            if let Ok(inner) = single[3].as_sequence() {
                if let Some(first) = inner.first() {
                    next_update = first.as_str().ok().and_then(parse_generalized_time);
                }
            }
        }

        Ok(OcspResponse {
            status,
            cert_status: Some(cert_status),
            this_update,
            next_update,
        })
    }
}

fn parse_cert_status(
    der: &der_parser::der::DerObject,
) -> Result<CertStatus, RevocationError> {
    // Implicit context tags: [0] = 0x80, [1] = 0x81, [2] = 0x82
    match der.header.tag().0 {
        0x80 => Ok(CertStatus::Good),
        0x81 => {
            // RevokedInfo ::= SEQUENCE { revocationTime, reason [0] OPTIONAL }
            let revoked_seq = der.as_sequence().map_err(|_| {
                RevocationError::OcspParse("RevokedInfo is not a SEQUENCE".to_string())
            })?;
            if revoked_seq.is_empty() {
                return Err(RevocationError::OcspParse(
                    "RevokedInfo SEQUENCE is empty".to_string(),
                ));
            }

            let revocation_time = revoked_seq[0]
                .as_str()
                .ok()
                .and_then(parse_generalized_time)
                .ok_or_else(|| {
                    RevocationError::OcspParse("invalid revocationTime".to_string())
                })?;

            let reason = revoked_seq
                .get(1)
                .and_then(|obj| obj.as_u32().ok())
                .map(|reason| reason as u8);

            Ok(CertStatus::Revoked {
                revocation_time,
                reason,
            })
        }
        0x82 => Ok(CertStatus::Unknown),
        _ => Err(RevocationError::OcspParse(format!(
            "unknown CertStatus tag {:?}",
            der.header.tag()
        ))),
    }
}

/// Parse ASN.1 GeneralizedTime (YYYYMMDDHHMMSSZ).
fn parse_generalized_time(time_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = time_str.trim_end_matches('Z');
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y%m%d%H%M%S%.f"))
        .ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Transport to an OCSP responder, abstracted so tests can script replies.
pub trait OcspTransport: Send + Sync {
    /// POST a DER-encoded request and return the raw DER response.
    fn query(&self, url: &str, request: &[u8]) -> Result<Vec<u8>, RevocationError>;
}

/// HTTP OCSP transport over a pooled blocking client.
#[derive(Debug)]
pub struct OcspClient {
    http_client: reqwest::blocking::Client,
}

impl OcspClient {
    pub fn new(timeout: Duration) -> Result<Self, RevocationError> {
        let http_client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                RevocationError::Transport(format!("failed to create HTTP client: {}", e))
            })?;
        Ok(OcspClient { http_client })
    }
}

impl OcspTransport for OcspClient {
    fn query(&self, url: &str, request: &[u8]) -> Result<Vec<u8>, RevocationError> {
        debug!(url, "querying OCSP responder");
        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/ocsp-request")
            .header("Accept", "application/ocsp-response")
            .body(request.to_vec())
            .send()
            .map_err(|e| RevocationError::Transport(format!("OCSP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(RevocationError::Transport(format!(
                "OCSP responder returned HTTP {}",
                response.status()
            )));
        }

        let bytes = response.bytes().map_err(|e| {
            RevocationError::Transport(format!("failed to read OCSP response body: {}", e))
        })?;
        if bytes.len() > MAX_RESPONSE_SIZE {
            return Err(RevocationError::Transport(format!(
                "OCSP response too large: {} bytes",
                bytes.len()
            )));
        }

        Ok(bytes.to_vec())
    }
}

/// Find the OCSP responder URL in a certificate's Authority Information
/// Access extension, if it has one.
pub fn extract_ocsp_url(cert: &[u8]) -> Result<Option<String>, RevocationError> {
    use x509_parser::extensions::{GeneralName, ParsedExtension};

    let (_, cert_parsed) = parse_x509_certificate(cert)
        .map_err(|e| RevocationError::Certificate(format!("failed to parse certificate: {}", e)))?;

    let ocsp_oid = oid!(1.3.6.1.5.5.7.48.1);
    for ext in cert_parsed.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for access_desc in aia.accessdescs.iter() {
                if access_desc.access_method == ocsp_oid {
                    if let GeneralName::URI(uri) = &access_desc.access_location {
                        return Ok(Some(uri.to_string()));
                    }
                }
            }
        }
    }

    Ok(None)
}
