//! End-to-end conversation flow over the public API, driving
//! `EapTlsMethod` with a scripted TLS engine in place of rustls.

use std::sync::{Arc, Mutex};

use eap_tls::{
    DeferReason, EapTlsConfig, EapTlsError, EapTlsMethod, EapTlsOutput, EapTlsPacket, Emsk,
    FailureReason, Msk, ProtocolViolation, RejectReason, SessionMaterial, TlsBackend, TlsEngine,
    TlsFlags, Verdict,
};

/// Scripted engine: every fed record pops the next canned reply; once the
/// script runs dry the handshake is considered complete.
struct ScriptedEngine {
    replies: Vec<Vec<u8>>,
    handshaking: bool,
    verdict: Option<Verdict>,
    session: Option<SessionMaterial>,
    offered: Arc<Mutex<Option<SessionMaterial>>>,
}

impl ScriptedEngine {
    fn accepting(replies: Vec<Vec<u8>>) -> Self {
        ScriptedEngine {
            replies,
            handshaking: true,
            verdict: Some(Verdict::Accept),
            session: Some(SessionMaterial(vec![0x5A; 24])),
            offered: Arc::new(Mutex::new(None)),
        }
    }

    fn with_verdict(replies: Vec<Vec<u8>>, verdict: Verdict) -> Self {
        ScriptedEngine {
            replies,
            handshaking: true,
            verdict: Some(verdict),
            session: None,
            offered: Arc::new(Mutex::new(None)),
        }
    }
}

impl TlsEngine for ScriptedEngine {
    fn feed(&mut self, _record: &[u8]) -> Result<(), EapTlsError> {
        Ok(())
    }

    fn drain_output(&mut self) -> Result<Vec<u8>, EapTlsError> {
        if self.replies.is_empty() {
            self.handshaking = false;
            Ok(Vec::new())
        } else {
            Ok(self.replies.remove(0))
        }
    }

    fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    fn offer_resumption(&mut self, material: &SessionMaterial) {
        *self.offered.lock().unwrap() = Some(material.clone());
    }

    fn export_session(&self) -> Option<SessionMaterial> {
        self.session.clone()
    }

    fn export_keys(&self) -> Result<(Msk, Emsk), EapTlsError> {
        Ok(([0xA1; 64], [0xB2; 64]))
    }

    fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
        None
    }
}

struct ScriptedBackend {
    engines: Mutex<Vec<ScriptedEngine>>,
}

impl ScriptedBackend {
    fn new(engines: Vec<ScriptedEngine>) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            engines: Mutex::new(engines),
        })
    }
}

impl TlsBackend for ScriptedBackend {
    fn new_engine(&self) -> Result<Box<dyn TlsEngine>, EapTlsError> {
        let mut engines = self.engines.lock().unwrap();
        if engines.is_empty() {
            return Err(EapTlsError::Config("script exhausted".to_string()));
        }
        Ok(Box::new(engines.remove(0)))
    }
}

fn config(fragment_size: usize) -> Arc<EapTlsConfig> {
    let mut config = EapTlsConfig::default();
    config.fragment_size = fragment_size;
    Arc::new(config)
}

fn tls_data(data: &[u8]) -> Vec<u8> {
    EapTlsPacket {
        flags: TlsFlags::new(),
        tls_message_length: None,
        data: data.to_vec(),
    }
    .to_bytes()
}

fn ack() -> Vec<u8> {
    EapTlsPacket::ack().to_bytes()
}

fn request_packet(output: EapTlsOutput) -> EapTlsPacket {
    match output {
        EapTlsOutput::Request { payload, .. } => EapTlsPacket::parse(&payload).unwrap(),
        other => panic!("expected Request, got {:?}", other),
    }
}

#[test]
fn full_conversation_with_fragmented_server_reply() {
    // Server's only handshake flight is 250 bytes; at fragment size 100 it
    // goes out as 100/100/50.
    let backend = ScriptedBackend::new(vec![ScriptedEngine::accepting(vec![vec![0x16; 250]])]);
    let mut method = EapTlsMethod::new(config(100), backend);

    let start = method.begin(b"alice").unwrap();
    let start_packet = request_packet(start);
    assert!(start_packet.flags.start());
    assert_eq!(method.active_conversations(), 1);

    // Client hello arrives; server answers with the first fragment
    let first = request_packet(method.process(b"alice", 1, &tls_data(&[0x01; 60])).unwrap());
    assert!(first.flags.length_included());
    assert!(first.flags.more_fragments());
    assert_eq!(first.tls_message_length, Some(250));
    assert_eq!(first.data.len(), 100);

    let second = request_packet(method.process(b"alice", 2, &ack()).unwrap());
    assert!(second.flags.more_fragments());
    assert_eq!(second.data.len(), 100);

    let third = request_packet(method.process(b"alice", 3, &ack()).unwrap());
    assert!(!third.flags.more_fragments());
    assert_eq!(third.data.len(), 50);

    // Client finishes; drain comes up empty, handshake settles, keys flow
    let output = method.process(b"alice", 4, &tls_data(&[0x14; 30])).unwrap();
    match output {
        EapTlsOutput::Success { msk, emsk, .. } => {
            assert_eq!(msk, [0xA1; 64]);
            assert_eq!(emsk, [0xB2; 64]);
        }
        other => panic!("expected Success, got {:?}", other),
    }

    // Conversation is reaped, session is cached
    assert_eq!(method.active_conversations(), 0);
    assert!(method
        .session_cache()
        .lookup(b"eap-tls:alice")
        .is_some());
}

#[test]
fn client_fragments_are_reassembled() {
    let backend = ScriptedBackend::new(vec![ScriptedEngine::accepting(vec![vec![0x16; 40]])]);
    let mut method = EapTlsMethod::new(config(1024), backend);
    method.begin(b"bob").unwrap();

    // Client sends a 5-byte message in two fragments
    let first_fragment = EapTlsPacket {
        flags: TlsFlags::new().with_length_included().with_more_fragments(),
        tls_message_length: Some(5),
        data: vec![1, 2, 3],
    };
    let reply = request_packet(method.process(b"bob", 1, &first_fragment.to_bytes()).unwrap());
    // Server acks the fragment, nothing else
    assert!(reply.data.is_empty());
    assert!(!reply.flags.start());

    let last_fragment = EapTlsPacket {
        flags: TlsFlags::new(),
        tls_message_length: None,
        data: vec![4, 5],
    };
    // Full record reaches the engine, whose reply comes back unfragmented
    let reply = request_packet(method.process(b"bob", 2, &last_fragment.to_bytes()).unwrap());
    assert_eq!(reply.data.len(), 40);
    assert!(!reply.flags.more_fragments());
}

#[test]
fn revoked_certificate_ends_in_failure() {
    let backend = ScriptedBackend::new(vec![ScriptedEngine::with_verdict(
        vec![vec![0x16; 40]],
        Verdict::Reject(RejectReason::OcspRevoked),
    )]);
    let mut method = EapTlsMethod::new(config(1024), backend);
    method.begin(b"mallory").unwrap();

    method.process(b"mallory", 1, &tls_data(&[0x01; 60])).unwrap();
    let output = method.process(b"mallory", 2, &tls_data(&[0x14; 30])).unwrap();

    assert!(matches!(
        output,
        EapTlsOutput::Failure {
            reason: FailureReason::Validation(RejectReason::OcspRevoked),
            ..
        }
    ));
    assert_eq!(method.active_conversations(), 0);
    assert!(method.session_cache().is_empty());
}

#[test]
fn unreachable_ocsp_responder_defers_and_fails() {
    let backend = ScriptedBackend::new(vec![ScriptedEngine::with_verdict(
        vec![vec![0x16; 40]],
        Verdict::Defer(DeferReason::OcspUnreachable),
    )]);
    let mut method = EapTlsMethod::new(config(1024), backend);
    method.begin(b"carol").unwrap();

    method.process(b"carol", 1, &tls_data(&[0x01; 60])).unwrap();
    let output = method.process(b"carol", 2, &tls_data(&[0x14; 30])).unwrap();

    assert!(matches!(
        output,
        EapTlsOutput::Failure {
            reason: FailureReason::Transient(DeferReason::OcspUnreachable),
            ..
        }
    ));
    assert!(method.session_cache().is_empty());
}

#[test]
fn oversized_reassembly_is_a_protocol_failure() {
    let backend = ScriptedBackend::new(vec![ScriptedEngine::accepting(vec![vec![0x16; 40]])]);
    let mut method = EapTlsMethod::new(config(1024), backend);
    method.begin(b"dave").unwrap();

    // Declares 4 bytes, then delivers 5
    let first_fragment = EapTlsPacket {
        flags: TlsFlags::new().with_length_included().with_more_fragments(),
        tls_message_length: Some(4),
        data: vec![1, 2, 3],
    };
    method.process(b"dave", 1, &first_fragment.to_bytes()).unwrap();

    let overflow = EapTlsPacket {
        flags: TlsFlags::new(),
        tls_message_length: None,
        data: vec![4, 5],
    };
    let output = method.process(b"dave", 2, &overflow.to_bytes()).unwrap();

    assert!(matches!(
        output,
        EapTlsOutput::Failure {
            reason: FailureReason::Protocol(ProtocolViolation::LengthOverflow),
            ..
        }
    ));
    assert_eq!(method.active_conversations(), 0);
}

#[test]
fn huge_declared_total_fails_immediately() {
    let backend = ScriptedBackend::new(vec![ScriptedEngine::accepting(vec![vec![0x16; 40]])]);
    let mut method = EapTlsMethod::new(config(1024), backend);
    method.begin(b"frank").unwrap();

    // No buffering happens for a total this large; the first fragment
    // already ends the conversation.
    let first_fragment = EapTlsPacket {
        flags: TlsFlags::new().with_length_included().with_more_fragments(),
        tls_message_length: Some(u32::MAX),
        data: vec![0; 1000],
    };
    let output = method.process(b"frank", 1, &first_fragment.to_bytes()).unwrap();

    assert!(matches!(
        output,
        EapTlsOutput::Failure {
            reason: FailureReason::Protocol(ProtocolViolation::LengthOverflow),
            ..
        }
    ));
    assert_eq!(method.active_conversations(), 0);
}

#[test]
fn cached_session_is_offered_to_the_next_conversation() {
    let resumed_engine = ScriptedEngine::accepting(vec![]);
    let offered = resumed_engine.offered.clone();

    let backend = ScriptedBackend::new(vec![
        ScriptedEngine::accepting(vec![vec![0x16; 40]]),
        resumed_engine,
    ]);
    let mut method = EapTlsMethod::new(config(1024), backend);

    // First conversation succeeds and populates the cache
    method.begin(b"erin").unwrap();
    method.process(b"erin", 1, &tls_data(&[0x01; 60])).unwrap();
    let output = method.process(b"erin", 2, &tls_data(&[0x14; 30])).unwrap();
    assert!(matches!(output, EapTlsOutput::Success { .. }));

    // Second conversation for the same identity sees the cached material
    method.begin(b"erin").unwrap();
    assert_eq!(*offered.lock().unwrap(), Some(SessionMaterial(vec![0x5A; 24])));
}

#[test]
fn unknown_conversation_starts_fresh() {
    let backend = ScriptedBackend::new(vec![ScriptedEngine::accepting(vec![])]);
    let mut method = EapTlsMethod::new(config(1024), backend);

    // process() on an unseen id behaves like begin()
    let output = method.process(b"frank", 7, &ack()).unwrap();
    let packet = request_packet(output);
    assert!(packet.flags.start());
    assert_eq!(method.active_conversations(), 1);
}
