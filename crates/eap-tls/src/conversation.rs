//! EAP-TLS conversation engine
//!
//! Ties the pieces together for one authenticating peer: the fragmentation
//! state machine, the TLS engine, and the session cache. Each round trip
//! consumes one EAP Response and produces exactly one output packet; a
//! retransmitted response replays the previous output instead of advancing
//! the state machine.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EapTlsConfig;
use crate::engine::{Emsk, Msk, TlsBackend, TlsEngine};
use crate::error::{DeferReason, EapTlsError, ProtocolViolation, RejectReason};
use crate::fragment::EapTlsPacket;
use crate::reassembly::ReassemblyState;
use crate::session::SessionCache;
use crate::validate::Verdict;

/// Why a conversation ended in Failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The peer broke EAP-TLS framing rules
    Protocol(ProtocolViolation),
    /// The peer certificate failed a policy check
    Validation(RejectReason),
    /// A revocation check could not be completed
    Transient(DeferReason),
    /// The TLS handshake itself failed
    Tls,
}

/// One packet to send back to the peer.
#[derive(Debug, Clone)]
pub enum EapTlsOutput {
    /// Continue the conversation with this EAP-TLS payload
    Request { identifier: u8, payload: Vec<u8> },
    /// Authentication succeeded; keys are ready for the access accept
    Success {
        identifier: u8,
        msk: Msk,
        emsk: Emsk,
    },
    /// Authentication failed
    Failure {
        identifier: u8,
        reason: FailureReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Succeeded,
    Failed,
}

/// State machine for one authenticating peer.
pub struct ConversationEngine {
    engine: Box<dyn TlsEngine>,
    reassembly: ReassemblyState,
    cache: Arc<SessionCache>,
    session_key: Vec<u8>,
    next_identifier: u8,
    last_inbound_identifier: Option<u8>,
    last_output: Option<EapTlsOutput>,
    phase: Phase,
}

impl ConversationEngine {
    /// Start a conversation for the peer identified by `conversation_id`.
    ///
    /// Cached session material for this identity, if any, is offered to
    /// the engine before the first packet moves.
    pub fn new(
        engine: Box<dyn TlsEngine>,
        config: &EapTlsConfig,
        cache: Arc<SessionCache>,
        conversation_id: &[u8],
    ) -> Self {
        let mut session_key =
            Vec::with_capacity(config.session_id_label.len() + 1 + conversation_id.len());
        session_key.extend_from_slice(config.session_id_label.as_bytes());
        session_key.push(b':');
        session_key.extend_from_slice(conversation_id);

        let mut engine = engine;
        if let Some(material) = cache.lookup(&session_key) {
            debug!("offering cached session material for resumption");
            engine.offer_resumption(&material);
        }

        ConversationEngine {
            engine,
            reassembly: ReassemblyState::new(config.fragment_size, config.include_length),
            cache,
            session_key,
            next_identifier: 1,
            last_inbound_identifier: None,
            last_output: None,
            phase: Phase::Handshaking,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase != Phase::Handshaking
    }

    /// The initial EAP-TLS Start request.
    pub fn start_request(&mut self) -> EapTlsOutput {
        let output = EapTlsOutput::Request {
            identifier: self.take_identifier(),
            payload: EapTlsPacket::start().to_bytes(),
        };
        self.last_output = Some(output.clone());
        output
    }

    /// Consume one EAP Response and produce the next packet.
    pub fn process(&mut self, identifier: u8, payload: &[u8]) -> EapTlsOutput {
        // A retransmission gets the previous answer verbatim; the state
        // machine does not move.
        if self.last_inbound_identifier == Some(identifier) {
            if let Some(last) = &self.last_output {
                debug!(identifier, "retransmitting previous output");
                return last.clone();
            }
        }

        if self.phase != Phase::Handshaking {
            warn!(identifier, "response received after conversation ended");
            return self.fail(identifier, FailureReason::Protocol(ProtocolViolation::MalformedFraming));
        }

        self.last_inbound_identifier = Some(identifier);

        let packet = match EapTlsPacket::parse(payload) {
            Ok(packet) => packet,
            Err(violation) => {
                return self.fail(identifier, FailureReason::Protocol(violation));
            }
        };

        let output = if packet.is_ack() {
            self.on_ack(identifier)
        } else {
            self.on_data(identifier, &packet)
        };
        self.last_output = Some(output.clone());
        output
    }

    /// Empty responses either acknowledge a fragment of ours or, once the
    /// handshake has settled, close out the conversation.
    fn on_ack(&mut self, identifier: u8) -> EapTlsOutput {
        if self.reassembly.sending() {
            match self.reassembly.next_outbound() {
                Some(fragment) => self.request(fragment),
                None => self.fail(
                    identifier,
                    FailureReason::Protocol(ProtocolViolation::MalformedFraming),
                ),
            }
        } else if !self.engine.is_handshaking() {
            self.finish(identifier)
        } else {
            self.fail(
                identifier,
                FailureReason::Protocol(ProtocolViolation::MalformedFraming),
            )
        }
    }

    fn on_data(&mut self, identifier: u8, packet: &EapTlsPacket) -> EapTlsOutput {
        let record = match self.reassembly.on_inbound(packet) {
            Ok(Some(record)) => record,
            Ok(None) => {
                // More fragments expected; ack this one
                return self.request(EapTlsPacket::ack());
            }
            Err(violation) => {
                return self.fail(identifier, FailureReason::Protocol(violation));
            }
        };

        if let Err(e) = self.engine.feed(&record) {
            return self.fail(identifier, failure_reason_for(&e));
        }

        let outbound = match self.engine.drain_output() {
            Ok(outbound) => outbound,
            Err(e) => return self.fail(identifier, failure_reason_for(&e)),
        };

        if !outbound.is_empty() {
            self.reassembly.queue_outbound(outbound);
            match self.reassembly.next_outbound() {
                Some(fragment) => self.request(fragment),
                None => self.fail(
                    identifier,
                    FailureReason::Protocol(ProtocolViolation::MalformedFraming),
                ),
            }
        } else if !self.engine.is_handshaking() {
            self.finish(identifier)
        } else {
            // Engine wants more input but has nothing to say; ack
            self.request(EapTlsPacket::ack())
        }
    }

    /// Handshake is over; turn the engine's verdict into Success or Failure.
    fn finish(&mut self, identifier: u8) -> EapTlsOutput {
        match self.engine.verdict() {
            Some(Verdict::Accept) => {}
            Some(Verdict::Reject(reason)) => {
                return self.fail(identifier, FailureReason::Validation(reason));
            }
            Some(Verdict::Defer(reason)) => {
                return self.fail(identifier, FailureReason::Transient(reason));
            }
            None => {
                return self.fail(identifier, FailureReason::Tls);
            }
        }

        let (msk, emsk) = match self.engine.export_keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "key export failed after successful handshake");
                return self.fail(identifier, FailureReason::Tls);
            }
        };

        // Only a fully successful authentication goes into the cache
        if let Some(material) = self.engine.export_session() {
            self.cache.store(&self.session_key, material);
        }

        let peer_cn = self
            .engine
            .peer_certificates()
            .and_then(|chain| chain.first().cloned())
            .and_then(|leaf| crate::validate::CertFacts::from_der(&leaf, true).ok())
            .and_then(|facts| facts.subject_cn);
        info!(
            peer = peer_cn.as_deref().unwrap_or("<unknown>"),
            "EAP-TLS authentication succeeded"
        );
        self.phase = Phase::Succeeded;
        EapTlsOutput::Success {
            identifier,
            msk,
            emsk,
        }
    }

    fn request(&mut self, packet: EapTlsPacket) -> EapTlsOutput {
        EapTlsOutput::Request {
            identifier: self.take_identifier(),
            payload: packet.to_bytes(),
        }
    }

    fn fail(&mut self, identifier: u8, reason: FailureReason) -> EapTlsOutput {
        warn!(?reason, "EAP-TLS authentication failed");
        self.phase = Phase::Failed;
        let output = EapTlsOutput::Failure { identifier, reason };
        self.last_output = Some(output.clone());
        output
    }

    fn take_identifier(&mut self) -> u8 {
        let identifier = self.next_identifier;
        self.next_identifier = self.next_identifier.wrapping_add(1);
        identifier
    }
}

fn failure_reason_for(error: &EapTlsError) -> FailureReason {
    match error {
        EapTlsError::Protocol(violation) => FailureReason::Protocol(*violation),
        EapTlsError::Validation(reason) => FailureReason::Validation(*reason),
        EapTlsError::Transient(reason) => FailureReason::Transient(*reason),
        _ => FailureReason::Tls,
    }
}

/// Entry point for the RADIUS server: routes EAP Responses to their
/// conversations and reaps finished ones.
pub struct EapTlsMethod {
    config: Arc<EapTlsConfig>,
    cache: Arc<SessionCache>,
    backend: Arc<dyn TlsBackend>,
    conversations: HashMap<Vec<u8>, ConversationEngine>,
}

impl EapTlsMethod {
    pub fn new(config: Arc<EapTlsConfig>, backend: Arc<dyn TlsBackend>) -> Self {
        let cache = Arc::new(SessionCache::new(
            config.session_cache_enable,
            config.session_cache_size,
            std::time::Duration::from_secs(config.session_timeout_secs),
        ));
        EapTlsMethod {
            config,
            cache,
            backend,
            conversations: HashMap::new(),
        }
    }

    /// Open a conversation and produce the EAP-TLS Start request.
    pub fn begin(&mut self, conversation_id: &[u8]) -> Result<EapTlsOutput, EapTlsError> {
        let engine = self.backend.new_engine()?;
        let mut conversation = ConversationEngine::new(
            engine,
            &self.config,
            self.cache.clone(),
            conversation_id,
        );
        let output = conversation.start_request();
        self.conversations
            .insert(conversation_id.to_vec(), conversation);
        Ok(output)
    }

    /// Route one EAP Response. An unknown conversation id starts a fresh
    /// conversation; a terminal output drops it.
    pub fn process(
        &mut self,
        conversation_id: &[u8],
        identifier: u8,
        payload: &[u8],
    ) -> Result<EapTlsOutput, EapTlsError> {
        if !self.conversations.contains_key(conversation_id) {
            return self.begin(conversation_id);
        }

        let conversation = match self.conversations.get_mut(conversation_id) {
            Some(conversation) => conversation,
            None => return Err(EapTlsError::ConversationDone),
        };
        let output = conversation.process(identifier, payload);

        if conversation.is_finished() {
            self.conversations.remove(conversation_id);
        }
        Ok(output)
    }

    /// Shared session cache, mostly for inspection in tests and metrics.
    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn active_conversations(&self) -> usize {
        self.conversations.len()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockEngine;
    use super::*;
    use crate::fragment::TlsFlags;

    fn test_config(fragment_size: usize) -> EapTlsConfig {
        let mut config = EapTlsConfig::default();
        config.fragment_size = fragment_size;
        config
    }

    fn test_cache() -> Arc<SessionCache> {
        Arc::new(SessionCache::new(
            true,
            16,
            std::time::Duration::from_secs(3600),
        ))
    }

    fn conversation(engine: MockEngine, fragment_size: usize) -> ConversationEngine {
        ConversationEngine::new(
            Box::new(engine),
            &test_config(fragment_size),
            test_cache(),
            b"user@example.test",
        )
    }

    fn unwrap_request(output: EapTlsOutput) -> (u8, EapTlsPacket) {
        match output {
            EapTlsOutput::Request {
                identifier,
                payload,
            } => (identifier, EapTlsPacket::parse(&payload).unwrap()),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_start_request_has_start_flag() {
        let mut conv = conversation(MockEngine::new(vec![]), 1024);
        let (_, packet) = unwrap_request(conv.start_request());
        assert!(packet.flags.start());
        assert!(packet.data.is_empty());
    }

    #[test]
    fn test_large_reply_is_fragmented_and_acked_through() {
        // Engine replies with 250 bytes; fragment size 100 gives 100/100/50
        let mut conv = conversation(MockEngine::accepting(vec![vec![0x16; 250]]), 100);
        conv.start_request();

        let client_hello = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x01; 40],
        };
        let (id1, first) = unwrap_request(conv.process(10, &client_hello.to_bytes()));
        assert!(first.flags.length_included());
        assert!(first.flags.more_fragments());
        assert_eq!(first.tls_message_length, Some(250));
        assert_eq!(first.data.len(), 100);

        let (id2, second) = unwrap_request(conv.process(11, &EapTlsPacket::ack().to_bytes()));
        assert!(second.flags.more_fragments());
        assert!(!second.flags.length_included());
        assert_eq!(second.data.len(), 100);
        assert_ne!(id1, id2);

        let (_, third) = unwrap_request(conv.process(12, &EapTlsPacket::ack().to_bytes()));
        assert!(!third.flags.more_fragments());
        assert_eq!(third.data.len(), 50);
    }

    #[test]
    fn test_retransmission_replays_last_output() {
        let mut conv = conversation(MockEngine::accepting(vec![vec![0x16; 250]]), 100);
        conv.start_request();

        let client_hello = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x01; 40],
        };
        let (id_a, first_a) = unwrap_request(conv.process(10, &client_hello.to_bytes()));
        // Same inbound identifier again: byte-identical reply, no progress
        let (id_b, first_b) = unwrap_request(conv.process(10, &client_hello.to_bytes()));
        assert_eq!(id_a, id_b);
        assert_eq!(first_a, first_b);

        // The conversation still advances normally afterwards
        let (_, second) = unwrap_request(conv.process(11, &EapTlsPacket::ack().to_bytes()));
        assert_eq!(second.data.len(), 100);
    }

    #[test]
    fn test_data_while_sending_fails_conversation() {
        let mut conv = conversation(MockEngine::accepting(vec![vec![0x16; 250]]), 100);
        conv.start_request();

        let client_hello = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x01; 40],
        };
        conv.process(10, &client_hello.to_bytes());

        // Peer sends data instead of an ack mid-transfer
        let rogue = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x02; 10],
        };
        let output = conv.process(11, &rogue.to_bytes());
        assert!(matches!(
            output,
            EapTlsOutput::Failure {
                reason: FailureReason::Protocol(
                    ProtocolViolation::UnexpectedFragmentWhileSending
                ),
                ..
            }
        ));
        assert!(conv.is_finished());
    }

    #[test]
    fn test_successful_handshake_exports_keys_and_caches() {
        let cache = test_cache();
        let config = test_config(1024);
        let mut conv = ConversationEngine::new(
            Box::new(MockEngine::accepting(vec![vec![0x16; 30]])),
            &config,
            cache.clone(),
            b"user@example.test",
        );
        conv.start_request();

        let client_hello = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x01; 40],
        };
        conv.process(10, &client_hello.to_bytes());

        let finished = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x14; 20],
        };
        let output = conv.process(11, &finished.to_bytes());

        match output {
            EapTlsOutput::Success { msk, emsk, .. } => {
                assert_eq!(msk, [0x11; 64]);
                assert_eq!(emsk, [0x22; 64]);
            }
            other => panic!("expected Success, got {:?}", other),
        }
        assert!(conv.is_finished());
        assert!(cache.lookup(b"eap-tls:user@example.test").is_some());
    }

    #[test]
    fn test_rejected_certificate_fails_and_caches_nothing() {
        let cache = test_cache();
        let config = test_config(1024);
        let mut engine = MockEngine::new(vec![vec![0x16; 30]]);
        engine.verdict = Some(Verdict::Reject(RejectReason::Revoked));
        let mut conv = ConversationEngine::new(
            Box::new(engine),
            &config,
            cache.clone(),
            b"user@example.test",
        );
        conv.start_request();

        let client_hello = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x01; 40],
        };
        conv.process(10, &client_hello.to_bytes());

        let finished = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x14; 20],
        };
        let output = conv.process(11, &finished.to_bytes());

        assert!(matches!(
            output,
            EapTlsOutput::Failure {
                reason: FailureReason::Validation(RejectReason::Revoked),
                ..
            }
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ocsp_defer_fails_and_caches_nothing() {
        let cache = test_cache();
        let config = test_config(1024);
        let mut engine = MockEngine::new(vec![vec![0x16; 30]]);
        engine.verdict = Some(Verdict::Defer(DeferReason::OcspUnreachable));
        let mut conv = ConversationEngine::new(
            Box::new(engine),
            &config,
            cache.clone(),
            b"user@example.test",
        );
        conv.start_request();

        let client_hello = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x01; 40],
        };
        conv.process(10, &client_hello.to_bytes());

        let finished = EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![0x14; 20],
        };
        let output = conv.process(11, &finished.to_bytes());

        assert!(matches!(
            output,
            EapTlsOutput::Failure {
                reason: FailureReason::Transient(DeferReason::OcspUnreachable),
                ..
            }
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cached_session_offered_on_new_conversation() {
        let cache = test_cache();
        let config = test_config(1024);
        let material = crate::session::SessionMaterial(vec![0xCD; 16]);
        cache.store(b"eap-tls:user@example.test", material.clone());

        let engine = MockEngine::new(vec![]);
        let offered = engine.offered.clone();
        let _ = ConversationEngine::new(
            Box::new(engine),
            &config,
            cache.clone(),
            b"user@example.test",
        );

        assert_eq!(*offered.lock().unwrap(), Some(material));
    }

    #[test]
    fn test_no_offer_without_cached_session() {
        let cache = test_cache();
        let config = test_config(1024);

        let engine = MockEngine::new(vec![]);
        let offered = engine.offered.clone();
        let _ = ConversationEngine::new(
            Box::new(engine),
            &config,
            cache,
            b"stranger@example.test",
        );

        assert_eq!(*offered.lock().unwrap(), None);
    }

    #[test]
    fn test_malformed_payload_fails_conversation() {
        let mut conv = conversation(MockEngine::new(vec![]), 1024);
        conv.start_request();

        // L flag set but no length bytes
        let output = conv.process(10, &[0x80]);
        assert!(matches!(
            output,
            EapTlsOutput::Failure {
                reason: FailureReason::Protocol(ProtocolViolation::MalformedFraming),
                ..
            }
        ));
    }
}
