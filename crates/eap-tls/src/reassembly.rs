//! Per-conversation fragmentation state machine
//!
//! Tracks which direction is mid-transfer and enforces the framing rules:
//! a fragmented inbound message must announce its total length up front,
//! inbound data is not accepted while we are still sending fragments, and
//! the final fragment must land exactly on the declared total.

use tracing::debug;

use crate::error::ProtocolViolation;
use crate::fragment::{EapTlsPacket, FragmentBuffer, TlsFlags};

/// Where the conversation stands with respect to fragment transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyPhase {
    /// No transfer in progress in either direction
    Idle,
    /// Emitting fragments of an outbound message, awaiting acks
    SendingFragments,
    /// Collecting fragments of an inbound message
    AwaitingMoreFragments,
    /// A complete inbound message is ready for the TLS engine
    ReadyForEngine,
    /// Terminal; a protocol violation ended the transfer
    Done,
}

/// Fragmentation and reassembly state for one EAP-TLS conversation.
#[derive(Debug)]
pub struct ReassemblyState {
    phase: ReassemblyPhase,
    outbound: FragmentBuffer,
    inbound: FragmentBuffer,
    fragment_size: usize,
    include_length: bool,
    first_outbound_sent: bool,
}

impl ReassemblyState {
    pub fn new(fragment_size: usize, include_length: bool) -> Self {
        ReassemblyState {
            phase: ReassemblyPhase::Idle,
            outbound: FragmentBuffer::new(),
            inbound: FragmentBuffer::new(),
            fragment_size,
            include_length,
            first_outbound_sent: false,
        }
    }

    pub fn phase(&self) -> ReassemblyPhase {
        self.phase
    }

    pub fn sending(&self) -> bool {
        self.phase == ReassemblyPhase::SendingFragments
    }

    /// Queue a complete outbound TLS message for fragmented transmission.
    pub fn queue_outbound(&mut self, message: Vec<u8>) {
        debug!(len = message.len(), "queueing outbound TLS message");
        self.outbound.load(message);
        self.first_outbound_sent = false;
        self.phase = ReassemblyPhase::SendingFragments;
    }

    /// Produce the next outbound packet, or `None` when nothing is queued.
    ///
    /// The first fragment of a multi-fragment message carries the
    /// Length-Included flag and the total length; later fragments carry
    /// neither. The More-Fragments flag is set on every fragment except
    /// the last.
    pub fn next_outbound(&mut self) -> Option<EapTlsPacket> {
        if self.phase != ReassemblyPhase::SendingFragments {
            return None;
        }

        let total = self.outbound.total_len();
        let first = !self.first_outbound_sent;
        let (slice, more) = self.outbound.next_fragment(self.fragment_size);
        let data = slice.to_vec();
        self.first_outbound_sent = true;

        let mut flags = TlsFlags::new();
        let mut tls_message_length = None;
        if first && (more || self.include_length) {
            flags = flags.with_length_included();
            tls_message_length = Some(total as u32);
        }
        if more {
            flags = flags.with_more_fragments();
        } else {
            self.phase = ReassemblyPhase::Idle;
        }

        Some(EapTlsPacket {
            flags,
            tls_message_length,
            data,
        })
    }

    /// Accept one inbound packet carrying TLS data.
    ///
    /// Returns `Ok(Some(message))` when a complete TLS message is ready for
    /// the engine, `Ok(None)` when more fragments are expected (the caller
    /// should ack), and `Err` on any framing violation. Violations are
    /// terminal; the state moves to [`ReassemblyPhase::Done`].
    pub fn on_inbound(
        &mut self,
        packet: &EapTlsPacket,
    ) -> Result<Option<Vec<u8>>, ProtocolViolation> {
        match self.phase {
            ReassemblyPhase::Idle | ReassemblyPhase::ReadyForEngine => {
                if packet.flags.more_fragments() {
                    // First fragment of a multi-fragment message must
                    // declare the total up front.
                    let total = match packet.tls_message_length {
                        Some(total) => total as usize,
                        None => {
                            self.phase = ReassemblyPhase::Done;
                            return Err(ProtocolViolation::MalformedFraming);
                        }
                    };
                    if let Err(violation) = self.inbound.begin(total) {
                        self.phase = ReassemblyPhase::Done;
                        return Err(violation);
                    }
                    if let Err(violation) = self.inbound.append(&packet.data) {
                        self.phase = ReassemblyPhase::Done;
                        return Err(violation);
                    }
                    debug!(
                        declared = total,
                        received = packet.data.len(),
                        "starting inbound reassembly"
                    );
                    self.phase = ReassemblyPhase::AwaitingMoreFragments;
                    Ok(None)
                } else {
                    // Unfragmented message. A declared length that disagrees
                    // with the data actually present is still a violation.
                    if let Some(declared) = packet.tls_message_length {
                        if declared as usize != packet.data.len() {
                            self.phase = ReassemblyPhase::Done;
                            return Err(ProtocolViolation::LengthMismatch);
                        }
                    }
                    self.phase = ReassemblyPhase::ReadyForEngine;
                    Ok(Some(packet.data.clone()))
                }
            }
            ReassemblyPhase::AwaitingMoreFragments => {
                if let Err(violation) = self.inbound.append(&packet.data) {
                    self.phase = ReassemblyPhase::Done;
                    return Err(violation);
                }
                if packet.flags.more_fragments() {
                    Ok(None)
                } else {
                    // Final fragment must land exactly on the declared total.
                    if !self.inbound.is_complete() {
                        self.phase = ReassemblyPhase::Done;
                        return Err(ProtocolViolation::LengthMismatch);
                    }
                    let message = self.inbound.take();
                    debug!(len = message.len(), "inbound reassembly complete");
                    self.phase = ReassemblyPhase::ReadyForEngine;
                    Ok(Some(message))
                }
            }
            ReassemblyPhase::SendingFragments => {
                self.phase = ReassemblyPhase::Done;
                Err(ProtocolViolation::UnexpectedFragmentWhileSending)
            }
            ReassemblyPhase::Done => Err(ProtocolViolation::OutOfOrderFragment),
        }
    }
}
