//! EAP-TLS packet framing and fragment buffers (RFC 5216 section 4.2)
//!
//! An EAP-TLS payload starts with a flags byte. When the Length-Included
//! flag is set, a four byte total message length follows; the remainder is
//! TLS record data. An empty payload with no flags set is an acknowledgment
//! that requests the next fragment from the peer. A Start packet is
//! flags-only per RFC 5216 section 3.1, so the length field is parsed
//! strictly from the Length-Included flag; the Start flag never implies one.

use crate::error::ProtocolViolation;

/// Flags byte at the head of every EAP-TLS payload.
///
/// Only the top three bits are meaningful; the rest are reserved and
/// ignored on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsFlags(u8);

impl TlsFlags {
    /// A four byte total message length follows the flags byte
    pub const LENGTH_INCLUDED: u8 = 0x80;
    /// More fragments of this message follow in later packets
    pub const MORE_FRAGMENTS: u8 = 0x40;
    /// Server-initiated start of the EAP-TLS conversation
    pub const START: u8 = 0x20;

    const MASK: u8 = 0xE0;

    pub fn new() -> Self {
        TlsFlags(0)
    }

    /// Parse from the wire, discarding reserved bits.
    pub fn from_u8(byte: u8) -> Self {
        TlsFlags(byte & Self::MASK)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn with_length_included(mut self) -> Self {
        self.0 |= Self::LENGTH_INCLUDED;
        self
    }

    pub fn with_more_fragments(mut self) -> Self {
        self.0 |= Self::MORE_FRAGMENTS;
        self
    }

    pub fn with_start(mut self) -> Self {
        self.0 |= Self::START;
        self
    }

    pub fn length_included(&self) -> bool {
        self.0 & Self::LENGTH_INCLUDED != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.0 & Self::MORE_FRAGMENTS != 0
    }

    pub fn start(&self) -> bool {
        self.0 & Self::START != 0
    }
}

/// One parsed EAP-TLS payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapTlsPacket {
    pub flags: TlsFlags,
    /// Total reassembled message length; present iff Length-Included is set
    pub tls_message_length: Option<u32>,
    /// TLS record data carried by this packet
    pub data: Vec<u8>,
}

impl EapTlsPacket {
    /// Parse the type-data portion of an EAP-TLS packet.
    ///
    /// The length field must be present exactly when the Length-Included
    /// flag says it is; a flags byte promising a length the payload cannot
    /// hold is malformed framing.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolViolation> {
        if payload.is_empty() {
            return Err(ProtocolViolation::MalformedFraming);
        }

        let flags = TlsFlags::from_u8(payload[0]);
        let mut offset = 1;

        let tls_message_length = if flags.length_included() {
            if payload.len() < offset + 4 {
                return Err(ProtocolViolation::MalformedFraming);
            }
            let length = u32::from_be_bytes([
                payload[offset],
                payload[offset + 1],
                payload[offset + 2],
                payload[offset + 3],
            ]);
            offset += 4;
            Some(length)
        } else {
            None
        };

        Ok(EapTlsPacket {
            flags,
            tls_message_length,
            data: payload[offset..].to_vec(),
        })
    }

    /// Serialize back to the wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.data.len());
        out.push(self.flags.as_u8());
        if let Some(length) = self.tls_message_length {
            out.extend_from_slice(&length.to_be_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// The EAP-TLS Start packet: Start flag set, no data.
    pub fn start() -> Self {
        EapTlsPacket {
            flags: TlsFlags::new().with_start(),
            tls_message_length: None,
            data: vec![],
        }
    }

    /// A fragment acknowledgment: no flags, no data.
    pub fn ack() -> Self {
        EapTlsPacket {
            flags: TlsFlags::new(),
            tls_message_length: None,
            data: vec![],
        }
    }

    /// True for empty packets that carry neither data nor a Start flag.
    pub fn is_ack(&self) -> bool {
        self.data.is_empty() && !self.flags.start()
    }
}

/// Byte buffer used in both fragmentation directions.
///
/// Outbound: [`load`](FragmentBuffer::load) a complete TLS message, then
/// pull slices with [`next_fragment`](FragmentBuffer::next_fragment).
/// Inbound: [`begin`](FragmentBuffer::begin) with the peer's declared total,
/// then [`append`](FragmentBuffer::append) each fragment until
/// [`is_complete`](FragmentBuffer::is_complete).
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    data: Vec<u8>,
    cursor: usize,
    declared_total: Option<usize>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        FragmentBuffer::default()
    }

    /// Load a complete outbound message, resetting the read cursor.
    pub fn load(&mut self, message: Vec<u8>) {
        self.data = message;
        self.cursor = 0;
        self.declared_total = None;
    }

    /// Total number of bytes held (or expected, once complete).
    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    /// Next outbound slice of at most `max` bytes and whether more remain
    /// after it.
    pub fn next_fragment(&mut self, max: usize) -> (&[u8], bool) {
        let end = (self.cursor + max).min(self.data.len());
        let start = self.cursor;
        self.cursor = end;
        (&self.data[start..end], end < self.data.len())
    }

    /// True once the outbound cursor has passed every byte.
    pub fn exhausted(&self) -> bool {
        self.cursor >= self.data.len()
    }

    /// Start inbound reassembly with the peer's declared total length.
    ///
    /// A declared total above [`MAX_MESSAGE_SIZE`] is rejected outright;
    /// the length field is peer-controlled and must never size the buffer
    /// unbounded.
    pub fn begin(&mut self, total: usize) -> Result<(), ProtocolViolation> {
        if total > MAX_MESSAGE_SIZE {
            return Err(ProtocolViolation::LengthOverflow);
        }
        self.data = Vec::with_capacity(total);
        self.cursor = 0;
        self.declared_total = Some(total);
        Ok(())
    }

    /// Append an inbound fragment.
    ///
    /// Exceeding the declared total is a fatal protocol violation, not a
    /// truncation.
    pub fn append(&mut self, fragment: &[u8]) -> Result<(), ProtocolViolation> {
        if let Some(total) = self.declared_total {
            if self.data.len() + fragment.len() > total {
                return Err(ProtocolViolation::LengthOverflow);
            }
        }
        self.data.extend_from_slice(fragment);
        Ok(())
    }

    /// True once exactly the declared number of bytes has arrived.
    pub fn is_complete(&self) -> bool {
        match self.declared_total {
            Some(total) => self.data.len() == total,
            None => false,
        }
    }

    /// Take the reassembled message, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        self.declared_total = None;
        self.cursor = 0;
        std::mem::take(&mut self.data)
    }
}

/// Largest reassembled TLS message a peer may declare.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
