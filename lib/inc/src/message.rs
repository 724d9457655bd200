//! Wire framing: the fixed 24-byte little-endian header and the closed set
//! of message types.
//!
//! Reply types are request code | 1, so a server can drop stale
//! request-looking traffic by parity alone. Unknown type codes never enter
//! the process: [`MessageType::from_u16`] rejects them at the boundary.

use std::os::unix::io::RawFd;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::IncError;

/// "INC\0" read as a little-endian u32.
pub const MAGIC: u32 = 0x0043_4E49;
pub const HEADER_SIZE: usize = 24;
/// Compile-time bound on payload length.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Payload is a shared-memory reference, not inline bytes.
pub const FLAG_SHM_DATA: u16 = 0x0001;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Invalid = 0,
    Handshake = 2,
    HandshakeAck = 3,
    MethodCall = 4,
    MethodReply = 5,
    Event = 6,
    Subscribe = 8,
    SubscribeAck = 9,
    Unsubscribe = 10,
    UnsubscribeAck = 11,
    Ping = 12,
    Pong = 13,
    StreamOpen = 14,
    StreamOpenAck = 15,
    StreamClose = 16,
    StreamCloseAck = 17,
    BinaryData = 18,
    BinaryDataAck = 19,
}

impl MessageType {
    pub fn from_u16(code: u16) -> Option<MessageType> {
        match code {
            0 => Some(MessageType::Invalid),
            2 => Some(MessageType::Handshake),
            3 => Some(MessageType::HandshakeAck),
            4 => Some(MessageType::MethodCall),
            5 => Some(MessageType::MethodReply),
            6 => Some(MessageType::Event),
            8 => Some(MessageType::Subscribe),
            9 => Some(MessageType::SubscribeAck),
            10 => Some(MessageType::Unsubscribe),
            11 => Some(MessageType::UnsubscribeAck),
            12 => Some(MessageType::Ping),
            13 => Some(MessageType::Pong),
            14 => Some(MessageType::StreamOpen),
            15 => Some(MessageType::StreamOpenAck),
            16 => Some(MessageType::StreamClose),
            17 => Some(MessageType::StreamCloseAck),
            18 => Some(MessageType::BinaryData),
            19 => Some(MessageType::BinaryDataAck),
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Low-bit parity: odd codes answer the even code below them.
    #[inline]
    pub fn is_reply(self) -> bool {
        let code = self.code();
        code & 1 == 1
    }
}

/// Parsed fixed header.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Header {
    pub message_type: MessageType,
    pub flags: u16,
    pub sequence: u32,
    pub channel: u32,
    pub protocol_version: u8,
    pub payload_version: u8,
    pub length: u32,
}

impl Header {
    /// Parse and validate a header prefix. The caller guarantees at least
    /// `HEADER_SIZE` bytes.
    pub fn parse(raw: &[u8]) -> Result<Header, IncError> {
        debug_assert!(raw.len() >= HEADER_SIZE);

        let magic = LittleEndian::read_u32(&raw[0..4]);
        if magic != MAGIC {
            return Err(IncError::ProtocolError);
        }

        let type_code = LittleEndian::read_u16(&raw[4..6]);
        let message_type = MessageType::from_u16(type_code).ok_or(IncError::InvalidMessage)?;

        let length = LittleEndian::read_u32(&raw[20..24]);
        if length > MAX_MESSAGE_SIZE {
            return Err(IncError::MessageTooLarge);
        }

        Ok(Header {
            message_type,
            flags: LittleEndian::read_u16(&raw[6..8]),
            sequence: LittleEndian::read_u32(&raw[8..12]),
            channel: LittleEndian::read_u32(&raw[12..16]),
            protocol_version: raw[16],
            payload_version: raw[17],
            length,
        })
    }
}

/// One framed unit: header plus tag-struct payload, with the out-of-process
/// extras (deadline, ancillary descriptor) that never hit the byte stream.
#[derive(Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: u16,
    pub sequence: u32,
    pub channel: u32,
    pub protocol_version: u8,
    pub payload_version: u8,
    pub payload: Vec<u8>,
    /// Drop-if-late deadline; `None` means forever.
    pub deadline: Option<Instant>,
    /// Descriptor to pass out-of-band on fd-capable transports.
    pub ext_fd: Option<RawFd>,
}

impl Message {
    pub fn new(message_type: MessageType, sequence: u32) -> Message {
        Message {
            message_type,
            flags: 0,
            sequence,
            channel: 0,
            protocol_version: PROTOCOL_VERSION,
            payload_version: 0,
            payload: Vec::new(),
            deadline: None,
            ext_fd: None,
        }
    }

    pub fn with_channel(message_type: MessageType, channel: u32, sequence: u32) -> Message {
        let mut msg = Message::new(message_type, sequence);
        msg.channel = channel;
        msg
    }

    #[inline]
    pub fn set_payload(&mut self, payload: Vec<u8>) -> &mut Self {
        self.payload = payload;
        self
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u16) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Serialize the fixed header.
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];

        LittleEndian::write_u32(&mut raw[0..4], MAGIC);
        LittleEndian::write_u16(&mut raw[4..6], self.message_type.code());
        LittleEndian::write_u16(&mut raw[6..8], self.flags);
        LittleEndian::write_u32(&mut raw[8..12], self.sequence);
        LittleEndian::write_u32(&mut raw[12..16], self.channel);
        raw[16] = self.protocol_version;
        raw[17] = self.payload_version;
        // raw[18..20] reserved, zero.
        LittleEndian::write_u32(&mut raw[20..24], self.payload.len() as u32);

        raw
    }

    /// Rebuild a message from a validated header and its payload bytes.
    pub fn from_parts(header: Header, payload: Vec<u8>) -> Message {
        Message {
            message_type: header.message_type,
            flags: header.flags,
            sequence: header.sequence,
            channel: header.channel,
            protocol_version: header.protocol_version,
            payload_version: header.payload_version,
            payload,
            deadline: None,
            ext_fd: None,
        }
    }

    /// Whether the drop-if-late deadline has already passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => deadline < now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_bit_exact() {
        let mut msg = Message::with_channel(MessageType::BinaryData, 9, 0x01020304);
        msg.set_flags(FLAG_SHM_DATA);
        msg.set_payload(vec![0xAA; 5]);
        let raw = msg.header_bytes();

        assert_eq!(&raw[0..4], &[0x49, 0x4E, 0x43, 0x00], "magic is INC\\0");
        assert_eq!(&raw[4..6], &[18, 0]);
        assert_eq!(&raw[6..8], &[1, 0]);
        assert_eq!(&raw[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[12..16], &[9, 0, 0, 0]);
        assert_eq!(raw[16], PROTOCOL_VERSION);
        assert_eq!(raw[17], 0);
        assert_eq!(&raw[18..20], &[0, 0]);
        assert_eq!(&raw[20..24], &[5, 0, 0, 0]);
    }

    #[test]
    fn test_header_roundtrip() {
        let mut msg = Message::with_channel(MessageType::MethodCall, 3, 77);
        msg.set_payload(vec![1, 2, 3]);

        let header = Header::parse(&msg.header_bytes()).unwrap();
        assert_eq!(header.message_type, MessageType::MethodCall);
        assert_eq!(header.sequence, 77);
        assert_eq!(header.channel, 3);
        assert_eq!(header.length, 3);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let msg = Message::new(MessageType::Ping, 1);
        let mut raw = msg.header_bytes();
        raw[0] = 0xEF;
        raw[1] = 0xBE;
        raw[2] = 0xAD;
        raw[3] = 0xDE;

        assert_eq!(Header::parse(&raw), Err(IncError::ProtocolError));
    }

    #[test]
    fn test_oversize_rejected() {
        let msg = Message::new(MessageType::Ping, 1);
        let mut raw = msg.header_bytes();
        LittleEndian::write_u32(&mut raw[20..24], MAX_MESSAGE_SIZE + 1);

        assert_eq!(Header::parse(&raw), Err(IncError::MessageTooLarge));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let msg = Message::new(MessageType::Ping, 1);
        let mut raw = msg.header_bytes();
        LittleEndian::write_u16(&mut raw[4..6], 42);

        assert_eq!(Header::parse(&raw), Err(IncError::InvalidMessage));
    }

    #[test]
    fn test_reply_parity() {
        let pairs = [
            (MessageType::Handshake, MessageType::HandshakeAck),
            (MessageType::MethodCall, MessageType::MethodReply),
            (MessageType::Subscribe, MessageType::SubscribeAck),
            (MessageType::Unsubscribe, MessageType::UnsubscribeAck),
            (MessageType::Ping, MessageType::Pong),
            (MessageType::StreamOpen, MessageType::StreamOpenAck),
            (MessageType::StreamClose, MessageType::StreamCloseAck),
            (MessageType::BinaryData, MessageType::BinaryDataAck),
        ];

        for (request, reply) in pairs.iter() {
            assert!(!request.is_reply());
            assert!(reply.is_reply());
            assert_eq!(request.code() | 1, reply.code());
        }
    }

    #[test]
    fn test_deadline_expiry() {
        let mut msg = Message::new(MessageType::MethodCall, 1);
        let now = Instant::now();
        assert!(!msg.is_expired(now));

        msg.deadline = Some(now);
        assert!(!msg.is_expired(now));
        assert!(msg.is_expired(now + std::time::Duration::from_millis(1)));
    }
}
