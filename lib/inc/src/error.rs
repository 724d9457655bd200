//! Enumerated error codes shared by every INC layer and carried on the wire
//! as `i32`. Zero is success.

use std::fmt;

/// Success code used in reply payloads.
pub const OK: i32 = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum IncError {
    /// Null inputs, malformed URLs, out-of-range sizes.
    InvalidArgs = 1,
    /// Double connect, close when not open.
    InvalidState = 2,
    /// Transport refused, resolve failure, bind or listen failure.
    ConnectionFailed = 3,
    AlreadyConnected = 4,
    /// Peer EOF or socket error mid-session.
    Disconnected = 5,
    /// Malformed header or tag-struct payload.
    ProtocolError = 6,
    /// Unrecognised type, truncated payload.
    InvalidMessage = 7,
    MessageTooLarge = 8,
    QueueFull = 9,
    NotConnected = 10,
    AccessDenied = 11,
    WriteFailed = 12,
    /// Unknown or invalid-mode channel.
    Channel = 13,
    Timeout = 14,
    /// Invariant broken; should never escape.
    Internal = 15,
}

impl IncError {
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<IncError> {
        match code {
            1 => Some(IncError::InvalidArgs),
            2 => Some(IncError::InvalidState),
            3 => Some(IncError::ConnectionFailed),
            4 => Some(IncError::AlreadyConnected),
            5 => Some(IncError::Disconnected),
            6 => Some(IncError::ProtocolError),
            7 => Some(IncError::InvalidMessage),
            8 => Some(IncError::MessageTooLarge),
            9 => Some(IncError::QueueFull),
            10 => Some(IncError::NotConnected),
            11 => Some(IncError::AccessDenied),
            12 => Some(IncError::WriteFailed),
            13 => Some(IncError::Channel),
            14 => Some(IncError::Timeout),
            15 => Some(IncError::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for IncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            IncError::InvalidArgs => "invalid arguments",
            IncError::InvalidState => "invalid state",
            IncError::ConnectionFailed => "connection failed",
            IncError::AlreadyConnected => "already connected",
            IncError::Disconnected => "disconnected",
            IncError::ProtocolError => "protocol error",
            IncError::InvalidMessage => "invalid message",
            IncError::MessageTooLarge => "message too large",
            IncError::QueueFull => "send queue full",
            IncError::NotConnected => "not connected",
            IncError::AccessDenied => "access denied",
            IncError::WriteFailed => "write failed",
            IncError::Channel => "channel error",
            IncError::Timeout => "timed out",
            IncError::Internal => "internal error",
        };
        write!(f, "{}", text)
    }
}

pub type IncResult<T> = Result<T, IncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 1..=15 {
            let err = IncError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert_eq!(IncError::from_code(0), None);
        assert_eq!(IncError::from_code(99), None);
    }
}
