//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
///
/// Every variant is fatal for the connection that produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer, or a field runs past the packet body
    InsufficientData,
    /// Packet type nibble is 0 or 15
    UnsupportedPacketType(u8),
    /// Remaining length uses more than four bytes
    InvalidRemainingLength,
    /// Invalid protocol name
    InvalidProtocolName,
    /// Invalid protocol level
    InvalidProtocolVersion(u8),
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet exceeds the configured maximum size
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::UnsupportedPacketType(t) => write!(f, "unsupported packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Body exceeds 268,435,455 bytes
    PacketTooLarge,
    /// String longer than 65,535 bytes
    StringTooLong,
    /// Packet id missing, zero, or present where the QoS forbids it
    InvalidPacketId,
    /// Field combination the wire format cannot express
    InvalidFlags(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::InvalidPacketId => write!(f, "invalid packet identifier"),
            Self::InvalidFlags(msg) => write!(f, "invalid flags: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

/// High-level protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// Peer sent a packet that is not valid in the current state
    ProtocolViolation(&'static str),
    /// A bounded resource (packet identifiers, inflight window) is used up.
    /// Recoverable: the caller retries after acknowledgements arrive.
    ResourceExhausted(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
