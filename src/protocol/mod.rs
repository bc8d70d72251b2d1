//! MQTT Protocol definitions and types
//!
//! Defines the MQTT v3.1.1 data model shared by the codec, the broker and the client

mod error;
mod packet;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;

/// Protocol name carried by every CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT v3.1.1
pub const PROTOCOL_LEVEL: u8 = 4;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (for subscription matching)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// MQTT Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Resolve the upper nibble of the first header byte.
    ///
    /// Returns `None` for 0 and 15, which MQTT v3.1.1 reserves.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// Flags nibble every packet of this type must carry.
    ///
    /// PUBLISH has variable flags and returns `None`.
    pub fn fixed_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_min() {
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.min(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_reserved_packet_types() {
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::from_u8(15), None);
        assert_eq!(PacketType::from_u8(14), Some(PacketType::Disconnect));
    }

    #[test]
    fn test_fixed_flags() {
        assert_eq!(PacketType::PubRel.fixed_flags(), Some(0x02));
        assert_eq!(PacketType::Subscribe.fixed_flags(), Some(0x02));
        assert_eq!(PacketType::Unsubscribe.fixed_flags(), Some(0x02));
        assert_eq!(PacketType::PingReq.fixed_flags(), Some(0x00));
        assert_eq!(PacketType::Publish.fixed_flags(), None);
    }
}
