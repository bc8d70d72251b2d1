//! MQTT Packet Definitions
//!
//! One closed enum covers every MQTT v3.1.1 control packet. Consumers
//! dispatch with `match`, so adding a packet kind is a compile error at
//! every site that has not handled it.

use std::sync::Arc;

use bytes::Bytes;

use super::{PacketType, QoS};

/// MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// CONNECT packet (client -> server)
///
/// Protocol name and level are not stored: the codec always writes
/// `"MQTT"` / 4 and rejects anything else on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier (may be empty)
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Will message (optional)
    pub will: Option<Will>,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional, requires username)
    pub password: Option<Bytes>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            will: None,
            username: None,
            password: None,
        }
    }
}

impl Connect {
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive,
            ..Default::default()
        }
    }
}

/// Will message carried by CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    #[default]
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Accepted),
            1 => Some(Self::UnacceptableProtocolVersion),
            2 => Some(Self::IdentifierRejected),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadUsernameOrPassword),
            5 => Some(Self::NotAuthorized),
            _ => None,
        }
    }
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn refused(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// PUBLISH packet (bidirectional)
///
/// The topic field uses `Arc<str>` for efficient fan-out: when routing a message
/// to multiple subscribers, cloning the topic is O(1) instead of O(n) for String.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name (Arc<str> for cheap cloning during fan-out)
    pub topic: Arc<str>,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
    /// Payload
    pub payload: Bytes,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
        }
    }
}

impl Publish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            qos,
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Flags nibble: DUP bit 3, QoS bits 2-1, RETAIN bit 0
    pub fn flags(&self) -> u8 {
        ((self.dup as u8) << 3) | ((self.qos as u8) << 1) | (self.retain as u8)
    }
}

macro_rules! id_only_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            /// Packet identifier
            pub packet_id: u16,
        }

        impl $name {
            pub fn new(packet_id: u16) -> Self {
                Self { packet_id }
            }
        }
    };
}

id_only_packet!(
    /// PUBACK packet (bidirectional, QoS 1)
    PubAck
);
id_only_packet!(
    /// PUBREC packet (bidirectional, QoS 2 step 1)
    PubRec
);
id_only_packet!(
    /// PUBREL packet (bidirectional, QoS 2 step 2)
    PubRel
);
id_only_packet!(
    /// PUBCOMP packet (bidirectional, QoS 2 step 3)
    PubComp
);
id_only_packet!(
    /// UNSUBACK packet (server -> client)
    UnsubAck
);

/// Topic filter and requested QoS inside a SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }

    /// Level segments of the filter, derived from its current value
    pub fn segments(&self) -> std::str::Split<'_, char> {
        self.filter.split('/')
    }
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
}

/// Per-filter result carried by SUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Granted(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x80 => Some(Self::Failure),
            _ => QoS::from_u8(v).map(Self::Granted),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Granted(qos) => qos as u8,
            Self::Failure => 0x80,
        }
    }
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// One entry per requested filter, same order
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}
