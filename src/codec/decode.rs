//! MQTT Packet Decoder
//!
//! Splits a byte stream into frames and decodes each frame body with the
//! codec selected by the packet type nibble.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, TopicFilter, UnsubAck,
    Unsubscribe, Will, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), or `None` while the frame is incomplete
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];

        // Read remaining length
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Check packet size limit
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];
        let packet = self.decode_frame(first_byte, body)?;

        Ok(Some((packet, total_len)))
    }

    /// Decode one already-framed packet: the first header byte plus exactly
    /// the body the remaining length declared.
    pub fn decode_frame(&self, first_byte: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let type_bits = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let packet_type =
            PacketType::from_u8(type_bits).ok_or(DecodeError::UnsupportedPacketType(type_bits))?;

        if let Some(expected) = packet_type.fixed_flags() {
            if flags != expected {
                return Err(DecodeError::InvalidFlags);
            }
        }

        match packet_type {
            PacketType::Connect => decode_connect(body),
            PacketType::ConnAck => decode_connack(body),
            PacketType::Publish => decode_publish(flags, body),
            PacketType::PubAck => Ok(Packet::PubAck(PubAck::new(decode_packet_id(body)?))),
            PacketType::PubRec => Ok(Packet::PubRec(PubRec::new(decode_packet_id(body)?))),
            PacketType::PubRel => Ok(Packet::PubRel(PubRel::new(decode_packet_id(body)?))),
            PacketType::PubComp => Ok(Packet::PubComp(PubComp::new(decode_packet_id(body)?))),
            PacketType::Subscribe => decode_subscribe(body),
            PacketType::SubAck => decode_suback(body),
            PacketType::Unsubscribe => decode_unsubscribe(body),
            PacketType::UnsubAck => Ok(Packet::UnsubAck(UnsubAck::new(decode_packet_id(body)?))),
            PacketType::PingReq => expect_empty(body).map(|_| Packet::PingReq),
            PacketType::PingResp => expect_empty(body).map(|_| Packet::PingResp),
            PacketType::Disconnect => expect_empty(body).map(|_| Packet::Disconnect),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_empty(body: &[u8]) -> Result<(), DecodeError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::MalformedPacket("packet has no body"))
    }
}

/// Body of PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK: exactly a packet id
fn decode_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    let packet_id = read_u16(body)?;
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("unexpected bytes after packet id"));
    }
    Ok(packet_id)
}

fn read_nonzero_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    let id = read_u16(body)?;
    if id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }
    Ok(id)
}

fn decode_connect(payload: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    // Protocol name
    let (protocol_name, len) = read_string(payload)?;
    pos += len;

    if protocol_name != PROTOCOL_NAME {
        return Err(DecodeError::InvalidProtocolName);
    }

    // Protocol level, then connect flags
    if pos + 2 > payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let level = payload[pos];
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::InvalidProtocolVersion(level));
    }
    let connect_flags = payload[pos + 1];
    pos += 2;

    // Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

    // If will flag is 0, will QoS and will retain must be 0
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = read_u16(&payload[pos..])?;
    pos += 2;

    let (client_id, len) = read_string(&payload[pos..])?;
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;
        let (will_payload, len) = read_binary(&payload[pos..])?;
        pos += len;

        Some(Will {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, len) = read_binary(&payload[pos..])?;
        pos += len;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    if pos != payload.len() {
        return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
    }

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        will,
        username,
        password,
    })))
}

fn decode_connack(payload: &[u8]) -> Result<Packet, DecodeError> {
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    if payload.len() > 2 {
        return Err(DecodeError::MalformedPacket("CONNACK body is two bytes"));
    }

    let acknowledge_flags = payload[0];
    // Only bit 0 is valid (session present), rest must be 0
    if (acknowledge_flags & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code = ConnectReturnCode::from_u8(payload[1])
        .ok_or(DecodeError::MalformedPacket("unknown CONNACK return code"))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (acknowledge_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // DUP must be 0 for QoS 0
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    // Topic name. Its validity is a routing concern: the dispatcher drops
    // publishes whose topic cannot be routed.
    let (topic, mut pos) = read_string(payload)?;

    // Packet ID (only for QoS > 0)
    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_nonzero_packet_id(&payload[pos..])?;
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&payload[pos..]),
    }))
}

fn decode_subscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_nonzero_packet_id(payload)?;
    let mut pos = 2;

    let mut filters = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }

        let requested = payload[pos];
        pos += 1;

        // [MQTT-3.8.3-4] upper six bits reserved
        if requested & 0xFC != 0 {
            return Err(DecodeError::MalformedPacket("reserved bits in requested QoS"));
        }
        let qos = QoS::from_u8(requested).ok_or(DecodeError::InvalidQoS(requested))?;

        filters.push(TopicFilter::new(filter, qos));
    }

    // SUBSCRIBE must have at least one topic filter
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(payload)?;

    let return_codes = payload[2..]
        .iter()
        .map(|&code| {
            SubscribeReturnCode::from_u8(code)
                .ok_or(DecodeError::MalformedPacket("invalid SUBACK return code"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if return_codes.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBACK must have at least one return code",
        ));
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(payload: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_nonzero_packet_id(payload)?;
    let mut pos = 2;

    let mut filters = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;
        filters.push(filter.to_string());
    }

    // UNSUBSCRIBE must have at least one topic filter
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
