//! MQTT Packet Encoder
//!
//! Every packet is written as: header byte, remaining length, body. The body
//! length is computed up front so the header is exact and nothing is written
//! for packets that cannot be encoded.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH, MAX_STRING_LEN};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    ///
    /// On error the buffer is left as it was before the call.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let body_len = body_len(packet)?;
        if body_len > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }

        let start = buf.len();
        buf.reserve(1 + 4 + body_len);
        buf.put_u8(header_byte(packet));

        let result = write_variable_int(buf, body_len as u32).and_then(|_| encode_body(packet, buf));
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }
}

fn header_byte(packet: &Packet) -> u8 {
    let packet_type = packet.packet_type();
    let flags = match packet {
        Packet::Publish(p) => p.flags(),
        _ => packet_type.fixed_flags().unwrap_or(0),
    };
    ((packet_type as u8) << 4) | (flags & 0x0F)
}

fn string_len(s: &[u8]) -> Result<usize, EncodeError> {
    if s.len() > MAX_STRING_LEN {
        return Err(EncodeError::StringTooLong);
    }
    Ok(2 + s.len())
}

fn body_len(packet: &Packet) -> Result<usize, EncodeError> {
    Ok(match packet {
        Packet::Connect(p) => connect_len(p)?,
        Packet::ConnAck(_) => 2,
        Packet::Publish(p) => {
            let id_len = publish_id_len(p)?;
            string_len(p.topic.as_bytes())? + id_len + p.payload.len()
        }
        Packet::PubAck(_)
        | Packet::PubRec(_)
        | Packet::PubRel(_)
        | Packet::PubComp(_)
        | Packet::UnsubAck(_) => 2,
        Packet::Subscribe(p) => {
            nonzero_id(p.packet_id)?;
            let mut len = 2;
            for tf in &p.filters {
                len += string_len(tf.filter.as_bytes())? + 1;
            }
            len
        }
        Packet::SubAck(p) => 2 + p.return_codes.len(),
        Packet::Unsubscribe(p) => {
            nonzero_id(p.packet_id)?;
            let mut len = 2;
            for filter in &p.filters {
                len += string_len(filter.as_bytes())?;
            }
            len
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    })
}

/// QoS 0 carries no packet id; QoS 1 and 2 carry a non-zero one
fn publish_id_len(packet: &Publish) -> Result<usize, EncodeError> {
    match (packet.qos, packet.packet_id) {
        (QoS::AtMostOnce, None) if packet.dup => {
            Err(EncodeError::InvalidFlags("DUP must be 0 for QoS 0"))
        }
        (QoS::AtMostOnce, None) => Ok(0),
        (QoS::AtMostOnce, Some(_)) => Err(EncodeError::InvalidPacketId),
        (_, Some(id)) => nonzero_id(id).map(|_| 2),
        (_, None) => Err(EncodeError::InvalidPacketId),
    }
}

fn nonzero_id(id: u16) -> Result<(), EncodeError> {
    if id == 0 {
        return Err(EncodeError::InvalidPacketId);
    }
    Ok(())
}

fn connect_len(packet: &Connect) -> Result<usize, EncodeError> {
    // [MQTT-3.1.2-22] a password needs a username
    if packet.password.is_some() && packet.username.is_none() {
        return Err(EncodeError::InvalidFlags("password without username"));
    }
    // protocol name + level + flags + keep alive
    let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
    len += string_len(packet.client_id.as_bytes())?;
    if let Some(ref will) = packet.will {
        len += string_len(will.topic.as_bytes())?;
        len += string_len(&will.payload)?;
    }
    if let Some(ref username) = packet.username {
        len += string_len(username.as_bytes())?;
    }
    if let Some(ref password) = packet.password {
        len += string_len(password)?;
    }
    Ok(len)
}

fn encode_body(packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(p) => encode_connect(p, buf),
        Packet::ConnAck(p) => {
            encode_connack(p, buf);
            Ok(())
        }
        Packet::Publish(p) => encode_publish(p, buf),
        Packet::PubAck(p) => {
            buf.put_u16(p.packet_id);
            Ok(())
        }
        Packet::PubRec(p) => {
            buf.put_u16(p.packet_id);
            Ok(())
        }
        Packet::PubRel(p) => {
            buf.put_u16(p.packet_id);
            Ok(())
        }
        Packet::PubComp(p) => {
            buf.put_u16(p.packet_id);
            Ok(())
        }
        Packet::Subscribe(p) => encode_subscribe(p, buf),
        Packet::SubAck(p) => {
            encode_suback(p, buf);
            Ok(())
        }
        Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
        Packet::UnsubAck(p) => {
            buf.put_u16(p.packet_id);
            Ok(())
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => Ok(()),
    }
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(buf, PROTOCOL_NAME)?;
    buf.put_u8(PROTOCOL_LEVEL);

    // Connect flags
    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }

    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }

    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) {
    buf.put_u8(packet.session_present as u8);
    buf.put_u8(packet.return_code as u8);
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(buf, &packet.topic)?;

    // Packet identifier (only for QoS > 0)
    if let Some(packet_id) = packet.packet_id {
        buf.put_u16(packet_id);
    }

    // Payload is the rest of the body, no length prefix
    buf.put_slice(&packet.payload);

    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u16(packet.packet_id);
    for tf in &packet.filters {
        write_string(buf, &tf.filter)?;
        buf.put_u8(tf.qos as u8);
    }
    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) {
    buf.put_u16(packet.packet_id);
    for code in &packet.return_codes {
        buf.put_u8(code.to_u8());
    }
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u16(packet.packet_id);
    for filter in &packet.filters {
        write_string(buf, filter)?;
    }
    Ok(())
}
