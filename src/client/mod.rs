//! MQTT v3.1.1 client
//!
//! A small request/response client over one TCP stream, framed with the
//! broker's own codec. Each call sends one packet and waits for its
//! acknowledgement; packets that arrive in between (typically PUBLISH from a
//! subscription) are kept and returned later by [`Client::recv`].

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, EncodeError, Packet, PacketType, ProtocolError, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe, TopicFilter, UnsubAck,
    Unsubscribe,
};
use crate::session::PacketIdAllocator;

/// Default time to wait for an acknowledgement
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client error types
#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    Protocol(ProtocolError),
    /// Broker closed the connection
    Closed,
    /// A reply of the wrong type arrived where only one type is valid
    UnexpectedPacket(PacketType),
    /// No reply within the response timeout
    Timeout,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "IO error: {}", e),
            ClientError::Decode(e) => write!(f, "Decode error: {}", e),
            ClientError::Encode(e) => write!(f, "Encode error: {}", e),
            ClientError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ClientError::Closed => write!(f, "Connection closed by broker"),
            ClientError::UnexpectedPacket(t) => write!(f, "Unexpected packet: {:?}", t),
            ClientError::Timeout => write!(f, "Timed out waiting for response"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Decode(e)
    }
}

impl From<EncodeError> for ClientError {
    fn from(e: EncodeError) -> Self {
        ClientError::Encode(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

/// MQTT client connection
pub struct Client {
    stream: TcpStream,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    ids: PacketIdAllocator,
    /// Packets received while waiting for a specific reply
    backlog: VecDeque<Packet>,
    response_timeout: Duration,
}

impl Client {
    /// Open a TCP connection to a broker. No MQTT traffic is sent yet.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
            ids: PacketIdAllocator::new(),
            backlog: VecDeque::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        })
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Send CONNECT and wait for CONNACK
    ///
    /// A refusal is not an error: check `return_code` on the result.
    pub async fn send_connect(
        &mut self,
        client_id: &str,
        keep_alive: u16,
    ) -> Result<ConnAck, ClientError> {
        self.send_connect_packet(Connect::new(client_id, keep_alive))
            .await
    }

    /// Send a fully specified CONNECT and wait for CONNACK
    pub async fn send_connect_packet(&mut self, connect: Connect) -> Result<ConnAck, ClientError> {
        self.send(&Packet::Connect(Box::new(connect))).await?;
        match self.read_with_timeout().await? {
            Packet::ConnAck(connack) => {
                debug!("CONNACK: {:?}", connack.return_code);
                Ok(connack)
            }
            other => Err(ClientError::UnexpectedPacket(other.packet_type())),
        }
    }

    /// Send PINGREQ and wait for PINGRESP
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.send(&Packet::PingReq).await?;
        self.expect(|p| matches!(p, Packet::PingResp).then_some(()))
            .await
    }

    /// Subscribe to `filters` and wait for the matching SUBACK
    pub async fn subscribe(&mut self, filters: Vec<TopicFilter>) -> Result<SubAck, ClientError> {
        let packet_id = self.ids.allocate()?;
        let result = self.subscribe_with_id(packet_id, filters).await;
        self.ids.release(packet_id);
        result
    }

    async fn subscribe_with_id(
        &mut self,
        packet_id: u16,
        filters: Vec<TopicFilter>,
    ) -> Result<SubAck, ClientError> {
        self.send(&Packet::Subscribe(Subscribe { packet_id, filters }))
            .await?;
        self.expect(|p| match p {
            Packet::SubAck(ack) if ack.packet_id == packet_id => Some(ack.clone()),
            _ => None,
        })
        .await
    }

    pub async fn subscribe_one(&mut self, filter: &str, qos: QoS) -> Result<SubAck, ClientError> {
        self.subscribe(vec![TopicFilter::new(filter, qos)]).await
    }

    /// Unsubscribe from `filters` and wait for the matching UNSUBACK
    pub async fn unsubscribe(&mut self, filters: Vec<String>) -> Result<UnsubAck, ClientError> {
        let packet_id = self.ids.allocate()?;
        let result = self.unsubscribe_with_id(packet_id, filters).await;
        self.ids.release(packet_id);
        result
    }

    async fn unsubscribe_with_id(
        &mut self,
        packet_id: u16,
        filters: Vec<String>,
    ) -> Result<UnsubAck, ClientError> {
        self.send(&Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
            .await?;
        self.expect(|p| match p {
            Packet::UnsubAck(ack) if ack.packet_id == packet_id => Some(*ack),
            _ => None,
        })
        .await
    }

    /// Publish a message
    ///
    /// QoS 0 returns once written. QoS 1 waits for PUBACK. QoS 2 waits for
    /// PUBREC, sends PUBREL and waits for PUBCOMP.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retain;

        if qos == QoS::AtMostOnce {
            return self.send(&Packet::Publish(publish)).await;
        }

        let packet_id = self.ids.allocate()?;
        publish.packet_id = Some(packet_id);
        let result = self.publish_with_ack(publish, packet_id).await;
        self.ids.release(packet_id);
        result
    }

    async fn publish_with_ack(&mut self, publish: Publish, id: u16) -> Result<(), ClientError> {
        let qos = publish.qos;
        self.send(&Packet::Publish(publish)).await?;

        if qos == QoS::AtLeastOnce {
            return self
                .expect(|p| matches!(p, Packet::PubAck(ack) if ack.packet_id == id).then_some(()))
                .await;
        }

        self.expect(|p| matches!(p, Packet::PubRec(rec) if rec.packet_id == id).then_some(()))
            .await?;
        self.send(&Packet::PubRel(PubRel::new(id))).await?;
        self.expect(|p| matches!(p, Packet::PubComp(comp) if comp.packet_id == id).then_some(()))
            .await
    }

    /// Acknowledge a PUBLISH received from the broker
    ///
    /// QoS 1 sends PUBACK. QoS 2 sends PUBREC, waits for PUBREL and sends
    /// PUBCOMP. QoS 0 needs nothing.
    pub async fn acknowledge(&mut self, publish: &Publish) -> Result<(), ClientError> {
        let Some(id) = publish.packet_id else {
            return Ok(());
        };
        match publish.qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => self.send(&Packet::PubAck(PubAck::new(id))).await,
            QoS::ExactlyOnce => {
                self.send(&Packet::PubRec(PubRec::new(id))).await?;
                self.expect(
                    |p| matches!(p, Packet::PubRel(rel) if rel.packet_id == id).then_some(()),
                )
                .await?;
                self.send(&Packet::PubComp(PubComp::new(id))).await
            }
        }
    }

    /// Next packet from the broker, `None` once the connection is closed
    pub async fn recv(&mut self) -> Result<Option<Packet>, ClientError> {
        if let Some(packet) = self.backlog.pop_front() {
            return Ok(Some(packet));
        }
        self.read_packet().await
    }

    /// Next PUBLISH from the broker, skipping anything else
    pub async fn recv_publish(&mut self) -> Result<Publish, ClientError> {
        loop {
            let packet = match self.backlog.pop_front() {
                Some(packet) => packet,
                None => self.read_with_timeout().await?,
            };
            if let Packet::Publish(publish) = packet {
                return Ok(publish);
            }
            trace!("skipping {:?} while waiting for PUBLISH", packet.packet_type());
        }
    }

    /// Send DISCONNECT and close the socket
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&Packet::Disconnect).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Encode and write one packet
    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        trace!("client -> {:?}", packet.packet_type());
        Ok(())
    }

    /// Wait for the first packet `pick` accepts; other packets are kept for `recv`
    async fn expect<T>(
        &mut self,
        mut pick: impl FnMut(&Packet) -> Option<T>,
    ) -> Result<T, ClientError> {
        loop {
            let packet = self.read_with_timeout().await?;
            if let Some(value) = pick(&packet) {
                return Ok(value);
            }
            self.backlog.push_back(packet);
        }
    }

    async fn read_with_timeout(&mut self) -> Result<Packet, ClientError> {
        match timeout(self.response_timeout, self.read_packet()).await {
            Ok(Ok(Some(packet))) => Ok(packet),
            Ok(Ok(None)) => Err(ClientError::Closed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>, ClientError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                trace!("client <- {:?}", packet.packet_type());
                return Ok(Some(packet));
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}
