//! MQTT Connection Handler
//!
//! One task per client socket. Reads into a pooled buffer, decodes every
//! complete frame in arrival order, hands each packet to the dispatcher and
//! writes the replies. Deliveries for other sessions go through their
//! outbound channels; this task's own channel is drained into the socket
//! after a packet id has been taken from the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::dispatch::{CloseReason, Delivery, Dispatcher, Outcome};
use super::BrokerConfig;
use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::codec::{Decoder, Encoder};
use crate::hooks::Hooks;
use crate::metrics::Metrics;
use crate::protocol::{DecodeError, Packet, ProtocolError, Publish};
use crate::session::{InflightState, Session, SessionId};

/// Outbound senders of every connected session
pub type ConnectionTable = DashMap<SessionId, mpsc::Sender<Publish>>;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    session: Session,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: PooledBuf,
    write_buf: PooledBuf,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionTable>,
    outbound_tx: mpsc::Sender<Publish>,
    outbound_rx: mpsc::Receiver<Publish>,
    config: Arc<BrokerConfig>,
    hooks: Arc<dyn Hooks>,
    metrics: Option<Arc<Metrics>>,
    /// Inserted into the connection table
    registered: bool,
    /// Client ended with DISCONNECT
    graceful: bool,
    cleaned_up: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: S,
        addr: SocketAddr,
        id: SessionId,
        dispatcher: Arc<Dispatcher>,
        connections: Arc<ConnectionTable>,
        config: Arc<BrokerConfig>,
        hooks: Arc<dyn Hooks>,
        buffers: &Arc<BufferPool>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
        let inflight = InflightState::new(config.max_inflight, config.max_pending);
        Self {
            stream,
            addr,
            session: Session::with_inflight(id, inflight),
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: buffers.acquire(),
            write_buf: buffers.acquire(),
            dispatcher,
            connections,
            outbound_tx,
            outbound_rx,
            config,
            hooks,
            metrics,
            registered: false,
            graceful: false,
            cleaned_up: false,
        }
    }

    /// Serve the connection until it ends, then clean up
    ///
    /// Cleanup runs exactly once whatever ended the connection: DISCONNECT,
    /// EOF, an I/O or protocol error, a timeout or broker shutdown.
    pub async fn run(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let result = tokio::select! {
            result = self.serve() => result,
            _ = shutdown.recv() => Err(ConnectionError::Shutdown),
        };
        self.cleanup().await;
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        match timeout(self.config.connect_timeout, self.read_connect()).await {
            Ok(Ok(Flow::Continue)) => {}
            Ok(Ok(Flow::Close)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        self.run_connected().await
    }

    /// Read until the CONNECT has been handled
    async fn read_connect(&mut self) -> Result<Flow, ConnectionError> {
        loop {
            if self.read_frames().await? == Flow::Close {
                return Ok(Flow::Close);
            }
            if self.session.connected {
                return Ok(Flow::Continue);
            }
            if self.stream.read_buf(&mut *self.read_buf).await? == 0 {
                debug!("Connection closed from {} before CONNECT", self.addr);
                return Ok(Flow::Close);
            }
        }
    }

    /// Run the main connection loop
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let mut keep_alive_deadline = self.keep_alive_deadline();

        let mut retry_ticker = tokio::time::interval(self.config.retry_interval);
        // Skip the first immediate tick
        retry_ticker.tick().await;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut *self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", self.addr);
                        return Ok(());
                    }
                    if self.read_frames().await? == Flow::Close {
                        return Ok(());
                    }
                }

                Some(publish) = self.outbound_rx.recv() => {
                    self.write_outbound(publish)?;
                    while let Ok(publish) = self.outbound_rx.try_recv() {
                        self.write_outbound(publish)?;
                    }
                    self.flush().await?;
                }

                _ = retry_ticker.tick() => {
                    self.retry_unacked().await?;
                }

                _ = async move {
                    match keep_alive_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if self.session.is_keep_alive_expired() {
                        info!("Keep alive timeout for {} - disconnecting", self.session.client_id);
                        return Err(ConnectionError::Timeout);
                    }
                    keep_alive_deadline = self.keep_alive_deadline();
                }
            }
        }
    }

    /// When the session expires if no further packet arrives
    fn keep_alive_deadline(&self) -> Option<tokio::time::Instant> {
        self.session
            .keep_alive_timeout()
            .map(|d| tokio::time::Instant::from_std(self.session.last_activity) + d)
    }

    /// Decode and handle every complete frame in the read buffer
    async fn read_frames(&mut self) -> Result<Flow, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            bytes::Buf::advance(&mut *self.read_buf, consumed);
            if let Some(ref metrics) = self.metrics {
                metrics.packet_received(consumed, matches!(packet, Packet::Publish(_)));
            }
            trace!("{} <- {:?}", self.session.id, packet.packet_type());

            self.session.touch();
            let outcome = self.dispatcher.dispatch(&mut self.session, packet).await?;
            if self.apply(outcome).await? == Flow::Close {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Write replies in order, then fan out
    async fn apply(&mut self, outcome: Outcome) -> Result<Flow, ConnectionError> {
        let Outcome {
            replies,
            deliveries,
            close,
        } = outcome;

        // Registered before CONNACK goes out, so publishes routed to this
        // session right after the client sees CONNACK are not lost
        if self.session.connected && !self.registered {
            self.register().await;
        }

        let mut subscriptions_changed = false;
        for reply in &replies {
            subscriptions_changed |= matches!(reply, Packet::SubAck(_) | Packet::UnsubAck(_));
            self.write_packet(reply)?;
        }
        self.flush().await?;

        if subscriptions_changed {
            if let Some(ref metrics) = self.metrics {
                metrics.set_subscriptions(self.dispatcher.registry().subscription_count());
            }
        }
        self.fan_out(deliveries);

        match close {
            Some(CloseReason::ClientDisconnect) => {
                debug!("DISCONNECT from {}", self.session.client_id);
                self.graceful = true;
                Ok(Flow::Close)
            }
            Some(CloseReason::ConnectRefused) => Ok(Flow::Close),
            None => Ok(Flow::Continue),
        }
    }

    /// Hand each delivery to its recipient's outbound channel
    ///
    /// The registry snapshot was taken by the dispatcher; no registry lock is
    /// held here. A recipient that is gone or full loses only its own copy.
    fn fan_out(&self, deliveries: Vec<Delivery>) {
        for Delivery { session, publish } in deliveries {
            let sent = match self.connections.get(&session) {
                Some(sender) => sender.try_send(publish).is_ok(),
                None => false,
            };
            if !sent {
                debug!("Dropping delivery to {}: recipient gone or full", session);
                if let Some(ref metrics) = self.metrics {
                    metrics.publish_dropped();
                }
            }
        }
    }

    /// Assign a packet id (QoS > 0) and encode an outbound publish
    fn write_outbound(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        match self.session.inflight.send_publish(publish) {
            Some(publish) => self.write_packet(&Packet::Publish(publish)),
            None => {
                trace!(
                    "{}: publish queued ({} pending)",
                    self.session.id,
                    self.session.inflight.pending_len()
                );
                Ok(())
            }
        }
    }

    async fn retry_unacked(&mut self) -> Result<(), ConnectionError> {
        let due = self
            .session
            .inflight
            .due_for_retry(Instant::now(), self.config.retry_interval);
        if due.is_empty() {
            return Ok(());
        }

        debug!("{}: retransmitting {} packet(s)", self.session.id, due.len());
        for packet in &due {
            self.write_packet(packet)?;
            if let Some(ref metrics) = self.metrics {
                metrics.retransmitted();
            }
        }
        self.flush().await
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let start = self.write_buf.len();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        if let Some(ref metrics) = self.metrics {
            metrics.packet_sent(
                self.write_buf.len() - start,
                matches!(packet, Packet::Publish(p) if !p.dup),
            );
        }
        trace!("{} -> {:?}", self.session.id, packet.packet_type());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        Ok(())
    }

    async fn register(&mut self) {
        self.connections
            .insert(self.session.id, self.outbound_tx.clone());
        self.registered = true;
        if let Some(ref metrics) = self.metrics {
            metrics.client_connected();
        }
        info!(
            "Client '{}' connected from {} ({})",
            self.session.client_id, self.addr, self.session.id
        );
        self.hooks
            .on_client_connected(&self.session.client_id)
            .await;
    }

    async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if self.registered {
            self.connections.remove(&self.session.id);
            let removed = self
                .dispatcher
                .registry()
                .unsubscribe_all(self.session.id);
            if let Some(ref metrics) = self.metrics {
                metrics.client_disconnected();
                metrics.set_subscriptions(self.dispatcher.registry().subscription_count());
            }
            info!(
                "Client '{}' disconnected ({} subscription(s) removed)",
                self.session.client_id, removed
            );
            self.hooks
                .on_client_disconnected(&self.session.client_id, self.graceful)
                .await;
        }

        let dropped = self.session.inflight.inflight_len() + self.session.inflight.pending_len();
        if dropped > 0 {
            warn!(
                "{}: discarding {} unacknowledged message(s)",
                self.session.id, dropped
            );
        }
        self.session.inflight.clear();
        self.session.subscriptions.clear();
        self.session.connected = false;
        let _ = self.stream.shutdown().await;
    }
}
