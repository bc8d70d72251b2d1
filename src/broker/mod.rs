//! MQTT Broker Core
//!
//! Accepts client sockets and runs one connection task per socket. The
//! subscription registry and the connection table are the only state shared
//! between tasks.

mod connection;
mod dispatch;

pub use connection::{Connection, ConnectionError, ConnectionTable};
pub use dispatch::{CloseReason, Delivery, Dispatcher, Outcome};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::buffer_pool::BufferPool;
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::hooks::{DefaultHooks, Hooks};
use crate::metrics::Metrics;
use crate::protocol::{ConnAck, ConnectReturnCode, Packet, QoS};
use crate::session::SessionId;
use crate::topic::{SegmentPolicy, SubscriptionRegistry};

/// Sockets above the connection limit that may wait for their CONNECT at once
const MAX_PENDING_REFUSALS: usize = 64;

/// Longest wait for the CONNECT of a socket that will be refused
const REFUSAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest CONNECT read from a socket that will be refused
const REFUSAL_MAX_CONNECT: usize = 64 * 1024;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum remaining length accepted from a client
    pub max_packet_size: usize,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Highest QoS granted to a subscription
    pub max_qos: QoS,
    /// Outgoing QoS > 0 messages in flight per session (0 = unlimited)
    pub max_inflight: usize,
    /// Outgoing publishes queued per session while the inflight window is full
    pub max_pending: usize,
    /// Age after which an unacknowledged PUBLISH or PUBREL is sent again
    pub retry_interval: Duration,
    /// Capacity of each session's outbound delivery channel
    pub outbound_channel_capacity: usize,
    /// How empty topic levels are matched
    pub segment_policy: SegmentPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 100_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(30),
            max_qos: QoS::ExactlyOnce,
            max_inflight: 32,
            max_pending: 1000,
            retry_interval: Duration::from_secs(30),
            outbound_channel_capacity: 1024,
            segment_policy: SegmentPolicy::Preserve,
        }
    }
}

/// The MQTT Broker
pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    /// Connected sessions -> outbound delivery channel
    connections: Arc<ConnectionTable>,
    hooks: Arc<dyn Hooks>,
    buffers: Arc<BufferPool>,
    metrics: Option<Arc<Metrics>>,
    /// Open sockets, connected or not
    limit: Arc<Semaphore>,
    /// Sockets being refused with CONNACK 3
    refusals: Arc<Semaphore>,
    next_session: AtomicU64,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let registry = Arc::new(SubscriptionRegistry::with_policy(config.segment_policy));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            hooks.clone(),
            config.max_qos,
        ));

        Self {
            limit: Arc::new(Semaphore::new(config.max_connections)),
            refusals: Arc::new(Semaphore::new(MAX_PENDING_REFUSALS)),
            config: Arc::new(config),
            registry,
            dispatcher,
            connections: Arc::new(DashMap::new()),
            hooks,
            buffers: BufferPool::new(),
            metrics: None,
            next_session: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Record Prometheus metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("MQTT/TCP listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Broker shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Handle a new connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let Ok(permit) = self.limit.clone().try_acquire_owned() else {
            warn!(
                "Connection limit ({}) reached, rejecting {}",
                self.config.max_connections, addr
            );
            if let Some(ref metrics) = self.metrics {
                metrics.connection_rejected();
            }
            match self.refusals.clone().try_acquire_owned() {
                Ok(refusal) => {
                    let wait = self.config.connect_timeout.min(REFUSAL_TIMEOUT);
                    tokio::spawn(async move {
                        let _refusal = refusal;
                        refuse_connection(stream, wait).await;
                    });
                }
                Err(_) => debug!("Too many pending refusals, closing {}", addr),
            }
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let mut conn = Connection::new(
            stream,
            addr,
            id,
            self.dispatcher.clone(),
            self.connections.clone(),
            self.config.clone(),
            self.hooks.clone(),
            &self.buffers,
            self.metrics.clone(),
        );
        let shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _permit = permit;
            match conn.run(shutdown_rx).await {
                Ok(()) | Err(ConnectionError::Shutdown) => {}
                Err(ConnectionError::Io(e)) => debug!("Connection {} ({}) closed: {}", id, addr, e),
                Err(e) => debug!("Connection error from {} ({}): {}", addr, id, e),
            }
        });
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Shared subscription registry
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Get connection count (sessions past CONNECT)
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Answer the client's CONNECT with "server unavailable" and close
async fn refuse_connection<S>(mut stream: S, wait: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let decoder = Decoder::new().with_max_packet_size(REFUSAL_MAX_CONNECT);
    let mut buf = BytesMut::with_capacity(256);

    let read_connect = async {
        loop {
            match decoder.decode(&buf) {
                Ok(Some((Packet::Connect(_), _))) => return true,
                Ok(None) => {}
                _ => return false,
            }
            match stream.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {}
                _ => return false,
            }
        }
    };
    if !matches!(timeout(wait, read_connect).await, Ok(true)) {
        return;
    }

    buf.clear();
    let refusal = Packet::ConnAck(ConnAck::refused(ConnectReturnCode::ServerUnavailable));
    if Encoder::new().encode(&refusal, &mut buf).is_ok() {
        let _ = stream.write_all(&buf).await;
    }
    let _ = stream.shutdown().await;
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
