//! Command dispatcher
//!
//! Maps each decoded packet to its handler. Handlers only touch the session
//! they are given and the shared subscription registry; they return what has
//! to be written back and which sessions a publish must reach, and leave the
//! I/O to the connection task.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::hooks::{HookError, Hooks};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::session::{Session, SessionId};
use crate::topic::{validate_topic_filter, validate_topic_name, SubscriptionRegistry};

/// A publish addressed to one subscriber session
///
/// `publish.qos` is already downgraded to the subscription's granted QoS.
/// The packet id is assigned by the recipient's own session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session: SessionId,
    pub publish: Publish,
}

/// Why the dispatcher asks for the connection to be closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent DISCONNECT
    ClientDisconnect,
    /// CONNACK carried a refusal
    ConnectRefused,
}

/// Everything a handler wants done, in order
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Packets for the sender, written in this order
    pub replies: Vec<Packet>,
    /// Fan-out, performed after the replies are queued
    pub deliveries: Vec<Delivery>,
    pub close: Option<CloseReason>,
}

impl Outcome {
    fn reply(packet: Packet) -> Self {
        Self {
            replies: vec![packet],
            ..Default::default()
        }
    }

    fn close(reason: CloseReason) -> Self {
        Self {
            close: Some(reason),
            ..Default::default()
        }
    }
}

/// Packet type -> handler table
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    hooks: Arc<dyn Hooks>,
    /// Highest QoS granted to any subscription
    max_qos: QoS,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, hooks: Arc<dyn Hooks>, max_qos: QoS) -> Self {
        Self {
            registry,
            hooks,
            max_qos,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Handle one inbound packet for `session`
    ///
    /// An `Err` is fatal for the connection: the caller closes it without
    /// sending anything further.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        packet: Packet,
    ) -> Result<Outcome, ProtocolError> {
        if !session.connected {
            return match packet {
                Packet::Connect(connect) => Ok(self.connect(session, &connect).await),
                _ => Err(ProtocolError::ProtocolViolation(
                    "first packet must be CONNECT",
                )),
            };
        }

        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT")),
            Packet::Publish(publish) => Ok(self.publish(session, publish).await),
            Packet::PubAck(ack) => {
                if !session.inflight.on_puback(ack.packet_id) {
                    trace!("{}: PUBACK for unknown id {}", session.id, ack.packet_id);
                }
                Ok(Self::release_pending(session))
            }
            Packet::PubRec(rec) => Ok(Outcome::reply(Packet::PubRel(
                session.inflight.on_pubrec(rec.packet_id),
            ))),
            Packet::PubRel(rel) => Ok(Outcome::reply(Packet::PubComp(
                session.inflight.on_pubrel(rel.packet_id),
            ))),
            Packet::PubComp(comp) => {
                if !session.inflight.on_pubcomp(comp.packet_id) {
                    trace!("{}: PUBCOMP for unknown id {}", session.id, comp.packet_id);
                }
                Ok(Self::release_pending(session))
            }
            Packet::Subscribe(subscribe) => Ok(self.subscribe(session, subscribe)),
            Packet::Unsubscribe(unsubscribe) => Ok(self.unsubscribe(session, unsubscribe)),
            Packet::PingReq => Ok(Outcome::reply(Packet::PingResp)),
            Packet::Disconnect => Ok(Outcome::close(CloseReason::ClientDisconnect)),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ProtocolError::ProtocolViolation(
                    "server-to-client packet received from client",
                ))
            }
        }
    }

    async fn connect(&self, session: &mut Session, connect: &Connect) -> Outcome {
        // [MQTT-3.1.3-8] an empty client id needs a clean session
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!("{}: rejecting empty client id without clean session", session.id);
            return Self::refuse(ConnectReturnCode::IdentifierRejected);
        }

        let verdict = self
            .hooks
            .on_authenticate(
                &connect.client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;

        match verdict {
            Ok(true) => {}
            Ok(false) => {
                debug!("{}: client '{}' not authorized", session.id, connect.client_id);
                return Self::refuse(ConnectReturnCode::NotAuthorized);
            }
            Err(HookError::AuthenticationFailed) => {
                debug!("{}: bad credentials for '{}'", session.id, connect.client_id);
                return Self::refuse(ConnectReturnCode::BadUsernameOrPassword);
            }
            Err(e @ HookError::Internal(_)) => {
                warn!("{}: authentication hook failed: {}", session.id, e);
                return Self::refuse(ConnectReturnCode::ServerUnavailable);
            }
        }

        session.accept(connect);
        debug!(
            "{}: client '{}' connected (keep alive {}s)",
            session.id, connect.client_id, connect.keep_alive
        );
        Outcome::reply(Packet::ConnAck(ConnAck::accepted()))
    }

    fn refuse(code: ConnectReturnCode) -> Outcome {
        Outcome {
            replies: vec![Packet::ConnAck(ConnAck::refused(code))],
            close: Some(CloseReason::ConnectRefused),
            ..Default::default()
        }
    }

    async fn publish(&self, session: &mut Session, publish: Publish) -> Outcome {
        let inbound = session.inflight.on_publish(&publish);
        let mut outcome = Outcome {
            replies: inbound.reply.into_iter().collect(),
            ..Default::default()
        };

        if let Err(reason) = validate_topic_name(&publish.topic) {
            debug!("{}: dropping publish: {}", session.id, reason);
            return outcome;
        }
        if !inbound.deliver {
            trace!("{}: duplicate QoS 2 publish {:?}", session.id, publish.packet_id);
            return outcome;
        }

        outcome.deliveries = self
            .registry
            .resolve(&publish.topic)
            .into_iter()
            .map(|(target, granted)| Delivery {
                session: target,
                publish: Publish {
                    dup: false,
                    qos: publish.qos.min(granted),
                    retain: false,
                    topic: publish.topic.clone(),
                    packet_id: None,
                    payload: publish.payload.clone(),
                },
            })
            .collect();

        trace!(
            "{}: publish on '{}' routed to {} subscriber(s)",
            session.id,
            publish.topic,
            outcome.deliveries.len()
        );
        self.hooks
            .on_message_published(&publish.topic, &publish.payload, publish.qos)
            .await;

        outcome
    }

    fn subscribe(&self, session: &mut Session, subscribe: Subscribe) -> Outcome {
        let return_codes = subscribe
            .filters
            .into_iter()
            .map(|tf| {
                if let Err(reason) = validate_topic_filter(&tf.filter) {
                    debug!("{}: rejecting filter '{}': {}", session.id, tf.filter, reason);
                    return SubscribeReturnCode::Failure;
                }
                let granted = tf.qos.min(self.max_qos);
                self.registry.subscribe(session.id, &tf.filter, granted);
                session.add_subscription(tf.filter, granted);
                SubscribeReturnCode::Granted(granted)
            })
            .collect();

        // Registry is fully updated before SUBACK goes out
        Outcome::reply(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
    }

    fn unsubscribe(&self, session: &mut Session, unsubscribe: Unsubscribe) -> Outcome {
        for filter in &unsubscribe.filters {
            self.registry.unsubscribe(session.id, filter);
            session.remove_subscription(filter);
        }
        Outcome::reply(Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
    }

    /// Publishes that were waiting for an identifier or an inflight slot
    fn release_pending(session: &mut Session) -> Outcome {
        Outcome {
            replies: session
                .inflight
                .drain_pending()
                .into_iter()
                .map(Packet::Publish)
                .collect(),
            ..Default::default()
        }
    }
}
