//! QoS 1 / QoS 2 acknowledgement state
//!
//! Tracks, per session, every outgoing publish waiting for PUBACK, PUBREC or
//! PUBCOMP, and every incoming QoS 2 publish waiting for PUBREL. Each handler
//! is idempotent: a retransmitted packet produces the same reply and never a
//! second delivery.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use tracing::trace;

use super::PacketIdAllocator;
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS};

/// Where an outgoing QoS > 0 publish is in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// QoS 1: PUBLISH sent
    AwaitingPubAck,
    /// QoS 2: PUBLISH sent
    AwaitingPubRec,
    /// QoS 2: PUBREC received, PUBREL sent
    AwaitingPubComp,
}

/// Outgoing publish kept until its handshake completes
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    pub state: OutgoingState,
    /// Timestamp of the last (re)transmission
    pub sent_at: Instant,
    pub retry_count: u32,
}

/// Result of accepting an incoming PUBLISH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Whether the message goes to subscribers. False for duplicates.
    pub deliver: bool,
    /// PUBACK or PUBREC to send back, if any
    pub reply: Option<Packet>,
}

/// Per-session in-flight tracking
#[derive(Debug)]
pub struct InflightState {
    ids: PacketIdAllocator,
    outgoing: AHashMap<u16, InflightMessage>,
    /// Incoming QoS 2 packet ids waiting for PUBREL
    incoming: AHashSet<u16>,
    /// Outgoing publishes waiting for a free packet id or inflight slot
    pending: VecDeque<Publish>,
    /// Cap on outgoing QoS > 0 messages in flight (0 = unlimited)
    max_inflight: usize,
    /// Cap on queued publishes; the oldest is dropped beyond it
    max_pending: usize,
}

impl Default for InflightState {
    fn default() -> Self {
        Self::new(0, 1000)
    }
}

impl InflightState {
    pub fn new(max_inflight: usize, max_pending: usize) -> Self {
        Self {
            ids: PacketIdAllocator::new(),
            outgoing: AHashMap::new(),
            incoming: AHashSet::new(),
            pending: VecDeque::new(),
            max_inflight,
            max_pending,
        }
    }

    // ------------------------------------------------------------------
    // Outgoing (broker or client -> peer)
    // ------------------------------------------------------------------

    /// Prepare a publish for transmission
    ///
    /// QoS 0 passes straight through. QoS > 0 gets a fresh packet id and is
    /// recorded; if no id or inflight slot is free it is queued and `None`
    /// is returned. Queued messages come back from [`Self::drain_pending`].
    pub fn send_publish(&mut self, mut publish: Publish) -> Option<Publish> {
        publish.dup = false;
        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            return Some(publish);
        }

        if !self.pending.is_empty() || self.window_full() {
            self.queue(publish);
            return None;
        }

        match self.ids.allocate() {
            Ok(id) => Some(self.record(id, publish)),
            Err(e) => {
                trace!("queueing publish: {}", e);
                self.queue(publish);
                None
            }
        }
    }

    /// Move queued publishes into flight while ids and slots are free
    pub fn drain_pending(&mut self) -> Vec<Publish> {
        let mut ready = Vec::new();
        while !self.pending.is_empty() && !self.window_full() {
            let Ok(id) = self.ids.allocate() else {
                break;
            };
            if let Some(publish) = self.pending.pop_front() {
                ready.push(self.record(id, publish));
            }
        }
        ready
    }

    fn window_full(&self) -> bool {
        self.max_inflight > 0 && self.outgoing.len() >= self.max_inflight
    }

    fn queue(&mut self, publish: Publish) {
        if self.pending.len() >= self.max_pending {
            // Drop oldest message
            self.pending.pop_front();
        }
        self.pending.push_back(publish);
    }

    fn record(&mut self, id: u16, mut publish: Publish) -> Publish {
        publish.packet_id = Some(id);
        let state = if publish.qos == QoS::ExactlyOnce {
            OutgoingState::AwaitingPubRec
        } else {
            OutgoingState::AwaitingPubAck
        };
        self.outgoing.insert(
            id,
            InflightMessage {
                publish: publish.clone(),
                state,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
        publish
    }

    /// PUBACK received. Returns true if it completed a QoS 1 flow.
    pub fn on_puback(&mut self, id: u16) -> bool {
        self.complete(id, OutgoingState::AwaitingPubAck)
    }

    /// PUBREC received. Always answers with PUBREL, including for duplicates.
    pub fn on_pubrec(&mut self, id: u16) -> PubRel {
        if let Some(msg) = self.outgoing.get_mut(&id) {
            if msg.state == OutgoingState::AwaitingPubRec {
                msg.state = OutgoingState::AwaitingPubComp;
                msg.sent_at = Instant::now();
            }
        }
        PubRel::new(id)
    }

    /// PUBCOMP received. Returns true if it completed a QoS 2 flow.
    pub fn on_pubcomp(&mut self, id: u16) -> bool {
        self.complete(id, OutgoingState::AwaitingPubComp)
    }

    fn complete(&mut self, id: u16, expected: OutgoingState) -> bool {
        match self.outgoing.get(&id) {
            Some(msg) if msg.state == expected => {
                self.outgoing.remove(&id);
                self.ids.release(id);
                true
            }
            _ => false,
        }
    }

    /// Packets to retransmit: PUBLISH with DUP set before the first
    /// acknowledgement, PUBREL once PUBREC has arrived
    pub fn due_for_retry(&mut self, now: Instant, interval: Duration) -> Vec<Packet> {
        let mut due: Vec<(u16, Packet)> = self
            .outgoing
            .iter_mut()
            .filter(|(_, msg)| now.saturating_duration_since(msg.sent_at) >= interval)
            .map(|(&id, msg)| {
                msg.retry_count += 1;
                msg.sent_at = now;
                let packet = match msg.state {
                    OutgoingState::AwaitingPubAck | OutgoingState::AwaitingPubRec => {
                        let mut publish = msg.publish.clone();
                        publish.dup = true;
                        Packet::Publish(publish)
                    }
                    OutgoingState::AwaitingPubComp => Packet::PubRel(PubRel::new(id)),
                };
                (id, packet)
            })
            .collect();
        due.sort_unstable_by_key(|(id, _)| *id);
        due.into_iter().map(|(_, packet)| packet).collect()
    }

    // ------------------------------------------------------------------
    // Incoming (peer -> us)
    // ------------------------------------------------------------------

    /// Accept an incoming PUBLISH
    pub fn on_publish(&mut self, publish: &Publish) -> Inbound {
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => Inbound {
                deliver: true,
                reply: Some(Packet::PubAck(PubAck::new(id))),
            },
            (QoS::ExactlyOnce, Some(id)) => Inbound {
                // A second copy before PUBREL is the same message
                deliver: self.incoming.insert(id),
                reply: Some(Packet::PubRec(PubRec::new(id))),
            },
            _ => Inbound {
                deliver: true,
                reply: None,
            },
        }
    }

    /// PUBREL received. Always answers with PUBCOMP, including for unknown ids.
    pub fn on_pubrel(&mut self, id: u16) -> PubComp {
        self.incoming.remove(&id);
        PubComp::new(id)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn inflight_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_inflight(&self, id: u16) -> bool {
        self.outgoing.contains_key(&id)
    }

    pub fn outgoing_state(&self, id: u16) -> Option<OutgoingState> {
        self.outgoing.get(&id).map(|msg| msg.state)
    }

    pub fn awaiting_pubrel(&self, id: u16) -> bool {
        self.incoming.contains(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop all state (connection gone, clean session)
    pub fn clear(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
        self.pending.clear();
        self.ids.clear();
    }
}
