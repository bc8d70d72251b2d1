//! MQTT Session Management
//!
//! Per-connection session state: identity, keep-alive, the session's own
//! view of its subscriptions, and QoS in-flight tracking. A session lives
//! exactly as long as its connection.

mod inflight;
mod packet_id;

pub use inflight::{Inbound, InflightMessage, InflightState, OutgoingState};
pub use packet_id::PacketIdAllocator;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::protocol::{Connect, QoS};

/// Unique id of one connection's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Client session
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Client identifier, empty until CONNECT
    pub client_id: Arc<str>,
    /// Whether CONNECT has been accepted
    pub connected: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Last activity timestamp
    pub last_activity: Instant,
    /// Filters this session holds, with their granted QoS
    pub subscriptions: AHashMap<String, QoS>,
    pub inflight: InflightState,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self::with_inflight(id, InflightState::default())
    }

    pub fn with_inflight(id: SessionId, inflight: InflightState) -> Self {
        Self {
            id,
            client_id: Arc::from(""),
            connected: false,
            keep_alive: 0,
            last_activity: Instant::now(),
            subscriptions: AHashMap::new(),
            inflight,
        }
    }

    /// Take identity and keep-alive from an accepted CONNECT
    pub fn accept(&mut self, connect: &Connect) {
        self.client_id = Arc::from(connect.client_id.as_str());
        self.keep_alive = connect.keep_alive;
        self.connected = true;
        self.touch();
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time allowed without traffic: 1.5 x keep alive, `None` when disabled
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        if self.keep_alive == 0 {
            return None;
        }
        Some(Duration::from_millis(self.keep_alive as u64 * 1500))
    }

    /// Check if keep alive has timed out
    pub fn is_keep_alive_expired(&self) -> bool {
        self.keep_alive_timeout()
            .is_some_and(|timeout| self.last_activity.elapsed() > timeout)
    }

    pub fn add_subscription(&mut self, filter: String, qos: QoS) {
        self.subscriptions.insert(filter, qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_connect() {
        let mut session = Session::new(SessionId(1));
        assert!(!session.connected);

        session.accept(&Connect::new("sensor-1", 10));
        assert!(session.connected);
        assert_eq!(session.client_id.as_ref(), "sensor-1");
        assert_eq!(session.keep_alive_timeout(), Some(Duration::from_secs(15)));
        assert!(!session.is_keep_alive_expired());
    }

    #[test]
    fn test_keep_alive_expires_after_one_and_a_half_intervals() {
        let mut session = Session::new(SessionId(1));
        session.accept(&Connect::new("c", 2));
        session.last_activity = Instant::now() - Duration::from_millis(2_900);
        assert!(!session.is_keep_alive_expired());

        session.last_activity = Instant::now() - Duration::from_millis(3_100);
        assert!(session.is_keep_alive_expired());

        session.touch();
        assert!(!session.is_keep_alive_expired());
    }

    #[test]
    fn test_keep_alive_disabled() {
        let mut session = Session::new(SessionId(1));
        session.accept(&Connect::new("c", 0));
        assert_eq!(session.keep_alive_timeout(), None);
        assert!(!session.is_keep_alive_expired());
    }

    #[test]
    fn test_subscriptions() {
        let mut session = Session::new(SessionId(2));
        session.add_subscription("a/#".to_string(), QoS::AtLeastOnce);
        assert!(session.remove_subscription("a/#"));
        assert!(!session.remove_subscription("a/#"));
    }
}
