//! RelayMQ - MQTT v3.1.1 publish/subscribe core
//!
//! Packet codec, topic matching, a concurrent subscription registry,
//! per-session QoS 1/2 state and a command dispatcher, hosted by a tokio
//! TCP broker. A small async client speaks the same codec.

pub mod broker;
pub mod buffer_pool;
pub mod client;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use client::{Client, ClientError};
pub use config::Config;
pub use hooks::{DefaultHooks, Hooks};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{Packet, QoS};
pub use topic::{SegmentPolicy, SubscriptionRegistry};
