//! Prometheus metrics for RelayMQ
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All RelayMQ metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_rejected_total: IntCounter,

    // Packet metrics (all types)
    pub packets_received_total: IntCounter,
    pub packets_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,

    // Publish-specific metrics
    pub publish_received_total: IntCounter,
    pub publish_sent_total: IntCounter,
    pub publish_dropped_total: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,

    // QoS metrics
    pub qos_retransmits_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let r = &registry;

        Ok(Self {
            connections_total: counter(
                r,
                "relaymq_connections_total",
                "Total number of accepted client connections since startup",
            )?,
            connections_current: gauge(
                r,
                "relaymq_connections_current",
                "Current number of connected clients",
            )?,
            connections_rejected_total: counter(
                r,
                "relaymq_connections_rejected_total",
                "Connections refused because the connection limit was reached",
            )?,
            packets_received_total: counter(
                r,
                "relaymq_packets_received_total",
                "Total packets received (all types)",
            )?,
            packets_sent_total: counter(
                r,
                "relaymq_packets_sent_total",
                "Total packets sent (all types)",
            )?,
            bytes_received_total: counter(
                r,
                "relaymq_bytes_received_total",
                "Total bytes of decoded packets received",
            )?,
            bytes_sent_total: counter(
                r,
                "relaymq_bytes_sent_total",
                "Total bytes of encoded packets sent",
            )?,
            publish_received_total: counter(
                r,
                "relaymq_publish_received_total",
                "Total PUBLISH packets received",
            )?,
            publish_sent_total: counter(
                r,
                "relaymq_publish_sent_total",
                "Total PUBLISH packets sent, retransmissions excluded",
            )?,
            publish_dropped_total: counter(
                r,
                "relaymq_publish_dropped_total",
                "Deliveries dropped because the recipient was gone or its queue was full",
            )?,
            subscriptions_current: gauge(
                r,
                "relaymq_subscriptions_current",
                "Current number of (session, filter) subscriptions",
            )?,
            qos_retransmits_total: counter(
                r,
                "relaymq_qos_retransmits_total",
                "PUBLISH and PUBREL packets sent again after the retry interval",
            )?,
            registry,
        })
    }

    /// Record a new connection
    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    /// Record a disconnection
    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected_total.inc();
    }

    /// Record a received packet of `bytes` encoded length
    pub fn packet_received(&self, bytes: usize, is_publish: bool) {
        self.packets_received_total.inc();
        self.bytes_received_total.inc_by(bytes as u64);
        if is_publish {
            self.publish_received_total.inc();
        }
    }

    /// Record a sent packet of `bytes` encoded length
    pub fn packet_sent(&self, bytes: usize, is_publish: bool) {
        self.packets_sent_total.inc();
        self.bytes_sent_total.inc_by(bytes as u64);
        if is_publish {
            self.publish_sent_total.inc();
        }
    }

    pub fn publish_dropped(&self) {
        self.publish_dropped_total.inc();
    }

    pub fn retransmitted(&self) {
        self.qos_retransmits_total.inc();
    }

    pub fn set_subscriptions(&self, count: usize) {
        self.subscriptions_current.set(count as i64);
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();

        assert_eq!(metrics.connections_total.get(), 2);
        assert_eq!(metrics.connections_current.get(), 1);
    }

    #[test]
    fn test_packet_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.packet_received(12, true);
        metrics.packet_received(2, false);
        metrics.packet_sent(4, false);

        assert_eq!(metrics.packets_received_total.get(), 2);
        assert_eq!(metrics.bytes_received_total.get(), 14);
        assert_eq!(metrics.publish_received_total.get(), 1);
        assert_eq!(metrics.packets_sent_total.get(), 1);
        assert_eq!(metrics.publish_sent_total.get(), 0);
    }

    #[test]
    fn test_render_uses_prefix() {
        let metrics = Metrics::new().unwrap();
        metrics.set_subscriptions(3);
        let text = metrics.render().unwrap();
        assert!(text.contains("relaymq_subscriptions_current 3"));
        assert!(text.contains("relaymq_connections_total 0"));
    }
}
