//! Integration tests for the MQTT broker
//!
//! These tests start a real broker on an ephemeral port and drive it with
//! `relaymq::Client` or raw TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use relaymq::protocol::{
    ConnectReturnCode, Packet, PubRel, Publish, QoS, SubscribeReturnCode, TopicFilter,
};
use relaymq::{Broker, BrokerConfig, Client};

/// Test broker configuration
fn test_config() -> BrokerConfig {
    BrokerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        max_connections: 100,
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Start a broker on an ephemeral port
async fn start_broker(config: BrokerConfig) -> (Arc<Broker>, SocketAddr) {
    let listener = TcpListener::bind(config.bind_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Broker::new(config));

    let server = broker.clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (broker, addr)
}

/// Connect a client and assert the CONNACK is accepted
async fn connected_client(addr: SocketAddr, client_id: &str) -> Client {
    let mut client = Client::connect(addr)
        .await
        .unwrap()
        .with_response_timeout(Duration::from_secs(2));
    let connack = client.send_connect(client_id, 60).await.unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    client
}

/// Assert nothing arrives within a short window
async fn assert_silent(client: &mut Client) {
    let result = timeout(Duration::from_millis(200), client.recv()).await;
    assert!(result.is_err(), "unexpected packet: {:?}", result);
}

/// Poll until `check` holds or a second has passed
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_connect_accepted_bytes() {
    let (_broker, addr) = start_broker(test_config()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // CONNECT: protocol "MQTT" level 4, clean session, keep alive 60, id "c1"
    let connect = [
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02, b'c',
        b'1',
    ];
    stream.write_all(&connect).await.unwrap();

    let mut connack = [0u8; 4];
    timeout(Duration::from_secs(2), stream.read_exact(&mut connack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connack, [0x20, 0x02, 0x00, 0x00]);
}

#[tokio::test]
async fn test_ping_pong() {
    let (_broker, addr) = start_broker(test_config()).await;
    let mut client = connected_client(addr, "pinger").await;

    client.ping().await.unwrap();
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut client = Client::connect(addr).await.unwrap();

    client.send(&Packet::PingReq).await.unwrap();
    let result = timeout(Duration::from_secs(2), client.recv()).await.unwrap();
    assert!(matches!(result, Ok(None) | Err(_)));
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_malformed_packet_closes_connection() {
    let (_broker, addr) = start_broker(test_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Packet type 0 is reserved
    stream.write_all(&[0x00, 0x00]).await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_connect_timeout() {
    let config = BrokerConfig {
        connect_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let (_broker, addr) = start_broker(config).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("broker should close an idle socket")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_empty_client_id_requires_clean_session() {
    let (_broker, addr) = start_broker(test_config()).await;
    let mut client = Client::connect(addr).await.unwrap();

    let mut connect = relaymq::protocol::Connect::new("", 60);
    connect.clean_session = false;
    let connack = client.send_connect_packet(connect).await.unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
}

#[tokio::test]
async fn test_max_connections() {
    let config = BrokerConfig {
        max_connections: 1,
        ..test_config()
    };
    let (_broker, addr) = start_broker(config).await;

    let _first = connected_client(addr, "first").await;

    let mut second = Client::connect(addr).await.unwrap();
    let connack = second.send_connect("second", 60).await.unwrap();
    assert_eq!(connack.return_code, ConnectReturnCode::ServerUnavailable);
}

// ============================================================================
// Subscribe Tests
// ============================================================================

#[tokio::test]
async fn test_suback_return_codes_in_order() {
    let (_broker, addr) = start_broker(test_config()).await;
    let mut client = connected_client(addr, "sub").await;

    let suback = client
        .subscribe(vec![
            TopicFilter::new("a/b", QoS::AtMostOnce),
            TopicFilter::new("a/+", QoS::AtLeastOnce),
            TopicFilter::new("a/bad#", QoS::AtLeastOnce),
            TopicFilter::new("#", QoS::ExactlyOnce),
        ])
        .await
        .unwrap();

    assert_eq!(
        suback.return_codes,
        vec![
            SubscribeReturnCode::Granted(QoS::AtMostOnce),
            SubscribeReturnCode::Granted(QoS::AtLeastOnce),
            SubscribeReturnCode::Failure,
            SubscribeReturnCode::Granted(QoS::ExactlyOnce),
        ]
    );
}

#[tokio::test]
async fn test_granted_qos_capped_by_max_qos() {
    let config = BrokerConfig {
        max_qos: QoS::AtLeastOnce,
        ..test_config()
    };
    let (_broker, addr) = start_broker(config).await;
    let mut client = connected_client(addr, "capped").await;

    let suback = client.subscribe_one("x/#", QoS::ExactlyOnce).await.unwrap();
    assert_eq!(
        suback.return_codes,
        vec![SubscribeReturnCode::Granted(QoS::AtLeastOnce)]
    );
}

// ============================================================================
// Publish Tests
// ============================================================================

#[tokio::test]
async fn test_fan_out_to_matching_subscribers_only() {
    let (_broker, addr) = start_broker(test_config()).await;

    let mut temperature = connected_client(addr, "temperature").await;
    temperature
        .subscribe_one("home/temperature", QoS::AtMostOnce)
        .await
        .unwrap();

    let mut wildcard = connected_client(addr, "wildcard").await;
    wildcard.subscribe_one("home/+", QoS::AtMostOnce).await.unwrap();

    let mut humidity = connected_client(addr, "humidity").await;
    humidity
        .subscribe_one("home/humidity", QoS::AtMostOnce)
        .await
        .unwrap();

    let mut publisher = connected_client(addr, "publisher").await;
    publisher
        .publish("home/temperature", "25.5", QoS::AtMostOnce, false)
        .await
        .unwrap();

    for client in [&mut temperature, &mut wildcard] {
        let publish = client.recv_publish().await.unwrap();
        assert_eq!(&*publish.topic, "home/temperature");
        assert_eq!(&publish.payload[..], b"25.5");
        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert!(!publish.retain);
    }
    assert_silent(&mut humidity).await;
}

#[tokio::test]
async fn test_publisher_receives_own_message() {
    let (_broker, addr) = start_broker(test_config()).await;
    let mut client = connected_client(addr, "echo").await;

    client.subscribe_one("echo/#", QoS::AtMostOnce).await.unwrap();
    client
        .publish("echo/1", "hello", QoS::AtMostOnce, false)
        .await
        .unwrap();

    let publish = client.recv_publish().await.unwrap();
    assert_eq!(&publish.payload[..], b"hello");
}

#[tokio::test]
async fn test_delivery_qos_is_minimum_of_publish_and_grant() {
    let (_broker, addr) = start_broker(test_config()).await;

    let mut low = connected_client(addr, "low").await;
    low.subscribe_one("q/t", QoS::AtMostOnce).await.unwrap();

    let mut high = connected_client(addr, "high").await;
    high.subscribe_one("q/t", QoS::ExactlyOnce).await.unwrap();

    let mut publisher = connected_client(addr, "pub").await;
    publisher
        .publish("q/t", "m", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let publish = low.recv_publish().await.unwrap();
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);

    let publish = high.recv_publish().await.unwrap();
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(publish.packet_id.is_some());
    high.acknowledge(&publish).await.unwrap();
}

#[tokio::test]
async fn test_overlapping_filters_deliver_once_at_highest_qos() {
    let (_broker, addr) = start_broker(test_config()).await;

    let mut subscriber = connected_client(addr, "overlap").await;
    subscriber
        .subscribe(vec![
            TopicFilter::new("a/+", QoS::AtMostOnce),
            TopicFilter::new("a/#", QoS::AtLeastOnce),
        ])
        .await
        .unwrap();

    let mut publisher = connected_client(addr, "pub").await;
    publisher
        .publish("a/b", "once", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let publish = subscriber.recv_publish().await.unwrap();
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    subscriber.acknowledge(&publish).await.unwrap();
    assert_silent(&mut subscriber).await;
}

#[tokio::test]
async fn test_qos2_exactly_once_with_duplicate() {
    let (_broker, addr) = start_broker(test_config()).await;

    let mut subscriber = connected_client(addr, "sub2").await;
    subscriber
        .subscribe_one("sensors/#", QoS::ExactlyOnce)
        .await
        .unwrap();

    let mut publisher = connected_client(addr, "pub2").await;
    let mut publish = Publish::new("sensors/door", "open", QoS::ExactlyOnce);
    publish.packet_id = Some(12345);

    publisher.send(&Packet::Publish(publish.clone())).await.unwrap();
    match publisher.recv().await.unwrap() {
        Some(Packet::PubRec(rec)) => assert_eq!(rec.packet_id, 12345),
        other => panic!("expected PUBREC, got {:?}", other),
    }

    // Retransmission before PUBREL must not be delivered again
    publish.dup = true;
    publisher.send(&Packet::Publish(publish)).await.unwrap();
    match publisher.recv().await.unwrap() {
        Some(Packet::PubRec(rec)) => assert_eq!(rec.packet_id, 12345),
        other => panic!("expected PUBREC, got {:?}", other),
    }

    publisher
        .send(&Packet::PubRel(PubRel::new(12345)))
        .await
        .unwrap();
    match publisher.recv().await.unwrap() {
        Some(Packet::PubComp(comp)) => assert_eq!(comp.packet_id, 12345),
        other => panic!("expected PUBCOMP, got {:?}", other),
    }

    let delivered = subscriber.recv_publish().await.unwrap();
    assert_eq!(&delivered.payload[..], b"open");
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    subscriber.acknowledge(&delivered).await.unwrap();
    assert_silent(&mut subscriber).await;
}

#[tokio::test]
async fn test_client_qos2_publish_roundtrip() {
    let (_broker, addr) = start_broker(test_config()).await;

    let mut subscriber = connected_client(addr, "s").await;
    subscriber.subscribe_one("t", QoS::ExactlyOnce).await.unwrap();

    let mut publisher = connected_client(addr, "p").await;
    publisher
        .publish("t", "payload", QoS::ExactlyOnce, false)
        .await
        .unwrap();

    let delivered = subscriber.recv_publish().await.unwrap();
    assert_eq!(&delivered.payload[..], b"payload");
    subscriber.acknowledge(&delivered).await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (_broker, addr) = start_broker(test_config()).await;

    let mut subscriber = connected_client(addr, "unsub").await;
    subscriber.subscribe_one("news/#", QoS::AtMostOnce).await.unwrap();

    let unsuback = subscriber
        .unsubscribe(vec!["news/#".to_string()])
        .await
        .unwrap();
    assert!(unsuback.packet_id > 0);

    let mut publisher = connected_client(addr, "pub").await;
    publisher
        .publish("news/today", "x", QoS::AtMostOnce, false)
        .await
        .unwrap();

    assert_silent(&mut subscriber).await;
}

// ============================================================================
// Cleanup Tests
// ============================================================================

#[tokio::test]
async fn test_disconnect_removes_subscriptions() {
    let (broker, addr) = start_broker(test_config()).await;

    let mut client = connected_client(addr, "leaving").await;
    client.subscribe_one("a/#", QoS::AtLeastOnce).await.unwrap();
    client.subscribe_one("b/+", QoS::AtMostOnce).await.unwrap();
    assert_eq!(broker.subscriptions().subscription_count(), 2);
    assert_eq!(broker.connection_count(), 1);

    client.disconnect().await.unwrap();

    let registry = broker.subscriptions().clone();
    assert!(eventually(|| registry.subscription_count() == 0).await);
    assert!(eventually(|| broker.connection_count() == 0).await);
}

#[tokio::test]
async fn test_abrupt_close_removes_subscriptions() {
    let (broker, addr) = start_broker(test_config()).await;

    let mut client = connected_client(addr, "dropped").await;
    client.subscribe_one("a/#", QoS::AtMostOnce).await.unwrap();
    drop(client);

    let registry = broker.subscriptions().clone();
    assert!(eventually(|| registry.subscription_count() == 0).await);
    assert!(eventually(|| broker.connection_count() == 0).await);
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (broker, addr) = start_broker(test_config()).await;

    let mut client = connected_client(addr, "stay").await;
    client.subscribe_one("x", QoS::AtMostOnce).await.unwrap();

    broker.shutdown();

    let result = timeout(Duration::from_secs(2), client.recv()).await.unwrap();
    assert!(matches!(result, Ok(None) | Err(_)));

    let registry = broker.subscriptions().clone();
    assert!(eventually(|| registry.subscription_count() == 0).await);
}
