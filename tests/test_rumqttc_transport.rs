//! rumqttc transport against a minimal in-process broker
//!
//! The broker accepts one connection, answers CONNECT with a successful
//! CONNACK and records every byte the client sends afterwards.

use mqtt_subscriber::config::ClientConfig;
use mqtt_subscriber::transport::mqtt::{MqttClient, RumqttcConnector};
use mqtt_subscriber::transport::{Connector, EventSource, Link, TransportEvent};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const DISCONNECT: [u8; 2] = [0xE0, 0x00];
const WAIT: Duration = Duration::from_secs(5);

/// Start the broker; the handle yields the bytes received after CONNACK
async fn start_broker() -> (u16, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut connect = [0u8; 256];
        let n = socket.read(&mut connect).await.unwrap();
        assert!(n > 0, "client closed before CONNECT");
        assert_eq!(connect[0], 0x10, "first packet must be CONNECT");
        socket.write_all(&CONNACK_ACCEPTED).await.unwrap();

        let mut received = Vec::new();
        let _ = tokio::time::timeout(WAIT, socket.read_to_end(&mut received)).await;
        received
    });

    (port, handle)
}

fn broker_config(port: u16) -> ClientConfig {
    let mut config = ClientConfig::new("127.0.0.1", port);
    config.max_retries = Some(1);
    config.connect_timeout_seconds = 5;
    config
}

#[tokio::test]
async fn test_disconnect_reaches_broker_once_polled() {
    let (port, broker) = start_broker().await;
    let connector = RumqttcConnector::new(&broker_config(port)).unwrap();
    let (link, mut events) = connector.open().unwrap();

    let connected = tokio::time::timeout(WAIT, async {
        loop {
            if events.poll().await.unwrap() == TransportEvent::Connected {
                return;
            }
        }
    })
    .await;
    assert!(connected.is_ok(), "no CONNACK");

    link.disconnect().await.unwrap();
    let flushed = tokio::time::timeout(WAIT, async {
        loop {
            match events.poll().await {
                Ok(TransportEvent::DisconnectSent) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    assert_eq!(flushed.ok(), Some(true));

    drop(events);
    drop(link);
    let received = broker.await.unwrap();
    assert!(received.ends_with(&DISCONNECT), "received {received:02x?}");
}

#[tokio::test]
async fn test_end_sends_disconnect_to_broker() {
    let (port, broker) = start_broker().await;
    let mut client = MqttClient::new(broker_config(port), vec!["a/b".to_string()]).unwrap();

    client.launch().await.unwrap();
    assert!(client.is_connected());
    client.end().await;

    let received = broker.await.unwrap();
    assert!(received.ends_with(&DISCONNECT), "received {received:02x?}");
}
