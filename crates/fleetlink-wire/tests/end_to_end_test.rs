//! End-to-end scenario over the process-injection transport.
//!
//! A small shell script stands in for the game engine: it prints a join line
//! on start and answers `list` the way a vanilla server does.

#![cfg(unix)]

use fleetlink_types::config::{PeerConfig, ReconnectConfig, SubscriptionConfig, TransportConfig};
use fleetlink_types::message::{ops, MessageType};
use fleetlink_wire::bridge::{Bridge, ConnectionStatus};
use fleetlink_wire::TokioScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const ENGINE: &str = r#"
echo "[12:00:00] [Server thread/INFO]: Steve joined the game"
while read line; do
  case "$line" in
    list) echo "[12:00:02] [Server thread/INFO]: There are 0 of a max of 20 players online" ;;
    stop) echo "[12:00:09] [Server thread/INFO]: Stopping the server"; exit 0 ;;
  esac
done
"#;

fn peer() -> PeerConfig {
    PeerConfig {
        server_id: "survival-1".into(),
        name: String::new(),
        enabled: true,
        transport: TransportConfig::Process {
            command: "sh".into(),
            args: vec!["-c".into(), ENGINE.into()],
            working_dir: None,
            stop_command: "stop".into(),
            settle_ms: 300,
            shutdown_grace_ms: 5_000,
        },
        subscriptions: vec![SubscriptionConfig {
            op: ops::PLAYER_JOIN.into(),
            filter: None,
        }],
    }
}

#[tokio::test]
async fn test_join_event_then_list_command() {
    let (sink, mut forwarded) = mpsc::unbounded_channel();
    let bridge = Bridge::from_peer_config(
        &peer(),
        "fleetlink-hub",
        ReconnectConfig::default(),
        Duration::from_secs(10),
        Arc::new(TokioScheduler),
        sink,
    );
    assert_eq!(bridge.name(), "survival-1");
    assert_eq!(bridge.connect().await, ConnectionStatus::Connected);

    let ev = tokio::time::timeout(Duration::from_secs(5), forwarded.recv())
        .await
        .expect("join event within 5s")
        .expect("sink open");
    assert_eq!(ev.server_id, "survival-1");
    assert_eq!(ev.message.kind, MessageType::Event);
    assert_eq!(ev.message.op, ops::PLAYER_JOIN);
    assert_eq!(ev.message.data["name"], "Steve");

    let result = bridge.execute_command("list", None).await.unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(
        result.output,
        vec!["There are 0 of a max of 20 players online"]
    );

    // Exactly one forwarded event.
    assert!(forwarded.try_recv().is_err());

    bridge.shutdown().await;
    assert_eq!(bridge.connection_status(), ConnectionStatus::Disconnected);
    assert!(!bridge.reconnect().status().is_reconnecting);
}

#[tokio::test]
async fn test_unsubscribed_join_is_not_forwarded() {
    let mut config = peer();
    config.subscriptions.clear();
    let (sink, mut forwarded) = mpsc::unbounded_channel();
    let bridge = Bridge::from_peer_config(
        &config,
        "fleetlink-hub",
        ReconnectConfig::default(),
        Duration::from_secs(10),
        Arc::new(TokioScheduler),
        sink,
    );
    bridge.connect().await;

    // The command's settle window guarantees the join line has been read.
    let result = bridge.execute_command("list", None).await.unwrap();
    assert!(result.success);
    assert!(forwarded.try_recv().is_err());

    bridge.shutdown().await;
}
