//! Persistent channel against a fake control plane built on tokio-tungstenite.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use ghosts_agent::comms::{
    Connection, ConnectionSettings, MachineIdentity, NullSink, QueueEntry, delivery_queue,
};
use ghosts_agent::handlers::HandlerRegistry;
use ghosts_agent::scheduler::{Orchestrator, SchedulerSettings};
use ghosts_agent::timeline::TimelineRecord;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn orchestrator(dir: &Path) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        SchedulerSettings {
            timeline_path: dir.join("timeline.json"),
            stop_grace: Duration::from_secs(2),
            reload_settle: Duration::from_millis(10),
        },
        Arc::new(HandlerRegistry::with_builtins()),
        Arc::new(NullSink),
    ))
}

fn settings(port: u16) -> ConnectionSettings {
    ConnectionSettings {
        url: format!("ws://127.0.0.1:{port}/clientHub"),
        heartbeat: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(50),
    }
}

fn record(trackable_id: &str) -> TimelineRecord {
    TimelineRecord {
        handler: "Command".into(),
        command: "echo hi".into(),
        command_arg: String::new(),
        trackable_id: trackable_id.into(),
        result: "hi".into(),
    }
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from agent"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn queued_results_are_delivered_in_order() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (sender, receiver) = delivery_queue();
        sender.enqueue(QueueEntry::results(&record("first")));
        sender.enqueue(QueueEntry::results(&record("second")));

        let identity = Arc::new(MachineIdentity::detect(dir.path().join("id.json")));
        let connection = Arc::new(Connection::new(
            settings(port),
            identity,
            orchestrator(dir.path()),
        ));
        let shutdown = CancellationToken::new();
        let worker = connection.clone().spawn(receiver, shutdown.clone());

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let frame = parse_ws_json(&ws.next().await.unwrap().unwrap());
            if frame["method"] == "SendResults" {
                seen.push(frame["payload"]["TrackableId"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(seen, vec!["first", "second"]);
        assert!(connection.is_connected());

        shutdown.cancel();
        worker.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn entries_survive_a_failed_connection() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (sender, receiver) = delivery_queue();
        let identity = Arc::new(MachineIdentity::detect(dir.path().join("id.json")));
        let connection = Arc::new(Connection::new(
            settings(port),
            identity,
            orchestrator(dir.path()),
        ));
        let shutdown = CancellationToken::new();
        let worker = connection.spawn(receiver, shutdown.clone());

        // First attempt: drop the socket before the handshake.
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        sender.enqueue(QueueEntry::message("queued while offline"));

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let frame = loop {
            let frame = parse_ws_json(&ws.next().await.unwrap().unwrap());
            if frame["method"] != "SendHeartbeat" {
                break frame;
            }
        };
        assert_eq!(frame["method"], "SendMessage");
        assert_eq!(frame["payload"], "queued while offline");

        shutdown.cancel();
        worker.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn receive_id_is_persisted() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let id_file = dir.path().join("id.json");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (_sender, receiver) = delivery_queue();
        let identity = Arc::new(MachineIdentity::detect(id_file.clone()));
        let connection = Arc::new(Connection::new(
            settings(port),
            identity.clone(),
            orchestrator(dir.path()),
        ));
        let shutdown = CancellationToken::new();
        let worker = connection.spawn(receiver, shutdown.clone());

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::text(r#"{"method":"ReceiveId","payload":"agent-42"}"#))
            .await
            .unwrap();

        while identity.id().as_deref() != Some("agent-42") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(std::fs::read_to_string(&id_file).unwrap().contains("agent-42"));

        shutdown.cancel();
        worker.await.unwrap();
    })
    .await
    .expect("test timed out");
}
