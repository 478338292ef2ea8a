//! Persistent push channel to the control plane.
//!
//! One worker owns the delivery queue's consumer side. It connects (retrying
//! forever), then runs a heartbeat timer and the dequeue-and-dispatch loop
//! side by side while reading inbound messages. On disconnect it reconnects;
//! entries keep piling up in the queue meanwhile, and an entry whose send
//! failed is retried first on the next session.
//!
//! Frames are JSON text: `{"method": "SendResults", "payload": ...}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::comms::identity::MachineIdentity;
use crate::comms::queue::{QueueEntry, QueueReceiver};
use crate::comms::updates::run_timeline_partial;
use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::scheduler::Orchestrator;
use crate::timeline::working_hours::sleep_or_cancel;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ChannelMessage {
    pub fn from_entry(entry: &QueueEntry) -> Self {
        Self {
            method: entry.entry_type.method().to_string(),
            payload: entry.payload.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            url: config.urls().socket,
            heartbeat: config.sockets.heartbeat_interval(),
            reconnect_delay: config.sockets.reconnect_interval(),
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    QueueClosed,
    Disconnected(TransportError),
}

/// The channel worker.
pub struct Connection {
    settings: ConnectionSettings,
    identity: Arc<MachineIdentity>,
    orchestrator: Arc<Orchestrator>,
    connected: AtomicBool,
}

impl Connection {
    pub fn new(
        settings: ConnectionSettings,
        identity: Arc<MachineIdentity>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            settings,
            identity,
            orchestrator,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Spawn the worker.
    pub fn spawn(
        self: Arc<Self>,
        queue: QueueReceiver,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(queue, shutdown).await })
    }

    /// Connect, serve, reconnect, until shutdown or until every producer is gone.
    pub async fn run(&self, mut queue: QueueReceiver, shutdown: CancellationToken) {
        let mut pending: Option<QueueEntry> = None;

        loop {
            let ws = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            let ws = match ws {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::warn!("Connection attempt failed: {}", e);
                    if !sleep_or_cancel(self.settings.reconnect_delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.connected.store(true, Ordering::SeqCst);
            tracing::info!(url = %self.settings.url, "Connected to control plane");
            let end = self.session(ws, &mut queue, &mut pending, &shutdown).await;
            self.connected.store(false, Ordering::SeqCst);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::QueueClosed => {
                    tracing::info!("Delivery queue closed, connection worker exiting");
                    break;
                }
                SessionEnd::Disconnected(e) => {
                    tracing::warn!("Connection lost, reconnecting: {}", e);
                    if !sleep_or_cancel(self.settings.reconnect_delay, &shutdown).await {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Connection worker stopped");
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        let connect_failed = |reason: String| TransportError::ConnectFailed {
            url: self.settings.url.clone(),
            reason,
        };

        let mut request = self
            .settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_failed(e.to_string()))?;
        for (key, value) in self.identity.header_pairs() {
            if let Ok(value) = HeaderValue::from_str(&value) {
                request.headers_mut().insert(HeaderName::from_static(key), value);
            }
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_failed(e.to_string()))?;
        Ok(ws)
    }

    async fn session(
        &self,
        ws: WsStream,
        queue: &mut QueueReceiver,
        pending: &mut Option<QueueEntry>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat);
        // Skip immediate first tick
        heartbeat.tick().await;

        loop {
            if let Some(entry) = pending.take() {
                if let Err(e) = send(&mut sink, &ChannelMessage::from_entry(&entry)).await {
                    *pending = Some(entry);
                    return SessionEnd::Disconnected(e);
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    let beat = ChannelMessage::from_entry(&QueueEntry::heartbeat());
                    if let Err(e) = send(&mut sink, &beat).await {
                        return SessionEnd::Disconnected(e);
                    }
                }
                entry = queue.dequeue() => match entry {
                    Some(entry) => {
                        tracing::debug!(entry_type = ?entry.entry_type, "Dispatching queued entry");
                        *pending = Some(entry);
                    }
                    None => return SessionEnd::QueueClosed,
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(&text).await,
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Disconnected(TransportError::Disconnected {
                            reason: format!("closed by server: {:?}", frame),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SessionEnd::Disconnected(TransportError::Disconnected {
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        return SessionEnd::Disconnected(TransportError::Disconnected {
                            reason: "stream ended".to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Act on one inbound frame. Problems are logged, never fatal.
    async fn handle_inbound(&self, text: &str) {
        let message: ChannelMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Invalid inbound frame: {}", e);
                return;
            }
        };

        match message.method.as_str() {
            "ReceiveHeartbeat" => {
                tracing::debug!(payload = %message.payload, "Heartbeat acknowledged")
            }
            "ReceiveMessage" | "ReceiveSpecificMessage" => {
                tracing::info!(
                    method = %message.method,
                    payload = %message.payload,
                    "Message from control plane"
                );
            }
            "ReceiveId" => {
                let id = match &message.payload {
                    serde_json::Value::String(id) => id.clone(),
                    other => other.to_string(),
                };
                if let Err(e) = self.identity.set_id(&id) {
                    tracing::warn!("Failed to store client id: {}", e);
                }
            }
            "ReceiveUpdate" => {
                match run_timeline_partial(&self.orchestrator, &message.payload).await {
                    Ok(launched) => tracing::info!(launched, "Pushed update launched"),
                    Err(e) => tracing::warn!("Pushed update rejected: {}", e),
                }
            }
            other => tracing::debug!(method = %other, "Ignoring inbound method"),
        }
    }
}

async fn send<S>(sink: &mut S, message: &ChannelMessage) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let body = serde_json::to_string(message)?;
    sink.send(Message::text(body))
        .await
        .map_err(|e| TransportError::SendFailed {
            method: message.method.clone(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::queue::QueueEntryType;

    #[test]
    fn entry_maps_to_method() {
        let entry = QueueEntry::new(QueueEntryType::Survey, serde_json::json!({"a": 1}));
        let message = ChannelMessage::from_entry(&entry);
        assert_eq!(message.method, "SendSurvey");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["payload"]["a"], 1);
    }

    #[test]
    fn inbound_frame_without_payload() {
        let message: ChannelMessage =
            serde_json::from_str(r#"{"method": "ReceiveHeartbeat"}"#).unwrap();
        assert_eq!(message.payload, serde_json::Value::Null);
    }
}
