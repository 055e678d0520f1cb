//! Websocket front end speaking JSON frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hub::CircuitHub;
use crate::metrics;
use crate::transport::{ChannelHandle, ClientChannel, ConnectionToken, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Start,
    Connect {
        token: String,
    },
    Resume {
        token: String,
    },
    Ack {
        batch_id: u64,
        #[serde(default)]
        error: Option<String>,
    },
    BeginUpload {
        total_length: u64,
    },
    Chunk {
        stream_id: u64,
        seq: u64,
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Pause,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Circuit { token: String },
    Rejected,
    Batch { batch_id: u64, payload: String },
    Upload { stream_id: u64 },
    ChunkRejected { stream_id: u64, seq: u64 },
    Paused,
    Error { message: String },
}

/// Outbound half of one websocket connection.
struct WsChannel {
    connection: ConnectionToken,
    tx: mpsc::UnboundedSender<HostFrame>,
}

#[async_trait]
impl ClientChannel for WsChannel {
    fn connection(&self) -> ConnectionToken {
        self.connection
    }

    async fn send_batch(&self, batch_id: u64, payload: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(HostFrame::Batch {
                batch_id,
                payload: STANDARD.encode(&payload),
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn send_error(&self, message: &str) -> Result<(), TransportError> {
        self.tx
            .send(HostFrame::Error {
                message: message.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

pub fn router(hub: CircuitHub) -> Router {
    Router::new()
        .route("/circuit", get(circuit_socket))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(hub)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_text() -> String {
    metrics::gather_text()
}

async fn circuit_socket(ws: WebSocketUpgrade, State(hub): State<CircuitHub>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(hub, socket))
}

async fn serve_connection(hub: CircuitHub, socket: WebSocket) {
    let connection = ConnectionToken::new();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<HostFrame>();
    let channel: ChannelHandle = Arc::new(WsChannel {
        connection,
        tx: tx.clone(),
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });
    debug!(
        target = "circuit_host::server",
        connection = %connection,
        "websocket connected"
    );

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(
                    target = "circuit_host::server",
                    connection = %connection,
                    error = %err,
                    "websocket read failed"
                );
                break;
            }
        };
        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => {
                if let Some(reply) = handle_frame(&hub, &channel, frame).await {
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Err(err) => warn!(
                target = "circuit_host::server",
                connection = %connection,
                error = %err,
                "ignoring malformed frame"
            ),
        }
    }

    hub.connection_closed(connection).await;
    writer.abort();
    debug!(
        target = "circuit_host::server",
        connection = %connection,
        "websocket closed"
    );
}

async fn handle_frame(hub: &CircuitHub, channel: &ChannelHandle, frame: ClientFrame) -> Option<HostFrame> {
    let connection = channel.connection();
    match frame {
        ClientFrame::Start => Some(match hub.start_circuit(Arc::clone(channel)).await {
            Ok(circuit) => HostFrame::Circuit {
                token: circuit.id().token().to_string(),
            },
            Err(err) => HostFrame::Error {
                message: err.to_string(),
            },
        }),
        ClientFrame::Connect { token } => {
            Some(match hub.connect_circuit(&token, Arc::clone(channel)).await {
                Some(circuit) => HostFrame::Circuit {
                    token: circuit.id().token().to_string(),
                },
                None => HostFrame::Rejected,
            })
        }
        ClientFrame::Resume { token } => {
            Some(match hub.resume_circuit(&token, Arc::clone(channel)).await {
                Some(circuit) => HostFrame::Circuit {
                    token: circuit.id().token().to_string(),
                },
                None => HostFrame::Rejected,
            })
        }
        ClientFrame::Ack { batch_id, error } => {
            if let Err(err) = hub.on_render_completed(connection, batch_id, error) {
                debug!(
                    target = "circuit_host::server",
                    connection = %connection,
                    batch_id,
                    error = %err,
                    "acknowledgement not applied"
                );
            }
            None
        }
        ClientFrame::BeginUpload { total_length } => {
            match hub.begin_upload(connection, total_length) {
                Ok((stream_id, mut reader)) => {
                    tokio::spawn(async move {
                        match reader.read_to_end().await {
                            Ok(bytes) => info!(
                                target = "circuit_host::server",
                                stream_id,
                                len = bytes.len(),
                                "upload received"
                            ),
                            Err(err) => debug!(
                                target = "circuit_host::server",
                                stream_id,
                                error = %err,
                                "upload abandoned"
                            ),
                        }
                    });
                    Some(HostFrame::Upload { stream_id })
                }
                Err(err) => Some(HostFrame::Error {
                    message: err.to_string(),
                }),
            }
        }
        ClientFrame::Chunk {
            stream_id,
            seq,
            data,
            error,
        } => {
            let (bytes, error) = match data.map(|data| STANDARD.decode(data)) {
                Some(Ok(bytes)) => (Some(Bytes::from(bytes)), error),
                Some(Err(_)) => (None, error.or_else(|| Some("chunk is not valid base64".into()))),
                None => (None, error),
            };
            if hub.receive_chunk(connection, stream_id, seq, bytes, error) {
                None
            } else {
                Some(HostFrame::ChunkRejected { stream_id, seq })
            }
        }
        ClientFrame::Pause => Some(match hub.pause_circuit(connection).await {
            Ok(()) => HostFrame::Paused,
            Err(err) => HostFrame::Error {
                message: err.to_string(),
            },
        }),
        ClientFrame::End => {
            hub.end_circuit(connection).await;
            None
        }
    }
}

/// Renders a heartbeat batch into every connected circuit on `interval`.
pub fn spawn_heartbeat(hub: CircuitHub, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut beat: u64 = 0;
        loop {
            ticker.tick().await;
            beat += 1;
            let rendered = hub
                .render_all(Bytes::from(format!("heartbeat {beat}")))
                .await;
            debug!(
                target = "circuit_host::server",
                beat, rendered, "heartbeat rendered"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitOptions;
    use crate::transport::mock::RecordingChannel;

    fn ws_channel() -> (ChannelHandle, mpsc::UnboundedReceiver<HostFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel: ChannelHandle = Arc::new(WsChannel {
            connection: ConnectionToken::new(),
            tx,
        });
        (channel, rx)
    }

    #[test_timeout::timeout(5)]
    fn client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"ack","batch_id":4}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Ack {
                batch_id: 4,
                error: None
            }
        );
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"chunk","stream_id":1,"seq":0,"data":"aGk="}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Chunk { data: Some(_), .. }));
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"begin_upload","total_length":9}"#).unwrap();
        assert_eq!(frame, ClientFrame::BeginUpload { total_length: 9 });
    }

    #[test_timeout::timeout(5)]
    fn host_frames_are_tagged() {
        let json = serde_json::to_string(&HostFrame::ChunkRejected {
            stream_id: 2,
            seq: 3,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"chunk_rejected","stream_id":2,"seq":3}"#);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn ws_channel_reports_closed_once_reader_is_gone() {
        let (channel, rx) = ws_channel();
        drop(rx);
        let err = channel
            .send_batch(1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_unusable());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn start_then_upload_over_frames() {
        let hub = CircuitHub::builder(CircuitOptions::default()).build();
        let (channel, mut rx) = ws_channel();

        let reply = handle_frame(&hub, &channel, ClientFrame::Start).await;
        assert!(matches!(reply, Some(HostFrame::Circuit { .. })));

        let reply = handle_frame(&hub, &channel, ClientFrame::BeginUpload { total_length: 2 }).await;
        let Some(HostFrame::Upload { stream_id }) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        let reply = handle_frame(
            &hub,
            &channel,
            ClientFrame::Chunk {
                stream_id,
                seq: 0,
                data: Some(STANDARD.encode(b"hi")),
                error: None,
            },
        )
        .await;
        assert_eq!(reply, None);

        let reply = handle_frame(
            &hub,
            &channel,
            ClientFrame::Chunk {
                stream_id,
                seq: 1,
                data: Some(STANDARD.encode(b"!")),
                error: None,
            },
        )
        .await;
        assert_eq!(reply, Some(HostFrame::ChunkRejected { stream_id, seq: 1 }));

        hub.render_all(Bytes::from_static(b"frame")).await;
        assert_eq!(
            rx.recv().await,
            Some(HostFrame::Batch {
                batch_id: 1,
                payload: STANDARD.encode(b"frame")
            })
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn oversized_upload_is_refused_without_ending_the_circuit() {
        let hub = CircuitHub::builder(CircuitOptions::default()).build();
        let (channel, _rx) = ws_channel();
        handle_frame(&hub, &channel, ClientFrame::Start).await;

        let reply = handle_frame(
            &hub,
            &channel,
            ClientFrame::BeginUpload {
                total_length: u64::MAX,
            },
        )
        .await;
        let Some(HostFrame::Error { message }) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert!(message.contains("exceeds the permitted"), "{message}");

        let circuit = hub.circuit_for(channel.connection()).unwrap();
        assert!(!circuit.is_disposed());
        let reply = handle_frame(&hub, &channel, ClientFrame::BeginUpload { total_length: 4 }).await;
        assert!(matches!(reply, Some(HostFrame::Upload { .. })));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn heartbeat_renders_into_connected_circuits() {
        let hub = CircuitHub::builder(CircuitOptions::default()).build();
        let channel = RecordingChannel::new();
        hub.start_circuit(channel.clone()).await.unwrap();

        let heartbeat = spawn_heartbeat(hub.clone(), Duration::from_millis(10));
        channel.wait_for_batches(2).await;
        heartbeat.abort();

        let batches = channel.batches();
        assert_eq!(batches[0], (1, Bytes::from_static(b"heartbeat 1")));
        assert_eq!(batches[1], (2, Bytes::from_static(b"heartbeat 2")));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn unknown_token_is_rejected() {
        let hub = CircuitHub::builder(CircuitOptions::default()).build();
        let (channel, _rx) = ws_channel();
        let reply = handle_frame(
            &hub,
            &channel,
            ClientFrame::Connect {
                token: "nope".into(),
            },
        )
        .await;
        assert_eq!(reply, Some(HostFrame::Rejected));
    }
}
