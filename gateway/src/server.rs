//! WebSocket subscriber server
//!
//! `GET /ws/effluent` upgrades to a WebSocket after the auth gate. Each
//! connection runs two tasks:
//!
//! ```text
//!  socket ──► reader task ── rate limit / size guard ──► control / ingest
//!                 │ replies
//!                 ▼
//!  socket ◄── writer task ◄── outbound queue ◄── BroadcastHub::publish
//!                 └── heartbeat ping every interval
//! ```
//!
//! Whichever task finishes first aborts the other; the connection is then
//! deregistered and its queue discarded.
//!
//! # Client messages
//!
//! ```json
//! {"action": "subscribe", "topics": ["alert"]}
//! {"action": "unsubscribe", "topics": ["reading"]}
//! {"action": "ping"}
//! {"action": "publish", "timestamp": 12.0, "species": "As", "concentration": 0.02}
//! ```
//!
//! Replies are `{"type": "pong"}`, `{"type": "subscribed", "topics": [...]}`
//! or `{"type": "error", "reason": "..."}`.

use crate::auth::{AuthGate, TokenQuery};
use crate::error::{GatewayError, Result};
use crate::hub::{BroadcastHub, Connection, ConnectionId};
use crate::metrics::MetricsRecorder;
use crate::pipeline::ReadingSender;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use outfall_core::{PipelineError, RawRecord, Topic};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Path of the subscriber endpoint
pub const WS_PATH: &str = "/ws/effluent";

/// Replies queued by the reader before the writer picks them up
const REPLY_CAPACITY: usize = 16;

/// Drop reason for replies lost to a full reply queue
pub const REPLY_OVERFLOW: &str = "reply_overflow";

/// Drop reason for queued payloads that are not valid UTF-8
const INVALID_PAYLOAD: &str = "invalid_payload";

/// Client → server message
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { topics: Vec<Topic> },
    Unsubscribe { topics: Vec<Topic> },
    Ping,
    Publish(RawRecord),
}

/// Server → client reply to a client message
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Reply {
    Pong,
    Subscribed { topics: Vec<Topic> },
    Error { reason: String },
}

impl Reply {
    fn error(reason: &str) -> Self {
        Reply::Error {
            reason: reason.to_string(),
        }
    }

    fn into_message(self) -> Option<Message> {
        serde_json::to_string(&self)
            .ok()
            .map(|text| Message::Text(text.into()))
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    IdleTimeout,
    Transport,
    /// Queue closed by the hub (slow consumer or shutdown)
    QueueClosed,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Transport => "transport_error",
            CloseReason::QueueClosed => "queue_closed",
        }
    }
}

/// Per-connection timings
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<BroadcastHub>,
    gate: AuthGate,
    metrics: Arc<MetricsRecorder>,
    ingest: Option<ReadingSender>,
    session: SessionConfig,
}

/// WebSocket subscriber endpoint
pub struct SubscriberServer {
    state: AppState,
}

impl SubscriberServer {
    pub fn new(hub: Arc<BroadcastHub>, gate: AuthGate, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            state: AppState {
                hub,
                gate,
                metrics,
                ingest: None,
                session: SessionConfig::default(),
            },
        }
    }

    /// Accept `publish` messages and feed them into the pipeline
    pub fn ingest(mut self, sender: ReadingSender) -> Self {
        self.state.ingest = Some(sender);
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.state.session = session;
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(WS_PATH, get(ws_handler))
            .with_state(self.state)
    }

    /// Serve on a bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, path = WS_PATH, "Subscriber server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Subscriber server stopped");
        Ok(())
    }

    /// Bind and serve in a background task
    pub fn start<F>(self, addr: SocketAddr, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind subscriber server");
                    return;
                }
            };
            if let Err(e) = self.serve(listener, shutdown).await {
                error!(error = %e, "Subscriber server error");
            }
        })
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TokenQuery>,
) -> Response {
    if !state.gate.check(&headers, params.token()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let authenticated = !state.gate.is_open();
    ws.on_upgrade(move |socket| serve_connection(socket, state, authenticated))
}

async fn serve_connection(socket: WebSocket, state: AppState, authenticated: bool) {
    let connection = state.hub.register(authenticated);
    let id = connection.id();
    info!(connection = id, authenticated, "Subscriber connected");

    let (sink, stream) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);

    let mut writer = tokio::spawn(write_loop(
        sink,
        Arc::clone(&connection),
        reply_rx,
        state.session.heartbeat_interval,
        Arc::clone(&state.metrics),
    ));
    let mut reader = tokio::spawn(read_loop(
        stream,
        Arc::clone(&connection),
        reply_tx,
        state.clone(),
    ));

    let reason = tokio::select! {
        result = &mut writer => {
            reader.abort();
            result.unwrap_or(CloseReason::Transport)
        }
        result = &mut reader => {
            writer.abort();
            result.unwrap_or(CloseReason::Transport)
        }
    };

    state.hub.deregister(id);
    info!(connection = id, reason = reason.as_str(), "Subscriber disconnected");
}

/// Text frame over the shared payload, without copying it
fn text_frame(payload: Bytes) -> Option<Message> {
    Utf8Bytes::try_from(payload).ok().map(Message::Text)
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    connection: Arc<Connection>,
    mut replies: mpsc::Receiver<Message>,
    heartbeat: Duration,
    metrics: Arc<MetricsRecorder>,
) -> CloseReason {
    let mut ticker = tokio::time::interval(heartbeat);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        let message = tokio::select! {
            item = connection.queue().pop() => match item {
                Some(item) => match text_frame(item.payload) {
                    Some(frame) => frame,
                    None => {
                        metrics.record_dropped(INVALID_PAYLOAD, 1);
                        error!(connection = connection.id(), "Queued payload is not UTF-8, dropped");
                        continue;
                    }
                },
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return CloseReason::QueueClosed;
                }
            },
            Some(reply) = replies.recv() => reply,
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };
        if let Err(e) = sink.send(message).await {
            debug!(connection = connection.id(), error = %e, "Socket write failed");
            return CloseReason::Transport;
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    connection: Arc<Connection>,
    replies: mpsc::Sender<Message>,
    state: AppState,
) -> CloseReason {
    let id = connection.id();
    loop {
        let frame = match tokio::time::timeout(state.session.idle_timeout, stream.next()).await {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(e))) => {
                debug!(connection = id, error = %e, "Socket read failed");
                return CloseReason::Transport;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let reply = match frame {
            Message::Text(text) => handle_client_message(&connection, &state, text.as_str().as_bytes()).await,
            Message::Binary(data) => handle_client_message(&connection, &state, &data).await,
            Message::Close(_) => return CloseReason::ClientClosed,
            Message::Ping(_) | Message::Pong(_) => None,
        };

        if let Some(message) = reply.and_then(Reply::into_message) {
            queue_reply(&replies, message, &state.metrics, id);
        }
    }
}

/// Hand a reply to the writer without waiting; a backed-up writer loses it
fn queue_reply(
    replies: &mpsc::Sender<Message>,
    message: Message,
    metrics: &MetricsRecorder,
    connection: ConnectionId,
) -> bool {
    match replies.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics.record_dropped(REPLY_OVERFLOW, 1);
            debug!(connection, "Reply queue full, reply dropped");
            false
        }
        // Writer already gone; the connection is closing
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn handle_client_message(
    connection: &Connection,
    state: &AppState,
    data: &[u8],
) -> Option<Reply> {
    if let Err(e) = connection.admit(data.len()) {
        match &e {
            PipelineError::RateLimitExceeded => state.metrics.rate_limited.inc(),
            PipelineError::MessageTooLarge { .. } => state.metrics.record_too_large("inbound"),
            _ => {}
        }
        debug!(connection = connection.id(), reason = e.reason(), "Client message refused");
        return Some(Reply::error(e.reason()));
    }

    let message = match serde_json::from_slice::<ClientMessage>(data) {
        Ok(message) => message,
        Err(e) => {
            state.metrics.invalid_control.inc();
            debug!(connection = connection.id(), error = %e, "Invalid client message");
            return Some(Reply::error("invalid_control"));
        }
    };

    match message {
        ClientMessage::Subscribe { topics } => {
            connection.subscribe(&topics);
            Some(Reply::Subscribed {
                topics: connection.topics(),
            })
        }
        ClientMessage::Unsubscribe { topics } => {
            connection.unsubscribe(&topics);
            Some(Reply::Subscribed {
                topics: connection.topics(),
            })
        }
        ClientMessage::Ping => Some(Reply::Pong),
        ClientMessage::Publish(record) => {
            let Some(sender) = &state.ingest else {
                return Some(Reply::error("ingest_disabled"));
            };
            match sender.push_record(record).await {
                Ok(()) => None,
                Err(e) => {
                    debug!(connection = connection.id(), error = %e, "Published record refused");
                    Some(Reply::error(match &e {
                        GatewayError::Pipeline(p) => p.reason(),
                        _ => "closed",
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;

    #[test]
    fn test_client_message_parsing() {
        let sub: ClientMessage =
            serde_json::from_str(r#"{"action":"subscribe","topics":["alerts","reading"]}"#)
                .unwrap();
        assert!(matches!(
            sub,
            ClientMessage::Subscribe { ref topics } if topics == &[Topic::Alert, Topic::Reading]
        ));

        let ping: ClientMessage = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let publish: ClientMessage = serde_json::from_str(
            r#"{"action":"publish","time":1.0,"species":"As","value":0.02}"#,
        )
        .unwrap();
        assert!(matches!(publish, ClientMessage::Publish(_)));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_reply_shapes() {
        let pong = serde_json::to_value(Reply::Pong).unwrap();
        assert_eq!(pong, serde_json::json!({"type": "pong"}));

        let err = serde_json::to_value(Reply::error("rate_limited")).unwrap();
        assert_eq!(
            err,
            serde_json::json!({"type": "error", "reason": "rate_limited"})
        );

        let subscribed = serde_json::to_value(Reply::Subscribed {
            topics: vec![Topic::Alert],
        })
        .unwrap();
        assert_eq!(
            subscribed,
            serde_json::json!({"type": "subscribed", "topics": ["alert"]})
        );
    }

    #[test]
    fn test_full_reply_queue_is_counted() {
        let metrics = MetricsRecorder::new().unwrap();
        let (tx, mut rx) = mpsc::channel(1);

        let pong = || Reply::Pong.into_message().unwrap();
        assert!(queue_reply(&tx, pong(), &metrics, 1));
        assert!(!queue_reply(&tx, pong(), &metrics, 1));
        assert!(!queue_reply(&tx, pong(), &metrics, 1));
        assert_eq!(
            MetricsSnapshot::count(&metrics.snapshot().messages_dropped, REPLY_OVERFLOW),
            2
        );

        // A closed writer is not an overflow
        rx.close();
        assert!(!queue_reply(&tx, pong(), &metrics, 1));
        assert_eq!(
            MetricsSnapshot::count(&metrics.snapshot().messages_dropped, REPLY_OVERFLOW),
            2
        );
    }

    #[test]
    fn test_text_frame_shares_payload() {
        let payload = Bytes::from_static(br#"{"type":"reading"}"#);
        let Some(Message::Text(text)) = text_frame(payload.clone()) else {
            panic!("expected a text frame");
        };
        assert_eq!(text.as_str(), r#"{"type":"reading"}"#);
        assert_eq!(text.as_str().as_ptr(), payload.as_ptr());

        assert!(text_frame(Bytes::from_static(&[0xff, 0xfe])).is_none());
    }

    #[test]
    fn test_close_reason_labels() {
        assert_eq!(CloseReason::IdleTimeout.as_str(), "idle_timeout");
        assert_eq!(CloseReason::QueueClosed.as_str(), "queue_closed");
    }
}
