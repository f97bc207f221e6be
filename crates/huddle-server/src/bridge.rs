//! Backend bridge pool: one persistent outbound connection per room.
//!
//! Each room gets a slot guarded by an async mutex. A request locks the slot,
//! connects if nothing is cached, sends one frame and waits for exactly one
//! reply. Holding the lock for the whole exchange serializes requests within a
//! room (tokio's mutex is FIFO) while different rooms proceed independently.
//! A transport failure, timeout or malformed reply drops the cached bridge so
//! the next request starts from a fresh connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use huddle_settings::BackendSettings;
use huddle_telemetry::metrics::{
    BACKEND_CONNECTS_TOTAL, BACKEND_ERRORS_TOTAL, BACKEND_REQUEST_DURATION_SECONDS,
    BACKEND_REQUESTS_TOTAL,
};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{BackendReply, BackendRequest};

/// Backend exchange failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Could not open a connection to the backend.
    #[error("backend connect failed: {0}")]
    Connect(String),
    /// Opening the connection took too long.
    #[error("backend connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// No reply within the request timeout.
    #[error("backend reply timed out after {0:?}")]
    Timeout(Duration),
    /// Writing the request failed.
    #[error("backend send failed: {0}")]
    Send(String),
    /// Reading the reply failed.
    #[error("backend receive failed: {0}")]
    Receive(String),
    /// The backend closed the connection.
    #[error("backend closed the connection")]
    Closed,
    /// The reply was not the expected JSON shape.
    #[error("malformed backend reply: {0}")]
    Malformed(String),
    /// The backend answered with an explicit error.
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BridgeError {
    /// Short classification used as a log field and metrics label.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Timeout(_) => "timeout",
            Self::Send(_) => "send",
            Self::Receive(_) => "receive",
            Self::Closed => "closed",
            Self::Malformed(_) => "malformed",
            Self::Rejected(_) => "rejected",
        }
    }

    /// Whether the cached bridge can no longer be trusted.
    ///
    /// A rejection is a well-formed reply, so the connection is still in sync.
    pub fn invalidates_bridge(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// One open connection to the backend.
#[async_trait]
pub trait BackendChannel: Send {
    /// Write one text frame.
    async fn send(&mut self, text: String) -> Result<(), BridgeError>;

    /// Read the next text frame.
    async fn recv(&mut self) -> Result<String, BridgeError>;
}

/// Opens backend connections.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn BackendChannel>, BridgeError>;
}

/// Connector for a WebSocket backend at a fixed URL.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BackendConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn BackendChannel>, BridgeError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl BackendChannel for WsChannel {
    async fn send(&mut self, text: String) -> Result<(), BridgeError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<String, BridgeError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec())
                        .map_err(|e| BridgeError::Malformed(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(BridgeError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BridgeError::Receive(e.to_string())),
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    channel: Option<Box<dyn BackendChannel>>,
    retired: bool,
}

/// Per-room cache of backend connections.
pub struct BridgePool {
    connector: Arc<dyn BackendConnector>,
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl BridgePool {
    /// Create a pool with explicit timeouts.
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            connect_timeout,
            request_timeout,
        }
    }

    /// Create a pool using the configured timeouts.
    pub fn from_settings(connector: Arc<dyn BackendConnector>, settings: &BackendSettings) -> Self {
        Self::new(
            connector,
            settings.connect_timeout(),
            settings.request_timeout(),
        )
    }

    /// Send `request` over the room's bridge and wait for its reply.
    ///
    /// Requests for the same room are handled strictly one at a time in
    /// arrival order. There is no retry: a failed call leaves the room without
    /// a bridge and the next call connects again.
    pub async fn request(
        &self,
        room_id: &str,
        request: &BackendRequest,
    ) -> Result<BackendReply, BridgeError> {
        let mut slot = loop {
            let slot = self.slot(room_id);
            let guard = slot.lock_owned().await;
            // A discarded slot may still be locked by callers that cloned it
            // before removal; they move on to the replacement.
            if !guard.retired {
                break guard;
            }
        };

        counter!(BACKEND_REQUESTS_TOTAL, "kind" => request.kind()).increment(1);
        let started = Instant::now();
        let result = self.exchange(&mut slot, room_id, request).await;
        histogram!(BACKEND_REQUEST_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => debug!(room_id, kind = request.kind(), "backend request completed"),
            Err(e) => {
                counter!(BACKEND_ERRORS_TOTAL, "error_type" => e.error_kind()).increment(1);
                warn!(
                    room_id,
                    kind = request.kind(),
                    error_type = e.error_kind(),
                    error = %e,
                    "backend request failed"
                );
                if e.invalidates_bridge() && slot.channel.take().is_some() {
                    info!(room_id, "discarded backend bridge");
                }
            }
        }
        result
    }

    async fn exchange(
        &self,
        slot: &mut Slot,
        room_id: &str,
        request: &BackendRequest,
    ) -> Result<BackendReply, BridgeError> {
        let body = serde_json::to_string(request).map_err(|e| BridgeError::Send(e.to_string()))?;

        let channel = match slot.channel.take() {
            Some(channel) => channel,
            None => self.connect(room_id).await?,
        };
        let channel = slot.channel.insert(channel);

        let raw = tokio::time::timeout(self.request_timeout, async {
            channel.send(body).await?;
            channel.recv().await
        })
        .await
        .map_err(|_| BridgeError::Timeout(self.request_timeout))??;

        parse_reply(&raw, request)
    }

    async fn connect(&self, room_id: &str) -> Result<Box<dyn BackendChannel>, BridgeError> {
        let channel = tokio::time::timeout(self.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| BridgeError::ConnectTimeout(self.connect_timeout))??;
        counter!(BACKEND_CONNECTS_TOTAL).increment(1);
        info!(room_id, "backend bridge connected");
        Ok(channel)
    }

    fn slot(&self, room_id: &str) -> Arc<Mutex<Slot>> {
        Arc::clone(self.slots.entry(room_id.to_string()).or_default().value())
    }

    /// Close and forget the room's bridge, waiting for any in-flight request.
    pub async fn discard(&self, room_id: &str) -> bool {
        let Some(slot) = self.slots.get(room_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut guard = slot.lock().await;
        guard.retired = true;
        let had_channel = guard.channel.take().is_some();
        let _ = self
            .slots
            .remove_if(room_id, |_, current| Arc::ptr_eq(current, &slot));
        debug!(room_id, had_channel, "backend bridge slot discarded");
        had_channel
    }

    /// Number of rooms with an open (or opening) bridge.
    pub fn bridge_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| match entry.value().try_lock() {
                Ok(slot) => slot.channel.is_some(),
                Err(_) => true,
            })
            .count()
    }
}

fn parse_reply(raw: &str, request: &BackendRequest) -> Result<BackendReply, BridgeError> {
    let reply: BackendReply =
        serde_json::from_str(raw).map_err(|e| BridgeError::Malformed(e.to_string()))?;
    if reply.kind == "error" {
        return Err(BridgeError::Rejected(
            reply
                .message
                .unwrap_or_else(|| "backend error".to_string()),
        ));
    }
    if reply.kind != request.expected_reply() {
        return Err(BridgeError::Malformed(format!(
            "expected {} reply, got {}",
            request.expected_reply(),
            reply.kind
        )));
    }
    if reply.kind == "bot_response" && reply.text.is_none() {
        return Err(BridgeError::Malformed(
            "bot_response without text".to_string(),
        ));
    }
    Ok(reply)
}
