//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use huddle_settings::HuddleSettings;
use huddle_telemetry::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use metrics::{counter, gauge};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, instrument, warn};

use crate::bridge::BridgePool;
use crate::protocol::OutboundFrame;
use crate::registry::{ClientHandle, ConnectionRegistry};
use crate::rooms::RoomIndex;
use crate::router::{ClientContext, Router};

/// Data frames read ahead of the dispatcher before the reader waits.
const INBOUND_QUEUE: usize = 32;

/// Everything a session needs, shared by all connections.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
    bridges: Arc<BridgePool>,
    router: Router,
    heartbeat_interval: Duration,
    reap_empty_rooms: bool,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Wire a gateway over the shared structures.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomIndex>,
        bridges: Arc<BridgePool>,
        settings: &HuddleSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            Arc::clone(&bridges),
        );
        Self {
            registry,
            rooms,
            bridges,
            router,
            heartbeat_interval: settings.server.heartbeat_interval(),
            reap_empty_rooms: settings.rooms.reap_empty,
            shutdown,
        }
    }

    /// The shared connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The shared room index.
    pub fn rooms(&self) -> &Arc<RoomIndex> {
        &self.rooms
    }

    /// The shared bridge pool.
    pub fn bridges(&self) -> &Arc<BridgePool> {
        &self.bridges
    }

    /// Run a session for an upgraded socket until the client goes away.
    ///
    /// 1. Registers the client and joins its room
    /// 2. Announces `user_joined` to the rest of the room
    /// 3. Dispatches inbound frames one at a time, while a separate reader
    ///    keeps the heartbeat alive
    /// 4. Drains the client's queue and pings it from a writer task
    /// 5. Cleans up however the session ends
    #[instrument(skip_all, fields(client_id = %client_id, room_id = %room_id))]
    pub async fn run_session(&self, socket: WebSocket, client_id: String, room_id: String) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (tx, mut rx) = self.registry.channel();
        let handle = self.registry.register(&client_id, &room_id, tx);
        let _ = self.rooms.join(&room_id, &client_id);
        let guard = ConnectionGuard {
            gateway: self.clone(),
            handle: Arc::clone(&handle),
            connected_at: Instant::now(),
        };

        info!(connection_id = %handle.connection_id, "client connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

        self.notify(
            room_id.clone(),
            OutboundFrame::UserJoined {
                client_id: client_id.clone(),
            },
            client_id.clone(),
        );

        // Outbound forwarder with periodic pings.
        let writer_handle = Arc::clone(&handle);
        let heartbeat = self.heartbeat_interval;
        let mut writer = tokio::spawn(
            async move {
                let mut ping = tokio::time::interval(heartbeat);
                let _ = ping.tick().await;

                loop {
                    tokio::select! {
                        msg = rx.recv() => {
                            let Some(payload) = msg else { break };
                            if ws_tx.send(Message::Text(String::from(payload.as_str()).into())).await.is_err() {
                                break;
                            }
                        }
                        _ = ping.tick() => {
                            if writer_handle.idle_for() > heartbeat * 2 {
                                warn!(idle = ?writer_handle.idle_for(), "client unresponsive, disconnecting");
                                break;
                            }
                            if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = ws_tx.close().await;
            }
            .instrument(Span::current()),
        );

        // The reader keeps consuming pongs while a dispatch awaits the backend;
        // data frames are handed to the dispatcher in arrival order.
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Message>(INBOUND_QUEUE);
        let reader = async {
            while let Some(msg) = ws_rx.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(error = %e, "websocket read failed");
                        break;
                    }
                };
                handle.mark_alive();
                match msg {
                    Message::Text(_) | Message::Binary(_) => {
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => {
                        debug!("client sent close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        };

        let ctx = ClientContext::new(client_id, room_id);
        let dispatcher = async {
            while let Some(msg) = inbound_rx.recv().await {
                match msg {
                    Message::Text(text) => {
                        let _ = self.router.dispatch(&ctx, text.as_str()).await;
                    }
                    Message::Binary(data) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            let _ = self.router.dispatch(&ctx, text).await;
                        } else {
                            let _ = self.router.reject_binary(&ctx);
                        }
                    }
                    _ => {}
                }
            }
        };

        tokio::select! {
            () = reader => {}
            () = dispatcher => {}
            _ = &mut writer => debug!("writer task ended"),
            () = self.shutdown.cancelled() => debug!("server shutting down, closing session"),
        }
        writer.abort();
        drop(guard);
    }

    /// Broadcast `frame` to `room_id` from a detached task.
    fn notify(&self, room_id: String, frame: OutboundFrame, exclude: String) {
        let rooms = Arc::clone(&self.rooms);
        if let Ok(runtime) = Handle::try_current() {
            let _ = runtime.spawn(async move {
                let _ = rooms.broadcast(&room_id, &frame, Some(&exclude));
            });
        } else {
            let _ = rooms.broadcast(&room_id, &frame, Some(&exclude));
        }
    }

    /// Remove a finished connection from the shared structures.
    ///
    /// Returns the rooms the client left. A connection that was replaced by a
    /// newer one under the same client id leaves membership to its successor,
    /// except for a room the successor is not in.
    fn cleanup(&self, handle: &ClientHandle) -> Vec<String> {
        let client_id = handle.client_id.as_str();
        let left = if self.registry.release(client_id, &handle.connection_id) {
            self.rooms.leave(client_id)
        } else {
            let moved = self
                .registry
                .get(client_id)
                .is_some_and(|current| current.room_id != handle.room_id);
            if moved && self.rooms.leave_room(&handle.room_id, client_id) {
                vec![handle.room_id.clone()]
            } else {
                debug!(client_id, "connection was superseded, keeping membership");
                Vec::new()
            }
        };

        for room_id in &left {
            self.notify(
                room_id.clone(),
                OutboundFrame::UserLeft {
                    client_id: client_id.to_string(),
                },
                client_id.to_string(),
            );
            if self.reap_empty_rooms && self.rooms.reap_if_empty(room_id) {
                info!(room_id, "reaped empty room");
                let bridges = Arc::clone(&self.bridges);
                let room_id = room_id.clone();
                if let Ok(runtime) = Handle::try_current() {
                    let _ = runtime.spawn(async move {
                        let _ = bridges.discard(&room_id).await;
                    });
                }
            }
        }
        left
    }
}

/// Runs cleanup when a session ends, including by panic or cancellation.
struct ConnectionGuard {
    gateway: Gateway,
    handle: Arc<ClientHandle>,
    connected_at: Instant,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let left = self.gateway.cleanup(&self.handle);
        info!(
            client_id = %self.handle.client_id,
            rooms_left = left.len(),
            duration_secs = self.connected_at.elapsed().as_secs(),
            dropped_messages = self.handle.drop_count(),
            "client disconnected"
        );
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
