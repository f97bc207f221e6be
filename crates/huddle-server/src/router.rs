//! Per-frame classification and dispatch.

use std::sync::Arc;

use huddle_telemetry::metrics::{WS_FRAMES_TOTAL, WS_PROTOCOL_ERRORS_TOTAL};
use metrics::counter;
use tracing::{Span, debug, instrument, warn};

use crate::bridge::{BridgeError, BridgePool};
use crate::protocol::{BackendRequest, FrameError, InboundFrame, OutboundFrame, decode_frame};
use crate::registry::{ConnectionRegistry, Delivery};
use crate::rooms::RoomIndex;

/// Error text sent when the backend could not be reached.
pub const BACKEND_UNAVAILABLE: &str = "backend unavailable";

/// Identity of the connection a frame arrived on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientContext {
    /// Sender's client id.
    pub client_id: String,
    /// Room the sender connected to.
    pub room_id: String,
}

impl ClientContext {
    /// Build a context for `client_id` in `room_id`.
    pub fn new(client_id: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            room_id: room_id.into(),
        }
    }
}

/// What handling one frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fanned out to the room; `delivered` recipients were queued.
    Broadcast {
        /// Members the frame was queued for.
        delivered: usize,
    },
    /// Sent to a single client.
    Direct(Delivery),
    /// The frame was rejected and the sender was told why.
    ProtocolError,
    /// The backend exchange failed and the sender was told why.
    BackendError,
}

/// Routes decoded frames to the room index, the registry or the bridge pool.
///
/// The router holds no state of its own; cloning it is cheap.
#[derive(Clone)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
    bridges: Arc<BridgePool>,
}

impl Router {
    /// Create a router over the shared structures.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomIndex>,
        bridges: Arc<BridgePool>,
    ) -> Self {
        Self {
            registry,
            rooms,
            bridges,
        }
    }

    /// Handle one text frame from `ctx`.
    ///
    /// Backend-bound frames are resolved before this returns, so frames from
    /// one client are processed in order.
    #[instrument(skip_all, fields(client_id = %ctx.client_id, room_id = %ctx.room_id, kind))]
    pub async fn dispatch(&self, ctx: &ClientContext, raw: &str) -> Outcome {
        let frame = match decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => return self.protocol_error(ctx, &e),
        };
        let kind = frame.kind();
        let _ = Span::current().record("kind", kind);
        counter!(WS_FRAMES_TOTAL, "kind" => kind).increment(1);
        debug!("dispatching frame");

        match frame {
            InboundFrame::Offer { sdp } => self.relay_to_room(
                ctx,
                &OutboundFrame::Offer {
                    sender: ctx.client_id.clone(),
                    sdp,
                },
            ),
            InboundFrame::IceCandidate { candidate } => self.relay_to_room(
                ctx,
                &OutboundFrame::IceCandidate {
                    sender: ctx.client_id.clone(),
                    candidate,
                },
            ),
            InboundFrame::Answer { target, sdp } => match target.filter(|t| !t.is_empty()) {
                Some(target) => {
                    let delivery = self.registry.send_frame(
                        &target,
                        &OutboundFrame::Answer {
                            sender: ctx.client_id.clone(),
                            sdp,
                        },
                    );
                    if delivery == Delivery::NotConnected {
                        debug!(target_id = %target, "answer target not connected, dropping");
                    }
                    Outcome::Direct(delivery)
                }
                None => self.reject(ctx, "answer requires a target", "missing_target"),
            },
            InboundFrame::GetUsers {} => {
                let users = self.rooms.members(&ctx.room_id);
                Outcome::Direct(
                    self.registry
                        .send_frame(&ctx.client_id, &OutboundFrame::UsersList { users }),
                )
            }
            InboundFrame::AsrText { text } | InboundFrame::TextMessage { text } => {
                let text = text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    return self.reject(ctx, "text must not be empty", "empty_text");
                }
                self.relay_to_backend(
                    ctx,
                    BackendRequest::AsrText {
                        text: text.to_string(),
                        client_id: ctx.client_id.clone(),
                        session_id: ctx.room_id.clone(),
                    },
                )
                .await
            }
            InboundFrame::ResetSession {} => {
                self.relay_to_backend(
                    ctx,
                    BackendRequest::ResetSession {
                        client_id: ctx.client_id.clone(),
                        session_id: ctx.room_id.clone(),
                    },
                )
                .await
            }
        }
    }

    /// Tell the sender a binary frame could not be read as text.
    pub fn reject_binary(&self, ctx: &ClientContext) -> Outcome {
        self.reject(ctx, "binary frames must be UTF-8 JSON", "binary")
    }

    fn relay_to_room(&self, ctx: &ClientContext, frame: &OutboundFrame) -> Outcome {
        let delivered = self
            .rooms
            .broadcast(&ctx.room_id, frame, Some(&ctx.client_id));
        Outcome::Broadcast { delivered }
    }

    /// Run the exchange on its own task so a disconnect of the sender does not
    /// cancel a request that is already queued on the room's bridge.
    async fn relay_to_backend(&self, ctx: &ClientContext, request: BackendRequest) -> Outcome {
        let router = self.clone();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { router.exchange(&task_ctx, request).await });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "backend exchange task failed");
                Outcome::BackendError
            }
        }
    }

    async fn exchange(&self, ctx: &ClientContext, request: BackendRequest) -> Outcome {
        let reply = match self.bridges.request(&ctx.room_id, &request).await {
            Ok(reply) => reply,
            Err(BridgeError::Rejected(message)) => {
                let _ = self
                    .registry
                    .send_frame(&ctx.client_id, &OutboundFrame::error(message));
                return Outcome::BackendError;
            }
            Err(_) => {
                let _ = self
                    .registry
                    .send_frame(&ctx.client_id, &OutboundFrame::error(BACKEND_UNAVAILABLE));
                return Outcome::BackendError;
            }
        };

        let frame = match request {
            BackendRequest::AsrText { .. } => OutboundFrame::BotResponse {
                text: reply.text.unwrap_or_default(),
                audio_file: reply.audio_file,
                session_id: ctx.room_id.clone(),
                client_id: ctx.client_id.clone(),
            },
            BackendRequest::ResetSession { .. } => OutboundFrame::SessionReset {
                message: reply
                    .message
                    .unwrap_or_else(|| "Session reset".to_string()),
                session_id: ctx.room_id.clone(),
                client_id: ctx.client_id.clone(),
            },
        };
        let delivered = self.rooms.broadcast(&ctx.room_id, &frame, None);
        Outcome::Broadcast { delivered }
    }

    fn protocol_error(&self, ctx: &ClientContext, error: &FrameError) -> Outcome {
        self.reject(ctx, &error.to_string(), error.reason())
    }

    fn reject(&self, ctx: &ClientContext, message: &str, reason: &'static str) -> Outcome {
        counter!(WS_PROTOCOL_ERRORS_TOTAL, "reason" => reason).increment(1);
        warn!(client_id = %ctx.client_id, reason, error = message, "rejected client frame");
        let _ = self
            .registry
            .send_frame(&ctx.client_id, &OutboundFrame::error(message));
        Outcome::ProtocolError
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::bridge::BackendConnector;
    use crate::bridge::testing::MockConnector;
    use crate::registry::Payload;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomIndex>,
        router: Router,
        mock: Arc<MockConnector>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let rooms = Arc::new(RoomIndex::new(Arc::clone(&registry)));
        let mock = MockConnector::new(Duration::from_millis(20));
        let connector: Arc<dyn BackendConnector> = mock.clone();
        let bridges = Arc::new(BridgePool::new(
            connector,
            Duration::from_secs(5),
            Duration::from_secs(10),
        ));
        let router = Router::new(Arc::clone(&registry), Arc::clone(&rooms), bridges);
        Harness {
            registry,
            rooms,
            router,
            mock,
        }
    }

    impl Harness {
        fn connect(&self, client_id: &str, room_id: &str) -> mpsc::Receiver<Payload> {
            let (tx, rx) = self.registry.channel();
            let _ = self.registry.register(client_id, room_id, tx);
            let _ = self.rooms.join(room_id, client_id);
            rx
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            frames.push(serde_json::from_str(&payload).unwrap());
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn text_reply_reaches_whole_room() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");

        let outcome = h
            .router
            .dispatch(&ClientContext::new("A", "R"), r#"{"type":"asr_text","text":"hello"}"#)
            .await;
        assert_eq!(outcome, Outcome::Broadcast { delivered: 2 });

        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "bot_response");
            assert_eq!(frames[0]["text"], "hi there");
            assert_eq!(frames[0]["session_id"], "R");
            assert_eq!(frames[0]["client_id"], "A");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn text_message_is_trimmed_before_forwarding() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");

        let _ = h
            .router
            .dispatch(
                &ClientContext::new("A", "R"),
                r#"{"type":"text_message","text":"  hello \n"}"#,
            )
            .await;
        assert_eq!(drain(&mut rx_a)[0]["text"], "hi there");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_never_reaches_backend() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");

        for raw in [
            r#"{"type":"asr_text","text":"   "}"#,
            r#"{"type":"text_message","text":""}"#,
            r#"{"type":"asr_text"}"#,
        ] {
            let outcome = h.router.dispatch(&ClientContext::new("A", "R"), raw).await;
            assert_eq!(outcome, Outcome::ProtocolError);
        }

        assert_eq!(h.mock.connects(), 0);
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f["type"] == "error"));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_errors_to_sender_only() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");

        let outcome = h
            .router
            .dispatch(&ClientContext::new("A", "R"), r#"{"type":"mystery"}"#)
            .await;
        assert_eq!(outcome, Outcome::ProtocolError);

        let frames = drain(&mut rx_a);
        assert_eq!(frames[0]["type"], "error");
        assert!(frames[0]["message"].as_str().unwrap().contains("mystery"));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn malformed_json_errors_and_leaves_room_untouched() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let _rx_b = h.connect("B", "R");

        let outcome = h
            .router
            .dispatch(&ClientContext::new("A", "R"), "{oops")
            .await;
        assert_eq!(outcome, Outcome::ProtocolError);
        assert_eq!(drain(&mut rx_a)[0]["type"], "error");
        assert_eq!(h.rooms.members("R"), vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn get_users_lists_current_members() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let _rx_b = h.connect("B", "R");
        let _rx_z = h.connect("Z", "other");

        let outcome = h
            .router
            .dispatch(&ClientContext::new("A", "R"), r#"{"kind":"get_users"}"#)
            .await;
        assert_eq!(outcome, Outcome::Direct(Delivery::Delivered));
        let frames = drain(&mut rx_a);
        assert_eq!(frames[0], json!({"type": "users_list", "users": ["A", "B"]}));
    }

    #[tokio::test]
    async fn offer_and_candidate_skip_sender() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");
        let mut rx_c = h.connect("C", "R");
        let ctx = ClientContext::new("A", "R");

        let outcome = h
            .router
            .dispatch(&ctx, r#"{"type":"offer","sdp":{"type":"offer","sdp":"v=0"}}"#)
            .await;
        assert_eq!(outcome, Outcome::Broadcast { delivered: 2 });
        let _ = h
            .router
            .dispatch(&ctx, r#"{"type":"ice_candidate","candidate":{"candidate":"c1"}}"#)
            .await;

        assert!(drain(&mut rx_a).is_empty());
        for rx in [&mut rx_b, &mut rx_c] {
            let frames = drain(rx);
            assert_eq!(
                frames[0],
                json!({"type": "offer", "sender": "A", "sdp": {"type": "offer", "sdp": "v=0"}})
            );
            assert_eq!(
                frames[1],
                json!({"type": "ice_candidate", "sender": "A", "candidate": {"candidate": "c1"}})
            );
        }
    }

    #[tokio::test]
    async fn answer_goes_to_target_only() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");
        let mut rx_c = h.connect("C", "R");

        let outcome = h
            .router
            .dispatch(
                &ClientContext::new("B", "R"),
                r#"{"type":"answer","target":"A","sdp":"v=0"}"#,
            )
            .await;
        assert_eq!(outcome, Outcome::Direct(Delivery::Delivered));
        assert_eq!(
            drain(&mut rx_a),
            vec![json!({"type": "answer", "sender": "B", "sdp": "v=0"})]
        );
        assert!(drain(&mut rx_b).is_empty());
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn answer_to_absent_target_is_dropped() {
        let h = harness();
        let mut rx_b = h.connect("B", "R");

        let outcome = h
            .router
            .dispatch(
                &ClientContext::new("B", "R"),
                r#"{"type":"answer","target":"ghost","sdp":"v=0"}"#,
            )
            .await;
        assert_eq!(outcome, Outcome::Direct(Delivery::NotConnected));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn answer_without_target_is_an_error() {
        let h = harness();
        let mut rx_b = h.connect("B", "R");

        let outcome = h
            .router
            .dispatch(&ClientContext::new("B", "R"), r#"{"type":"answer","sdp":"v=0"}"#)
            .await;
        assert_eq!(outcome, Outcome::ProtocolError);
        assert_eq!(drain(&mut rx_b)[0]["type"], "error");
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_reports_unavailable_to_sender() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");

        h.mock.state.fail_connect.store(true, Ordering::SeqCst);
        let outcome = h
            .router
            .dispatch(&ClientContext::new("A", "R"), r#"{"type":"asr_text","text":"hi"}"#)
            .await;
        assert_eq!(outcome, Outcome::BackendError);
        assert_eq!(
            drain(&mut rx_a),
            vec![json!({"type": "error", "message": BACKEND_UNAVAILABLE})]
        );
        assert!(drain(&mut rx_b).is_empty());

        let outcome = h
            .router
            .dispatch(&ClientContext::new("A", "R"), r#"{"type":"asr_text","text":"hello"}"#)
            .await;
        assert_eq!(outcome, Outcome::Broadcast { delivered: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn backend_rejection_is_passed_to_sender() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");

        h.mock.state.reject_next.store(true, Ordering::SeqCst);
        let _ = h
            .router
            .dispatch(&ClientContext::new("A", "R"), r#"{"type":"asr_text","text":"hi"}"#)
            .await;
        assert_eq!(
            drain(&mut rx_a),
            vec![json!({"type": "error", "message": "quota exceeded"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_session_broadcasts_confirmation() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");

        let outcome = h
            .router
            .dispatch(&ClientContext::new("A", "R"), r#"{"type":"reset_session"}"#)
            .await;
        assert_eq!(outcome, Outcome::Broadcast { delivered: 2 });
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(
                drain(rx),
                vec![json!({
                    "type": "session_reset",
                    "message": "Session reset",
                    "session_id": "R",
                    "client_id": "A",
                })]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sender_disconnect_does_not_cancel_backend_request() {
        let h = harness();
        let _rx_a = h.connect("A", "R");
        let mut rx_b = h.connect("B", "R");

        let router = h.router.clone();
        let sender = tokio::spawn(async move {
            router
                .dispatch(&ClientContext::new("A", "R"), r#"{"type":"asr_text","text":"hello"}"#)
                .await
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        sender.abort();
        let _ = h.registry.unregister("A");
        let _ = h.rooms.leave("A");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["text"], "hi there");
    }

    #[tokio::test]
    async fn non_utf8_binary_is_rejected() {
        let h = harness();
        let mut rx_a = h.connect("A", "R");

        assert_eq!(
            h.router.reject_binary(&ClientContext::new("A", "R")),
            Outcome::ProtocolError
        );
        assert_eq!(drain(&mut rx_a)[0]["type"], "error");
    }
}
