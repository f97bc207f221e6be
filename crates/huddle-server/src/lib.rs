//! # huddle-server
//!
//! WebSocket gateway that groups clients into rooms for signaling exchange and
//! relays their text to a backend conversational service.
//!
//! - Connection registry: client id → bounded outbound queue
//! - Room index: membership and fan-out
//! - Bridge pool: one persistent backend connection per room, requests
//!   serialized per room
//! - Router: per-frame dispatch
//! - Gateway: session lifecycle with guaranteed cleanup
//! - HTTP: `/`, `/health`, `/metrics`, graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod bridge;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;
pub mod shutdown;

pub use bridge::{BackendChannel, BackendConnector, BridgeError, BridgePool, WsConnector};
pub use errors::ServerError;
pub use server::{AppState, ServerHandle, build_router, start};
