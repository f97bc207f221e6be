//! Room membership and fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use huddle_telemetry::metrics::WS_BROADCAST_DROPS_TOTAL;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::protocol::OutboundFrame;
use crate::registry::{ConnectionRegistry, Delivery};

/// Room id → member client ids.
///
/// Members are resolved through the [`ConnectionRegistry`] at send time, so a
/// member whose connection is gone is skipped rather than failing the fan-out.
pub struct RoomIndex {
    rooms: RwLock<HashMap<String, HashSet<String>>>,
    registry: Arc<ConnectionRegistry>,
}

impl RoomIndex {
    /// Create an empty index that delivers through `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// Add `client_id` to `room_id`, creating the room if needed.
    ///
    /// Returns `false` if the client was already a member.
    pub fn join(&self, room_id: &str, client_id: &str) -> bool {
        self.rooms
            .write()
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id.to_string())
    }

    /// Remove `client_id` from every room. Returns the rooms it was in.
    ///
    /// Emptied rooms are kept; see [`RoomIndex::reap_if_empty`].
    pub fn leave(&self, client_id: &str) -> Vec<String> {
        let mut rooms = self.rooms.write();
        let mut left: Vec<String> = rooms
            .iter_mut()
            .filter_map(|(room_id, members)| members.remove(client_id).then(|| room_id.clone()))
            .collect();
        left.sort();
        left
    }

    /// Remove `client_id` from `room_id` only.
    pub fn leave_room(&self, room_id: &str, client_id: &str) -> bool {
        self.rooms
            .write()
            .get_mut(room_id)
            .is_some_and(|members| members.remove(client_id))
    }

    /// Drop `room_id` if it has no members. Returns whether it was removed.
    pub fn reap_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write();
        if rooms.get(room_id).is_some_and(HashSet::is_empty) {
            let _ = rooms.remove(room_id);
            true
        } else {
            false
        }
    }

    /// Current members of `room_id`, sorted. Empty for an unknown room.
    pub fn members(&self, room_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .rooms
            .read()
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Rooms `client_id` currently belongs to, sorted.
    pub fn room_of(&self, client_id: &str) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .rooms
            .read()
            .iter()
            .filter(|(_, members)| members.contains(client_id))
            .map(|(room_id, _)| room_id.clone())
            .collect();
        rooms.sort();
        rooms
    }

    /// Number of rooms, including empty ones that have not been reaped.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Send `frame` to every member of `room_id` except `exclude`.
    ///
    /// Per-recipient failures are logged and counted but never stop the
    /// fan-out. Returns the number of members the frame was queued for.
    pub fn broadcast(&self, room_id: &str, frame: &OutboundFrame, exclude: Option<&str>) -> usize {
        let payload = match frame.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(room_id, error = %e, "failed to serialize broadcast frame");
                return 0;
            }
        };

        // Snapshot members so the lock is not held while delivering.
        let recipients: Vec<String> = self
            .members(room_id)
            .into_iter()
            .filter(|m| Some(m.as_str()) != exclude)
            .collect();

        let mut delivered = 0;
        for client_id in &recipients {
            match self.registry.send(client_id, Arc::clone(&payload)) {
                Delivery::Delivered => delivered += 1,
                Delivery::NotConnected => {
                    debug!(room_id, client_id, "skipping member with no live connection");
                }
                Delivery::Dropped => {
                    counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(room_id, client_id, "failed to deliver broadcast to member");
                }
            }
        }
        debug!(
            room_id,
            recipients = recipients.len(),
            delivered,
            "broadcast to room"
        );
        delivered
    }
}
