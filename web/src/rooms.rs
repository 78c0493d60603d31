//! Room-based broadcasting for real-time fan-out.
//!
//! A room is a named channel (`provider:{id}`, `appointment:{id}`, ...).
//! Members join and leave rooms explicitly; publishing delivers an event to
//! every receiver currently attached to the room.
//!
//! ```text
//! Publisher            RoomBroadcaster               Members
//!   │                        │                          │
//!   │                        │<── subscribe(room, c1) ──┤
//!   │                        │<── subscribe(room, c2) ──┤
//!   ├─ publish(room, ev) ───>│                          │
//!   │                        ├── (room, ev) ──> c1, c2 ─┤
//!   │                        │<── disconnect(c1) ───────┤
//! ```
//!
//! Delivery is at-most-once: a member that is not attached when an event is
//! published never sees it, and a lagging member skips events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// Default per-room buffer size.
pub const DEFAULT_ROOM_CAPACITY: usize = 1000;

struct RoomChannel<E> {
    sender: broadcast::Sender<(String, E)>,
    members: HashSet<String>,
}

/// Type alias for the rooms map to reduce complexity.
type RoomsMap<E> = Arc<RwLock<HashMap<String, RoomChannel<E>>>>;

/// Room broadcaster with explicit membership.
///
/// Cloning is cheap; clones share the same rooms.
///
/// # Example
///
/// ```ignore
/// let rooms = RoomBroadcaster::<SlotEvent>::new();
///
/// let mut rx = rooms.subscribe("provider:42", "client-1").await;
/// rooms.publish("provider:42", event).await;
///
/// while let Ok((room, event)) = rx.recv().await {
///     // forward to the client
/// }
/// ```
pub struct RoomBroadcaster<E>
where
    E: Clone + Send + 'static,
{
    rooms: RoomsMap<E>,
    capacity: usize,
}

impl<E> RoomBroadcaster<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create a broadcaster with [`DEFAULT_ROOM_CAPACITY`] buffered events per room.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ROOM_CAPACITY)
    }

    /// Create a broadcaster with a custom per-room buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to a room.
    ///
    /// Returns the number of receivers that got the event. Publishing to a
    /// room nobody joined is not an error; it reaches zero receivers.
    pub async fn publish(&self, room: impl Into<String>, event: E) -> usize {
        let room = room.into();
        let rooms = self.rooms.read().await;

        rooms
            .get(&room)
            .and_then(|channel| channel.sender.send((room.clone(), event)).ok())
            .unwrap_or(0)
    }

    /// Join `member` to `room` and return a receiver for the room's events.
    pub async fn subscribe(
        &self,
        room: impl Into<String>,
        member: impl Into<String>,
    ) -> broadcast::Receiver<(String, E)> {
        let capacity = self.capacity;
        let mut rooms = self.rooms.write().await;

        let channel = rooms.entry(room.into()).or_insert_with(|| RoomChannel {
            sender: broadcast::channel(capacity).0,
            members: HashSet::new(),
        });
        channel.members.insert(member.into());
        channel.sender.subscribe()
    }

    /// Remove `member` from `room`.
    ///
    /// Returns `false` if the member was not in the room. Empty rooms are
    /// dropped. Receivers already handed out stay attached until dropped.
    pub async fn unsubscribe(&self, room: &str, member: &str) -> bool {
        let mut rooms = self.rooms.write().await;

        let Some(channel) = rooms.get_mut(room) else {
            return false;
        };
        let removed = channel.members.remove(member);
        if channel.members.is_empty() {
            rooms.remove(room);
        }
        removed
    }

    /// Remove `member` from every room it joined, returning those rooms.
    pub async fn disconnect(&self, member: &str) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();

        rooms.retain(|room, channel| {
            if channel.members.remove(member) {
                left.push(room.clone());
            }
            !channel.members.is_empty()
        });

        left.sort();
        left
    }

    /// Number of members in a room.
    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map_or(0, |channel| channel.members.len())
    }

    /// Whether `member` is in `room`.
    pub async fn is_member(&self, room: &str, member: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .is_some_and(|channel| channel.members.contains(member))
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl<E> Default for RoomBroadcaster<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for RoomBroadcaster<E>
where
    E: Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            rooms: Arc::clone(&self.rooms),
            capacity: self.capacity,
        }
    }
}
