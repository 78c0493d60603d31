//! Channel transport: the socket protocol and per-connection sessions.
//!
//! A client holds one persistent connection, joins any number of rooms and
//! sends lock requests over it. Messages are JSON objects tagged by `type`.
//!
//! ```text
//! client                                   server
//!   │ ──── subscribe {rooms} ─────────────▶ │
//!   │ ◀─── subscribed {rooms} ───────────── │
//!   │ ──── lock_slot {request_id, ..} ────▶ │  AcquireSlotLock
//!   │ ◀─── lock_result {granted, ..} ────── │
//!   │ ◀─── event {room, event} ──────────── │  fan-out
//! ```
//!
//! Room membership is advisory. Dropping a connection leaves every room but
//! never releases slot locks; the reaper reclaims those.

use crate::aggregates::BookingAction;
use crate::app::BookingService;
use crate::error::BookingError;
use crate::fanout::{Fanout, FanoutEvent, Room};
use crate::types::{ClientId, PatientId, ProviderId, SlotKey, hhmm};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outbound queue depth per connection
pub const OUTBOUND_QUEUE: usize = 256;

/// Message from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join rooms
    Subscribe {
        /// Room names
        rooms: Vec<String>,
    },
    /// Leave rooms
    Unsubscribe {
        /// Room names
        rooms: Vec<String>,
    },
    /// Claim a slot
    LockSlot {
        /// Echoed on the answer
        request_id: String,
        /// Provider
        provider_id: ProviderId,
        /// Date
        date: NaiveDate,
        /// Slot start
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
    /// Give a slot back
    UnlockSlot {
        /// Echoed on the answer
        request_id: String,
        /// Provider
        provider_id: ProviderId,
        /// Date
        date: NaiveDate,
        /// Slot start
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
    /// Keep-alive
    Ping,
}

/// Message from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the upgrade
    Connected {
        /// Server-assigned connection id
        client_id: ClientId,
    },
    /// Rooms joined
    Subscribed {
        /// Rooms
        rooms: Vec<Room>,
    },
    /// Rooms left
    Unsubscribed {
        /// Rooms
        rooms: Vec<Room>,
    },
    /// A room event
    Event {
        /// Room it was published to
        room: String,
        /// The event
        event: FanoutEvent,
    },
    /// Answer to `lock_slot`
    LockResult {
        /// Request id
        request_id: String,
        /// Whether the lock is held
        granted: bool,
        /// Lock expiry, when granted
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        /// Refusal reason, when not granted
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Answer to `unlock_slot`
    UnlockResult {
        /// Request id
        request_id: String,
        /// Whether a lock was removed
        released: bool,
    },
    /// Something went wrong with the last message
    Error {
        /// Description
        message: String,
    },
    /// Answer to `ping`
    Pong,
}

impl ServerMessage {
    /// `error` message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    fn lock_refused(request_id: String, reason: impl Into<String>) -> Self {
        Self::LockResult {
            request_id,
            granted: false,
            expires_at: None,
            reason: Some(reason.into()),
        }
    }
}

/// One client connection.
///
/// Owns the room subscriptions; each joined room has a forwarding task
/// feeding room events into the outbound queue.
pub struct Session {
    client_id: ClientId,
    patient_id: Option<PatientId>,
    fanout: Fanout,
    outbound: mpsc::Sender<ServerMessage>,
    rooms: HashMap<Room, JoinHandle<()>>,
}

impl Session {
    /// Creates a session writing to `outbound`
    #[must_use]
    pub fn new(
        client_id: ClientId,
        patient_id: Option<PatientId>,
        fanout: Fanout,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            client_id,
            patient_id,
            fanout,
            outbound,
            rooms: HashMap::new(),
        }
    }

    /// Connection id
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Patient identified at connect time
    #[must_use]
    pub const fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    /// Joined rooms
    #[must_use]
    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.keys().copied().collect()
    }

    /// Queue a message for the client.
    ///
    /// # Errors
    ///
    /// [`BookingError::ChannelDisconnected`] once the outbound side is closed.
    pub async fn send(&self, message: ServerMessage) -> Result<(), BookingError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| BookingError::ChannelDisconnected)
    }

    /// Join `room`. Joining a room twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`BookingError::ChannelDisconnected`] if the outbound side is closed.
    pub async fn join(&mut self, room: Room) -> Result<(), BookingError> {
        if self.outbound.is_closed() {
            return Err(BookingError::ChannelDisconnected);
        }
        if self.rooms.contains_key(&room) {
            return Ok(());
        }

        let mut rx = self.fanout.subscribe(room, self.client_id).await;
        let outbound = self.outbound.clone();
        let client_id = self.client_id;

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((room, event)) => {
                        if outbound.send(ServerMessage::Event { room, event }).await.is_err() {
                            break;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%client_id, skipped, "Client lagged, events dropped");
                    },
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.rooms.insert(room, task);
        tracing::debug!(%client_id, %room, "Joined room");
        Ok(())
    }

    /// Leave `room`; returns whether the client was in it
    pub async fn leave(&mut self, room: Room) -> bool {
        let Some(task) = self.rooms.remove(&room) else {
            return false;
        };
        task.abort();
        self.fanout.unsubscribe(room, self.client_id).await;
        tracing::debug!(client_id = %self.client_id, %room, "Left room");
        true
    }

    /// Leave every room
    pub async fn close(mut self) {
        for (_, task) in self.rooms.drain() {
            task.abort();
        }
        let left = self.fanout.disconnect(self.client_id).await;
        tracing::debug!(client_id = %self.client_id, rooms = left.len(), "Session closed");
    }

    /// Handle one inbound message.
    ///
    /// # Errors
    ///
    /// [`BookingError::ChannelDisconnected`] if the answer cannot be queued.
    pub async fn handle(
        &mut self,
        message: ClientMessage,
        service: &BookingService,
    ) -> Result<(), BookingError> {
        match message {
            ClientMessage::Subscribe { rooms } => {
                let mut joined = Vec::with_capacity(rooms.len());
                for name in rooms {
                    match name.parse::<Room>() {
                        Ok(room) => {
                            self.join(room).await?;
                            joined.push(room);
                        },
                        Err(error) => self.send(ServerMessage::error(error.to_string())).await?,
                    }
                }
                self.send(ServerMessage::Subscribed { rooms: joined }).await
            },

            ClientMessage::Unsubscribe { rooms } => {
                let mut left = Vec::with_capacity(rooms.len());
                for name in rooms {
                    if let Ok(room) = name.parse::<Room>() {
                        self.leave(room).await;
                        left.push(room);
                    }
                }
                self.send(ServerMessage::Unsubscribed { rooms: left }).await
            },

            ClientMessage::LockSlot {
                request_id,
                provider_id,
                date,
                time,
            } => {
                let answer = self
                    .lock_slot(service, request_id, SlotKey::new(provider_id, date, time))
                    .await;
                self.send(answer).await
            },

            ClientMessage::UnlockSlot {
                request_id,
                provider_id,
                date,
                time,
            } => {
                let answer = self
                    .unlock_slot(service, request_id, SlotKey::new(provider_id, date, time))
                    .await;
                self.send(answer).await
            },

            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
        }
    }

    async fn lock_slot(
        &self,
        service: &BookingService,
        request_id: String,
        slot: SlotKey,
    ) -> ServerMessage {
        let Some(holder) = self.patient_id else {
            return ServerMessage::lock_refused(request_id, "patient_required");
        };

        match service
            .dispatch(|correlation_id| BookingAction::AcquireSlotLock {
                correlation_id,
                slot,
                holder,
            })
            .await
        {
            Ok(BookingAction::SlotLockGranted { lock, .. }) => ServerMessage::LockResult {
                request_id,
                granted: true,
                expires_at: Some(lock.expires_at),
                reason: None,
            },
            Ok(BookingAction::SlotLockDenied { error, .. }) => {
                ServerMessage::lock_refused(request_id, error.reason())
            },
            Ok(other) => {
                tracing::warn!(?other, "Unexpected answer to lock request");
                ServerMessage::lock_refused(request_id, "internal_error")
            },
            Err(error) if error.is_timeout() => {
                tracing::warn!(%slot, %holder, "Lock request timed out");
                ServerMessage::lock_refused(request_id, "timeout")
            },
            Err(error) => {
                tracing::warn!(%slot, %holder, %error, "Lock request failed");
                ServerMessage::lock_refused(request_id, "unavailable")
            },
        }
    }

    async fn unlock_slot(
        &self,
        service: &BookingService,
        request_id: String,
        slot: SlotKey,
    ) -> ServerMessage {
        let Some(holder) = self.patient_id else {
            return ServerMessage::UnlockResult {
                request_id,
                released: false,
            };
        };

        let released = matches!(
            service
                .dispatch(|correlation_id| BookingAction::ReleaseSlotLock {
                    correlation_id,
                    slot,
                    holder,
                })
                .await,
            Ok(BookingAction::SlotLockReleased { released: true, .. })
        );

        ServerMessage::UnlockResult {
            request_id,
            released,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::aggregates::{
        BookingEnvironment, BookingPolicy, BookingReducer, BookingState, PaymentVerifier,
    };
    use crate::calendar::{ConsultationFees, Provider, WeeklySchedule};
    use crate::payment_gateway::MockPaymentGateway;
    use crate::types::{ConsultationType, Money};
    use slotbook_core::environment::Clock;
    use slotbook_runtime::Store;
    use slotbook_testing::test_clock;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(fanout: &Fanout) -> BookingService {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let env = BookingEnvironment::new(
            Arc::clone(&clock),
            MockPaymentGateway::shared(),
            PaymentVerifier::new("secret"),
            fanout.clone(),
            BookingPolicy::default(),
        );
        let store = Arc::new(Store::new(BookingState::new(), BookingReducer::new(), env));
        BookingService::new(store, clock, Duration::from_secs(5))
    }

    async fn register(service: &BookingService) -> ProviderId {
        let provider = Provider {
            id: ProviderId::new(),
            name: "Dr. X".to_string(),
            schedule: WeeklySchedule::default(),
            fees: ConsultationFees {
                online: Money::from_minor(50_000),
                in_person: Money::from_minor(80_000),
            },
            consultation_types: vec![ConsultationType::Online],
            is_online: true,
            allows_deferred_settlement: false,
        };
        let id = provider.id;
        service
            .dispatch(|correlation_id| BookingAction::RegisterProvider {
                correlation_id,
                provider,
            })
            .await
            .unwrap();
        id
    }

    fn lock_message(provider_id: ProviderId) -> ClientMessage {
        ClientMessage::LockSlot {
            request_id: "r1".to_string(),
            provider_id,
            date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_client_message_wire_format() {
        let json = r#"{"type":"lock_slot","request_id":"a","provider_id":"00000000-0000-0000-0000-000000000001","date":"2025-01-06","time":"10:00"}"#;
        let message: ClientMessage = serde_json::from_str(json).unwrap();

        assert!(matches!(message, ClientMessage::LockSlot { ref request_id, .. } if request_id == "a"));
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_refusal_omits_expiry() {
        let json = serde_json::to_value(ServerMessage::lock_refused("r".to_string(), "lock_conflict")).unwrap();

        assert_eq!(json["type"], "lock_result");
        assert_eq!(json["granted"], false);
        assert_eq!(json["reason"], "lock_conflict");
        assert!(json.get("expires_at").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_unknown_rooms() {
        let fanout = Fanout::new();
        let service = service(&fanout);
        let (tx, mut rx) = mpsc::channel(16);
        let mut session = Session::new(ClientId::new(), None, fanout, tx);
        let provider = ProviderId::new();

        session
            .handle(
                ClientMessage::Subscribe {
                    rooms: vec!["lobby".to_string(), format!("provider:{provider}")],
                },
                &service,
            )
            .await
            .unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::Error { .. }));
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::Subscribed {
                rooms: vec![Room::Provider(provider)]
            }
        );
    }

    #[tokio::test]
    async fn test_lock_request_round_trip_and_room_event() {
        let fanout = Fanout::new();
        let service = service(&fanout);
        let provider = register(&service).await;
        let (tx, mut rx) = mpsc::channel(16);
        let mut session = Session::new(ClientId::new(), Some(PatientId::new()), fanout, tx);

        session.join(Room::Provider(provider)).await.unwrap();
        session.handle(lock_message(provider), &service).await.unwrap();

        let mut saw_result = false;
        let mut saw_event = false;
        while !(saw_result && saw_event) {
            match rx.recv().await.unwrap() {
                ServerMessage::LockResult { granted, .. } => {
                    assert!(granted);
                    saw_result = true;
                },
                ServerMessage::Event { event, .. } => {
                    assert_eq!(event.name(), "slot:locked");
                    saw_event = true;
                },
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_lock_without_patient_is_refused() {
        let fanout = Fanout::new();
        let service = service(&fanout);
        let provider = register(&service).await;
        let (tx, mut rx) = mpsc::channel(16);
        let mut session = Session::new(ClientId::new(), None, fanout, tx);

        session.handle(lock_message(provider), &service).await.unwrap();

        let ServerMessage::LockResult { granted, reason, .. } = rx.recv().await.unwrap() else {
            panic!("expected lock result");
        };
        assert!(!granted);
        assert_eq!(reason.as_deref(), Some("patient_required"));
    }

    #[tokio::test]
    async fn test_closed_queue_is_channel_disconnected() {
        let fanout = Fanout::new();
        let (tx, rx) = mpsc::channel(1);
        let mut session = Session::new(ClientId::new(), None, fanout.clone(), tx);
        drop(rx);

        let result = session.join(Room::Provider(ProviderId::new())).await;

        assert_eq!(result, Err(BookingError::ChannelDisconnected));
        assert_eq!(session.send(ServerMessage::Pong).await, Err(BookingError::ChannelDisconnected));
    }

    #[tokio::test]
    async fn test_close_leaves_rooms() {
        let fanout = Fanout::new();
        let (tx, _rx) = mpsc::channel(16);
        let mut session = Session::new(ClientId::new(), None, fanout.clone(), tx);
        let room = Room::Provider(ProviderId::new());

        session.join(room).await.unwrap();
        session.join(room).await.unwrap();
        assert_eq!(fanout.member_count(room).await, 1);

        session.close().await;
        assert_eq!(fanout.member_count(room).await, 0);
    }
}
