//! Real-time fan-out of booking events to rooms.
//!
//! Events are hints. Delivery is at-most-once and best effort; clients
//! re-query authoritative state when they see one. Payloads identify the
//! slot or appointment and never carry payment tokens or signatures.

use crate::aggregates::appointment::{Appointment, AppointmentStatus, StatusChange};
use crate::aggregates::slot_lock::SlotLock;
use crate::types::{
    AppointmentId, ClientId, PatientId, ProviderId, ReasonCode, SlotKey, hhmm,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use slotbook_web::RoomBroadcaster;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

/// A named channel clients can join
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Room {
    /// `provider:{id}`: the provider's calendar
    Provider(ProviderId),
    /// `appointment:{id}`: one appointment's status
    Appointment(AppointmentId),
    /// `patient:{id}`: everything addressed to one patient
    Patient(PatientId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider(id) => write!(f, "provider:{id}"),
            Self::Appointment(id) => write!(f, "appointment:{id}"),
            Self::Patient(id) => write!(f, "patient:{id}"),
        }
    }
}

/// Unknown or malformed room name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown room: {0}")]
pub struct UnknownRoom(pub String);

impl FromStr for Room {
    type Err = UnknownRoom;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownRoom(s.to_string());
        let (kind, id) = s.split_once(':').ok_or_else(unknown)?;

        match kind {
            "provider" => id.parse().map(Self::Provider).map_err(|_| unknown()),
            "appointment" => id.parse().map(Self::Appointment).map_err(|_| unknown()),
            "patient" => id.parse().map(Self::Patient).map_err(|_| unknown()),
            _ => Err(unknown()),
        }
    }
}

impl Serialize for Room {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Room {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Event published to rooms
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum FanoutEvent {
    /// Someone is booking the slot
    #[serde(rename = "slot:locked")]
    SlotLocked {
        /// Provider
        provider_id: ProviderId,
        /// Date
        date: NaiveDate,
        /// Slot start
        #[serde(with = "hhmm")]
        time: NaiveTime,
        /// When the lock runs out
        expires_at: DateTime<Utc>,
    },

    /// The slot is bookable again
    #[serde(rename = "slot:unlocked")]
    SlotUnlocked {
        /// Provider
        provider_id: ProviderId,
        /// Date
        date: NaiveDate,
        /// Slot start
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },

    /// A lock request was refused (sent to the requesting patient)
    #[serde(rename = "slot:lock:failed")]
    SlotLockFailed {
        /// Provider
        provider_id: ProviderId,
        /// Date
        date: NaiveDate,
        /// Slot start
        #[serde(with = "hhmm")]
        time: NaiveTime,
        /// `lock_conflict`, `slot_occupied`, ...
        reason: String,
    },

    /// An appointment changed status
    #[serde(rename = "appointment:status:updated")]
    AppointmentStatusUpdated {
        /// Appointment
        appointment_id: AppointmentId,
        /// Provider
        provider_id: ProviderId,
        /// Date
        date: NaiveDate,
        /// Slot start
        #[serde(with = "hhmm")]
        time: NaiveTime,
        /// Previous status
        previous_status: AppointmentStatus,
        /// New status
        status: AppointmentStatus,
        /// Why
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<ReasonCode>,
        /// When
        changed_at: DateTime<Utc>,
    },

    /// A provider went online or offline
    #[serde(rename = "provider:status:updated")]
    ProviderStatusUpdated {
        /// Provider
        provider_id: ProviderId,
        /// Accepting bookings
        is_online: bool,
        /// When
        changed_at: DateTime<Utc>,
    },
}

impl FanoutEvent {
    /// `slot:locked` for a granted lock
    #[must_use]
    pub const fn locked(lock: &SlotLock) -> Self {
        Self::SlotLocked {
            provider_id: lock.provider_id,
            date: lock.date,
            time: lock.time,
            expires_at: lock.expires_at,
        }
    }

    /// `slot:unlocked`
    #[must_use]
    pub const fn unlocked(slot: SlotKey) -> Self {
        Self::SlotUnlocked {
            provider_id: slot.provider_id,
            date: slot.date,
            time: slot.time,
        }
    }

    /// `slot:lock:failed`
    #[must_use]
    pub fn lock_failed(slot: SlotKey, reason: impl Into<String>) -> Self {
        Self::SlotLockFailed {
            provider_id: slot.provider_id,
            date: slot.date,
            time: slot.time,
            reason: reason.into(),
        }
    }

    /// `appointment:status:updated`
    #[must_use]
    pub const fn status_updated(appointment: &Appointment, change: &StatusChange) -> Self {
        Self::AppointmentStatusUpdated {
            appointment_id: appointment.id,
            provider_id: appointment.provider_id,
            date: appointment.date,
            time: appointment.time,
            previous_status: change.from,
            status: change.to,
            reason: change.reason,
            changed_at: change.at,
        }
    }

    /// Wire name of the event
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SlotLocked { .. } => "slot:locked",
            Self::SlotUnlocked { .. } => "slot:unlocked",
            Self::SlotLockFailed { .. } => "slot:lock:failed",
            Self::AppointmentStatusUpdated { .. } => "appointment:status:updated",
            Self::ProviderStatusUpdated { .. } => "provider:status:updated",
        }
    }
}

/// Typed front for the room broadcaster.
///
/// Cloning is cheap; clones share rooms.
#[derive(Clone, Default)]
pub struct Fanout {
    rooms: RoomBroadcaster<FanoutEvent>,
}

impl Fanout {
    /// Fan-out with the default per-room buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan-out with a custom per-room buffer
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: RoomBroadcaster::with_capacity(capacity),
        }
    }

    /// Deliver `event` to everyone in `room`; returns receivers reached
    pub async fn publish(&self, room: Room, event: FanoutEvent) -> usize {
        let reached = self.rooms.publish(room.to_string(), event.clone()).await;
        tracing::trace!(%room, event = event.name(), reached, "Published");
        reached
    }

    /// Publish a batch in order
    pub async fn publish_all(&self, batch: Vec<(Room, FanoutEvent)>) {
        for (room, event) in batch {
            self.publish(room, event).await;
        }
    }

    /// Join `client` to `room`
    pub async fn subscribe(
        &self,
        room: Room,
        client: ClientId,
    ) -> broadcast::Receiver<(String, FanoutEvent)> {
        self.rooms.subscribe(room.to_string(), client.to_string()).await
    }

    /// Remove `client` from `room`
    pub async fn unsubscribe(&self, room: Room, client: ClientId) -> bool {
        self.rooms
            .unsubscribe(&room.to_string(), &client.to_string())
            .await
    }

    /// Remove `client` from every room
    pub async fn disconnect(&self, client: ClientId) -> Vec<String> {
        self.rooms.disconnect(&client.to_string()).await
    }

    /// Members of `room`
    pub async fn member_count(&self, room: Room) -> usize {
        self.rooms.member_count(&room.to_string()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn slot() -> SlotKey {
        SlotKey::new(
            ProviderId::new(),
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
        )
    }

    #[test]
    fn test_room_names_round_trip() {
        let provider = ProviderId::new();
        let room = Room::Provider(provider);

        assert_eq!(room.to_string(), format!("provider:{provider}"));
        assert_eq!(room.to_string().parse::<Room>().unwrap(), room);

        let patient = Room::Patient(PatientId::new());
        assert_eq!(patient.to_string().parse::<Room>().unwrap(), patient);
    }

    #[test]
    fn test_unknown_rooms_rejected() {
        assert!("lobby".parse::<Room>().is_err());
        assert!("provider:not-a-uuid".parse::<Room>().is_err());
        assert!("doctor:00000000-0000-0000-0000-000000000000".parse::<Room>().is_err());
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(FanoutEvent::unlocked(slot())).unwrap();

        assert_eq!(json["event"], "slot:unlocked");
        assert_eq!(json["time"], "10:30");
        assert_eq!(json["date"], "2025-01-06");

        let failed = serde_json::to_value(FanoutEvent::lock_failed(slot(), "lock_conflict")).unwrap();
        assert_eq!(failed["event"], "slot:lock:failed");
        assert_eq!(failed["reason"], "lock_conflict");
    }

    #[tokio::test]
    async fn test_publish_reaches_room_members_only() {
        let fanout = Fanout::new();
        let provider = ProviderId::new();
        let client = ClientId::new();

        let mut rx = fanout.subscribe(Room::Provider(provider), client).await;
        let reached = fanout
            .publish(Room::Provider(provider), FanoutEvent::unlocked(slot()))
            .await;
        let elsewhere = fanout
            .publish(Room::Provider(ProviderId::new()), FanoutEvent::unlocked(slot()))
            .await;

        assert_eq!(reached, 1);
        assert_eq!(elsewhere, 0);
        let (room, event) = rx.recv().await.unwrap();
        assert_eq!(room, format!("provider:{provider}"));
        assert_eq!(event.name(), "slot:unlocked");
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let fanout = Fanout::new();
        let client = ClientId::new();
        let provider = Room::Provider(ProviderId::new());
        let patient = Room::Patient(PatientId::new());

        let _a = fanout.subscribe(provider, client).await;
        let _b = fanout.subscribe(patient, client).await;

        assert_eq!(fanout.disconnect(client).await.len(), 2);
        assert_eq!(fanout.member_count(provider).await, 0);
    }
}
