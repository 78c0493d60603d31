//! Transient, TTL-bound slot reservations.
//!
//! [`SlotLockTable`] is a plain map keyed by [`SlotKey`]. It is only ever
//! touched from inside the booking reducer, which the store runs one action
//! at a time, so `acquire` is an atomic insert-if-absent.

use crate::error::BookingError;
use crate::types::{AppointmentId, HolderId, ProviderId, SlotKey, hhmm};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A patient's temporary claim on a slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLock {
    /// Provider
    pub provider_id: ProviderId,
    /// Date
    pub date: NaiveDate,
    /// Slot start
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    /// Patient holding the lock
    pub holder_id: HolderId,
    /// When the lock was granted
    pub acquired_at: DateTime<Utc>,
    /// `acquired_at + TTL`; never moved
    pub expires_at: DateTime<Utc>,
    /// Appointment the lock is backing, once booking has begun
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<AppointmentId>,
}

impl SlotLock {
    /// The slot this lock covers
    #[must_use]
    pub const fn slot(&self) -> SlotKey {
        SlotKey::new(self.provider_id, self.date, self.time)
    }

    /// Unexpired at `now`
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Result of a successful [`SlotLockTable::acquire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acquisition {
    /// A new lock was inserted
    Granted(SlotLock),
    /// The holder already had the lock; nothing changed
    AlreadyHeld(SlotLock),
}

impl Acquisition {
    /// The lock, new or existing
    #[must_use]
    pub const fn lock(&self) -> &SlotLock {
        match self {
            Self::Granted(lock) | Self::AlreadyHeld(lock) => lock,
        }
    }

    /// Whether a lock was inserted
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// All slot locks, expired ones included until something reclaims them.
#[derive(Clone, Debug, Default)]
pub struct SlotLockTable {
    locks: HashMap<SlotKey, SlotLock>,
}

impl SlotLockTable {
    /// Creates an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `slot` to `holder` unless another holder's lock is active.
    ///
    /// An expired lock left in the table is overwritten; callers that need
    /// to react to the reclaim remove it with [`take_expired`](Self::take_expired)
    /// first.
    ///
    /// # Errors
    ///
    /// [`BookingError::LockConflict`] if a different holder has an unexpired lock.
    pub fn acquire(
        &mut self,
        slot: SlotKey,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Acquisition, BookingError> {
        if let Some(existing) = self.locks.get(&slot) {
            if existing.is_active_at(now) {
                return if existing.holder_id == holder {
                    Ok(Acquisition::AlreadyHeld(existing.clone()))
                } else {
                    Err(BookingError::LockConflict { slot })
                };
            }
        }

        let lock = SlotLock {
            provider_id: slot.provider_id,
            date: slot.date,
            time: slot.time,
            holder_id: holder,
            acquired_at: now,
            expires_at: now + ttl,
            appointment_id: None,
        };
        self.locks.insert(slot, lock.clone());
        Ok(Acquisition::Granted(lock))
    }

    /// Remove the lock if `holder` holds it and it has not expired.
    ///
    /// Absent, expired, and foreign locks are left alone and yield `None`.
    pub fn release(
        &mut self,
        slot: &SlotKey,
        holder: HolderId,
        now: DateTime<Utc>,
    ) -> Option<SlotLock> {
        let held = self
            .locks
            .get(slot)
            .is_some_and(|lock| lock.holder_id == holder && lock.is_active_at(now));

        if held { self.locks.remove(slot) } else { None }
    }

    /// Remove the lock on `slot` unconditionally.
    pub fn remove(&mut self, slot: &SlotKey) -> Option<SlotLock> {
        self.locks.remove(slot)
    }

    /// Remove the lock on `slot` if it has expired at `now`.
    pub fn take_expired(&mut self, slot: &SlotKey, now: DateTime<Utc>) -> Option<SlotLock> {
        let expired = self
            .locks
            .get(slot)
            .is_some_and(|lock| !lock.is_active_at(now));

        if expired { self.locks.remove(slot) } else { None }
    }

    /// Remove every lock with `expires_at <= now`, oldest expiry first.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<SlotLock> {
        let stale: Vec<SlotKey> = self
            .locks
            .iter()
            .filter(|(_, lock)| !lock.is_active_at(now))
            .map(|(slot, _)| *slot)
            .collect();

        let mut removed: Vec<SlotLock> = stale
            .iter()
            .filter_map(|slot| self.locks.remove(slot))
            .collect();
        removed.sort_by_key(|lock| (lock.expires_at, lock.slot()));
        removed
    }

    /// The lock on `slot`, expired or not
    #[must_use]
    pub fn get(&self, slot: &SlotKey) -> Option<&SlotLock> {
        self.locks.get(slot)
    }

    /// Mutable access to the lock on `slot`
    pub fn get_mut(&mut self, slot: &SlotKey) -> Option<&mut SlotLock> {
        self.locks.get_mut(slot)
    }

    /// The lock on `slot` if it is still active at `now`
    #[must_use]
    pub fn active(&self, slot: &SlotKey, now: DateTime<Utc>) -> Option<&SlotLock> {
        self.locks.get(slot).filter(|lock| lock.is_active_at(now))
    }

    /// True only for an unexpired lock, whether or not anything has reclaimed
    /// expired ones yet
    #[must_use]
    pub fn is_locked(&self, slot: &SlotKey, now: DateTime<Utc>) -> bool {
        self.active(slot, now).is_some()
    }

    /// Locks in the table, expired included
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Iterate over all locks
    pub fn iter(&self) -> impl Iterator<Item = &SlotLock> {
        self.locks.values()
    }
}
