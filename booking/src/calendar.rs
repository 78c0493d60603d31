//! Provider calendars and derived slots.
//!
//! A [`Provider`] is the booking engine's snapshot of a doctor's calendar.
//! Bookable slots are never stored: they are derived on demand from the
//! weekly schedule, minus slots already occupied by an appointment, with
//! slots under an active lock marked as such.

use crate::types::{ConsultationType, Money, ProviderId, SlotKey, hhmm};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest slot a schedule may define.
pub const MAX_SLOT_MINUTES: u32 = 240;

// ============================================================================
// Schedule
// ============================================================================

/// A break inside a working day (`[start, end)`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakWindow {
    /// Break start
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// Break end
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl BreakWindow {
    fn overlaps(&self, start: NaiveTime, end: NaiveTime) -> bool {
        start < self.end && self.start < end
    }
}

/// Working hours for one weekday.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    /// Whether the provider works this day
    pub is_working: bool,
    /// First slot start
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    /// No slot may end after this
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// Breaks with no slots
    #[serde(default)]
    pub breaks: Vec<BreakWindow>,
}

impl DaySchedule {
    /// 09:00 to 17:00 with a lunch break from 12:00 to 13:00.
    #[must_use]
    pub fn working() -> Self {
        Self {
            is_working: true,
            start: at(9, 0),
            end: at(17, 0),
            breaks: vec![BreakWindow {
                start: at(12, 0),
                end: at(13, 0),
            }],
        }
    }

    /// A day off.
    #[must_use]
    pub fn off() -> Self {
        Self {
            is_working: false,
            start: at(9, 0),
            end: at(17, 0),
            breaks: Vec::new(),
        }
    }
}

/// Weekly template the slots are generated from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    /// Monday
    pub monday: DaySchedule,
    /// Tuesday
    pub tuesday: DaySchedule,
    /// Wednesday
    pub wednesday: DaySchedule,
    /// Thursday
    pub thursday: DaySchedule,
    /// Friday
    pub friday: DaySchedule,
    /// Saturday
    pub saturday: DaySchedule,
    /// Sunday
    pub sunday: DaySchedule,
    /// Length of every slot
    pub slot_duration_minutes: u32,
}

impl Default for WeeklySchedule {
    /// Monday to Friday, 09:00 to 17:00, lunch 12:00 to 13:00, 30-minute slots.
    fn default() -> Self {
        Self {
            monday: DaySchedule::working(),
            tuesday: DaySchedule::working(),
            wednesday: DaySchedule::working(),
            thursday: DaySchedule::working(),
            friday: DaySchedule::working(),
            saturday: DaySchedule::off(),
            sunday: DaySchedule::off(),
            slot_duration_minutes: 30,
        }
    }
}

impl WeeklySchedule {
    /// Schedule for a weekday
    #[must_use]
    pub const fn day(&self, weekday: Weekday) -> &DaySchedule {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    fn days(&self) -> [(Weekday, &DaySchedule); 7] {
        [
            (Weekday::Mon, &self.monday),
            (Weekday::Tue, &self.tuesday),
            (Weekday::Wed, &self.wednesday),
            (Weekday::Thu, &self.thursday),
            (Weekday::Fri, &self.friday),
            (Weekday::Sat, &self.saturday),
            (Weekday::Sun, &self.sunday),
        ]
    }

    /// `(start, end)` of every slot on `date`, breaks excluded.
    #[must_use]
    pub fn slot_times(&self, date: NaiveDate) -> Vec<(NaiveTime, NaiveTime)> {
        let day = self.day(date.weekday());
        if !day.is_working || self.slot_duration_minutes == 0 {
            return Vec::new();
        }

        let step = Duration::minutes(i64::from(self.slot_duration_minutes));
        let mut slots = Vec::new();
        let mut start = day.start;

        loop {
            let (end, wrapped) = start.overflowing_add_signed(step);
            if wrapped != 0 || end > day.end {
                break;
            }
            if !day.breaks.iter().any(|b| b.overlaps(start, end)) {
                slots.push((start, end));
            }
            start = end;
        }

        slots
    }

    /// Reject schedules that cannot produce sensible slots.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.slot_duration_minutes == 0 || self.slot_duration_minutes > MAX_SLOT_MINUTES {
            return Err(format!(
                "Slot duration must be between 1 and {MAX_SLOT_MINUTES} minutes (got {})",
                self.slot_duration_minutes
            ));
        }

        for (weekday, day) in self.days() {
            if !day.is_working {
                continue;
            }
            if day.start >= day.end {
                return Err(format!("{weekday}: start must be before end"));
            }
            for window in &day.breaks {
                if window.start >= window.end {
                    return Err(format!("{weekday}: break start must be before break end"));
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Fees per consultation type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationFees {
    /// Online consultation fee
    pub online: Money,
    /// In-person consultation fee
    pub in_person: Money,
}

impl ConsultationFees {
    /// Fee for a consultation type
    #[must_use]
    pub const fn for_type(&self, consultation_type: ConsultationType) -> Money {
        match consultation_type {
            ConsultationType::Online => self.online,
            ConsultationType::InPerson => self.in_person,
        }
    }
}

/// Booking-relevant snapshot of a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Provider ID
    pub id: ProviderId,
    /// Display name
    pub name: String,
    /// Weekly template
    pub schedule: WeeklySchedule,
    /// Fees
    pub fees: ConsultationFees,
    /// Consultation types the provider offers
    pub consultation_types: Vec<ConsultationType>,
    /// Accepting bookings right now
    pub is_online: bool,
    /// Allows pay-at-clinic settlement
    pub allows_deferred_settlement: bool,
}

impl Provider {
    /// Whether the provider offers this consultation type
    #[must_use]
    pub fn offers(&self, consultation_type: ConsultationType) -> bool {
        self.consultation_types.contains(&consultation_type)
    }

    /// Whether `time` is the start of a generated slot on `date`
    #[must_use]
    pub fn has_slot_at(&self, date: NaiveDate, time: NaiveTime) -> bool {
        self.schedule
            .slot_times(date)
            .iter()
            .any(|(start, _)| *start == time)
    }

    /// Reject snapshots that cannot be booked against.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Provider name must not be empty".to_string());
        }
        if self.consultation_types.is_empty() {
            return Err("Provider must offer at least one consultation type".to_string());
        }
        self.schedule.validate()
    }
}

// ============================================================================
// Derived slots
// ============================================================================

/// A bookable slot, computed from the schedule (never stored).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSlot {
    /// Provider
    pub provider_id: ProviderId,
    /// Date
    pub date: NaiveDate,
    /// Slot start
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    /// Slot end
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    /// Requested consultation type
    pub consultation_type: ConsultationType,
    /// Someone is in the middle of booking this slot
    pub locked: bool,
}

/// Slots for one provider and date.
///
/// Occupied slots are left out; slots under an active lock are kept with
/// `locked = true`. A provider that does not offer `consultation_type` has
/// no slots.
pub fn derive_slots<O, L>(
    provider: &Provider,
    date: NaiveDate,
    consultation_type: ConsultationType,
    is_occupied: O,
    is_locked: L,
) -> Vec<CalendarSlot>
where
    O: Fn(&SlotKey) -> bool,
    L: Fn(&SlotKey) -> bool,
{
    if !provider.offers(consultation_type) {
        return Vec::new();
    }

    provider
        .schedule
        .slot_times(date)
        .into_iter()
        .filter_map(|(start_time, end_time)| {
            let key = SlotKey::new(provider.id, date, start_time);
            if is_occupied(&key) {
                return None;
            }
            Some(CalendarSlot {
                provider_id: provider.id,
                date,
                start_time,
                end_time,
                consultation_type,
                locked: is_locked(&key),
            })
        })
        .collect()
}

/// [`derive_slots`] for `days` consecutive dates starting at `start_date`.
pub fn weekly_slots<O, L>(
    provider: &Provider,
    start_date: NaiveDate,
    days: u32,
    consultation_type: ConsultationType,
    is_occupied: O,
    is_locked: L,
) -> BTreeMap<NaiveDate, Vec<CalendarSlot>>
where
    O: Fn(&SlotKey) -> bool,
    L: Fn(&SlotKey) -> bool,
{
    start_date
        .iter_days()
        .take(days as usize)
        .map(|date| {
            let slots = derive_slots(provider, date, consultation_type, &is_occupied, &is_locked);
            (date, slots)
        })
        .collect()
}

fn at(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}
