use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use crate::slot::SlotKey;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Ledger row identity. Assigned at insert, strictly increasing in commit order.
pub type BookingId = u64;

/// Status given to a booking whose caller did not pick one.
pub const DEFAULT_STATUS: &str = "pending";

/// Terminal status set by cancellation. Only `cancel_booking` may set it.
pub const CANCELLED_STATUS: &str = "cancelled";

/// The singleton availability record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySettings {
    /// Dates with zero capacity regardless of counters.
    pub fully_booked_dates: BTreeSet<String>,
    /// Bookings already claimed per slot. Absent key means 0.
    pub booked_slots: BTreeMap<SlotKey, u32>,
    /// Same ceiling for every slot key.
    pub max_capacity_per_slot: u32,
    pub updated_at: Ms,
}

impl AvailabilitySettings {
    pub fn new(max_capacity_per_slot: u32) -> Self {
        Self {
            fully_booked_dates: BTreeSet::new(),
            booked_slots: BTreeMap::new(),
            max_capacity_per_slot,
            updated_at: 0,
        }
    }

    pub fn used(&self, key: &SlotKey) -> u32 {
        self.booked_slots.get(key).copied().unwrap_or(0)
    }

    pub fn is_date_blocked(&self, date: &str) -> bool {
        self.fully_booked_dates.contains(date)
    }
}

/// Administrative overwrite. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityUpdate {
    pub fully_booked_dates: Option<BTreeSet<String>>,
    pub booked_slots: Option<BTreeMap<SlotKey, u32>>,
    pub max_capacity_per_slot: Option<u32>,
}

impl AvailabilityUpdate {
    pub fn is_empty(&self) -> bool {
        self.fully_booked_dates.is_none()
            && self.booked_slots.is_none()
            && self.max_capacity_per_slot.is_none()
    }
}

/// Booking attributes supplied by the caller of `reserve_and_book`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookingDraft {
    pub fullname: String,
    pub whatsapp: String,
    pub service: String,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub schedule_date: String,
    pub schedule_time: String,
    pub status: Option<String>,
    pub arrival_time: Option<Ms>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub work_duration_minutes: Option<u32>,
    pub technician_note: Option<String>,
    pub additional_cost: Option<i64>,
}

/// One accepted booking in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: BookingId,
    pub fullname: String,
    pub whatsapp: String,
    pub service: String,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub status: String,
    pub schedule_date: String,
    pub schedule_time: String,
    pub slot_key: SlotKey,
    pub arrival_time: Option<Ms>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub work_duration_minutes: Option<u32>,
    pub technician_note: Option<String>,
    /// Minor currency units.
    pub additional_cost: Option<i64>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl BookingRecord {
    pub fn is_cancelled(&self) -> bool {
        self.status == CANCELLED_STATUS
    }
}

/// Partial update applied by downstream workflows. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookingPatch {
    pub status: Option<String>,
    pub arrival_time: Option<Ms>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub work_duration_minutes: Option<u32>,
    pub technician_note: Option<String>,
    pub additional_cost: Option<i64>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        *self == BookingPatch::default()
    }
}

// ── Reservation results ──────────────────────────────────────────

/// Outcome of the reservation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Ok,
    Full,
    DateBlocked,
}

impl ReservationStatus {
    pub fn label(self) -> &'static str {
        match self {
            ReservationStatus::Ok => "ok",
            ReservationStatus::Full => "full",
            ReservationStatus::DateBlocked => "date_blocked",
        }
    }
}

/// Why a slot could not be claimed. Fixable only by the user picking another slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    Full,
    DateBlocked,
}

impl UnavailableReason {
    /// Machine-readable reason code surfaced to callers.
    pub fn code(self) -> &'static str {
        match self {
            UnavailableReason::Full => "SLOT_FULL",
            UnavailableReason::DateBlocked => "DATE_NOT_AVAILABLE",
        }
    }
}

/// Capacity view of one slot at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub capacity: u32,
    pub used: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub status: ReservationStatus,
    pub slot_key: SlotKey,
    pub snapshot: SlotSnapshot,
}

/// Successful `reserve_and_book` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking_id: BookingId,
    pub slot_key: SlotKey,
    pub capacity: u32,
    pub used: u32,
    pub remaining: u32,
}

/// A slot whose counter disagrees with the number of live ledger rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDrift {
    pub slot_key: SlotKey,
    pub counter: u32,
    pub ledger: u32,
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types. Flat, no nesting. Only ever persisted inside a [`Commit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    AvailabilityInitialized {
        capacity: u32,
    },
    AvailabilityOverwritten {
        fully_booked_dates: BTreeSet<String>,
        booked_slots: BTreeMap<SlotKey, u32>,
        capacity: u32,
    },
    SlotIncremented {
        slot_key: SlotKey,
    },
    SlotDecremented {
        slot_key: SlotKey,
    },
    BookingInserted {
        booking: BookingRecord,
    },
    BookingPatched {
        id: BookingId,
        patch: BookingPatch,
    },
    BookingCancelled {
        id: BookingId,
    },
}

impl Event {
    /// True for events that mutate the availability record.
    pub fn touches_availability(&self) -> bool {
        matches!(
            self,
            Event::AvailabilityInitialized { .. }
                | Event::AvailabilityOverwritten { .. }
                | Event::SlotIncremented { .. }
                | Event::SlotDecremented { .. }
        )
    }
}

/// All events of one transaction. One WAL entry, so it replays whole or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub at: Ms,
    pub events: Vec<Event>,
}
