//! Availability store: the locked unit of work over the singleton record, the
//! administrative overwrite path, and the decode boundary for externally
//! supplied blocked-date sets and counter maps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::slot::validate_date;

use super::{Engine, EngineError, apply_to_booking, apply_to_settings, now_ms};

/// An open unit of work holding the exclusive lock on the availability record.
///
/// Reads see the staged state. Nothing reaches the shared state or the WAL until
/// [`Transaction::commit`]; dropping the transaction (or calling
/// [`Transaction::rollback`]) discards everything staged.
pub struct Transaction<'a> {
    pub(super) engine: &'a Engine,
    pub(super) id: Ulid,
    pub(super) row: OwnedRwLockWriteGuard<Option<AvailabilitySettings>>,
    pub(super) working: AvailabilitySettings,
    pub(super) staged: Vec<Event>,
    /// Booking rows locked by this transaction (always after the availability lock).
    pub(super) bookings: Vec<OwnedRwLockWriteGuard<BookingRecord>>,
    /// Slots granted by `reserve` and not yet claimed by a ledger insert.
    pub(super) unclaimed: Vec<SlotKey>,
    /// True when the record did not exist and this transaction created it.
    pub(super) fresh: bool,
}

impl<'a> Transaction<'a> {
    fn new(engine: &'a Engine, row: OwnedRwLockWriteGuard<Option<AvailabilitySettings>>) -> Self {
        let mut txn = Self {
            engine,
            id: Ulid::new(),
            working: AvailabilitySettings::new(engine.config.default_capacity),
            row,
            staged: Vec::new(),
            bookings: Vec::new(),
            unclaimed: Vec::new(),
            fresh: false,
        };
        let current = txn.row.as_ref().cloned();
        match current {
            Some(current) => txn.working = current,
            None => {
                txn.fresh = true;
                txn.stage(Event::AvailabilityInitialized {
                    capacity: engine.config.default_capacity,
                });
            }
        }
        txn
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    /// The availability record as this transaction sees it.
    pub fn settings(&self) -> &AvailabilitySettings {
        &self.working
    }

    /// Whether the record was created by this transaction.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub(super) fn stage(&mut self, event: Event) {
        if event.touches_availability() {
            apply_to_settings(&mut self.working, &event);
        }
        self.staged.push(event);
    }

    /// Replace blocked dates, counters and/or capacity. Unset fields keep their value.
    pub fn overwrite(&mut self, update: AvailabilityUpdate) -> Result<(), EngineError> {
        let capacity = update
            .max_capacity_per_slot
            .unwrap_or(self.working.max_capacity_per_slot);
        validate_capacity(capacity)?;

        let dates = match update.fully_booked_dates {
            Some(dates) => dates,
            None => self.working.fully_booked_dates.clone(),
        };
        if dates.len() > MAX_BLOCKED_DATES {
            return Err(EngineError::LimitExceeded("too many blocked dates"));
        }
        for date in &dates {
            validate_date(date)?;
        }

        let slots = match update.booked_slots {
            Some(slots) => slots,
            None => self.working.booked_slots.clone(),
        };
        if slots.len() > MAX_SLOT_KEYS {
            return Err(EngineError::LimitExceeded("too many slot keys"));
        }
        if let Some((key, count)) = slots.iter().find(|(_, count)| **count > capacity) {
            return Err(EngineError::InvalidFormat(format!(
                "count {count} for slot {key} exceeds capacity {capacity}"
            )));
        }
        let slots: BTreeMap<SlotKey, u32> = slots.into_iter().filter(|(_, c)| *c > 0).collect();

        self.stage(Event::AvailabilityOverwritten {
            fully_booked_dates: dates,
            booked_slots: slots,
            capacity,
        });
        Ok(())
    }

    /// Discard everything staged and release the locks.
    pub fn rollback(self) {
        if !self.staged.is_empty() {
            debug!(txn = %self.id, "rolled back {} staged events", self.staged.len());
        }
    }

    /// Persist all staged events as one WAL record, then publish them.
    /// Returns the availability record as committed.
    pub async fn commit(self) -> Result<AvailabilitySettings, EngineError> {
        let Transaction {
            engine,
            id,
            mut row,
            mut working,
            staged,
            mut bookings,
            unclaimed,
            ..
        } = self;

        if !unclaimed.is_empty() {
            return Err(super::invariant_violation(format!(
                "transaction {id} reserved {} slot(s) without a ledger entry",
                unclaimed.len()
            )));
        }
        if staged.is_empty() {
            return Ok(working);
        }

        let at = now_ms();
        let touched = staged.iter().any(Event::touches_availability);
        let commit = Commit { at, events: staged };
        engine.wal_append(commit.clone()).await?;

        // Durable. Publish while every lock is still held.
        if touched {
            working.updated_at = at;
            *row = Some(working.clone());
        }
        for event in commit.events {
            match event {
                Event::BookingInserted { booking } => {
                    engine.ledger.insert(booking.id, Arc::new(RwLock::new(booking)));
                }
                Event::BookingPatched { id, .. } | Event::BookingCancelled { id } => {
                    if let Some(guard) = bookings.iter_mut().find(|g| g.id == id) {
                        apply_to_booking(guard, &event, at);
                    }
                }
                _ => {}
            }
        }
        debug!(txn = %id, "committed at {at}");
        Ok(working)
    }
}

pub(super) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidFormat(
            "max capacity per slot must be positive".into(),
        ));
    }
    if capacity > MAX_CAPACITY_PER_SLOT {
        return Err(EngineError::LimitExceeded("capacity per slot too large"));
    }
    Ok(())
}

impl Engine {
    /// Open a unit of work: take the exclusive lock on the availability record,
    /// then read it (creating it if absent).
    pub async fn begin(&self) -> Result<Transaction<'_>, EngineError> {
        let started = Instant::now();
        let row = tokio::time::timeout(
            self.config.lock_timeout,
            self.availability.clone().write_owned(),
        )
        .await
        .map_err(|_| {
            EngineError::Transient(format!(
                "availability lock not acquired within {}ms",
                self.config.lock_timeout.as_millis()
            ))
        })?;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(Transaction::new(self, row))
    }

    /// Current availability record. Creates and persists the default record on
    /// first access.
    pub async fn load(&self) -> Result<AvailabilitySettings, EngineError> {
        if let Some(settings) = self.availability.read().await.as_ref() {
            return Ok(settings.clone());
        }
        self.begin().await?.commit().await
    }

    /// Administrative overwrite. Goes through the same exclusive lock as
    /// reservations but is not slot aware: the caller is trusted.
    pub async fn save(&self, update: AvailabilityUpdate) -> Result<AvailabilitySettings, EngineError> {
        let mut txn = self.begin().await?;
        txn.overwrite(update)?;
        let settings = txn.commit().await?;
        info!(
            blocked_dates = settings.fully_booked_dates.len(),
            slot_keys = settings.booked_slots.len(),
            capacity = settings.max_capacity_per_slot,
            "availability overwritten"
        );
        Ok(settings)
    }

    /// Write `update` only if no availability record exists yet.
    pub async fn seed_if_absent(&self, update: AvailabilityUpdate) -> Result<bool, EngineError> {
        let mut txn = self.begin().await?;
        if !txn.is_fresh() {
            txn.rollback();
            return Ok(false);
        }
        txn.overwrite(update)?;
        txn.commit().await?;
        info!("availability seeded");
        Ok(true)
    }
}

// ── Decode boundary ──────────────────────────────────────

/// Decode a counter map from JSON.
///
/// Accepts the legacy list form (`["2025-06-01-09:00", ...]`, count is the
/// number of occurrences) or an object of slot key to count. Malformed keys,
/// non-string list entries, and counts that are not non-negative integers are
/// rejected. Zero counts are dropped.
pub fn decode_booked_slots(value: &Value) -> Result<BTreeMap<SlotKey, u32>, EngineError> {
    let mut slots = BTreeMap::new();
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let text = item.as_str().ok_or_else(|| {
                    EngineError::InvalidFormat(format!("booked slot entry #{i} is not a string: {item}"))
                })?;
                let key = SlotKey::parse(text)?;
                let count: &mut u32 = slots.entry(key).or_insert(0);
                *count = count
                    .checked_add(1)
                    .ok_or(EngineError::LimitExceeded("slot count overflow"))?;
            }
        }
        Value::Object(map) => {
            for (text, raw) in map {
                let key = SlotKey::parse(text)?;
                let count = raw
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| {
                        EngineError::InvalidFormat(format!(
                            "count for slot {key} must be a non-negative integer, got {raw}"
                        ))
                    })?;
                if count > 0 {
                    slots.insert(key, count);
                }
            }
        }
        other => {
            return Err(EngineError::InvalidFormat(format!(
                "booked slots must be a list or an object, got {other}"
            )));
        }
    }
    if slots.len() > MAX_SLOT_KEYS {
        return Err(EngineError::LimitExceeded("too many slot keys"));
    }
    Ok(slots)
}

/// Decode a blocked-date set from a JSON list of `YYYY-MM-DD` strings.
pub fn decode_blocked_dates(value: &Value) -> Result<BTreeSet<String>, EngineError> {
    let items = match value {
        Value::Null => return Ok(BTreeSet::new()),
        Value::Array(items) => items,
        other => {
            return Err(EngineError::InvalidFormat(format!(
                "fully booked dates must be a list, got {other}"
            )));
        }
    };
    if items.len() > MAX_BLOCKED_DATES {
        return Err(EngineError::LimitExceeded("too many blocked dates"));
    }
    let mut dates = BTreeSet::new();
    for item in items {
        let text = item.as_str().ok_or_else(|| {
            EngineError::InvalidFormat(format!("blocked date is not a string: {item}"))
        })?;
        validate_date(text)?;
        dates.insert(text.to_string());
    }
    Ok(dates)
}

/// Decode a whole availability document:
/// `{"fullyBookedDates": [...], "bookedSlots": [...] | {...}, "maxCapacityPerSlot": n}`.
/// Missing keys stay unset in the returned update.
pub fn decode_document(json: &str) -> Result<AvailabilityUpdate, EngineError> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| EngineError::InvalidFormat(format!("availability document: {e}")))?;
    let obj = doc.as_object().ok_or_else(|| {
        EngineError::InvalidFormat("availability document must be a JSON object".into())
    })?;

    let mut update = AvailabilityUpdate::default();
    if let Some(v) = obj.get("fullyBookedDates") {
        update.fully_booked_dates = Some(decode_blocked_dates(v)?);
    }
    if let Some(v) = obj.get("bookedSlots") {
        update.booked_slots = Some(decode_booked_slots(v)?);
    }
    if let Some(v) = obj.get("maxCapacityPerSlot") {
        let capacity = v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                EngineError::InvalidFormat(format!("maxCapacityPerSlot must be a positive integer, got {v}"))
            })?;
        validate_capacity(capacity)?;
        update.max_capacity_per_slot = Some(capacity);
    }
    Ok(update)
}
