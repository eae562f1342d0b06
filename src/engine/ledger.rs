use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, SharedBooking, Transaction, apply_to_booking, now_ms};

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidFormat(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(EngineError::InvalidFormat(format!(
            "{field} longer than {max} bytes"
        )));
    }
    Ok(())
}

fn check_status(status: &str) -> Result<(), EngineError> {
    check_text("status", status, MAX_STATUS_LEN)?;
    if status == CANCELLED_STATUS {
        return Err(EngineError::IllegalTransition(format!(
            "status {CANCELLED_STATUS:?} is only set by cancellation"
        )));
    }
    Ok(())
}

fn check_optional_fields(
    arrival_time: Option<Ms>,
    start_time: Option<Ms>,
    end_time: Option<Ms>,
    work_duration_minutes: Option<u32>,
    technician_note: Option<&str>,
) -> Result<(), EngineError> {
    if let (Some(start), Some(end)) = (start_time, end_time)
        && end < start
    {
        return Err(EngineError::InvalidFormat("end_time before start_time".into()));
    }
    if [arrival_time, start_time, end_time].iter().flatten().any(|t| *t < 0) {
        return Err(EngineError::InvalidFormat("timestamps must not be negative".into()));
    }
    if work_duration_minutes.is_some_and(|m| m > MAX_WORK_DURATION_MINUTES) {
        return Err(EngineError::InvalidFormat(format!(
            "work_duration_minutes above {MAX_WORK_DURATION_MINUTES}"
        )));
    }
    if technician_note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::InvalidFormat(format!(
            "technician_note longer than {MAX_NOTE_LEN} bytes"
        )));
    }
    Ok(())
}

/// Reject a booking payload before any lock is taken.
pub fn validate_draft(draft: &BookingDraft) -> Result<(), EngineError> {
    check_text("fullname", &draft.fullname, MAX_FIELD_LEN)?;
    check_text("whatsapp", &draft.whatsapp, MAX_FIELD_LEN)?;
    check_text("service", &draft.service, MAX_FIELD_LEN)?;
    check_text("address", &draft.address, MAX_FIELD_LEN)?;
    if !draft.lat.is_finite() || !(-90.0..=90.0).contains(&draft.lat) {
        return Err(EngineError::InvalidFormat(format!("lat out of range: {}", draft.lat)));
    }
    if !draft.lng.is_finite() || !(-180.0..=180.0).contains(&draft.lng) {
        return Err(EngineError::InvalidFormat(format!("lng out of range: {}", draft.lng)));
    }
    if let Some(status) = &draft.status {
        check_status(status)?;
    }
    check_optional_fields(
        draft.arrival_time,
        draft.start_time,
        draft.end_time,
        draft.work_duration_minutes,
        draft.technician_note.as_deref(),
    )
}

fn validate_patch(patch: &BookingPatch) -> Result<(), EngineError> {
    if let Some(status) = &patch.status {
        check_status(status)?;
    }
    check_optional_fields(
        patch.arrival_time,
        patch.start_time,
        patch.end_time,
        patch.work_duration_minutes,
        patch.technician_note.as_deref(),
    )
}

impl Transaction<'_> {
    /// Stage the ledger row for a slot this transaction just reserved.
    /// The id is final; it is only visible to others after commit.
    pub fn insert_booking(
        &mut self,
        draft: &BookingDraft,
        slot_key: &SlotKey,
    ) -> Result<BookingId, EngineError> {
        let Some(pos) = self.unclaimed.iter().position(|k| k == slot_key) else {
            return Err(super::invariant_violation(format!(
                "ledger insert for {slot_key} without a reservation in transaction {}",
                self.id()
            )));
        };
        self.unclaimed.swap_remove(pos);

        let id = self.engine.next_booking_id.fetch_add(1, Ordering::SeqCst);
        let now = now_ms();
        let booking = BookingRecord {
            id,
            fullname: draft.fullname.clone(),
            whatsapp: draft.whatsapp.clone(),
            service: draft.service.clone(),
            address: draft.address.clone(),
            lat: draft.lat,
            lng: draft.lng,
            status: draft
                .status
                .clone()
                .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
            schedule_date: slot_key.date().to_string(),
            schedule_time: slot_key.time().to_string(),
            slot_key: slot_key.clone(),
            arrival_time: draft.arrival_time,
            start_time: draft.start_time,
            end_time: draft.end_time,
            work_duration_minutes: draft.work_duration_minutes,
            technician_note: draft.technician_note.clone(),
            additional_cost: draft.additional_cost,
            created_at: now,
            updated_at: now,
        };
        self.stage(Event::BookingInserted { booking });
        Ok(id)
    }

    /// Lock a committed ledger row for the rest of this transaction.
    pub(super) async fn lock_booking(&mut self, id: BookingId) -> Result<&BookingRecord, EngineError> {
        let shared = self
            .engine
            .get_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        self.bookings.push(shared.write_owned().await);
        let guard = self
            .bookings
            .last()
            .ok_or_else(|| super::invariant_violation(format!("lost lock on booking {id}")))?;
        Ok(&**guard)
    }
}

impl Engine {
    pub(super) fn get_booking(&self, id: &BookingId) -> Option<SharedBooking> {
        self.ledger.get(id).map(|e| e.value().clone())
    }

    pub async fn booking(&self, id: BookingId) -> Option<BookingRecord> {
        let shared = self.get_booking(&id)?;
        let guard = shared.read().await;
        Some(guard.clone())
    }

    /// All ledger rows, ordered by id.
    pub async fn bookings(&self) -> Vec<BookingRecord> {
        let shared: Vec<SharedBooking> = self.ledger.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for booking in shared {
            out.push(booking.read().await.clone());
        }
        out.sort_by_key(|b| b.id);
        out
    }

    pub async fn bookings_for_slot(&self, slot_key: &SlotKey) -> Vec<BookingRecord> {
        let mut out = self.bookings().await;
        out.retain(|b| &b.slot_key == slot_key);
        out
    }

    /// Partial update from a downstream workflow. Never touches the slot and
    /// never re-checks capacity.
    pub async fn patch_booking(
        &self,
        id: BookingId,
        patch: BookingPatch,
    ) -> Result<BookingRecord, EngineError> {
        validate_patch(&patch)?;
        let shared = self.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = shared.write().await;
        if guard.is_cancelled() {
            return Err(EngineError::AlreadyCancelled(id));
        }
        if patch.is_empty() {
            return Ok(guard.clone());
        }

        let at = now_ms();
        let event = Event::BookingPatched { id, patch };
        self.wal_append(Commit {
            at,
            events: vec![event.clone()],
        })
        .await?;
        apply_to_booking(&mut guard, &event, at);
        Ok(guard.clone())
    }

    /// Cancel a booking and give its unit of capacity back, in one commit.
    pub async fn cancel_booking(&self, id: BookingId) -> Result<BookingRecord, EngineError> {
        let mut txn = self.begin().await?;
        let slot_key = {
            let booking = txn.lock_booking(id).await?;
            if booking.is_cancelled() {
                return Err(EngineError::AlreadyCancelled(id));
            }
            booking.slot_key.clone()
        };
        let used = txn.release(&slot_key)?;
        txn.stage(Event::BookingCancelled { id });
        txn.commit().await?;

        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!(booking_id = id, %slot_key, used, "booking cancelled");
        self.booking(id).await.ok_or(EngineError::NotFound(id))
    }

    /// Slots whose counter differs from the number of live ledger rows.
    /// Empty unless an administrative overwrite (or a defect) broke the link.
    pub async fn slot_drift(&self) -> Vec<SlotDrift> {
        let row = self.availability.read().await;
        let mut ledger_counts: BTreeMap<SlotKey, u32> = BTreeMap::new();
        let shared: Vec<SharedBooking> = self.ledger.iter().map(|e| e.value().clone()).collect();
        for booking in shared {
            let guard = booking.read().await;
            if !guard.is_cancelled() {
                *ledger_counts.entry(guard.slot_key.clone()).or_insert(0) += 1;
            }
        }

        let counters = row.as_ref().map(|s| s.booked_slots.clone()).unwrap_or_default();
        let mut keys: Vec<&SlotKey> = counters.keys().chain(ledger_counts.keys()).collect();
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .filter_map(|key| {
                let counter = counters.get(key).copied().unwrap_or(0);
                let ledger = ledger_counts.get(key).copied().unwrap_or(0);
                (counter != ledger).then(|| SlotDrift {
                    slot_key: key.clone(),
                    counter,
                    ledger,
                })
            })
            .collect()
    }
}
