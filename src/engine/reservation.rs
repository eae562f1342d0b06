use tracing::{debug, info, warn};

use crate::model::*;
use crate::slot::date_of;

use super::{Engine, EngineError, Transaction, invariant_violation, validate_draft};

/// The reservation decision, without side effects.
///
/// Blocked dates win over counters. An `Ok` result reports the counts as they
/// will be after the increment.
pub fn decide(settings: &AvailabilitySettings, slot_key: &SlotKey) -> Reservation {
    let capacity = settings.max_capacity_per_slot;
    let (status, used, remaining) = if settings.is_date_blocked(date_of(slot_key)) {
        (ReservationStatus::DateBlocked, 0, 0)
    } else {
        let used = settings.used(slot_key);
        if used >= capacity {
            (ReservationStatus::Full, used, 0)
        } else {
            (ReservationStatus::Ok, used + 1, capacity - (used + 1))
        }
    };
    Reservation {
        status,
        slot_key: slot_key.clone(),
        snapshot: SlotSnapshot {
            capacity,
            used,
            remaining,
        },
    }
}

impl Transaction<'_> {
    /// Claim one unit of capacity on `slot_key` if the slot is open.
    ///
    /// At most one increment per call, never a decrement. `Full` and
    /// `DateBlocked` stage nothing.
    pub fn reserve(&mut self, slot_key: &SlotKey) -> Result<Reservation, EngineError> {
        let reservation = decide(self.settings(), slot_key);
        if reservation.status == ReservationStatus::Ok {
            let before = self.settings().used(slot_key);
            self.stage(Event::SlotIncremented {
                slot_key: slot_key.clone(),
            });
            let after = self.settings().used(slot_key);
            if after != before + 1 || after > self.settings().max_capacity_per_slot {
                return Err(invariant_violation(format!(
                    "slot {slot_key} moved from {before} to {after} with capacity {}",
                    self.settings().max_capacity_per_slot
                )));
            }
            self.unclaimed.push(slot_key.clone());
        }
        metrics::counter!(
            crate::observability::RESERVATIONS_TOTAL,
            "outcome" => reservation.status.label()
        )
        .increment(1);
        debug!(
            txn = %self.id(),
            %slot_key,
            outcome = reservation.status.label(),
            used = reservation.snapshot.used,
            capacity = reservation.snapshot.capacity,
            "reservation decided"
        );
        Ok(reservation)
    }

    /// Give back one unit of capacity. Only cancellation calls this.
    pub(super) fn release(&mut self, slot_key: &SlotKey) -> Result<u32, EngineError> {
        let used = self.settings().used(slot_key);
        if used == 0 {
            return Err(invariant_violation(format!(
                "slot {slot_key} has a live booking but its counter is already 0"
            )));
        }
        self.stage(Event::SlotDecremented {
            slot_key: slot_key.clone(),
        });
        Ok(used - 1)
    }
}

impl Engine {
    /// Reserve the draft's slot and record the booking in one commit.
    ///
    /// A transient failure (which by construction happened before anything
    /// was written) gets exactly one fresh attempt. `SlotUnavailable` is never
    /// retried here: the user has to choose another slot.
    pub async fn reserve_and_book(&self, draft: BookingDraft) -> Result<BookingReceipt, EngineError> {
        validate_draft(&draft)?;
        let slot_key = SlotKey::new(&draft.schedule_date, &draft.schedule_time)?;

        match self.try_reserve_and_book(&slot_key, &draft).await {
            Err(e) if e.is_transient() => {
                warn!(%slot_key, "reservation failed before any write, retrying once: {e}");
                metrics::counter!(crate::observability::RESERVATION_RETRIES_TOTAL).increment(1);
                self.try_reserve_and_book(&slot_key, &draft).await
            }
            other => other,
        }
    }

    async fn try_reserve_and_book(
        &self,
        slot_key: &SlotKey,
        draft: &BookingDraft,
    ) -> Result<BookingReceipt, EngineError> {
        let mut txn = self.begin().await?;
        let reservation = txn.reserve(slot_key)?;

        let reason = match reservation.status {
            ReservationStatus::Ok => None,
            ReservationStatus::Full => Some(UnavailableReason::Full),
            ReservationStatus::DateBlocked => Some(UnavailableReason::DateBlocked),
        };
        if let Some(reason) = reason {
            txn.rollback();
            return Err(EngineError::SlotUnavailable {
                slot_key: slot_key.clone(),
                reason,
                snapshot: reservation.snapshot,
            });
        }

        let booking_id = txn.insert_booking(draft, slot_key)?;
        txn.commit().await?;

        let SlotSnapshot {
            capacity,
            used,
            remaining,
        } = reservation.snapshot;
        info!(booking_id, %slot_key, used, capacity, "booking reserved");
        Ok(BookingReceipt {
            booking_id,
            slot_key: slot_key.clone(),
            capacity,
            used,
            remaining,
        })
    }
}
