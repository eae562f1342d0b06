mod error;
mod ledger;
mod reservation;
mod store;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use ledger::validate_draft;
pub use reservation::decide;
pub use store::{Transaction, decode_blocked_dates, decode_booked_slots, decode_document};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::model::*;
use crate::wal::Wal;

pub type SharedBooking = Arc<RwLock<BookingRecord>>;

/// The singleton availability row. `None` until first access creates it.
type AvailabilityRow = Arc<RwLock<Option<AvailabilitySettings>>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            // Flush what we have before handling a non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

/// Buffer the whole batch, then one fsync. Any error fails every commit in
/// the batch, and the WAL drops all of them from its buffer and the file, so
/// none can surface on disk later.
fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (commit, _) in batch {
        wal.append_buffered(commit)?;
    }
    wal.flush_sync()
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let result = wal.append_buffered(&commit).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity given to a lazily created availability record.
    pub default_capacity: u32,
    /// Upper bound on waiting for the availability lock.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_capacity: 1,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Engine {
    pub(super) availability: AvailabilityRow,
    pub(super) ledger: DashMap<BookingId, SharedBooking>,
    pub(super) next_booking_id: AtomicU64,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) config: EngineConfig,
}

/// Apply an availability event to a record. `updated_at` is left to the caller,
/// which stamps it once per commit.
pub(super) fn apply_to_settings(settings: &mut AvailabilitySettings, event: &Event) {
    match event {
        Event::AvailabilityInitialized { capacity } => {
            *settings = AvailabilitySettings::new(*capacity);
        }
        Event::AvailabilityOverwritten {
            fully_booked_dates,
            booked_slots,
            capacity,
        } => {
            settings.fully_booked_dates = fully_booked_dates.clone();
            settings.booked_slots = booked_slots.clone();
            settings.max_capacity_per_slot = *capacity;
        }
        Event::SlotIncremented { slot_key } => {
            let count = settings.booked_slots.entry(slot_key.clone()).or_insert(0);
            *count = count.saturating_add(1);
        }
        Event::SlotDecremented { slot_key } => match settings.booked_slots.get_mut(slot_key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                settings.booked_slots.remove(slot_key);
            }
            None => {}
        },
        Event::BookingInserted { .. } | Event::BookingPatched { .. } | Event::BookingCancelled { .. } => {}
    }
}

/// Apply a ledger mutation to an existing row.
pub(super) fn apply_to_booking(booking: &mut BookingRecord, event: &Event, at: Ms) {
    match event {
        Event::BookingPatched { patch, .. } => {
            if let Some(status) = &patch.status {
                booking.status = status.clone();
            }
            if let Some(t) = patch.arrival_time {
                booking.arrival_time = Some(t);
            }
            if let Some(t) = patch.start_time {
                booking.start_time = Some(t);
            }
            if let Some(t) = patch.end_time {
                booking.end_time = Some(t);
            }
            if let Some(m) = patch.work_duration_minutes {
                booking.work_duration_minutes = Some(m);
            }
            if let Some(note) = &patch.technician_note {
                booking.technician_note = Some(note.clone());
            }
            if let Some(cost) = patch.additional_cost {
                booking.additional_cost = Some(cost);
            }
            booking.updated_at = at;
        }
        Event::BookingCancelled { .. } => {
            booking.status = CANCELLED_STATUS.to_string();
            booking.updated_at = at;
        }
        _ => {}
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build (and report) an invariant violation. These are defects, so they are
/// logged loudly and counted, never folded into business outcomes.
pub(super) fn invariant_violation(msg: String) -> EngineError {
    tracing::error!("invariant violation: {msg}");
    metrics::counter!(crate::observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
    EngineError::InvariantViolation(msg)
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Rebuild with plain owned values first; nothing else can see them yet.
        let mut settings: Option<AvailabilitySettings> = None;
        let mut bookings: HashMap<BookingId, BookingRecord> = HashMap::new();
        for commit in &commits {
            let mut touched = false;
            for event in &commit.events {
                if event.touches_availability() {
                    let s = settings
                        .get_or_insert_with(|| AvailabilitySettings::new(config.default_capacity));
                    apply_to_settings(s, event);
                    touched = true;
                    continue;
                }
                match event {
                    Event::BookingInserted { booking } => {
                        bookings.insert(booking.id, booking.clone());
                    }
                    Event::BookingPatched { id, .. } | Event::BookingCancelled { id } => {
                        if let Some(b) = bookings.get_mut(id) {
                            apply_to_booking(b, event, commit.at);
                        } else {
                            tracing::warn!("replay: event for unknown booking {id} skipped");
                        }
                    }
                    _ => {}
                }
            }
            if touched && let Some(s) = settings.as_mut() {
                s.updated_at = commit.at;
            }
        }

        let next_id = bookings.keys().max().map_or(1, |max| max + 1);
        tracing::info!(
            "replayed {} commits from {}: {} bookings, availability {}",
            commits.len(),
            wal_path.display(),
            bookings.len(),
            if settings.is_some() { "present" } else { "absent" }
        );

        let ledger = DashMap::with_capacity(bookings.len());
        for (id, booking) in bookings {
            ledger.insert(id, Arc::new(RwLock::new(booking)));
        }

        Ok(Self {
            availability: Arc::new(RwLock::new(settings)),
            ledger,
            next_booking_id: AtomicU64::new(next_id),
            wal_tx,
            config,
        })
    }

    /// Hand a commit record to the WAL writer and wait until it is durable.
    ///
    /// A send failure means the record never left this task, so nothing was
    /// written: that is reported as `Transient`. Anything after the hand-off is
    /// `WalError`, because the bytes may or may not be on disk.
    pub(super) async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| EngineError::Transient("WAL writer unavailable".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL with just enough commits to recreate the current state.
    ///
    /// Holds the availability lock and a read lock on every booking until the
    /// new file is in place, so no commit can land in the old file after its
    /// state was snapshotted.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let row = tokio::time::timeout(self.config.lock_timeout, self.availability.clone().read_owned())
            .await
            .map_err(|_| EngineError::Transient("availability lock busy, compaction skipped".into()))?;

        let shared: Vec<SharedBooking> = self.ledger.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(shared.len());
        for booking in shared {
            guards.push(booking.read_owned().await);
        }
        guards.sort_by_key(|g| g.id);

        let mut commits = Vec::with_capacity(guards.len() + 1);
        if let Some(settings) = row.as_ref() {
            commits.push(Commit {
                at: settings.updated_at,
                events: vec![Event::AvailabilityOverwritten {
                    fully_booked_dates: settings.fully_booked_dates.clone(),
                    booked_slots: settings.booked_slots.clone(),
                    capacity: settings.max_capacity_per_slot,
                }],
            });
        }
        for guard in &guards {
            commits.push(Commit {
                at: guard.created_at,
                events: vec![Event::BookingInserted {
                    booking: (**guard).clone(),
                }],
            });
        }
        let count = commits.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::Transient("WAL writer unavailable".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        drop(guards);
        drop(row);
        tracing::info!("WAL compacted to {count} commits");
        Ok(())
    }
}
