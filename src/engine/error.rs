use crate::model::{BookingId, SlotKey, SlotSnapshot, UnavailableReason};
use crate::slot::FormatError;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed date, time, slot key, payload field, or persisted-map input.
    InvalidFormat(String),
    /// Expected business outcome: the user has to pick another slot or date.
    SlotUnavailable {
        slot_key: SlotKey,
        reason: UnavailableReason,
        snapshot: SlotSnapshot,
    },
    NotFound(BookingId),
    AlreadyCancelled(BookingId),
    /// Lifecycle rule broken by a patch (e.g. setting the cancelled status directly).
    IllegalTransition(String),
    /// Failed before anything was written. Safe to retry the whole transaction.
    Transient(String),
    /// A logic defect, never a user error.
    InvariantViolation(String),
    LimitExceeded(&'static str),
    /// The commit record reached the WAL writer but durability was not confirmed.
    /// The outcome is unknown; never retried automatically.
    WalError(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidFormat(_) => "invalid_format",
            EngineError::SlotUnavailable { reason, .. } => match reason {
                UnavailableReason::Full => "slot_full",
                UnavailableReason::DateBlocked => "date_blocked",
            },
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::IllegalTransition(_) => "illegal_transition",
            EngineError::Transient(_) => "transient",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidFormat(msg) => write!(f, "invalid format: {msg}"),
            EngineError::SlotUnavailable {
                slot_key,
                reason,
                snapshot,
            } => match reason {
                UnavailableReason::Full => write!(
                    f,
                    "{}: slot {slot_key} is full ({} of {} used)",
                    reason.code(),
                    snapshot.used,
                    snapshot.capacity
                ),
                UnavailableReason::DateBlocked => write!(
                    f,
                    "{}: date {} is fully booked",
                    reason.code(),
                    slot_key.date()
                ),
            },
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::IllegalTransition(msg) => write!(f, "illegal transition: {msg}"),
            EngineError::Transient(msg) => write!(f, "transient storage error: {msg}"),
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error (commit outcome unknown): {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<FormatError> for EngineError {
    fn from(e: FormatError) -> Self {
        EngineError::InvalidFormat(e.0)
    }
}
