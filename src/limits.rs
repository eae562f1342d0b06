//! Hard limits on input sizes. Everything arriving over the wire is checked
//! against these before it reaches the engine.

/// Max length of a free-text booking field (name, phone, service, address).
pub const MAX_FIELD_LEN: usize = 512;

/// Max length of the technician note.
pub const MAX_NOTE_LEN: usize = 4096;

/// Max length of a status value.
pub const MAX_STATUS_LEN: usize = 64;

/// Max number of dates in the fully-booked set.
pub const MAX_BLOCKED_DATES: usize = 10_000;

/// Max number of distinct slot keys tracked by the counter map.
pub const MAX_SLOT_KEYS: usize = 100_000;

/// Upper bound for the per-slot capacity.
pub const MAX_CAPACITY_PER_SLOT: u32 = 100_000;

/// Upper bound for a reported work duration (one week).
pub const MAX_WORK_DURATION_MINUTES: u32 = 7 * 24 * 60;

/// Max accepted SQL statement length.
pub const MAX_SQL_LEN: usize = 1024 * 1024;
