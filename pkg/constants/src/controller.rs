//! Controller manager, informer and work queue defaults.

/// Number of reconciliation workers pulling from the work queue.
pub const DEFAULT_WORKERS: usize = 5;

/// How often the informer re-enqueues every known ReplicaSet, in seconds.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// First retry delay after a failed reconciliation, in milliseconds.
/// Doubles on every consecutive failure of the same key.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for the per-key retry delay, in seconds.
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// How many times a reconciliation re-reads and recomputes after a
/// resource-version conflict before reporting failure to the work queue.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Delay before the informer retries a failed relist, in milliseconds.
pub const RELIST_RETRY_DELAY_MS: u64 = 500;

/// Length of the random suffix appended to generated pod ids.
pub const POD_ID_SUFFIX_LEN: usize = 8;
