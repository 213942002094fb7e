//! Scheduler defaults.

/// Consumer workers spawned when nothing else is configured.
pub const DEFAULT_CONSUMER_COUNT: usize = 3;

/// Seconds before an unfinished work item is canceled.
pub const DEFAULT_DUE_TIME_SECS: u64 = 5;

/// `max_queue_items` value meaning "no bound".
pub const UNBOUNDED_QUEUE_ITEMS: i64 = -1;

/// Due-times are configured in seconds and applied in milliseconds.
pub const SECONDS_MULTIPLIER_MS: u64 = 1000;
