//! Tunable limits and parameters for the retention store.
//!
//! Every knob here can be overridden with an environment variable of the
//! same name and should have a comment explaining what it's for so it can
//! be adjusted safely.
#![deny(missing_docs)]

use std::sync::LazyLock;

use cmd_util::env::env_config;

/// Number of events an open retention batch accepts before it is sealed.
pub static RETENTION_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("RETENTION_BATCH_SIZE", 3000));

/// Number of sealed batches a retention keeps before evicting the oldest.
/// Together with `RETENTION_BATCH_SIZE` this bounds the replayable history.
pub static RETENTION_NUM_BATCHES: LazyLock<usize> =
    LazyLock::new(|| env_config("RETENTION_NUM_BATCHES", 20));

/// Size in MB at which a retention segment file is rotated. Eviction only
/// reclaims disk space one whole segment file at a time.
pub static RETENTION_SEGMENT_FILE_SIZE_MB: LazyLock<u64> =
    LazyLock::new(|| env_config("RETENTION_SEGMENT_FILE_SIZE_MB", 32));

/// Bytes of dead (overwritten or deleted) records the key-value log
/// tolerates before compacting in place.
pub static STORE_COMPACTION_THRESHOLD_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("STORE_COMPACTION_THRESHOLD_BYTES", 4 * 1024 * 1024));
