use std::io;

use crate::source::SourceName;

/// Errors surfaced by the retention store. The predictable protocol outcomes
/// (`ClockRegression`, `RetentionExhausted`) are first-class variants so
/// callers can match on them instead of parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The writer presented a sequence number behind its source's high
    /// watermark. The write is rejected and no state changes.
    #[error(
        "sequence number {scn} for source {source_name} regresses the high watermark \
         {high_water_mark}"
    )]
    ClockRegression {
        source_name: SourceName,
        scn: u64,
        high_water_mark: u64,
    },

    /// An append would exceed the batch capacity. Internal; the retention
    /// responds by sealing the batch and starting a new one.
    #[error("event batch is full ({capacity} events)")]
    BatchFull { capacity: usize },

    /// The requested replay clock predates evicted history. The consumer
    /// must resync from a store snapshot.
    #[error(
        "clock {requested} for source {source_name} predates retained history (floor {floor})"
    )]
    RetentionExhausted {
        source_name: SourceName,
        requested: u64,
        floor: u64,
    },

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// A persisted record failed its checksum or framing checks.
    #[error("corrupt record: {0}")]
    Corruption(String),

    #[error("unknown source {0}")]
    UnknownSource(SourceName),

    #[error("invalid source name: {0}")]
    InvalidSourceName(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A broken internal invariant. Fatal; the owning writer must stop.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_retention_exhausted(&self) -> bool {
        matches!(self, Error::RetentionExhausted { .. })
    }

    pub fn is_clock_regression(&self) -> bool {
        matches!(self, Error::ClockRegression { .. })
    }

    pub fn is_batch_full(&self) -> bool {
        matches!(self, Error::BatchFull { .. })
    }
}
