//! The change-retention subsystem: an append-only, segmented,
//! bounded-history stream of change events tagged with a logical clock, the
//! writer that couples it to a key-value store, and the readers that replay
//! and then tail it.
//!
//! Writers produce [`Event`]s into a [`Retention`] while updating the
//! paired key-value store and advancing the per-source watermarks. A
//! [`RetentionStoreReader`] catches a consumer up from an arbitrary clock,
//! transitioning from indexed reads over sealed batches to streaming reads
//! of the log tail. A [`CompositeRetentionStoreReader`] fans in several
//! single-source readers behind one cursor.

mod composite;
mod config;
mod event;
mod log;
mod policy;
mod position;
mod reader;
mod segment;
mod store;
mod writer;

#[cfg(test)]
mod tests;

pub use composite::CompositeRetentionStoreReader;
pub use config::RetentionConfig;
pub use event::{
    BatchId,
    Event,
    EventBatch,
};
pub use log::Retention;
pub use policy::{
    RetentionPolicy,
    RetentionPolicyOnAge,
    RetentionPolicyOnSize,
};
pub use position::{
    CompositePosition,
    Position,
};
pub use reader::{
    RetentionReader,
    RetentionStoreReader,
    Update,
};
pub use store::RetentionStore;
pub use writer::RetentionStoreWriter;
