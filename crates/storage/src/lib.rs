//! The key-value store boundary of the retention store: the persistent
//! mapping that holds the latest value per key, independent of retention
//! eviction.

use bytes::Bytes;
use common::Result;

mod log_store;
mod memory;

pub use log_store::LogStore;
pub use memory::MemoryStore;

/// The persistent latest-value mapping a retention is paired with. No
/// ordering across keys is required.
pub trait KeyValueStore: Send + Sync + 'static {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// A point-in-time copy of all live entries.
    fn snapshot(&self) -> Result<Vec<(Bytes, Bytes)>>;

    /// Durably persists all acknowledged writes.
    fn flush(&self) -> Result<()>;

    /// Flushes and rejects all subsequent writes.
    fn close(&self) -> Result<()>;
}
