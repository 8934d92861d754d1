use std::sync::Arc;

use bytes::Bytes;
use common::{
    codec::ValueCodec,
    Clock,
    Error,
    Result,
    SourceName,
    SourceWaterMarksClock,
};
use parking_lot::Mutex;
use storage::KeyValueStore;

use crate::{
    event::Event,
    log::Retention,
};

/// The write side of a retention store for one source: binds a key-value
/// put/delete to a retention-event append and a watermark advance so the
/// three appear atomic to readers.
///
/// All writes for the source serialize through this writer's lock.
/// Concurrent writers on different sources are independent.
pub struct RetentionStoreWriter<C: ValueCodec> {
    source: SourceName,
    coordinate: usize,
    retention: Arc<Retention>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<SourceWaterMarksClock>,
    codec: Arc<C>,
    write_lock: Mutex<()>,
}

impl<C: ValueCodec> RetentionStoreWriter<C> {
    pub(crate) fn new(
        source: SourceName,
        retention: Arc<Retention>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<SourceWaterMarksClock>,
        codec: Arc<C>,
    ) -> Result<Self> {
        let coordinate = clock.source_set().coordinate(&source)?;
        Ok(Self {
            source,
            coordinate,
            retention,
            store,
            clock,
            codec,
            write_lock: Mutex::new(()),
        })
    }

    pub fn source(&self) -> &SourceName {
        &self.source
    }

    pub fn put(&self, key: &[u8], value: &C::Value, scn: u64) -> Result<()> {
        let encoded = Bytes::from(self.codec.encode(value)?);
        self.apply(key, Some(encoded), scn)
    }

    /// Records a tombstone in the retention and removes the key from the
    /// store.
    pub fn delete(&self, key: &[u8], scn: u64) -> Result<()> {
        self.apply(key, None, scn)
    }

    pub fn get_high_water_mark(&self) -> Result<u64> {
        self.clock.high_water_mark(&self.source)
    }

    /// A snapshot of the writer's clock, for tests and diagnostics.
    pub fn clock_snapshot(&self) -> Clock {
        self.clock.current()
    }

    pub fn get_low_water_mark(&self) -> Result<u64> {
        self.clock.low_water_mark(&self.source)
    }

    /// Persists the store, the retention, and then the watermarks, in that
    /// order, so an acknowledged watermark never precedes its data.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.store.flush()?;
        self.retention.flush()?;
        self.clock.flush()
    }

    /// Persists retained history without advancing the low watermarks. Used
    /// by background sync.
    pub fn sync(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.retention.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    fn apply(&self, key: &[u8], value: Option<Bytes>, scn: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let high_water_mark = self.clock.high_water_mark(&self.source)?;
        if scn < high_water_mark {
            return Err(Error::ClockRegression {
                source_name: self.source.clone(),
                scn,
                high_water_mark,
            });
        }
        let event_clock = self
            .clock
            .current()
            .with_coordinate(self.coordinate, scn);
        self.retention.append(Event {
            key: Bytes::copy_from_slice(key),
            value: value.clone(),
            clock: event_clock,
            source: self.coordinate,
        })?;
        match &value {
            Some(value) => self.store.put(key, value)?,
            None => self.store.delete(key)?,
        }
        // The event and the store update are already applied; failing to
        // advance the watermark now leaves them unordered relative to
        // future writes.
        self.clock.advance(&self.source, scn).map_err(|e| {
            tracing::error!(
                "Watermark advance failed after applied write on {}: {e}",
                self.source
            );
            Error::InvariantViolation(format!(
                "watermark advance failed after applied write on {}: {e}",
                self.source
            ))
        })
    }
}
