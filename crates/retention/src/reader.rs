use std::sync::Arc;

use bytes::Bytes;
use common::{
    codec::ValueCodec,
    Clock,
    Error,
    Result,
    SourceName,
};
use storage::KeyValueStore;

use crate::{
    event::Event,
    log::Retention,
    position::Position,
};

/// A decoded change event as delivered to consumers. `value == None` is a
/// tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update<V> {
    pub key: Bytes,
    pub value: Option<V>,
    pub clock: Clock,
    pub source: SourceName,
}

/// The replay capability shared by single-source and composite readers:
/// resolve a clock to a cursor, then drain events from it.
pub trait RetentionReader {
    type Value;
    type Position;

    fn get_position(&self, clock: &Clock) -> Result<Self::Position>;

    /// Drains up to one batch of events into `out`, returning the advanced
    /// position. An empty drain with an unchanged position means "no new
    /// data yet"; never blocks.
    fn get(
        &self,
        position: &Self::Position,
        out: &mut Vec<Update<Self::Value>>,
    ) -> Result<Self::Position>;
}

/// The read side of a retention store for one source. Replays retained
/// history from a clock ("indexed"), then tails the log ("streaming"), and
/// serves point reads of current values through the paired key-value store.
pub struct RetentionStoreReader<C: ValueCodec> {
    source: SourceName,
    coordinate: usize,
    retention: Arc<Retention>,
    store: Arc<dyn KeyValueStore>,
    codec: Arc<C>,
    batch_size: usize,
}

impl<C: ValueCodec> RetentionStoreReader<C> {
    pub(crate) fn new(
        source: SourceName,
        retention: Arc<Retention>,
        store: Arc<dyn KeyValueStore>,
        codec: Arc<C>,
    ) -> Result<Self> {
        let coordinate = retention.source_set().coordinate(&source)?;
        let batch_size = retention.batch_size();
        Ok(Self {
            source,
            coordinate,
            retention,
            store,
            codec,
            batch_size,
        })
    }

    pub fn source(&self) -> &SourceName {
        &self.source
    }

    /// The current value for `key`, read through the key-value store. Point
    /// reads bypass the retention entirely.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<C::Value>> {
        self.store
            .get(key)?
            .map(|bytes| self.codec.decode(&bytes))
            .transpose()
    }

    fn decode(&self, event: Event) -> Result<Update<C::Value>> {
        let source = self
            .retention
            .source_set()
            .name(event.source)
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "event for unknown source coordinate {}",
                    event.source
                ))
            })?
            .clone();
        let value = event
            .value
            .as_deref()
            .map(|bytes| self.codec.decode(bytes))
            .transpose()?;
        Ok(Update {
            key: event.key,
            value,
            clock: event.clock,
            source,
        })
    }
}

impl<C: ValueCodec> RetentionReader for RetentionStoreReader<C> {
    type Position = Position;
    type Value = C::Value;

    fn get_position(&self, clock: &Clock) -> Result<Position> {
        self.retention.get_position(self.coordinate, clock)
    }

    fn get(&self, position: &Position, out: &mut Vec<Update<C::Value>>) -> Result<Position> {
        if position.source() != self.coordinate {
            return Err(Error::InvariantViolation(format!(
                "position for source coordinate {} used with reader for {}",
                position.source(),
                self.source
            )));
        }
        let (next, events) = self.retention.get(position, self.batch_size)?;
        out.reserve(events.len());
        for event in events {
            out.push(self.decode(event)?);
        }
        Ok(next)
    }
}
