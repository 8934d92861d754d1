use std::{
    io::Read,
    sync::Arc,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use bytes::Bytes;
use common::{
    Clock,
    Error,
    Result,
    SourceSet,
};

/// Dense id of a sealed batch within its retention.
pub type BatchId = u64;

/// Tombstones are encoded with this sentinel in place of a value length.
const TOMBSTONE_LEN: u32 = u32::MAX;

/// One change record: the unit read by consumers. `value == None` is a
/// tombstone. The clock is the writer's clock at the moment of the put, and
/// `source` is the coordinate of the writer that produced the event, so a
/// retention shared by several writers can be replayed per source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub clock: Clock,
    pub source: usize,
}

/// A capacity-bounded, append-only run of events, sealed when full.
///
/// Within a batch, clocks are monotonically non-decreasing on each writer's
/// own source coordinate. The batch records the first event's clock, the
/// coordinate-wise maximum clock, and its creation time, and serializes as
/// a single length-prefixed segment record.
#[derive(Clone, Debug)]
pub struct EventBatch {
    batch_id: BatchId,
    sources: Arc<SourceSet>,
    capacity: usize,
    created_at_ms: u64,
    events: Vec<Event>,
    min_clock: Clock,
    max_clock: Clock,
    sealed: bool,
}

impl EventBatch {
    pub fn new(batch_id: BatchId, sources: Arc<SourceSet>, capacity: usize) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            batch_id,
            sources,
            capacity,
            created_at_ms,
            events: Vec::new(),
            min_clock: Clock::zero(),
            max_clock: Clock::zero(),
            sealed: false,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// The first event's clock; the zero clock while the batch is empty.
    pub fn min_clock(&self) -> &Clock {
        &self.min_clock
    }

    /// Coordinate-wise maximum over all events in the batch.
    pub fn max_clock(&self) -> &Clock {
        &self.max_clock
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The event at `offset`, for indexed replay of a sealed batch.
    pub fn lookup(&self, offset: usize) -> Option<&Event> {
        self.events.get(offset)
    }

    pub fn append(&mut self, event: Event) -> Result<()> {
        if self.sealed {
            return Err(Error::InvariantViolation(format!(
                "append to sealed batch {}",
                self.batch_id
            )));
        }
        if self.is_full() {
            return Err(Error::BatchFull {
                capacity: self.capacity,
            });
        }
        let scn = event.clock.get(event.source);
        let high = self.max_clock.get(event.source);
        if scn < high {
            let source_name = match self.sources.name(event.source) {
                Some(name) => name.clone(),
                None => {
                    return Err(Error::InvariantViolation(format!(
                        "event for unknown source coordinate {}",
                        event.source
                    )));
                },
            };
            return Err(Error::ClockRegression {
                source_name,
                scn,
                high_water_mark: high,
            });
        }
        if self.events.is_empty() {
            self.min_clock = event.clock.clone();
        }
        self.max_clock = self.max_clock.merge_max(&event.clock);
        self.events.push(event);
        Ok(())
    }

    /// Marks the batch immutable. Idempotent.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Reopens a batch restored from the open-batch write-ahead record,
    /// which deserializes sealed like any other record but was never
    /// published.
    pub(crate) fn reopen(mut self, capacity: usize) -> Self {
        self.sealed = false;
        self.capacity = capacity;
        self
    }

    /// Single segment record: a header followed by `count` length-prefixed
    /// event records. Clocks are fixed-width in source-set order.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let num_sources = self.sources.len();
        let mut buf = Vec::new();
        buf.write_u64::<BigEndian>(self.batch_id)?;
        buf.write_u64::<BigEndian>(self.created_at_ms)?;
        buf.write_u32::<BigEndian>(self.events.len() as u32)?;
        buf.extend_from_slice(&self.min_clock.encode(num_sources)?);
        buf.extend_from_slice(&self.max_clock.encode(num_sources)?);
        for event in &self.events {
            buf.write_u16::<BigEndian>(event.source as u16)?;
            buf.write_u32::<BigEndian>(event.key.len() as u32)?;
            buf.extend_from_slice(&event.key);
            match &event.value {
                Some(value) => {
                    if value.len() as u32 == TOMBSTONE_LEN {
                        return Err(Error::SerializationFailure(
                            "value too large to serialize".into(),
                        ));
                    }
                    buf.write_u32::<BigEndian>(value.len() as u32)?;
                    buf.extend_from_slice(value);
                },
                None => buf.write_u32::<BigEndian>(TOMBSTONE_LEN)?,
            }
            buf.extend_from_slice(&event.clock.encode(num_sources)?);
        }
        Ok(buf)
    }

    /// Inverse of [`EventBatch::serialize`]. The result is sealed.
    pub fn deserialize(
        bytes: &[u8],
        sources: Arc<SourceSet>,
        capacity: usize,
    ) -> Result<EventBatch> {
        let num_sources = sources.len();
        let mut reader = bytes;
        let batch_id = reader.read_u64::<BigEndian>()?;
        let created_at_ms = reader.read_u64::<BigEndian>()?;
        let count = reader.read_u32::<BigEndian>()? as usize;
        let min_clock = Clock::read_from(&mut reader, num_sources)?;
        let max_clock = Clock::read_from(&mut reader, num_sources)?;
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let source = reader.read_u16::<BigEndian>()? as usize;
            if source >= num_sources {
                return Err(Error::Corruption(format!(
                    "event source coordinate {source} out of range in batch {batch_id}"
                )));
            }
            let key_len = reader.read_u32::<BigEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;
            let value_len = reader.read_u32::<BigEndian>()?;
            let value = if value_len == TOMBSTONE_LEN {
                None
            } else {
                let mut value = vec![0u8; value_len as usize];
                reader.read_exact(&mut value)?;
                Some(Bytes::from(value))
            };
            let clock = Clock::read_from(&mut reader, num_sources)?;
            events.push(Event {
                key: Bytes::from(key),
                value,
                clock,
                source,
            });
        }
        if !reader.is_empty() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after batch {batch_id}",
                reader.len()
            )));
        }
        Ok(EventBatch {
            batch_id,
            sources,
            capacity: capacity.max(count),
            created_at_ms,
            events,
            min_clock,
            max_clock,
            sealed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use common::{
        Clock,
        SourceSet,
    };
    use pretty_assertions::assert_eq;

    use super::{
        Event,
        EventBatch,
    };

    fn sources() -> Arc<SourceSet> {
        Arc::new("members,jobs".parse().unwrap())
    }

    fn event(source: usize, scn: u64) -> Event {
        Event {
            key: Bytes::from(format!("key-{source}-{scn}")),
            value: Some(Bytes::from(format!("value-{scn}"))),
            clock: Clock::zero().with_coordinate(source, scn),
            source,
        }
    }

    #[test]
    fn test_append_tracks_clocks() -> anyhow::Result<()> {
        let mut batch = EventBatch::new(0, sources(), 10);
        assert!(batch.is_empty());
        batch.append(event(0, 1))?;
        batch.append(event(1, 5))?;
        batch.append(event(0, 2))?;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.min_clock(), &Clock::from_coordinates(vec![1]));
        assert_eq!(batch.max_clock(), &Clock::from_coordinates(vec![2, 5]));
        Ok(())
    }

    #[test]
    fn test_append_full_and_regression() -> anyhow::Result<()> {
        let mut batch = EventBatch::new(0, sources(), 2);
        batch.append(event(0, 1))?;
        batch.append(event(0, 2))?;
        let err = batch.append(event(0, 3)).unwrap_err();
        assert!(err.is_batch_full());

        let mut batch = EventBatch::new(0, sources(), 10);
        batch.append(event(0, 5))?;
        let err = batch.append(event(0, 4)).unwrap_err();
        assert!(err.is_clock_regression());
        // Equal sequence numbers are not a regression.
        batch.append(event(0, 5))?;
        // A regression on one coordinate is fine on another.
        batch.append(event(1, 1))?;
        Ok(())
    }

    #[test]
    fn test_seal_is_idempotent() -> anyhow::Result<()> {
        let mut batch = EventBatch::new(0, sources(), 2);
        batch.append(event(0, 1))?;
        batch.seal();
        batch.seal();
        assert!(batch.is_sealed());
        assert!(batch.append(event(0, 2)).is_err());
        assert_eq!(batch.lookup(0).unwrap().clock.get(0), 1);
        Ok(())
    }

    #[test]
    fn test_serialize_roundtrips() -> anyhow::Result<()> {
        let mut batch = EventBatch::new(7, sources(), 10);
        batch.append(event(0, 1))?;
        batch.append(event(1, 3))?;
        batch.append(Event {
            key: Bytes::from_static(b"gone"),
            value: None,
            clock: Clock::zero().with_coordinate(0, 2),
            source: 0,
        })?;
        batch.seal();

        let bytes = batch.serialize()?;
        let decoded = EventBatch::deserialize(&bytes, sources(), 10)?;
        assert!(decoded.is_sealed());
        assert_eq!(decoded.batch_id(), 7);
        assert_eq!(decoded.created_at_ms(), batch.created_at_ms());
        assert_eq!(decoded.events(), batch.events());
        assert_eq!(decoded.min_clock(), batch.min_clock());
        assert_eq!(decoded.max_clock(), batch.max_clock());
        Ok(())
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(EventBatch::deserialize(&[1, 2, 3], sources(), 10).is_err());
        let mut batch = EventBatch::new(0, sources(), 10);
        batch.append(event(0, 1)).unwrap();
        let mut bytes = batch.serialize().unwrap();
        bytes.push(0);
        assert!(EventBatch::deserialize(&bytes, sources(), 10).is_err());
    }

    mod proptests {
        use cmd_util::env::env_config;
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64 * env_config("KRATI_PROPTEST_MULTIPLIER", 1),
                failure_persistence: None,
                ..ProptestConfig::default()
            })]

            #[test]
            fn proptest_batch_roundtrips(
                records in prop::collection::vec(
                    (any::<Vec<u8>>(), prop::option::of(any::<Vec<u8>>())),
                    1..20,
                ),
            ) {
                let mut batch = EventBatch::new(3, sources(), records.len());
                for (i, (key, value)) in records.iter().enumerate() {
                    let scn = (i + 1) as u64;
                    batch
                        .append(Event {
                            key: Bytes::from(key.clone()),
                            value: value.clone().map(Bytes::from),
                            clock: Clock::from_coordinates(vec![scn, scn / 2]),
                            source: 0,
                        })
                        .unwrap();
                }
                batch.seal();
                let decoded =
                    EventBatch::deserialize(&batch.serialize().unwrap(), sources(), records.len())
                        .unwrap();
                prop_assert_eq!(decoded.events(), batch.events());
                prop_assert_eq!(decoded.min_clock(), batch.min_clock());
                prop_assert_eq!(decoded.max_clock(), batch.max_clock());
                prop_assert_eq!(decoded.batch_id(), batch.batch_id());
            }
        }
    }
}
