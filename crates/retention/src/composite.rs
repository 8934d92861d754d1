use std::{
    collections::BTreeMap,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

use common::{
    codec::ValueCodec,
    Clock,
    Error,
    Result,
    SourceName,
};

use crate::{
    position::CompositePosition,
    reader::{
        RetentionReader,
        RetentionStoreReader,
        Update,
    },
};

/// Fan-in over several single-source readers behind one cursor.
///
/// Children are scheduled round-robin; each `get` drains at most one batch
/// from the first child (in rotation) that has data. Per-source order is
/// strictly preserved; no cross-source order is implied. The composite
/// position's components advance independently, and its `is_indexed`
/// predicate turns false exactly when every child has caught up.
pub struct CompositeRetentionStoreReader<C: ValueCodec> {
    readers: Vec<RetentionStoreReader<C>>,
    next_child: AtomicUsize,
}

impl<C: ValueCodec> CompositeRetentionStoreReader<C> {
    pub fn new(readers: Vec<RetentionStoreReader<C>>) -> Result<Self> {
        if readers.is_empty() {
            return Err(Error::InvariantViolation(
                "a composite reader needs at least one child".into(),
            ));
        }
        for (i, reader) in readers.iter().enumerate() {
            for other in &readers[i + 1..] {
                if reader.source() == other.source() {
                    return Err(Error::InvariantViolation(format!(
                        "duplicate source {} in composite reader",
                        reader.source()
                    )));
                }
            }
        }
        Ok(Self {
            readers,
            next_child: AtomicUsize::new(0),
        })
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceName> {
        self.readers.iter().map(RetentionStoreReader::source)
    }

    pub fn readers(&self) -> &[RetentionStoreReader<C>] {
        &self.readers
    }

    /// The current value for `key` on every source that holds it. Children
    /// are sampled one at a time; the result is not an atomic snapshot
    /// across sources.
    pub fn get_value(&self, key: &[u8]) -> Result<BTreeMap<SourceName, C::Value>> {
        let mut values = BTreeMap::new();
        for reader in &self.readers {
            if let Some(value) = reader.get_value(key)? {
                values.insert(reader.source().clone(), value);
            }
        }
        Ok(values)
    }
}

impl<C: ValueCodec> RetentionReader for CompositeRetentionStoreReader<C> {
    type Position = CompositePosition;
    type Value = C::Value;

    fn get_position(&self, clock: &Clock) -> Result<CompositePosition> {
        let positions = self
            .readers
            .iter()
            .map(|reader| reader.get_position(clock))
            .collect::<Result<Vec<_>>>()?;
        Ok(CompositePosition::new(positions))
    }

    fn get(
        &self,
        position: &CompositePosition,
        out: &mut Vec<Update<C::Value>>,
    ) -> Result<CompositePosition> {
        if position.positions().len() != self.readers.len() {
            return Err(Error::InvariantViolation(format!(
                "composite position has {} components for {} readers",
                position.positions().len(),
                self.readers.len()
            )));
        }
        let start = self.next_child.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let mut next = position.clone();
        for step in 0..self.readers.len() {
            let child_index = (start + step) % self.readers.len();
            let child_position = next.positions()[child_index].clone();
            let before = out.len();
            let advanced = self.readers[child_index].get(&child_position, out)?;
            let produced = out.len() > before;
            if advanced != child_position {
                // Record silent transitions (indexed -> streaming at the
                // tail) even when the child had no data.
                next.set(child_index, advanced);
            }
            if produced {
                return Ok(next);
            }
        }
        Ok(next)
    }
}
