use std::{
    collections::VecDeque,
    fs,
    io::Write,
    mem,
    path::PathBuf,
    sync::Arc,
};

use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use common::{
    Clock,
    Error,
    Result,
    SourceName,
    SourceSet,
};
use parking_lot::Mutex;

use crate::{
    config::RetentionConfig,
    event::{
        BatchId,
        Event,
        EventBatch,
    },
    policy::RetentionPolicy,
    position::Position,
    segment::SegmentStore,
};

const FLOOR_FILE: &str = "floor";
const OPEN_WAL_FILE: &str = "open.wal";

/// The ordered, bounded history of change events for one retention: sealed
/// batches plus at most one open batch, evicted oldest-first under a
/// [`RetentionPolicy`].
///
/// Appends are durable once their batch is sealed and the segment store is
/// flushed. The persisted floor clock tracks, per source coordinate, the
/// largest evicted sequence number of that source. It defines the replay
/// boundary: a request below it fails with `RetentionExhausted`, including
/// after a restart.
pub struct Retention {
    sources: Arc<SourceSet>,
    policy: Arc<dyn RetentionPolicy>,
    batch_size: usize,
    dir: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    open: EventBatch,
    sealed: VecDeque<Arc<EventBatch>>,
    /// Id of the open batch; sealed ids are dense right below it.
    next_batch_id: BatchId,
    floor: Clock,
    segments: SegmentStore,
}

impl Inner {
    /// Id of the oldest batch still retained.
    fn first_live_id(&self) -> BatchId {
        self.sealed
            .front()
            .map(|batch| batch.batch_id())
            .unwrap_or(self.next_batch_id)
    }
}

impl Retention {
    pub fn open(config: &RetentionConfig, sources: Arc<SourceSet>) -> Result<Retention> {
        if config.batch_size == 0 {
            return Err(Error::InvariantViolation(
                "retention batch size must be at least 1".into(),
            ));
        }
        let dir = config.retention_dir();
        fs::create_dir_all(&dir)?;
        let (segments, mut batches) = SegmentStore::open(
            dir.join("segments"),
            config.segment_file_size_bytes,
            &sources,
            config.batch_size,
        )?;
        let (first_live_id, floor) = read_floor(&dir, sources.len())?;
        batches.retain(|batch| batch.batch_id() >= first_live_id);

        let next_batch_id = batches
            .last()
            .map(|batch| batch.batch_id() + 1)
            .unwrap_or(first_live_id);
        let open = restore_open_batch(&dir, &sources, config.batch_size, next_batch_id)
            .unwrap_or_else(|| EventBatch::new(next_batch_id, sources.clone(), config.batch_size));

        let mut inner = Inner {
            open,
            sealed: batches.into_iter().map(Arc::new).collect(),
            next_batch_id,
            floor,
            segments,
        };
        // Recovery may have replayed batches the policy no longer admits.
        evict(&mut inner, config.policy.as_ref(), &sources, &dir)?;
        tracing::info!(
            "Opened retention {} at {} ({} sealed batches, floor {})",
            config.id,
            dir.display(),
            inner.sealed.len(),
            inner.floor
        );
        Ok(Retention {
            sources,
            policy: config.policy.clone(),
            batch_size: config.batch_size,
            dir,
            inner: Mutex::new(inner),
        })
    }

    pub fn source_set(&self) -> &Arc<SourceSet> {
        &self.sources
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_sealed_batches(&self) -> usize {
        self.inner.lock().sealed.len()
    }

    /// The current replay floor. Requests below it on their source
    /// coordinate fail with `RetentionExhausted`.
    pub fn floor_clock(&self) -> Clock {
        self.inner.lock().floor.clone()
    }

    /// Appends one event, sealing the open batch as soon as it fills. The
    /// seal publishes the batch to the segment store and applies the
    /// eviction policy.
    pub fn append(&self, event: Event) -> Result<()> {
        let mut inner = self.inner.lock();
        // Only reachable when a restored open batch outgrew a shrunken
        // configured capacity.
        if inner.open.is_full() {
            self.seal_open(&mut inner)?;
        }
        inner.open.append(event)?;
        if inner.open.is_full() {
            self.seal_open(&mut inner)?;
        }
        Ok(())
    }

    /// Resolves `clock` to a replay position for the given source
    /// coordinate.
    pub fn get_position(&self, source: usize, clock: &Clock) -> Result<Position> {
        let inner = self.inner.lock();
        let scn = clock.get(source);
        if scn < inner.floor.get(source) {
            return Err(self.exhausted(source, scn, &inner.floor));
        }
        for batch in &inner.sealed {
            if batch.max_clock().get(source) > scn {
                let offset = batch
                    .events()
                    .iter()
                    .position(|event| event.clock.get(source) > scn)
                    .unwrap_or(batch.len());
                return Ok(Position::Indexed {
                    source,
                    batch_id: batch.batch_id(),
                    offset: offset as u32,
                    clock: clock.clone(),
                });
            }
        }
        // Caught up with the sealed run; the open batch is read by tailing.
        Ok(Position::Streaming {
            source,
            clock: clock.clone(),
        })
    }

    /// Reads up to `max_events` events for the position's source and
    /// returns the advanced position. Streaming reads return an empty list
    /// and an unchanged position when there is no new data; they never
    /// block.
    pub fn get(&self, position: &Position, max_events: usize) -> Result<(Position, Vec<Event>)> {
        match position {
            Position::Indexed {
                source,
                batch_id,
                offset,
                clock,
            } => self.get_indexed(*source, *batch_id, *offset as usize, clock, max_events),
            Position::Streaming { source, clock } => {
                self.get_streaming(*source, clock, max_events)
            },
        }
    }

    /// Syncs sealed batches and persists the open batch to its write-ahead
    /// record so a clean shutdown loses nothing.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.segments.flush()?;
        let payload = inner.open.serialize()?;
        let path = self.dir.join(OPEN_WAL_FILE);
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_u32::<BigEndian>(payload.len() as u32)?;
            file.write_u32::<BigEndian>(crc32fast::hash(&payload))?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn get_indexed(
        &self,
        source: usize,
        batch_id: BatchId,
        offset: usize,
        clock: &Clock,
        max_events: usize,
    ) -> Result<(Position, Vec<Event>)> {
        // Snapshot under the lock; sealed batches are immutable and read
        // without it.
        let (sealed, first_live_id, floor) = {
            let inner = self.inner.lock();
            let sealed: Vec<Arc<EventBatch>> = inner.sealed.iter().cloned().collect();
            (sealed, inner.first_live_id(), inner.floor.clone())
        };
        if batch_id < first_live_id {
            // The batch this position targeted was evicted mid-replay.
            return Err(self.exhausted(source, clock.get(source), &floor));
        }
        let first_sealed_id = match sealed.first() {
            Some(batch) => batch.batch_id(),
            None => first_live_id,
        };
        let mut batch_id = batch_id;
        let mut offset = offset;
        let mut clock = clock.clone();
        let mut events = Vec::new();
        loop {
            if events.len() >= max_events {
                let position = Position::Indexed {
                    source,
                    batch_id,
                    offset: offset as u32,
                    clock,
                };
                return Ok((position, events));
            }
            let index = (batch_id - first_sealed_id) as usize;
            let Some(batch) = sealed.get(index) else {
                // Walked past the last sealed batch: transition to
                // streaming, exactly once per consumer session.
                return Ok((Position::Streaming { source, clock }, events));
            };
            match batch.lookup(offset) {
                None => {
                    batch_id += 1;
                    offset = 0;
                },
                Some(event) => {
                    offset += 1;
                    if event.source == source {
                        clock = clock.merge_max(&event.clock);
                        events.push(event.clone());
                    }
                },
            }
        }
    }

    fn get_streaming(
        &self,
        source: usize,
        clock: &Clock,
        max_events: usize,
    ) -> Result<(Position, Vec<Event>)> {
        let scn = clock.get(source);
        let (sealed, open_events, floor) = {
            let inner = self.inner.lock();
            let sealed: Vec<Arc<EventBatch>> = inner
                .sealed
                .iter()
                .filter(|batch| batch.max_clock().get(source) > scn)
                .cloned()
                .collect();
            // Snapshot of the open batch: appends only ever extend it.
            let open_events: Vec<Event> = inner
                .open
                .events()
                .iter()
                .filter(|event| event.source == source && event.clock.get(source) > scn)
                .take(max_events)
                .cloned()
                .collect();
            (sealed, open_events, inner.floor.clone())
        };
        if scn < floor.get(source) {
            return Err(self.exhausted(source, scn, &floor));
        }
        let mut events = Vec::new();
        'sealed: for batch in &sealed {
            for event in batch.events() {
                if events.len() >= max_events {
                    break 'sealed;
                }
                if event.source == source && event.clock.get(source) > scn {
                    events.push(event.clone());
                }
            }
        }
        for event in open_events {
            if events.len() >= max_events {
                break;
            }
            events.push(event);
        }
        let mut new_clock = clock.clone();
        for event in &events {
            new_clock = new_clock.merge_max(&event.clock);
        }
        Ok((
            Position::Streaming {
                source,
                clock: new_clock,
            },
            events,
        ))
    }

    fn seal_open(&self, inner: &mut Inner) -> Result<()> {
        let payload = inner.open.serialize()?;
        let batch_id = inner.open.batch_id();
        inner.segments.append_batch(batch_id, &payload)?;
        let next_batch_id = inner.next_batch_id + 1;
        let mut sealed_batch = mem::replace(
            &mut inner.open,
            EventBatch::new(next_batch_id, self.sources.clone(), self.batch_size),
        );
        sealed_batch.seal();
        inner.next_batch_id = next_batch_id;
        inner.sealed.push_back(Arc::new(sealed_batch));
        evict(inner, self.policy.as_ref(), &self.sources, &self.dir)
    }

    fn exhausted(&self, source: usize, requested: u64, floor: &Clock) -> Error {
        let source_name = self
            .sources
            .name(source)
            .cloned()
            .unwrap_or_else(SourceName::unknown);
        Error::RetentionExhausted {
            source_name,
            requested,
            floor: floor.get(source),
        }
    }
}

/// Applies the eviction policy, advancing the floor clock and persisting it
/// before segment files are reclaimed.
fn evict(
    inner: &mut Inner,
    policy: &dyn RetentionPolicy,
    sources: &Arc<SourceSet>,
    dir: &PathBuf,
) -> Result<()> {
    let count = policy.num_to_evict(&inner.sealed);
    if count == 0 {
        return Ok(());
    }
    let mut evicted_through = 0;
    let mut evicted_events = 0;
    for _ in 0..count {
        let Some(batch) = inner.sealed.pop_front() else {
            break;
        };
        // The floor advances per origin coordinate only. An event's clock
        // also carries the watermarks of the other sources it observed;
        // folding those in would exhaust readers whose own history is
        // still retained.
        for event in batch.events() {
            let scn = event.clock.get(event.source);
            if scn > inner.floor.get(event.source) {
                inner.floor = inner.floor.with_coordinate(event.source, scn);
            }
        }
        evicted_through = batch.batch_id();
        evicted_events += batch.len();
    }
    write_floor(dir, sources.len(), inner.first_live_id(), &inner.floor)?;
    inner.segments.evict_through(evicted_through)?;
    tracing::info!(
        "Evicted {count} batches ({evicted_events} events) through batch {evicted_through}; \
         floor is now {}",
        inner.floor
    );
    Ok(())
}

fn write_floor(
    dir: &PathBuf,
    num_sources: usize,
    first_live_id: BatchId,
    floor: &Clock,
) -> Result<()> {
    let path = dir.join(FLOOR_FILE);
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_u64::<BigEndian>(first_live_id)?;
        file.write_all(&floor.encode(num_sources)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

fn read_floor(dir: &PathBuf, num_sources: usize) -> Result<(BatchId, Clock)> {
    let path = dir.join(FLOOR_FILE);
    if !path.exists() {
        return Ok((0, Clock::zero()));
    }
    let contents = fs::read(&path)?;
    if contents.len() != 8 + 8 * num_sources {
        return Err(Error::Corruption(format!(
            "floor record is {} bytes, expected {}",
            contents.len(),
            8 + 8 * num_sources
        )));
    }
    let mut reader = &contents[..];
    let first_live_id = reader.read_u64::<BigEndian>()?;
    let floor = Clock::read_from(&mut reader, num_sources)?;
    Ok((first_live_id, floor))
}

/// Restores the open batch from its write-ahead record if one matching the
/// expected batch id survives. Anything else is ignored with a warning; the
/// record is advisory.
fn restore_open_batch(
    dir: &PathBuf,
    sources: &Arc<SourceSet>,
    batch_size: usize,
    expected_id: BatchId,
) -> Option<EventBatch> {
    let path = dir.join(OPEN_WAL_FILE);
    if !path.exists() {
        return None;
    }
    let parse = || -> Result<EventBatch> {
        let contents = fs::read(&path)?;
        let mut reader = &contents[..];
        let payload_len = reader.read_u32::<BigEndian>()? as usize;
        let crc = reader.read_u32::<BigEndian>()?;
        if reader.len() != payload_len {
            return Err(Error::Corruption("torn open-batch record".into()));
        }
        if crc32fast::hash(reader) != crc {
            return Err(Error::Corruption("open-batch record crc mismatch".into()));
        }
        EventBatch::deserialize(reader, sources.clone(), batch_size)
    };
    match parse() {
        Ok(batch) if batch.batch_id() == expected_id => {
            tracing::info!(
                "Restored open batch {} ({} events) from {}",
                batch.batch_id(),
                batch.len(),
                path.display()
            );
            Some(batch.reopen(batch_size))
        },
        Ok(batch) => {
            tracing::warn!(
                "Ignoring stale open-batch record {} (expected batch {expected_id})",
                batch.batch_id()
            );
            None
        },
        Err(e) => {
            tracing::warn!("Ignoring unreadable open-batch record: {e}");
            None
        },
    }
}
