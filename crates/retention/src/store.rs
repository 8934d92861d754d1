use std::{
    collections::BTreeSet,
    sync::Arc,
};

use common::{
    codec::ValueCodec,
    Error,
    Result,
    SourceName,
    SourceSet,
    SourceWaterMarksClock,
};
use parking_lot::Mutex;
use storage::{
    KeyValueStore,
    LogStore,
};

use crate::{
    config::RetentionConfig,
    log::Retention,
    reader::RetentionStoreReader,
    writer::RetentionStoreWriter,
};

/// One retention store: the stitched trio of a retention, the key-value
/// store holding the latest-value projection, and the source watermark
/// clock they share. Owns all three and hands out per-source writers and
/// readers; no component references another.
pub struct RetentionStore<C: ValueCodec> {
    retention: Arc<Retention>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<SourceWaterMarksClock>,
    codec: Arc<C>,
    writer_sources: Mutex<BTreeSet<SourceName>>,
}

impl<C: ValueCodec> RetentionStore<C> {
    /// Opens the store under `config.home_dir` with a log-structured
    /// key-value engine.
    pub fn open(
        config: RetentionConfig,
        source_set: Arc<SourceSet>,
        sources: Vec<SourceName>,
        codec: C,
    ) -> Result<Self> {
        let kv_dir = config.home_dir.join(format!("store-{}", config.id));
        let store = Arc::new(LogStore::open(kv_dir)?);
        Self::open_with_store(config, source_set, sources, codec, store)
    }

    /// Opens the store around a caller-provided key-value engine.
    pub fn open_with_store(
        config: RetentionConfig,
        source_set: Arc<SourceSet>,
        sources: Vec<SourceName>,
        codec: C,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvariantViolation(
                "a retention store needs at least one source".into(),
            ));
        }
        let watermarks_path = config
            .home_dir
            .join(format!("watermarks-{}", config.id));
        let clock = Arc::new(SourceWaterMarksClock::open(
            source_set.clone(),
            &sources,
            watermarks_path,
        )?);
        let retention = Arc::new(Retention::open(&config, source_set)?);
        Ok(Self {
            retention,
            store,
            clock,
            codec: Arc::new(codec),
            writer_sources: Mutex::new(BTreeSet::new()),
        })
    }

    /// The writer for `source`. At most one writer per source; a second
    /// request is refused so per-source serialization cannot be bypassed.
    pub fn writer(&self, source: &SourceName) -> Result<RetentionStoreWriter<C>> {
        let mut writer_sources = self.writer_sources.lock();
        if !writer_sources.insert(source.clone()) {
            return Err(Error::InvariantViolation(format!(
                "writer for source {source} already exists"
            )));
        }
        RetentionStoreWriter::new(
            source.clone(),
            self.retention.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.codec.clone(),
        )
    }

    pub fn reader(&self, source: &SourceName) -> Result<RetentionStoreReader<C>> {
        RetentionStoreReader::new(
            source.clone(),
            self.retention.clone(),
            self.store.clone(),
            self.codec.clone(),
        )
    }

    pub fn retention(&self) -> &Arc<Retention> {
        &self.retention
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn watermarks(&self) -> &Arc<SourceWaterMarksClock> {
        &self.clock
    }

    pub fn get_high_water_mark(&self, source: &SourceName) -> Result<u64> {
        self.clock.high_water_mark(source)
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()?;
        self.retention.flush()?;
        self.clock.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.store.close()
    }
}
