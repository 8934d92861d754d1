use std::sync::Arc;

use common::{
    codec::Utf8Codec,
    Result,
    SourceName,
    SourceSet,
};
use storage::MemoryStore;
use tempfile::TempDir;

use crate::{
    composite::CompositeRetentionStoreReader,
    config::RetentionConfig,
    policy::RetentionPolicyOnSize,
    position::CompositePosition,
    reader::{
        RetentionReader,
        Update,
    },
    store::RetentionStore,
};

/// A home directory plus the process-wide source order, shared by every
/// retention store a test opens.
pub struct RetentionStoreFixture {
    pub home: TempDir,
    pub source_set: Arc<SourceSet>,
}

impl RetentionStoreFixture {
    pub fn new(sources: &str) -> anyhow::Result<Self> {
        cmd_util::env::config_test();
        Ok(Self {
            home: TempDir::new()?,
            source_set: Arc::new(sources.parse()?),
        })
    }

    pub fn source(&self, name: &str) -> SourceName {
        name.parse().expect("test source names are valid")
    }

    pub fn config(&self, id: u32, batch_size: usize, num_batches: usize) -> RetentionConfig {
        RetentionConfig::new(self.home.path(), id)
            .with_batch_size(batch_size)
            .with_policy(Arc::new(RetentionPolicyOnSize::new(num_batches)))
    }

    /// A store backed by the in-memory key-value engine.
    pub fn open_store(
        &self,
        id: u32,
        sources: &[&str],
        batch_size: usize,
        num_batches: usize,
    ) -> Result<RetentionStore<Utf8Codec>> {
        RetentionStore::open_with_store(
            self.config(id, batch_size, num_batches),
            self.source_set.clone(),
            sources.iter().map(|name| self.source(name)).collect(),
            Utf8Codec,
            Arc::new(MemoryStore::new()),
        )
    }

    /// A store backed by the log-structured key-value engine on disk.
    pub fn open_disk_store(
        &self,
        id: u32,
        sources: &[&str],
        batch_size: usize,
        num_batches: usize,
    ) -> Result<RetentionStore<Utf8Codec>> {
        RetentionStore::open(
            self.config(id, batch_size, num_batches),
            self.source_set.clone(),
            sources.iter().map(|name| self.source(name)).collect(),
            Utf8Codec,
        )
    }
}

/// Pulls from the composite reader until it reports no new data, returning
/// the final position and everything delivered.
pub fn drain_composite(
    reader: &CompositeRetentionStoreReader<Utf8Codec>,
    mut position: CompositePosition,
) -> Result<(CompositePosition, Vec<Update<String>>)> {
    let mut all = Vec::new();
    loop {
        let mut out = Vec::new();
        let next = reader.get(&position, &mut out)?;
        let done = out.is_empty() && next == position;
        all.extend(out);
        position = next;
        if done {
            return Ok((position, all));
        }
    }
}

/// Sequence numbers of this source's own events within `updates`, in
/// delivery order.
pub fn scns_for(
    updates: &[Update<String>],
    source_set: &SourceSet,
    source: &SourceName,
) -> Vec<u64> {
    let coordinate = source_set.coordinate(source).expect("known source");
    updates
        .iter()
        .filter(|update| &update.source == source)
        .map(|update| update.clock.get(coordinate))
        .collect()
}
