use std::{
    path::PathBuf,
    sync::Arc,
};

use common::knobs::{
    RETENTION_BATCH_SIZE,
    RETENTION_NUM_BATCHES,
    RETENTION_SEGMENT_FILE_SIZE_MB,
};

use crate::policy::{
    RetentionPolicy,
    RetentionPolicyOnSize,
};

/// Configuration for one retention and the store it is paired with.
/// Defaults come from the knobs; `with_*` builders override them.
#[derive(Clone)]
pub struct RetentionConfig {
    pub id: u32,
    pub home_dir: PathBuf,
    pub batch_size: usize,
    pub policy: Arc<dyn RetentionPolicy>,
    pub segment_file_size_bytes: u64,
}

impl RetentionConfig {
    pub fn new(home_dir: impl Into<PathBuf>, id: u32) -> Self {
        Self {
            id,
            home_dir: home_dir.into(),
            batch_size: *RETENTION_BATCH_SIZE,
            policy: Arc::new(RetentionPolicyOnSize::new(*RETENTION_NUM_BATCHES)),
            segment_file_size_bytes: *RETENTION_SEGMENT_FILE_SIZE_MB * 1024 * 1024,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn RetentionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_segment_file_size_bytes(mut self, bytes: u64) -> Self {
        self.segment_file_size_bytes = bytes;
        self
    }

    /// Directory holding this retention's segment files and floor record.
    pub fn retention_dir(&self) -> PathBuf {
        self.home_dir.join(format!("retention-{}", self.id))
    }
}
