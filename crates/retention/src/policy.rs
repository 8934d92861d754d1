use std::{
    collections::VecDeque,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use crate::event::EventBatch;

/// Decides how much sealed history a retention keeps. Consulted after every
/// seal; evicted batches leave oldest-first.
pub trait RetentionPolicy: Send + Sync + 'static {
    /// Number of batches to evict from the front of the sealed run.
    fn num_to_evict(&self, sealed: &VecDeque<Arc<EventBatch>>) -> usize;
}

/// Keeps the most recent `num_batches` sealed batches.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicyOnSize {
    num_batches: usize,
}

impl RetentionPolicyOnSize {
    pub fn new(num_batches: usize) -> Self {
        Self { num_batches }
    }
}

impl RetentionPolicy for RetentionPolicyOnSize {
    fn num_to_evict(&self, sealed: &VecDeque<Arc<EventBatch>>) -> usize {
        sealed.len().saturating_sub(self.num_batches)
    }
}

/// Evicts batches whose creation time has fallen out of the window. Always
/// keeps the most recent sealed batch so a caught-up reader has a tail to
/// anchor on.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicyOnAge {
    max_age: Duration,
}

impl RetentionPolicyOnAge {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl RetentionPolicy for RetentionPolicyOnAge {
    fn num_to_evict(&self, sealed: &VecDeque<Arc<EventBatch>>) -> usize {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let cutoff_ms = now_ms.saturating_sub(self.max_age.as_millis() as u64);
        let mut evict = 0;
        for batch in sealed.iter().take(sealed.len().saturating_sub(1)) {
            if batch.created_at_ms() < cutoff_ms {
                evict += 1;
            } else {
                break;
            }
        }
        evict
    }
}
