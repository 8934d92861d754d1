use std::collections::BTreeMap;

use bytes::Bytes;
use common::{
    Error,
    Result,
};
use parking_lot::RwLock;

use crate::KeyValueStore;

/// In-memory store for tests and cache-style deployments.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Bytes, Bytes>,
    closed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::InvariantViolation("key-value store is closed".into()));
        }
        inner.entries.insert(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        );
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.inner.read().entries.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::InvariantViolation("key-value store is closed".into()));
        }
        inner.entries.remove(key);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<(Bytes, Bytes)>> {
        Ok(self
            .inner
            .read()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.inner.write().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.put(b"k", b"v")?;
        assert_eq!(store.get(b"k")?, Some(Bytes::from_static(b"v")));
        store.delete(b"k")?;
        assert_eq!(store.get(b"k")?, None);
        store.close()?;
        assert!(store.put(b"k", b"v").is_err());
        Ok(())
    }
}
