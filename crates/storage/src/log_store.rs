use std::{
    collections::BTreeMap,
    fs::{
        self,
        File,
        OpenOptions,
    },
    io::{
        BufReader,
        BufWriter,
        Read,
        Seek,
        SeekFrom,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
};

use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use bytes::Bytes;
use common::{
    knobs::STORE_COMPACTION_THRESHOLD_BYTES,
    Error,
    Result,
};
use parking_lot::Mutex;

use crate::KeyValueStore;

const LOG_FILE: &str = "store.log";
const COMPACT_FILE: &str = "store.log.compact";

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// Where a live value sits in the log file.
#[derive(Clone, Copy, Debug)]
struct ValuePos {
    /// Offset of the value bytes within the file.
    offset: u64,
    len: u32,
    /// Size of the whole framed record, for garbage accounting.
    record_len: u64,
}

/// A log-structured key-value store: an append-only record log plus an
/// in-memory key -> position index rebuilt on open. Records are
/// crc-checked; overwritten and deleted records accumulate as garbage until
/// a compaction pass rewrites the live set.
pub struct LogStore {
    inner: Mutex<Inner>,
}

struct Inner {
    dir: PathBuf,
    writer: BufWriter<File>,
    write_pos: u64,
    reader: File,
    index: BTreeMap<Bytes, ValuePos>,
    garbage_bytes: u64,
    compaction_threshold: u64,
    closed: bool,
}

impl LogStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_compaction_threshold(dir, *STORE_COMPACTION_THRESHOLD_BYTES)
    }

    pub fn open_with_compaction_threshold(
        dir: impl Into<PathBuf>,
        compaction_threshold: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);
        let (index, valid_len, garbage_bytes) = recover_index(&path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        // Drop any torn tail so new records start at a clean boundary.
        file.set_len(valid_len)?;
        file.seek(SeekFrom::End(0))?;
        let reader = File::open(&path)?;
        tracing::info!(
            "Opened key-value log at {} ({} live keys, {} garbage bytes)",
            path.display(),
            index.len(),
            garbage_bytes
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                dir,
                writer: BufWriter::new(file),
                write_pos: valid_len,
                reader,
                index,
                garbage_bytes,
                compaction_threshold,
                closed: false,
            }),
        })
    }
}

impl KeyValueStore for LogStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.append(key, Some(value))?;
        inner.maybe_compact()
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.index.get(key).copied() else {
            return Ok(None);
        };
        inner.read_value(pos).map(Some)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if !inner.index.contains_key(key) {
            return Ok(());
        }
        inner.append(key, None)?;
        inner.maybe_compact()
    }

    fn snapshot(&self) -> Result<Vec<(Bytes, Bytes)>> {
        let mut inner = self.inner.lock();
        let positions: Vec<(Bytes, ValuePos)> = inner
            .index
            .iter()
            .map(|(key, pos)| (key.clone(), *pos))
            .collect();
        positions
            .into_iter()
            .map(|(key, pos)| Ok((key, inner.read_value(pos)?)))
            .collect()
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        inner.closed = true;
        Ok(())
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvariantViolation("key-value store is closed".into()));
        }
        Ok(())
    }

    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let mut payload = Vec::with_capacity(9 + key.len() + value.map_or(0, |v| v.len()));
        match value {
            Some(value) => {
                payload.write_u8(OP_PUT)?;
                payload.write_u32::<BigEndian>(key.len() as u32)?;
                payload.extend_from_slice(key);
                payload.write_u32::<BigEndian>(value.len() as u32)?;
                payload.extend_from_slice(value);
            },
            None => {
                payload.write_u8(OP_DELETE)?;
                payload.write_u32::<BigEndian>(key.len() as u32)?;
                payload.extend_from_slice(key);
            },
        }
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_u32::<BigEndian>(crc32fast::hash(&payload))?;
        self.writer.write_all(&payload)?;
        // Reads go through a separate handle, so make the record visible.
        self.writer.flush()?;
        let record_len = 8 + payload.len() as u64;
        self.write_pos += record_len;

        let stale = match value {
            Some(value) => {
                let value_offset = self.write_pos - value.len() as u64;
                self.index.insert(
                    Bytes::copy_from_slice(key),
                    ValuePos {
                        offset: value_offset,
                        len: value.len() as u32,
                        record_len,
                    },
                )
            },
            None => {
                let stale = self.index.remove(key);
                // The tombstone itself is garbage once the put it shadows is
                // compacted away.
                self.garbage_bytes += record_len;
                stale
            },
        };
        if let Some(stale) = stale {
            self.garbage_bytes += stale.record_len;
        }
        Ok(())
    }

    fn read_value(&mut self, pos: ValuePos) -> Result<Bytes> {
        self.reader.seek(SeekFrom::Start(pos.offset))?;
        let mut buf = vec![0u8; pos.len as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(buf.into())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.garbage_bytes <= self.compaction_threshold {
            return Ok(());
        }
        self.compact()
    }

    /// Rewrites the live set into a fresh log and atomically swaps it in.
    fn compact(&mut self) -> Result<()> {
        let path = self.dir.join(LOG_FILE);
        let compact_path = self.dir.join(COMPACT_FILE);
        let live: Vec<(Bytes, Bytes)> = self
            .index
            .iter()
            .map(|(key, pos)| (key.clone(), *pos))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(key, pos)| Ok((key, self.read_value(pos)?)))
            .collect::<Result<_>>()?;

        let mut new_index = BTreeMap::new();
        let mut write_pos = 0u64;
        {
            let mut writer = BufWriter::new(File::create(&compact_path)?);
            for (key, value) in &live {
                let mut payload = Vec::with_capacity(9 + key.len() + value.len());
                payload.write_u8(OP_PUT)?;
                payload.write_u32::<BigEndian>(key.len() as u32)?;
                payload.extend_from_slice(key);
                payload.write_u32::<BigEndian>(value.len() as u32)?;
                payload.extend_from_slice(value);
                writer.write_u32::<BigEndian>(payload.len() as u32)?;
                writer.write_u32::<BigEndian>(crc32fast::hash(&payload))?;
                writer.write_all(&payload)?;
                let record_len = 8 + payload.len() as u64;
                write_pos += record_len;
                new_index.insert(
                    key.clone(),
                    ValuePos {
                        offset: write_pos - value.len() as u64,
                        len: value.len() as u32,
                        record_len,
                    },
                );
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&compact_path, &path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        self.writer = BufWriter::new(file);
        self.reader = File::open(&path)?;
        tracing::info!(
            "Compacted key-value log at {}: {} -> {} bytes",
            path.display(),
            self.write_pos,
            write_pos
        );
        self.write_pos = write_pos;
        self.index = new_index;
        self.garbage_bytes = 0;
        Ok(())
    }
}

/// Scans the log, returning the live index, the length of the valid prefix,
/// and the garbage byte count. A torn or corrupt tail is dropped with a
/// warning; corruption before the tail is an error.
fn recover_index(path: &Path) -> Result<(BTreeMap<Bytes, ValuePos>, u64, u64)> {
    let mut index: BTreeMap<Bytes, ValuePos> = BTreeMap::new();
    let mut garbage_bytes = 0u64;
    let mut pos = 0u64;
    if !path.exists() {
        return Ok((index, 0, 0));
    }
    let file_len = fs::metadata(path)?.len();
    let mut reader = BufReader::new(File::open(path)?);
    while pos < file_len {
        if file_len - pos < 8 {
            break;
        }
        let payload_len = reader.read_u32::<BigEndian>()? as u64;
        let crc = reader.read_u32::<BigEndian>()?;
        if file_len - pos - 8 < payload_len {
            break;
        }
        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            break;
        }
        let record_len = 8 + payload_len;
        let mut payload = &payload[..];
        let op = payload.read_u8()?;
        let key_len = payload.read_u32::<BigEndian>()? as usize;
        if payload.len() < key_len {
            return Err(Error::Corruption(format!(
                "key length {key_len} overruns record at offset {pos} in {}",
                path.display()
            )));
        }
        let key = Bytes::copy_from_slice(&payload[..key_len]);
        payload = &payload[key_len..];
        let stale = match op {
            OP_PUT => {
                let value_len = payload.read_u32::<BigEndian>()?;
                if payload.len() != value_len as usize {
                    return Err(Error::Corruption(format!(
                        "value length {value_len} mismatches record at offset {pos} in {}",
                        path.display()
                    )));
                }
                index.insert(
                    key,
                    ValuePos {
                        offset: pos + record_len - value_len as u64,
                        len: value_len,
                        record_len,
                    },
                )
            },
            OP_DELETE => {
                garbage_bytes += record_len;
                index.remove(&key)
            },
            other => {
                return Err(Error::Corruption(format!(
                    "unknown op {other} at offset {pos} in {}",
                    path.display()
                )));
            },
        };
        if let Some(stale) = stale {
            garbage_bytes += stale.record_len;
        }
        pos += record_len;
    }
    if pos < file_len {
        tracing::warn!(
            "Dropping torn tail of {} ({} of {} bytes valid)",
            path.display(),
            pos,
            file_len
        );
    }
    Ok((index, pos, garbage_bytes))
}
