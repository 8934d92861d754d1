use std::{
    collections::VecDeque,
    fs::{
        self,
        File,
        OpenOptions,
    },
    io::{
        BufWriter,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use byteorder::{
    BigEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use common::{
    Error,
    Result,
    SourceSet,
};

use crate::event::{
    BatchId,
    EventBatch,
};

const SEGMENT_SUFFIX: &str = ".seg";

/// Framing overhead per record: a u32 payload length and a u32 crc.
const RECORD_HEADER_LEN: u64 = 8;

#[derive(Debug)]
struct SegmentFile {
    seq: u64,
    path: PathBuf,
    len: u64,
    /// Ids of the first and last batch in the file; `None` while empty.
    batches: Option<(BatchId, BatchId)>,
}

/// Sealed batches on disk: a sequence of crc-checked, length-prefixed batch
/// records spread over size-rotated segment files. Eviction reclaims a file
/// once every batch in it has left the retention.
pub struct SegmentStore {
    dir: PathBuf,
    rotate_at: u64,
    files: VecDeque<SegmentFile>,
    writer: Option<BufWriter<File>>,
}

impl SegmentStore {
    /// Opens the segment directory and replays every decodable batch in
    /// order. A torn or corrupt tail in the newest file is dropped with a
    /// warning; corruption anywhere else is surfaced.
    pub fn open(
        dir: impl Into<PathBuf>,
        rotate_at: u64,
        sources: &Arc<SourceSet>,
        batch_capacity: usize,
    ) -> Result<(SegmentStore, Vec<EventBatch>)> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut sequenced: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(seq) = parse_segment_seq(&path) {
                sequenced.push((seq, path));
            }
        }
        sequenced.sort_by_key(|(seq, _)| *seq);

        let mut files = VecDeque::new();
        let mut batches: Vec<EventBatch> = Vec::new();
        let num_files = sequenced.len();
        for (index, (seq, path)) in sequenced.into_iter().enumerate() {
            let is_newest = index + 1 == num_files;
            let contents = fs::read(&path)?;
            let mut pos: u64 = 0;
            let mut file_batches: Option<(BatchId, BatchId)> = None;
            loop {
                match read_record(&contents, pos) {
                    Ok(Some((payload, next_pos))) => {
                        let batch =
                            EventBatch::deserialize(payload, sources.clone(), batch_capacity)?;
                        let id = batch.batch_id();
                        if let Some(last) = batches.last() {
                            if id != last.batch_id() + 1 {
                                return Err(Error::Corruption(format!(
                                    "batch id {id} after {} in {}",
                                    last.batch_id(),
                                    path.display()
                                )));
                            }
                        }
                        file_batches = match file_batches {
                            None => Some((id, id)),
                            Some((first, _)) => Some((first, id)),
                        };
                        batches.push(batch);
                        pos = next_pos;
                    },
                    Ok(None) => break,
                    Err(e) if is_newest => {
                        tracing::warn!(
                            "Dropping torn tail of {} at offset {pos}: {e}",
                            path.display()
                        );
                        let file = OpenOptions::new().write(true).open(&path)?;
                        file.set_len(pos)?;
                        break;
                    },
                    Err(e) => return Err(e),
                }
            }
            files.push_back(SegmentFile {
                seq,
                path,
                len: pos,
                batches: file_batches,
            });
        }
        tracing::info!(
            "Opened segment store at {} ({} files, {} batches)",
            dir.display(),
            files.len(),
            batches.len()
        );
        Ok((
            SegmentStore {
                dir,
                rotate_at,
                files,
                writer: None,
            },
            batches,
        ))
    }

    /// Appends one sealed batch record, rotating to a fresh segment file
    /// when the current one is at capacity. The record is buffered; it is
    /// durable after [`SegmentStore::flush`].
    pub fn append_batch(&mut self, batch_id: BatchId, payload: &[u8]) -> Result<()> {
        let needs_rotation = match self.files.back() {
            None => true,
            Some(file) => file.len >= self.rotate_at,
        };
        if needs_rotation {
            self.rotate()?;
        } else if self.writer.is_none() {
            let file = self
                .files
                .back()
                .expect("checked non-empty above");
            let handle = OpenOptions::new().append(true).open(&file.path)?;
            self.writer = Some(BufWriter::new(handle));
        }
        let writer = self.writer.as_mut().expect("writer opened above");
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_u32::<BigEndian>(crc32fast::hash(payload))?;
        writer.write_all(payload)?;
        writer.flush()?;
        let file = self.files.back_mut().expect("writer implies a file");
        file.len += RECORD_HEADER_LEN + payload.len() as u64;
        file.batches = match file.batches {
            None => Some((batch_id, batch_id)),
            Some((first, _)) => Some((first, batch_id)),
        };
        Ok(())
    }

    /// Syncs the current segment file.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Deletes segment files whose batches have all been evicted. The
    /// newest file is never deleted; it is the append target.
    pub fn evict_through(&mut self, batch_id: BatchId) -> Result<()> {
        while self.files.len() > 1 {
            let front = self.files.front().expect("len checked above");
            match front.batches {
                Some((_, last)) if last <= batch_id => {
                    fs::remove_file(&front.path)?;
                    tracing::info!("Evicted segment file {}", front.path.display());
                    self.files.pop_front();
                },
                // An empty non-newest file is dead weight left by rotation.
                None => {
                    fs::remove_file(&front.path)?;
                    self.files.pop_front();
                },
                Some(_) => break,
            }
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        let seq = self.files.back().map(|file| file.seq + 1).unwrap_or(0);
        let path = self.dir.join(format!("seg-{seq:010}{SEGMENT_SUFFIX}"));
        let handle = File::create(&path)?;
        self.writer = Some(BufWriter::new(handle));
        self.files.push_back(SegmentFile {
            seq,
            path,
            len: 0,
            batches: None,
        });
        Ok(())
    }
}

fn parse_segment_seq(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    let seq = stem.strip_prefix("seg-")?;
    seq.parse().ok()
}

/// Reads the framed record starting at `pos`. `Ok(None)` at a clean end of
/// file; an error for a torn or corrupt record.
fn read_record(contents: &[u8], pos: u64) -> Result<Option<(&[u8], u64)>> {
    let pos = pos as usize;
    if pos == contents.len() {
        return Ok(None);
    }
    if contents.len() - pos < RECORD_HEADER_LEN as usize {
        return Err(Error::Corruption(format!(
            "truncated record header at offset {pos}"
        )));
    }
    let mut header = &contents[pos..];
    let payload_len = header.read_u32::<BigEndian>()? as usize;
    let crc = header.read_u32::<BigEndian>()?;
    let payload_start = pos + RECORD_HEADER_LEN as usize;
    if contents.len() - payload_start < payload_len {
        return Err(Error::Corruption(format!(
            "truncated record payload at offset {pos}"
        )));
    }
    let payload = &contents[payload_start..payload_start + payload_len];
    if crc32fast::hash(payload) != crc {
        return Err(Error::Corruption(format!(
            "crc mismatch at offset {pos}"
        )));
    }
    Ok(Some((payload, (payload_start + payload_len) as u64)))
}
