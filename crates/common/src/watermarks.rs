use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    clock::Clock,
    errors::{
        Error,
        Result,
    },
    source::{
        SourceName,
        SourceSet,
    },
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct WaterMarks {
    /// The largest scn durably flushed for the source. Authoritative after
    /// a restart.
    low: u64,
    /// The largest scn applied in memory for the source.
    high: u64,
}

/// The persisted per-source watermark pair that gives the retention store
/// its ordering primitive.
///
/// High watermarks advance in memory on every write; `flush` persists them
/// as the new low watermarks. The watermark file holds one text line per
/// source (`name low high`) and is rewritten atomically on flush. On
/// startup the low watermark is authoritative: in-memory highs restart from
/// the persisted lows.
pub struct SourceWaterMarksClock {
    source_set: Arc<SourceSet>,
    path: PathBuf,
    inner: Mutex<BTreeMap<usize, WaterMarks>>,
}

impl SourceWaterMarksClock {
    /// Opens the watermark clock for the given sources, loading any
    /// persisted watermark file at `path` and validating it against the
    /// process-wide source order.
    pub fn open(
        source_set: Arc<SourceSet>,
        sources: &[SourceName],
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let mut marks = BTreeMap::new();
        for source in sources {
            let coordinate = source_set.coordinate(source)?;
            marks.insert(coordinate, WaterMarks::default());
        }
        if path.exists() {
            for line in fs::read_to_string(&path)?.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (source, low) = parse_line(line)?;
                let coordinate = source_set.coordinate(&source)?;
                let Some(entry) = marks.get_mut(&coordinate) else {
                    return Err(Error::UnknownSource(source));
                };
                *entry = WaterMarks { low, high: low };
            }
            tracing::info!("Loaded source watermarks from {}", path.display());
        }
        Ok(Self {
            source_set,
            path,
            inner: Mutex::new(marks),
        })
    }

    pub fn source_set(&self) -> &Arc<SourceSet> {
        &self.source_set
    }

    /// A snapshot of the current high watermarks as a clock.
    pub fn current(&self) -> Clock {
        let marks = self.inner.lock();
        let mut coordinates = vec![0; self.source_set.len()];
        for (&coordinate, watermarks) in marks.iter() {
            coordinates[coordinate] = watermarks.high;
        }
        Clock::from_coordinates(coordinates)
    }

    pub fn high_water_mark(&self, source: &SourceName) -> Result<u64> {
        self.marks_for(source).map(|watermarks| watermarks.high)
    }

    pub fn low_water_mark(&self, source: &SourceName) -> Result<u64> {
        self.marks_for(source).map(|watermarks| watermarks.low)
    }

    /// Advances the in-memory high watermark for `source` to
    /// `max(current, scn)`.
    pub fn advance(&self, source: &SourceName, scn: u64) -> Result<()> {
        let coordinate = self.source_set.coordinate(source)?;
        let mut marks = self.inner.lock();
        let Some(entry) = marks.get_mut(&coordinate) else {
            return Err(Error::UnknownSource(source.clone()));
        };
        entry.high = entry.high.max(scn);
        Ok(())
    }

    /// Persists the current high watermarks as the new low watermarks.
    /// Durable on return: the file is written to a sibling temp path,
    /// synced, and renamed over the old file.
    pub fn flush(&self) -> Result<()> {
        let mut marks = self.inner.lock();
        let mut contents = String::new();
        for (&coordinate, watermarks) in marks.iter() {
            let name = self.source_set.name(coordinate).ok_or_else(|| {
                Error::InvariantViolation(format!("no source at coordinate {coordinate}"))
            })?;
            contents.push_str(&format!("{name} {} {}\n", watermarks.high, watermarks.high));
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        for watermarks in marks.values_mut() {
            watermarks.low = watermarks.high;
        }
        tracing::debug!("Flushed source watermarks to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn marks_for(&self, source: &SourceName) -> Result<WaterMarks> {
        let coordinate = self.source_set.coordinate(source)?;
        self.inner
            .lock()
            .get(&coordinate)
            .copied()
            .ok_or_else(|| Error::UnknownSource(source.clone()))
    }
}

fn parse_line(line: &str) -> Result<(SourceName, u64)> {
    let corrupt = || Error::Corruption(format!("bad watermark line: {line}"));
    let mut parts = line.split_whitespace();
    let source: SourceName = parts.next().ok_or_else(corrupt)?.parse()?;
    let low: u64 = parts
        .next()
        .ok_or_else(corrupt)?
        .parse()
        .map_err(|_| corrupt())?;
    // The high watermark column is informational; lows are authoritative.
    let _high: u64 = parts
        .next()
        .ok_or_else(corrupt)?
        .parse()
        .map_err(|_| corrupt())?;
    if parts.next().is_some() {
        return Err(corrupt());
    }
    Ok((source, low))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SourceWaterMarksClock;
    use crate::{
        clock::Clock,
        source::{
            SourceName,
            SourceSet,
        },
    };

    fn sources() -> (Arc<SourceSet>, Vec<SourceName>) {
        let set: SourceSet = "members,jobs".parse().unwrap();
        let names: Vec<SourceName> = set.names().cloned().collect();
        (Arc::new(set), names)
    }

    #[test]
    fn test_advance_and_current() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (set, names) = sources();
        let clock = SourceWaterMarksClock::open(set, &names, dir.path().join("watermarks"))?;
        assert_eq!(clock.current(), Clock::zero());

        clock.advance(&names[0], 5)?;
        clock.advance(&names[1], 9)?;
        // Advancing backwards is a no-op, not a regression.
        clock.advance(&names[1], 3)?;
        assert_eq!(clock.current(), Clock::from_coordinates(vec![5, 9]));
        assert_eq!(clock.high_water_mark(&names[0])?, 5);
        assert_eq!(clock.low_water_mark(&names[0])?, 0);
        Ok(())
    }

    #[test]
    fn test_unknown_source_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (set, names) = sources();
        // Only register the first source with this clock.
        let clock =
            SourceWaterMarksClock::open(set, &names[..1], dir.path().join("watermarks"))?;
        assert!(clock.advance(&names[1], 1).is_err());
        assert!(clock.advance(&"stranger".parse()?, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_flush_then_reopen_restores_lows() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("watermarks");
        let (set, names) = sources();
        {
            let clock = SourceWaterMarksClock::open(set.clone(), &names, &path)?;
            clock.advance(&names[0], 100)?;
            clock.advance(&names[1], 50)?;
            clock.flush()?;
            assert_eq!(clock.low_water_mark(&names[0])?, 100);
            // Advance past the flush; this high watermark is lost on restart.
            clock.advance(&names[0], 140)?;
        }
        let clock = SourceWaterMarksClock::open(set, &names, &path)?;
        assert_eq!(clock.high_water_mark(&names[0])?, 100);
        assert_eq!(clock.high_water_mark(&names[1])?, 50);
        assert_eq!(clock.current(), Clock::from_coordinates(vec![100, 50]));
        Ok(())
    }

    #[test]
    fn test_corrupt_file_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("watermarks");
        std::fs::write(&path, "members five 5\n")?;
        let (set, names) = sources();
        assert!(SourceWaterMarksClock::open(set, &names, &path).is_err());
        Ok(())
    }
}
