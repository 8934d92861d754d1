use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use common::Clock;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use crate::{
    composite::CompositeRetentionStoreReader,
    reader::RetentionReader,
};

mod test_helpers;

use test_helpers::{
    drain_composite,
    scns_for,
    RetentionStoreFixture,
};

#[test]
fn test_composite_replay_from_zero() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1,source2")?;
    let store1 = f.open_disk_store(1, &["source1"], 100, 3)?;
    let store2 = f.open_disk_store(2, &["source2"], 100, 3)?;
    let writer1 = store1.writer(&f.source("source1"))?;
    let writer2 = store2.writer(&f.source("source2"))?;

    let mut keys = BTreeSet::new();
    for scn in 1..=300u64 {
        let key = Uuid::new_v4().to_string();
        let value = format!("value-{scn}");
        writer1.put(key.as_bytes(), &value, scn)?;
        writer2.put(key.as_bytes(), &value, scn)?;
        keys.insert(key);
    }

    let composite = CompositeRetentionStoreReader::new(vec![
        store1.reader(&f.source("source1"))?,
        store2.reader(&f.source("source2"))?,
    ])?;
    let start = composite.get_position(&Clock::zero())?;
    assert!(start.is_indexed());

    let (position, updates) = drain_composite(&composite, start)?;
    assert_eq!(updates.len(), 600);
    let delivered: BTreeSet<String> = updates
        .iter()
        .map(|update| String::from_utf8(update.key.to_vec()).unwrap())
        .collect();
    assert_eq!(delivered.len(), 300);
    assert_eq!(delivered, keys);
    assert!(!position.is_indexed());

    // Every key was written on both sources, so a point lookup sees both.
    let some_key = keys.iter().next().unwrap();
    assert_eq!(composite.get_value(some_key.as_bytes())?.len(), 2);

    // Per-source order is preserved end to end.
    for name in ["source1", "source2"] {
        let source = f.source(name);
        let scns = scns_for(&updates, &f.source_set, &source);
        assert_eq!(scns, (1..=300).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn test_composite_streaming_after_catch_up() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1,source2")?;
    let store1 = f.open_store(1, &["source1"], 100, 3)?;
    let store2 = f.open_store(2, &["source2"], 100, 3)?;
    let writer1 = store1.writer(&f.source("source1"))?;
    let writer2 = store2.writer(&f.source("source2"))?;
    let source1 = f.source("source1");
    let source2 = f.source("source2");

    for scn in 1..=300u64 {
        let key = Uuid::new_v4().to_string();
        let value = format!("value-{scn}");
        writer1.put(key.as_bytes(), &value, scn)?;
        writer2.put(key.as_bytes(), &value, scn)?;
    }
    let composite = CompositeRetentionStoreReader::new(vec![
        store1.reader(&source1)?,
        store2.reader(&source2)?,
    ])?;
    let (position, _) = drain_composite(&composite, composite.get_position(&Clock::zero())?)?;
    assert!(!position.is_indexed());

    // Five more puts per source after catch-up, with fresh keys.
    let mut new_keys = Vec::new();
    for scn in 301..=305u64 {
        let key1 = Uuid::new_v4().to_string();
        let key2 = Uuid::new_v4().to_string();
        writer1.put(key1.as_bytes(), &format!("tail-{scn}"), scn)?;
        writer2.put(key2.as_bytes(), &format!("tail-{scn}"), scn)?;
        new_keys.push((key1, key2, format!("tail-{scn}")));
    }

    // Two calls drain one source each, five events at a time.
    let mut out = Vec::new();
    let position = composite.get(&position, &mut out)?;
    assert_eq!(out.len(), 5);
    let mut out = Vec::new();
    let position = composite.get(&position, &mut out)?;
    assert_eq!(out.len(), 5);

    // Caught up again: an empty result leaves the position unchanged.
    let mut out = Vec::new();
    let next = composite.get(&position, &mut out)?;
    assert!(out.is_empty());
    assert_eq!(next, position);

    // Each new key's latest value is retrievable on its own source.
    for (key1, key2, value) in &new_keys {
        assert_eq!(
            composite.get_value(key1.as_bytes())?,
            btreemap! { source1.clone() => value.clone() }
        );
        assert_eq!(
            composite.get_value(key2.as_bytes())?,
            btreemap! { source2.clone() => value.clone() }
        );
    }
    Ok(())
}

#[test]
fn test_replay_fails_past_evicted_history() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1")?;
    let store = f.open_disk_store(1, &["source1"], 100, 3)?;
    let writer = store.writer(&f.source("source1"))?;
    for scn in 1..=400u64 {
        let key = format!("key-{scn}");
        writer.put(key.as_bytes(), &format!("value-{scn}"), scn)?;
    }
    // Four batches sealed, the first evicted: scns 1..=100 are gone.
    assert_eq!(store.retention().num_sealed_batches(), 3);
    assert_eq!(
        store.retention().floor_clock(),
        Clock::from_coordinates(vec![100])
    );

    let reader = store.reader(&f.source("source1"))?;
    let err = reader.get_position(&Clock::zero()).unwrap_err();
    assert!(err.is_retention_exhausted());

    // Replay from the floor of retained history yields the 300 survivors.
    let composite = CompositeRetentionStoreReader::new(vec![reader])?;
    let start = composite.get_position(&store.retention().floor_clock())?;
    let (_, updates) = drain_composite(&composite, start)?;
    assert_eq!(updates.len(), 300);
    assert_eq!(
        scns_for(&updates, &f.source_set, &f.source("source1")),
        (101..=400).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_concurrent_writer_and_reader() -> anyhow::Result<()> {
    const NUM_EVENTS: u64 = 10_000;
    let f = RetentionStoreFixture::new("source1")?;
    let store = Arc::new(f.open_store(1, &["source1"], 100, 200)?);
    let writer = store.writer(&f.source("source1"))?;
    let reader = store.reader(&f.source("source1"))?;

    let writer_thread = std::thread::spawn(move || -> anyhow::Result<()> {
        for scn in 1..=NUM_EVENTS {
            let key = format!("key-{scn}");
            writer.put(key.as_bytes(), &format!("value-{scn}"), scn)?;
        }
        Ok(())
    });

    let mut position = reader.get_position(&Clock::zero())?;
    let mut updates = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(60);
    while updates.len() < NUM_EVENTS as usize {
        assert!(Instant::now() < deadline, "reader stalled");
        let mut out = Vec::new();
        let next = reader.get(&position, &mut out)?;
        if out.is_empty() && next == position {
            std::thread::yield_now();
        }
        updates.extend(out);
        position = next;
    }
    writer_thread.join().expect("writer thread panicked")?;

    // Every event exactly once, in writer order.
    assert_eq!(updates.len(), NUM_EVENTS as usize);
    assert_eq!(
        scns_for(&updates, &f.source_set, &f.source("source1")),
        (1..=NUM_EVENTS).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_composite_across_shared_and_dedicated_retentions() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1,source2,source3")?;
    // Sources 1 and 2 share one retention; source 3 owns another.
    let shared = f.open_store(1, &["source1", "source2"], 30, 100)?;
    let dedicated = f.open_store(2, &["source3"], 30, 100)?;
    let writer1 = shared.writer(&f.source("source1"))?;
    let writer2 = shared.writer(&f.source("source2"))?;
    let writer3 = dedicated.writer(&f.source("source3"))?;

    for scn in 1..=100u64 {
        writer1.put(format!("s1-{scn}").as_bytes(), &format!("v1-{scn}"), scn)?;
        writer2.put(format!("s2-{scn}").as_bytes(), &format!("v2-{scn}"), scn)?;
        writer3.put(format!("s3-{scn}").as_bytes(), &format!("v3-{scn}"), scn)?;
    }

    let composite = CompositeRetentionStoreReader::new(vec![
        shared.reader(&f.source("source1"))?,
        shared.reader(&f.source("source2"))?,
        dedicated.reader(&f.source("source3"))?,
    ])?;
    let (position, updates) =
        drain_composite(&composite, composite.get_position(&Clock::zero())?)?;
    assert_eq!(updates.len(), 300);
    assert!(!position.is_indexed());

    for name in ["source1", "source2", "source3"] {
        let source = f.source(name);
        assert_eq!(
            scns_for(&updates, &f.source_set, &source),
            (1..=100).collect::<Vec<_>>()
        );
        let prefix = format!("s{}", &name[name.len() - 1..]);
        let keys: BTreeSet<String> = updates
            .iter()
            .filter(|update| update.source == source)
            .map(|update| String::from_utf8(update.key.to_vec()).unwrap())
            .collect();
        assert_eq!(keys.len(), 100);
        assert!(keys.iter().all(|key| key.starts_with(&prefix)));
    }
    Ok(())
}

#[test]
fn test_clock_regression_leaves_state_unchanged() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1")?;
    let store = f.open_store(1, &["source1"], 100, 3)?;
    let writer = store.writer(&f.source("source1"))?;
    writer.put(b"k1", &"v1".to_owned(), 5)?;

    let err = writer.put(b"k2", &"v2".to_owned(), 3).unwrap_err();
    assert!(err.is_clock_regression());
    assert_eq!(writer.get_high_water_mark()?, 5);

    let reader = store.reader(&f.source("source1"))?;
    assert_eq!(reader.get_value(b"k2")?, None);
    assert_eq!(reader.get_value(b"k1")?, Some("v1".to_owned()));

    let composite = CompositeRetentionStoreReader::new(vec![reader])?;
    let (_, updates) = drain_composite(&composite, composite.get_position(&Clock::zero())?)?;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].key.as_ref(), b"k1");
    Ok(())
}

#[test]
fn test_tombstones_replay_as_deletes() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1")?;
    let store = f.open_store(1, &["source1"], 100, 3)?;
    let writer = store.writer(&f.source("source1"))?;
    writer.put(b"k1", &"v1".to_owned(), 1)?;
    writer.delete(b"k1", 2)?;

    let reader = store.reader(&f.source("source1"))?;
    assert_eq!(reader.get_value(b"k1")?, None);

    let composite = CompositeRetentionStoreReader::new(vec![reader])?;
    let (_, updates) = drain_composite(&composite, composite.get_position(&Clock::zero())?)?;
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].value, Some("v1".to_owned()));
    assert_eq!(updates[1].value, None);
    Ok(())
}

#[test]
fn test_writer_per_source_is_exclusive() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1,source2")?;
    let store = f.open_store(1, &["source1", "source2"], 100, 3)?;
    let _writer = store.writer(&f.source("source1"))?;
    assert!(store.writer(&f.source("source1")).is_err());
    // A second source still gets its own writer.
    assert!(store.writer(&f.source("source2")).is_ok());
    // Unknown sources are rejected outright.
    assert!(store.writer(&f.source("source9")).is_err());
    Ok(())
}

#[test]
fn test_watermarks_survive_flush_and_reopen() -> anyhow::Result<()> {
    let f = RetentionStoreFixture::new("source1")?;
    {
        let store = f.open_disk_store(1, &["source1"], 100, 3)?;
        let writer = store.writer(&f.source("source1"))?;
        for scn in 1..=10u64 {
            writer.put(format!("key-{scn}").as_bytes(), &format!("value-{scn}"), scn)?;
        }
        assert_eq!(writer.get_low_water_mark()?, 0);
        writer.flush()?;
        assert_eq!(writer.get_low_water_mark()?, 10);
        store.close()?;
    }
    let store = f.open_disk_store(1, &["source1"], 100, 3)?;
    assert_eq!(store.get_high_water_mark(&f.source("source1"))?, 10);

    // Replay resumes cleanly from the persisted watermark.
    let reader = store.reader(&f.source("source1"))?;
    let composite = CompositeRetentionStoreReader::new(vec![reader])?;
    let start = composite.get_position(&store.watermarks().current())?;
    assert!(!start.is_indexed());

    let writer = store.writer(&f.source("source1"))?;
    writer.put(b"k-next", &"v-next".to_owned(), 11)?;
    let (_, updates) = drain_composite(&composite, start)?;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].key.as_ref(), b"k-next");
    Ok(())
}
