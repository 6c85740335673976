use chunkcache::{
    concatenate, fingerprint, ok_chunks, CacheError, CachedStage, ChunkCache, ChunkSource,
    Identifier, Stage, StreamSink,
};
use ndarray::{Array1, Array2, ArrayD, Axis};
use std::cell::Cell;
use std::fs;
use std::rc::Rc;
use tempfile::TempDir;

fn series(chunks: usize, rows: usize) -> Vec<ArrayD<f64>> {
    (0..chunks)
        .map(|c| Array1::from_iter((0..rows).map(|r| (c * rows + r) as f64)).into_dyn())
        .collect()
}

/// Producer over `chunks` that counts how many items were pulled from it
fn counting(
    chunks: Vec<ArrayD<f64>>,
    pulled: &Rc<Cell<usize>>,
) -> impl Iterator<Item = chunkcache::Result<ArrayD<f64>>> {
    let pulled = Rc::clone(pulled);
    chunks.into_iter().map(move |chunk| {
        pulled.set(pulled.get() + 1);
        Ok(chunk)
    })
}

#[test]
fn test_materialize_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("series").with_version("1");

    let source: ChunkSource<f64> = cache.materialize(ok_chunks(series(5, 10)), &stage).unwrap();

    assert!(cache.is_cached(&stage));
    assert_eq!(source.rows(), 50);
    assert_eq!(source.chunk_size(), 10);
    assert_eq!(source.len(), 5);
    let stored = concatenate(source.iter()).unwrap();
    assert_eq!(stored, concatenate(ok_chunks(series(5, 10))).unwrap());

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 0);
}

#[test]
fn test_hit_never_pulls_producer() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("series").with_input("upstream");

    let first_pulls = Rc::new(Cell::new(0));
    let first: ChunkSource<f64> = cache
        .materialize(counting(series(3, 4), &first_pulls), &stage)
        .unwrap();
    assert_eq!(first_pulls.get(), 3);

    let second_pulls = Rc::new(Cell::new(0));
    let second: ChunkSource<f64> = cache
        .materialize(counting(series(3, 4), &second_pulls), &stage)
        .unwrap();
    assert_eq!(second_pulls.get(), 0);

    assert_eq!(first.identifier(), second.identifier());
    assert_eq!(
        concatenate(first.iter()).unwrap(),
        concatenate(second.iter()).unwrap()
    );
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_inputs_select_distinct_entries() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let a = Stage::new("series").with_input("a");
    let b = Stage::new("series").with_input("b");

    let _: ChunkSource<f64> = cache.materialize(ok_chunks(series(1, 3)), &a).unwrap();

    assert!(cache.is_cached(&a));
    assert!(!cache.is_cached(&b));
    assert!(!cache.is_cached(&a.clone().with_version("2")));
    assert_ne!(cache.stage_identifier(&a), cache.stage_identifier(&b));
}

#[test]
fn test_passthrough_carries_stored_identifier() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("series").with_input("upstream");

    let bypassed: CachedStage<_, f64> = cache
        .cache(ok_chunks(series(2, 3)), &stage.clone().active(false))
        .unwrap();
    assert!(!bypassed.is_stored());
    let bypassed_id = bypassed.identifier();
    let chunks: Vec<ArrayD<f64>> = bypassed
        .into_iter()
        .collect::<chunkcache::Result<_>>()
        .unwrap();
    assert_eq!(chunks, series(2, 3));
    assert!(!cache.entry_path(&stage).exists());

    let stored: CachedStage<_, f64> = cache.cache(ok_chunks(series(2, 3)), &stage).unwrap();
    assert!(stored.is_stored());
    assert_eq!(stored.identifier(), bypassed_id);
    assert_eq!(
        bypassed_id,
        fingerprint([cache.entry_path(&stage).to_string_lossy().as_bytes(), b"data".as_slice()])
    );
    assert_eq!(cache.stats().passthrough, 1);
}

#[test]
fn test_failed_producer_leaves_no_entry() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("flaky");

    let mut items: Vec<chunkcache::Result<ArrayD<f64>>> =
        series(2, 5).into_iter().map(Ok).collect();
    items.push(Err(CacheError::Producer(anyhow::anyhow!("sensor offline"))));

    let result: chunkcache::Result<ChunkSource<f64>> = cache.materialize(items.into_iter(), &stage);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("sensor offline"));
    assert!(!cache.entry_path(&stage).exists());
    assert!(!cache.is_cached(&stage));

    let recovered: ChunkSource<f64> =
        cache.materialize(ok_chunks(series(3, 5)), &stage).unwrap();
    assert_eq!(recovered.rows(), 15);
}

#[test]
fn test_incomplete_entry_is_recomputed() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("series");
    let path = cache.entry_path(&stage);

    // A run that was interrupted after persisting its data but before the sentinel
    for chunk in StreamSink::<_, f64, ArrayD<f64>>::new(ok_chunks(series(1, 4)), &path) {
        chunk.unwrap();
    }
    assert!(path.exists());
    assert!(!cache.is_cached(&stage));

    let pulls = Rc::new(Cell::new(0));
    let source: ChunkSource<f64> = cache.materialize(counting(series(2, 4), &pulls), &stage).unwrap();

    assert_eq!(pulls.get(), 2);
    assert_eq!(source.rows(), 8);
    assert_eq!(cache.stats().discarded, 1);
}

#[test]
fn test_corrupt_entry_is_recomputed() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("series");
    fs::write(cache.entry_path(&stage), b"definitely not a container").unwrap();

    let source: ChunkSource<f64> = cache.materialize(ok_chunks(series(2, 2)), &stage).unwrap();

    assert_eq!(source.rows(), 4);
    assert!(cache.is_cached(&stage));
}

#[test]
fn test_empty_producer_is_cached() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("nothing");

    let source: ChunkSource<f64> = cache.materialize(std::iter::empty(), &stage).unwrap();

    assert!(cache.is_cached(&stage));
    assert!(source.is_empty());
    assert_eq!(source.iter().count(), 0);
}

#[test]
fn test_multi_stream_stage() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("pairs");

    let records = (0..3).map(|i| {
        Ok(vec![
            Array1::from_elem(4, i as f64).into_dyn(),
            Array2::from_elem((4, 2), -(i as f64)).into_dyn(),
        ])
    });
    let source: ChunkSource<f64, Vec<ArrayD<f64>>> = cache.materialize(records, &stage).unwrap();

    assert_eq!(source.shape("data0"), Some(&[12][..]));
    assert_eq!(source.shape("data1"), Some(&[12, 2][..]));
    let read: Vec<Vec<ArrayD<f64>>> = source.iter().collect::<chunkcache::Result<_>>().unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(read[2][0], Array1::from_elem(4, 2.0).into_dyn());
    assert_eq!(read[2][1], Array2::from_elem((4, 2), -2.0).into_dyn());
}

#[test]
fn test_reversed_source_mirrors_forward() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());
    let stage = Stage::new("series");
    let source: ChunkSource<f64> = cache.materialize(ok_chunks(series(4, 7)), &stage).unwrap();

    let reversed = source.reversed();
    let mut backwards = concatenate(reversed.iter()).unwrap();
    backwards.invert_axis(Axis(0));
    assert_eq!(backwards, concatenate(source.iter()).unwrap());

    assert_ne!(reversed.identifier(), source.identifier());
    assert_eq!(reversed.reversed().identifier(), source.identifier());
    assert_eq!(
        reversed.identifier(),
        fingerprint([source.identifier().as_ref(), b"reversed".as_slice()])
    );
}

#[test]
fn test_downstream_stage_keyed_by_upstream_identifier() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());

    let raw: ChunkSource<f64> = cache
        .materialize(ok_chunks(series(2, 5)), &Stage::new("raw"))
        .unwrap();
    let doubled_stage = Stage::new("doubled").with_input(raw.identifier());
    let doubled: ChunkSource<f64> = cache
        .materialize(raw.iter().map(|c| c.map(|c| c * 2.0)), &doubled_stage)
        .unwrap();

    assert_eq!(concatenate(doubled.iter()).unwrap()[[9]], 18.0);
    let other = Stage::new("doubled").with_input(Identifier::random());
    assert_ne!(cache.entry_path(&other), cache.entry_path(&doubled_stage));
}

#[test]
fn test_entries_and_pruning() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ChunkCache::in_dir(temp_dir.path());

    let old = Stage::new("series").with_version("1");
    let new = Stage::new("series").with_version("2");
    let unrelated = Stage::new("other").with_version("1");
    for stage in [&old, &new, &unrelated] {
        let _: ChunkSource<f64> = cache.materialize(ok_chunks(series(1, 2)), stage).unwrap();
    }
    fs::write(temp_dir.path().join("broken.1.0.ckc"), b"partial").unwrap();
    fs::write(temp_dir.path().join("README.txt"), b"not an entry").unwrap();

    let entries = cache.entries().unwrap();
    assert_eq!(entries.len(), 4);
    let broken = entries.iter().find(|e| e.name == "broken").unwrap();
    assert!(!broken.complete);
    let finished = entries.iter().find(|e| e.name == "other").unwrap();
    assert!(finished.complete);
    assert!(finished.computation_time.is_some());
    assert!(finished.modified.is_some());

    let removed = cache.prune_stale("series", "2").unwrap();
    assert_eq!(removed, vec![cache.entry_path(&old)]);
    assert!(cache.is_cached(&new));
    assert!(cache.is_cached(&unrelated));

    let removed = cache.prune_incomplete().unwrap();
    assert_eq!(removed, vec![temp_dir.path().join("broken.1.0.ckc")]);
    assert_eq!(cache.entries().unwrap().len(), 2);
}
