use chunkcache::{
    batch_mean, concatenate, ok_chunks, zero_phase_filter, CacheConfig, ChunkCache, ChunkSource,
    Sos, Stage,
};
use ndarray::{Array1, ArrayD};
use std::time::Instant;

/// Stand-in for an expensive acquisition step: a noisy step signal
fn acquire(chunks: usize, rows: usize) -> impl Iterator<Item = chunkcache::Result<ArrayD<f64>>> {
    (0..chunks).map(move |c| {
        std::thread::sleep(std::time::Duration::from_millis(20));
        let chunk = Array1::from_iter((0..rows).map(|r| {
            let row = c * rows + r;
            let level = if row < chunks * rows / 2 { 1.0 } else { 2.0 };
            level + 0.1 * ((row as f64) * 1.7).sin()
        }));
        Ok(chunk.into_dyn())
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let temp_dir = tempfile::TempDir::new()?;
    let cache = ChunkCache::new(CacheConfig::new(temp_dir.path()));
    let raw_stage = Stage::new("raw").with_version("1");

    for run in 1..=2 {
        let started = Instant::now();

        let raw: ChunkSource<f64> = cache.materialize(acquire(10, 100), &raw_stage)?;
        let sos = Sos::butter2_lowpass(0.05)?;
        let smooth = zero_phase_filter(&cache, &sos, raw.iter(), Some(raw.identifier()))?;

        let averaged_stage = Stage::new("averaged")
            .with_version("1")
            .with_input(smooth.identifier());
        let averaged: ChunkSource<f64> =
            cache.materialize(batch_mean(smooth.iter(), 50, None, false)?, &averaged_stage)?;

        let means = concatenate(averaged.iter())?;
        println!(
            "Run {}: {} batch means in {:?}, first {:.3}, last {:.3}",
            run,
            means.len(),
            started.elapsed(),
            means[[0]],
            means[[means.len() - 1]]
        );
    }

    let stats = cache.stats();
    println!(
        "Cache stats: {} hits, {} misses, hit rate {:.1}%",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );

    for entry in cache.entries()? {
        println!(
            "  {} v{} ({} bytes, computed in {:.3}s)",
            entry.name,
            entry.version,
            entry.size_bytes,
            entry.computation_time.unwrap_or(0.0)
        );
    }

    Ok(())
}
