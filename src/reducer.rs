use crate::cancel::CancelToken;
use crate::event::CoAccessRecord;
use crate::layout;
use crate::shard::{escape_key, ShardStore};
use crate::CoaccessError;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Shape of the final ranked output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLayout {
    /// `<out>/<shard>/<escaped-id>`, one file per document.
    #[default]
    PerDocument,
    /// `<out>/<shard>.txt` with a `: <id>` header before each document.
    PerShard,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReduceStats {
    pub shards: usize,
    pub documents: usize,
    pub files_written: usize,
    pub lines_written: u64,
    pub discarded: u64,
}

impl ReduceStats {
    fn merge(&mut self, other: &ReduceStats) {
        self.shards += other.shards;
        self.documents += other.documents;
        self.files_written += other.files_written;
        self.lines_written += other.lines_written;
        self.discarded += other.discarded;
    }
}

/// Order by count descending then neighbor ascending, keep the first `top_k`.
///
/// Returns the ranking and how many neighbors were cut.
pub fn rank_neighbors(counts: FxHashMap<String, u64>, top_k: usize) -> (Vec<(String, u64)>, u64) {
    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_unstable_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));
    let discarded = ranked.len().saturating_sub(top_k) as u64;
    ranked.truncate(top_k);
    (ranked, discarded)
}

/// Count the logged neighbors of `source` and rank them.
pub fn reduce_document<S: ShardStore + ?Sized>(
    store: &S,
    source: &str,
    top_k: usize,
) -> Result<(Vec<CoAccessRecord>, u64), CoaccessError> {
    let mut counts: FxHashMap<String, u64> = FxHashMap::default();
    store.for_each_neighbor(source, &mut |neighbor: &str| {
        if neighbor != source {
            *counts.entry(neighbor.to_string()).or_insert(0) += 1;
        }
    })?;
    let (ranked, discarded) = rank_neighbors(counts, top_k);
    let records = ranked
        .into_iter()
        .map(|(neighbor_document, count)| CoAccessRecord {
            source_document: source.to_string(),
            neighbor_document,
            count,
        })
        .collect();
    Ok((records, discarded))
}

fn write_records<W: Write>(out: &mut W, records: &[CoAccessRecord]) -> Result<(), CoaccessError> {
    for record in records {
        writeln!(out, "{} {}", record.neighbor_document, record.count)?;
    }
    Ok(())
}

/// Reduces every document of a shard store into ranked top-K lists.
pub struct Reducer {
    top_k: usize,
    layout: OutputLayout,
    workers: usize,
    cancel: CancelToken,
}

impl Reducer {
    pub fn new(top_k: usize, layout: OutputLayout, workers: usize, cancel: CancelToken) -> Self {
        Self {
            top_k,
            layout,
            workers: workers.max(1),
            cancel,
        }
    }

    /// Reduce one shard into `out_dir`; stops early on cancellation.
    fn reduce_shard<S: ShardStore + ?Sized>(
        &self,
        store: &S,
        shard: &str,
        keys: &[String],
        out_dir: &Path,
    ) -> Result<ReduceStats, CoaccessError> {
        let mut stats = ReduceStats::default();
        match self.layout {
            OutputLayout::PerDocument => {
                let shard_dir = out_dir.join(shard);
                fs::create_dir_all(&shard_dir)?;
                for key in keys {
                    if self.cancel.is_cancelled() {
                        return Ok(stats);
                    }
                    let (records, discarded) = reduce_document(store, key, self.top_k)?;
                    let mut writer = BufWriter::new(File::create(shard_dir.join(escape_key(key)))?);
                    write_records(&mut writer, &records)?;
                    writer.flush()?;
                    stats.documents += 1;
                    stats.files_written += 1;
                    stats.lines_written += records.len() as u64;
                    stats.discarded += discarded;
                }
            }
            OutputLayout::PerShard => {
                let mut writer = BufWriter::new(File::create(out_dir.join(format!("{}.txt", shard)))?);
                for key in keys {
                    if self.cancel.is_cancelled() {
                        return Ok(stats);
                    }
                    let (records, discarded) = reduce_document(store, key, self.top_k)?;
                    writeln!(writer, ": {}", key)?;
                    write_records(&mut writer, &records)?;
                    stats.documents += 1;
                    stats.lines_written += records.len() as u64;
                    stats.discarded += discarded;
                }
                writer.flush()?;
                stats.files_written += 1;
            }
        }
        stats.shards = 1;
        debug!(shard, documents = stats.documents, "shard reduced");
        Ok(stats)
    }

    /// Reduce every shard of `store` in parallel and publish the result at `output`.
    pub fn run<S: ShardStore + Sync>(&self, store: &S, output: &Path) -> Result<ReduceStats, CoaccessError> {
        info!(output = %output.display(), top_k = self.top_k, layout = ?self.layout, "reducing neighbor counts");

        layout::ensure_absent(output)?;
        let tmp = layout::clear_temp(output)?;
        fs::create_dir_all(&tmp)?;

        let mut units = Vec::new();
        for shard in store.shards()? {
            let keys = store.keys(&shard)?;
            units.push((shard, keys));
        }
        let total: usize = units.iter().map(|(_, keys)| keys.len()).sum();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| CoaccessError::Config(format!("failed to build worker pool: {}", e)))?;

        let results: Vec<Result<ReduceStats, CoaccessError>> = pool.install(|| {
            units
                .par_iter()
                .map(|(shard, keys)| self.reduce_shard(store, shard, keys, &tmp))
                .collect()
        });

        let mut stats = ReduceStats::default();
        for result in results {
            stats.merge(&result?);
        }
        if stats.documents < total {
            return Err(CoaccessError::Cancelled {
                stage: "reducing",
                completed: stats.documents,
                total: Some(total),
            });
        }

        layout::publish(&tmp, output)?;
        info!(
            shards = stats.shards,
            documents = stats.documents,
            files = stats.files_written,
            lines = stats.lines_written,
            discarded = stats.discarded,
            "reduction complete"
        );
        Ok(stats)
    }
}
