use crate::cancel::CancelToken;
use crate::layout;
use crate::pair_expander::{ExpandStats, Expansion, PairExpander};
use crate::shard::{FsShardStore, ShardScheme, ShardStore};
use crate::CoaccessError;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub expand: ExpandStats,
    pub neighbor_lines: u64,
    pub flushes: usize,
    pub documents_touched: usize,
}

/// Buffers neighbor lists in memory and appends them to a shard store when
/// the stored-reference cost passes `budget`.
pub struct PairSaver<S> {
    store: S,
    budget: usize,
    buffer: FxHashMap<String, Vec<Arc<[String]>>>,
    cost: usize,
    total_emitted: u64,
    flush_count: usize,
}

impl<S: ShardStore> PairSaver<S> {
    pub fn new(store: S, budget: usize) -> Self {
        Self {
            store,
            budget,
            buffer: FxHashMap::default(),
            cost: 0,
            total_emitted: 0,
            flush_count: 0,
        }
    }

    pub fn add(&mut self, expansion: Expansion) -> Result<(), CoaccessError> {
        self.cost += expansion.cost();
        for (document, neighbors) in expansion.entries {
            self.buffer.entry(document).or_default().push(neighbors);
        }
        if self.cost > self.budget {
            self.flush()?;
        }
        Ok(())
    }

    /// Write every buffered document's neighbors, keys in sorted order.
    ///
    /// A key leaves the buffer only once its append has succeeded, so a
    /// failed flush can be retried without writing any document twice.
    pub fn flush(&mut self) -> Result<(), CoaccessError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut keys: Vec<String> = self.buffer.keys().cloned().collect();
        keys.sort_unstable();

        let documents = keys.len();
        let mut emitted = 0u64;
        for key in keys {
            if let Some(lists) = self.buffer.get(&key) {
                let neighbors: Vec<&str> = lists
                    .iter()
                    .flat_map(|list| list.iter())
                    .filter(|neighbor| **neighbor != key)
                    .map(String::as_str)
                    .collect();
                if !neighbors.is_empty() {
                    let written = self.store.append(&key, &neighbors)?;
                    emitted += written;
                    self.total_emitted += written;
                }
            }
            self.buffer.remove(&key);
        }

        let cost = self.cost;
        self.cost = 0;
        self.flush_count += 1;
        info!(
            flush = self.flush_count,
            documents,
            cost,
            lines = emitted,
            total_lines = self.total_emitted,
            "flushed pair buffer"
        );
        Ok(())
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn total_emitted(&self) -> u64 {
        self.total_emitted
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Flush what is left and hand back the store.
    pub fn finish(mut self) -> Result<S, CoaccessError> {
        self.flush()?;
        debug!(flushes = self.flush_count, lines = self.total_emitted, "pair saver finished");
        Ok(self.store)
    }
}

/// Expand the deduplicated triple file at `input` and aggregate it into
/// a shard directory at `shard_dir`. Cancellation is checked between sessions.
pub fn aggregate_sessions(
    input: &Path,
    shard_dir: &Path,
    expander: &PairExpander,
    scheme: ShardScheme,
    flush_budget: usize,
    cancel: &CancelToken,
) -> Result<AggregateStats, CoaccessError> {
    info!(input = %input.display(), shards = %shard_dir.display(), scheme = %scheme, flush_budget, "aggregating pairs");

    layout::ensure_absent(shard_dir)?;
    let tmp = layout::clear_temp(shard_dir)?;
    let store = FsShardStore::new(&tmp, scheme)?;
    let mut saver = PairSaver::new(store, flush_budget);

    let reader = BufReader::new(File::open(input)?);
    let mut aggregated = 0usize;
    let cancelled = |completed: usize| CoaccessError::Cancelled {
        stage: "aggregating",
        completed,
        total: None,
    };
    let expand = expander.run(reader, |expansion| {
        if cancel.is_cancelled() {
            return Err(cancelled(aggregated));
        }
        saver.add(expansion)?;
        aggregated += 1;
        Ok(())
    })?;
    if cancel.is_cancelled() {
        return Err(cancelled(aggregated));
    }

    saver.flush()?;
    let neighbor_lines = saver.total_emitted();
    let flushes = saver.flush_count();
    let store = saver.finish()?;
    let documents_touched = store
        .shards()?
        .iter()
        .map(|shard| store.keys(shard).map(|keys| keys.len()))
        .sum::<Result<usize, CoaccessError>>()?;
    drop(store);
    layout::publish(&tmp, shard_dir)?;

    Ok(AggregateStats {
        expand,
        neighbor_lines,
        flushes,
        documents_touched,
    })
}
