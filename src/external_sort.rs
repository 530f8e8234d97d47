use crate::event::AccessEvent;
use crate::CoaccessError;
use bincode::{Decode, Encode};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Anything the external sorter can spill: totally ordered, bincode-encodable,
/// and able to estimate its own in-memory size.
pub trait SortRecord: Ord + Encode + Decode<()> {
    fn approx_bytes(&self) -> usize;
}

impl SortRecord for AccessEvent {
    fn approx_bytes(&self) -> usize {
        AccessEvent::approx_bytes(self)
    }
}

/// Sizing for run generation and merging.
#[derive(Clone, Debug)]
pub struct SortConfig {
    pub run_budget_bytes: usize,
    pub fan_in: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            run_budget_bytes: 256 * 1024 * 1024,
            fan_in: 64,
        }
    }
}

/// A sorted run of records on disk. The record count is kept alongside the
/// path so readers stop exactly at the end instead of guessing from decode errors.
#[derive(Clone, Debug)]
pub struct Run {
    path: PathBuf,
    len: u64,
}

impl Run {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter<T: Decode<()>>(&self) -> Result<RunIter<T>, CoaccessError> {
        let file = File::open(&self.path)?;
        Ok(RunIter {
            reader: BufReader::new(file),
            remaining: self.len,
            _marker: PhantomData,
        })
    }
}

pub struct RunIter<T> {
    reader: BufReader<File>,
    remaining: u64,
    _marker: PhantomData<T>,
}

impl<T: Decode<()>> Iterator for RunIter<T> {
    type Item = Result<T, CoaccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(
            bincode::decode_from_std_read(&mut self.reader, bincode::config::standard())
                .map_err(CoaccessError::from),
        )
    }
}

struct HeapItem<T> {
    record: T,
    run_idx: usize,
}

impl<T: Ord> PartialEq for HeapItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapItem<T> {}

impl<T: Ord> Ord for HeapItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; earlier runs win ties.
        other
            .record
            .cmp(&self.record)
            .then_with(|| other.run_idx.cmp(&self.run_idx))
    }
}

impl<T: Ord> PartialOrd for HeapItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lazy k-way merge over sorted runs.
pub struct MergeIter<T> {
    iterators: Vec<RunIter<T>>,
    heap: BinaryHeap<HeapItem<T>>,
}

impl<T: SortRecord> MergeIter<T> {
    pub fn open(runs: &[Run]) -> Result<Self, CoaccessError> {
        let mut iterators = runs
            .iter()
            .map(|r| r.iter())
            .collect::<Result<Vec<_>, _>>()?;
        let mut heap = BinaryHeap::with_capacity(iterators.len());
        for (run_idx, iter) in iterators.iter_mut().enumerate() {
            if let Some(record) = iter.next() {
                heap.push(HeapItem {
                    record: record?,
                    run_idx,
                });
            }
        }
        Ok(Self { iterators, heap })
    }
}

impl<T: SortRecord> Iterator for MergeIter<T> {
    type Item = Result<T, CoaccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.heap.pop()?;
        match self.iterators[item.run_idx].next() {
            Some(Ok(record)) => self.heap.push(HeapItem {
                record,
                run_idx: item.run_idx,
            }),
            Some(Err(e)) => return Some(Err(e)),
            None => {}
        }
        Some(Ok(item.record))
    }
}

/// Disk-backed sort: budgeted in-memory chunks are sorted and spilled as
/// runs, then merged with at most `fan_in` runs open at once.
pub struct ExternalSorter {
    config: SortConfig,
    scratch_dir: PathBuf,
    next_run_id: usize,
    runs_written: usize,
}

impl ExternalSorter {
    pub fn new(scratch_dir: impl Into<PathBuf>, config: SortConfig) -> Result<Self, CoaccessError> {
        if config.fan_in < 2 {
            return Err(CoaccessError::Config(format!(
                "merge fan-in must be at least 2, got {}",
                config.fan_in
            )));
        }
        let scratch_dir = scratch_dir.into();
        fs::create_dir_all(&scratch_dir)?;
        Ok(Self {
            config,
            scratch_dir,
            next_run_id: 0,
            runs_written: 0,
        })
    }

    /// Total run files written so far, intermediate merge passes included.
    pub fn runs_written(&self) -> usize {
        self.runs_written
    }

    /// Sort `records`, returning a merged stream in ascending order.
    pub fn sort<T, I>(&mut self, records: I) -> Result<MergeIter<T>, CoaccessError>
    where
        T: SortRecord,
        I: IntoIterator<Item = Result<T, CoaccessError>>,
    {
        let runs = self.write_runs(records)?;
        debug!(runs = runs.len(), "initial sort runs written");
        let runs = self.reduce_runs::<T>(runs)?;
        MergeIter::open(&runs)
    }

    /// Remove every run file and the scratch directory.
    pub fn finish(self) -> Result<(), CoaccessError> {
        if self.scratch_dir.exists() {
            fs::remove_dir_all(&self.scratch_dir)?;
        }
        Ok(())
    }

    fn write_runs<T, I>(&mut self, records: I) -> Result<Vec<Run>, CoaccessError>
    where
        T: SortRecord,
        I: IntoIterator<Item = Result<T, CoaccessError>>,
    {
        let mut runs = Vec::new();
        let mut arena: Vec<T> = Vec::new();
        let mut current_size = 0;

        for record in records {
            let record = record?;
            current_size += record.approx_bytes();
            arena.push(record);

            if current_size >= self.config.run_budget_bytes {
                arena.sort();
                runs.push(self.write_run(arena.drain(..).map(Ok))?);
                current_size = 0;
            }
        }

        if !arena.is_empty() {
            arena.sort();
            runs.push(self.write_run(arena.into_iter().map(Ok))?);
        }

        Ok(runs)
    }

    /// Merge passes until no more than `fan_in` runs remain.
    fn reduce_runs<T: SortRecord>(&mut self, mut runs: Vec<Run>) -> Result<Vec<Run>, CoaccessError> {
        while runs.len() > self.config.fan_in {
            let mut next_pass = Vec::with_capacity(runs.len() / self.config.fan_in + 1);
            for chunk in runs.chunks(self.config.fan_in) {
                let merged = MergeIter::<T>::open(chunk)?;
                next_pass.push(self.write_run(merged)?);
                for run in chunk {
                    fs::remove_file(run.path())?;
                }
            }
            debug!(from = runs.len(), to = next_pass.len(), "merge pass complete");
            runs = next_pass;
        }
        Ok(runs)
    }

    fn write_run<T, I>(&mut self, records: I) -> Result<Run, CoaccessError>
    where
        T: SortRecord,
        I: IntoIterator<Item = Result<T, CoaccessError>>,
    {
        let path = self
            .scratch_dir
            .join(format!("run-{:06}.dat", self.next_run_id));
        self.next_run_id += 1;

        let mut writer = BufWriter::new(File::create(&path)?);
        let mut len = 0u64;
        for record in records {
            bincode::encode_into_std_write(&record?, &mut writer, bincode::config::standard())?;
            len += 1;
        }
        writer.flush()?;
        self.runs_written += 1;

        Ok(Run { path, len })
    }
}
