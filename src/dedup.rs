use crate::cancel::CancelToken;
use crate::event::AccessEvent;
use crate::external_sort::{ExternalSorter, SortConfig};
use crate::layout;
use crate::CoaccessError;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Which triple survives when one user viewed one document several times.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub input: u64,
    pub malformed: u64,
    pub retained: u64,
    pub duplicates: u64,
    pub sort_runs: usize,
}

/// Collapses adjacent triples with the same (user, document).
///
/// Input must be sorted by (user, document, timestamp); the first triple of a
/// group is then the earliest view and the last is the latest.
pub struct DedupIter<I> {
    inner: I,
    policy: DedupPolicy,
    pending: Option<AccessEvent>,
    duplicates: u64,
}

impl<I> DedupIter<I> {
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

impl<I> Iterator for DedupIter<I>
where
    I: Iterator<Item = Result<AccessEvent, CoaccessError>>,
{
    type Item = Result<AccessEvent, CoaccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let event = match self.inner.next() {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Some(Err(e)),
                None => return self.pending.take().map(Ok),
            };
            match self.pending.as_mut() {
                None => self.pending = Some(event),
                Some(pending) if pending.same_view(&event) => {
                    self.duplicates += 1;
                    if self.policy == DedupPolicy::Latest {
                        *pending = event;
                    }
                }
                Some(_) => return self.pending.replace(event).map(Ok),
            }
        }
    }
}

pub fn dedup_sorted<I>(sorted: I, policy: DedupPolicy) -> DedupIter<I::IntoIter>
where
    I: IntoIterator<Item = Result<AccessEvent, CoaccessError>>,
{
    DedupIter {
        inner: sorted.into_iter(),
        policy,
        pending: None,
        duplicates: 0,
    }
}

/// Session deduplicator: external sort by (user, document, timestamp), then one
/// linear pass that keeps a single triple per (user, document).
pub struct Deduplicator {
    sort_config: SortConfig,
    policy: DedupPolicy,
    cancel: CancelToken,
}

impl Deduplicator {
    pub fn new(sort_config: SortConfig, policy: DedupPolicy, cancel: CancelToken) -> Self {
        Self {
            sort_config,
            policy,
            cancel,
        }
    }

    fn cancelled(completed: u64) -> CoaccessError {
        CoaccessError::Cancelled {
            stage: "deduplicating",
            completed: completed as usize,
            total: None,
        }
    }

    pub fn run(&self, input: &Path, output: &Path, scratch_dir: &Path) -> Result<DedupStats, CoaccessError> {
        info!(input = %input.display(), policy = ?self.policy, "deduplicating access records");

        layout::ensure_absent(output)?;
        let tmp = layout::clear_temp(output)?;
        if scratch_dir.exists() {
            std::fs::remove_dir_all(scratch_dir)?;
        }
        let mut sorter = ExternalSorter::new(scratch_dir, self.sort_config.clone())?;

        let mut stats = DedupStats::default();
        let reader = BufReader::new(File::open(input)?);
        let cancel = &self.cancel;
        let records = reader.lines().filter_map(|line| match line {
            _ if cancel.is_cancelled() => Some(Err(Self::cancelled(stats.input))),
            Err(e) => Some(Err(CoaccessError::from(e))),
            Ok(line) => match AccessEvent::parse_line(&line) {
                Some(event) => {
                    stats.input += 1;
                    Some(Ok(event))
                }
                None => {
                    if !line.trim().is_empty() {
                        stats.malformed += 1;
                    }
                    None
                }
            },
        });
        let sorted = sorter.sort(records)?;
        if self.cancel.is_cancelled() {
            return Err(Self::cancelled(stats.input));
        }

        let mut deduped = dedup_sorted(sorted, self.policy);
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for event in deduped.by_ref() {
            if self.cancel.is_cancelled() {
                return Err(Self::cancelled(stats.retained));
            }
            writeln!(writer, "{}", event?)?;
            stats.retained += 1;
        }
        writer.flush()?;
        drop(writer);
        stats.duplicates = deduped.duplicates();
        stats.sort_runs = sorter.runs_written();
        drop(deduped);

        sorter.finish()?;
        layout::publish(&tmp, output)?;

        info!(
            input = stats.input,
            retained = stats.retained,
            duplicates = stats.duplicates,
            malformed = stats.malformed,
            sort_runs = stats.sort_runs,
            "deduplication complete"
        );
        Ok(stats)
    }
}
