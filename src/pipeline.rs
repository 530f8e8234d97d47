use crate::aggregator::{self, AggregateStats};
use crate::allow_list::AllowList;
use crate::archive;
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::dedup::{DedupStats, Deduplicator};
use crate::layout::RunLayout;
use crate::normalizer::{NormalizeStats, Normalizer};
use crate::pair_expander::PairExpander;
use crate::reducer::{ReduceStats, Reducer};
use crate::shard::FsShardStore;
use crate::CoaccessError;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Where a run is. Stages only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Normalizing,
    Deduplicating,
    Expanding,
    Aggregating,
    Reducing,
    Done,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::Normalizing => Stage::Deduplicating,
            Stage::Deduplicating => Stage::Expanding,
            Stage::Expanding => Stage::Aggregating,
            Stage::Aggregating => Stage::Reducing,
            Stage::Reducing | Stage::Done => Stage::Done,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Normalizing => "normalizing",
            Stage::Deduplicating => "deduplicating",
            Stage::Expanding => "expanding",
            Stage::Aggregating => "aggregating",
            Stage::Reducing => "reducing",
            Stage::Done => "done",
        }
    }

    /// Stages finished before this one starts.
    fn index(self) -> usize {
        match self {
            Stage::Normalizing => 0,
            Stage::Deduplicating => 1,
            Stage::Expanding => 2,
            Stage::Aggregating => 3,
            Stage::Reducing => 4,
            Stage::Done => STAGE_COUNT,
        }
    }
}

const STAGE_COUNT: usize = 5;

/// Statistics for every stage that ran, plus the stages reused from an earlier run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineReport {
    pub year: i32,
    pub normalize: Option<NormalizeStats>,
    pub dedup: Option<DedupStats>,
    pub aggregate: Option<AggregateStats>,
    pub reduce: Option<ReduceStats>,
    pub reused: Vec<Stage>,
    pub elapsed_secs: f64,
}

pub struct Pipeline {
    config: PipelineConfig,
    layout: RunLayout,
    cancel: CancelToken,
    stage: Stage,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, cancel: CancelToken) -> Self {
        let layout = RunLayout::new(&config.output_dir, config.year);
        Self {
            config,
            layout,
            cancel,
            stage: Stage::Normalizing,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// With `--resume`, an output that already exists is taken as complete.
    fn reuse(&self, output: &Path, report: &mut PipelineReport) -> bool {
        if self.config.resume && output.exists() {
            info!(stage = ?self.stage, output = %output.display(), "reusing completed stage output");
            report.reused.push(self.stage);
            return true;
        }
        false
    }

    fn advance(&mut self) {
        let next = self.stage.next();
        info!(from = ?self.stage, to = ?next, "stage transition");
        self.stage = next;
    }

    /// Drive the run from `Normalizing` to `Done`, halting on the first error.
    pub fn run(&mut self) -> Result<PipelineReport, CoaccessError> {
        self.config.validate()?;
        let started = Instant::now();
        let mut report = PipelineReport {
            year: self.config.year,
            ..Default::default()
        };
        info!(year = self.config.year, output = %self.config.output_dir.display(), "starting co-access run");

        let expander = PairExpander::new(self.config.pair_policy, self.config.session_cap);
        while self.stage != Stage::Done {
            if self.cancel.is_cancelled() {
                return Err(CoaccessError::Cancelled {
                    stage: self.stage.name(),
                    completed: self.stage.index(),
                    total: Some(STAGE_COUNT),
                });
            }
            match self.stage {
                Stage::Normalizing => {
                    let output = self.layout.normalized_path();
                    if !self.reuse(&output, &mut report) {
                        let allow_list = AllowList::load(&self.config.allow_list)?;
                        let day_files = archive::list_day_files(&self.config.day_dir())?;
                        if day_files.is_empty() {
                            warn!(dir = %self.config.day_dir().display(), "no day files found");
                        }
                        let normalizer = Normalizer::new(&allow_list, self.config.workers, self.cancel.clone());
                        report.normalize = Some(normalizer.run(&day_files, &output)?);
                    }
                }
                Stage::Deduplicating => {
                    let output = self.layout.deduplicated_path();
                    if !self.reuse(&output, &mut report) {
                        let dedup = Deduplicator::new(
                            self.config.sort.clone(),
                            self.config.dedup_policy,
                            self.cancel.clone(),
                        );
                        report.dedup = Some(dedup.run(
                            &self.layout.normalized_path(),
                            &output,
                            &self.layout.sort_dir(),
                        )?);
                    }
                }
                Stage::Expanding => {
                    // Expansion streams straight into the aggregator; nothing is materialized here.
                    info!(policy = ?expander.policy(), session_cap = self.config.session_cap, "session expansion ready");
                }
                Stage::Aggregating => {
                    let output = self.layout.shard_dir();
                    if !self.reuse(&output, &mut report) {
                        report.aggregate = Some(aggregator::aggregate_sessions(
                            &self.layout.deduplicated_path(),
                            &output,
                            &expander,
                            self.config.shard_scheme.clone(),
                            self.config.flush_budget,
                            &self.cancel,
                        )?);
                    }
                }
                Stage::Reducing => {
                    let output = self.layout.final_dir();
                    if !self.reuse(&output, &mut report) {
                        let store = FsShardStore::open(self.layout.shard_dir(), self.config.shard_scheme.clone())?;
                        let reducer = Reducer::new(
                            self.config.top_k,
                            self.config.layout,
                            self.config.workers,
                            self.cancel.clone(),
                        );
                        report.reduce = Some(reducer.run(&store, &output)?);
                    }
                }
                Stage::Done => {}
            }
            self.advance();
        }

        report.elapsed_secs = started.elapsed().as_secs_f64();
        write_report(&self.layout.report_path(), &report)?;
        info!(
            elapsed_secs = report.elapsed_secs,
            reused = report.reused.len(),
            report = %self.layout.report_path().display(),
            "co-access run complete"
        );
        Ok(report)
    }
}

fn write_report(path: &Path, report: &PipelineReport) -> Result<(), CoaccessError> {
    let tmp = crate::layout::clear_temp(path)?;
    fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
