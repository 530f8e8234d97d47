use crate::dedup::DedupPolicy;
use crate::external_sort::SortConfig;
use crate::memory_config::MemoryConfig;
use crate::pair_expander::PairPolicy;
use crate::reducer::OutputLayout;
use crate::shard::ShardScheme;
use crate::CoaccessError;
use std::ops::RangeInclusive;
use std::path::PathBuf;

pub const DEFAULT_INPUT_ROOT: &str = "/data/json/usage";
pub const DEFAULT_SESSION_CAP: usize = 200;
pub const DEFAULT_TOP_K: usize = 100;
pub const DEFAULT_FLUSH_BUDGET: usize = 20_000_000;
pub const YEAR_RANGE: RangeInclusive<i32> = 2001..=2099;

/// Everything one annual run needs.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub year: i32,
    pub output_dir: PathBuf,
    pub allow_list: PathBuf,
    /// Day files are read from `<input_root>/<year>/`.
    pub input_root: PathBuf,
    pub session_cap: usize,
    pub top_k: usize,
    pub flush_budget: usize,
    pub sort: SortConfig,
    pub pair_policy: PairPolicy,
    pub dedup_policy: DedupPolicy,
    pub shard_scheme: ShardScheme,
    pub layout: OutputLayout,
    pub workers: usize,
    pub resume: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            year: *YEAR_RANGE.start(),
            output_dir: PathBuf::from("."),
            allow_list: PathBuf::from("allow.txt"),
            input_root: PathBuf::from(DEFAULT_INPUT_ROOT),
            session_cap: DEFAULT_SESSION_CAP,
            top_k: DEFAULT_TOP_K,
            flush_budget: DEFAULT_FLUSH_BUDGET,
            sort: SortConfig::default(),
            pair_policy: PairPolicy::default(),
            dedup_policy: DedupPolicy::default(),
            shard_scheme: ShardScheme::default(),
            layout: OutputLayout::default(),
            workers: 4,
            resume: false,
        }
    }
}

impl PipelineConfig {
    pub fn new(year: i32, output_dir: impl Into<PathBuf>, allow_list: impl Into<PathBuf>) -> Self {
        Self {
            year,
            output_dir: output_dir.into(),
            allow_list: allow_list.into(),
            ..Default::default()
        }
    }

    /// Take sort sizing, flush budget and worker count from a memory profile.
    pub fn with_memory(mut self, memory: &MemoryConfig) -> Self {
        self.sort = SortConfig {
            run_budget_bytes: memory.sort_run_budget_bytes,
            fan_in: memory.merge_fan_in,
        };
        self.flush_budget = memory.flush_budget;
        self.workers = memory.workers;
        self
    }

    pub fn day_dir(&self) -> PathBuf {
        self.input_root.join(self.year.to_string())
    }

    /// Reject a configuration before any work starts.
    pub fn validate(&self) -> Result<(), CoaccessError> {
        if !YEAR_RANGE.contains(&self.year) {
            return Err(CoaccessError::Config(format!(
                "year {} outside {}..={}",
                self.year,
                YEAR_RANGE.start(),
                YEAR_RANGE.end()
            )));
        }
        if !self.output_dir.is_dir() {
            return Err(CoaccessError::Config(format!(
                "output directory {} does not exist",
                self.output_dir.display()
            )));
        }
        if !self.allow_list.is_file() {
            return Err(CoaccessError::Config(format!(
                "allow-list {} does not exist",
                self.allow_list.display()
            )));
        }
        if self.session_cap < 2 {
            return Err(CoaccessError::Config("session cap must be at least 2".to_string()));
        }
        if self.top_k == 0 {
            return Err(CoaccessError::Config("top-k must be at least 1".to_string()));
        }
        if self.sort.fan_in < 2 {
            return Err(CoaccessError::Config("merge fan-in must be at least 2".to_string()));
        }
        if self.sort.run_budget_bytes == 0 {
            return Err(CoaccessError::Config("sort run budget must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(CoaccessError::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}
