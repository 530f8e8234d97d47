use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use coaccess::cancel::CancelToken;
use coaccess::config::{self, PipelineConfig};
use coaccess::dedup::DedupPolicy;
use coaccess::external_sort::SortConfig;
use coaccess::memory_config::MemoryConfig;
use coaccess::pair_expander::PairPolicy;
use coaccess::pipeline::Pipeline;
use coaccess::reducer::OutputLayout;
use coaccess::shard::ShardScheme;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "coaccess")]
#[command(about = "Rank documents by how often they are viewed in the same user session over one year", long_about = None)]
struct Cli {
    /// Year to process (2001..=2099)
    #[arg(value_parser = clap::value_parser!(i32).range(2001..=2099))]
    year: i32,
    /// Existing directory that receives every stage output
    output_dir: PathBuf,
    /// Newline-delimited list of valid document ids
    allow_list: PathBuf,

    /// Root of the daily usage archive; day files are read from <input-root>/<year>/
    #[arg(long, default_value = config::DEFAULT_INPUT_ROOT)]
    input_root: PathBuf,
    /// Sessions with more documents than this contribute nothing
    #[arg(long, default_value_t = config::DEFAULT_SESSION_CAP)]
    session_cap: usize,
    /// Neighbors kept per document
    #[arg(long, default_value_t = config::DEFAULT_TOP_K)]
    top_k: usize,
    /// Stored neighbor references buffered before a flush (default from system memory)
    #[arg(long)]
    flush_budget: Option<usize>,
    /// Bytes of records per sorted run (default from system memory)
    #[arg(long)]
    sort_run_budget: Option<usize>,
    /// Runs merged at once (default from system memory)
    #[arg(long)]
    fan_in: Option<usize>,
    #[arg(long, value_enum, default_value_t = PairPolicy::FullCross)]
    pair_policy: PairPolicy,
    #[arg(long, value_enum, default_value_t = DedupPolicy::Earliest)]
    dedup_policy: DedupPolicy,
    /// `prefix` or `hash:N`
    #[arg(long, default_value = "prefix")]
    shard_scheme: ShardScheme,
    #[arg(long, value_enum, default_value_t = OutputLayout::PerDocument)]
    layout: OutputLayout,
    /// Worker threads for normalizing and reducing (default: CPU count)
    #[arg(long)]
    workers: Option<usize>,
    /// Reuse stage outputs left by an earlier run instead of refusing them
    #[arg(long)]
    resume: bool,
}

impl Cli {
    fn into_config(self, memory: &MemoryConfig) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.year, self.output_dir, self.allow_list).with_memory(memory);
        config.input_root = self.input_root;
        config.session_cap = self.session_cap;
        config.top_k = self.top_k;
        config.sort = SortConfig {
            run_budget_bytes: self.sort_run_budget.unwrap_or(config.sort.run_budget_bytes),
            fan_in: self.fan_in.unwrap_or(config.sort.fan_in),
        };
        config.flush_budget = self.flush_budget.unwrap_or(config.flush_budget);
        config.workers = self.workers.unwrap_or(config.workers);
        config.pair_policy = self.pair_policy;
        config.dedup_policy = self.dedup_policy;
        config.shard_scheme = self.shard_scheme;
        config.layout = self.layout;
        config.resume = self.resume;
        config
    }
}

fn main() -> ExitCode {
    coaccess::init_tracing();
    let cli = Cli::parse();

    let memory = MemoryConfig::calculate();
    let config = cli.into_config(&memory);
    if let Err(e) = config.validate() {
        Cli::command().error(ErrorKind::ValueValidation, e).exit();
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current unit");
        handler_token.cancel();
    }) {
        warn!(error = %e, "could not install interrupt handler");
    }

    let mut pipeline = Pipeline::new(config, cancel);
    match pipeline.run() {
        Ok(report) => {
            if let Some(reduce) = &report.reduce {
                info!(documents = reduce.documents, lines = reduce.lines_written, "ranked output written");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(stage = ?pipeline.stage(), error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}
