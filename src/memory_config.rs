use sysinfo::System;
use tracing::info;

const BYTES_PER_BUFFER_REF: usize = 16;
const READ_BUF_BYTES: usize = 64 * 1024;

/// Memory-dependent sizing for the sort and aggregation stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub sort_run_budget_bytes: usize,
    pub merge_fan_in: usize,
    pub flush_budget: usize,
    pub workers: usize,
}

impl MemoryConfig {
    /// Size the stages against 75% of system RAM.
    ///
    /// Budget breakdown:
    /// - Runtime reserve: 20% of the target
    /// - Sort runs: 40% of the remainder, one run arena at a time
    /// - Aggregator buffer: 40% of the remainder, ~16 bytes per stored reference
    /// - Merge fan-in: one read buffer per open run, clamp(budget / 64KB, 8, 128)
    pub fn calculate() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();
        let cpus = sys.cpus().len().max(1);
        Self::for_resources(sys.total_memory() as usize, cpus)
    }

    /// Pure sizing from total RAM (bytes) and CPU count.
    pub fn for_resources(total_memory: usize, cpus: usize) -> Self {
        let target_memory = (total_memory * 75) / 100;
        let runtime_reserve = target_memory / 5;
        let available = target_memory.saturating_sub(runtime_reserve);

        let sort_memory = (available * 40) / 100;
        let buffer_memory = (available * 40) / 100;

        let sort_run_budget_bytes = sort_memory.clamp(16 * 1_048_576, 4096 * 1_048_576);
        let merge_fan_in = compute_fan_in(sort_memory, READ_BUF_BYTES);
        let flush_budget = (buffer_memory / BYTES_PER_BUFFER_REF).clamp(1_000_000, 200_000_000);
        let workers = cpus.clamp(1, 64);

        let config = Self {
            sort_run_budget_bytes,
            merge_fan_in,
            flush_budget,
            workers,
        };

        info!(
            total_mb = total_memory / 1_048_576,
            target_mb = target_memory / 1_048_576,
            sort_run_mb = config.sort_run_budget_bytes / 1_048_576,
            fan_in = config.merge_fan_in,
            flush_budget = config.flush_budget,
            workers = config.workers,
            "memory configuration"
        );

        config
    }

    /// Fixed configuration for tests or when system info is unavailable.
    pub fn default_config() -> Self {
        Self {
            sort_run_budget_bytes: 256 * 1_048_576,
            merge_fan_in: 64,
            flush_budget: 20_000_000,
            workers: 4,
        }
    }
}

/// clamp(budget / read_buf, 8, 128)
fn compute_fan_in(budget: usize, read_buf_bytes: usize) -> usize {
    if read_buf_bytes == 0 {
        return 8;
    }
    (budget / read_buf_bytes).clamp(8, 128)
}
