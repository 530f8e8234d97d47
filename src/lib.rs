pub mod aggregator;
pub mod allow_list;
pub mod archive;
pub mod cancel;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod external_sort;
pub mod layout;
pub mod memory_config;
pub mod normalizer;
pub mod pair_expander;
pub mod pipeline;
pub mod reducer;
pub mod shard;

pub use error::*;

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
