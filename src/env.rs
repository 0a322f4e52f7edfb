//! Defaults that can be overridden from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Directory that holds the partitioned latency files.
pub fn latency_dir() -> PathBuf {
    std::env::var_os("SAT_LATENCY_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./latencies"))
}

/// How many records to accumulate before writing a batch.
pub fn batch_max_size() -> usize {
    read_parsed("SAT_LATENCY_BATCH_SIZE").unwrap_or(1024)
}

/// How long to let records sit before writing a batch regardless of size.
pub fn batch_max_delay() -> Duration {
    Duration::from_secs(read_parsed("SAT_LATENCY_BATCH_DELAY").unwrap_or(120))
}

fn read_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}
