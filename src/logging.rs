//! Tracing subscriber setup for binaries

use tracing_subscriber::EnvFilter;

/// Default filter when neither `RUST_LOG` nor `MULTIFETCH_LOG` is set
pub const DEFAULT_FILTER: &str = "info";

/// Install the global `tracing` subscriber.
///
/// Filter priority:
/// 1) `RUST_LOG`
/// 2) `MULTIFETCH_LOG`
/// 3) `info`
///
/// Example: `RUST_LOG=info,multifetch=debug`
pub fn init_tracing() {
    let filter = resolve_filter(
        std::env::var("RUST_LOG").ok(),
        std::env::var("MULTIFETCH_LOG").ok(),
    );
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A subscriber installed by an embedding program wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .try_init();
}

fn resolve_filter(rust_log: Option<String>, app_log: Option<String>) -> String {
    rust_log
        .filter(|s| !s.trim().is_empty())
        .or_else(|| app_log.filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}
