pub mod cbt;
pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod models;
pub mod planner;
pub mod records;
pub mod remote;
pub mod restore;
pub mod retention;
pub mod snapshot;
pub mod transfer;

#[cfg(test)]
mod testing;

/// Installs the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
        )
        .with_target(false)
        .init();
}
