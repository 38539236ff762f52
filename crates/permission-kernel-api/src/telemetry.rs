use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
///
/// # Errors
/// Returns an error when `default_filter` is not a valid filter directive.
pub fn init_tracing(default_filter: &str) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid tracing filter `{default_filter}`"))?,
    };
    Ok(tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init().is_ok())
}
