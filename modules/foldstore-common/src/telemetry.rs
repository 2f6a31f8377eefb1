//! Logging setup shared by the binaries.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Set to any value to emit JSON log lines instead of human-readable ones.
pub const LOG_JSON_ENV: &str = "FOLDSTORE_LOG_JSON";

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` directives apply as usual; the foldstore crates log at info
/// unless a more specific directive names them.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive("foldstore=info".parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if std::env::var_os(LOG_JSON_ENV).is_some() {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
