//! Log subscriber bootstrap for binaries and tests.

use crate::error::{Result, StoreError};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber honoring the given filter directive
/// (e.g. `"info"` or `"seglog=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StoreError::BadOperation(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StoreError::BadOperation("logging already initialized".into()))
}
