//! Structured logging bootstrap.
//!
//! Mirrors the original source's idempotent `configure_logging()`: a single
//! call wires `tracing-subscriber` for the whole process, and calling it
//! again is a harmless no-op unless `force` is set.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LogLevel};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global `tracing` subscriber from `SPINE_LOG_LEVEL` /
/// `SPINE_LOG_FORMAT`. Safe to call multiple times; only the first call
/// takes effect unless `force` is `true`.
pub fn init(level: LogLevel, format: LogFormat, force: bool) {
    if !force && INITIALIZED.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter_directive()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Console => subscriber.try_init(),
    };

    if result.is_ok() {
        let _ = INITIALIZED.set(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(LogLevel::Info, LogFormat::Console, false);
        init(LogLevel::Debug, LogFormat::Console, false);
    }
}
