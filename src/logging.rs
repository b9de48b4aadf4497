//! Structured logging initialisation.
//!
//! Console output always; an additional JSON file layer when
//! `ASYNCGATE_LOG_DIR` is set, for shipping into log pipelines. Init is
//! guarded so embedding hosts that already installed a subscriber keep it.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing for the engine process. Safe to call more than once.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_env("ASYNCGATE_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(filter);

        let registry = tracing_subscriber::registry().with(console_layer);

        if let Ok(log_dir) = std::env::var("ASYNCGATE_LOG_DIR") {
            let dir = PathBuf::from(log_dir);
            let file_appender = tracing_appender::rolling::daily(&dir, "asyncgate.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .json()
                .with_filter(
                    EnvFilter::try_from_env("ASYNCGATE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
                );

            if registry.with(file_layer).try_init().is_ok() {
                // Keep the non-blocking writer alive for the process lifetime.
                std::mem::forget(guard);
            }
        } else if registry.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }
    });
}
