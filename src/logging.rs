//! Logging setup for worker binaries.
//!
//! Library code only emits `tracing` events; installing a subscriber is
//! left to the process. [`init`] installs a `fmt` subscriber writing to
//! stderr, filtered by `RUST_LOG` and falling back to `default_level`.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Safe to call more than once.
pub fn init(default_level: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        );

        // Another subscriber (an embedding application, a test harness) wins
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already set");
        }
    });
}
