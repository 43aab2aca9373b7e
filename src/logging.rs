//! Tracing setup for the command line tool.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global subscriber, writing to stderr.
///
/// The filter defaults to `warn` and can be overridden with `RUST_LOG`.
/// Subsequent calls are ignored.
pub fn init_tracing() {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        // A subscriber may already be installed by an embedding application.
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    });
}
