//! Process-wide tracing bootstrap.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// `debug` raises the default filter to `debug`, `quiet` drops it to `error`;
/// an explicit `RUST_LOG` always wins. Safe to call more than once: only the
/// first call installs anything, which lets test harnesses swap in their own
/// subscriber before the code under test runs.
pub fn init(debug: bool, quiet: bool) {
    INITIALIZED.get_or_init(|| {
        let default = if quiet {
            "error"
        } else if debug {
            "debug"
        } else {
            "info"
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
