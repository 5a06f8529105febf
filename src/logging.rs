//! Logging setup and the per-component verbosity switch.

#[cfg(debug_assertions)]
const DEFAULT_LEVEL: tracing::Level = tracing::Level::DEBUG;
#[cfg(not(debug_assertions))]
const DEFAULT_LEVEL: tracing::Level = tracing::Level::INFO;

/// Verbosity handed to each component at construction time.
///
/// Operation lines (`mkdir`, `exec`, `copy`, ...) are logged at `info` when
/// `verbose` is set and at `debug` otherwise, so a component can be made
/// chatty without touching the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub verbose: bool,
}

impl LogConfig {
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn op(self, args: std::fmt::Arguments<'_>) {
        if self.verbose {
            tracing::info!("{args}");
        } else {
            tracing::debug!("{args}");
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the defaults.
pub fn init_tracing(log: LogConfig) {
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    let level = if log.verbose {
        tracing::Level::DEBUG
    } else {
        DEFAULT_LEVEL
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
