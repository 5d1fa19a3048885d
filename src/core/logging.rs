use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Console logging setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `parpipe=debug`
    pub filter: String,
    /// Print worker thread names on every line
    pub with_thread_names: bool,
    /// Emit ANSI colors
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "parpipe=info".to_string(),
            with_thread_names: true,
            ansi: false,
        }
    }
}

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins over the configured filter when it is set. Calling this
/// more than once is harmless: later calls leave the first subscriber in place
/// and return `false`.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_names(config.with_thread_names)
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if !installed {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }
    installed
}
