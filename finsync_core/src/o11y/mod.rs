pub mod redaction;

use crate::config::LogConfig;
use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use redaction::{is_sensitive_key, mask_identifier, redact_message, redact_value, redacted};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `cfg.default_filter`. Fails if a subscriber is
/// already installed.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_global(cfg: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.default_filter.as_str()));

    if cfg.json {
        let fmt = tracing_subscriber::fmt::layer().json().with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init()
            .map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))?;
    } else {
        let fmt = tracing_subscriber::fmt::layer().with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init()
            .map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))?;
    }
    Ok(())
}
