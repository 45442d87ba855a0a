//! Tracing initialization.
//!
//! Console output via `tracing-subscriber`'s fmt layer, filtered by the
//! standard `RUST_LOG` environment variable. Defaults to `info` when
//! `RUST_LOG` is unset or unparseable.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global tracing subscriber.
///
/// Errors if a subscriber is already installed, so call it once at startup.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
