//! Logging setup for the gateway binary

use anyhow::anyhow;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Args;

/// Installs the global tracing subscriber. `RUST_LOG` overrides the level chosen from the
///  command line.
pub fn setup_logging(args: &Args, json_format: bool) -> anyhow::Result<()> {
    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let result = if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .try_init()
    }
    else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
    };

    result.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
