//! Logging initialization.

use eyre::{Result, WrapErr, eyre};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Logging configuration, the `[log]` section of the node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Only show errors.
    pub quiet: bool,
    /// 0 is info, 1 is debug, anything higher is trace.
    pub verbosity: u8,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
    /// Extra comma separated filter directives, e.g. `vicinity_net_mux=trace`.
    pub filter: Option<String>,
}

/// Builds the filter for `config`.
///
/// The filter is built with the following precedence:
/// 1. If `quiet` is set, only errors are shown
/// 2. Otherwise, start with `RUST_LOG` env var if set, or the level for `verbosity`
/// 3. Apply any directives from `filter`
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    if config.quiet {
        return Ok(EnvFilter::new("error"));
    }

    let base_level = match config.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base_level));

    if let Some(custom_filter) = &config.filter {
        for directive in custom_filter.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let directive = directive
                .parse()
                .wrap_err_with(|| format!("invalid log directive {directive:?}"))?;
            filter = filter.add_directive(directive);
        }
    }
    Ok(filter)
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let installed = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    installed.map_err(|error| eyre!("failed to install the tracing subscriber: {error}"))?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        json = config.json,
        "logging initialized"
    );
    Ok(())
}
