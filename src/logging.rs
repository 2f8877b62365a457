//! Process-wide tracing setup for the CLI.
//!
//! `RUST_LOG` wins when set. Otherwise crate events log at `info` (or `debug`
//! with `--verbose`) and dependencies at `warn`. `LOG_FORMAT=compact` drops
//! file and line locations for long harvest runs.

use crate::util::env::env_opt;
use anyhow::{anyhow, Result};
use std::str::FromStr;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            other => Err(anyhow!("unknown log format {other:?}")),
        }
    }
}

pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("stream_catalog={level},warn")
}

pub fn init_tracing(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    // Tracing is not up yet, so a bad value falls back silently.
    let format = env_opt("LOG_FORMAT")
        .and_then(|raw| raw.parse::<LogFormat>().ok())
        .unwrap_or_default();

    let builder = SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let installed = match format {
        LogFormat::Full => builder.with_file(true).with_line_number(true).try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}
