//! Subscriber setup for hosts embedding kmux.
//!
//! Components log through `tracing` with `connection_id` and `stream_id`
//! fields. This module only installs a subscriber for them.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::InvalidConfig {
                message: format!("unknown log format {other:?}"),
            }),
        }
    }
}

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// `RUST_LOG` wins over the verbosity-derived filter.
fn filter_for(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kmux_core={}", level_for(verbosity))))
}

/// Install the global subscriber.
///
/// * `verbosity` - 0=error, 1=warn, 2=info, 3=debug, 4+=trace
/// * `log_file` - append to this file instead of stderr
/// * `format` - text or JSON
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let (writer, ansi) = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let detailed = verbosity >= 3;
    let registry = tracing_subscriber::registry().with(filter_for(verbosity));
    let installed = match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_thread_ids(verbosity >= 4)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(writer)).try_init(),
    };
    installed.map_err(|e| Error::Io(io::Error::other(e.to_string())))
}

/// Debug-level text logging for tests. Ignores an already installed
/// subscriber.
pub fn init_test_logging() {
    let _ = init_logging(3, None, LogFormat::Text);
}
