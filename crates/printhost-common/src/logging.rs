//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Shared primitives and utilities for the core runtime."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

const LOG_ENV: &str = "PRINTHOST_LOG";

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    StructuredJson,
}

/// Where and how verbosely the daemon logs.
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Write records to this file through a background worker instead of stderr.
    pub file: Option<PathBuf>,
    pub verbose: bool,
    pub format: LogFormat,
}

/// Keeps the background log writer alive. Dropping it flushes queued records
/// and joins the worker thread.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Initialize the tracing subscriber.
///
/// * `PRINTHOST_LOG` overrides the log filter (e.g. `info`, `debug,printhost_rt=trace`).
///   When unset the standard `RUST_LOG` variable is honoured, finally defaulting to
///   `info`, or `debug` when `verbose` is set.
/// * Records are formatted on the calling thread and handed to a non-blocking
///   writer; a dedicated worker thread performs the actual disk or stderr I/O so
///   the reactor never waits on it.
pub fn init_tracing(service_name: &str, options: &LoggingOptions) -> Result<LoggingGuard> {
    let default_level = if options.verbose { "debug" } else { "info" };
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to {} logging",
                LOG_ENV, err, default_level
            );
            EnvFilter::new(default_level)
        }),
        Err(_) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
        }
    };

    let (writer, worker) = match &options.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path {} has no file name", path.display()))?;
            std::fs::create_dir_all(&directory).with_context(|| {
                format!("unable to create log directory {}", directory.display())
            })?;
            let appender = tracing_appender::rolling::never(&directory, file_name);
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let fmt_layer = match options.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_ansi(options.file.is_none())
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(writer)
            .boxed(),
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_file = ?options.file,
        format = ?options.format,
        "tracing initialised"
    );
    Ok(LoggingGuard { _worker: worker })
}
