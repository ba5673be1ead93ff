//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "binary"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Binary entrypoint for the printhost daemon."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use printhost_common::config::ConfigStore;
use printhost_common::logging::{init_tracing, LogFormat, LoggingOptions};
use printhost_core::{CommandInput, Orchestrator, ProtocolDictionary};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("printhost ", env!("CARGO_PKG_VERSION")),
    about = "Host-side supervisor for a remote motion controller",
    long_about = None
)]
struct Cli {
    #[arg(value_name = "CONFIG", env = "PRINTHOST_CONFIG", help = "Path to the printer configuration file")]
    config: PathBuf,

    #[arg(short = 'i', long, value_name = "FILE", help = "Read commands from a file instead of the pseudo-terminal")]
    debuginput: Option<PathBuf>,

    #[arg(
        short = 'o',
        long,
        value_name = "FILE",
        requires = "dictionary",
        help = "Write the device command stream to a file instead of the serial port"
    )]
    debugoutput: Option<PathBuf>,

    #[arg(
        short = 'd',
        long,
        value_name = "FILE",
        requires = "debugoutput",
        help = "Protocol dictionary used with --debugoutput"
    )]
    dictionary: Option<PathBuf>,

    #[arg(short = 'l', long, value_name = "FILE", help = "Write the log to a file")]
    logfile: Option<PathBuf>,

    #[arg(short = 'v', long, help = "Enable debug logging")]
    verbose: bool,

    #[arg(long, value_enum, default_value_t = CliLogFormat::Pretty, help = "Log record format")]
    log_format: CliLogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::StructuredJson,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logging = init_tracing(
        "printhostd",
        &LoggingOptions {
            file: cli.logfile.clone(),
            verbose: cli.verbose,
            format: cli.log_format.into(),
        },
    )?;
    info!(config = %cli.config.display(), "starting printer host");

    let input = match &cli.debuginput {
        Some(path) => CommandInput::Replay(
            File::open(path)
                .with_context(|| format!("failed to open debug input {}", path.display()))?,
        ),
        None => CommandInput::Live,
    };
    let config = ConfigStore::load(&cli.config)
        .with_context(|| format!("failed to load configuration {}", cli.config.display()))?;
    let mut orchestrator = Orchestrator::new(Arc::new(config), input)?;

    if let (Some(output), Some(dictionary)) = (&cli.debugoutput, &cli.dictionary) {
        let dictionary = ProtocolDictionary::load(dictionary)?;
        let sink = File::create(output)
            .with_context(|| format!("failed to create debug output {}", output.display()))?;
        orchestrator.connect_file(sink, dictionary)?;
    }

    let report = orchestrator.run()?;
    info!(
        elapsed = report.after_disconnect.elapsed(),
        "printer host exiting"
    );
    Ok(())
}
