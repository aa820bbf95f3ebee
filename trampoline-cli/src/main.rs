//! Trampoline Registry Soak CLI
//!
//! Runs a configurable workload against the trampoline-registry library on
//! its simulated native runtime:
//! - Connects shared closures to many signals from several threads
//! - Schedules thousands of idle, timeout and one-shot sources
//! - Runs the main loop, tears everything down and reports slot-pool pressure

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use trampoline_registry::BridgeError;

mod config;
mod report;
mod soak;

use config::{AppConfig, OutputFormat};

/// Exit code when the native slot pool ran out
const EXIT_SLOTS_EXHAUSTED: u8 = 2;
/// Exit code when teardown left registry state behind
const EXIT_LEAKED_STATE: u8 = 3;

/// Trampoline Registry - soak the callback bridge and report slot usage
#[derive(Parser, Debug)]
#[command(name = "trampoline-cli")]
#[command(about = "Soak the callback bridge and report native slot usage", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the native slot limit
    #[arg(long, value_name = "COUNT")]
    slot_limit: Option<usize>,

    /// Never reuse released slots
    #[arg(long)]
    no_reclaim: bool,

    /// Override the number of worker threads
    #[arg(long, value_name = "COUNT")]
    threads: Option<usize>,

    /// Override the number of main-loop iterations
    #[arg(long, value_name = "COUNT")]
    iterations: Option<usize>,

    /// Report format
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// Output file for the report (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("Trampoline Registry CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using registry library v{}", trampoline_registry::VERSION);

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            log::error!("Teardown left registry state behind");
            ExitCode::from(EXIT_LEAKED_STATE)
        }
        Err(err) => {
            log::error!("{:#}", err);
            match err.downcast_ref::<BridgeError>() {
                Some(BridgeError::SlotsExhausted { .. }) => ExitCode::from(EXIT_SLOTS_EXHAUSTED),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

/// Load the configuration, run the soak and write the report.
/// Returns whether the run was clean.
fn run(args: &Args) -> Result<bool> {
    let config = load(args)?;
    log::debug!("Configuration: {:?}", config);

    let report = soak::run(&config)?;
    report::write_report(&report, config.output.format, config.output.file.as_deref())?;
    Ok(report.is_clean())
}

/// Configuration file (or defaults) with command-line overrides applied
fn load(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(limit) = args.slot_limit {
        config.bridge.slot_limit = limit;
    }
    if args.no_reclaim {
        config.bridge.reclaim_slots = false;
    }
    if let Some(threads) = args.threads {
        config.workload.threads = threads;
    }
    if let Some(iterations) = args.iterations {
        config.workload.iterations = iterations;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
    if let Some(output) = &args.output {
        config.output.file = Some(output.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
