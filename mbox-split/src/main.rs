//! mbox-split CLI
//!
//! ```bash
//! # Split an archive into parts of 1000 messages
//! mbox-split split archive.mbox --output split_output
//!
//! # Resume after Ctrl-C or a crash: run the same command again
//! mbox-split split archive.mbox --output split_output
//!
//! # Inspect saved progress
//! mbox-split status --output split_output --input archive.mbox
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use mbox_split::checkpoint::CheckpointStore;
use mbox_split::config::{Config, LogFormat, LoggingConfig};
use mbox_split::mbox::count_messages;
use mbox_split::split::{part_file_name, RunOutcome, SplitController, SplitReport, TracingSink};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Unexpected runtime failure
const EXIT_FAILED: u8 = 1;
/// Configuration or input error
const EXIT_CONFIG: u8 = 2;
/// Stopped on request; running again resumes (EX_TEMPFAIL)
const EXIT_INTERRUPTED: u8 = 75;

#[derive(Parser)]
#[command(name = "mbox-split")]
#[command(about = "Split a large MBOX archive into resumable parts", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split an archive, continuing a previous run when one was interrupted
    Split {
        /// MBOX archive to split
        input: Option<PathBuf>,
        /// Output directory (default: split_output)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Messages per part file (default: 1000)
        #[arg(short = 'n', long, allow_negative_numbers = true)]
        messages_per_part: Option<i64>,
        /// Messages between checkpoints (default: 100)
        #[arg(long, allow_negative_numbers = true)]
        checkpoint_interval: Option<i64>,
    },
    /// Show the progress saved in an output directory
    Status {
        /// Output directory (default: split_output)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Archive to count messages in, for overall progress
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Split {
            input,
            output,
            messages_per_part,
            checkpoint_interval,
        } => {
            if let Some(input) = input {
                config.input_path = Some(input);
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            if let Some(n) = messages_per_part {
                config.messages_per_part = n;
            }
            if let Some(n) = checkpoint_interval {
                config.checkpoint_interval = n;
            }

            split(config).await
        }
        Commands::Status { output, input } => {
            if let Some(output) = output {
                config.output_dir = output;
            }
            if let Some(input) = input {
                config.input_path = Some(input);
            }

            if let Err(e) = init_logging(&config.logging, None) {
                eprintln!("Error: failed to initialize logging: {:#}", e);
                return ExitCode::from(EXIT_FAILED);
            }

            match status(&config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    ExitCode::from(EXIT_FAILED)
                }
            }
        }
    }
}

async fn split(config: Config) -> ExitCode {
    let split_config = match config.split_config() {
        Ok(split_config) => split_config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // The log file lives next to the parts, so the directory must exist first
    let log_file = config.log_file_path();
    if log_file.is_some() {
        if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
            eprintln!(
                "Error: cannot create output directory {}: {}",
                config.output_dir.display(),
                e
            );
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    if let Err(e) = init_logging(&config.logging, log_file.as_deref()) {
        eprintln!("Error: failed to initialize logging: {:#}", e);
        return ExitCode::from(EXIT_FAILED);
    }

    info!("Starting mbox-split v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current message");
            signal_token.cancel();
        }
    });

    let mut controller = SplitController::new(split_config, Arc::new(TracingSink), cancel);
    let report = controller.run().await;

    match &report.outcome {
        RunOutcome::Completed => {
            println!("\nDone! Messages written: {}", report.messages_written);
            println!("Parts: {}", report.parts);
            print_elapsed(&report);
            if let Some(path) = &log_file {
                println!("Log saved to: {}", path.display());
            }
            ExitCode::SUCCESS
        }
        RunOutcome::Interrupted => {
            println!("\nInterrupted. Messages written: {}", report.messages_written);
            print_resume_point(&report);
            print_elapsed(&report);
            ExitCode::from(EXIT_INTERRUPTED)
        }
        RunOutcome::Failed(e) => {
            error!(kind = %e.kind(), "Split failed: {}", e);
            eprintln!("\nError: {}", e);
            print_resume_point(&report);
            if e.is_preflight() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::from(EXIT_FAILED)
            }
        }
    }
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let store = CheckpointStore::new(&config.output_dir, config.retry.policy());
    let checkpoint = store
        .load()
        .await
        .with_context(|| format!("reading progress in {}", config.output_dir.display()))?;

    let Some(checkpoint) = checkpoint else {
        println!("No progress recorded in {}", config.output_dir.display());
        return Ok(());
    };

    println!("Output directory:  {}", config.output_dir.display());
    println!("Messages written:  {}", checkpoint.last_written_message_index);
    println!("Resume offset:     {} bytes", checkpoint.last_consumed_byte_offset);
    println!("Messages per part: {}", checkpoint.messages_per_part);
    println!("Active part:       {}", part_file_name(checkpoint.active_part_index()));
    println!("Updated at:        {}", checkpoint.updated_at.to_rfc3339());

    if let Some(input) = &config.input_path {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("opening {}", input.display()))?;
        let input_len = file.metadata().await?.len();
        let total = count_messages(tokio::io::BufReader::new(file)).await?;

        let percent = if total == 0 {
            100.0
        } else {
            checkpoint.last_written_message_index as f64 * 100.0 / total as f64
        };
        println!("Input messages:    {} ({:.1}% written)", total, percent);

        if checkpoint.last_consumed_byte_offset >= input_len {
            println!("Status:            complete");
        } else {
            println!("Status:            resumable");
        }
    }

    Ok(())
}

fn print_resume_point(report: &SplitReport) {
    match &report.resume_point {
        Some(checkpoint) => println!(
            "Resume point: after message {} (input offset {}). Run the same command again to continue.",
            checkpoint.last_written_message_index, checkpoint.last_consumed_byte_offset
        ),
        None => println!("No progress was recorded."),
    }
}

fn print_elapsed(report: &SplitReport) {
    println!("Time elapsed: {} seconds", report.elapsed.as_secs());
}

fn init_logging(logging: &LoggingConfig, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let console = match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
