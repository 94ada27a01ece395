//! # Whisper Relay - Main Application Entry Point
//!
//! One binary, two roles:
//! - **client** (default): transcribes one file and exits. It uses the background
//!   service, starting it when nothing answers, or loads the model itself with `--local`.
//! - **service** (`serve`): the long-lived HTTP process that keeps a model loaded
//!   between invocations and exits on its own after a period of inactivity.
//!
//! ## Application Architecture:
//! - **cli**: command line flags and the `serve` subcommand
//! - **config**: layered configuration shared by both roles
//! - **client**: probing, spawning and calling the service
//! - **local**: in-process one-shot transcription
//! - **server**, **handlers**, **health**, **state**, **watchdog**: the service
//! - **transcription**: media decoding and the Whisper engine
//! - **output**: txt / json / srt rendering and delivery
//! - **error**: the application error type

mod cli;
mod client;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod local;
mod output;
mod server;
mod state;
mod transcription;
mod watchdog;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Args, Command};
use config::AppConfig;
use output::{Destination, OutputFormatOptions};

/// The main application entry point.
///
/// ## What this function does:
/// 1. Reads `.env` and parses the command line
/// 2. Sets up logging on stderr
/// 3. Runs the selected role
/// 4. Turns any failure into one error line and a non-zero exit status
#[actix_web::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = init_tracing(args.default_log_filter()) {
        eprintln!("Failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    config.validate()?;

    if let Some(Command::Serve) = args.command {
        return server::run(config).await;
    }

    if args.stop {
        client::stop(&config).await?;
        return Ok(());
    }

    let input = match &args.input_file {
        Some(path) => path.clone(),
        None => prompt_input_path()?,
    };
    let language = args.language.as_deref().unwrap_or(&config.language);

    let result = if args.local {
        local::transcribe(&config, &input, language, args.model.as_deref(), true).await?
    } else {
        if args.model.is_some() {
            tracing::warn!("--model only applies to --local runs; the service uses its configured model");
        }
        client::transcribe(&config, args.config.as_deref(), &input, language, true).await?
    };

    let options = OutputFormatOptions::resolve(&config.output_format, &args.format_overrides());
    let content = output::format(&result, &options)?;

    let destination = if args.print {
        Destination::Stdout
    } else {
        Destination::File(output::resolve_output_path(
            &input,
            args.output_file.as_deref(),
            options.kind,
        ))
    };
    output::deliver(&content, &destination)?;
    Ok(())
}

/// Ask for the media path on stdin. Surrounding quotes (left by drag and drop) are stripped.
fn prompt_input_path() -> Result<PathBuf> {
    let mut stderr = std::io::stderr();
    write!(stderr, "Path to the media file: ")?;
    stderr.flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let path = line.trim().trim_matches(|c| c == '"' || c == '\'');
    if path.is_empty() {
        bail!("no input file given");
    }
    Ok(PathBuf::from(path))
}

/// Initialize the tracing (logging) system.
///
/// Logs go to stderr so that `--print` output on stdout can be piped.
/// `RUST_LOG` overrides `default_filter`.
fn init_tracing(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}
