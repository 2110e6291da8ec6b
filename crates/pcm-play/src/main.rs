//! pcm-play: negotiate an output device and keep it fed from a sample producer.
//!
//! Exit status: `0` when the producer runs out, `130` after Ctrl-C, `1` on any error.

mod cli;
mod config;
mod runtime;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pcm_engine::stats::EngineStats;
use pcm_engine::{StopReason, StopSignal};

fn main() -> ExitCode {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,pcm_engine=info,pcm_play=info")
        }))
        .init();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: cli::Args) -> Result<ExitCode> {
    if args.list_devices {
        runtime::list_devices()?;
        return Ok(ExitCode::SUCCESS);
    }

    let file = match &args.config {
        Some(path) => config::FileConfig::load(path)?,
        None => config::FileConfig::default(),
    };
    let config = config::resolve(&args, file)?;

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.request()).context("install Ctrl-C handler")?;
    }

    let stats = EngineStats::shared();
    let result = runtime::run(&config, stop, stats.clone());

    let snapshot = stats.snapshot();
    tracing::info!(
        frames_written = snapshot.frames_written,
        elapsed_ms = ?snapshot.elapsed_ms,
        wait_timeouts = snapshot.wait_timeouts,
        underrun_events = snapshot.underrun_events,
        recoveries = snapshot.recoveries,
        "playback finished"
    );
    if config.stats_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    match result? {
        StopReason::Exhausted => Ok(ExitCode::SUCCESS),
        StopReason::Requested => Ok(ExitCode::from(130)),
    }
}
