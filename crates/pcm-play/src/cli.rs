use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "pcm-play", version)]
pub struct Args {
    /// TOML config file; command-line flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Sink backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Output device name, `default`, or a case-insensitive substring
    #[arg(long)]
    pub device: Option<String>,

    /// Requested sample rate in Hz (the device may substitute the nearest one)
    #[arg(long)]
    pub rate: Option<u32>,

    #[arg(long)]
    pub channels: Option<u16>,

    /// Free frames required before the device wakes the loop
    #[arg(long)]
    pub avail_min: Option<usize>,

    /// Queued frames at which the device starts itself (0: start after the first write)
    #[arg(long)]
    pub start_threshold: Option<usize>,

    /// Frame buffer capacity; at most half is delivered per wakeup
    #[arg(long)]
    pub buffer_frames: Option<usize>,

    /// Bound on one readiness wait, in milliseconds
    #[arg(long)]
    pub wait_timeout_ms: Option<u64>,

    /// Consecutive wait timeouts before giving up (0: never give up)
    #[arg(long)]
    pub max_wait_timeouts: Option<u32>,

    /// What to do when the device runs dry
    #[arg(long, value_enum)]
    pub underrun: Option<UnderrunMode>,

    /// Emulated device ring size in frames (cpal and sim backends)
    #[arg(long)]
    pub ring_frames: Option<usize>,

    /// Sample source
    #[arg(long, value_enum)]
    pub producer: Option<ProducerKind>,

    /// Sample value for the constant producer
    #[arg(long, allow_negative_numbers = true)]
    pub level: Option<i16>,

    /// Tone frequency for the sine producer
    #[arg(long)]
    pub tone_hz: Option<f64>,

    /// Sine amplitude, 0.0 to 1.0
    #[arg(long)]
    pub amplitude: Option<f64>,

    /// Stop after this many seconds of audio (drains the device first)
    #[arg(long)]
    pub duration_secs: Option<f64>,

    /// Print the final stats snapshot as JSON on stdout
    #[arg(long)]
    pub stats_json: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Real output through the platform audio host
    #[default]
    Cpal,
    /// In-memory device clocked in real time
    Sim,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerKind {
    /// Every sample at `--level`
    #[default]
    Constant,
    Sine,
    Silence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UnderrunMode {
    Stop,
    Recover,
}

impl From<UnderrunMode> for pcm_engine::UnderrunPolicy {
    fn from(mode: UnderrunMode) -> Self {
        match mode {
            UnderrunMode::Stop => pcm_engine::UnderrunPolicy::Stop,
            UnderrunMode::Recover => pcm_engine::UnderrunPolicy::Recover,
        }
    }
}
