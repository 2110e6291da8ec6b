//! Configuration loading and merging.
//!
//! Values come from, in increasing priority: built-in defaults, the optional TOML file,
//! command-line flags.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use pcm_engine::cpal_sink::DEFAULT_RING_FRAMES;
use pcm_engine::producer::REFERENCE_LEVEL;
use pcm_engine::{EngineConfig, UnderrunPolicy};

use crate::cli::{Args, BackendKind, ProducerKind};

/// Largest accepted ring, about 22 s of audio at 48 kHz.
pub const MAX_RING_FRAMES: usize = 1 << 20;

/// Config file schema. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub backend: Option<BackendKind>,
    pub device: Option<String>,
    pub ring_frames: Option<usize>,
    pub buffer_frames: Option<usize>,
    pub wait_timeout_ms: Option<u64>,
    /// `0` retries forever.
    pub max_wait_timeouts: Option<u32>,
    pub underrun: Option<UnderrunPolicy>,
    pub format: Option<FormatSection>,
    pub producer: Option<ProducerSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatSection {
    pub rate: Option<u32>,
    pub channels: Option<u16>,
    pub avail_min: Option<usize>,
    pub start_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerSection {
    pub kind: Option<ProducerKind>,
    pub level: Option<i16>,
    pub tone_hz: Option<f64>,
    pub amplitude: Option<f64>,
    pub duration_secs: Option<f64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        toml::from_str::<FileConfig>(&raw).with_context(|| format!("parse config {:?}", path))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProducerSettings {
    pub kind: ProducerKind,
    pub level: i16,
    pub tone_hz: f64,
    pub amplitude: f64,
    /// Audio length in seconds; `None` plays until stopped.
    pub duration_secs: Option<f64>,
}

/// Fully resolved settings for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayConfig {
    pub backend: BackendKind,
    pub ring_frames: usize,
    pub engine: EngineConfig,
    pub producer: ProducerSettings,
    pub stats_json: bool,
}

pub fn resolve(args: &Args, file: FileConfig) -> Result<PlayConfig> {
    let mut engine = EngineConfig::default();
    let format = file.format.unwrap_or_default();
    let producer = file.producer.unwrap_or_default();

    if let Some(device) = args.device.clone().or(file.device) {
        engine.device = device;
    }
    if let Some(rate) = args.rate.or(format.rate) {
        engine.format.rate = rate;
    }
    if let Some(channels) = args.channels.or(format.channels) {
        engine.format.channels = channels;
    }
    if let Some(avail_min) = args.avail_min.or(format.avail_min) {
        engine.format.avail_min = avail_min;
    }
    if let Some(start_threshold) = args.start_threshold.or(format.start_threshold) {
        engine.format.start_threshold = start_threshold;
    }
    if let Some(buffer_frames) = args.buffer_frames.or(file.buffer_frames) {
        engine.buffer_frames = buffer_frames;
    }
    if let Some(ms) = args.wait_timeout_ms.or(file.wait_timeout_ms) {
        engine.wait_timeout = Duration::from_millis(ms);
    }
    if let Some(max) = args.max_wait_timeouts.or(file.max_wait_timeouts) {
        engine.max_wait_timeouts = (max > 0).then_some(max);
    }
    if let Some(policy) = args.underrun.map(UnderrunPolicy::from).or(file.underrun) {
        engine.underrun_policy = policy;
    }

    let ring_frames = args
        .ring_frames
        .or(file.ring_frames)
        .unwrap_or(DEFAULT_RING_FRAMES);
    if ring_frames == 0 || ring_frames > MAX_RING_FRAMES {
        bail!("ring_frames must be within 1..={MAX_RING_FRAMES} (got {ring_frames})");
    }
    if engine.buffer_frames < 2 {
        bail!("buffer_frames must be at least 2 (got {})", engine.buffer_frames);
    }
    if engine.buffer_frames > ring_frames {
        bail!(
            "buffer_frames must not exceed ring_frames {ring_frames} (got {})",
            engine.buffer_frames
        );
    }
    if engine.wait_timeout.is_zero() {
        bail!("wait_timeout_ms must be positive");
    }

    let producer = ProducerSettings {
        kind: args.producer.or(producer.kind).unwrap_or_default(),
        level: args.level.or(producer.level).unwrap_or(REFERENCE_LEVEL),
        tone_hz: args.tone_hz.or(producer.tone_hz).unwrap_or(440.0),
        amplitude: args.amplitude.or(producer.amplitude).unwrap_or(0.25),
        duration_secs: args.duration_secs.or(producer.duration_secs),
    };
    if let Some(secs) = producer.duration_secs {
        if !secs.is_finite() || secs <= 0.0 {
            bail!("duration_secs must be a positive number of seconds (got {secs})");
        }
    }
    if !(0.0..=1.0).contains(&producer.amplitude) {
        bail!("amplitude must be within 0.0..=1.0 (got {})", producer.amplitude);
    }

    Ok(PlayConfig {
        backend: args.backend.or(file.backend).unwrap_or_default(),
        ring_frames,
        engine,
        producer,
        stats_json: args.stats_json,
    })
}
