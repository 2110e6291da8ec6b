//! Playback runtime: device listing and one negotiated playback run.

use std::sync::Arc;

use anyhow::{Context, Result};

use pcm_engine::cpal_sink::CpalBackend;
use pcm_engine::negotiate::NegotiatedParams;
use pcm_engine::pcm::PcmBackend;
use pcm_engine::producer::{ConstantProducer, LimitedProducer, SampleProducer, Silence, SineProducer};
use pcm_engine::scheduler::{self, StopReason, StopSignal};
use pcm_engine::sim::{SimBackend, SimConfig};
use pcm_engine::stats::EngineStats;

use crate::cli::{BackendKind, ProducerKind};
use crate::config::{PlayConfig, ProducerSettings};

/// Print output devices to stdout.
pub fn list_devices() -> Result<()> {
    let devices = CpalBackend::default()
        .list_devices()
        .context("list output devices")?;
    for (i, d) in devices.iter().enumerate() {
        let marker = if d.is_default { " [default]" } else { "" };
        println!(
            "#{i}: {} ({}-{} Hz, up to {} ch){marker}",
            d.name, d.min_rate, d.max_rate, d.max_channels
        );
    }
    Ok(())
}

/// Negotiate with the configured sink and play until stopped or out of audio.
pub fn run(config: &PlayConfig, stop: StopSignal, stats: Arc<EngineStats>) -> Result<StopReason> {
    match config.backend {
        BackendKind::Cpal => play(&CpalBackend::new(config.ring_frames), config, stop, stats),
        BackendKind::Sim => {
            let sim = SimConfig {
                devices: vec![config.engine.device.clone()],
                buffer_frames: config.ring_frames,
                ..SimConfig::default()
            };
            play(&SimBackend::new(sim), config, stop, stats)
        }
    }
}

fn play<B: PcmBackend>(
    backend: &B,
    config: &PlayConfig,
    stop: StopSignal,
    stats: Arc<EngineStats>,
) -> Result<StopReason> {
    let mut scheduler = scheduler::start(backend, &config.engine, |params| {
        build_producer(&config.producer, params)
    })
    .with_context(|| format!("configure output device {:?}", config.engine.device))?
    .with_stop_signal(stop)
    .with_stats(stats);

    let params = scheduler.params();
    tracing::info!(
        backend = ?config.backend,
        producer = ?config.producer.kind,
        rate_hz = params.rate,
        substituted = params.rate_substituted(),
        underrun_policy = ?config.engine.underrun_policy,
        "playback starting"
    );

    scheduler
        .run_until_stopped(config.engine.max_wait_timeouts)
        .context("playback")
}

fn build_producer(settings: &ProducerSettings, params: &NegotiatedParams) -> Box<dyn SampleProducer> {
    let source: Box<dyn SampleProducer> = match settings.kind {
        ProducerKind::Constant => Box::new(ConstantProducer::new(settings.level)),
        ProducerKind::Sine => Box::new(SineProducer::new(
            params.rate,
            settings.tone_hz,
            settings.amplitude,
        )),
        ProducerKind::Silence => Box::new(Silence),
    };
    match settings.duration_secs {
        Some(secs) => {
            let frames = (secs * params.rate as f64).round() as u64;
            Box::new(LimitedProducer::new(source, frames.max(1)))
        }
        None => source,
    }
}
