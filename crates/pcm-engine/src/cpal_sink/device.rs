//! Output device discovery and stream config selection on top of CPAL.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::config::DEFAULT_DEVICE;
use crate::pcm::{Access, DeviceFault, HwSpace, RateSupport, SampleFormat};

/// Largest fixed callback buffer requested from the host, in frames.
const MAX_CALLBACK_FRAMES: u32 = 4096;

/// Output device metadata for `--list-devices`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
    pub is_default: bool,
}

/// Resolve a sink name: the `default` alias maps to the host default output device,
/// anything else is a case-insensitive substring of the device name.
pub(super) fn pick_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, DeviceFault> {
    if name == DEFAULT_DEVICE {
        return host
            .default_output_device()
            .ok_or_else(|| DeviceFault::new("no default output device"));
    }

    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .map_err(|e| DeviceFault::new(format!("cannot enumerate output devices: {e}")))?
        .collect();
    devices
        .drain(..)
        .find(|d| {
            d.description()
                .ok()
                .map(|desc| matches_device_name(&desc.name(), name))
                .unwrap_or(false)
        })
        .ok_or_else(|| DeviceFault::new(format!("no output device matched: {name}")))
}

/// Configuration space the sink exposes to negotiation.
///
/// Samples always cross the ring as interleaved S16_LE; the stream converts to the native
/// format. Rates and channel counts are the union of the advertised ranges; exact
/// combinations are checked at commit.
pub(super) fn hw_space(device: &cpal::Device) -> Result<HwSpace, DeviceFault> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| DeviceFault::new(format!("cannot query output configs: {e}")))?
        .collect();
    if ranges.is_empty() {
        return Err(DeviceFault::new("no supported output configs"));
    }

    let min_rate = ranges.iter().map(|r| r.min_sample_rate()).min().unwrap_or(0);
    let max_rate = ranges.iter().map(|r| r.max_sample_rate()).max().unwrap_or(0);
    let channels_min = ranges.iter().map(|r| r.channels()).min().unwrap_or(1);
    let channels_max = ranges.iter().map(|r| r.channels()).max().unwrap_or(1);

    Ok(HwSpace {
        accesses: vec![Access::RwInterleaved],
        formats: vec![SampleFormat::S16Le],
        rates: RateSupport::Range {
            min: min_rate,
            max: max_rate,
        },
        channels_min,
        channels_max,
    })
}

/// Pick the stream config running exactly `rate` Hz with `channels` channels.
///
/// Prefers native formats that need the least conversion from `i16`.
pub(super) fn pick_stream_config(
    device: &cpal::Device,
    rate: u32,
    channels: u16,
) -> Result<(cpal::StreamConfig, cpal::SampleFormat), DeviceFault> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| DeviceFault::new(format!("cannot query output configs: {e}")))?;

    let best = ranges
        .filter(|r| {
            r.channels() == channels && r.min_sample_rate() <= rate && rate <= r.max_sample_rate()
        })
        .min_by_key(|r| sample_format_rank(r.sample_format()))
        .ok_or_else(|| {
            DeviceFault::new(format!("no output config for {rate} Hz x{channels}"))
        })?;

    let supported = best.with_sample_rate(rate);
    let mut config = supported.config();
    if let Some(size) = pick_buffer_size(&supported) {
        config.buffer_size = size;
    }
    Ok((config, supported.sample_format()))
}

/// Prefer a fixed callback buffer if the device advertises a range.
fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = if *max > MAX_CALLBACK_FRAMES {
                (*min).max(MAX_CALLBACK_FRAMES)
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::F32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Output devices on `host` with their advertised rate and channel ranges.
pub(super) fn list_devices(host: &cpal::Host) -> Result<Vec<OutputDeviceInfo>, DeviceFault> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|desc| desc.name().to_string());
    let devices = host
        .output_devices()
        .map_err(|e| DeviceFault::new(format!("cannot enumerate output devices: {e}")))?;

    let mut out = Vec::new();
    for d in devices {
        let Ok(desc) = d.description() else {
            continue;
        };
        let name = desc.name().to_string();
        let (mut min_rate, mut max_rate, mut max_channels) = (u32::MAX, 0u32, 0u16);
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
                max_channels = max_channels.max(r.channels());
            }
        }
        if max_rate == 0 || min_rate > max_rate {
            tracing::warn!(device = %name, "skipping device with no usable output configs");
            continue;
        }
        out.push(OutputDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
            max_channels,
        });
    }
    Ok(out)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
