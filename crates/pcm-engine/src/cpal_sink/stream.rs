//! CPAL output stream fed from an [`HwRing`].
//!
//! The callback pulls `i16` frames from the ring without blocking and converts them to the
//! device's native sample format.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::DeviceTrait;

use super::ring::HwRing;
use crate::pcm::DeviceFault;

/// Build a paused-by-default output stream for `sample_format`.
///
/// `errored` is raised when the backend reports a stream error.
pub(super) fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    ring: Arc<HwRing>,
    errored: Arc<AtomicBool>,
) -> Result<cpal::Stream, DeviceFault> {
    match sample_format {
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, ring, errored),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, ring, errored),
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, ring, errored),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, ring, errored),
        other => Err(DeviceFault::new(format!(
            "unsupported native sample format: {other:?}"
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: Arc<HwRing>,
    errored: Arc<AtomicBool>,
) -> Result<cpal::Stream, DeviceFault>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<i16>,
{
    let mut scratch: Vec<i16> = Vec::new();
    let err_fn = move |err| {
        tracing::warn!("stream error: {err}");
        errored.store(true, Ordering::Relaxed);
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0);
                }
                let src = &mut scratch[..data.len()];
                ring.pop_into(src);
                for (dst, sample) in data.iter_mut().zip(src.iter()) {
                    *dst = <T as cpal::Sample>::from_sample::<i16>(*sample);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| DeviceFault::new(format!("cannot build output stream: {e}")))
}
