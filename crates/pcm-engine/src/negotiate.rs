//! Device negotiation.
//!
//! Opens a sink and walks it through hardware and software configuration in a fixed
//! order. Any failed step aborts the whole negotiation; the partially configured handle
//! is released on the way out.

use serde::Serialize;

use crate::config::FormatSpec;
use crate::error::{EngineError, Stage};
use crate::handle::DeviceHandle;
use crate::pcm::{Access, PcmBackend, PcmDevice, SampleFormat};

/// Parameters the device accepted. Immutable once negotiation succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct NegotiatedParams {
    pub access: Access,
    pub format: SampleFormat,
    /// Rate the device runs at; use this for timing, not the requested rate.
    pub rate: u32,
    pub requested_rate: u32,
    pub channels: u16,
    pub avail_min: usize,
    pub start_threshold: usize,
    /// Device ring buffer size in frames.
    pub device_buffer_frames: usize,
}

impl NegotiatedParams {
    pub fn rate_substituted(&self) -> bool {
        self.rate != self.requested_rate
    }

    /// Size of one frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

/// Open `device_name` on `backend` and configure it per `spec`.
///
/// On success the device is left prepared and the returned params carry the values the
/// device reports as active.
///
/// Failing to obtain the software parameter descriptor is reported as
/// [`EngineError::ResourceExhausted`] with [`Stage::SwParamsAlloc`], mirroring the hardware
/// descriptor allocation, rather than as a format rejection. Only the values set on the
/// descriptor (`avail_min`, start threshold) and its commit can produce `UnsupportedFormat`.
pub fn open_and_configure<B: PcmBackend>(
    backend: &B,
    device_name: &str,
    spec: &FormatSpec,
) -> Result<(DeviceHandle<B::Device>, NegotiatedParams), EngineError> {
    let unavailable = |stage: Stage, reason: String| EngineError::DeviceUnavailable {
        stage,
        device: device_name.to_string(),
        reason,
    };

    let device = backend
        .open(device_name)
        .map_err(|e| unavailable(Stage::Open, e.message))?;
    let mut handle = DeviceHandle::new(device_name, device);
    tracing::debug!(device = %device_name, "device opened");

    let dev = handle.device_mut();
    let mut hw = dev.alloc_hw_params().map_err(|e| EngineError::ResourceExhausted {
        stage: Stage::HwParamsAlloc,
        reason: e.message,
    })?;
    dev.hw_params_any(&mut hw)
        .map_err(|e| unavailable(Stage::HwParamsAny, e.message))?;

    hw.set_access(spec.access)
        .map_err(|r| EngineError::rejected(Stage::Access, r))?;
    hw.set_format(spec.format)
        .map_err(|r| EngineError::rejected(Stage::Format, r))?;
    let rate = hw
        .set_rate_near(spec.rate)
        .map_err(|r| EngineError::rejected(Stage::Rate, r))?;
    if rate != spec.rate {
        tracing::warn!(
            requested_hz = spec.rate,
            accepted_hz = rate,
            "device substituted nearest sample rate"
        );
    }
    hw.set_channels(spec.channels)
        .map_err(|r| EngineError::rejected(Stage::Channels, r))?;

    dev.commit_hw_params(&hw)
        .map_err(|e| EngineError::UnsupportedFormat {
            stage: Stage::HwParamsCommit,
            requested: format!(
                "{} {} {} Hz x{}",
                spec.access, spec.format, rate, spec.channels
            ),
            supported: e.message,
        })?;
    drop(hw);

    let active = dev.active_hw().ok_or_else(|| EngineError::UnsupportedFormat {
        stage: Stage::HwParamsCommit,
        requested: format!("{rate} Hz"),
        supported: "nothing (device reports no active configuration)".to_string(),
    })?;
    if active.rate != rate || active.channels != spec.channels || active.format != spec.format {
        return Err(EngineError::UnsupportedFormat {
            stage: Stage::HwParamsCommit,
            requested: format!("{} {} Hz x{}", spec.format, rate, spec.channels),
            supported: format!("{} {} Hz x{} (active)", active.format, active.rate, active.channels),
        });
    }
    tracing::debug!(
        rate_hz = active.rate,
        channels = active.channels,
        buffer_frames = active.buffer_frames,
        "hardware parameters committed"
    );

    let mut sw = dev.sw_params_current().map_err(|e| EngineError::ResourceExhausted {
        stage: Stage::SwParamsAlloc,
        reason: e.message,
    })?;
    sw.set_avail_min(spec.avail_min)
        .map_err(|r| EngineError::rejected(Stage::SwParams, r))?;
    sw.set_start_threshold(spec.start_threshold)
        .map_err(|r| EngineError::rejected(Stage::SwParams, r))?;
    dev.commit_sw_params(&sw)
        .map_err(|e| EngineError::UnsupportedFormat {
            stage: Stage::SwParamsCommit,
            requested: format!(
                "avail_min={} start_threshold={}",
                spec.avail_min, spec.start_threshold
            ),
            supported: e.message,
        })?;

    dev.prepare()
        .map_err(|e| unavailable(Stage::Prepare, e.message))?;

    let params = NegotiatedParams {
        access: active.access,
        format: active.format,
        rate: active.rate,
        requested_rate: spec.rate,
        channels: active.channels,
        avail_min: sw.avail_min(),
        start_threshold: sw.start_threshold(),
        device_buffer_frames: active.buffer_frames,
    };
    tracing::info!(
        device = %device_name,
        rate_hz = params.rate,
        channels = params.channels,
        format = %params.format,
        avail_min = params.avail_min,
        start_threshold = params.start_threshold,
        buffer_frames = params.device_buffer_frames,
        "device prepared"
    );
    Ok((handle, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::{HwSpace, PcmState, RateSupport};
    use crate::sim::{SimBackend, SimConfig, SimFailure};

    fn spec() -> FormatSpec {
        FormatSpec::default()
    }

    #[test]
    fn accepts_cd_rate_unchanged() {
        let backend = SimBackend::new(SimConfig::default());
        let (handle, params) = open_and_configure(&backend, "default", &spec()).unwrap();
        assert_eq!(params.rate, 44_100);
        assert!(!params.rate_substituted());
        assert_eq!(params.channels, 2);
        assert_eq!(params.format, SampleFormat::S16Le);
        assert_eq!(params.frame_bytes(), 4);
        assert_eq!(handle.device().state(), PcmState::Prepared);
        assert_eq!(backend.probe().active_hw().unwrap().rate, params.rate);
    }

    #[test]
    fn reads_back_substituted_rate() {
        let space = HwSpace {
            rates: RateSupport::Discrete(vec![48_000, 96_000]),
            ..SimConfig::default().space
        };
        let backend = SimBackend::new(SimConfig::default().with_space(space));
        let (_handle, params) = open_and_configure(&backend, "default", &spec()).unwrap();
        assert_eq!(params.rate, 48_000);
        assert_eq!(params.requested_rate, 44_100);
        assert!(params.rate_substituted());
    }

    #[test]
    fn rejects_active_rate_that_differs_from_commit() {
        let mut config = SimConfig::default();
        config.reported_rate = Some(22_050);
        let backend = SimBackend::new(config);
        let err = open_and_configure(&backend, "default", &spec()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedFormat {
                stage: Stage::HwParamsCommit,
                ..
            }
        ));
        assert_eq!(backend.probe().closes(), 1);
    }

    #[test]
    fn unsupported_channel_count_releases_handle() {
        let space = HwSpace {
            channels_max: 2,
            ..SimConfig::default().space
        };
        let backend = SimBackend::new(SimConfig::default().with_space(space));
        let probe = backend.probe();
        let spec = FormatSpec {
            channels: 9,
            ..spec()
        };
        let err = open_and_configure(&backend, "default", &spec).unwrap_err();
        assert_eq!(
            err,
            EngineError::UnsupportedFormat {
                stage: Stage::Channels,
                requested: "9".to_string(),
                supported: "1..=2".to_string(),
            }
        );
        assert_eq!(probe.opens(), 1);
        assert_eq!(probe.closes(), 1);
        assert_eq!(probe.prepares(), 0);
    }

    #[test]
    fn unknown_device_is_unavailable() {
        let backend = SimBackend::new(SimConfig::default());
        let err = open_and_configure(&backend, "hw:3,0", &spec()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DeviceUnavailable {
                stage: Stage::Open,
                ..
            }
        ));
        assert_eq!(backend.probe().closes(), 0);
    }

    #[test]
    fn each_step_maps_to_its_error_kind() {
        let cases = [
            (SimFailure::Open, Stage::Open),
            (SimFailure::HwParamsAlloc, Stage::HwParamsAlloc),
            (SimFailure::HwParamsAny, Stage::HwParamsAny),
            (SimFailure::HwParamsCommit, Stage::HwParamsCommit),
            (SimFailure::SwParamsCurrent, Stage::SwParamsAlloc),
            (SimFailure::SwParamsCommit, Stage::SwParamsCommit),
            (SimFailure::Prepare, Stage::Prepare),
        ];
        for (failure, stage) in cases {
            let backend = SimBackend::new(SimConfig::default().failing_at(failure));
            let err = open_and_configure(&backend, "default", &spec()).unwrap_err();
            assert_eq!(err.stage(), Some(stage), "{failure:?}");
            let kind_ok = match failure {
                SimFailure::Open | SimFailure::HwParamsAny | SimFailure::Prepare => {
                    matches!(err, EngineError::DeviceUnavailable { .. })
                }
                SimFailure::HwParamsAlloc | SimFailure::SwParamsCurrent => {
                    matches!(err, EngineError::ResourceExhausted { .. })
                }
                _ => matches!(err, EngineError::UnsupportedFormat { .. }),
            };
            assert!(kind_ok, "{failure:?} -> {err:?}");
            let probe = backend.probe();
            assert_eq!(probe.opens(), probe.closes(), "{failure:?}");
        }
    }

    #[test]
    fn rejects_avail_min_larger_than_device_buffer() {
        let mut config = SimConfig::default();
        config.buffer_frames = 2048;
        let backend = SimBackend::new(config);
        let err = open_and_configure(&backend, "default", &spec()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedFormat {
                stage: Stage::SwParams,
                ..
            }
        ));
    }

    #[test]
    fn records_thresholds_on_device() {
        let backend = SimBackend::new(SimConfig::default());
        let spec = FormatSpec {
            avail_min: 1024,
            start_threshold: 2048,
            ..spec()
        };
        let (_handle, params) = open_and_configure(&backend, "default", &spec).unwrap();
        let sw = backend.probe().sw_params().unwrap();
        assert_eq!(sw.avail_min(), 1024);
        assert_eq!(sw.start_threshold(), 2048);
        assert_eq!(params.avail_min, 1024);
        assert_eq!(params.start_threshold, 2048);
    }
}
