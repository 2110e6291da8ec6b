//! Playback sink abstraction.
//!
//! Negotiation and delivery only talk to a sink through [`PcmBackend`] and [`PcmDevice`].
//! The call sequence follows a PCM playback device:
//! - open the sink by name
//! - allocate a hardware descriptor, fill it with the full configuration space, refine it
//! - commit hardware params, then software thresholds
//! - prepare, then wait / query / write until stopped
//!
//! Hardware descriptors ([`HwParams`]) and software descriptors ([`SwParams`]) are plain
//! owned values: refinement is checked against the configuration space the device
//! reported, so every backend rejects unsupported values the same way.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sample layout accepted by `write_interleaved`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Read/write transfers with channels interleaved per frame.
    RwInterleaved,
    /// Read/write transfers with one buffer per channel.
    RwNonInterleaved,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::RwInterleaved => f.write_str("rw_interleaved"),
            Access::RwNonInterleaved => f.write_str("rw_noninterleaved"),
        }
    }
}

/// Wire sample format of one channel sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Signed 16-bit little-endian.
    S16Le,
    /// Signed 32-bit little-endian.
    S32Le,
    /// 32-bit float little-endian.
    FloatLe,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S32Le | SampleFormat::FloatLe => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::S16Le => f.write_str("S16_LE"),
            SampleFormat::S32Le => f.write_str("S32_LE"),
            SampleFormat::FloatLe => f.write_str("FLOAT_LE"),
        }
    }
}

/// Sample rates a sink can run at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateSupport {
    /// Any rate in `min..=max`.
    Range { min: u32, max: u32 },
    /// Only the listed rates.
    Discrete(Vec<u32>),
}

impl RateSupport {
    /// Pick the supported rate closest to `requested`.
    ///
    /// Ranges clamp into `min..=max`. Discrete lists pick the smallest distance and
    /// prefer the lower rate on a tie. Returns `None` for an empty list.
    pub fn nearest(&self, requested: u32) -> Option<u32> {
        match self {
            RateSupport::Range { min, max } => Some(clamp_rate_to_range(*min, *max, requested)),
            RateSupport::Discrete(rates) => rates
                .iter()
                .copied()
                .min_by_key(|rate| (rate.abs_diff(requested), *rate)),
        }
    }

    pub fn contains(&self, rate: u32) -> bool {
        match self {
            RateSupport::Range { min, max } => rate >= *min && rate <= *max,
            RateSupport::Discrete(rates) => rates.contains(&rate),
        }
    }
}

impl fmt::Display for RateSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSupport::Range { min, max } => write!(f, "{min}..={max} Hz"),
            RateSupport::Discrete(rates) => {
                let list: Vec<String> = rates.iter().map(|r| r.to_string()).collect();
                write!(f, "{{{}}} Hz", list.join(", "))
            }
        }
    }
}

fn clamp_rate_to_range(min: u32, max: u32, target: u32) -> u32 {
    if target < min {
        min
    } else if target > max {
        max
    } else {
        target
    }
}

/// Full configuration space reported by a sink before refinement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwSpace {
    pub accesses: Vec<Access>,
    pub formats: Vec<SampleFormat>,
    pub rates: RateSupport,
    pub channels_min: u16,
    pub channels_max: u16,
}

/// A requested value the configuration space does not allow.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{parameter}: requested {requested}, supported {supported}")]
pub struct FormatRejection {
    pub parameter: &'static str,
    pub requested: String,
    pub supported: String,
}

impl FormatRejection {
    fn new(parameter: &'static str, requested: impl fmt::Display, supported: impl fmt::Display) -> Self {
        Self {
            parameter,
            requested: requested.to_string(),
            supported: supported.to_string(),
        }
    }
}

/// Hardware parameter descriptor.
///
/// Starts empty; a device fills it with [`PcmDevice::hw_params_any`], after which the
/// `set_*` calls refine it one parameter at a time.
#[derive(Clone, Debug, Default)]
pub struct HwParams {
    space: Option<HwSpace>,
    access: Option<Access>,
    format: Option<SampleFormat>,
    rate: Option<u32>,
    channels: Option<u16>,
}

impl HwParams {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the configuration space and clear any refinement.
    pub fn fill(&mut self, space: HwSpace) {
        *self = Self {
            space: Some(space),
            ..Self::default()
        };
    }

    pub fn space(&self) -> Option<&HwSpace> {
        self.space.as_ref()
    }

    fn filled(&self, parameter: &'static str, requested: impl fmt::Display) -> Result<&HwSpace, FormatRejection> {
        self.space
            .as_ref()
            .ok_or_else(|| FormatRejection::new(parameter, requested, "nothing (descriptor not filled)"))
    }

    pub fn set_access(&mut self, access: Access) -> Result<(), FormatRejection> {
        let space = self.filled("access", access)?;
        if !space.accesses.contains(&access) {
            return Err(FormatRejection::new("access", access, list(&space.accesses)));
        }
        self.access = Some(access);
        Ok(())
    }

    pub fn set_format(&mut self, format: SampleFormat) -> Result<(), FormatRejection> {
        let space = self.filled("format", format)?;
        if !space.formats.contains(&format) {
            return Err(FormatRejection::new("format", format, list(&space.formats)));
        }
        self.format = Some(format);
        Ok(())
    }

    /// Set the rate closest to `requested` and return the rate actually chosen.
    pub fn set_rate_near(&mut self, requested: u32) -> Result<u32, FormatRejection> {
        let space = self.filled("rate", requested)?;
        let rate = space
            .rates
            .nearest(requested)
            .ok_or_else(|| FormatRejection::new("rate", requested, &space.rates))?;
        self.rate = Some(rate);
        Ok(rate)
    }

    pub fn set_channels(&mut self, channels: u16) -> Result<(), FormatRejection> {
        let space = self.filled("channels", channels)?;
        if channels < space.channels_min || channels > space.channels_max {
            return Err(FormatRejection::new(
                "channels",
                channels,
                format!("{}..={}", space.channels_min, space.channels_max),
            ));
        }
        self.channels = Some(channels);
        Ok(())
    }

    pub fn access(&self) -> Option<Access> {
        self.access
    }

    pub fn format(&self) -> Option<SampleFormat> {
        self.format
    }

    pub fn rate(&self) -> Option<u32> {
        self.rate
    }

    pub fn channels(&self) -> Option<u16> {
        self.channels
    }

    /// Whether every parameter has been refined to a single value.
    pub fn is_complete(&self) -> bool {
        self.access.is_some() && self.format.is_some() && self.rate.is_some() && self.channels.is_some()
    }
}

fn list<T: fmt::Display>(items: &[T]) -> String {
    let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// Hardware configuration the device reports as active after a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveHw {
    pub access: Access,
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u16,
    /// Size of the device ring buffer in frames.
    pub buffer_frames: usize,
}

/// Software parameter descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwParams {
    avail_min: usize,
    start_threshold: usize,
    buffer_frames: usize,
}

impl SwParams {
    /// Descriptor initialised from the device's current state.
    pub fn current(buffer_frames: usize) -> Self {
        Self {
            avail_min: 1,
            start_threshold: 1,
            buffer_frames,
        }
    }

    /// Minimum free frames before the device reports readiness.
    pub fn set_avail_min(&mut self, frames: usize) -> Result<(), FormatRejection> {
        if frames == 0 || frames > self.buffer_frames {
            return Err(FormatRejection::new(
                "avail_min",
                frames,
                format!("1..={}", self.buffer_frames),
            ));
        }
        self.avail_min = frames;
        Ok(())
    }

    /// Queued frames at which the device starts on its own; `0` disables auto-start.
    pub fn set_start_threshold(&mut self, frames: usize) -> Result<(), FormatRejection> {
        self.start_threshold = frames;
        Ok(())
    }

    pub fn avail_min(&self) -> usize {
        self.avail_min
    }

    pub fn start_threshold(&self) -> usize {
        self.start_threshold
    }
}

/// Device lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PcmState {
    Open,
    Setup,
    Prepared,
    Running,
    Xrun,
    Closed,
}

/// Outcome of a bounded readiness wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least `avail_min` frames are free, or the device needs attention (xrun).
    Ready,
    TimedOut,
}

/// Failure reported by a sink backend.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DeviceFault {
    pub message: String,
}

impl DeviceFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure of an availability query or a transfer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum XferError {
    /// The ring buffer ran dry while running.
    #[error("buffer underrun (xrun)")]
    Xrun,
    #[error(transparent)]
    Fault(#[from] DeviceFault),
}

/// Opens sinks by name.
pub trait PcmBackend {
    type Device: PcmDevice;

    fn open(&self, name: &str) -> Result<Self::Device, DeviceFault>;
}

/// One open playback sink.
pub trait PcmDevice {
    fn state(&self) -> PcmState;

    /// Allocate an empty hardware descriptor.
    fn alloc_hw_params(&mut self) -> Result<HwParams, DeviceFault> {
        Ok(HwParams::empty())
    }

    /// Fill `hw` with every configuration the sink supports.
    fn hw_params_any(&mut self, hw: &mut HwParams) -> Result<(), DeviceFault>;

    /// Install a fully refined hardware configuration.
    fn commit_hw_params(&mut self, hw: &HwParams) -> Result<(), DeviceFault>;

    /// Hardware configuration currently active, once committed.
    fn active_hw(&self) -> Option<ActiveHw>;

    /// Software descriptor initialised from the current device state.
    fn sw_params_current(&mut self) -> Result<SwParams, DeviceFault>;

    fn commit_sw_params(&mut self, sw: &SwParams) -> Result<(), DeviceFault>;

    /// Move to the prepared state, discarding queued frames and clearing an xrun.
    fn prepare(&mut self) -> Result<(), DeviceFault>;

    /// Start playback of queued frames.
    fn start(&mut self) -> Result<(), DeviceFault>;

    /// Block until `avail_min` frames are free, an xrun occurs, or `timeout` elapses.
    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, DeviceFault>;

    /// Free frames in the ring buffer.
    fn avail_update(&mut self) -> Result<usize, XferError>;

    /// Queue interleaved samples; returns the number of whole frames accepted.
    fn write_interleaved(&mut self, samples: &[i16]) -> Result<usize, XferError>;

    /// Play out everything queued, then stop.
    fn drain(&mut self) -> Result<(), DeviceFault>;

    /// Stop immediately, discarding queued frames.
    fn drop_pending(&mut self) -> Result<(), DeviceFault>;

    /// Release the sink. Calling it again has no effect.
    fn close(&mut self);
}
