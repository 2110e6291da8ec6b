use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pcm::{Access, SampleFormat};

/// Default sink alias.
pub const DEFAULT_DEVICE: &str = "default";

/// Parameters requested from the sink during negotiation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatSpec {
    pub access: Access,
    pub format: SampleFormat,
    /// Requested rate in Hz; the device may substitute the nearest supported rate.
    pub rate: u32,
    pub channels: u16,
    /// Minimum free frames before the device signals readiness.
    pub avail_min: usize,
    /// Queued frames at which the device starts itself; `0` means the engine starts it.
    pub start_threshold: usize,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            access: Access::RwInterleaved,
            format: SampleFormat::S16Le,
            rate: 44_100,
            channels: 2,
            avail_min: 4096,
            start_threshold: 0,
        }
    }
}

/// What the delivery loop does when the ring buffer runs dry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderrunPolicy {
    /// Stop the loop and report [`crate::EngineError::Underrun`].
    #[default]
    Stop,
    /// Re-prepare the device and keep going.
    Recover,
}

/// Engine tuning shared by negotiation and the delivery loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Sink name or alias.
    pub device: String,
    pub format: FormatSpec,
    /// Frame buffer capacity in frames. At most half of it is delivered per wakeup.
    pub buffer_frames: usize,
    /// Bound on one readiness wait.
    pub wait_timeout: Duration,
    pub underrun_policy: UnderrunPolicy,
    /// Consecutive wait timeouts tolerated by `run_until_stopped`; `None` retries forever.
    pub max_wait_timeouts: Option<u32>,
}

impl Default for EngineConfig {
    /// Defaults match a stereo CD-rate sink woken every 4096 free frames.
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            format: FormatSpec::default(),
            buffer_frames: 4096,
            wait_timeout: Duration::from_millis(1000),
            underrun_policy: UnderrunPolicy::Stop,
            max_wait_timeouts: Some(5),
        }
    }
}
