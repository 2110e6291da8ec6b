//! Sink backend on top of CPAL.
//!
//! CPAL pulls audio through a callback, while the delivery loop pushes it. [`CpalDevice`]
//! bridges the two with an [`HwRing`] that behaves like a PCM device ring buffer: the loop
//! waits for free space, queries it, and writes into it; the stream callback drains it
//! in real time and latches an xrun when it runs dry.

mod device;
mod ring;
mod stream;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::traits::StreamTrait;

pub use device::OutputDeviceInfo;
pub use ring::{HwRing, RingWait};

use crate::pcm::{
    Access, ActiveHw, DeviceFault, HwParams, PcmBackend, PcmDevice, PcmState, SampleFormat,
    SwParams, WaitStatus, XferError,
};

/// Default ring size in frames.
pub const DEFAULT_RING_FRAMES: usize = 16_384;

/// Opens CPAL output devices on the platform default host.
pub struct CpalBackend {
    host: cpal::Host,
    ring_frames: usize,
}

impl CpalBackend {
    pub fn new(ring_frames: usize) -> Self {
        Self {
            host: cpal::default_host(),
            ring_frames: ring_frames.max(1),
        }
    }

    pub fn list_devices(&self) -> Result<Vec<OutputDeviceInfo>, DeviceFault> {
        device::list_devices(&self.host)
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(DEFAULT_RING_FRAMES)
    }
}

impl PcmBackend for CpalBackend {
    type Device = CpalDevice;

    fn open(&self, name: &str) -> Result<CpalDevice, DeviceFault> {
        let device = device::pick_device(&self.host, name)?;
        Ok(CpalDevice {
            device,
            ring_frames: self.ring_frames,
            state: PcmState::Open,
            hw: None,
            sw: None,
            ring: None,
            stream: None,
            errored: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// An open CPAL output device driven through the PCM call sequence.
pub struct CpalDevice {
    device: cpal::Device,
    ring_frames: usize,
    state: PcmState,
    hw: Option<ActiveHw>,
    sw: Option<SwParams>,
    ring: Option<Arc<HwRing>>,
    stream: Option<cpal::Stream>,
    errored: Arc<AtomicBool>,
}

impl CpalDevice {
    fn ring(&self) -> Result<&Arc<HwRing>, DeviceFault> {
        self.ring
            .as_ref()
            .ok_or_else(|| DeviceFault::new("hardware parameters not committed"))
    }

    fn check_stream(&self) -> Result<(), DeviceFault> {
        if self.errored.load(Ordering::Relaxed) {
            return Err(DeviceFault::new("output stream reported an error"));
        }
        Ok(())
    }

    fn pause_stream(&self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                tracing::debug!(error = %e, "stream pause not supported");
            }
        }
    }

    fn start_stream(&mut self) -> Result<(), DeviceFault> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| DeviceFault::new("hardware parameters not committed"))?;
        stream
            .play()
            .map_err(|e| DeviceFault::new(format!("cannot start stream: {e}")))?;
        self.ring()?.set_running(true);
        self.state = PcmState::Running;
        Ok(())
    }

    fn frames_to_duration(&self, frames: usize) -> Duration {
        let rate = self.hw.map(|hw| hw.rate).unwrap_or(48_000).max(1);
        Duration::from_secs_f64(frames as f64 / rate as f64)
    }
}

impl PcmDevice for CpalDevice {
    fn state(&self) -> PcmState {
        match self.state {
            PcmState::Prepared | PcmState::Running
                if self.ring.as_ref().is_some_and(|r| r.xrun()) =>
            {
                PcmState::Xrun
            }
            other => other,
        }
    }

    fn hw_params_any(&mut self, hw: &mut HwParams) -> Result<(), DeviceFault> {
        hw.fill(device::hw_space(&self.device)?);
        Ok(())
    }

    fn commit_hw_params(&mut self, hw: &HwParams) -> Result<(), DeviceFault> {
        let (Some(access), Some(format), Some(rate), Some(channels)) =
            (hw.access(), hw.format(), hw.rate(), hw.channels())
        else {
            return Err(DeviceFault::new("hardware parameters not fully refined"));
        };
        if access != Access::RwInterleaved || format != SampleFormat::S16Le {
            return Err(DeviceFault::new(format!(
                "only {} {} is supported",
                Access::RwInterleaved,
                SampleFormat::S16Le
            )));
        }

        let (config, native_format) = device::pick_stream_config(&self.device, rate, channels)?;
        let ring = Arc::new(HwRing::new(channels as usize, self.ring_frames));
        self.errored.store(false, Ordering::Relaxed);
        let stream = stream::build_output_stream(
            &self.device,
            &config,
            native_format,
            ring.clone(),
            self.errored.clone(),
        )?;
        tracing::debug!(
            rate_hz = config.sample_rate,
            channels = config.channels,
            native_format = ?native_format,
            buffer = ?config.buffer_size,
            "output stream built"
        );

        self.stream = Some(stream);
        self.pause_stream();
        self.ring = Some(ring);
        self.hw = Some(ActiveHw {
            access,
            format,
            rate: config.sample_rate,
            channels: config.channels,
            buffer_frames: self.ring_frames,
        });
        self.state = PcmState::Setup;
        Ok(())
    }

    fn active_hw(&self) -> Option<ActiveHw> {
        self.hw
    }

    fn sw_params_current(&mut self) -> Result<SwParams, DeviceFault> {
        let hw = self
            .hw
            .ok_or_else(|| DeviceFault::new("hardware parameters not committed"))?;
        Ok(self.sw.unwrap_or_else(|| SwParams::current(hw.buffer_frames)))
    }

    fn commit_sw_params(&mut self, sw: &SwParams) -> Result<(), DeviceFault> {
        self.sw = Some(*sw);
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), DeviceFault> {
        self.pause_stream();
        self.ring()?.reset();
        self.errored.store(false, Ordering::Relaxed);
        self.state = PcmState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceFault> {
        if self.state() != PcmState::Prepared {
            return Err(DeviceFault::new(format!(
                "cannot start from state {:?}",
                self.state()
            )));
        }
        self.start_stream()
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, DeviceFault> {
        if self.state == PcmState::Closed {
            return Err(DeviceFault::new("device closed"));
        }
        self.check_stream()?;
        let avail_min = self.sw.map(|sw| sw.avail_min()).unwrap_or(1);
        match self.ring()?.wait_vacant(avail_min, timeout) {
            RingWait::Ready => Ok(WaitStatus::Ready),
            RingWait::TimedOut => Ok(WaitStatus::TimedOut),
        }
    }

    fn avail_update(&mut self) -> Result<usize, XferError> {
        self.check_stream()?;
        let ring = self.ring()?;
        if ring.xrun() {
            return Err(XferError::Xrun);
        }
        Ok(ring.free_frames())
    }

    fn write_interleaved(&mut self, samples: &[i16]) -> Result<usize, XferError> {
        self.check_stream()?;
        match self.state() {
            PcmState::Prepared | PcmState::Running => {}
            PcmState::Xrun => return Err(XferError::Xrun),
            other => {
                return Err(XferError::Fault(DeviceFault::new(format!(
                    "device not ready for i/o (state {other:?})"
                ))));
            }
        }
        let ring = self.ring()?.clone();
        let accepted = ring.push(samples);

        let threshold = self.sw.map(|sw| sw.start_threshold()).unwrap_or(0);
        if self.state == PcmState::Prepared && threshold > 0 && ring.queued_frames() >= threshold
        {
            self.start_stream()?;
        }
        Ok(accepted)
    }

    fn drain(&mut self) -> Result<(), DeviceFault> {
        let ring = self.ring()?.clone();
        if self.state() == PcmState::Prepared && ring.queued_frames() > 0 {
            self.start_stream()?;
        }
        if self.state == PcmState::Running {
            ring.begin_drain();
            let budget = self.frames_to_duration(ring.queued_frames()) + Duration::from_secs(1);
            if ring.wait_drained(budget) == RingWait::TimedOut {
                tracing::warn!("drain timed out; discarding remaining frames");
            }
        }
        self.pause_stream();
        ring.reset();
        self.state = PcmState::Setup;
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), DeviceFault> {
        self.pause_stream();
        if let Some(ring) = &self.ring {
            ring.reset();
        }
        if self.state != PcmState::Closed {
            self.state = PcmState::Setup;
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.state == PcmState::Closed {
            return;
        }
        self.stream = None;
        if let Some(ring) = self.ring.take() {
            ring.close();
        }
        self.state = PcmState::Closed;
    }
}
