//! In-memory sink backend.
//!
//! [`SimBackend`] stands in for a sound card. It runs in one of two modes:
//! - **scripted**: every readiness wait consumes the next [`SimTick`] and every write the
//!   next [`SimWrite`], so tests can drive exact availability, timeout and xrun sequences
//! - **clocked**: a ring buffer drained in real time at the negotiated rate, for dry runs
//!   without audio hardware
//!
//! Every backend call is recorded in a shared [`SimProbe`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::pcm::{
    Access, ActiveHw, DeviceFault, HwParams, HwSpace, PcmBackend, PcmDevice, PcmState, RateSupport,
    SampleFormat, SwParams, WaitStatus, XferError,
};

/// Negotiation step a simulated device refuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFailure {
    Open,
    HwParamsAlloc,
    HwParamsAny,
    HwParamsCommit,
    SwParamsCurrent,
    SwParamsCommit,
    Prepare,
    Start,
}

/// Outcome of one scripted readiness wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimTick {
    /// Ready, and the following query reports this many free frames.
    Ready(usize),
    Timeout,
    /// The wait itself fails.
    WaitFault(String),
    /// Ready, and the following query reports an xrun.
    Xrun,
    /// Ready, and the following query fails.
    AvailFault(String),
}

/// Outcome of one scripted write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimWrite {
    AcceptAll,
    AcceptAtMost(usize),
    /// Queue what was given but report this count as accepted.
    Report(usize),
    Xrun,
    Fault(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SimTiming {
    Scripted {
        ticks: Vec<SimTick>,
        writes: Vec<SimWrite>,
    },
    /// Drain the ring in real time once started.
    #[default]
    Clocked,
}

/// Capabilities and behaviour of the simulated sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimConfig {
    /// Names the backend will open.
    pub devices: Vec<String>,
    pub space: HwSpace,
    /// Ring buffer size in frames.
    pub buffer_frames: usize,
    /// Rate reported as active after commit, when the device silently differs.
    pub reported_rate: Option<u32>,
    pub fail_at: Option<SimFailure>,
    pub timing: SimTiming,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: vec!["default".to_string(), "sim".to_string()],
            space: HwSpace {
                accesses: vec![Access::RwInterleaved],
                formats: vec![SampleFormat::S16Le],
                rates: RateSupport::Range {
                    min: 8_000,
                    max: 192_000,
                },
                channels_min: 1,
                channels_max: 8,
            },
            buffer_frames: 16_384,
            reported_rate: None,
            fail_at: None,
            timing: SimTiming::Clocked,
        }
    }
}

impl SimConfig {
    /// Scripted device with the given wait outcomes; every write is accepted in full.
    pub fn scripted(ticks: Vec<SimTick>) -> Self {
        Self {
            timing: SimTiming::Scripted {
                ticks,
                writes: Vec::new(),
            },
            ..Self::default()
        }
    }

    /// Replace the scripted write outcomes. Writes past the end are accepted in full.
    pub fn with_writes(mut self, outcomes: Vec<SimWrite>) -> Self {
        if let SimTiming::Scripted { writes, .. } = &mut self.timing {
            *writes = outcomes;
        }
        self
    }

    pub fn with_space(mut self, space: HwSpace) -> Self {
        self.space = space;
        self
    }

    pub fn failing_at(mut self, failure: SimFailure) -> Self {
        self.fail_at = Some(failure);
        self
    }
}

/// One recorded write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub requested: usize,
    pub accepted: usize,
}

/// Call log shared by a [`SimBackend`] and every device it opens.
#[derive(Debug, Default)]
pub struct SimProbe {
    opens: AtomicUsize,
    closes: AtomicUsize,
    prepares: AtomicUsize,
    starts: AtomicUsize,
    drains: AtomicUsize,
    drops: AtomicUsize,
    writes: Mutex<Vec<WriteRecord>>,
    last_samples: Mutex<Vec<i16>>,
    active_hw: Mutex<Option<ActiveHw>>,
    sw_params: Mutex<Option<SwParams>>,
}

impl SimProbe {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    /// Samples passed to the most recent write.
    pub fn last_samples(&self) -> Vec<i16> {
        self.last_samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn active_hw(&self) -> Option<ActiveHw> {
        self.active_hw.lock().ok().and_then(|hw| *hw)
    }

    pub fn sw_params(&self) -> Option<SwParams> {
        self.sw_params.lock().ok().and_then(|sw| *sw)
    }

    fn record_write(&self, samples: &[i16], requested: usize, accepted: usize) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(WriteRecord {
                requested,
                accepted,
            });
        }
        if let Ok(mut last) = self.last_samples.lock() {
            last.clear();
            last.extend_from_slice(samples);
        }
    }
}

/// Opens [`SimDevice`]s sharing one [`SimProbe`].
#[derive(Clone, Debug)]
pub struct SimBackend {
    config: SimConfig,
    probe: Arc<SimProbe>,
}

impl SimBackend {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            probe: Arc::new(SimProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<SimProbe> {
        self.probe.clone()
    }
}

impl PcmBackend for SimBackend {
    type Device = SimDevice;

    fn open(&self, name: &str) -> Result<SimDevice, DeviceFault> {
        if self.config.fail_at == Some(SimFailure::Open) {
            return Err(DeviceFault::new("device or resource busy"));
        }
        if !self.config.devices.iter().any(|d| d == name) {
            return Err(DeviceFault::new(format!("no such device: {name}")));
        }
        self.probe.opens.fetch_add(1, Ordering::Relaxed);
        Ok(SimDevice::new(self.config.clone(), self.probe.clone()))
    }
}

enum Timing {
    Scripted {
        ticks: VecDeque<SimTick>,
        writes: VecDeque<SimWrite>,
        pending: Option<Result<usize, XferError>>,
    },
    Clocked {
        last_tick: Instant,
    },
}

/// A simulated sink opened by [`SimBackend`].
pub struct SimDevice {
    config: SimConfig,
    probe: Arc<SimProbe>,
    state: PcmState,
    hw: Option<ActiveHw>,
    sw: Option<SwParams>,
    queued: usize,
    timing: Timing,
}

impl SimDevice {
    fn new(config: SimConfig, probe: Arc<SimProbe>) -> Self {
        let timing = match &config.timing {
            SimTiming::Scripted { ticks, writes } => Timing::Scripted {
                ticks: ticks.iter().cloned().collect(),
                writes: writes.iter().cloned().collect(),
                pending: None,
            },
            SimTiming::Clocked => Timing::Clocked {
                last_tick: Instant::now(),
            },
        };
        Self {
            config,
            probe,
            state: PcmState::Open,
            hw: None,
            sw: None,
            queued: 0,
            timing,
        }
    }

    fn fails_at(&self, failure: SimFailure) -> bool {
        self.config.fail_at == Some(failure)
    }

    fn rate(&self) -> u32 {
        self.hw.map(|hw| hw.rate).unwrap_or(48_000).max(1)
    }

    fn frames_to_duration(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.rate() as f64)
    }

    fn free_frames(&self) -> usize {
        self.config.buffer_frames.saturating_sub(self.queued)
    }

    /// Advance the clocked ring to now, consuming frames while running.
    fn advance(&mut self) {
        let rate = self.rate() as f64;
        let Timing::Clocked { last_tick } = &mut self.timing else {
            return;
        };
        if self.state != PcmState::Running {
            *last_tick = Instant::now();
            return;
        }
        let played = (last_tick.elapsed().as_secs_f64() * rate) as usize;
        if played == 0 {
            return;
        }
        *last_tick += Duration::from_secs_f64(played as f64 / rate);
        if played > self.queued {
            self.queued = 0;
            self.state = PcmState::Xrun;
        } else {
            self.queued -= played;
        }
    }

    fn maybe_autostart(&mut self) {
        let threshold = self.sw.map(|sw| sw.start_threshold()).unwrap_or(0);
        if self.state == PcmState::Prepared && threshold > 0 && self.queued >= threshold {
            self.set_running();
        }
    }

    fn set_running(&mut self) {
        self.state = PcmState::Running;
        if let Timing::Clocked { last_tick } = &mut self.timing {
            *last_tick = Instant::now();
        }
        self.probe.starts.fetch_add(1, Ordering::Relaxed);
    }

    fn ensure_io_state(&self) -> Result<(), XferError> {
        match self.state {
            PcmState::Prepared | PcmState::Running => Ok(()),
            PcmState::Xrun => Err(XferError::Xrun),
            other => Err(XferError::Fault(DeviceFault::new(format!(
                "device not ready for i/o (state {other:?})"
            )))),
        }
    }
}

impl PcmDevice for SimDevice {
    fn state(&self) -> PcmState {
        self.state
    }

    fn alloc_hw_params(&mut self) -> Result<HwParams, DeviceFault> {
        if self.fails_at(SimFailure::HwParamsAlloc) {
            return Err(DeviceFault::new("cannot allocate memory"));
        }
        Ok(HwParams::empty())
    }

    fn hw_params_any(&mut self, hw: &mut HwParams) -> Result<(), DeviceFault> {
        if self.fails_at(SimFailure::HwParamsAny) {
            return Err(DeviceFault::new("no such device"));
        }
        hw.fill(self.config.space.clone());
        Ok(())
    }

    fn commit_hw_params(&mut self, hw: &HwParams) -> Result<(), DeviceFault> {
        if self.fails_at(SimFailure::HwParamsCommit) {
            return Err(DeviceFault::new("invalid argument"));
        }
        let (Some(access), Some(format), Some(rate), Some(channels)) =
            (hw.access(), hw.format(), hw.rate(), hw.channels())
        else {
            return Err(DeviceFault::new("hardware parameters not fully refined"));
        };
        let active = ActiveHw {
            access,
            format,
            rate: self.config.reported_rate.unwrap_or(rate),
            channels,
            buffer_frames: self.config.buffer_frames,
        };
        self.hw = Some(active);
        if let Ok(mut slot) = self.probe.active_hw.lock() {
            *slot = Some(active);
        }
        self.state = PcmState::Setup;
        Ok(())
    }

    fn active_hw(&self) -> Option<ActiveHw> {
        self.hw
    }

    fn sw_params_current(&mut self) -> Result<SwParams, DeviceFault> {
        if self.fails_at(SimFailure::SwParamsCurrent) {
            return Err(DeviceFault::new("cannot allocate memory"));
        }
        let hw = self
            .hw
            .ok_or_else(|| DeviceFault::new("hardware parameters not committed"))?;
        Ok(SwParams::current(hw.buffer_frames))
    }

    fn commit_sw_params(&mut self, sw: &SwParams) -> Result<(), DeviceFault> {
        if self.fails_at(SimFailure::SwParamsCommit) {
            return Err(DeviceFault::new("invalid argument"));
        }
        self.sw = Some(*sw);
        if let Ok(mut slot) = self.probe.sw_params.lock() {
            *slot = Some(*sw);
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), DeviceFault> {
        if self.fails_at(SimFailure::Prepare) {
            return Err(DeviceFault::new("device not configured"));
        }
        if self.hw.is_none() {
            return Err(DeviceFault::new("hardware parameters not committed"));
        }
        self.queued = 0;
        self.state = PcmState::Prepared;
        self.probe.prepares.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceFault> {
        if self.fails_at(SimFailure::Start) {
            return Err(DeviceFault::new("broken pipe"));
        }
        if self.state != PcmState::Prepared {
            return Err(DeviceFault::new(format!(
                "cannot start from state {:?}",
                self.state
            )));
        }
        self.set_running();
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus, DeviceFault> {
        if self.state == PcmState::Closed {
            return Err(DeviceFault::new("file descriptor in bad state"));
        }
        let avail_min = self.sw.map(|sw| sw.avail_min()).unwrap_or(1);
        if let Timing::Scripted { ticks, pending, .. } = &mut self.timing {
            return match ticks.pop_front() {
                Some(SimTick::Ready(frames)) => {
                    *pending = Some(Ok(frames));
                    Ok(WaitStatus::Ready)
                }
                Some(SimTick::Xrun) => {
                    *pending = Some(Err(XferError::Xrun));
                    self.state = PcmState::Xrun;
                    Ok(WaitStatus::Ready)
                }
                Some(SimTick::AvailFault(message)) => {
                    *pending = Some(Err(XferError::Fault(DeviceFault::new(message))));
                    Ok(WaitStatus::Ready)
                }
                Some(SimTick::WaitFault(message)) => Err(DeviceFault::new(message)),
                Some(SimTick::Timeout) | None => Ok(WaitStatus::TimedOut),
            };
        }

        self.advance();
        if self.state == PcmState::Xrun || self.free_frames() >= avail_min {
            return Ok(WaitStatus::Ready);
        }
        if self.state != PcmState::Running {
            std::thread::sleep(timeout);
            return Ok(WaitStatus::TimedOut);
        }
        let needed = self.frames_to_duration(avail_min - self.free_frames());
        if needed > timeout {
            std::thread::sleep(timeout);
            self.advance();
            return Ok(WaitStatus::TimedOut);
        }
        std::thread::sleep(needed);
        self.advance();
        Ok(WaitStatus::Ready)
    }

    fn avail_update(&mut self) -> Result<usize, XferError> {
        if let Timing::Scripted { pending, .. } = &mut self.timing {
            if let Some(result) = pending.take() {
                return result;
            }
            self.ensure_io_state()?;
            return Ok(self.free_frames());
        }
        self.advance();
        self.ensure_io_state()?;
        Ok(self.free_frames())
    }

    fn write_interleaved(&mut self, samples: &[i16]) -> Result<usize, XferError> {
        let channels = self.hw.map(|hw| hw.channels as usize).unwrap_or(1).max(1);
        let requested = samples.len() / channels;
        self.advance();
        self.ensure_io_state()?;

        let free = self.free_frames();
        let outcome = match &mut self.timing {
            Timing::Scripted { writes, .. } => writes.pop_front().unwrap_or(SimWrite::AcceptAll),
            Timing::Clocked { .. } => SimWrite::AcceptAtMost(free),
        };
        let (queued, accepted) = match outcome {
            SimWrite::AcceptAll => (requested, requested),
            SimWrite::AcceptAtMost(limit) => (requested.min(limit), requested.min(limit)),
            SimWrite::Report(count) => (requested, count),
            SimWrite::Xrun => {
                self.state = PcmState::Xrun;
                self.probe.record_write(samples, requested, 0);
                return Err(XferError::Xrun);
            }
            SimWrite::Fault(message) => {
                self.probe.record_write(samples, requested, 0);
                return Err(XferError::Fault(DeviceFault::new(message)));
            }
        };

        self.queued = (self.queued + queued).min(self.config.buffer_frames);
        self.probe.record_write(samples, requested, accepted);
        self.maybe_autostart();
        Ok(accepted)
    }

    fn drain(&mut self) -> Result<(), DeviceFault> {
        self.advance();
        if self.state == PcmState::Prepared && self.queued > 0 {
            self.set_running();
        }
        if matches!(self.timing, Timing::Clocked { .. }) && self.state == PcmState::Running {
            std::thread::sleep(self.frames_to_duration(self.queued));
        }
        self.queued = 0;
        self.state = PcmState::Setup;
        self.probe.drains.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), DeviceFault> {
        self.queued = 0;
        self.state = PcmState::Setup;
        self.probe.drops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        if self.state == PcmState::Closed {
            return;
        }
        self.state = PcmState::Closed;
        self.probe.closes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(config: SimConfig) -> (SimDevice, Arc<SimProbe>) {
        let backend = SimBackend::new(config);
        let probe = backend.probe();
        let mut dev = backend.open("default").unwrap();
        let mut hw = dev.alloc_hw_params().unwrap();
        dev.hw_params_any(&mut hw).unwrap();
        hw.set_access(Access::RwInterleaved).unwrap();
        hw.set_format(SampleFormat::S16Le).unwrap();
        hw.set_rate_near(48_000).unwrap();
        hw.set_channels(2).unwrap();
        dev.commit_hw_params(&hw).unwrap();
        let mut sw = dev.sw_params_current().unwrap();
        sw.set_avail_min(1024).unwrap();
        sw.set_start_threshold(0).unwrap();
        dev.commit_sw_params(&sw).unwrap();
        dev.prepare().unwrap();
        (dev, probe)
    }

    #[test]
    fn open_rejects_unknown_name() {
        let backend = SimBackend::new(SimConfig::default());
        assert!(backend.open("hw:7,0").is_err());
        assert_eq!(backend.probe().opens(), 0);
    }

    #[test]
    fn scripted_ticks_feed_queries_in_order() {
        let (mut dev, _probe) = configured(SimConfig::scripted(vec![
            SimTick::Ready(512),
            SimTick::Timeout,
            SimTick::Xrun,
        ]));
        let timeout = Duration::from_millis(1);
        assert_eq!(dev.wait(timeout).unwrap(), WaitStatus::Ready);
        assert_eq!(dev.avail_update().unwrap(), 512);
        assert_eq!(dev.wait(timeout).unwrap(), WaitStatus::TimedOut);
        assert_eq!(dev.wait(timeout).unwrap(), WaitStatus::Ready);
        assert_eq!(dev.avail_update(), Err(XferError::Xrun));
        assert_eq!(dev.state(), PcmState::Xrun);
        assert_eq!(dev.wait(timeout).unwrap(), WaitStatus::TimedOut);
    }

    #[test]
    fn scripted_writes_limit_accepted_frames() {
        let config = SimConfig::scripted(Vec::new())
            .with_writes(vec![SimWrite::AcceptAtMost(3), SimWrite::Xrun]);
        let (mut dev, probe) = configured(config);
        let samples = vec![1i16; 8];
        assert_eq!(dev.write_interleaved(&samples).unwrap(), 3);
        assert_eq!(dev.write_interleaved(&samples), Err(XferError::Xrun));
        assert_eq!(
            probe.writes(),
            vec![
                WriteRecord {
                    requested: 4,
                    accepted: 3
                },
                WriteRecord {
                    requested: 4,
                    accepted: 0
                },
            ]
        );
    }

    #[test]
    fn start_threshold_autostarts_after_enough_frames() {
        let backend = SimBackend::new(SimConfig::scripted(Vec::new()));
        let mut dev = backend.open("default").unwrap();
        let mut hw = dev.alloc_hw_params().unwrap();
        dev.hw_params_any(&mut hw).unwrap();
        hw.set_access(Access::RwInterleaved).unwrap();
        hw.set_format(SampleFormat::S16Le).unwrap();
        hw.set_rate_near(44_100).unwrap();
        hw.set_channels(2).unwrap();
        dev.commit_hw_params(&hw).unwrap();
        let mut sw = dev.sw_params_current().unwrap();
        sw.set_start_threshold(4).unwrap();
        dev.commit_sw_params(&sw).unwrap();
        dev.prepare().unwrap();

        dev.write_interleaved(&[0; 4]).unwrap();
        assert_eq!(dev.state(), PcmState::Prepared);
        dev.write_interleaved(&[0; 4]).unwrap();
        assert_eq!(dev.state(), PcmState::Running);
    }

    #[test]
    fn clocked_device_reports_free_space_and_underruns() {
        let (mut dev, _probe) = configured(SimConfig::default());
        assert_eq!(dev.avail_update().unwrap(), 16_384);
        dev.write_interleaved(&vec![0i16; 2 * 48]).unwrap();
        assert_eq!(dev.avail_update().unwrap(), 16_384 - 48);
        dev.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(dev.avail_update(), Err(XferError::Xrun));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut dev, probe) = configured(SimConfig::default());
        dev.close();
        dev.close();
        assert_eq!(probe.closes(), 1);
        assert!(dev.wait(Duration::from_millis(1)).is_err());
    }
}
