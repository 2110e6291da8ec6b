//! Delivery scheduler: the real-time wait → query → produce → deliver loop.
//!
//! ```text
//!   Waiting ──ready──▶ Querying ──free>0──▶ Producing ──▶ Delivering
//!     ▲  │               │ free=0                            │
//!     │  └─timeout: Err(WaitTimeout), handle kept            │
//!     └──────────────────┴─────────────full write────────────┘
//!
//!   fatal error | stop request | producer exhausted ──▶ Stopped (handle released)
//! ```
//!
//! One thread owns the scheduler, its device handle and its frame buffer. The only place
//! it blocks is the bounded readiness wait. Other threads can ask it to stop through a
//! [`StopSignal`]; the request is honoured at the next phase boundary, never mid-write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::{EngineConfig, UnderrunPolicy};
use crate::error::{EngineError, Stage};
use crate::frame_buffer::FrameBuffer;
use crate::handle::DeviceHandle;
use crate::negotiate::{NegotiatedParams, open_and_configure};
use crate::pcm::{PcmBackend, PcmDevice, PcmState, WaitStatus, XferError};
use crate::producer::{ProducerError, SampleProducer};
use crate::stats::EngineStats;

/// Cloneable stop request flag, safe to set from any thread or a signal handler.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Frames to deliver for one wakeup: never more than the device has free, and never more
/// than half the frame buffer.
pub fn deliverable_frames(available: usize, capacity_frames: usize) -> usize {
    available.min(capacity_frames / 2)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Waiting,
    Querying,
    Producing { frames: usize },
    Delivering { frames: usize },
    Stopped,
}

/// Per-iteration state, rebuilt from what the device reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopState {
    pub phase: Phase,
    /// Free frames from the most recent query.
    pub available: Option<usize>,
    /// Frames the device accepted on the most recent write.
    pub last_written: Option<usize>,
    pub running: bool,
}

/// Why the loop ended without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// A [`StopSignal`] was raised or [`Scheduler::stop`] was called.
    Requested,
    /// The producer has no more audio; queued frames were drained.
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Frame buffer capacity in frames (at least 2).
    pub buffer_frames: usize,
    pub wait_timeout: Duration,
    pub underrun_policy: UnderrunPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SchedulerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            buffer_frames: config.buffer_frames,
            wait_timeout: config.wait_timeout,
            underrun_policy: config.underrun_policy,
        }
    }
}

enum Flow {
    Next(Phase),
    Finish(StopReason),
}

#[derive(Clone, Copy)]
enum Halt {
    Drain,
    Discard,
}

/// Negotiate with `config.device` and build a scheduler around it.
///
/// `make_producer` sees the accepted parameters, so rate-dependent producers are built for
/// the rate the device actually runs at.
pub fn start<B, P, F>(
    backend: &B,
    config: &EngineConfig,
    make_producer: F,
) -> Result<Scheduler<B::Device, P>, EngineError>
where
    B: PcmBackend,
    P: SampleProducer,
    F: FnOnce(&NegotiatedParams) -> P,
{
    let (handle, params) = open_and_configure(backend, &config.device, &config.format)?;
    let producer = make_producer(&params);
    Ok(Scheduler::new(handle, params, producer, SchedulerOptions::from(config)))
}

/// Owns the device handle, frame buffer and producer for one playback run.
pub struct Scheduler<D: PcmDevice, P: SampleProducer> {
    handle: DeviceHandle<D>,
    params: NegotiatedParams,
    producer: P,
    buffer: FrameBuffer,
    options: SchedulerOptions,
    state: LoopState,
    stop: StopSignal,
    stats: Arc<EngineStats>,
}

impl<D: PcmDevice, P: SampleProducer> Scheduler<D, P> {
    pub fn new(
        handle: DeviceHandle<D>,
        params: NegotiatedParams,
        producer: P,
        options: SchedulerOptions,
    ) -> Self {
        let buffer = FrameBuffer::new(options.buffer_frames.max(2), params.channels as usize);
        let stats = EngineStats::shared();
        stats.set_sample_rate(params.rate);
        Self {
            handle,
            params,
            producer,
            buffer,
            options,
            state: LoopState {
                phase: Phase::Waiting,
                available: None,
                last_written: None,
                running: true,
            },
            stop: StopSignal::new(),
            stats,
        }
    }

    /// Use an externally created stop flag (e.g. one installed in a Ctrl-C handler).
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Report into shared counters instead of the scheduler's own.
    pub fn with_stats(mut self, stats: Arc<EngineStats>) -> Self {
        stats.set_sample_rate(self.params.rate);
        self.stats = stats;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn params(&self) -> &NegotiatedParams {
        &self.params
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn handle(&self) -> &DeviceHandle<D> {
        &self.handle
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Run until the loop stops.
    ///
    /// Returns `Err(WaitTimeout)` without releasing the device when a readiness wait times
    /// out; calling `run` again resumes waiting. Every other error leaves the scheduler
    /// stopped with the device released.
    pub fn run(&mut self) -> Result<StopReason, EngineError> {
        loop {
            if let Some(reason) = self.step()? {
                return Ok(reason);
            }
        }
    }

    /// [`Scheduler::run`], retrying wait timeouts.
    ///
    /// Gives up (releasing the device) after `max_consecutive_timeouts` timeouts with no
    /// write in between. `None` retries forever.
    pub fn run_until_stopped(
        &mut self,
        max_consecutive_timeouts: Option<u32>,
    ) -> Result<StopReason, EngineError> {
        let mut consecutive = 0u32;
        let mut cycles_seen = self.stats.cycles();
        loop {
            match self.run() {
                Err(EngineError::WaitTimeout { timeout_ms }) => {
                    let cycles = self.stats.cycles();
                    if cycles != cycles_seen {
                        consecutive = 0;
                        cycles_seen = cycles;
                    }
                    consecutive += 1;
                    if let Some(limit) = max_consecutive_timeouts {
                        if consecutive >= limit {
                            tracing::error!(timeouts = consecutive, "device stalled; giving up");
                            self.halt(Halt::Discard);
                            return Err(EngineError::WaitTimeout { timeout_ms });
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Advance the state machine by one phase.
    ///
    /// Returns `Ok(Some(reason))` once the loop has stopped normally.
    pub fn step(&mut self) -> Result<Option<StopReason>, EngineError> {
        if self.state.phase == Phase::Stopped {
            return Err(EngineError::Stopped);
        }
        if self.stop.is_requested() {
            tracing::info!("stop requested");
            self.halt(Halt::Discard);
            return Ok(Some(StopReason::Requested));
        }

        let flow = match self.state.phase {
            Phase::Waiting => self.wait_ready(),
            Phase::Querying => self.query(),
            Phase::Producing { frames } => self.produce(frames),
            Phase::Delivering { frames } => self.deliver(frames),
            Phase::Stopped => Err(EngineError::Stopped),
        };

        match flow {
            Ok(Flow::Next(phase)) => {
                self.state.phase = phase;
                Ok(None)
            }
            Ok(Flow::Finish(reason)) => {
                self.halt(Halt::Drain);
                Ok(Some(reason))
            }
            Err(err) if !err.is_fatal() => Err(err),
            Err(err) => {
                tracing::error!(error = %err, "delivery loop stopped");
                self.halt(Halt::Discard);
                Err(err)
            }
        }
    }

    /// Stop now, discarding queued frames and releasing the device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.state.phase != Phase::Stopped {
            tracing::info!("delivery loop stopped by owner");
        }
        self.halt(Halt::Discard);
    }

    fn wait_ready(&mut self) -> Result<Flow, EngineError> {
        let timeout = self.options.wait_timeout;
        match self.handle.device_mut().wait(timeout) {
            Ok(WaitStatus::Ready) => Ok(Flow::Next(Phase::Querying)),
            Ok(WaitStatus::TimedOut) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                self.stats.record_wait_timeout();
                tracing::warn!(timeout_ms, "device not ready");
                Err(EngineError::WaitTimeout { timeout_ms })
            }
            Err(fault) => Err(EngineError::PollFailed {
                stage: Stage::Wait,
                reason: fault.message,
            }),
        }
    }

    fn query(&mut self) -> Result<Flow, EngineError> {
        match self.handle.device_mut().avail_update() {
            Ok(available) => {
                self.state.available = Some(available);
                let frames = deliverable_frames(available, self.buffer.capacity_frames());
                if frames == 0 {
                    self.stats.record_empty_wakeup();
                    tracing::trace!("woken with no free frames");
                    return Ok(Flow::Next(Phase::Waiting));
                }
                Ok(Flow::Next(Phase::Producing { frames }))
            }
            Err(XferError::Xrun) => {
                self.state.available = None;
                self.on_underrun(Stage::Query)
            }
            Err(XferError::Fault(fault)) => Err(EngineError::PollFailed {
                stage: Stage::Query,
                reason: fault.message,
            }),
        }
    }

    fn produce(&mut self, frames: usize) -> Result<Flow, EngineError> {
        match self.producer.fill(&mut self.buffer, frames) {
            Ok(0) => Err(EngineError::Producer {
                reason: format!("produced no frames for a request of {frames}"),
            }),
            Ok(produced) if produced > frames => Err(EngineError::Producer {
                reason: format!("reported {produced} frames for a request of {frames}"),
            }),
            Ok(produced) => {
                if produced < frames {
                    self.stats.record_short_fill();
                    tracing::debug!(requested = frames, produced, "short fill");
                }
                Ok(Flow::Next(Phase::Delivering { frames: produced }))
            }
            Err(ProducerError::Exhausted) => {
                tracing::info!("producer exhausted");
                Ok(Flow::Finish(StopReason::Exhausted))
            }
            Err(ProducerError::Failed(reason)) => Err(EngineError::Producer { reason }),
        }
    }

    fn deliver(&mut self, frames: usize) -> Result<Flow, EngineError> {
        let samples = self.buffer.frames(frames);
        match self.handle.device_mut().write_interleaved(samples) {
            Ok(written) if written == frames => {
                self.state.last_written = Some(written);
                self.stats.record_write(written);
                tracing::trace!(frames = written, "delivered");
                if self.params.start_threshold == 0
                    && self.handle.device().state() == PcmState::Prepared
                {
                    self.handle
                        .device_mut()
                        .start()
                        .map_err(|e| EngineError::DeviceUnavailable {
                            stage: Stage::Start,
                            device: self.handle.name().to_string(),
                            reason: e.message,
                        })?;
                    tracing::debug!("device started");
                }
                Ok(Flow::Next(Phase::Waiting))
            }
            Ok(written) => {
                self.state.last_written = Some(written);
                let reason = if written > frames {
                    "device reported more frames than were written"
                } else {
                    "short write"
                };
                Err(EngineError::DeliveryFailure {
                    requested: frames,
                    written,
                    reason: reason.to_string(),
                })
            }
            Err(XferError::Xrun) => {
                self.state.last_written = None;
                self.on_underrun(Stage::Deliver)
            }
            Err(XferError::Fault(fault)) => Err(EngineError::DeliveryFailure {
                requested: frames,
                written: 0,
                reason: fault.message,
            }),
        }
    }

    fn on_underrun(&mut self, stage: Stage) -> Result<Flow, EngineError> {
        self.stats.record_underrun();
        match self.options.underrun_policy {
            UnderrunPolicy::Stop => {
                tracing::warn!(%stage, "buffer underrun");
                Err(EngineError::Underrun { stage })
            }
            UnderrunPolicy::Recover => {
                tracing::warn!(%stage, "buffer underrun; re-preparing device");
                self.handle
                    .device_mut()
                    .prepare()
                    .map_err(|e| EngineError::DeviceUnavailable {
                        stage: Stage::Recover,
                        device: self.handle.name().to_string(),
                        reason: e.message,
                    })?;
                self.stats.record_recovery();
                Ok(Flow::Next(Phase::Waiting))
            }
        }
    }

    fn halt(&mut self, halt: Halt) {
        if self.handle.is_open() {
            let device = self.handle.device_mut();
            let result = match halt {
                Halt::Drain => device.drain(),
                Halt::Discard => device.drop_pending(),
            };
            if let Err(fault) = result {
                tracing::warn!(error = %fault, "device did not stop cleanly");
            }
            self.handle.release();
        }
        self.state.phase = Phase::Stopped;
        self.state.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatSpec;
    use crate::producer::ConstantProducer;
    use crate::sim::{SimBackend, SimConfig, SimDevice, SimProbe, SimTick};

    fn scheduler(
        ticks: Vec<SimTick>,
    ) -> (Scheduler<SimDevice, ConstantProducer>, Arc<SimProbe>) {
        let backend = SimBackend::new(SimConfig::scripted(ticks));
        let probe = backend.probe();
        let (handle, params) =
            open_and_configure(&backend, "default", &FormatSpec::default()).unwrap();
        let options = SchedulerOptions {
            wait_timeout: Duration::from_millis(5),
            ..SchedulerOptions::default()
        };
        (
            Scheduler::new(handle, params, ConstantProducer::reference(), options),
            probe,
        )
    }

    #[test]
    fn deliverable_frames_caps_at_half_capacity() {
        assert_eq!(deliverable_frames(8192, 4096), 2048);
        assert_eq!(deliverable_frames(1000, 4096), 1000);
        assert_eq!(deliverable_frames(0, 4096), 0);
        assert_eq!(deliverable_frames(10, 1), 0);
    }

    #[test]
    fn steps_walk_the_phases_in_order() {
        let (mut sched, _probe) = scheduler(vec![SimTick::Ready(100)]);
        assert_eq!(sched.state().phase, Phase::Waiting);
        sched.step().unwrap();
        assert_eq!(sched.state().phase, Phase::Querying);
        sched.step().unwrap();
        assert_eq!(sched.state().phase, Phase::Producing { frames: 100 });
        assert_eq!(sched.state().available, Some(100));
        sched.step().unwrap();
        assert_eq!(sched.state().phase, Phase::Delivering { frames: 100 });
        sched.step().unwrap();
        assert_eq!(sched.state().phase, Phase::Waiting);
        assert_eq!(sched.state().last_written, Some(100));
    }

    #[test]
    fn empty_wakeup_returns_to_waiting_without_writing() {
        let (mut sched, probe) = scheduler(vec![SimTick::Ready(0)]);
        sched.step().unwrap();
        sched.step().unwrap();
        assert_eq!(sched.state().phase, Phase::Waiting);
        assert!(probe.writes().is_empty());
        assert_eq!(sched.stats().snapshot().empty_wakeups, 1);
    }

    #[test]
    fn wait_timeout_keeps_device_open_and_resumes() {
        let (mut sched, probe) = scheduler(vec![SimTick::Timeout, SimTick::Ready(10)]);
        assert_eq!(sched.run(), Err(EngineError::WaitTimeout { timeout_ms: 5 }));
        assert!(sched.handle().is_open());
        assert_eq!(sched.state().phase, Phase::Waiting);

        assert_eq!(sched.run(), Err(EngineError::WaitTimeout { timeout_ms: 5 }));
        assert_eq!(probe.writes().len(), 1);
        assert_eq!(probe.closes(), 0);
        assert_eq!(sched.stats().snapshot().wait_timeouts, 2);
    }

    #[test]
    fn first_write_starts_device_when_start_threshold_is_zero() {
        let (mut sched, probe) = scheduler(vec![SimTick::Ready(64), SimTick::Ready(64)]);
        let _ = sched.run();
        assert_eq!(probe.starts(), 1);
        assert_eq!(probe.writes().len(), 2);
        assert_eq!(sched.handle().device().state(), PcmState::Running);
    }

    #[test]
    fn stop_signal_is_honoured_at_next_boundary() {
        let (mut sched, probe) = scheduler(vec![SimTick::Ready(64)]);
        let stop = sched.stop_signal();
        sched.step().unwrap();
        stop.request();
        assert_eq!(sched.step(), Ok(Some(StopReason::Requested)));
        assert_eq!(sched.state().phase, Phase::Stopped);
        assert!(!sched.state().running);
        assert_eq!(probe.drops(), 1);
        assert_eq!(probe.closes(), 1);
        assert_eq!(sched.run(), Err(EngineError::Stopped));
    }

    #[test]
    fn stop_twice_releases_once() {
        let (mut sched, probe) = scheduler(Vec::new());
        sched.stop();
        sched.stop();
        assert_eq!(probe.closes(), 1);
        assert!(!sched.handle().is_open());
    }

    #[test]
    fn stats_use_negotiated_rate() {
        let (sched, _probe) = scheduler(Vec::new());
        assert_eq!(sched.stats().snapshot().sample_rate, Some(44_100));
        let shared = EngineStats::shared();
        let sched = sched.with_stats(shared.clone());
        assert!(Arc::ptr_eq(&sched.stats(), &shared));
        assert_eq!(shared.snapshot().sample_rate, Some(44_100));
    }
}
