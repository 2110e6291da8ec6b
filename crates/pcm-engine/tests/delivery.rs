use std::sync::Arc;
use std::time::Duration;

use pcm_engine::config::{EngineConfig, FormatSpec, UnderrunPolicy};
use pcm_engine::frame_buffer::FrameBuffer;
use pcm_engine::handle::DeviceHandle;
use pcm_engine::negotiate::open_and_configure;
use pcm_engine::producer::{
    ConstantProducer, LimitedProducer, ProducerError, REFERENCE_LEVEL, SampleProducer,
};
use pcm_engine::scheduler::{self, Phase, Scheduler, SchedulerOptions, StopReason};
use pcm_engine::sim::{SimBackend, SimConfig, SimDevice, SimFailure, SimProbe, SimTick, SimWrite, WriteRecord};
use pcm_engine::{EngineError, Stage};

/// Records every request, then delegates.
struct Recording<P> {
    inner: P,
    requests: Vec<usize>,
}

impl<P> Recording<P> {
    fn new(inner: P) -> Self {
        Self {
            inner,
            requests: Vec::new(),
        }
    }
}

impl<P: SampleProducer> SampleProducer for Recording<P> {
    fn fill(&mut self, buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError> {
        self.requests.push(frames);
        self.inner.fill(buffer, frames)
    }
}

/// Always claims more frames than requested.
struct Overreporting;

impl SampleProducer for Overreporting {
    fn fill(&mut self, _buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError> {
        Ok(frames + 1)
    }
}

fn options(policy: UnderrunPolicy) -> SchedulerOptions {
    SchedulerOptions {
        buffer_frames: 4096,
        wait_timeout: Duration::from_millis(5),
        underrun_policy: policy,
    }
}

fn build<P: SampleProducer>(
    config: SimConfig,
    spec: &FormatSpec,
    producer: P,
    options: SchedulerOptions,
) -> (Scheduler<SimDevice, P>, Arc<SimProbe>) {
    let backend = SimBackend::new(config);
    let probe = backend.probe();
    let (handle, params) = open_and_configure(&backend, "default", spec).unwrap();
    (Scheduler::new(handle, params, producer, options), probe)
}

fn scripted<P: SampleProducer>(
    ticks: Vec<SimTick>,
    producer: P,
) -> (Scheduler<SimDevice, P>, Arc<SimProbe>) {
    build(
        SimConfig::scripted(ticks),
        &FormatSpec::default(),
        producer,
        options(UnderrunPolicy::Stop),
    )
}

#[test]
fn available_above_capacity_delivers_half_the_buffer() {
    let (mut sched, probe) = scripted(
        vec![SimTick::Ready(8192)],
        Recording::new(ConstantProducer::reference()),
    );
    assert_eq!(sched.params().avail_min, 4096);

    assert_eq!(sched.run(), Err(EngineError::WaitTimeout { timeout_ms: 5 }));
    assert_eq!(sched.producer().requests, vec![2048]);
    assert_eq!(
        probe.writes(),
        vec![WriteRecord {
            requested: 2048,
            accepted: 2048
        }]
    );
    let samples = probe.last_samples();
    assert_eq!(samples.len(), 2048 * 2);
    assert!(samples.iter().all(|s| *s == REFERENCE_LEVEL));
}

#[test]
fn requests_never_exceed_available_or_half_capacity() {
    let ticks: Vec<SimTick> = [0usize, 1, 100, 2047, 2048, 2049, 4096, 100_000]
        .iter()
        .map(|n| SimTick::Ready(*n))
        .collect();
    let (mut sched, probe) = scripted(ticks, Recording::new(ConstantProducer::reference()));
    let _ = sched.run();

    assert_eq!(
        sched.producer().requests,
        vec![1, 100, 2047, 2048, 2048, 2048, 2048]
    );
    for write in probe.writes() {
        assert!(write.requested <= 2048);
    }
    assert_eq!(sched.stats().snapshot().empty_wakeups, 1);
}

#[test]
fn underrun_on_query_stops_and_releases() {
    let (mut sched, probe) = scripted(
        vec![SimTick::Ready(64), SimTick::Xrun],
        ConstantProducer::reference(),
    );
    assert_eq!(
        sched.run(),
        Err(EngineError::Underrun {
            stage: Stage::Query
        })
    );
    assert_eq!(sched.state().phase, Phase::Stopped);
    assert!(!sched.handle().is_open());
    assert_eq!(probe.closes(), 1);
    assert_eq!(sched.stats().snapshot().underrun_events, 1);
    assert_eq!(sched.run(), Err(EngineError::Stopped));
}

#[test]
fn underrun_on_write_stops_and_releases() {
    let config = SimConfig::scripted(vec![SimTick::Ready(64)]).with_writes(vec![SimWrite::Xrun]);
    let (mut sched, probe) = build(
        config,
        &FormatSpec::default(),
        ConstantProducer::reference(),
        options(UnderrunPolicy::Stop),
    );
    assert_eq!(
        sched.run(),
        Err(EngineError::Underrun {
            stage: Stage::Deliver
        })
    );
    assert_eq!(probe.closes(), 1);
}

#[test]
fn recover_policy_reprepares_and_keeps_playing() {
    let (mut sched, probe) = build(
        SimConfig::scripted(vec![SimTick::Ready(100), SimTick::Xrun, SimTick::Ready(100)]),
        &FormatSpec::default(),
        ConstantProducer::reference(),
        options(UnderrunPolicy::Recover),
    );
    assert_eq!(sched.run(), Err(EngineError::WaitTimeout { timeout_ms: 5 }));

    let stats = sched.stats().snapshot();
    assert_eq!(stats.underrun_events, 1);
    assert_eq!(stats.recoveries, 1);
    assert_eq!(probe.writes().len(), 2);
    assert_eq!(probe.prepares(), 2);
    assert_eq!(probe.starts(), 2);
    assert!(sched.handle().is_open());
}

#[test]
fn short_fill_writes_exactly_the_short_count_then_drains() {
    let producer = Recording::new(LimitedProducer::new(ConstantProducer::reference(), 100));
    let (mut sched, probe) = scripted(vec![SimTick::Ready(4096), SimTick::Ready(4096)], producer);

    assert_eq!(sched.run(), Ok(StopReason::Exhausted));
    assert_eq!(sched.producer().requests, vec![2048, 2048]);
    assert_eq!(
        probe.writes(),
        vec![WriteRecord {
            requested: 100,
            accepted: 100
        }]
    );
    assert_eq!(sched.state().last_written, Some(100));
    assert_eq!(sched.stats().snapshot().short_fills, 1);
    assert_eq!(probe.drains(), 1);
    assert_eq!(probe.drops(), 0);
    assert_eq!(probe.closes(), 1);
}

#[test]
fn short_write_is_a_delivery_failure() {
    let config = SimConfig::scripted(vec![SimTick::Ready(4096)])
        .with_writes(vec![SimWrite::AcceptAtMost(10)]);
    let (mut sched, probe) = build(
        config,
        &FormatSpec::default(),
        ConstantProducer::reference(),
        options(UnderrunPolicy::Stop),
    );
    let err = sched.run().unwrap_err();
    assert_eq!(
        err,
        EngineError::DeliveryFailure {
            requested: 2048,
            written: 10,
            reason: "short write".to_string(),
        }
    );
    assert_eq!(sched.state().last_written, Some(10));
    assert_eq!(probe.closes(), 1);
}

#[test]
fn write_reporting_more_than_given_is_not_a_short_write() {
    let config = SimConfig::scripted(vec![SimTick::Ready(4096)])
        .with_writes(vec![SimWrite::Report(4096)]);
    let (mut sched, probe) = build(
        config,
        &FormatSpec::default(),
        ConstantProducer::reference(),
        options(UnderrunPolicy::Stop),
    );
    let err = sched.run().unwrap_err();
    assert_eq!(
        err,
        EngineError::DeliveryFailure {
            requested: 2048,
            written: 4096,
            reason: "device reported more frames than were written".to_string(),
        }
    );
    assert_eq!(sched.state().last_written, Some(4096));
    assert_eq!(probe.closes(), 1);
}

#[test]
fn write_fault_is_a_delivery_failure() {
    let config = SimConfig::scripted(vec![SimTick::Ready(16)])
        .with_writes(vec![SimWrite::Fault("input/output error".to_string())]);
    let (mut sched, probe) = build(
        config,
        &FormatSpec::default(),
        ConstantProducer::reference(),
        options(UnderrunPolicy::Stop),
    );
    assert!(matches!(
        sched.run(),
        Err(EngineError::DeliveryFailure { written: 0, .. })
    ));
    assert_eq!(probe.closes(), 1);
}

#[test]
fn poll_failures_stop_the_loop() {
    let (mut sched, probe) = scripted(
        vec![SimTick::WaitFault("bad file descriptor".to_string())],
        ConstantProducer::reference(),
    );
    assert_eq!(
        sched.run(),
        Err(EngineError::PollFailed {
            stage: Stage::Wait,
            reason: "bad file descriptor".to_string(),
        })
    );
    assert_eq!(probe.closes(), 1);

    let (mut sched, probe) = scripted(
        vec![SimTick::AvailFault("no such device".to_string())],
        ConstantProducer::reference(),
    );
    assert!(matches!(
        sched.run(),
        Err(EngineError::PollFailed {
            stage: Stage::Query,
            ..
        })
    ));
    assert_eq!(probe.closes(), 1);
}

#[test]
fn misbehaving_producer_is_rejected() {
    let (mut sched, probe) = scripted(vec![SimTick::Ready(64)], Overreporting);
    assert!(matches!(sched.run(), Err(EngineError::Producer { .. })));
    assert!(probe.writes().is_empty());
    assert_eq!(probe.closes(), 1);
}

#[test]
fn start_failure_reports_start_stage() {
    let (mut sched, probe) = build(
        SimConfig::scripted(vec![SimTick::Ready(64)]).failing_at(SimFailure::Start),
        &FormatSpec::default(),
        ConstantProducer::reference(),
        options(UnderrunPolicy::Stop),
    );
    let err = sched.run().unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Start));
    assert!(matches!(err, EngineError::DeviceUnavailable { .. }));
    assert_eq!(probe.closes(), 1);
}

#[test]
fn device_start_threshold_leaves_starting_to_the_device() {
    let spec = FormatSpec {
        start_threshold: 4096,
        ..FormatSpec::default()
    };
    let (mut sched, probe) = build(
        SimConfig::scripted(vec![SimTick::Ready(4096), SimTick::Ready(4096)]),
        &spec,
        ConstantProducer::reference(),
        options(UnderrunPolicy::Stop),
    );
    sched.step().unwrap();
    sched.step().unwrap();
    sched.step().unwrap();
    sched.step().unwrap();
    assert_eq!(probe.starts(), 0);

    let _ = sched.run();
    assert_eq!(probe.writes().len(), 2);
    assert_eq!(probe.starts(), 1);
}

#[test]
fn double_stop_and_drop_release_once() {
    let (mut sched, probe) = scripted(vec![SimTick::Ready(64)], ConstantProducer::reference());
    sched.stop();
    sched.stop();
    drop(sched);
    assert_eq!(probe.closes(), 1);
    assert_eq!(probe.opens(), 1);
}

#[test]
fn stop_signal_from_another_thread_ends_run() {
    let (sched, probe) = build(
        SimConfig::default(),
        &FormatSpec {
            avail_min: 256,
            ..FormatSpec::default()
        },
        ConstantProducer::reference(),
        options(UnderrunPolicy::Recover),
    );
    let stop = sched.stop_signal();
    let worker = std::thread::spawn(move || {
        let mut sched = sched;
        sched.run_until_stopped(None)
    });
    std::thread::sleep(Duration::from_millis(50));
    stop.request();

    assert_eq!(worker.join().unwrap(), Ok(StopReason::Requested));
    assert_eq!(probe.closes(), 1);
    assert!(!probe.writes().is_empty());
}

#[test]
fn run_until_stopped_gives_up_after_consecutive_timeouts() {
    let (mut sched, probe) = scripted(
        vec![
            SimTick::Ready(10),
            SimTick::Timeout,
            SimTick::Ready(10),
            SimTick::Timeout,
            SimTick::Timeout,
        ],
        ConstantProducer::reference(),
    );
    assert_eq!(
        sched.run_until_stopped(Some(2)),
        Err(EngineError::WaitTimeout { timeout_ms: 5 })
    );
    assert_eq!(probe.writes().len(), 2);
    assert_eq!(sched.stats().snapshot().wait_timeouts, 3);
    assert_eq!(probe.closes(), 1);
    assert_eq!(sched.state().phase, Phase::Stopped);
}

#[test]
fn start_negotiates_and_builds_rate_aware_producer() {
    let backend = SimBackend::new(SimConfig::scripted(vec![SimTick::Ready(32)]));
    let probe = backend.probe();
    let config = EngineConfig {
        wait_timeout: Duration::from_millis(5),
        ..EngineConfig::default()
    };
    let mut seen_rate = 0;
    let mut sched = scheduler::start(&backend, &config, |params| {
        seen_rate = params.rate;
        LimitedProducer::new(ConstantProducer::reference(), 32)
    })
    .unwrap();
    assert_eq!(seen_rate, 44_100);
    assert_eq!(sched.params().rate, probe.active_hw().unwrap().rate);

    assert_eq!(sched.run_until_stopped(Some(3)), Err(EngineError::WaitTimeout { timeout_ms: 5 }));
    assert_eq!(probe.writes().len(), 1);
}

#[test]
fn negotiation_failure_leaves_nothing_open() {
    let backend = SimBackend::new(SimConfig::default());
    let config = EngineConfig {
        format: FormatSpec {
            channels: 9,
            ..FormatSpec::default()
        },
        ..EngineConfig::default()
    };
    match scheduler::start(&backend, &config, |_| ConstantProducer::reference()) {
        Ok(_) => panic!("nine channels should be rejected"),
        Err(err) => assert_eq!(err.stage(), Some(Stage::Channels)),
    }
    assert_eq!(backend.probe().opens(), 1);
    assert_eq!(backend.probe().closes(), 1);
}

#[test]
fn release_then_drop_closes_once() {
    let backend = SimBackend::new(SimConfig::default());
    let probe = backend.probe();
    let (mut handle, _params): (DeviceHandle<SimDevice>, _) =
        open_and_configure(&backend, "sim", &FormatSpec::default()).unwrap();
    assert!(handle.release());
    assert!(!handle.release());
    drop(handle);
    assert_eq!(probe.closes(), 1);
}
