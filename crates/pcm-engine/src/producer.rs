//! Sample producers.
//!
//! A [`SampleProducer`] fills the delivery loop's [`FrameBuffer`] inside the real-time
//! loop, so implementations must not block on unbounded I/O. A producer either fills
//! exactly the requested frames, returns fewer (a short fill), or reports why it could not.

use thiserror::Error;

use crate::frame_buffer::FrameBuffer;

/// DC level used by [`ConstantProducer::reference`].
pub const REFERENCE_LEVEL: i16 = 5000;

/// Why a producer could not fill the requested frames.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProducerError {
    /// No more audio will come; the loop finishes normally.
    #[error("upstream exhausted")]
    Exhausted,
    #[error("{0}")]
    Failed(String),
}

/// Fills interleaved frames on demand.
pub trait SampleProducer {
    /// Write up to `frames` frames into the start of `buffer` and return how many were written.
    fn fill(&mut self, buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError>;
}

impl<P: SampleProducer + ?Sized> SampleProducer for Box<P> {
    fn fill(&mut self, buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError> {
        (**self).fill(buffer, frames)
    }
}

/// Every sample set to one value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantProducer {
    value: i16,
}

impl ConstantProducer {
    pub fn new(value: i16) -> Self {
        Self { value }
    }

    /// Constant fill at [`REFERENCE_LEVEL`].
    pub fn reference() -> Self {
        Self::new(REFERENCE_LEVEL)
    }
}

impl SampleProducer for ConstantProducer {
    fn fill(&mut self, buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError> {
        let out = buffer.frames_mut(frames);
        out.fill(self.value);
        Ok(out.len() / buffer.channels())
    }
}

/// Zeros.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Silence;

impl SampleProducer for Silence {
    fn fill(&mut self, buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError> {
        let out = buffer.frames_mut(frames);
        out.fill(0);
        Ok(out.len() / buffer.channels())
    }
}

/// Phase-continuous sine tone, identical on every channel.
#[derive(Clone, Debug, PartialEq)]
pub struct SineProducer {
    phase: f64,
    step: f64,
    amplitude: f64,
}

impl SineProducer {
    /// `rate_hz` must be the negotiated rate; `amplitude` is clamped to `0.0..=1.0`.
    pub fn new(rate_hz: u32, freq_hz: f64, amplitude: f64) -> Self {
        let step = if rate_hz == 0 {
            0.0
        } else {
            freq_hz / rate_hz as f64
        };
        Self {
            phase: 0.0,
            step,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }
}

impl SampleProducer for SineProducer {
    fn fill(&mut self, buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError> {
        let channels = buffer.channels();
        let out = buffer.frames_mut(frames);
        for frame in out.chunks_exact_mut(channels) {
            let value = (self.phase * std::f64::consts::TAU).sin() * self.amplitude * i16::MAX as f64;
            frame.fill(value.round() as i16);
            self.phase = (self.phase + self.step).fract();
        }
        Ok(out.len() / channels)
    }
}

/// Stops a producer after a fixed number of frames.
///
/// The last fill may be short; the call after the budget is spent returns
/// [`ProducerError::Exhausted`].
#[derive(Clone, Debug)]
pub struct LimitedProducer<P> {
    inner: P,
    remaining: u64,
}

impl<P: SampleProducer> LimitedProducer<P> {
    pub fn new(inner: P, total_frames: u64) -> Self {
        Self {
            inner,
            remaining: total_frames,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<P: SampleProducer> SampleProducer for LimitedProducer<P> {
    fn fill(&mut self, buffer: &mut FrameBuffer, frames: usize) -> Result<usize, ProducerError> {
        if self.remaining == 0 {
            return Err(ProducerError::Exhausted);
        }
        let want = frames.min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let written = self.inner.fill(buffer, want)?;
        self.remaining = self.remaining.saturating_sub(written as u64);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_fills_exactly_requested_frames() {
        let mut buf = FrameBuffer::new(16, 2);
        let mut producer = ConstantProducer::reference();
        assert_eq!(producer.fill(&mut buf, 5).unwrap(), 5);
        assert!(buf.frames(5).iter().all(|s| *s == REFERENCE_LEVEL));
        assert_eq!(buf.frames(6)[10], 0);
    }

    #[test]
    fn sine_is_deterministic_and_starts_at_zero() {
        let mut a = SineProducer::new(48_000, 1000.0, 0.5);
        let mut b = SineProducer::new(48_000, 1000.0, 0.5);
        let mut buf_a = FrameBuffer::new(64, 2);
        let mut buf_b = FrameBuffer::new(64, 2);
        a.fill(&mut buf_a, 64).unwrap();
        b.fill(&mut buf_b, 64).unwrap();
        assert_eq!(buf_a.frames(64), buf_b.frames(64));
        assert_eq!(buf_a.frames(1), &[0, 0]);
        // 1 kHz at 48 kHz peaks after 12 frames.
        let peak = buf_a.frames(13)[24];
        assert_eq!(peak, (0.5 * i16::MAX as f64).round() as i16);
    }

    #[test]
    fn sine_phase_continues_across_fills() {
        let mut whole = SineProducer::new(44_100, 440.0, 1.0);
        let mut split = SineProducer::new(44_100, 440.0, 1.0);
        let mut buf_whole = FrameBuffer::new(32, 1);
        let mut buf_split = FrameBuffer::new(32, 1);
        whole.fill(&mut buf_whole, 32).unwrap();
        split.fill(&mut buf_split, 16).unwrap();
        let first: Vec<i16> = buf_split.frames(16).to_vec();
        split.fill(&mut buf_split, 16).unwrap();
        assert_eq!(&buf_whole.frames(32)[..16], first.as_slice());
        assert_eq!(&buf_whole.frames(32)[16..], buf_split.frames(16));
    }

    #[test]
    fn limited_producer_short_fills_then_exhausts() {
        let mut producer = LimitedProducer::new(Silence, 10);
        let mut buf = FrameBuffer::new(8, 2);
        assert_eq!(producer.fill(&mut buf, 8).unwrap(), 8);
        assert_eq!(producer.fill(&mut buf, 8).unwrap(), 2);
        assert_eq!(producer.fill(&mut buf, 8), Err(ProducerError::Exhausted));
        assert_eq!(producer.remaining(), 0);
    }
}
