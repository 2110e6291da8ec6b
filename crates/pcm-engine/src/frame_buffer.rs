/// Fixed-capacity buffer of interleaved `i16` frames, reused every loop iteration.
///
/// Samples are stored interleaved:
/// `frame0[ch0], frame0[ch1], ..., frame1[ch0], frame1[ch1], ...`
#[derive(Clone, Debug)]
pub struct FrameBuffer {
    samples: Vec<i16>,
    channels: usize,
    capacity_frames: usize,
}

impl FrameBuffer {
    /// Allocate `capacity_frames` frames of `channels` samples, zeroed.
    ///
    /// `channels` is raised to at least 1.
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            samples: vec![0; capacity_frames.saturating_mul(channels)],
            channels,
            capacity_frames,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// The first `frames` frames (clamped to capacity) for writing.
    pub fn frames_mut(&mut self, frames: usize) -> &mut [i16] {
        let end = frames.min(self.capacity_frames) * self.channels;
        &mut self.samples[..end]
    }

    /// The first `frames` frames (clamped to capacity).
    pub fn frames(&self, frames: usize) -> &[i16] {
        let end = frames.min(self.capacity_frames) * self.channels;
        &self.samples[..end]
    }
}
