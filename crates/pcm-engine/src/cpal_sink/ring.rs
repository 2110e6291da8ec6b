//! Bounded sample ring between the delivery loop and the CPAL output callback.
//!
//! Behaves like a PCM hardware ring:
//! - the loop writes whole frames without blocking and learns how many were accepted
//! - the callback consumes frames only while the ring is running, outputting silence otherwise
//! - running dry while running latches an xrun until the ring is reset, but only once a
//!   callback period has been served in full since the last start
//!
//! All state lives under one mutex; a single [`Condvar`] signals any change.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct HwRing {
    channels: usize,
    capacity_frames: usize,
    inner: Mutex<RingInner>,
    cv: Condvar,
}

#[derive(Default)]
struct RingInner {
    queue: VecDeque<i16>,
    running: bool,
    /// A callback was fully served since the last start. Until then a short period is
    /// startup fill, not an underrun.
    primed: bool,
    /// Set by `begin_drain`: running dry ends playback instead of underrunning.
    draining: bool,
    xrun: bool,
    closed: bool,
}

/// Result of a bounded wait on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingWait {
    Ready,
    TimedOut,
}

impl HwRing {
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            capacity_frames,
            inner: Mutex::new(RingInner {
                queue: VecDeque::with_capacity(capacity_frames.saturating_mul(channels)),
                ..RingInner::default()
            }),
            cv: Condvar::new(),
        }
    }

    // A panic in the audio callback must not wedge the loop thread.
    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn free_in(&self, g: &RingInner) -> usize {
        self.capacity_frames
            .saturating_sub(g.queue.len() / self.channels)
    }

    pub fn free_frames(&self) -> usize {
        let g = self.lock();
        self.free_in(&g)
    }

    pub fn queued_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn xrun(&self) -> bool {
        self.lock().xrun
    }

    pub fn set_running(&self, running: bool) {
        let mut g = self.lock();
        if running && !g.running {
            g.primed = false;
        }
        g.running = running;
        drop(g);
        self.cv.notify_all();
    }

    /// Queue as many whole frames of `samples` as fit. Returns frames accepted.
    pub fn push(&self, samples: &[i16]) -> usize {
        let mut g = self.lock();
        let frames = (samples.len() / self.channels).min(self.free_in(&g));
        g.queue
            .extend(samples[..frames * self.channels].iter().copied());
        drop(g);
        self.cv.notify_all();
        frames
    }

    /// Fill `out` from the ring for the output callback. Never blocks on the condvar.
    ///
    /// Returns frames taken. Anything not covered by queued audio is zeroed. A short period
    /// before the first full one since start keeps the ring running without an xrun.
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let mut g = self.lock();
        if !g.running {
            out.fill(0);
            return 0;
        }
        let take = (out.len().min(g.queue.len()) / self.channels) * self.channels;
        for (dst, src) in out.iter_mut().zip(g.queue.drain(..take)) {
            *dst = src;
        }
        out[take..].fill(0);
        if take == out.len() {
            g.primed = true;
        } else if g.draining {
            g.running = false;
        } else if g.primed {
            g.running = false;
            g.xrun = true;
        }
        drop(g);
        self.cv.notify_all();
        take / self.channels
    }

    /// Block until at least `min_frames` are free, an xrun is latched, or `timeout` passes.
    pub fn wait_vacant(&self, min_frames: usize, timeout: Duration) -> RingWait {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.xrun || g.closed || self.free_in(&g) >= min_frames {
                return RingWait::Ready;
            }
            let now = Instant::now();
            if now >= deadline {
                return RingWait::TimedOut;
            }
            let (next, _) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            g = next;
        }
    }

    /// Mark the ring as draining so the final partial period does not count as an underrun.
    pub fn begin_drain(&self) {
        self.lock().draining = true;
    }

    /// Block until queued audio has played out or playback stopped.
    pub fn wait_drained(&self, timeout: Duration) -> RingWait {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.queue.is_empty() || !g.running || g.closed {
                return RingWait::Ready;
            }
            let now = Instant::now();
            if now >= deadline {
                return RingWait::TimedOut;
            }
            let (next, _) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            g = next;
        }
    }

    /// Discard queued audio and clear running, draining and xrun state.
    pub fn reset(&self) {
        let mut g = self.lock();
        g.queue.clear();
        g.running = false;
        g.primed = false;
        g.draining = false;
        g.xrun = false;
        drop(g);
        self.cv.notify_all();
    }

    /// Wake every waiter for good.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        g.running = false;
        drop(g);
        self.cv.notify_all();
    }
}
