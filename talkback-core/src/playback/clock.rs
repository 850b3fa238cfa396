//! Audio-clock abstraction.
//!
//! Scheduling decisions are made against the *audio* clock domain — time as
//! the output device consumes samples — not wall-clock time. The cpal sink
//! derives its clock from the callback's consumed-frame counter; tests drive
//! a manually advanced clock.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

/// Monotonic time source in the audio clock domain.
pub trait AudioClock: Send + Sync + 'static {
    /// Elapsed audio time since the clock's origin.
    fn now(&self) -> Duration;
}

/// Clock driven by a shared sample counter advanced by an output callback.
#[derive(Clone)]
pub struct SampleClock {
    consumed_frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl SampleClock {
    pub fn new(consumed_frames: Arc<AtomicU64>, sample_rate: u32) -> Self {
        Self {
            consumed_frames,
            sample_rate,
        }
    }
}

impl AudioClock for SampleClock {
    fn now(&self) -> Duration {
        let frames = self.consumed_frames.load(Ordering::Acquire);
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.micros
            .fetch_add(delta.as_micros() as u64, Ordering::Release);
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::Acquire))
    }
}
