//! Typed frame of decoded audio passed between pipeline stages.

use std::time::Duration;

/// A contiguous block of mono f32 samples at a known sample rate.
///
/// Owned exclusively by whichever stage is currently processing it;
/// allocated on the control thread, never inside a real-time callback.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatFrame {
    /// Mono samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16 000 on the capture wire, 24 000 on playback).
    pub sample_rate: u32,
}

impl FloatFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback duration of this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
