//! Block-cadence RMS volume metering.
//!
//! A read-only observability signal running in parallel with the capture
//! transcoder off the same sample source. Computed on the control thread,
//! once per emitted chunk; it never blocks or throttles capture.

/// Root-mean-square amplitude of a sample block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// RMS level normalized to [0.0, 1.0].
///
/// In-range input already yields RMS ≤ 1.0; the clamp guards against
/// denormalized or out-of-range samples arriving from a misbehaving device.
pub fn normalized_level(samples: &[f32]) -> f32 {
    rms(samples).clamp(0.0, 1.0)
}
