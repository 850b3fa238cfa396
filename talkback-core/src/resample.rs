//! Sample-rate conversion between device rates and the wire rates.
//!
//! The wire contract is fixed — 16 kHz up, 24 kHz down — but audio devices
//! run at whatever rate the OS hands out (commonly 44.1 or 48 kHz). A
//! `RateConverter` sits on the control thread of each direction: capture
//! converts device rate → 16 kHz before transcoding, playback converts
//! 24 kHz → device rate before the samples enter the output ring.
//!
//! When the two rates already match the converter is a passthrough and no
//! rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{Result, TalkbackError};

/// Converts mono f32 audio between two fixed sample rates.
pub struct RateConverter {
    /// `None` when input rate == output rate.
    inner: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls; rubato consumes whole blocks.
    pending: Vec<f32>,
    /// Input samples rubato consumes per process call.
    block: usize,
    /// Pre-allocated `[1][output_frames_max]` output buffer.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Build a converter from `from_hz` to `to_hz` consuming `block` input
    /// samples per internal step.
    pub fn new(from_hz: u32, to_hz: u32, block: usize) -> Result<Self> {
        if from_hz == to_hz {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                block,
                scratch: Vec::new(),
            });
        }

        let inner = FastFixedIn::<f32>::new(
            f64::from(to_hz) / f64::from(from_hz),
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| TalkbackError::TransientPlayback(format!("resampler init: {e}")))?;

        let scratch = vec![vec![0f32; inner.output_frames_max()]; 1];

        tracing::debug!(from_hz, to_hz, block, "rate conversion enabled");

        Ok(Self {
            inner: Some(inner),
            pending: Vec::new(),
            block,
            scratch,
        })
    }

    /// Feed input samples, returning whatever converted output is ready.
    ///
    /// Input accumulates internally until a whole block is available; a
    /// partial block is carried to the next call. Passthrough mode returns
    /// the input unchanged.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut inner) = self.inner else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        while self.pending.len() >= self.block {
            let input = &self.pending[..self.block];
            match inner.process_into_buffer(&[input], &mut self.scratch, None) {
                Ok((_consumed, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => tracing::error!("resampler step failed: {e}"),
            }
            self.pending.drain(..self.block);
        }
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}
