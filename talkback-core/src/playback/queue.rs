//! Byte-to-frame splitting, independent of caller chunk boundaries.
//!
//! Incoming PCM16 chunks arrive with arbitrary sizes and timing. The
//! splitter decodes them, accumulates samples in a carry buffer, and emits
//! fixed-size frames as they fill. The carry makes framing a function of the
//! total byte stream only: the same bytes delivered as one call or as many
//! small calls produce the identical frame sequence. A final remainder
//! shorter than one frame is flushed as a short frame when the stream ends —
//! never discarded.

use crate::buffering::chunk::FloatFrame;
use crate::codec;

pub struct FrameSplitter {
    frame_samples: usize,
    sample_rate: u32,
    carry: Vec<f32>,
}

impl FrameSplitter {
    pub fn new(frame_samples: usize, sample_rate: u32) -> Self {
        Self {
            frame_samples,
            sample_rate,
            carry: Vec::with_capacity(frame_samples),
        }
    }

    /// Decode a PCM16 byte chunk and return every full frame now available.
    pub fn push_pcm16(&mut self, bytes: &[u8]) -> Vec<FloatFrame> {
        self.carry.extend(codec::pcm16_to_float(bytes));

        let mut frames = Vec::with_capacity(self.carry.len() / self.frame_samples);
        while self.carry.len() >= self.frame_samples {
            let rest = self.carry.split_off(self.frame_samples);
            let full = std::mem::replace(&mut self.carry, rest);
            frames.push(FloatFrame::new(full, self.sample_rate));
        }
        frames
    }

    /// Flush the remainder as one short frame at stream end.
    pub fn flush(&mut self) -> Option<FloatFrame> {
        if self.carry.is_empty() {
            return None;
        }
        Some(FloatFrame::new(
            std::mem::take(&mut self.carry),
            self.sample_rate,
        ))
    }

    /// Discard any carried samples (explicit stop).
    pub fn clear(&mut self) {
        self.carry.clear();
    }

    /// Samples currently carried, awaiting a full frame or a flush.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::float_to_pcm16;

    fn splitter() -> FrameSplitter {
        FrameSplitter::new(2_400, 24_000)
    }

    #[test]
    fn exact_chunks_become_one_frame_each() {
        let mut sp = splitter();
        let bytes = float_to_pcm16(&vec![0.25; 2_400]);
        assert_eq!(bytes.len(), 4_800);

        for _ in 0..3 {
            let frames = sp.push_pcm16(&bytes);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].len(), 2_400);
        }
        assert_eq!(sp.pending(), 0);
    }

    #[test]
    fn framing_is_invariant_under_call_slicing() {
        let samples: Vec<f32> = (0..6_000).map(|i| (i as f32 / 6_000.0) - 0.5).collect();
        let bytes = float_to_pcm16(&samples);

        let mut whole = splitter();
        let mut frames_whole = whole.push_pcm16(&bytes);
        if let Some(tail) = whole.flush() {
            frames_whole.push(tail);
        }

        let mut sliced = splitter();
        let mut frames_sliced = Vec::new();
        for piece in bytes.chunks(700) {
            frames_sliced.extend(sliced.push_pcm16(piece));
        }
        if let Some(tail) = sliced.flush() {
            frames_sliced.push(tail);
        }

        assert_eq!(frames_whole, frames_sliced);
        assert_eq!(frames_whole.len(), 3);
        assert_eq!(frames_whole[2].len(), 1_200);
    }

    #[test]
    fn remainder_waits_in_carry_until_flush() {
        let mut sp = splitter();
        let frames = sp.push_pcm16(&float_to_pcm16(&vec![0.1; 1_000]));
        assert!(frames.is_empty());
        assert_eq!(sp.pending(), 1_000);

        let tail = sp.flush().expect("short frame");
        assert_eq!(tail.len(), 1_000);
        assert_eq!(sp.pending(), 0);
        assert!(sp.flush().is_none());
    }

    #[test]
    fn clear_discards_the_carry() {
        let mut sp = splitter();
        sp.push_pcm16(&float_to_pcm16(&vec![0.1; 500]));
        sp.clear();
        assert_eq!(sp.pending(), 0);
        assert!(sp.flush().is_none());
    }
}
