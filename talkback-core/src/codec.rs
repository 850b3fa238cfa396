//! Stateless conversion between normalized f32 samples and signed 16-bit PCM.
//!
//! Signed 16-bit has an asymmetric range (−32768..=32767), so negative
//! samples scale by 32768 and non-negative samples by 32767. Every input is
//! clamped to [−1.0, 1.0] before scaling; the functions never panic on
//! in-range input and allocate nothing beyond the output buffer.

/// Encode normalized f32 samples as little-endian signed 16-bit PCM bytes.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let scaled = if clamped < 0.0 {
            clamped * 32768.0
        } else {
            clamped * 32767.0
        };
        let quantized = scaled.round() as i16;
        out.extend_from_slice(&quantized.to_le_bytes());
    }
    out
}

/// Decode little-endian signed 16-bit PCM bytes to normalized f32 samples.
///
/// A trailing odd byte is ignored — a half sample cannot be decoded.
pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        let sample = if value < 0 {
            f32::from(value) / 32768.0
        } else {
            f32::from(value) / 32767.0
        };
        out.push(sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_trip_stays_within_quantization_error() {
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 / 500.0) - 1.0).collect();
        let decoded = pcm16_to_float(&float_to_pcm16(&samples));
        assert_eq!(decoded.len(), samples.len());
        for (orig, got) in samples.iter().zip(&decoded) {
            assert!(
                (orig - got).abs() <= 1.0 / 32768.0,
                "sample {orig} round-tripped to {got}"
            );
        }
    }

    #[test]
    fn extremes_hit_the_full_int16_range() {
        let bytes = float_to_pcm16(&[-1.0, 1.0, 0.0]);
        assert_eq!(bytes, [0x00, 0x80, 0xff, 0x7f, 0x00, 0x00]);
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        let bytes = float_to_pcm16(&[-3.5, 2.0]);
        assert_eq!(bytes, float_to_pcm16(&[-1.0, 1.0]));
    }

    #[test]
    fn negative_and_positive_scales_are_asymmetric() {
        let decoded = pcm16_to_float(&float_to_pcm16(&[-0.5, 0.5]));
        assert_abs_diff_eq!(decoded[0], -0.5, epsilon = 1.0 / 32768.0);
        assert_abs_diff_eq!(decoded[1], 0.5, epsilon = 1.0 / 32768.0);
    }

    #[test]
    fn trailing_odd_byte_is_dropped() {
        let decoded = pcm16_to_float(&[0x00, 0x40, 0x7f]);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(float_to_pcm16(&[]).is_empty());
        assert!(pcm16_to_float(&[]).is_empty());
    }
}
