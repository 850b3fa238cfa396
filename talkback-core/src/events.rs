//! Typed events carried on per-kind broadcast channels.
//!
//! Each event kind gets its own `tokio::sync::broadcast` channel with a
//! `subscribe_*` accessor on the owning component; dropping the receiver is
//! the unsubscribe. There is no string-keyed dispatch anywhere.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` with camelCase
//! field names so the transport collaborator can forward them verbatim.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capture events
// ---------------------------------------------------------------------------

/// One fixed-size encoded capture chunk, ready for network transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunkEvent {
    /// Monotonically increasing per-session sequence number.
    pub seq: u64,
    /// Base64-encoded PCM16 mono little-endian audio at 16 kHz.
    pub audio: String,
    /// Number of samples encoded in `audio`.
    pub samples: usize,
}

/// Per-block capture level, emitted on the same cadence as `EncodedChunkEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEvent {
    /// Monotonically increasing per-session sequence number.
    pub seq: u64,
    /// RMS amplitude of the block, normalized to [0.0, 1.0].
    pub level: f32,
}

// ---------------------------------------------------------------------------
// Fault reporting
// ---------------------------------------------------------------------------

/// Classified runtime fault, funneled through a single reporting channel.
///
/// The core never renders UI and never retries indefinitely — the surrounding
/// application decides user-visible behavior from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultEvent {
    pub seq: u64,
    pub kind: FaultKind,
    /// Human-readable detail (e.g. the underlying device error).
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    /// A recoverable playback failure; a rebuild attempt follows.
    Transient,
    /// A device-level failure reported outside `start()`.
    Hardware,
    /// The retry budget is spent. Emitted exactly once; terminal.
    Exhausted,
}

// ---------------------------------------------------------------------------
// Component states
// ---------------------------------------------------------------------------

/// Lifecycle state of the capture bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    /// No session. `start()` may be called.
    Idle,
    /// Device acquisition in flight; concurrent starts join it.
    Starting,
    /// Capturing and emitting chunk/volume events.
    Recording,
    /// Teardown in flight.
    Stopping,
}

/// Lifecycle state of the playback scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Nothing queued, nothing scheduled.
    Idle,
    /// Frames are being scheduled against the audio clock.
    Playing,
    /// Queue empty but the stream is not complete; polling for arrivals.
    Draining,
    /// `stop()` fade in progress.
    FadingOut,
    /// Recovery exhausted. Terminal for this session.
    Unstable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_chunk_event_uses_camel_case() {
        let event = EncodedChunkEvent {
            seq: 3,
            audio: "AAAA".into(),
            samples: 1600,
        };
        let json = serde_json::to_value(&event).expect("serialize chunk event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["audio"], "AAAA");
        assert_eq!(json["samples"], 1600);

        let round_trip: EncodedChunkEvent =
            serde_json::from_value(json).expect("deserialize chunk event");
        assert_eq!(round_trip.samples, 1600);
    }

    #[test]
    fn volume_event_level_round_trips() {
        let event = VolumeEvent { seq: 9, level: 0.42 };
        let json = serde_json::to_value(&event).expect("serialize volume event");
        let level = json["level"].as_f64().expect("level should be a number");
        assert!((level - 0.42).abs() < 1e-5);
    }

    #[test]
    fn fault_kind_serializes_lowercase() {
        let event = FaultEvent {
            seq: 0,
            kind: FaultKind::Exhausted,
            detail: "budget spent".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize fault event");
        assert_eq!(json["kind"], "exhausted");
    }

    #[test]
    fn states_reject_non_lowercase_values() {
        assert!(serde_json::from_str::<CaptureState>(r#""Recording""#).is_err());
        assert!(serde_json::from_str::<PlaybackState>(r#""draining""#).is_ok());
    }
}
