//! # talkback-core
//!
//! Real-time bidirectional PCM audio pipeline SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → input callback → SPSC ring → capture worker(spawn_blocking)
//!                                                  │
//!                                  transcode 1600-sample chunks → base64
//!                                                  │
//!                        broadcast: EncodedChunkEvent + VolumeEvent
//!
//! Transport → add_pcm16 → FrameSplitter → queue → scheduling worker
//!                                                  │  start = max(sched, now)
//!                                       OutputSink → SPSC ring → output callback
//!                                                  │
//!                                 RecoveryController (bounded retry budget)
//! ```
//!
//! Both real-time callbacks are zero-alloc and lock-free; all heap work
//! happens on the control threads. Capture runs the wire at 16 kHz, playback
//! at 24 kHz — fixed by the remote service's contract.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod capture;
pub mod codec;
pub mod error;
pub mod events;
pub mod host;
pub mod meter;
pub mod playback;
pub mod resample;

// Convenience re-exports for downstream crates
pub use buffering::chunk::FloatFrame;
pub use capture::{CaptureBridge, CaptureConfig};
pub use error::TalkbackError;
pub use events::{
    CaptureState, EncodedChunkEvent, FaultEvent, FaultKind, PlaybackState, VolumeEvent,
};
pub use host::{ContextTable, Direction};
pub use playback::{
    AudioClock, ManualClock, MemorySink, OutputSink, PlaybackConfig, PlaybackScheduler,
};
