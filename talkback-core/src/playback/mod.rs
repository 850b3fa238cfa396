//! Playback direction: gapless scheduling of incoming PCM16 chunks.
//!
//! ```text
//! add_pcm16(bytes) → FrameSplitter → VecDeque<FloatFrame>
//!                                         │
//!                               scheduling worker (timer-driven)
//!                                         │  start = max(scheduled, now)
//!                                   OutputSink::begin
//!                                         │
//!                          SPSC ring → output callback (RT)
//! ```
//!
//! The `RecoveryController` supervises every sink submission; the
//! `AudioClock`/`OutputSink` traits are the platform seams.

pub mod clock;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod sink;

pub use clock::{AudioClock, ManualClock, SampleClock};
pub use recovery::{RecoveryAction, RecoveryController};
pub use scheduler::{PlaybackConfig, PlaybackScheduler};
pub use sink::{MemorySink, MemorySinkState, OutputSink, ScheduledFrame};

#[cfg(feature = "audio-cpal")]
pub use sink::CpalSink;
