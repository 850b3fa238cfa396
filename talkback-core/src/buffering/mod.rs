//! Lock-free SPSC ring buffers bridging the real-time audio callbacks and
//! the control context.
//!
//! `ringbuf::HeapRb<f32>` gives wait-free `push_slice`/`pop_slice`, safe to
//! call from a real-time callback. One ring per direction: the capture
//! callback produces and the capture worker consumes; the playback worker
//! produces and the output callback consumes.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half of the capture ring — held by the input callback.
pub type CaptureProducer = ringbuf::HeapProd<f32>;
/// Consumer half of the capture ring — held by the capture worker.
pub type CaptureConsumer = ringbuf::HeapCons<f32>;

/// Producer half of the playback ring — held by the scheduling worker.
pub type PlaybackProducer = ringbuf::HeapProd<f32>;
/// Consumer half of the playback ring — held by the output callback.
pub type PlaybackConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^20 f32 samples ≈ 21.8 s at 48 kHz.
/// Covers control-thread stalls without the callback ever dropping samples.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 20;

/// Playback ring capacity: 2^18 f32 samples ≈ 5.5 s at 48 kHz device rate.
/// The scheduler only fills within its lookahead window, so the ring stays
/// mostly empty; the headroom absorbs bursty submission.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 18;

/// Create the producer/consumer pair for the capture direction.
pub fn create_capture_ring() -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split()
}

/// Create the producer/consumer pair for the playback direction.
pub fn create_playback_ring() -> (PlaybackProducer, PlaybackConsumer) {
    HeapRb::<f32>::new(PLAYBACK_RING_CAPACITY).split()
}
