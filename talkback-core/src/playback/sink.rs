//! Output sink abstraction and its implementations.
//!
//! `OutputSink` is the seam between scheduling decisions and the platform
//! audio API. The cpal sink maps "begin this frame at time T" onto a native
//! output callback fed by a lock-free SPSC ring: the callback owns nothing
//! but the ring consumer, a gain node, and a consumed-frame counter that
//! doubles as the audio clock.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send`, so a `CpalSink` must be created and dropped on
//! the scheduling worker's own thread. The scheduler accomplishes this by
//! taking a sink *factory* and invoking it inside the worker.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffering::chunk::FloatFrame;
use crate::error::Result;
use crate::playback::clock::{AudioClock, ManualClock};

/// Platform seam for scheduled audio output.
pub trait OutputSink: 'static {
    /// The audio clock this sink plays against.
    fn clock(&self) -> Arc<dyn AudioClock>;

    /// Queue `frame` for output beginning at `start` on the audio clock.
    ///
    /// # Errors
    /// A failure here is a `TransientPlayback` error; the recovery
    /// controller decides whether to rebuild.
    fn begin(&mut self, frame: &FloatFrame, start: Duration) -> Result<()>;

    /// Click-free stop: ramp gain to zero over `fade`, discard any queued
    /// device-side samples, then stand up a fresh gain stage at unity.
    fn halt(&mut self, fade: Duration);

    /// Discard and rebuild the output graph nodes after a failure, resuming
    /// the stream if it was suspended. The scheduler's frame queue is
    /// untouched.
    fn rebuild(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Gain node
// ---------------------------------------------------------------------------

/// Per-sample ramped gain, adjusted atomically from the control thread and
/// read lock-free from the output callback.
pub(crate) struct GainNode {
    current_bits: AtomicU32,
    target_bits: AtomicU32,
    step_bits: AtomicU32,
}

impl GainNode {
    pub(crate) fn new(initial: f32) -> Self {
        Self {
            current_bits: AtomicU32::new(initial.to_bits()),
            target_bits: AtomicU32::new(initial.to_bits()),
            step_bits: AtomicU32::new(0f32.to_bits()),
        }
    }

    /// Ramp toward `target` over `over` at `sample_rate`.
    pub(crate) fn ramp_to(&self, target: f32, over: Duration, sample_rate: u32) {
        let current = f32::from_bits(self.current_bits.load(Ordering::Acquire));
        let span = (target - current).abs();
        let steps = (over.as_secs_f32() * sample_rate as f32).max(1.0);
        self.step_bits.store((span / steps).to_bits(), Ordering::Release);
        self.target_bits.store(target.to_bits(), Ordering::Release);
    }

    /// Advance one sample and return the gain to apply. Lock-free.
    pub(crate) fn next(&self) -> f32 {
        let current = f32::from_bits(self.current_bits.load(Ordering::Relaxed));
        let target = f32::from_bits(self.target_bits.load(Ordering::Relaxed));
        if current == target {
            return current;
        }
        let step = f32::from_bits(self.step_bits.load(Ordering::Relaxed));
        let moved = if current < target {
            (current + step).min(target)
        } else {
            (current - step).max(target)
        };
        self.current_bits.store(moved.to_bits(), Ordering::Relaxed);
        moved
    }
}

// ---------------------------------------------------------------------------
// Memory sink (development + tests)
// ---------------------------------------------------------------------------

/// One frame accepted by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledFrame {
    pub samples: usize,
    pub sample_rate: u32,
    pub start: Duration,
}

/// Inspectable state shared between a [`MemorySink`] and the code driving it.
#[derive(Debug, Default)]
pub struct MemorySinkState {
    /// Every frame accepted, in submission order.
    pub scheduled: Vec<ScheduledFrame>,
    /// Fail the next N `begin` calls with a transient error.
    pub fail_next: usize,
    /// Make `rebuild` fail while non-zero.
    pub fail_rebuilds: usize,
    pub halts: u32,
    pub rebuilds: u32,
}

/// In-memory sink that records scheduling decisions instead of playing them.
///
/// Used by the test suite and headless development; the shared state handle
/// lets the driver script failures and assert on what was scheduled.
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
    clock: ManualClock,
}

impl MemorySink {
    pub fn new(clock: ManualClock) -> (Self, Arc<Mutex<MemorySinkState>>) {
        let state = Arc::new(Mutex::new(MemorySinkState::default()));
        (Self::with_state(Arc::clone(&state), clock), state)
    }

    /// Attach to existing shared state — lets a sink factory hand out fresh
    /// sinks that keep appending to the same record across worker sessions.
    pub fn with_state(state: Arc<Mutex<MemorySinkState>>, clock: ManualClock) -> Self {
        Self { state, clock }
    }
}

impl OutputSink for MemorySink {
    fn clock(&self) -> Arc<dyn AudioClock> {
        Arc::new(self.clock.clone())
    }

    fn begin(&mut self, frame: &FloatFrame, start: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(crate::error::TalkbackError::TransientPlayback(
                "scripted begin failure".into(),
            ));
        }
        state.scheduled.push(ScheduledFrame {
            samples: frame.len(),
            sample_rate: frame.sample_rate,
            start,
        });
        Ok(())
    }

    fn halt(&mut self, _fade: Duration) {
        self.state.lock().halts += 1;
    }

    fn rebuild(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_rebuilds > 0 {
            state.fail_rebuilds -= 1;
            return Err(crate::error::TalkbackError::TransientPlayback(
                "scripted rebuild failure".into(),
            ));
        }
        state.rebuilds += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cpal sink
// ---------------------------------------------------------------------------

#[cfg(feature = "audio-cpal")]
pub use cpal_sink::CpalSink;

#[cfg(feature = "audio-cpal")]
mod cpal_sink {
    use super::*;

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, Stream,
    };
    use ringbuf::traits::{Observer, Producer};
    use tracing::{debug, error, warn};

    use crate::buffering::{create_playback_ring, PlaybackProducer};
    use crate::error::TalkbackError;
    use crate::host::{ContextEntry, ContextTable, Direction};
    use crate::playback::clock::SampleClock;
    use crate::resample::RateConverter;

    /// Output sink backed by a cpal stream.
    ///
    /// **Not `Send`** — create and drop on the scheduling worker's thread.
    pub struct CpalSink {
        stream: Stream,
        producer: PlaybackProducer,
        gain: Arc<GainNode>,
        /// Device frames consumed by the callback — the audio clock source.
        consumed_frames: Arc<AtomicU64>,
        converter: RateConverter,
        wire_rate: u32,
        device_rate: u32,
        contexts: Arc<ContextTable>,
    }

    impl CpalSink {
        /// Open the default output device.
        ///
        /// # Errors
        /// `TalkbackError::HardwareAccess` when no output device exists or
        /// the stream cannot be built.
        pub fn open(wire_rate: u32, contexts: Arc<ContextTable>) -> Result<Self> {
            let consumed_frames = Arc::new(AtomicU64::new(0));
            let (stream, producer, gain, device_rate, device_name) =
                build_output(Arc::clone(&consumed_frames))?;
            let converter = RateConverter::new(wire_rate, device_rate, 480)?;

            contexts.register(
                Direction::Playback,
                ContextEntry {
                    device_name,
                    sample_rate: device_rate,
                },
            );

            Ok(Self {
                stream,
                producer,
                gain,
                consumed_frames,
                converter,
                wire_rate,
                device_rate,
                contexts,
            })
        }

        /// Replace ring, gain stage and stream; the consumed-frame counter is
        /// kept so the audio clock stays monotonic.
        fn rebuild_nodes(&mut self) -> Result<()> {
            let (stream, producer, gain, device_rate, device_name) =
                build_output(Arc::clone(&self.consumed_frames))?;
            let converter = RateConverter::new(self.wire_rate, device_rate, 480)?;
            self.stream = stream;
            self.producer = producer;
            self.gain = gain;
            self.device_rate = device_rate;
            self.converter = converter;
            self.contexts.register(
                Direction::Playback,
                ContextEntry {
                    device_name,
                    sample_rate: device_rate,
                },
            );
            Ok(())
        }

        /// Audio-clock time at which the next pushed sample will play.
        fn next_play_time(&self) -> Duration {
            let consumed = self.consumed_frames.load(Ordering::Acquire);
            let queued = self.producer.occupied_len() as u64;
            Duration::from_secs_f64((consumed + queued) as f64 / f64::from(self.device_rate))
        }
    }

    impl OutputSink for CpalSink {
        fn clock(&self) -> Arc<dyn AudioClock> {
            Arc::new(SampleClock::new(
                Arc::clone(&self.consumed_frames),
                self.device_rate,
            ))
        }

        fn begin(&mut self, frame: &FloatFrame, start: Duration) -> Result<()> {
            let converted = self.converter.process(&frame.samples);

            // Pad the gap between the end of queued audio and the requested
            // start so the frame begins on time rather than early.
            let gap = start.saturating_sub(self.next_play_time());
            let silence = (gap.as_secs_f64() * f64::from(self.device_rate)).round() as usize;
            if silence > 0 {
                let pushed = self.producer.push_iter(std::iter::repeat(0.0).take(silence));
                if pushed < silence {
                    return Err(TalkbackError::TransientPlayback(
                        "output ring full while padding".into(),
                    ));
                }
            }

            let pushed = self.producer.push_slice(&converted);
            if pushed < converted.len() {
                return Err(TalkbackError::TransientPlayback(format!(
                    "output ring full: {} of {} samples queued",
                    pushed,
                    converted.len()
                )));
            }
            Ok(())
        }

        fn halt(&mut self, fade: Duration) {
            self.gain.ramp_to(0.0, fade, self.device_rate);
            std::thread::sleep(fade);
            // Queued samples die with the old ring; the fresh graph comes up
            // at unity gain.
            if let Err(e) = self.rebuild_nodes() {
                warn!("output graph rebuild after halt failed: {e}");
            }
        }

        fn rebuild(&mut self) -> Result<()> {
            self.rebuild_nodes()?;
            self.stream
                .play()
                .map_err(|e| TalkbackError::TransientPlayback(e.to_string()))?;
            debug!("output graph rebuilt");
            Ok(())
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.contexts.release(Direction::Playback);
        }
    }

    type BuiltOutput = (Stream, PlaybackProducer, Arc<GainNode>, u32, String);

    fn build_output(consumed_frames: Arc<AtomicU64>) -> Result<BuiltOutput> {
        use ringbuf::traits::Consumer;

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| TalkbackError::HardwareAccess("no output device".into()))?;
        let device_name = device.name().unwrap_or_else(|_| "Output Device".into());

        let supported = device
            .default_output_config()
            .map_err(|e| TalkbackError::HardwareAccess(e.to_string()))?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let config = supported.config();

        debug!(
            device = device_name.as_str(),
            device_rate, channels, "opening output device"
        );

        let (producer, mut consumer) = create_playback_ring();
        let gain = Arc::new(GainNode::new(1.0));
        let cb_gain = Arc::clone(&gain);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    for out_frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or(0.0) * cb_gain.next();
                        for out in out_frame.iter_mut() {
                            *out = sample;
                        }
                        consumed_frames.fetch_add(1, Ordering::Release);
                    }
                },
                |err| error!("output stream error: {err}"),
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    for out_frame in data.chunks_mut(channels) {
                        let sample = consumer.try_pop().unwrap_or(0.0) * cb_gain.next();
                        let quantized = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                        for out in out_frame.iter_mut() {
                            *out = quantized;
                        }
                        consumed_frames.fetch_add(1, Ordering::Release);
                    }
                },
                |err| error!("output stream error: {err}"),
                None,
            ),
            fmt => {
                return Err(TalkbackError::HardwareAccess(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| TalkbackError::HardwareAccess(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TalkbackError::HardwareAccess(e.to_string()))?;

        Ok((stream, producer, gain, device_rate, device_name))
    }
}
