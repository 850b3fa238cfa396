//! Microphone acquisition.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a lock, or perform I/O. The callback
//! here only gates on an `AtomicBool` and writes into an SPSC ring producer
//! whose `push_slice` is wait-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Sessions are therefore created and dropped on the same blocking
//! thread; the bridge arranges this by invoking the opener inside
//! `spawn_blocking`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::buffering::CaptureProducer;
use crate::error::Result;

/// A live, exclusive hold on a microphone stream.
///
/// Dropping the session releases the hardware — teardown is `Drop`.
pub trait CaptureSession {
    /// Native sample rate the device delivers (Hz).
    fn sample_rate(&self) -> u32;
    /// Device name reported by the OS.
    fn device_name(&self) -> String;
}

/// Platform seam: acquires a microphone and wires its callback to `producer`.
///
/// Invoked on the capture blocking thread; the returned session never
/// crosses a thread boundary. Tests substitute scripted openers.
pub type SessionOpener =
    Box<dyn FnOnce(CaptureProducer, Arc<AtomicBool>) -> Result<Box<dyn CaptureSession>> + Send>;

#[cfg(feature = "audio-cpal")]
pub use cpal_stream::InputStream;

#[cfg(feature = "audio-cpal")]
mod cpal_stream {
    use super::*;

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, SampleRate, Stream, StreamConfig,
    };
    use ringbuf::traits::{Observer, Producer};
    use tracing::{error, info, warn};

    use crate::error::TalkbackError;

    /// Exclusive handle to a cpal input stream.
    ///
    /// **Not `Send`** — create and drop on the same OS thread.
    pub struct InputStream {
        /// Kept alive so the stream is not torn down prematurely.
        _stream: Stream,
        sample_rate: u32,
        device_name: String,
    }

    impl InputStream {
        /// Open an input device by preferred name, falling back to the
        /// default device and then the first available one.
        ///
        /// # Errors
        /// `TalkbackError::HardwareAccess` when no device exists, access is
        /// denied, or the stream cannot be built. No partial state is left
        /// behind on failure.
        pub fn open(
            mut producer: CaptureProducer,
            running: Arc<AtomicBool>,
            preferred: Option<&str>,
        ) -> Result<Box<dyn CaptureSession>> {
            let host = cpal::default_host();

            let mut selected = None;
            if let Some(name) = preferred {
                match host.input_devices() {
                    Ok(mut devices) => {
                        selected = devices
                            .find(|d| d.name().map(|n| n == name).unwrap_or(false));
                        if selected.is_none() {
                            warn!("preferred input device '{name}' not found, falling back");
                        }
                    }
                    Err(e) => warn!("device enumeration failed while resolving preference: {e}"),
                }
            }

            let device = if let Some(device) = selected {
                device
            } else if let Some(default) = host.default_input_device() {
                default
            } else {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| TalkbackError::HardwareAccess(e.to_string()))?;
                devices
                    .next()
                    .ok_or_else(|| TalkbackError::HardwareAccess("no input device".into()))?
            };

            let device_name = device.name().unwrap_or_else(|_| "Input Device".into());

            let supported = device
                .default_input_config()
                .map_err(|e| TalkbackError::HardwareAccess(e.to_string()))?;
            let sample_rate = supported.sample_rate().0;
            let channels = supported.channels();

            info!(
                device = device_name.as_str(),
                sample_rate, channels, "opening input device"
            );

            let config = StreamConfig {
                channels,
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let running_f32 = Arc::clone(&running);
            let running_i16 = Arc::clone(&running);

            let stream = match supported.sample_format() {
                SampleFormat::F32 => {
                    let ch = channels as usize;
                    let mut mix_buf: Vec<f32> = Vec::new();
                    device.build_input_stream(
                        &config,
                        move |data: &[f32], _info| {
                            if !running_f32.load(Ordering::Relaxed) {
                                return;
                            }
                            if ch == 1 {
                                push_all(&mut producer, data);
                                return;
                            }
                            let frames = data.len() / ch;
                            mix_buf.resize(frames, 0.0);
                            for (f, slot) in mix_buf.iter_mut().enumerate() {
                                let base = f * ch;
                                *slot = data[base..base + ch].iter().sum::<f32>() / ch as f32;
                            }
                            push_all(&mut producer, &mix_buf);
                        },
                        |err| error!("input stream error: {err}"),
                        None,
                    )
                }

                SampleFormat::I16 => {
                    let ch = channels as usize;
                    let mut mix_buf: Vec<f32> = Vec::new();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _info| {
                            if !running_i16.load(Ordering::Relaxed) {
                                return;
                            }
                            let frames = data.len() / ch;
                            mix_buf.resize(frames, 0.0);
                            for (f, slot) in mix_buf.iter_mut().enumerate() {
                                let base = f * ch;
                                let sum: f32 = data[base..base + ch]
                                    .iter()
                                    .map(|&s| f32::from(s) / 32768.0)
                                    .sum();
                                *slot = sum / ch as f32;
                            }
                            push_all(&mut producer, &mix_buf);
                        },
                        |err| error!("input stream error: {err}"),
                        None,
                    )
                }

                fmt => {
                    return Err(TalkbackError::HardwareAccess(format!(
                        "unsupported input sample format: {fmt:?}"
                    )))
                }
            }
            .map_err(|e| TalkbackError::HardwareAccess(e.to_string()))?;

            stream
                .play()
                .map_err(|e| TalkbackError::HardwareAccess(e.to_string()))?;

            Ok(Box::new(Self {
                _stream: stream,
                sample_rate,
                device_name,
            }))
        }
    }

    impl CaptureSession for InputStream {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn device_name(&self) -> String {
            self.device_name.clone()
        }
    }

    /// Wait-free ring write; a full ring drops samples rather than blocking
    /// the audio thread.
    fn push_all(producer: &mut CaptureProducer, samples: &[f32]) {
        let written = producer.push_slice(samples);
        if written < samples.len() {
            warn!(
                dropped = samples.len() - written,
                free = producer.vacant_len(),
                "capture ring full"
            );
        }
    }
}
