//! Capture control worker.
//!
//! ## Worker stages (per iteration)
//!
//! ```text
//! 1. Drain the capture ring (one block per iteration)
//! 2. Resample device rate → 16 kHz wire rate
//! 3. Accumulate until one fixed chunk (1600 samples ≈ 100 ms) fills
//! 4. Transcode the chunk: f32 → PCM16 → base64 → EncodedChunkEvent
//! 5. Meter the same chunk: RMS → VolumeEvent, same cadence
//! ```
//!
//! The whole loop runs on a blocking thread; the real-time callback only
//! ever touches the ring producer. On stop, a partially filled chunk is
//! flushed as one final short event rather than discarded.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::buffering::{CaptureConsumer, Consumer};
use crate::capture::CaptureConfig;
use crate::codec;
use crate::events::{EncodedChunkEvent, VolumeEvent};
use crate::meter;
use crate::resample::RateConverter;

/// Samples drained from the ring per iteration: 20 ms at 48 kHz.
const DRAIN_BLOCK: usize = 960;

/// Sleep when the ring is empty, keeping the loop off a busy-wait.
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

pub struct CaptureDiagnostics {
    pub samples_in: AtomicUsize,
    pub samples_resampled: AtomicUsize,
    pub chunks_emitted: AtomicUsize,
    pub partial_flushes: AtomicUsize,
}

impl Default for CaptureDiagnostics {
    fn default() -> Self {
        Self {
            samples_in: AtomicUsize::new(0),
            samples_resampled: AtomicUsize::new(0),
            chunks_emitted: AtomicUsize::new(0),
            partial_flushes: AtomicUsize::new(0),
        }
    }
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.samples_resampled.store(0, Ordering::Relaxed);
        self.chunks_emitted.store(0, Ordering::Relaxed);
        self.partial_flushes.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_resampled: self.samples_resampled.load(Ordering::Relaxed),
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            partial_flushes: self.partial_flushes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub samples_resampled: usize,
    pub chunks_emitted: usize,
    pub partial_flushes: usize,
}

/// Everything the worker needs, passed as one struct.
pub struct CaptureWorkerContext {
    pub config: CaptureConfig,
    pub consumer: CaptureConsumer,
    pub running: Arc<AtomicBool>,
    pub chunk_tx: broadcast::Sender<EncodedChunkEvent>,
    pub volume_tx: broadcast::Sender<VolumeEvent>,
    pub chunk_seq: Arc<AtomicU64>,
    pub volume_seq: Arc<AtomicU64>,
    pub device_sample_rate: u32,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

/// Run the capture loop until `ctx.running` becomes false.
pub fn run(mut ctx: CaptureWorkerContext) {
    info!("capture worker started");

    let mut converter = match RateConverter::new(
        ctx.device_sample_rate,
        ctx.config.wire_sample_rate,
        DRAIN_BLOCK,
    ) {
        Ok(rc) => rc,
        Err(e) => {
            error!("failed to create capture rate converter: {e}");
            return;
        }
    };

    if !converter.is_passthrough() {
        info!(
            device_rate = ctx.device_sample_rate,
            wire_rate = ctx.config.wire_sample_rate,
            "capture resampling enabled"
        );
    }

    // Scratch drained from the ring, reused every iteration.
    let mut raw = vec![0f32; DRAIN_BLOCK];
    // Samples accumulating toward one fixed chunk.
    let mut batch: Vec<f32> = Vec::with_capacity(ctx.config.chunk_samples);

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let drained = ctx.consumer.pop_slice(&mut raw);
        if drained == 0 {
            std::thread::sleep(std::time::Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        ctx.diagnostics
            .samples_in
            .fetch_add(drained, Ordering::Relaxed);

        let converted = converter.process(&raw[..drained]);
        if converted.is_empty() {
            // Partial resampler block — more input needed.
            continue;
        }
        ctx.diagnostics
            .samples_resampled
            .fetch_add(converted.len(), Ordering::Relaxed);

        batch.extend_from_slice(&converted);
        while batch.len() >= ctx.config.chunk_samples {
            let rest = batch.split_off(ctx.config.chunk_samples);
            let block = std::mem::replace(&mut batch, rest);
            emit_block(&ctx, &block);
        }
    }

    // Stop requested mid-chunk: the tail still goes out, as a short chunk.
    if !batch.is_empty() {
        debug!(samples = batch.len(), "flushing partial chunk on stop");
        emit_block(&ctx, &batch);
        ctx.diagnostics
            .partial_flushes
            .fetch_add(1, Ordering::Relaxed);
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_in = snap.samples_in,
        samples_resampled = snap.samples_resampled,
        chunks_emitted = snap.chunks_emitted,
        partial_flushes = snap.partial_flushes,
        "capture worker stopped — diagnostics"
    );
}

/// Transcode and meter one block; both events share the block cadence.
fn emit_block(ctx: &CaptureWorkerContext, block: &[f32]) {
    let pcm = codec::float_to_pcm16(block);
    let seq = ctx.chunk_seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.chunk_tx.send(EncodedChunkEvent {
        seq,
        audio: BASE64.encode(&pcm),
        samples: block.len(),
    });

    let volume_seq = ctx.volume_seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.volume_tx.send(VolumeEvent {
        seq: volume_seq,
        level: meter::normalized_level(block),
    });

    ctx.diagnostics
        .chunks_emitted
        .fetch_add(1, Ordering::Relaxed);
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("TALKBACK_CAPTURE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}
