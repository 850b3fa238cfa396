use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use talkback_core::buffering::{create_capture_ring, Producer};
use talkback_core::capture::worker::{self, CaptureDiagnostics, CaptureWorkerContext};
use talkback_core::codec;
use talkback_core::playback::sink::{MemorySink, MemorySinkState, ScheduledFrame};
use talkback_core::{
    AudioClock, CaptureConfig, EncodedChunkEvent, ManualClock, OutputSink, PlaybackConfig,
    PlaybackScheduler, VolumeEvent,
};

fn recv_chunk_with_timeout(
    rx: &mut broadcast::Receiver<EncodedChunkEvent>,
    timeout: Duration,
) -> EncodedChunkEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for chunk event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("chunk channel closed unexpectedly"),
        }
    }
}

fn wait_for<F: Fn() -> bool>(pred: F, timeout: Duration) {
    let start = Instant::now();
    while !pred() {
        if start.elapsed() >= timeout {
            panic!("timed out waiting for condition");
        }
        thread::sleep(Duration::from_millis(2));
    }
}

fn scheduler_with_memory_sink(
    config: PlaybackConfig,
) -> (PlaybackScheduler, Arc<Mutex<MemorySinkState>>, ManualClock) {
    let clock = ManualClock::new();
    let state = Arc::new(Mutex::new(MemorySinkState::default()));
    let factory_state = Arc::clone(&state);
    let factory_clock = clock.clone();
    let scheduler = PlaybackScheduler::with_sink_factory(config, move || {
        Ok(Box::new(MemorySink::with_state(
            Arc::clone(&factory_state),
            factory_clock.clone(),
        )) as Box<dyn OutputSink>)
    });
    (scheduler, state, clock)
}

fn fast_config() -> PlaybackConfig {
    PlaybackConfig {
        poll_interval: Duration::from_millis(5),
        fade: Duration::from_millis(1),
        ..PlaybackConfig::default()
    }
}

#[test]
fn three_100ms_chunks_schedule_at_delay_then_100ms_steps() {
    let (scheduler, state, clock) = scheduler_with_memory_sink(fast_config());

    // 4800 bytes = 2400 samples = 100 ms at 24 kHz, three times over.
    let chunk = codec::float_to_pcm16(&vec![0.3f32; 2_400]);
    assert_eq!(chunk.len(), 4_800);
    for _ in 0..3 {
        scheduler.add_pcm16(&chunk).unwrap();
    }

    wait_for(|| state.lock().scheduled.len() >= 2, Duration::from_secs(1));
    clock.advance(Duration::from_millis(100));
    wait_for(|| state.lock().scheduled.len() >= 3, Duration::from_secs(1));

    let scheduled: Vec<ScheduledFrame> = state.lock().scheduled.clone();
    assert_eq!(scheduled.len(), 3);
    assert_eq!(scheduled[0].start, Duration::from_millis(100));
    assert_eq!(scheduled[1].start, Duration::from_millis(200));
    assert_eq!(scheduled[2].start, Duration::from_millis(300));
    assert!(scheduled.iter().all(|f| f.samples == 2_400));
    assert!(scheduled.iter().all(|f| f.sample_rate == 24_000));
}

#[test]
fn every_start_is_at_or_after_the_clock_even_under_stalls() {
    let mut config = fast_config();
    config.lookahead = Duration::from_secs(60);
    let (scheduler, state, clock) = scheduler_with_memory_sink(config);

    let chunk = codec::float_to_pcm16(&vec![0.2f32; 2_400]);
    let stalls = [
        Duration::ZERO,
        Duration::from_millis(350),
        Duration::from_secs(2),
        Duration::from_millis(7),
    ];
    let mut fed = 0;
    for stall in stalls {
        clock.advance(stall);
        scheduler.add_pcm16(&chunk).unwrap();
        fed += 1;
        let want = fed;
        wait_for(|| state.lock().scheduled.len() >= want, Duration::from_secs(1));
        let at_clock = clock.now();
        let latest = state.lock().scheduled.last().cloned().unwrap();
        assert!(
            latest.start >= at_clock,
            "start {:?} fell behind the clock {:?}",
            latest.start,
            at_clock
        );
    }
}

#[test]
fn capture_chunks_loop_back_into_scheduled_playback() {
    // Capture side: ring-fed worker at the 16 kHz wire rate.
    let (mut producer, consumer) = create_capture_ring();
    let samples: Vec<f32> = (0..4_000)
        .map(|i| ((i as f32 / 50.0).sin()) * 0.6)
        .collect();
    producer.push_slice(&samples);

    let running = Arc::new(AtomicBool::new(true));
    let (chunk_tx, mut chunk_rx) = broadcast::channel(64);
    let (volume_tx, mut volume_rx) = broadcast::channel::<VolumeEvent>(64);

    let diagnostics = Arc::new(CaptureDiagnostics::default());
    let ctx = CaptureWorkerContext {
        config: CaptureConfig::default(),
        consumer,
        running: Arc::clone(&running),
        chunk_tx,
        volume_tx,
        chunk_seq: Arc::new(AtomicU64::new(0)),
        volume_seq: Arc::new(AtomicU64::new(0)),
        device_sample_rate: 16_000,
        diagnostics: Arc::clone(&diagnostics),
    };
    let capture = thread::spawn(move || worker::run(ctx));

    // Let the worker drain everything, then stop so the 800-sample tail
    // flushes as a short chunk.
    wait_for(
        || diagnostics.snapshot().samples_in >= 4_000,
        Duration::from_secs(1),
    );
    running.store(false, Ordering::SeqCst);
    capture.join().expect("capture worker panicked");

    // Playback side: 16 kHz wire to mirror the loopback demo.
    let mut config = fast_config();
    config.sample_rate = 16_000;
    config.frame_samples = 1_600;
    config.lookahead = Duration::from_secs(60);
    let (scheduler, state, _clock) = scheduler_with_memory_sink(config);

    let mut forwarded = 0usize;
    while forwarded < 4_000 {
        let chunk = recv_chunk_with_timeout(&mut chunk_rx, Duration::from_secs(1));
        let bytes = BASE64.decode(&chunk.audio).expect("valid base64 payload");
        scheduler.add_pcm16(&bytes).unwrap();
        forwarded += chunk.samples;
    }
    scheduler.finish();

    wait_for(|| state.lock().scheduled.len() >= 3, Duration::from_secs(1));
    let scheduled = state.lock().scheduled.clone();
    assert_eq!(scheduled[0].samples, 1_600);
    assert_eq!(scheduled[1].samples, 1_600);
    assert_eq!(scheduled[2].samples, 800, "flushed capture tail");
    assert_eq!(
        scheduled[1].start - scheduled[0].start,
        Duration::from_millis(100),
        "gapless: consecutive starts are exactly one frame apart"
    );

    let volume = volume_rx.try_recv().expect("volume event");
    assert!(volume.level > 0.2, "sine at 0.6 amplitude meters well above 0.2");
}

#[test]
fn first_chunk_latency_under_500ms() {
    let (mut producer, consumer) = create_capture_ring();
    producer.push_slice(&vec![0.2f32; 1_600]);

    let running = Arc::new(AtomicBool::new(true));
    let (chunk_tx, mut chunk_rx) = broadcast::channel(16);
    let (volume_tx, _volume_rx) = broadcast::channel(16);

    let ctx = CaptureWorkerContext {
        config: CaptureConfig::default(),
        consumer,
        running: Arc::clone(&running),
        chunk_tx,
        volume_tx,
        chunk_seq: Arc::new(AtomicU64::new(0)),
        volume_seq: Arc::new(AtomicU64::new(0)),
        device_sample_rate: 16_000,
        diagnostics: Arc::new(CaptureDiagnostics::default()),
    };

    let start = Instant::now();
    let handle = thread::spawn(move || worker::run(ctx));

    let first = recv_chunk_with_timeout(&mut chunk_rx, Duration::from_secs(2));
    let elapsed = start.elapsed();

    running.store(false, Ordering::SeqCst);
    handle.join().expect("capture worker panicked");

    assert_eq!(first.samples, 1_600);
    assert!(
        elapsed < Duration::from_millis(500),
        "time to first chunk too high: {elapsed:?} (target < 500ms)"
    );
}

#[test]
fn capture_resampling_preserves_chunk_sizing() {
    // Device at 48 kHz, wire at 16 kHz: 9600 device samples ≈ 3200 wire
    // samples → two full chunks.
    let (mut producer, consumer) = create_capture_ring();
    producer.push_slice(&vec![0.3f32; 9_600]);

    let running = Arc::new(AtomicBool::new(true));
    let (chunk_tx, mut chunk_rx) = broadcast::channel(64);
    let (volume_tx, _volume_rx) = broadcast::channel(64);
    let diagnostics = Arc::new(CaptureDiagnostics::default());

    let ctx = CaptureWorkerContext {
        config: CaptureConfig::default(),
        consumer,
        running: Arc::clone(&running),
        chunk_tx,
        volume_tx,
        chunk_seq: Arc::new(AtomicU64::new(0)),
        volume_seq: Arc::new(AtomicU64::new(0)),
        device_sample_rate: 48_000,
        diagnostics: Arc::clone(&diagnostics),
    };
    let handle = thread::spawn(move || worker::run(ctx));

    let first = recv_chunk_with_timeout(&mut chunk_rx, Duration::from_secs(1));
    assert_eq!(first.samples, 1_600);
    assert_eq!(BASE64.decode(&first.audio).unwrap().len(), 3_200);

    wait_for(
        || diagnostics.snapshot().samples_in >= 9_600,
        Duration::from_secs(1),
    );
    running.store(false, Ordering::SeqCst);
    handle.join().expect("capture worker panicked");

    let mut total = first.samples;
    while let Ok(chunk) = chunk_rx.try_recv() {
        total += chunk.samples;
    }
    assert!(
        (3_000..=3_400).contains(&total),
        "expected ≈3200 wire samples, got {total}"
    );
}
