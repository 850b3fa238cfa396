//! `CaptureBridge` — microphone lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start()──► Starting ──device open──► Recording ──stop()──► Stopping ──► Idle
//!                      │                                                ▲
//!                      └── stop() during Starting: deferred until the   │
//!                          open settles, then exactly one teardown ─────┘
//! ```
//!
//! Concurrent `start()` calls never race the device: the first caller owns
//! the acquisition and every overlapping caller awaits the same settle
//! handle. `stop()` is idempotent in every state.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send`, so the session is opened *inside* the
//! `spawn_blocking` closure and dropped there after the worker loop exits.
//! A `watch` channel propagates open success/failure back to `start()`.

pub mod stream;
pub mod worker;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::buffering::create_capture_ring;
use crate::capture::stream::SessionOpener;
use crate::capture::worker::{CaptureDiagnostics, CaptureWorkerContext, DiagnosticsSnapshot};
use crate::error::{Result, TalkbackError};
use crate::events::{CaptureState, EncodedChunkEvent, VolumeEvent};
use crate::host::{ContextEntry, ContextTable, Direction};

/// Event channel capacity: 256 chunk events buffered for slow consumers.
const EVENT_CHANNEL_CAP: usize = 256;

/// Poll cadence while awaiting a state settled by another caller.
const SETTLE_POLL: Duration = Duration::from_millis(5);

/// Configuration for the capture direction.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Wire sample rate (Hz). The remote service expects 16 kHz.
    pub wire_sample_rate: u32,
    /// Fixed chunk size in samples. Default: 1600 (100 ms at 16 kHz).
    pub chunk_samples: usize,
    /// Input device to prefer by name; `None` uses the system default.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            wire_sample_rate: 16_000,
            chunk_samples: 1_600,
            preferred_device: None,
        }
    }
}

/// Outcome of an in-flight device acquisition, shared with joining callers.
#[derive(Debug, Clone, PartialEq)]
enum StartSettle {
    Pending,
    Started { sample_rate: u32 },
    Failed(String),
}

/// Owns the microphone and emits encoded chunk + volume events.
///
/// `CaptureBridge` is `Send + Sync`; wrap in `Arc` to share with the
/// transport collaborator.
pub struct CaptureBridge {
    config: CaptureConfig,
    state: Arc<Mutex<CaptureState>>,
    /// `true` while the session and worker should keep going.
    running: Arc<AtomicBool>,
    /// A stop arrived while Starting; applied right after the open settles.
    pending_stop: Arc<AtomicBool>,
    /// Settle handle of the in-flight acquisition, if any.
    settle: Mutex<Option<watch::Receiver<StartSettle>>>,
    chunk_tx: broadcast::Sender<EncodedChunkEvent>,
    volume_tx: broadcast::Sender<VolumeEvent>,
    chunk_seq: Arc<AtomicU64>,
    volume_seq: Arc<AtomicU64>,
    diagnostics: Arc<CaptureDiagnostics>,
    contexts: Arc<ContextTable>,
}

impl CaptureBridge {
    pub fn new(config: CaptureConfig, contexts: Arc<ContextTable>) -> Self {
        let (chunk_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let (volume_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);

        Self {
            config,
            state: Arc::new(Mutex::new(CaptureState::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            pending_stop: Arc::new(AtomicBool::new(false)),
            settle: Mutex::new(None),
            chunk_tx,
            volume_tx,
            chunk_seq: Arc::new(AtomicU64::new(0)),
            volume_seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(CaptureDiagnostics::default()),
            contexts,
        }
    }

    /// Acquire the microphone and begin emitting chunk/volume events.
    ///
    /// Resolves once the device is confirmed open (or has failed).
    /// Overlapping calls join the same acquisition; a call while already
    /// Recording returns immediately.
    ///
    /// # Errors
    /// `TalkbackError::HardwareAccess` on device denial or absence; the
    /// bridge is left Idle with no partial graph attached.
    #[cfg(feature = "audio-cpal")]
    pub async fn start(&self) -> Result<()> {
        let preferred = self.config.preferred_device.clone();
        self.start_with_opener(Box::new(move |producer, running| {
            stream::InputStream::open(producer, running, preferred.as_deref())
        }))
        .await
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub async fn start(&self) -> Result<()> {
        Err(TalkbackError::UnsupportedEnvironment(
            "compiled without the audio-cpal feature".into(),
        ))
    }

    /// `start()` over an explicit session opener — the platform seam used by
    /// tests and embedders with their own audio stack.
    pub async fn start_with_opener(&self, opener: SessionOpener) -> Result<()> {
        let mut opener = Some(opener);
        loop {
            enum Plan {
                Acquire(watch::Sender<StartSettle>, watch::Receiver<StartSettle>),
                Join(watch::Receiver<StartSettle>),
                Retry,
            }

            let plan = {
                let mut state = self.state.lock();
                match *state {
                    CaptureState::Recording => return Ok(()),
                    CaptureState::Starting => match self.settle.lock().clone() {
                        Some(rx) => Plan::Join(rx),
                        None => Plan::Retry,
                    },
                    CaptureState::Stopping => Plan::Retry,
                    CaptureState::Idle => {
                        // Install the settle handle before Starting becomes
                        // visible so joiners can never pick up a stale one.
                        let (settle_tx, settle_rx) = watch::channel(StartSettle::Pending);
                        *self.settle.lock() = Some(settle_rx.clone());
                        *state = CaptureState::Starting;
                        Plan::Acquire(settle_tx, settle_rx)
                    }
                }
            };

            match plan {
                Plan::Acquire(settle_tx, settle_rx) => {
                    let opener = opener.take().expect("opener consumed once");
                    return self.acquire(opener, settle_tx, settle_rx).await;
                }
                Plan::Join(rx) => return await_settle(rx).await,
                Plan::Retry => tokio::time::sleep(SETTLE_POLL).await,
            }
        }
    }

    /// Release the microphone and tear down the session.
    ///
    /// Idempotent; safe to call before a concurrent `start()` has resolved —
    /// the teardown is deferred until the acquisition settles, and exactly
    /// one acquisition/teardown pair ever happens.
    pub async fn stop(&self) {
        loop {
            enum Plan {
                Done,
                AwaitSettle(watch::Receiver<StartSettle>),
                AwaitIdle,
                Retry,
            }

            let plan = {
                let mut state = self.state.lock();
                match *state {
                    CaptureState::Idle => Plan::Done,
                    CaptureState::Stopping => Plan::AwaitIdle,
                    CaptureState::Starting => {
                        self.pending_stop.store(true, Ordering::Release);
                        match self.settle.lock().clone() {
                            Some(rx) => Plan::AwaitSettle(rx),
                            None => Plan::Retry,
                        }
                    }
                    CaptureState::Recording => {
                        *state = CaptureState::Stopping;
                        // A deferred stop that lost the race to Recording is
                        // handled right here; drop the stale flag.
                        self.pending_stop.store(false, Ordering::Release);
                        self.running.store(false, Ordering::Release);
                        Plan::AwaitIdle
                    }
                }
            };

            match plan {
                Plan::Done => return,
                Plan::AwaitIdle => {
                    self.await_idle().await;
                    return;
                }
                Plan::AwaitSettle(rx) => {
                    let _ = await_settle(rx).await;
                    // Re-examine: the blocking task either consumed the
                    // deferred stop or reached Recording first.
                    tokio::time::sleep(SETTLE_POLL).await;
                }
                Plan::Retry => tokio::time::sleep(SETTLE_POLL).await,
            }
        }
    }

    /// Current lifecycle state snapshot.
    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    /// Subscribe to encoded capture chunks.
    pub fn subscribe_chunks(&self) -> broadcast::Receiver<EncodedChunkEvent> {
        self.chunk_tx.subscribe()
    }

    /// Subscribe to block-cadence volume levels.
    pub fn subscribe_volume(&self) -> broadcast::Receiver<VolumeEvent> {
        self.volume_tx.subscribe()
    }

    /// Snapshot of worker counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Own the acquisition: open the device on a blocking thread, settle the
    /// watch channel, then run the worker there until stop.
    async fn acquire(
        &self,
        opener: SessionOpener,
        settle_tx: watch::Sender<StartSettle>,
        settle_rx: watch::Receiver<StartSettle>,
    ) -> Result<()> {
        self.diagnostics.reset();
        self.running.store(true, Ordering::Release);

        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let pending_stop = Arc::clone(&self.pending_stop);
        let chunk_tx = self.chunk_tx.clone();
        let volume_tx = self.volume_tx.clone();
        let chunk_seq = Arc::clone(&self.chunk_seq);
        let volume_seq = Arc::clone(&self.volume_seq);
        let diagnostics = Arc::clone(&self.diagnostics);
        let contexts = Arc::clone(&self.contexts);

        tokio::task::spawn_blocking(move || {
            let (producer, consumer) = create_capture_ring();

            // Device open happens on THIS thread — the session is !Send.
            let session = match opener(producer, Arc::clone(&running)) {
                Ok(session) => session,
                Err(e) => {
                    running.store(false, Ordering::Release);
                    pending_stop.store(false, Ordering::Release);
                    *state.lock() = CaptureState::Idle;
                    let _ = settle_tx.send(StartSettle::Failed(e.to_string()));
                    return;
                }
            };

            let sample_rate = session.sample_rate();
            contexts.register(
                Direction::Capture,
                ContextEntry {
                    device_name: session.device_name(),
                    sample_rate,
                },
            );
            let _ = settle_tx.send(StartSettle::Started { sample_rate });

            // A stop landed while we were acquiring: tear down right here,
            // without ever entering Recording.
            if pending_stop.swap(false, Ordering::AcqRel) {
                info!("deferred stop applied after acquisition settled");
                running.store(false, Ordering::Release);
                drop(session);
                contexts.release(Direction::Capture);
                *state.lock() = CaptureState::Idle;
                return;
            }

            *state.lock() = CaptureState::Recording;
            info!(sample_rate, "capture session recording");

            worker::run(CaptureWorkerContext {
                config,
                consumer,
                running,
                chunk_tx,
                volume_tx,
                chunk_seq,
                volume_seq,
                device_sample_rate: sample_rate,
                diagnostics,
            });

            // Session drops here, releasing the device on this thread.
            drop(session);
            contexts.release(Direction::Capture);
            *state.lock() = CaptureState::Idle;
            info!("capture session torn down");
        });

        await_settle(settle_rx).await
    }

    async fn await_idle(&self) {
        while *self.state.lock() != CaptureState::Idle {
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }
}

/// Await the acquisition outcome carried on the settle handle.
async fn await_settle(mut rx: watch::Receiver<StartSettle>) -> Result<()> {
    loop {
        let settled = rx.borrow_and_update().clone();
        match settled {
            StartSettle::Pending => {
                if rx.changed().await.is_err() {
                    return Err(TalkbackError::HardwareAccess(
                        "capture task died before settling".into(),
                    ));
                }
            }
            StartSettle::Started { .. } => return Ok(()),
            StartSettle::Failed(detail) => return Err(TalkbackError::HardwareAccess(detail)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use crate::buffering::{CaptureProducer, Producer};
    use crate::capture::stream::CaptureSession;

    /// Scripted session counting teardowns through `Drop`.
    struct ScriptedSession {
        teardowns: Arc<AtomicUsize>,
        sample_rate: u32,
    }

    impl CaptureSession for ScriptedSession {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn device_name(&self) -> String {
            "Scripted Mic".into()
        }
    }

    impl Drop for ScriptedSession {
        fn drop(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct OpenerScript {
        acquisitions: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
        open_delay: Duration,
        fail: bool,
        feed: Option<Vec<f32>>,
    }

    impl OpenerScript {
        fn opener(self) -> SessionOpener {
            Box::new(move |mut producer: CaptureProducer, _running| {
                std::thread::sleep(self.open_delay);
                if self.fail {
                    return Err(TalkbackError::HardwareAccess("permission denied".into()));
                }
                self.acquisitions.fetch_add(1, Ordering::SeqCst);
                if let Some(samples) = self.feed {
                    producer.push_slice(&samples);
                }
                Ok(Box::new(ScriptedSession {
                    teardowns: self.teardowns,
                    sample_rate: 16_000,
                }) as Box<dyn CaptureSession>)
            })
        }
    }

    fn bridge() -> Arc<CaptureBridge> {
        Arc::new(CaptureBridge::new(
            CaptureConfig::default(),
            Arc::new(ContextTable::default()),
        ))
    }

    async fn wait_for<F: Fn() -> bool>(pred: F, timeout: Duration) {
        let start = Instant::now();
        while !pred() {
            if start.elapsed() >= timeout {
                panic!("timed out waiting for condition");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_emits_chunks_then_stop_returns_to_idle() {
        let bridge = bridge();
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let mut chunks = bridge.subscribe_chunks();
        let mut volume = bridge.subscribe_volume();

        let script = OpenerScript {
            acquisitions: Arc::clone(&acquisitions),
            teardowns: Arc::clone(&teardowns),
            open_delay: Duration::ZERO,
            fail: false,
            feed: Some(vec![0.4f32; 1_600]),
        };
        bridge.start_with_opener(script.opener()).await.unwrap();
        assert_eq!(bridge.state(), CaptureState::Recording);

        let chunk = chunks.recv().await.expect("chunk event");
        assert_eq!(chunk.samples, 1_600);
        let level = volume.recv().await.expect("volume event");
        assert!((level.level - 0.4).abs() < 1e-3);

        bridge.stop().await;
        assert_eq!(bridge.state(), CaptureState::Idle);
        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        // Repeated stop is a no-op.
        bridge.stop().await;
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_before_start_settles_yields_one_acquisition_one_teardown() {
        let bridge = bridge();
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        let script = OpenerScript {
            acquisitions: Arc::clone(&acquisitions),
            teardowns: Arc::clone(&teardowns),
            open_delay: Duration::from_millis(50),
            fail: false,
            feed: None,
        };

        let starter = {
            let bridge = Arc::clone(&bridge);
            let opener = script.opener();
            tokio::spawn(async move { bridge.start_with_opener(opener).await })
        };

        // Let the acquisition get in flight, then stop before it settles.
        wait_for(
            || bridge.state() == CaptureState::Starting,
            Duration::from_secs(1),
        )
        .await;
        bridge.stop().await;

        starter.await.unwrap().unwrap();
        wait_for(
            || bridge.state() == CaptureState::Idle,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_starts_share_one_acquisition() {
        let bridge = bridge();
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        let script = OpenerScript {
            acquisitions: Arc::clone(&acquisitions),
            teardowns: Arc::clone(&teardowns),
            open_delay: Duration::from_millis(30),
            fail: false,
            feed: None,
        };

        let first = {
            let bridge = Arc::clone(&bridge);
            let opener = script.opener();
            tokio::spawn(async move { bridge.start_with_opener(opener).await })
        };
        wait_for(
            || bridge.state() == CaptureState::Starting,
            Duration::from_secs(1),
        )
        .await;

        // The joiner's opener must never run.
        let unused = OpenerScript {
            acquisitions: Arc::clone(&acquisitions),
            teardowns: Arc::clone(&teardowns),
            open_delay: Duration::ZERO,
            fail: true,
            feed: None,
        };
        let second = {
            let bridge = Arc::clone(&bridge);
            let opener = unused.opener();
            tokio::spawn(async move { bridge.start_with_opener(opener).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);

        bridge.stop().await;
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn denied_device_fails_start_and_leaves_no_graph() {
        let contexts = Arc::new(ContextTable::default());
        let bridge = Arc::new(CaptureBridge::new(
            CaptureConfig::default(),
            Arc::clone(&contexts),
        ));
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        let script = OpenerScript {
            acquisitions,
            teardowns,
            open_delay: Duration::ZERO,
            fail: true,
            feed: None,
        };

        let err = bridge.start_with_opener(script.opener()).await.unwrap_err();
        assert!(matches!(err, TalkbackError::HardwareAccess(_)));
        assert_eq!(bridge.state(), CaptureState::Idle);
        assert!(
            contexts.entry(Direction::Capture).is_none(),
            "no stream handle may remain attached"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_after_stop_runs_a_fresh_session() {
        let bridge = bridge();
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2usize {
            let script = OpenerScript {
                acquisitions: Arc::clone(&acquisitions),
                teardowns: Arc::clone(&teardowns),
                open_delay: Duration::ZERO,
                fail: false,
                feed: None,
            };
            bridge.start_with_opener(script.opener()).await.unwrap();
            bridge.stop().await;
            assert_eq!(acquisitions.load(Ordering::SeqCst), expected);
            assert_eq!(teardowns.load(Ordering::SeqCst), expected);
        }
    }
}
