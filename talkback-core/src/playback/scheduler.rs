//! Gapless playback scheduling against the audio clock.
//!
//! ## Scheduling loop (per iteration)
//!
//! ```text
//! 1. While the next start time falls within the lookahead window:
//!    pop one frame, start = max(scheduled_clock, now), submit to the sink,
//!    scheduled_clock = start + frame.duration()
//! 2. Queue empty + stream incomplete → Draining; poll on a fixed interval
//! 3. Queue empty + stream complete  → Idle; the worker exits
//! 4. On a submit failure: push the frame back, ask the recovery controller,
//!    rebuild the output graph or halt terminally
//! ```
//!
//! The worker suspends only via `recv_timeout` on its command channel — a
//! timer that doubles as the wakeup path for `add_pcm16`/`stop`. The
//! `max(scheduled, now)` guard means a stalled consumer can never push a
//! start time into the past.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::buffering::chunk::FloatFrame;
use crate::error::{Result, TalkbackError};
use crate::events::{FaultEvent, FaultKind, PlaybackState};
use crate::playback::clock::AudioClock;
use crate::playback::queue::FrameSplitter;
use crate::playback::recovery::{RecoveryAction, RecoveryController};
use crate::playback::sink::OutputSink;

/// Fault channel capacity: plenty for a bounded retry budget.
const FAULT_CHANNEL_CAP: usize = 64;

/// Configuration for the playback direction.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Wire sample rate (Hz). The remote service emits 24 kHz.
    pub sample_rate: u32,
    /// Fixed frame size in samples. Default: 2400 (100 ms at 24 kHz).
    pub frame_samples: usize,
    /// Buffering delay before the first frame plays, absorbing delivery
    /// jitter. Default: 100 ms.
    pub initial_delay: Duration,
    /// How far ahead of the audio clock starts may be queued. Default: 200 ms.
    pub lookahead: Duration,
    /// Poll cadence while draining an empty queue. Default: 100 ms.
    pub poll_interval: Duration,
    /// Gain ramp length on `stop()`. Default: 30 ms.
    pub fade: Duration,
    /// Recovery attempts before the direction goes unstable. Default: 3.
    pub max_recovery_retries: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            frame_samples: 2_400,
            initial_delay: Duration::from_millis(100),
            lookahead: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            fade: Duration::from_millis(30),
            max_recovery_retries: 3,
        }
    }
}

enum Command {
    Wake,
    Stop,
}

/// State shared between the public handle and the scheduling worker.
struct Shared {
    queue: Mutex<VecDeque<FloatFrame>>,
    splitter: Mutex<FrameSplitter>,
    state: Mutex<PlaybackState>,
    complete: AtomicBool,
    /// Set by `stop()` before the queue is cleared; checked under the queue
    /// lock so no frame can be submitted after `stop()` returns.
    halted: AtomicBool,
}

impl Shared {
    fn set_state(&self, new_state: PlaybackState) {
        let mut state = self.state.lock();
        // Unstable is terminal for the session.
        if *state == PlaybackState::Unstable || *state == new_state {
            return;
        }
        debug!(from = ?*state, to = ?new_state, "playback state change");
        *state = new_state;
    }
}

struct WorkerHandle {
    cmd_tx: Sender<Command>,
    alive: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

type SinkFactory = Arc<dyn Fn() -> Result<Box<dyn OutputSink>> + Send + Sync>;

/// Ordered, gapless playback of incoming PCM16 chunks.
///
/// `PlaybackScheduler` is `Send + Sync`; wrap in `Arc` to share with the
/// transport collaborator feeding it.
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
    recovery: Arc<RecoveryController>,
    fault_tx: broadcast::Sender<FaultEvent>,
    fault_seq: Arc<AtomicU64>,
    sink_factory: SinkFactory,
}

impl PlaybackScheduler {
    /// Build a scheduler that plays through the default output device.
    #[cfg(feature = "audio-cpal")]
    pub fn new(config: PlaybackConfig, contexts: Arc<crate::host::ContextTable>) -> Self {
        let wire_rate = config.sample_rate;
        Self::with_sink_factory(config, move || {
            crate::playback::sink::CpalSink::open(wire_rate, Arc::clone(&contexts))
                .map(|sink| Box::new(sink) as Box<dyn OutputSink>)
        })
    }

    /// Build a scheduler over any sink factory. The factory runs on the
    /// worker's own thread, once per worker session, so the sink never has
    /// to be `Send`.
    pub fn with_sink_factory<F>(config: PlaybackConfig, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn OutputSink>> + Send + Sync + 'static,
    {
        let (fault_tx, _) = broadcast::channel(FAULT_CHANNEL_CAP);
        let fault_seq = Arc::new(AtomicU64::new(0));
        let recovery = Arc::new(RecoveryController::new(
            config.max_recovery_retries,
            fault_tx.clone(),
            Arc::clone(&fault_seq),
        ));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            splitter: Mutex::new(FrameSplitter::new(config.frame_samples, config.sample_rate)),
            state: Mutex::new(PlaybackState::Idle),
            complete: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        });

        Self {
            config,
            shared,
            worker: Mutex::new(None),
            recovery,
            fault_tx,
            fault_seq,
            sink_factory: Arc::new(factory),
        }
    }

    /// Feed a raw PCM16 chunk of any length. Frames are split at fixed
    /// boundaries independent of this call's size and appended in order.
    ///
    /// # Errors
    /// `TalkbackError::RecoveryExhausted` once the direction is unstable.
    pub fn add_pcm16(&self, bytes: &[u8]) -> Result<()> {
        if self.recovery.is_unstable() {
            return Err(TalkbackError::RecoveryExhausted {
                attempts: self.recovery.attempts(),
            });
        }

        let frames = self.shared.splitter.lock().push_pcm16(bytes);
        if !frames.is_empty() {
            self.shared.queue.lock().extend(frames);
            self.ensure_worker();
        }
        Ok(())
    }

    /// Mark the inbound stream complete: the carried remainder is queued as
    /// one short frame and, once the queue drains, polling stops.
    pub fn finish(&self) {
        self.shared.complete.store(true, Ordering::Release);
        if let Some(tail) = self.shared.splitter.lock().flush() {
            self.shared.queue.lock().push_back(tail);
        }
        self.ensure_worker();
    }

    /// Discard all queued audio and fade the output to silence.
    ///
    /// Idempotent and safe to call at any time; after this returns, no
    /// frame from an earlier `add_pcm16` will be scheduled.
    pub fn stop(&self) {
        {
            let mut queue = self.shared.queue.lock();
            self.shared.halted.store(true, Ordering::Release);
            let dropped = queue.len();
            queue.clear();
            if dropped > 0 {
                debug!(dropped, "stop discarded queued frames");
            }
        }
        self.shared.splitter.lock().clear();

        let mut slot = self.worker.lock();
        match slot.take() {
            Some(handle) if handle.alive.load(Ordering::Acquire) => {
                self.shared.set_state(PlaybackState::FadingOut);
                let _ = handle.cmd_tx.send(Command::Stop);
                *slot = Some(handle);
            }
            other => {
                *slot = other;
                self.shared.set_state(PlaybackState::Idle);
            }
        }
    }

    /// Clear the completion flag after a finished stream so new audio can
    /// play. The next first frame re-primes with the initial buffering
    /// delay at full gain.
    pub fn resume(&self) {
        self.shared.complete.store(false, Ordering::Release);
        let slot = self.worker.lock();
        if let Some(handle) = slot.as_ref() {
            if handle.alive.load(Ordering::Acquire) {
                let _ = handle.cmd_tx.send(Command::Wake);
            }
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> PlaybackState {
        if self.recovery.is_unstable() {
            return PlaybackState::Unstable;
        }
        *self.shared.state.lock()
    }

    /// Frames currently queued and not yet submitted.
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Subscribe to classified fault events (the single reporting channel).
    pub fn subscribe_faults(&self) -> broadcast::Receiver<FaultEvent> {
        self.fault_tx.subscribe()
    }

    /// Spawn the worker if none is running, or wake the live one.
    fn ensure_worker(&self) {
        let mut slot = self.worker.lock();

        if let Some(handle) = slot.as_ref() {
            let stale = !handle.alive.load(Ordering::Acquire)
                || self.shared.halted.load(Ordering::Acquire);
            if !stale {
                let _ = handle.cmd_tx.send(Command::Wake);
                return;
            }
        }

        // Reap a finished or halted worker before starting a new session.
        if let Some(mut old) = slot.take() {
            let _ = old.cmd_tx.send(Command::Stop);
            if let Some(join) = old.join.take() {
                let _ = join.join();
            }
        }
        self.shared.halted.store(false, Ordering::Release);

        let (cmd_tx, cmd_rx) = unbounded();
        let alive = Arc::new(AtomicBool::new(true));
        let worker_alive = Arc::clone(&alive);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let recovery = Arc::clone(&self.recovery);
        let factory = Arc::clone(&self.sink_factory);
        let fault_tx = self.fault_tx.clone();
        let fault_seq = Arc::clone(&self.fault_seq);

        let join = std::thread::Builder::new()
            .name("talkback-playback".into())
            .spawn(move || {
                match factory() {
                    Ok(sink) => run_worker(shared, config, sink, recovery, cmd_rx),
                    Err(e) => {
                        warn!("playback sink unavailable: {e}");
                        let seq = fault_seq.fetch_add(1, Ordering::Relaxed);
                        let _ = fault_tx.send(FaultEvent {
                            seq,
                            kind: FaultKind::Hardware,
                            detail: e.to_string(),
                        });
                    }
                }
                worker_alive.store(false, Ordering::Release);
            })
            .expect("spawn playback worker thread");

        *slot = Some(WorkerHandle {
            cmd_tx,
            alive,
            join: Some(join),
        });
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        let mut slot = self.worker.lock();
        if let Some(mut handle) = slot.take() {
            let _ = handle.cmd_tx.send(Command::Stop);
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
    }
}

/// Run the scheduling loop until stop or completion.
fn run_worker(
    shared: Arc<Shared>,
    config: PlaybackConfig,
    mut sink: Box<dyn OutputSink>,
    recovery: Arc<RecoveryController>,
    cmd_rx: Receiver<Command>,
) {
    let clock: Arc<dyn AudioClock> = sink.clock();
    let mut scheduled = clock.now() + config.initial_delay;
    info!("playback worker started");

    loop {
        let mut drained_complete = false;

        // ── Submit every frame whose start falls inside the lookahead ──
        loop {
            let now = clock.now();
            if scheduled > now + config.lookahead {
                break;
            }

            // Pop and submit under the queue lock: `stop()` clears the queue
            // under the same lock, so once it returns nothing more goes out.
            let mut queue = shared.queue.lock();
            if shared.halted.load(Ordering::Acquire) {
                break;
            }
            let Some(frame) = queue.pop_front() else {
                drop(queue);
                let splitter_empty = shared.splitter.lock().pending() == 0;
                if shared.complete.load(Ordering::Acquire) && splitter_empty {
                    drained_complete = true;
                }
                break;
            };

            let start = scheduled.max(now);
            match sink.begin(&frame, start) {
                Ok(()) => {
                    scheduled = start + frame.duration();
                    drop(queue);
                    shared.set_state(PlaybackState::Playing);
                }
                Err(e) => {
                    // The frame is never lost to a failure — recovery only
                    // rebuilds the path around it.
                    queue.push_front(frame);
                    drop(queue);

                    let mut action = recovery.on_failure(&e);
                    if action == RecoveryAction::Rebuild {
                        if let Err(rebuild_err) = sink.rebuild() {
                            action = recovery.on_failure(&rebuild_err);
                        } else {
                            scheduled = clock.now() + config.initial_delay;
                        }
                    }
                    if action == RecoveryAction::Halt {
                        shared.set_state(PlaybackState::Unstable);
                        info!("playback worker halted unstable");
                        return;
                    }
                    break;
                }
            }
        }

        if drained_complete {
            shared.set_state(PlaybackState::Idle);
            break;
        }

        if shared.queue.lock().is_empty() && *shared.state.lock() == PlaybackState::Playing {
            shared.set_state(PlaybackState::Draining);
        }

        // ── Suspend until the next start is due, new data arrives, or stop ──
        let wait = if shared.queue.lock().is_empty() {
            config.poll_interval
        } else {
            scheduled
                .saturating_sub(config.lookahead)
                .saturating_sub(clock.now())
                .clamp(Duration::from_millis(1), config.poll_interval)
        };

        match cmd_rx.recv_timeout(wait) {
            Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {
                // Belt-and-braces: a halt is honored even if the Stop
                // message raced the channel.
                if shared.halted.load(Ordering::Acquire) {
                    sink.halt(config.fade);
                    shared.set_state(PlaybackState::Idle);
                    break;
                }
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => {
                sink.halt(config.fade);
                shared.set_state(PlaybackState::Idle);
                break;
            }
        }
    }

    info!("playback worker stopped");
}
