//! Bounded-retry supervision of the playback path.
//!
//! Every scheduling or buffer-start failure lands here. Within the budget
//! the verdict is Rebuild: the worker discards and rebuilds the output
//! graph nodes and re-arms scheduling with the queue intact. Once the
//! budget is spent the controller emits exactly one exhausted fault,
//! becomes terminally unstable, and every later failure is answered with
//! Halt and no further emission.
//!
//! The budget is per-session and never replenished, even after an arbitrary
//! stretch of stable playback.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};

use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::error::TalkbackError;
use crate::events::{FaultEvent, FaultKind};

/// What the scheduling worker should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Rebuild the output graph and keep playing the queued frames.
    Rebuild,
    /// Stop attempting recovery; the playback direction is unstable.
    Halt,
}

pub struct RecoveryController {
    max_retries: u32,
    attempts: AtomicU32,
    exhausted: AtomicBool,
    fault_tx: broadcast::Sender<FaultEvent>,
    fault_seq: Arc<AtomicU64>,
}

impl RecoveryController {
    pub fn new(
        max_retries: u32,
        fault_tx: broadcast::Sender<FaultEvent>,
        fault_seq: Arc<AtomicU64>,
    ) -> Self {
        Self {
            max_retries,
            attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            fault_tx,
            fault_seq,
        }
    }

    /// Classify a playback failure and decide the next step.
    ///
    /// Transient faults are reported per attempt; the exhausted fault is
    /// reported exactly once, on the attempt that spends the budget.
    pub fn on_failure(&self, error: &TalkbackError) -> RecoveryAction {
        if self.exhausted.load(Ordering::Acquire) {
            return RecoveryAction::Halt;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;

        if attempt >= self.max_retries {
            // swap() keeps the emission single even under racing failures.
            if !self.exhausted.swap(true, Ordering::AcqRel) {
                error!(attempt, "playback recovery budget spent");
                self.emit(FaultKind::Exhausted, format!("{error}"));
            }
            return RecoveryAction::Halt;
        }

        warn!(
            attempt,
            max = self.max_retries,
            "transient playback failure — rebuilding output graph: {error}"
        );
        self.emit(FaultKind::Transient, format!("{error}"));
        RecoveryAction::Rebuild
    }

    /// Whether the controller has reached its terminal state.
    pub fn is_unstable(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Recovery attempts consumed so far this session.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    fn emit(&self, kind: FaultKind, detail: String) {
        let seq = self.fault_seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.fault_tx.send(FaultEvent { seq, kind, detail });
    }
}
