use thiserror::Error;

/// All errors produced by talkback-core.
#[derive(Debug, Error)]
pub enum TalkbackError {
    /// Microphone or speaker access was denied, or no device is present.
    /// Fatal to the capture session; the bridge stays Idle.
    #[error("hardware access failed: {0}")]
    HardwareAccess(String),

    /// The host has no usable audio backend. Raised at construction time,
    /// before any device access is attempted.
    #[error("audio backend unavailable: {0}")]
    UnsupportedEnvironment(String),

    /// A scheduling or buffer-start failure on the playback path.
    /// Recovered locally by the recovery controller up to the retry budget.
    #[error("transient playback failure: {0}")]
    TransientPlayback(String),

    /// The playback retry budget is spent. Emitted exactly once per session;
    /// terminal for the playback direction.
    #[error("playback recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TalkbackError>;
