//! Host audio environment probe and per-direction context table.
//!
//! Device contexts are tracked in an explicit table whose entries live
//! exactly as long as the session that opened them — registered when a
//! stream is acquired, released at teardown. Nothing here is initialized
//! implicitly on first use, and no state survives a released session.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TalkbackError};

/// The two independent real-time directions of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Capture,
    Playback,
}

/// A live device context for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Device name reported by the OS.
    pub device_name: String,
    /// Native sample rate the device stream runs at (Hz).
    pub sample_rate: u32,
}

/// Process-wide table of live audio contexts, one slot per direction.
#[derive(Debug, Default)]
pub struct ContextTable {
    entries: Mutex<HashMap<Direction, ContextEntry>>,
}

impl ContextTable {
    /// Create an empty table after verifying the host has an audio backend.
    ///
    /// # Errors
    /// `TalkbackError::UnsupportedEnvironment` when no backend is available —
    /// raised before any device is touched.
    pub fn probe() -> Result<Self> {
        probe_backend()?;
        Ok(Self::default())
    }

    /// Record a freshly acquired device context. Replaces any stale entry
    /// for the same direction.
    pub fn register(&self, direction: Direction, entry: ContextEntry) {
        let old = self.entries.lock().insert(direction, entry);
        if old.is_some() {
            tracing::warn!(?direction, "replaced a context entry that was never released");
        }
    }

    /// Release the context for a direction at session teardown. Safe to call
    /// when no entry is registered.
    pub fn release(&self, direction: Direction) {
        self.entries.lock().remove(&direction);
    }

    /// Snapshot of the live context for a direction, if any.
    pub fn entry(&self, direction: Direction) -> Option<ContextEntry> {
        self.entries.lock().get(&direction).cloned()
    }
}

#[cfg(feature = "audio-cpal")]
fn probe_backend() -> Result<()> {
    if cpal::available_hosts().is_empty() {
        return Err(TalkbackError::UnsupportedEnvironment(
            "no cpal audio host on this platform".into(),
        ));
    }
    Ok(())
}

#[cfg(not(feature = "audio-cpal"))]
fn probe_backend() -> Result<()> {
    Err(TalkbackError::UnsupportedEnvironment(
        "compiled without the audio-cpal feature".into(),
    ))
}

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
}

/// List the available audio input devices.
///
/// Returns an empty `Vec` when enumeration fails or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                DeviceInfo { name, is_default }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_live_only_between_register_and_release() {
        let table = ContextTable::default();
        assert!(table.entry(Direction::Capture).is_none());

        table.register(
            Direction::Capture,
            ContextEntry {
                device_name: "Test Mic".into(),
                sample_rate: 48_000,
            },
        );
        assert_eq!(
            table.entry(Direction::Capture).map(|e| e.sample_rate),
            Some(48_000)
        );
        assert!(table.entry(Direction::Playback).is_none());

        table.release(Direction::Capture);
        assert!(table.entry(Direction::Capture).is_none());
    }

    #[test]
    fn release_without_register_is_a_no_op() {
        let table = ContextTable::default();
        table.release(Direction::Playback);
        assert!(table.entry(Direction::Playback).is_none());
    }

    #[test]
    fn directions_are_independent_slots() {
        let table = ContextTable::default();
        table.register(
            Direction::Capture,
            ContextEntry {
                device_name: "mic".into(),
                sample_rate: 16_000,
            },
        );
        table.register(
            Direction::Playback,
            ContextEntry {
                device_name: "speakers".into(),
                sample_rate: 24_000,
            },
        );
        table.release(Direction::Capture);
        assert!(table.entry(Direction::Playback).is_some());
    }
}
