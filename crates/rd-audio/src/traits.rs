//! Driver contracts and error types.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Process callback return code: buffer processed normally.
pub const PROCESS_OK: i32 = 0;
/// Process callback return code: stop driving the callback (offline sinks).
pub const PROCESS_TERMINATE: i32 = 1;
/// Process callback return code: the engine lock could not be acquired;
/// an offline sink should retry the same buffer.
pub const PROCESS_RETRY: i32 = 2;

/// Error type for driver operations.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("device init error: {0}")]
    DeviceInit(String),
    #[error("stream create error: {0}")]
    StreamCreate(String),
    #[error("playback error: {0}")]
    Playback(String),
    #[error("no audio device available")]
    NoDevice,
}

/// Stereo output buffers a driver exposes to the engine.
///
/// The engine mixes into these during the process callback; the driver reads
/// them out afterwards. Rebinding and access go through the surrounding
/// mutex, held only for the copy.
#[derive(Debug, Default)]
pub struct OutputBuffers {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl OutputBuffers {
    pub fn with_capacity(frames: usize) -> Self {
        Self {
            left: vec![0.0; frames],
            right: vec![0.0; frames],
        }
    }

    /// Zero the first `frames` samples, growing the buffers if needed.
    pub fn clear(&mut self, frames: usize) {
        if self.left.len() < frames {
            self.left.resize(frames, 0.0);
            self.right.resize(frames, 0.0);
        }
        self.left[..frames].fill(0.0);
        self.right[..frames].fill(0.0);
    }
}

/// Shared handle to a driver's output buffers.
pub type SharedOutput = Arc<Mutex<OutputBuffers>>;

/// The per-buffer entry point a driver pulls.
///
/// Implemented by the audio engine and injected into drivers at
/// construction, replacing any global engine access.
pub trait ProcessCallback: Send + Sync {
    /// Process `frames` frames. Returns [`PROCESS_OK`], [`PROCESS_TERMINATE`]
    /// or [`PROCESS_RETRY`].
    fn process(&self, frames: u32) -> i32;
}

/// Timebase role of a driver's external transport, if any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timebase {
    /// No external transport.
    #[default]
    None,
    /// The driver broadcasts transport to other clients.
    Master,
    /// The driver follows tempo and position of an external master.
    Slave,
}

/// Transport state pulled from an external master once per cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransportPull {
    /// Absolute transport frame reported by the master.
    pub frame: i64,
    /// Master tempo, when the driver is a timebase slave.
    pub bpm: Option<f32>,
}

/// Pull-style audio output backend.
pub trait AudioOutput: Send {
    fn init(&mut self, buffer_size: u32) -> Result<(), AudioError>;
    fn connect(&mut self) -> Result<(), AudioError>;
    fn disconnect(&mut self);
    fn sample_rate(&self) -> u32;
    fn buffer_size(&self) -> u32;
    /// The stereo buffers the engine mixes into.
    fn output(&self) -> SharedOutput;
    /// Per-track output buffers, for drivers that expose them.
    fn track_output(&self, _track: usize) -> Option<SharedOutput> {
        None
    }
    /// Offline sinks get [`PROCESS_RETRY`]/[`PROCESS_TERMINATE`] semantics.
    fn is_offline(&self) -> bool {
        false
    }

    /// True when an external server owns transport and relocations must be
    /// routed through it.
    fn has_transport_control(&self) -> bool {
        false
    }
    fn timebase(&self) -> Timebase {
        Timebase::None
    }
    /// Latest external transport state, polled once per process cycle.
    fn pull_transport(&mut self) -> Option<TransportPull> {
        None
    }
    fn locate_transport(&mut self, _frame: i64) {}
    fn start_transport(&mut self) {}
    fn stop_transport(&mut self) {}
}

/// MIDI output backend; the engine only flushes hanging notes through it.
pub trait MidiOutput: Send {
    fn open(&mut self);
    fn close(&mut self);
    fn active(&self) -> bool;
    /// Emitted when the end of the song is reached.
    fn all_notes_off(&mut self);
}

/// MIDI output that goes nowhere.
#[derive(Debug, Default)]
pub struct NullMidiOutput {
    active: bool,
}

impl MidiOutput for NullMidiOutput {
    fn open(&mut self) {
        self.active = true;
    }

    fn close(&mut self) {
        self.active = false;
    }

    fn active(&self) -> bool {
        self.active
    }

    fn all_notes_off(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_grows_and_zeroes() {
        let mut buffers = OutputBuffers::default();
        buffers.clear(128);
        assert_eq!(buffers.left.len(), 128);
        assert!(buffers.left.iter().all(|&s| s == 0.0));

        buffers.left[10] = 0.5;
        buffers.clear(64);
        assert_eq!(buffers.left[10], 0.0);
    }
}
