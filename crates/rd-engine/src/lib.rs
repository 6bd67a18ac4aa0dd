//! Real-time audio engine core of the rudiment drum sequencer.
//!
//! Drives transport across a song of patterns, queues percussion notes ahead
//! of time with swing/humanize/lead-lag offsets applied, and dispatches them
//! to the sampler at sample-accurate frames from the real-time process
//! callback. The engine keeps two transport cursors: the *playhead* used for
//! emitting audio in the current buffer, and the *queuing* cursor running one
//! look-ahead window ahead of it to fill the note queue.

mod converter;
mod engine;
mod error;
mod event;
mod queue;
mod random;
mod sampler;
mod transport;

pub use converter::TempoGrid;
pub use engine::{
    AudioEngine, Locker, State, ERROR_DRIVER_START_FAILED, ERROR_DRIVER_UNKNOWN,
    ERROR_TICK_SIZE_ZERO, LEAD_LAG_TICKS, MAX_TIME_HUMANIZE, METRONOME_DIVISOR,
};
pub use error::EngineError;
pub use event::{event_channel, Event, EventKind, EventReceiver, EventSender};
pub use queue::SongNoteQueue;
pub use sampler::{EffectSlot, NullSampler, NullSynth, Sampler, Synth};
pub use transport::TransportPosition;
