//! Audio and MIDI driver backends for the rudiment drum sequencer.
//!
//! The engine consumes drivers through the pull-style [`AudioOutput`]
//! contract: a driver owns a pair of shared output buffers and invokes the
//! injected [`ProcessCallback`] once per buffer; the engine fills the buffers
//! during that call. Sinks included here: the real-time cpal output, a null
//! sink used as fallback and in tests, and an in-memory offline render sink.

mod cpal_backend;
mod null;
mod offline;
mod traits;

pub use cpal_backend::CpalDriver;
pub use null::NullDriver;
pub use offline::OfflineDriver;
pub use traits::{
    AudioError, AudioOutput, MidiOutput, NullMidiOutput, OutputBuffers, ProcessCallback,
    SharedOutput, Timebase, TransportPull, PROCESS_OK, PROCESS_RETRY, PROCESS_TERMINATE,
};
