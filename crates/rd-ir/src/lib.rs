//! Core data model for the rudiment drum sequencer.
//!
//! This crate defines the song, pattern, note and instrument types shared
//! between the audio engine and any embedding frontend. The engine consumes
//! these types read-only; all mutation happens on control threads under the
//! engine lock.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod automation;
mod instrument;
mod note;
mod pattern;
mod song;
mod timeline;

pub use automation::AutomationPath;
pub use instrument::{Instrument, InstrumentId, METRONOME_INSTRUMENT_ID};
pub use note::Note;
pub use pattern::{Pattern, PatternId};
pub use song::{LoopMode, Mode, PatternMode, Song, MAX_BPM, MAX_NOTES, MIN_BPM};
pub use timeline::{TempoMarker, Timeline};
