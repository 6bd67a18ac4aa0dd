//! Instrument definitions.

use arrayvec::ArrayString;

/// Identifies an instrument within a song's drumkit.
pub type InstrumentId = i32;

/// Reserved id of the engine-owned metronome instrument. It is never part of
/// a song's instrument list.
pub const METRONOME_INSTRUMENT_ID: InstrumentId = -2;

/// A drumkit instrument.
///
/// Voice rendering (layers, envelopes, filtering) belongs to the sampler;
/// the engine only reads the playback properties below.
#[derive(Clone, Debug)]
pub struct Instrument {
    pub id: InstrumentId,
    pub name: ArrayString<32>,
    /// Output gain applied by the sampler.
    pub volume: f32,
    /// Constant pitch shift in semitones added to every note.
    pub pitch_offset: f32,
    /// Scale of the random per-note pitch jitter; 0 disables it.
    pub random_pitch_factor: f32,
    /// Generate a note-off right before each new note of this instrument.
    pub stop_notes: bool,
    /// Marks the engine's metronome click instrument.
    pub is_metronome: bool,
}

impl Instrument {
    pub fn new(id: InstrumentId, name: &str) -> Self {
        let mut inst_name = ArrayString::new();
        let _ = inst_name.try_push_str(name);
        Self {
            id,
            name: inst_name,
            volume: 1.0,
            pitch_offset: 0.0,
            random_pitch_factor: 0.0,
            stop_notes: false,
            is_metronome: false,
        }
    }

    /// The click instrument owned by the engine.
    pub fn metronome() -> Self {
        let mut inst = Self::new(METRONOME_INSTRUMENT_ID, "metronome");
        inst.is_metronome = true;
        inst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metronome_uses_reserved_id() {
        let inst = Instrument::metronome();
        assert_eq!(inst.id, METRONOME_INSTRUMENT_ID);
        assert!(inst.is_metronome);
    }
}
