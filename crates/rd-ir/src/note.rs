//! Percussion note values.

use crate::instrument::InstrumentId;

/// A single percussion note.
///
/// Notes live inside patterns (keyed by their tick position) and are copied
/// into the engine's queues for playback. The copy carries the timing offsets
/// accumulated during queuing: `humanize_delay` holds the summed swing,
/// humanize and lead-lag offset in frames, and `note_start` the resulting
/// absolute start frame computed by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Note {
    /// Instrument this note triggers.
    pub instrument_id: InstrumentId,
    /// Position in ticks from song start.
    pub position: i64,
    /// Velocity, 0.0..=1.0.
    pub velocity: f32,
    /// Stereo pan, -1.0 (left) ..= 1.0 (right).
    pub pan: f32,
    /// Length in ticks; `None` plays the whole sample.
    pub length: Option<i64>,
    /// Pitch shift in semitones.
    pub pitch: f32,
    /// Per-note timing offset factor, -1.0..=1.0, scaled by the lead-lag
    /// window during queuing.
    pub lead_lag: f32,
    /// Probability of being played, 0.0..=1.0.
    pub probability: f32,
    /// A note-off stops the instrument instead of triggering it.
    pub note_off: bool,
    /// Accumulated timing offset in frames, set during queuing.
    pub humanize_delay: i64,
    /// Absolute start frame, set by the engine before dispatch.
    pub note_start: i64,
}

impl Note {
    pub fn new(instrument_id: InstrumentId, position: i64, velocity: f32, pan: f32, pitch: f32) -> Self {
        Self {
            instrument_id,
            position,
            velocity,
            pan,
            length: None,
            pitch,
            lead_lag: 0.0,
            probability: 1.0,
            note_off: false,
            humanize_delay: 0,
            note_start: 0,
        }
    }

    /// Note-off counterpart for instruments with the stop-notes property.
    pub fn note_off_for(instrument_id: InstrumentId) -> Self {
        let mut note = Self::new(instrument_id, 0, 0.0, 0.0, 0.0);
        note.note_off = true;
        note
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_note_defaults() {
        let note = Note::new(3, 24, 0.8, 0.0, 0.0);
        assert_eq!(note.position, 24);
        assert_eq!(note.probability, 1.0);
        assert_eq!(note.length, None);
        assert!(!note.note_off);
        assert_eq!(note.humanize_delay, 0);
    }

    #[test]
    fn note_off_is_silent() {
        let off = Note::note_off_for(7);
        assert!(off.note_off);
        assert_eq!(off.velocity, 0.0);
        assert_eq!(off.instrument_id, 7);
    }
}
