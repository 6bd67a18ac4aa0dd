//! Transport cursor state.

use rd_ir::{PatternId, MAX_NOTES};

/// One transport cursor.
///
/// Exactly two instances exist inside the engine: the *playhead* (the
/// position audio is emitted for in the current buffer) and the *queuing*
/// cursor, which runs ahead of the playhead by one look-ahead window while
/// filling the note queue. Both live behind the engine lock; the fields are
/// public because every access already happens under it.
///
/// `frame` and `tick` always describe the same instant, up to the fractional
/// `tick_mismatch` left over by the last frame conversion.
#[derive(Clone, Debug)]
pub struct TransportPosition {
    label: &'static str,
    /// Absolute frame since transport origin.
    pub frame: i64,
    /// Absolute tick since transport origin.
    pub tick: f64,
    /// Fractional tick lost when `tick` was floored into `frame`.
    pub tick_mismatch: f64,
    /// Column of the song sequence; -1 before the first update.
    pub column: i32,
    /// Tick at which the current pattern started.
    pub pattern_start_tick: i64,
    /// Tick position within the current pattern.
    pub pattern_tick_position: i64,
    /// Length of the longest playing pattern.
    pub pattern_size: i64,
    pub bpm: f32,
    /// Frames per tick at the current tempo.
    pub tick_size: f32,
    /// Accumulated shift of the frame axis caused by tempo changes.
    pub frame_offset_tempo: i64,
    /// Shift of the queuing tick axis, so an interval already enqueued is not
    /// re-enqueued after a tempo change.
    pub tick_offset_queuing: f64,
    /// Same idea for song-size edits.
    pub tick_offset_song_size: f64,
    /// Cached lead-lag window in frames; 0 means "recompute".
    pub last_lead_lag_factor: i64,
    /// Patterns playing at this position.
    pub playing_patterns: Vec<PatternId>,
    /// Patterns toggled in for the next stacked-mode update.
    pub next_patterns: Vec<PatternId>,
}

impl TransportPosition {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            frame: 0,
            tick: 0.0,
            tick_mismatch: 0.0,
            column: -1,
            pattern_start_tick: 0,
            pattern_tick_position: 0,
            pattern_size: MAX_NOTES,
            bpm: 120.0,
            tick_size: 0.0,
            frame_offset_tempo: 0,
            tick_offset_queuing: 0.0,
            tick_offset_song_size: 0.0,
            last_lead_lag_factor: 0,
            playing_patterns: Vec::new(),
            next_patterns: Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Deep-copy every field of `other` except the label.
    pub fn set(&mut self, other: &TransportPosition) {
        let label = self.label;
        *self = other.clone();
        self.label = label;
    }

    /// Back to the defaults of a freshly created cursor.
    pub fn reset(&mut self) {
        let label = self.label;
        *self = Self::new(label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restores_defaults() {
        let mut pos = TransportPosition::new("playhead");
        pos.frame = 1000;
        pos.tick = 2.0;
        pos.column = 3;
        pos.playing_patterns.push(1);

        pos.reset();
        assert_eq!(pos.frame, 0);
        assert_eq!(pos.tick, 0.0);
        assert_eq!(pos.column, -1);
        assert_eq!(pos.pattern_size, MAX_NOTES);
        assert!(pos.playing_patterns.is_empty());
        assert_eq!(pos.label(), "playhead");
    }

    #[test]
    fn set_copies_everything_but_label() {
        let mut a = TransportPosition::new("playhead");
        let mut b = TransportPosition::new("queuing");
        b.frame = 77;
        b.tick = 3.5;
        b.tick_offset_queuing = 0.25;
        b.playing_patterns.push(4);

        a.set(&b);
        assert_eq!(a.frame, 77);
        assert_eq!(a.tick, 3.5);
        assert_eq!(a.tick_offset_queuing, 0.25);
        assert_eq!(a.playing_patterns, vec![4]);
        assert_eq!(a.label(), "playhead");
    }
}
