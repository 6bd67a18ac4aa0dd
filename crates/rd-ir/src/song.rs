//! Song structure: patterns arranged in a sequence of columns.

use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::automation::AutomationPath;
use crate::instrument::{Instrument, InstrumentId};
use crate::pattern::{Pattern, PatternId};
use crate::timeline::Timeline;

/// Ticks per pattern at the default resolution (one 4/4 bar).
pub const MAX_NOTES: i64 = 192;

/// Lower bound for user-set tempo.
pub const MIN_BPM: f32 = 30.0;

/// Upper bound for user-set tempo.
pub const MAX_BPM: f32 = 500.0;

/// Transport mode: play the song sequence or a single pattern.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Song,
    Pattern,
}

/// Sub-mode of [`Mode::Pattern`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatternMode {
    /// Play the currently selected pattern.
    #[default]
    Selected,
    /// Toggle patterns in and out of a stack of playing patterns.
    Stacked,
}

/// Whether transport wraps at the end of the song.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopMode {
    #[default]
    Disabled,
    Enabled,
}

/// A song: patterns, their arrangement into columns, and playback settings.
///
/// Each entry of `pattern_groups` is one *column* of the sequence: the set of
/// patterns playing simultaneously at that position. A column's length is the
/// length of its longest pattern.
#[derive(Clone, Debug)]
pub struct Song {
    pub name: ArrayString<32>,
    /// Tempo stored with the song; the engine's pending BPM starts here.
    pub bpm: f32,
    /// Ticks per quarter note.
    pub resolution: u32,
    pub patterns: Vec<Pattern>,
    /// The sequence: one group of simultaneously playing patterns per column.
    pub pattern_groups: Vec<Vec<PatternId>>,
    pub instruments: Vec<Instrument>,
    pub mode: Mode,
    pub pattern_mode: PatternMode,
    pub loop_mode: LoopMode,
    /// Swing applied to upbeat 16th notes, 0.0..=1.0.
    pub swing_factor: f32,
    /// Scale of the random timing jitter, 0.0..=1.0.
    pub humanize_time: f32,
    /// Scale of the random velocity jitter, 0.0..=1.0.
    pub humanize_velocity: f32,
    /// Velocity automation over the song sequence.
    pub velocity_automation: AutomationPath,
    pub timeline: Timeline,
    pub timeline_active: bool,
    /// Pattern shown in the editor; drives Pattern/Selected playback.
    pub selected_pattern: Option<PatternId>,
}

impl Song {
    pub fn new(name: &str) -> Self {
        let mut song_name = ArrayString::new();
        let _ = song_name.try_push_str(name);
        Self {
            name: song_name,
            bpm: 120.0,
            resolution: 48,
            patterns: Vec::new(),
            pattern_groups: Vec::new(),
            instruments: Vec::new(),
            mode: Mode::default(),
            pattern_mode: PatternMode::default(),
            loop_mode: LoopMode::default(),
            swing_factor: 0.0,
            humanize_time: 0.0,
            humanize_velocity: 0.0,
            velocity_automation: AutomationPath::default(),
            timeline: Timeline::new(),
            timeline_active: false,
            selected_pattern: None,
        }
    }

    /// Add a pattern and return its id.
    pub fn add_pattern(&mut self, pattern: Pattern) -> PatternId {
        self.patterns.push(pattern);
        self.patterns.len() - 1
    }

    /// Append a column to the sequence.
    pub fn add_column(&mut self, patterns: Vec<PatternId>) {
        self.pattern_groups.push(patterns);
    }

    pub fn is_looping(&self) -> bool {
        self.loop_mode == LoopMode::Enabled
    }

    /// Length of the longest pattern among `ids`; `MAX_NOTES` if empty.
    pub fn longest_pattern_length(&self, ids: &[PatternId]) -> i64 {
        ids.iter()
            .filter_map(|&id| self.patterns.get(id))
            .map(|p| p.length)
            .max()
            .unwrap_or(MAX_NOTES)
    }

    /// Length in ticks of the column at `column`.
    pub fn column_length(&self, column: usize) -> i64 {
        self.pattern_groups
            .get(column)
            .map(|group| self.longest_pattern_length(group))
            .unwrap_or(MAX_NOTES)
    }

    /// Total length of the sequence in ticks.
    pub fn length_in_ticks(&self) -> i64 {
        (0..self.pattern_groups.len())
            .map(|col| self.column_length(col))
            .sum()
    }

    /// Tick at which `column` starts, or `None` past the end of the song.
    pub fn tick_for_column(&self, column: i32) -> Option<i64> {
        if column < 0 || column as usize >= self.pattern_groups.len() {
            return None;
        }
        Some((0..column as usize).map(|col| self.column_length(col)).sum())
    }

    /// Column covering `tick`, plus the column's start tick.
    ///
    /// Both are defined within `[0, length_in_ticks)`; when looping, ticks
    /// past the end wrap around. Past the end without looping the result is
    /// `None`.
    pub fn column_for_tick(&self, tick: i64, loop_enabled: bool) -> Option<(i32, i64)> {
        let total = self.length_in_ticks();
        if total == 0 {
            return None;
        }
        let tick = if tick >= total {
            if !loop_enabled {
                return None;
            }
            tick % total
        } else {
            tick
        };

        let mut start = 0;
        for (col, _) in self.pattern_groups.iter().enumerate() {
            let len = self.column_length(col);
            if tick < start + len {
                return Some((col as i32, start));
            }
            start += len;
        }
        None
    }

    /// Collect `id` plus the transitive closure of its virtual patterns into
    /// `out`, skipping entries already present.
    pub fn flatten_virtual_patterns(&self, id: PatternId, out: &mut Vec<PatternId>) {
        if out.contains(&id) {
            return;
        }
        out.push(id);
        if let Some(pattern) = self.patterns.get(id) {
            for &virt in &pattern.virtual_patterns {
                self.flatten_virtual_patterns(virt, out);
            }
        }
    }

    pub fn instrument(&self, id: InstrumentId) -> Option<&Instrument> {
        self.instruments.iter().find(|inst| inst.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A song of `columns` single-pattern columns, each `len` ticks long.
    fn sequence_song(columns: usize, len: i64) -> Song {
        let mut song = Song::new("test");
        for i in 0..columns {
            let id = song.add_pattern(Pattern::new("pat", len));
            song.add_column(alloc::vec![id]);
            assert_eq!(id, i);
        }
        song
    }

    #[test]
    fn length_sums_columns() {
        let song = sequence_song(3, 192);
        assert_eq!(song.length_in_ticks(), 576);
    }

    #[test]
    fn column_length_uses_longest_pattern() {
        let mut song = Song::new("test");
        let a = song.add_pattern(Pattern::new("a", 96));
        let b = song.add_pattern(Pattern::new("b", 192));
        song.add_column(alloc::vec![a, b]);

        assert_eq!(song.column_length(0), 192);
        assert_eq!(song.length_in_ticks(), 192);
    }

    #[test]
    fn empty_column_counts_max_notes() {
        let mut song = Song::new("test");
        song.add_column(alloc::vec![]);
        assert_eq!(song.length_in_ticks(), MAX_NOTES);
    }

    #[test]
    fn tick_for_column_accumulates() {
        let song = sequence_song(3, 192);
        assert_eq!(song.tick_for_column(0), Some(0));
        assert_eq!(song.tick_for_column(2), Some(384));
        assert_eq!(song.tick_for_column(3), None);
        assert_eq!(song.tick_for_column(-1), None);
    }

    #[test]
    fn column_for_tick_within_song() {
        let song = sequence_song(2, 192);
        assert_eq!(song.column_for_tick(0, false), Some((0, 0)));
        assert_eq!(song.column_for_tick(191, false), Some((0, 0)));
        assert_eq!(song.column_for_tick(192, false), Some((1, 192)));
        assert_eq!(song.column_for_tick(383, false), Some((1, 192)));
    }

    #[test]
    fn column_for_tick_past_end() {
        let song = sequence_song(2, 192);
        assert_eq!(song.column_for_tick(384, false), None);
        // Looping wraps and keeps the start tick within one repetition.
        assert_eq!(song.column_for_tick(384, true), Some((0, 0)));
        assert_eq!(song.column_for_tick(600, true), Some((1, 192)));
    }

    #[test]
    fn empty_song_has_no_columns() {
        let song = Song::new("empty");
        assert_eq!(song.column_for_tick(0, true), None);
        assert_eq!(song.length_in_ticks(), 0);
    }

    #[test]
    fn virtual_patterns_flatten_transitively() {
        let mut song = Song::new("test");
        let a = song.add_pattern(Pattern::new("a", 192));
        let b = song.add_pattern(Pattern::new("b", 192));
        let c = song.add_pattern(Pattern::new("c", 192));
        song.patterns[a].virtual_patterns.push(b);
        song.patterns[b].virtual_patterns.push(c);
        // Cycle back to a must not recurse forever.
        song.patterns[c].virtual_patterns.push(a);

        let mut out = Vec::new();
        song.flatten_virtual_patterns(a, &mut out);
        assert_eq!(out, alloc::vec![a, b, c]);
    }
}
