//! Pattern types.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::note::Note;

/// Index of a pattern within a song's pattern list.
pub type PatternId = usize;

/// A pattern: a bar of notes keyed by their tick position.
///
/// Several notes may share a tick (different instruments, or flams on the
/// same one), so the storage is a tick-keyed multimap. A pattern may also
/// reference *virtual patterns* that play whenever it plays; the references
/// are transitive and are flattened by [`Song::flatten_virtual_patterns`].
///
/// [`Song::flatten_virtual_patterns`]: crate::Song::flatten_virtual_patterns
#[derive(Clone, Debug)]
pub struct Pattern {
    pub name: ArrayString<32>,
    /// Length in ticks.
    pub length: i64,
    notes: BTreeMap<i64, Vec<Note>>,
    /// Patterns played alongside this one.
    pub virtual_patterns: Vec<PatternId>,
}

impl Pattern {
    pub fn new(name: &str, length: i64) -> Self {
        let mut pat_name = ArrayString::new();
        let _ = pat_name.try_push_str(name);
        Self {
            name: pat_name,
            length,
            notes: BTreeMap::new(),
            virtual_patterns: Vec::new(),
        }
    }

    /// Insert a note at its own tick position.
    pub fn insert_note(&mut self, note: Note) {
        self.notes.entry(note.position).or_default().push(note);
    }

    /// All notes at an exact tick position.
    pub fn notes_at(&self, tick: i64) -> &[Note] {
        self.notes.get(&tick).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate over `(tick, notes)` entries in tick order.
    pub fn notes(&self) -> impl Iterator<Item = (i64, &[Note])> {
        self.notes.iter().map(|(tick, notes)| (*tick, notes.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn note_count(&self) -> usize {
        self.notes.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_share_a_tick() {
        let mut pat = Pattern::new("verse", 192);
        pat.insert_note(Note::new(0, 48, 1.0, 0.0, 0.0));
        pat.insert_note(Note::new(1, 48, 0.5, 0.0, 0.0));

        assert_eq!(pat.notes_at(48).len(), 2);
        assert_eq!(pat.notes_at(0).len(), 0);
        assert_eq!(pat.note_count(), 2);
    }

    #[test]
    fn notes_iterate_in_tick_order() {
        let mut pat = Pattern::new("fill", 192);
        pat.insert_note(Note::new(0, 96, 1.0, 0.0, 0.0));
        pat.insert_note(Note::new(0, 0, 1.0, 0.0, 0.0));
        pat.insert_note(Note::new(0, 48, 1.0, 0.0, 0.0));

        let ticks: Vec<i64> = pat.notes().map(|(tick, _)| tick).collect();
        assert_eq!(ticks, [0, 48, 96]);
    }
}
