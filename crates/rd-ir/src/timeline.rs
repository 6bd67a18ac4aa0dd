//! Tempo map: a timeline of per-column BPM markers.

use alloc::vec::Vec;

/// A tempo marker pinning a BPM from one column onward.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TempoMarker {
    pub column: i32,
    pub bpm: f32,
}

/// Ordered sequence of tempo markers.
///
/// The map is piecewise-constant: a marker's BPM applies from its column up
/// to (not including) the next marker's column. Columns before the first
/// marker have no timeline tempo; the engine falls back to its pending BPM
/// there.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    markers: Vec<TempoMarker>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the marker at `column`.
    pub fn set_marker(&mut self, column: i32, bpm: f32) {
        match self.markers.binary_search_by_key(&column, |m| m.column) {
            Ok(idx) => self.markers[idx].bpm = bpm,
            Err(idx) => self.markers.insert(idx, TempoMarker { column, bpm }),
        }
    }

    /// Remove the marker at `column`, if any.
    pub fn remove_marker(&mut self, column: i32) {
        self.markers.retain(|m| m.column != column);
    }

    /// The BPM pinned at `column`: the value of the marker at or before it.
    pub fn tempo_at_column(&self, column: i32) -> Option<f32> {
        self.markers
            .iter()
            .take_while(|m| m.column <= column)
            .last()
            .map(|m| m.bpm)
    }

    pub fn markers(&self) -> &[TempoMarker] {
        &self.markers
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempo_is_piecewise_constant() {
        let mut tl = Timeline::new();
        tl.set_marker(2, 140.0);
        tl.set_marker(5, 90.0);

        assert_eq!(tl.tempo_at_column(0), None);
        assert_eq!(tl.tempo_at_column(2), Some(140.0));
        assert_eq!(tl.tempo_at_column(4), Some(140.0));
        assert_eq!(tl.tempo_at_column(5), Some(90.0));
        assert_eq!(tl.tempo_at_column(100), Some(90.0));
    }

    #[test]
    fn set_marker_replaces_existing() {
        let mut tl = Timeline::new();
        tl.set_marker(1, 100.0);
        tl.set_marker(1, 120.0);

        assert_eq!(tl.markers().len(), 1);
        assert_eq!(tl.tempo_at_column(1), Some(120.0));
    }

    #[test]
    fn markers_stay_sorted() {
        let mut tl = Timeline::new();
        tl.set_marker(4, 100.0);
        tl.set_marker(1, 150.0);
        tl.set_marker(2, 130.0);

        let columns: Vec<i32> = tl.markers().iter().map(|m| m.column).collect();
        assert_eq!(columns, [1, 2, 4]);
    }
}
