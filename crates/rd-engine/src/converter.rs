//! Bidirectional tick/frame conversion over a tempo map snapshot.

use rd_ir::Song;

use crate::error::EngineError;

/// One stretch of constant tempo.
#[derive(Clone, Copy, Debug)]
struct Segment {
    start_tick: f64,
    /// Frames per tick within this segment.
    tick_size: f64,
}

/// Immutable snapshot of the song's tempo map.
///
/// Conversion integrates the piecewise-constant map segment by segment. When
/// the timeline is disabled (or empty) a single segment at the transport BPM
/// covers the whole axis; with markers present, ticks past the song length
/// repeat the map periodically so that looped transport keeps converting
/// consistently.
///
/// Both directions are pure over the snapshot. `frame_from_tick` additionally
/// returns the *tick mismatch*, the fractional residue lost by flooring to an
/// integer frame, defined such that
/// `tick_from_frame(frame) + mismatch == tick` holds exactly.
#[derive(Clone, Debug)]
pub struct TempoGrid {
    segments: Vec<Segment>,
    /// Ticks covered by one pass of the map; 0 when a single segment covers
    /// everything.
    song_length: f64,
    /// Frames covered by one pass of the map.
    period_frames: f64,
}

impl TempoGrid {
    /// Frames per tick at the given rate, tempo and resolution.
    pub fn tick_size(sample_rate: u32, bpm: f32, resolution: u32) -> f64 {
        sample_rate as f64 * 60.0 / bpm as f64 / resolution as f64
    }

    /// Snapshot the tempo map of `song`.
    ///
    /// `fallback_bpm` applies wherever the timeline has no say: everywhere
    /// when it is inactive or empty, and on columns before its first marker.
    pub fn new(song: &Song, sample_rate: u32, fallback_bpm: f32) -> Result<Self, EngineError> {
        if sample_rate == 0 {
            return Err(EngineError::TickSizeZero);
        }

        if !song.timeline_active
            || song.timeline.is_empty()
            || song.pattern_groups.is_empty()
        {
            return Self::uniform(sample_rate, fallback_bpm, song.resolution);
        }

        let mut segments: Vec<Segment> = Vec::new();
        let mut start_tick = 0.0;
        for column in 0..song.pattern_groups.len() {
            let bpm = song
                .timeline
                .tempo_at_column(column as i32)
                .unwrap_or(fallback_bpm);
            let tick_size = Self::tick_size(sample_rate, bpm, song.resolution);
            if !(tick_size > 0.0) {
                return Err(EngineError::TickSizeZero);
            }
            match segments.last() {
                Some(last) if last.tick_size == tick_size => {}
                _ => segments.push(Segment {
                    start_tick,
                    tick_size,
                }),
            }
            start_tick += song.column_length(column) as f64;
        }

        let song_length = start_tick;
        let period_frames = frames_in_span(&segments, song_length);
        Ok(Self {
            segments,
            song_length,
            period_frames,
        })
    }

    /// A grid with one constant tempo over the whole axis.
    pub fn uniform(sample_rate: u32, bpm: f32, resolution: u32) -> Result<Self, EngineError> {
        let tick_size = Self::tick_size(sample_rate, bpm, resolution);
        if !(tick_size > 0.0) {
            return Err(EngineError::TickSizeZero);
        }
        Ok(Self {
            segments: vec![Segment {
                start_tick: 0.0,
                tick_size,
            }],
            song_length: 0.0,
            period_frames: 0.0,
        })
    }

    fn is_uniform(&self) -> bool {
        self.segments.len() == 1 || self.song_length <= 0.0
    }

    /// Map a tick to the frame it starts at, plus the tick mismatch.
    pub fn frame_from_tick(&self, tick: f64) -> Result<(i64, f64), EngineError> {
        if !(tick >= 0.0) {
            return Err(EngineError::InvalidTime(tick));
        }
        let frames = self.frames_for_tick(tick);
        // A tick that came out of tick_from_frame must map back onto the
        // exact same frame; the integration above can land an ulp below the
        // integer, so guard the floor by a sub-frame epsilon.
        let frame = (frames + 1e-6).floor() as i64;
        let mismatch = tick - self.tick_for_frames(frame as f64);
        Ok((frame, mismatch))
    }

    /// Map a frame to the (fractional) tick covering it.
    pub fn tick_from_frame(&self, frame: i64) -> Result<f64, EngineError> {
        if frame < 0 {
            return Err(EngineError::InvalidTime(frame as f64));
        }
        Ok(self.tick_for_frames(frame as f64))
    }

    fn frames_for_tick(&self, tick: f64) -> f64 {
        if self.is_uniform() {
            return tick * self.segments[0].tick_size;
        }
        let periods = (tick / self.song_length).floor();
        let rem = tick - periods * self.song_length;
        periods * self.period_frames + frames_in_span(&self.segments, rem)
    }

    fn tick_for_frames(&self, frames: f64) -> f64 {
        if self.is_uniform() {
            return frames / self.segments[0].tick_size;
        }
        let periods = (frames / self.period_frames).floor();
        let mut rem = frames - periods * self.period_frames;
        let base = periods * self.song_length;

        for (i, seg) in self.segments.iter().enumerate() {
            let end_tick = self
                .segments
                .get(i + 1)
                .map(|next| next.start_tick)
                .unwrap_or(self.song_length);
            let span_frames = (end_tick - seg.start_tick) * seg.tick_size;
            if rem < span_frames || i == self.segments.len() - 1 {
                return base + seg.start_tick + rem / seg.tick_size;
            }
            rem -= span_frames;
        }
        base
    }
}

/// Frames covered by `[0, end_tick)` of the given segments.
fn frames_in_span(segments: &[Segment], end_tick: f64) -> f64 {
    let mut frames = 0.0;
    for (i, seg) in segments.iter().enumerate() {
        let seg_end = segments
            .get(i + 1)
            .map(|next| next.start_tick)
            .unwrap_or(f64::MAX);
        if end_tick <= seg.start_tick {
            break;
        }
        frames += (end_tick.min(seg_end) - seg.start_tick) * seg.tick_size;
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use rd_ir::Pattern;

    fn marked_song(columns: usize, markers: &[(i32, f32)]) -> Song {
        let mut song = Song::new("test");
        for _ in 0..columns {
            let id = song.add_pattern(Pattern::new("pat", 192));
            song.add_column(vec![id]);
        }
        for &(col, bpm) in markers {
            song.timeline.set_marker(col, bpm);
        }
        song.timeline_active = true;
        song
    }

    #[test]
    fn uniform_tick_size() {
        // 48000 * 60 / 120 / 48 = 500 frames per tick.
        assert_eq!(TempoGrid::tick_size(48000, 120.0, 48), 500.0);
    }

    #[test]
    fn uniform_conversion() {
        let grid = TempoGrid::uniform(48000, 120.0, 48).unwrap();
        let (frame, mismatch) = grid.frame_from_tick(10.0).unwrap();
        assert_eq!(frame, 5000);
        assert_eq!(mismatch, 0.0);
        assert_eq!(grid.tick_from_frame(5000).unwrap(), 10.0);
    }

    #[test]
    fn mismatch_restores_fractional_tick() {
        let grid = TempoGrid::uniform(48000, 120.0, 48).unwrap();
        let tick = 10.0015;
        let (frame, mismatch) = grid.frame_from_tick(tick).unwrap();
        let roundtrip = grid.tick_from_frame(frame).unwrap() + mismatch;
        assert_eq!(roundtrip, tick);
    }

    #[test]
    fn round_trip_within_one_tick() {
        let grid = TempoGrid::uniform(44100, 133.7, 48).unwrap();
        for i in 0..2000 {
            let tick = i as f64 * 0.37;
            let (frame, _) = grid.frame_from_tick(tick).unwrap();
            let back = grid.tick_from_frame(frame).unwrap();
            assert!((back - tick).abs() < 1.0, "tick {} came back as {}", tick, back);
        }
    }

    #[test]
    fn marker_splits_the_axis() {
        // Column 0 at the fallback 120 bpm (500 f/t), column 1 at 240 (250 f/t).
        let song = marked_song(2, &[(1, 240.0)]);
        let grid = TempoGrid::new(&song, 48000, 120.0).unwrap();

        assert_eq!(grid.frame_from_tick(192.0).unwrap().0, 96000);
        assert_eq!(grid.frame_from_tick(193.0).unwrap().0, 96250);
        assert_eq!(grid.tick_from_frame(96250).unwrap(), 193.0);
    }

    #[test]
    fn map_repeats_past_song_end() {
        let song = marked_song(2, &[(1, 240.0)]);
        let grid = TempoGrid::new(&song, 48000, 120.0).unwrap();
        // One pass: 192 * 500 + 192 * 250 = 144000 frames.
        assert_eq!(grid.frame_from_tick(384.0).unwrap().0, 144000);
        assert_eq!(grid.frame_from_tick(384.0 + 192.0).unwrap().0, 144000 + 96000);
        assert_eq!(grid.tick_from_frame(144000).unwrap(), 384.0);
    }

    #[test]
    fn round_trip_across_markers() {
        let song = marked_song(3, &[(1, 240.0), (2, 90.0)]);
        let grid = TempoGrid::new(&song, 48000, 120.0).unwrap();
        for i in 0..3000 {
            let tick = i as f64 * 0.49;
            let (frame, mismatch) = grid.frame_from_tick(tick).unwrap();
            let back = grid.tick_from_frame(frame).unwrap();
            assert!((back - tick).abs() < 1.0);
            assert_eq!(back + mismatch, tick);
        }
    }

    #[test]
    fn negative_tick_is_invalid() {
        let grid = TempoGrid::uniform(48000, 120.0, 48).unwrap();
        assert!(matches!(
            grid.frame_from_tick(-1.0),
            Err(EngineError::InvalidTime(_))
        ));
        assert!(matches!(
            grid.tick_from_frame(-1),
            Err(EngineError::InvalidTime(_))
        ));
    }

    #[test]
    fn zero_tick_size_is_guarded() {
        assert!(matches!(
            TempoGrid::uniform(0, 120.0, 48),
            Err(EngineError::TickSizeZero)
        ));
        assert!(matches!(
            TempoGrid::uniform(48000, f32::INFINITY, 48),
            Err(EngineError::TickSizeZero)
        ));
    }

    #[test]
    fn inactive_timeline_ignores_markers() {
        let mut song = marked_song(2, &[(1, 240.0)]);
        song.timeline_active = false;
        let grid = TempoGrid::new(&song, 48000, 120.0).unwrap();
        assert_eq!(grid.frame_from_tick(193.0).unwrap().0, 96500);
    }
}
