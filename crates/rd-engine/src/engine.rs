//! The audio engine: state machine, real-time process callback, look-ahead
//! note queuing and edit-time reconciliation.
//!
//! All mutable state lives in [`EngineInner`] behind a single engine lock.
//! Control-plane methods on [`AudioEngine`] acquire it unbounded and delegate
//! to inner methods; the real-time [`AudioEngine::process`] callback acquires
//! it with a bounded wait equal to the slack left in the current buffer and
//! emits one buffer of silence when it cannot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use rd_audio::{
    AudioOutput, CpalDriver, MidiOutput, NullDriver, NullMidiOutput, ProcessCallback,
    SharedOutput, Timebase, PROCESS_OK, PROCESS_RETRY, PROCESS_TERMINATE,
};
use rd_ir::{
    Instrument, Mode, Note, PatternId, PatternMode, Song, Timeline, MAX_BPM, MAX_NOTES,
    METRONOME_INSTRUMENT_ID, MIN_BPM,
};

use crate::converter::TempoGrid;
use crate::error::EngineError;
use crate::event::{event_channel, EventKind, EventReceiver, EventSender};
use crate::queue::SongNoteQueue;
use crate::random::gaussian;
use crate::sampler::{EffectSlot, NullSampler, NullSynth, Sampler, Synth};
use crate::transport::TransportPosition;

/// Maximum timing offset a note can accumulate, in frames.
pub const MAX_TIME_HUMANIZE: i64 = 2000;

/// Width of the per-note lead-lag window, in ticks.
pub const LEAD_LAG_TICKS: f64 = 5.0;

/// A metronome click falls on every multiple of this tick count.
pub const METRONOME_DIVISOR: i64 = 48;

/// Error-event argument: a driver name was not recognized.
pub const ERROR_DRIVER_UNKNOWN: i32 = 0;
/// Error-event argument: a driver failed to initialize or connect.
pub const ERROR_DRIVER_START_FAILED: i32 = 1;
/// Error-event argument: the computed tick size collapsed to zero.
pub const ERROR_TICK_SIZE_ZERO: i32 = 2;

const EVENT_CAPACITY: usize = 4096;

/// Lifecycle states of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Only reached during shutdown.
    Uninitialized,
    /// Created, no drivers yet.
    Initialized,
    /// Drivers connected, no song set.
    Prepared,
    /// Song set, transport stopped.
    Ready,
    /// Transport rolling.
    Playing,
    /// Driven directly by tests instead of a driver.
    Testing,
}

/// Site that last acquired the engine lock, for deadlock diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct Locker {
    pub file: &'static str,
    pub line: u32,
    pub context: &'static str,
}

impl Locker {
    pub const fn unknown() -> Self {
        Self {
            file: "",
            line: 0,
            context: "",
        }
    }
}

/// Capture the current source location as a [`Locker`].
#[macro_export]
macro_rules! here {
    () => {
        $crate::Locker {
            file: file!(),
            line: line!(),
            context: module_path!(),
        }
    };
}

#[derive(Clone, Copy)]
struct LockerRecord {
    locker: Locker,
    thread: Option<ThreadId>,
}

/// Which of the two transport cursors an inner operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cursor {
    Playhead,
    Queuing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NoteQueueOutcome {
    Continue,
    EndOfSong,
}

/// Everything protected by the engine lock.
struct EngineInner {
    state: State,
    /// State requested by the user; applied at the next callback boundary.
    next_state: State,
    song: Option<Song>,
    playhead: TransportPosition,
    queuing: TransportPosition,
    song_queue: SongNoteQueue,
    /// Notes injected by MIDI input or the virtual keyboard, awaiting merge
    /// into the song queue.
    midi_queue: VecDeque<Note>,
    song_size_ticks: f64,
    /// Pending user-set tempo, clamped to `[MIN_BPM, MAX_BPM]`.
    next_bpm: f32,
    /// Tempo broadcast by an external timebase master, if any.
    external_bpm: Option<f32>,
    /// End of the tick interval covered by the last queuing cycle.
    last_tick_end: f64,
    /// Whether the look-ahead window has been consumed by a queuing cycle.
    /// Deliberately a flag: deriving it from cursor arithmetic is ambiguous
    /// across tempo-marker straddles.
    lookahead_applied: bool,
    /// Stand-in transport frame while playback is stopped, so MIDI input
    /// keeps flowing.
    realtime_frame: i64,
    master_peak_l: f32,
    master_peak_r: f32,
    metronome_enabled: bool,
    metronome_volume: f32,
    metronome_instrument: Instrument,
    driver: Option<Box<dyn AudioOutput>>,
    midi_out: Option<Box<dyn MidiOutput>>,
    sampler: Box<dyn Sampler>,
    synth: Box<dyn Synth>,
    /// Master effects chain, run in order over the summed output.
    effects: Vec<Box<dyn EffectSlot>>,
    events: EventSender,
    rng: SmallRng,
}

/// The engine.
///
/// Shared between control threads and the audio backend as
/// `Arc<AudioEngine>`; drivers receive a [`ProcessCallback`] handle from
/// [`AudioEngine::process_callback`] instead of any global access.
pub struct AudioEngine {
    inner: Mutex<EngineInner>,
    /// Narrow lock rebinding the driver's output buffers; held only while
    /// clearing, mixing or swapping them.
    output: Mutex<Option<SharedOutput>>,
    locker: Mutex<LockerRecord>,
    events: EventSender,
    /// Mirrors of driver facts the process prologue reads before it holds
    /// the engine lock.
    sample_rate: AtomicU32,
    offline_sink: AtomicBool,
    process_time_us: AtomicU32,
    max_process_time_us: AtomicU32,
}

struct EngineHandle {
    engine: Weak<AudioEngine>,
}

impl ProcessCallback for EngineHandle {
    fn process(&self, frames: u32) -> i32 {
        match self.engine.upgrade() {
            Some(engine) => engine.process(frames),
            None => PROCESS_OK,
        }
    }
}

/// Frames covered by [`LEAD_LAG_TICKS`] ticks starting at `tick`.
fn lead_lag_frames(grid: &TempoGrid, tick: f64) -> i64 {
    let start = grid.frame_from_tick(tick).map(|(f, _)| f).unwrap_or(0);
    let end = grid
        .frame_from_tick(tick + LEAD_LAG_TICKS)
        .map(|(f, _)| f)
        .unwrap_or(start);
    end - start
}

/// Floor a tick, rounding up instead when it sits within 1e-6 below the next
/// integer. Relocation converts ticks to frames and back; without this the
/// accumulated error can move a queued interval start just below the tick it
/// was meant to begin at.
fn coarse_grain_tick(tick: f64) -> f64 {
    if tick.ceil() - tick > 0.0 && tick.ceil() - tick < 1e-6 {
        tick.floor() + 1.0
    } else {
        tick.floor()
    }
}

/// Derive the absolute start frame of a queued note from its tick position
/// and accumulated timing offset.
fn compute_note_start(grid: &TempoGrid, note: &mut Note) {
    if let Ok((frame, _)) = grid.frame_from_tick(note.position.max(0) as f64) {
        note.note_start = frame + note.humanize_delay;
    }
}

impl EngineInner {
    fn pos(&self, cursor: Cursor) -> &TransportPosition {
        match cursor {
            Cursor::Playhead => &self.playhead,
            Cursor::Queuing => &self.queuing,
        }
    }

    fn pos_mut(&mut self, cursor: Cursor) -> &mut TransportPosition {
        match cursor {
            Cursor::Playhead => &mut self.playhead,
            Cursor::Queuing => &mut self.queuing,
        }
    }

    fn sample_rate(&self) -> u32 {
        self.driver.as_ref().map(|d| d.sample_rate()).unwrap_or(0)
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
        self.events.send(EventKind::State, state as i32);
    }

    /// Snapshot of the tempo map for tick/frame conversion.
    ///
    /// With the timeline active the gaps before its first marker are filled
    /// with the pending user BPM, which is stable across marker crossings;
    /// using the transport BPM there would rewrite the frame axis of already
    /// traversed columns each time a marker is crossed. With the timeline
    /// inactive a single segment at the transport BPM covers everything.
    fn grid(&self) -> Result<TempoGrid, EngineError> {
        let song = self.song.as_ref().ok_or(EngineError::NoSong)?;
        if song.timeline_active && !song.timeline.is_empty() {
            TempoGrid::new(song, self.sample_rate(), self.next_bpm)
        } else {
            TempoGrid::uniform(self.sample_rate(), self.playhead.bpm, song.resolution)
        }
    }

    /// The tempo in effect at `column`, by priority: external timebase
    /// master (Song mode), timeline marker (Song mode), pending user BPM.
    fn bpm_at_column(&self, column: i32) -> f32 {
        let song = match self.song.as_ref() {
            Some(song) => song,
            None => {
                log::warn!("no song set yet");
                return MIN_BPM;
            }
        };

        let mut bpm = self.playhead.bpm;
        let slave = self
            .driver
            .as_ref()
            .map(|d| d.timebase() == Timebase::Slave)
            .unwrap_or(false);

        if slave && song.mode == Mode::Song {
            // The master tempo only depends on the external application and
            // is never stored in the song.
            if let Some(master) = self.external_bpm {
                if !master.is_nan() && bpm != master {
                    bpm = master;
                }
            }
        } else if song.timeline_active && song.mode == Mode::Song {
            match song.timeline.tempo_at_column(column) {
                Some(timeline_bpm) => bpm = timeline_bpm,
                None => bpm = self.next_bpm,
            }
        } else if self.next_bpm != bpm {
            // Change in speed due to user interaction.
            bpm = self.next_bpm;
        }
        bpm
    }

    fn update_bpm_and_tick_size(&mut self, cursor: Cursor) {
        if !matches!(self.state, State::Playing | State::Ready | State::Testing) {
            return;
        }
        let resolution = match self.song.as_ref() {
            Some(song) => song.resolution,
            None => return,
        };
        let sample_rate = self.sample_rate();

        let old_bpm = self.pos(cursor).bpm;
        let new_bpm = self.bpm_at_column(self.pos(cursor).column);
        if new_bpm != old_bpm {
            self.pos_mut(cursor).bpm = new_bpm;
            self.events.send(EventKind::TempoChanged, 0);
        }

        let old_tick_size = self.pos(cursor).tick_size;
        let new_tick_size = TempoGrid::tick_size(sample_rate, new_bpm, resolution) as f32;
        if new_tick_size == old_tick_size {
            // Nothing changed, avoid recomputing.
            return;
        }
        if new_tick_size == 0.0 {
            log::error!(
                "[{}] tick size collapsed to zero (bpm {}, sample rate {})",
                self.pos(cursor).label(),
                new_bpm,
                sample_rate
            );
            self.events.send(EventKind::Error, ERROR_TICK_SIZE_ZERO);
            return;
        }

        // The look-ahead depends on the tempo through both its tick and
        // frame components; drop the cached factor so the next cycle
        // computes a fresh one.
        {
            let pos = self.pos_mut(cursor);
            pos.last_lead_lag_factor = 0;
            pos.tick_size = new_tick_size;
        }

        self.recompute_offsets_on_bpm_change(cursor);
    }

    /// After a tick-size change the frames since transport origin mean a
    /// different tick; shift the frame axis and, when a look-ahead is in
    /// flight, the queuing tick axis, so that neither position nor queued
    /// coverage jumps.
    fn recompute_offsets_on_bpm_change(&mut self, cursor: Cursor) {
        let grid = match self.grid() {
            Ok(grid) => grid,
            Err(e) => {
                log::warn!("skipping transport offset update: {}", e);
                return;
            }
        };
        let last_tick_end = self.last_tick_end;
        let lookahead_applied = self.lookahead_applied;

        let pos = self.pos_mut(cursor);
        let (new_frame, mismatch) = match grid.frame_from_tick(pos.tick) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("[{}] offset update failed: {}", pos.label(), e);
                return;
            }
        };
        pos.tick_mismatch = mismatch;
        pos.frame_offset_tempo += new_frame - pos.frame;

        if lookahead_applied {
            let new_lookahead = lead_lag_frames(&grid, pos.tick) + MAX_TIME_HUMANIZE + 1;
            if let Ok(tick) = grid.tick_from_frame(new_frame + new_lookahead) {
                let new_tick_end = tick + pos.tick_mismatch;
                // Reassigned, not accumulated: the queued coverage always
                // ends at `last_tick_end` on the pre-change axis, so the
                // offset is the full distance to the new axis.
                pos.tick_offset_queuing = new_tick_end - last_tick_end;
            }
        }

        if pos.frame != new_frame {
            pos.frame = new_frame;
        }

        self.handle_tempo_change();
    }

    fn update_transport_position(&mut self, tick: f64, frame: i64, cursor: Cursor) {
        let mode = match self.song.as_ref() {
            Some(song) => song.mode,
            None => return,
        };
        match mode {
            Mode::Song => self.update_song_transport_position(tick, frame, cursor),
            Mode::Pattern => self.update_pattern_transport_position(tick, frame, cursor),
        }
        self.update_bpm_and_tick_size(cursor);
    }

    fn update_pattern_transport_position(&mut self, tick: f64, frame: i64, cursor: Cursor) {
        let stacked = self
            .song
            .as_ref()
            .map(|s| s.pattern_mode == PatternMode::Stacked)
            .unwrap_or(false);

        let pos = self.pos_mut(cursor);
        pos.tick = tick;
        pos.frame = frame;

        let pattern_start = pos.pattern_start_tick as f64;
        let pattern_size = pos.pattern_size.max(1);
        if tick >= pattern_start + pattern_size as f64 || tick < pattern_start {
            // Transport went past the end of the pattern, or pattern mode
            // was just activated.
            pos.pattern_start_tick +=
                ((tick - pattern_start) / pattern_size as f64).floor() as i64 * pattern_size;

            // In stacked mode the playing patterns only swap when the
            // original pattern loops back to its beginning, so every
            // pattern starts fresh. In selected mode the change arrives
            // asynchronously through user interaction.
            if stacked {
                self.update_playing_patterns_pos(cursor);
            }
        }

        let pos = self.pos_mut(cursor);
        let size = pos.pattern_size.max(1);
        let mut pattern_tick = tick.floor() as i64 - pos.pattern_start_tick;
        if pattern_tick > size {
            pattern_tick %= size;
        }
        pos.pattern_tick_position = pattern_tick;
    }

    fn update_song_transport_position(&mut self, tick: f64, frame: i64, cursor: Cursor) {
        {
            let pos = self.pos_mut(cursor);
            pos.tick = tick;
            pos.frame = frame;
        }
        if tick < 0.0 {
            log::error!(
                "[{}] provided tick [{}] is negative",
                self.pos(cursor).label(),
                tick
            );
            return;
        }

        let song = match self.song.as_ref() {
            Some(song) => song,
            None => return,
        };
        let song_size = self.song_size_ticks;

        let (new_column, pattern_start_tick, pattern_tick_position);
        if song.pattern_groups.is_empty() {
            // There are no patterns in the song.
            new_column = 0;
            pattern_start_tick = 0;
            pattern_tick_position = 0;
        } else {
            let floor_tick = tick.floor() as i64;
            match song.column_for_tick(floor_tick, song.is_looping()) {
                Some((column, start)) => {
                    new_column = column;
                    pattern_start_tick = start;
                    // The tick keeps increasing while the start tick is only
                    // defined within one repetition; fold the loops back in.
                    pattern_tick_position = if tick >= song_size && song_size != 0.0 {
                        (floor_tick - start).rem_euclid(song_size as i64)
                    } else {
                        floor_tick - start
                    };
                }
                None => {
                    // Transport ran past the end without looping. The wrap
                    // below makes the position regress, which the queuing
                    // loop detects as the end of the song.
                    new_column = -1;
                    pattern_start_tick = 0;
                    pattern_tick_position = if song_size != 0.0 {
                        (floor_tick as f64 % song_size) as i64
                    } else {
                        floor_tick
                    };
                }
            }
        }

        let pos = self.pos_mut(cursor);
        pos.pattern_start_tick = pattern_start_tick;
        pos.pattern_tick_position = pattern_tick_position;
        if pos.column != new_column {
            pos.column = new_column;
            self.update_playing_patterns_pos(cursor);
        }
    }

    fn update_playing_patterns(&mut self) {
        self.update_playing_patterns_pos(Cursor::Playhead);
        self.update_playing_patterns_pos(Cursor::Queuing);
    }

    /// Rebuild the playing-pattern set of one cursor according to the mode
    /// matrix (Song, Pattern/Selected, Pattern/Stacked).
    fn update_playing_patterns_pos(&mut self, cursor: Cursor) {
        let (mode, pattern_mode, selected, groups_len) = match self.song.as_ref() {
            Some(song) => (
                song.mode,
                song.pattern_mode,
                song.selected_pattern,
                song.pattern_groups.len(),
            ),
            None => return,
        };

        match (mode, pattern_mode) {
            (Mode::Song, _) => {
                let prev_len = self.pos(cursor).playing_patterns.len();

                if groups_len == 0 {
                    // No patterns in the current song.
                    self.pos_mut(cursor).playing_patterns.clear();
                    if prev_len > 0 {
                        self.events.send(EventKind::PlayingPatternsChanged, 0);
                    }
                } else {
                    let mut column = self.pos(cursor).column.max(0);
                    if column as usize >= groups_len {
                        log::error!(
                            "column [{}] exceeds allowed range [0,{}], using 0 as fallback",
                            column,
                            groups_len - 1
                        );
                        column = 0;
                    }
                    let new_patterns = {
                        let song = self.song.as_ref().unwrap();
                        let mut patterns = Vec::new();
                        for &id in &song.pattern_groups[column as usize] {
                            song.flatten_virtual_patterns(id, &mut patterns);
                        }
                        patterns
                    };
                    // The GUI just moves along the transport position; the
                    // event is omitted when passing from one empty column to
                    // the next.
                    let emit = cursor == Cursor::Playhead
                        && prev_len != 0
                        && !new_patterns.is_empty();
                    self.pos_mut(cursor).playing_patterns = new_patterns;
                    if emit {
                        self.events.send(EventKind::PlayingPatternsChanged, 0);
                    }
                }
            }
            (Mode::Pattern, PatternMode::Selected) => {
                if let Some(selected) = selected {
                    let unchanged = {
                        let playing = &self.pos(cursor).playing_patterns;
                        playing.len() == 1 && playing[0] == selected
                    };
                    if !unchanged {
                        let new_patterns = {
                            let song = self.song.as_ref().unwrap();
                            let mut patterns = Vec::new();
                            song.flatten_virtual_patterns(selected, &mut patterns);
                            patterns
                        };
                        self.pos_mut(cursor).playing_patterns = new_patterns;
                        if cursor == Cursor::Playhead {
                            self.events.send(EventKind::PlayingPatternsChanged, 0);
                        }
                    }
                }
            }
            (Mode::Pattern, PatternMode::Stacked) => {
                let next = std::mem::take(&mut self.pos_mut(cursor).next_patterns);
                for id in &next {
                    let flat = {
                        let song = self.song.as_ref().unwrap();
                        let mut flat = Vec::new();
                        song.flatten_virtual_patterns(*id, &mut flat);
                        flat
                    };
                    let pos = self.pos_mut(cursor);
                    if pos.playing_patterns.contains(id) {
                        // Already present: toggled off, along with its
                        // flattened virtual patterns.
                        pos.playing_patterns.retain(|p| !flat.contains(p));
                    } else {
                        for p in flat {
                            if !pos.playing_patterns.contains(&p) {
                                pos.playing_patterns.push(p);
                            }
                        }
                    }
                    if cursor == Cursor::Playhead {
                        self.events.send(EventKind::PlayingPatternsChanged, 0);
                    }
                }
            }
        }

        let pattern_size = {
            let song = self.song.as_ref().unwrap();
            let playing = &self.pos(cursor).playing_patterns;
            if playing.is_empty() {
                MAX_NOTES
            } else {
                song.longest_pattern_length(playing)
            }
        };
        self.pos_mut(cursor).pattern_size = pattern_size;
    }

    /// The tick interval `[tick_start, tick_end)` to queue for a buffer of
    /// `frames`, and the lead-lag factor in frames.
    fn compute_tick_interval(&mut self, grid: &TempoGrid, frames: u32) -> Option<(f64, f64, i64)> {
        let frame_base = if self.state == State::Ready {
            // Playback is stopped; pretend transport is still rolling using
            // the realtime frame so MIDI input keeps flowing, disregarding
            // timeline tempo changes.
            self.realtime_frame
        } else {
            self.playhead.frame
        };

        let mut lead_lag = lead_lag_frames(grid, self.playhead.tick);
        // With tempo markers present the look-ahead is not constant: moved
        // cycle by cycle across a marker it would produce holes or overlaps
        // in the queued tick coverage. Stick to a single factor, invalidated
        // whenever the tempo changes.
        if self.playhead.last_lead_lag_factor != 0 {
            if self.playhead.last_lead_lag_factor != lead_lag {
                lead_lag = self.playhead.last_lead_lag_factor;
            }
        } else {
            self.playhead.last_lead_lag_factor = lead_lag;
        }

        let lookahead = lead_lag + MAX_TIME_HUMANIZE + 1;
        let frame_end = frame_base + lookahead + frames as i64;
        let frame_start = if self.lookahead_applied {
            // Successive windows tile without overlap.
            frame_base + lookahead
        } else {
            frame_base
        };

        let tick_start = grid.tick_from_frame(frame_start).ok()? + self.playhead.tick_mismatch
            - self.playhead.tick_offset_queuing;
        let tick_end =
            grid.tick_from_frame(frame_end).ok()? - self.playhead.tick_offset_queuing;
        Some((tick_start, tick_end, lead_lag))
    }

    /// Advance the queuing cursor across the next tick interval, pushing
    /// copies of every due note into the song queue.
    fn update_note_queue(&mut self, frames: u32) -> NoteQueueOutcome {
        let grid = match self.grid() {
            Ok(grid) => grid,
            Err(e) => {
                log::warn!("skipping note queue update: {}", e);
                return NoteQueueOutcome::Continue;
            }
        };
        let (tick_start_f, tick_end_f, lead_lag) = match self.compute_tick_interval(&grid, frames)
        {
            Some(interval) => interval,
            None => return NoteQueueOutcome::Continue,
        };

        // MIDI events get merged into the song queue as well.
        while let Some(front) = self.midi_queue.front() {
            if front.position as f64 > coarse_grain_tick(tick_end_f) {
                break;
            }
            let mut note = self.midi_queue.pop_front().unwrap();
            compute_note_start(&grid, &mut note);
            self.song_queue.push(note);
        }

        if !matches!(self.state, State::Playing | State::Testing) {
            return NoteQueueOutcome::Continue;
        }

        // The interval is computed every cycle, but the look-ahead only
        // counts as consumed once the queuing cursor traverses it.
        if !self.lookahead_applied {
            self.lookahead_applied = true;
        }

        let tick_start = coarse_grain_tick(tick_start_f) as i64;
        let tick_end = coarse_grain_tick(tick_end_f) as i64;
        self.last_tick_end = tick_end_f;

        for tick in tick_start..tick_end {
            let (mode, loop_enabled, groups_empty) = {
                let song = self.song.as_ref().unwrap();
                (song.mode, song.is_looping(), song.pattern_groups.is_empty())
            };

            // Advance the queuing cursor to this tick.
            match mode {
                Mode::Song => {
                    let previous =
                        self.queuing.pattern_start_tick + self.queuing.pattern_tick_position;
                    let (frame, mismatch) = match grid.frame_from_tick(tick as f64) {
                        Ok(result) => result,
                        Err(_) => continue,
                    };
                    self.queuing.tick_mismatch = mismatch;
                    self.update_song_transport_position(tick as f64, frame, Cursor::Queuing);

                    let current =
                        self.queuing.pattern_start_tick + self.queuing.pattern_tick_position;
                    if !loop_enabled && (previous > current || groups_empty) {
                        log::info!("end of song reached");
                        if let Some(midi) = self.midi_out.as_mut() {
                            if midi.active() {
                                midi.all_notes_off();
                            }
                        }
                        return NoteQueueOutcome::EndOfSong;
                    }
                }
                Mode::Pattern => {
                    let (frame, mismatch) = match grid.frame_from_tick(tick as f64) {
                        Ok(result) => result,
                        Err(_) => continue,
                    };
                    self.queuing.tick_mismatch = mismatch;
                    self.update_pattern_transport_position(tick as f64, frame, Cursor::Queuing);
                }
            }

            // Metronome, at a fixed rate. The beat event fires regardless of
            // whether the click instrument is audible.
            let metronome_tick = if groups_empty {
                tick
            } else {
                self.queuing.pattern_tick_position
            };
            if metronome_tick % METRONOME_DIVISOR == 0 {
                // The first tick of a pattern gets the accented click.
                let (pitch, velocity, accent) = if metronome_tick == 0 {
                    (3.0, 1.0, 1)
                } else {
                    (0.0, 0.8, 0)
                };
                self.events.send(EventKind::Metronome, accent);
                if self.metronome_enabled {
                    self.metronome_instrument.volume = self.metronome_volume;
                    let mut click =
                        Note::new(METRONOME_INSTRUMENT_ID, tick, velocity, 0.0, pitch);
                    compute_note_start(&grid, &mut click);
                    self.song_queue.push(click);
                }
            }

            if mode == Mode::Song && groups_empty {
                // No patterns in the song; let transport roll so the
                // metronome can keep clicking in case patterns get added.
                if self.metronome_enabled {
                    continue;
                } else {
                    return NoteQueueOutcome::Continue;
                }
            }

            // Enqueue all pattern notes falling on this tick.
            let pattern_tick = self.queuing.pattern_tick_position;
            let queuing_frame = self.queuing.frame;
            let column = self.queuing.column;
            let playing = self.queuing.playing_patterns.clone();

            let song = self.song.as_ref().unwrap();
            let swing = song.swing_factor;
            let humanize_time = song.humanize_time;
            for id in playing {
                let pattern = match song.patterns.get(id) {
                    Some(pattern) => pattern,
                    None => continue,
                };
                for note in pattern.notes_at(pattern_tick) {
                    // Offset in frames: sum of swing, humanized timing and
                    // lead-lag.
                    let mut offset: i64 = 0;

                    // Swing delays the upbeat 16th notes (not upbeat 8ths).
                    if pattern_tick % (MAX_NOTES / 16) == 0
                        && pattern_tick % (MAX_NOTES / 8) != 0
                        && swing > 0.0
                    {
                        // With the timeline active the tick size may change
                        // at any point, so the 16th-note span in frames has
                        // to be evaluated at this transport position.
                        let swung = grid
                            .frame_from_tick(tick as f64 + MAX_NOTES as f64 / 32.0)
                            .map(|(f, _)| f)
                            .unwrap_or(0);
                        let plain = grid
                            .frame_from_tick(tick as f64)
                            .map(|(f, _)| f)
                            .unwrap_or(0);
                        offset += (swung as f64 * swing as f64) as i64 - plain;
                    }

                    // Gaussian timing jitter; the song factor also scales
                    // the variance.
                    if humanize_time != 0.0 {
                        offset += (gaussian(&mut self.rng, 0.3)
                            * humanize_time
                            * MAX_TIME_HUMANIZE as f32) as i64;
                    }

                    // Constant per-note lead or lag.
                    offset += (note.lead_lag as f64 * lead_lag as f64) as i64;

                    // No note may start before the beginning of the song.
                    if queuing_frame + offset < 0 {
                        offset = -queuing_frame;
                    }
                    offset = offset.clamp(-MAX_TIME_HUMANIZE, MAX_TIME_HUMANIZE);

                    let mut copy = note.clone();
                    copy.humanize_delay = offset;
                    copy.position = tick;
                    // After position and delay are final.
                    compute_note_start(&grid, &mut copy);

                    if mode == Mode::Song {
                        let automation_pos =
                            column as f32 + (copy.position % MAX_NOTES) as f32 / MAX_NOTES as f32;
                        copy.velocity =
                            note.velocity * song.velocity_automation.value_at(automation_pos);
                    }
                    self.song_queue.push(copy);
                }
            }
        }

        NoteQueueOutcome::Continue
    }

    /// Pop every note whose start frame falls into the current buffer and
    /// hand it to the sampler.
    fn process_play_notes(&mut self, frames: u32) {
        let frame = if matches!(self.state, State::Playing | State::Testing) {
            self.playhead.frame
        } else {
            // Playback is stopped; keep playing realtime notes from MIDI
            // input or the virtual keyboard against the realtime frame.
            self.realtime_frame
        };

        loop {
            match self.song_queue.peek() {
                Some(note) if note.note_start < frame + frames as i64 => {}
                _ => break,
            }
            let mut note = self.song_queue.pop().unwrap();

            // Probability gate.
            if note.probability != 1.0 && note.probability < self.rng.gen::<f32>() {
                continue;
            }

            let humanize_velocity = self
                .song
                .as_ref()
                .map(|s| s.humanize_velocity)
                .unwrap_or(0.0);
            if humanize_velocity != 0.0 {
                let random = humanize_velocity * gaussian(&mut self.rng, 0.2);
                note.velocity =
                    (note.velocity + random - humanize_velocity / 2.0).clamp(0.0, 1.0);
            }

            let mut pitch_offset = 0.0;
            let mut random_pitch = 0.0;
            let mut stop_notes = false;
            let mut known_instrument = false;
            {
                let instrument = if note.instrument_id == METRONOME_INSTRUMENT_ID {
                    Some(&self.metronome_instrument)
                } else {
                    self.song
                        .as_ref()
                        .and_then(|s| s.instrument(note.instrument_id))
                };
                if let Some(instrument) = instrument {
                    pitch_offset = instrument.pitch_offset;
                    random_pitch = instrument.random_pitch_factor;
                    stop_notes = instrument.stop_notes;
                    known_instrument = !instrument.is_metronome;
                }
            }

            let mut pitch = note.pitch + pitch_offset;
            if random_pitch != 0.0 {
                pitch += gaussian(&mut self.rng, 0.4) * random_pitch;
            }
            note.pitch = pitch;

            // Stop-note instruments get a note-off right before each
            // trigger. The sampler copies internally; our copy ends here.
            if stop_notes && !note.note_off {
                let off = Note::note_off_for(note.instrument_id);
                self.sampler.note_on(&off);
            }

            self.sampler.note_on(&note);
            if known_instrument {
                self.events.send(EventKind::NoteOn, note.instrument_id);
            }
        }
    }

    /// Render the voice sources and sum them into the driver buffers.
    fn process_audio(&mut self, frames: u32, output: Option<&SharedOutput>) {
        self.process_play_notes(frames);

        let song = match self.song.as_ref() {
            Some(song) => song,
            None => return,
        };
        let n = frames as usize;
        self.sampler.process(n, song);
        self.synth.process(n);

        let output = match output {
            Some(output) => output,
            None => return,
        };
        let mut buffers = output.lock();
        let buffers = &mut *buffers;
        {
            let sampler_l = self.sampler.main_out_l();
            let sampler_r = self.sampler.main_out_r();
            let synth_l = self.synth.out_l();
            let synth_r = self.synth.out_r();
            for i in 0..n {
                buffers.left[i] += sampler_l[i] + synth_l[i];
                buffers.right[i] += sampler_r[i] + synth_r[i];
            }
        }

        for effect in self.effects.iter_mut() {
            effect.process(&mut buffers.left[..n], &mut buffers.right[..n]);
        }

        for i in 0..n {
            if buffers.left[i] > self.master_peak_l {
                self.master_peak_l = buffers.left[i];
            }
            if buffers.right[i] > self.master_peak_r {
                self.master_peak_r = buffers.right[i];
            }
        }
    }

    /// Advance the playhead by one buffer, frame-first.
    fn increment_transport_position(&mut self, frames: u32) {
        if self.song.is_none() {
            return;
        }
        let grid = match self.grid() {
            Ok(grid) => grid,
            Err(_) => return,
        };
        let new_frame = self.playhead.frame + frames as i64;
        let new_tick = match grid.tick_from_frame(new_frame) {
            Ok(tick) => tick,
            Err(_) => return,
        };
        self.playhead.tick_mismatch = 0.0;
        self.update_transport_position(new_tick, new_frame, Cursor::Playhead);
        // The queuing cursor advances in update_note_queue.
    }

    fn start_playback(&mut self) {
        if self.state != State::Ready {
            log::error!("engine is not in the ready state but {:?}", self.state);
            return;
        }
        self.set_state(State::Playing);
    }

    fn stop_playback(&mut self) {
        if self.state != State::Playing {
            log::error!("engine is not in the playing state but {:?}", self.state);
            return;
        }
        self.set_state(State::Ready);
    }

    /// Request transport start; honored at the next callback boundary, or
    /// delegated to the external transport master.
    fn start_transport(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            if driver.has_transport_control() {
                driver.start_transport();
                return;
            }
        }
        self.next_state = State::Playing;
    }

    fn stop_transport(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            if driver.has_transport_control() {
                driver.stop_transport();
                return;
            }
        }
        self.next_state = State::Ready;
    }

    fn clear_note_queues(&mut self) {
        self.song_queue.clear();
        self.midi_queue.clear();
    }

    fn reset(&mut self) {
        self.clear_note_queues();
        self.master_peak_l = 0.0;
        self.master_peak_r = 0.0;
        self.last_tick_end = 0.0;
        self.lookahead_applied = false;
        self.playhead.reset();
        self.queuing.reset();
        self.update_bpm_and_tick_size(Cursor::Playhead);
        self.update_bpm_and_tick_size(Cursor::Queuing);
        self.update_playing_patterns();
    }

    fn reset_offsets(&mut self) {
        self.clear_note_queues();
        self.last_tick_end = 0.0;
        self.lookahead_applied = false;
        for cursor in [Cursor::Playhead, Cursor::Queuing] {
            let pos = self.pos_mut(cursor);
            pos.frame_offset_tempo = 0;
            pos.tick_offset_queuing = 0.0;
            pos.tick_offset_song_size = 0.0;
            pos.last_lead_lag_factor = 0;
        }
    }

    /// Relocate to `tick`. With an external transport master and
    /// `broadcast`, the relocation is delegated to it and the new frame
    /// arrives in a later cycle.
    fn locate_inner(&mut self, tick: f64, broadcast: bool) -> Result<(), EngineError> {
        let external = self
            .driver
            .as_ref()
            .map(|d| d.has_transport_control())
            .unwrap_or(false);
        if external && broadcast {
            let grid = self.grid()?;
            let (frame, _) = grid.frame_from_tick(tick)?;
            if let Some(driver) = self.driver.as_mut() {
                driver.locate_transport(frame);
            }
            return Ok(());
        }

        let grid = self.grid()?;
        self.reset_offsets();
        self.last_tick_end = tick;
        let (frame, mismatch) = grid.frame_from_tick(tick)?;
        self.playhead.tick_mismatch = mismatch;

        self.update_transport_position(tick, frame, Cursor::Playhead);
        let playhead = self.playhead.clone();
        self.queuing.set(&playhead);

        self.handle_tempo_change();
        self.events.send(EventKind::Relocation, 0);
        Ok(())
    }

    /// Relocate to a frame reported by an external transport master.
    fn locate_to_frame_inner(&mut self, frame: i64) -> Result<(), EngineError> {
        let grid = self.grid()?;
        self.reset_offsets();

        let mut new_tick = grid.tick_from_frame(frame)?;
        // The tick mismatch was lost when the sought position went to the
        // master as plain frames; round near-integer ticks up so the
        // relocation does not glitch.
        if new_tick.fract() >= 0.97 {
            log::info!(
                "computed tick [{}] rounded to [{}] to avoid glitches",
                new_tick,
                new_tick.round()
            );
            new_tick = new_tick.round();
        }
        self.last_tick_end = new_tick;

        // Reconvert so tick and frame stay consistent through the mismatch.
        let (new_frame, mismatch) = grid.frame_from_tick(new_tick)?;
        self.playhead.tick_mismatch = mismatch;

        self.update_transport_position(new_tick, new_frame, Cursor::Playhead);
        let playhead = self.playhead.clone();
        self.queuing.set(&playhead);

        self.handle_tempo_change();
        self.events.send(EventKind::Relocation, 0);
        Ok(())
    }

    /// Poll the driver's external transport once per cycle and absorb
    /// relocations and the master tempo.
    fn pull_external_transport(&mut self) {
        let pull = match self.driver.as_mut() {
            Some(driver) => driver.pull_transport(),
            None => return,
        };
        let Some(pull) = pull else { return };
        self.external_bpm = pull.bpm;
        if pull.frame != self.playhead.frame {
            if let Err(e) = self.locate_to_frame_inner(pull.frame) {
                log::warn!("external relocation to frame {} failed: {}", pull.frame, e);
            }
        }
    }

    /// Tick size changed: every queued note now starts at a different frame.
    fn handle_tempo_change(&mut self) {
        if !self.song_queue.is_empty() || !self.midi_queue.is_empty() {
            if let Ok(grid) = self.grid() {
                let mut notes = self.song_queue.drain();
                for note in &mut notes {
                    compute_note_start(&grid, note);
                }
                for note in notes {
                    self.song_queue.push(note);
                }
                for note in self.midi_queue.iter_mut() {
                    compute_note_start(&grid, note);
                }
            }
        }
        self.sampler.handle_timeline_or_tempo_change();
    }

    /// The song was resized: move every queued note by the (floored)
    /// song-size tick offset, never below tick 0.
    fn handle_song_size_change(&mut self) {
        let tick_offset = self.playhead.tick_offset_song_size.floor() as i64;
        if !self.song_queue.is_empty() || !self.midi_queue.is_empty() {
            if let Ok(grid) = self.grid() {
                let mut notes = self.song_queue.drain();
                for note in &mut notes {
                    note.position = (note.position + tick_offset).max(0);
                    compute_note_start(&grid, note);
                }
                for note in notes {
                    self.song_queue.push(note);
                }
                for note in self.midi_queue.iter_mut() {
                    note.position = (note.position + tick_offset).max(0);
                    compute_note_start(&grid, note);
                }
            }
        }
        self.sampler.handle_song_size_change();
    }

    /// The timeline's structure changed. Even when the BPM at the cursor is
    /// the same, being at tick X with markers before X differs from being
    /// there without them, so the offsets are recomputed regardless.
    fn handle_timeline_change(&mut self) {
        let old_tick_size = self.playhead.tick_size;
        self.update_bpm_and_tick_size(Cursor::Playhead);
        self.update_bpm_and_tick_size(Cursor::Queuing);

        if old_tick_size == self.playhead.tick_size {
            self.recompute_offsets_on_bpm_change(Cursor::Playhead);
        }
    }

    fn end_of_song_reached(&mut self) {
        self.stop_transport();
        if self.state == State::Playing {
            self.stop_playback();
        }
        if let Err(e) = self.locate_inner(0.0, true) {
            log::warn!("relocation to the song start failed: {}", e);
        }
        self.events.send(EventKind::SongSizeChanged, 0);
    }

    /// Reconcile both cursors and the note queues after the song's length
    /// changed under a playing transport.
    ///
    /// The perceived position is the pair (column, pattern tick position):
    /// editing any column other than the playing one must leave it intact,
    /// looped or not.
    fn update_song_size_inner(&mut self) {
        let (mode, loop_enabled, new_song_size, groups_len) = match self.song.as_ref() {
            Some(song) => (
                song.mode,
                song.is_looping(),
                song.length_in_ticks() as f64,
                song.pattern_groups.len(),
            ),
            None => {
                log::error!("no song set yet");
                return;
            }
        };

        // Playing patterns may have been resized regardless of mode.
        for cursor in [Cursor::Playhead, Cursor::Queuing] {
            let pattern_size = {
                let song = self.song.as_ref().unwrap();
                let playing = &self.pos(cursor).playing_patterns;
                if playing.is_empty() {
                    MAX_NOTES
                } else {
                    song.longest_pattern_length(playing)
                }
            };
            self.pos_mut(cursor).pattern_size = pattern_size;
        }

        if mode == Mode::Pattern {
            self.song_size_ticks = new_song_size;
            self.events.send(EventKind::SongSizeChanged, 0);
            return;
        }

        // A song is "empty" when it had or has no patterns at all.
        let empty_song = self.song_size_ticks == 0.0 || new_song_size == 0.0;

        // Strip the loop repetitions but keep their count; the column and
        // pattern start tick are only defined within one repetition.
        let (mut stripped_tick, repetitions) = if self.song_size_ticks != 0.0 {
            (
                self.playhead.tick % self.song_size_ticks,
                (self.playhead.tick / self.song_size_ticks).floor(),
            )
        } else {
            (self.playhead.tick, 0.0)
        };

        let old_column = self.playhead.column;
        self.song_size_ticks = new_song_size;

        if old_column >= groups_len as i32 && !loop_enabled {
            // The old column exceeds the new song size.
            self.end_of_song_reached();
            return;
        }

        match self.song.as_ref().unwrap().tick_for_column(old_column) {
            Some(new_pattern_start) => {
                if new_pattern_start != self.playhead.pattern_start_tick && !empty_song {
                    // A pattern prior to the current one was toggled,
                    // enlarged or shrunk; compensate to keep the pattern
                    // tick position constant.
                    stripped_tick +=
                        (new_pattern_start - self.playhead.pattern_start_tick) as f64;
                }
            }
            None => {
                if !loop_enabled {
                    // Failsafe for the old column exceeding the song size.
                    self.end_of_song_reached();
                    return;
                }
            }
        }

        // Reincorporate the loop repetitions.
        let new_tick = stripped_tick + repetitions * new_song_size;
        let grid = match self.grid() {
            Ok(grid) => grid,
            Err(e) => {
                log::warn!("song size update without conversion grid: {}", e);
                return;
            }
        };
        let (new_frame, mismatch) = match grid.frame_from_tick(new_tick) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("song size update failed: {}", e);
                return;
            }
        };
        self.playhead.tick_mismatch = mismatch;

        let mut tick_offset = new_tick - self.playhead.tick;
        // The queued interval end is kept at full precision, so update it
        // before the rounding below.
        self.last_tick_end += tick_offset;
        // Rounding noise would spoil the flooring of the offset later on.
        tick_offset = (tick_offset * 1e8).round() * 1e-8;
        self.playhead.tick_offset_song_size = tick_offset;

        // Move the notes in flight along with the edit.
        self.handle_song_size_change();

        self.playhead.frame_offset_tempo += new_frame - self.playhead.frame;

        let old_tick_size = self.playhead.tick_size;
        self.update_transport_position(new_tick, new_frame, Cursor::Playhead);
        // The tempo most likely did not change, so the queuing offset was
        // not recomputed during the transport update; make sure it is.
        if old_tick_size == self.playhead.tick_size {
            self.recompute_offsets_on_bpm_change(Cursor::Playhead);
        }

        // Shift the queuing cursor by the same offset to keep both cursors
        // approximately in sync.
        let new_tick_queuing = self.queuing.tick + tick_offset;
        let queuing_conversion = grid.frame_from_tick(new_tick_queuing);
        let playhead = self.playhead.clone();
        self.queuing.set(&playhead);
        if let Ok((queuing_frame, queuing_mismatch)) = queuing_conversion {
            self.queuing.tick_mismatch = queuing_mismatch;
            self.update_transport_position(new_tick_queuing, queuing_frame, Cursor::Queuing);
        }

        self.update_playing_patterns();

        if self.queuing.column == -1 && !loop_enabled {
            self.end_of_song_reached();
            return;
        }

        self.events.send(EventKind::SongSizeChanged, 0);
    }

    fn set_next_bpm(&mut self, bpm: f32) {
        if bpm > MAX_BPM {
            log::warn!("bpm {} is too high, clamping to {}", bpm, MAX_BPM);
            self.next_bpm = MAX_BPM;
        } else if bpm < MIN_BPM {
            log::warn!("bpm {} is too low, clamping to {}", bpm, MIN_BPM);
            self.next_bpm = MIN_BPM;
        } else {
            self.next_bpm = bpm;
        }
    }
}

impl AudioEngine {
    /// Create an engine with the given collaborators. Returns the engine and
    /// the consumer side of its event channel.
    pub fn new(
        sampler: Box<dyn Sampler>,
        synth: Box<dyn Synth>,
        midi_out: Option<Box<dyn MidiOutput>>,
    ) -> (Arc<Self>, EventReceiver) {
        let (events, receiver) = event_channel(EVENT_CAPACITY);
        let inner = EngineInner {
            state: State::Initialized,
            next_state: State::Ready,
            song: None,
            playhead: TransportPosition::new("playhead"),
            queuing: TransportPosition::new("queuing"),
            song_queue: SongNoteQueue::new(),
            midi_queue: VecDeque::new(),
            song_size_ticks: 0.0,
            next_bpm: 120.0,
            external_bpm: None,
            last_tick_end: 0.0,
            lookahead_applied: false,
            realtime_frame: 0,
            master_peak_l: 0.0,
            master_peak_r: 0.0,
            metronome_enabled: false,
            metronome_volume: 0.5,
            metronome_instrument: Instrument::metronome(),
            driver: None,
            midi_out,
            sampler,
            synth,
            effects: Vec::new(),
            events: events.clone(),
            rng: SmallRng::from_entropy(),
        };
        let engine = Arc::new(Self {
            inner: Mutex::new(inner),
            output: Mutex::new(None),
            locker: Mutex::new(LockerRecord {
                locker: Locker::unknown(),
                thread: None,
            }),
            events,
            sample_rate: AtomicU32::new(0),
            offline_sink: AtomicBool::new(false),
            process_time_us: AtomicU32::new(0),
            max_process_time_us: AtomicU32::new(0),
        });
        (engine, receiver)
    }

    /// An engine wired to null collaborators.
    pub fn with_defaults() -> (Arc<Self>, EventReceiver) {
        Self::new(
            Box::<NullSampler>::default(),
            Box::<NullSynth>::default(),
            Some(Box::<NullMidiOutput>::default()),
        )
    }

    /// The callback handle drivers pull. Holds only a weak reference, so a
    /// late-running stream cannot keep the engine alive.
    pub fn process_callback(self: &Arc<Self>) -> Arc<dyn ProcessCallback> {
        Arc::new(EngineHandle {
            engine: Arc::downgrade(self),
        })
    }

    fn lock(&self, locker: Locker) -> MutexGuard<'_, EngineInner> {
        let guard = self.inner.lock();
        *self.locker.lock() = LockerRecord {
            locker,
            thread: Some(std::thread::current().id()),
        };
        guard
    }

    fn try_lock_for(&self, timeout: Duration, locker: Locker) -> Option<MutexGuard<'_, EngineInner>> {
        match self.inner.try_lock_for(timeout) {
            Some(guard) => {
                *self.locker.lock() = LockerRecord {
                    locker,
                    thread: Some(std::thread::current().id()),
                };
                Some(guard)
            }
            None => {
                let holder = *self.locker.lock();
                log::warn!(
                    "failed to lock the engine within {:?} at {}:{}; lock held by {}:{} ({}) on {:?}",
                    timeout,
                    locker.file,
                    locker.line,
                    holder.locker.file,
                    holder.locker.line,
                    holder.locker.context,
                    holder.thread,
                );
                None
            }
        }
    }

    /// Run `f` while holding the engine lock. For control-plane critical
    /// sections that must not interleave with the process callback.
    pub fn with_lock<R>(&self, locker: Locker, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock(locker);
        f()
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Snapshot of the playhead cursor.
    pub fn playhead(&self) -> TransportPosition {
        self.inner.lock().playhead.clone()
    }

    /// Snapshot of the queuing cursor.
    pub fn queuing_position(&self) -> TransportPosition {
        self.inner.lock().queuing.clone()
    }

    pub fn master_peaks(&self) -> (f32, f32) {
        let inner = self.inner.lock();
        (inner.master_peak_l, inner.master_peak_r)
    }

    /// Wall-clock seconds of playback since the last relocation, corrected
    /// for tempo-induced frame shifts.
    pub fn elapsed_time(&self) -> f32 {
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        if sample_rate == 0 {
            return 0.0;
        }
        let inner = self.inner.lock();
        (inner.playhead.frame - inner.playhead.frame_offset_tempo) as f32 / sample_rate as f32
    }

    /// Copy of the song note queue in dispatch order, for inspection.
    pub fn queued_notes(&self) -> Vec<Note> {
        let mut inner = self.lock(here!());
        let notes = inner.song_queue.drain();
        for note in &notes {
            inner.song_queue.push(note.clone());
        }
        notes
    }

    /// Install a driver by name: "cpal", "null" or "offline". Unknown names
    /// and start failures fall back to the null driver and surface through
    /// an `Error` event.
    pub fn start_driver(self: &Arc<Self>, name: &str, buffer_size: u32) -> Result<(), EngineError> {
        let driver = match self.create_driver(name) {
            Ok(driver) => driver,
            Err(e) => {
                log::error!(
                    "couldn't start audio driver [{}], falling back to the null driver: {}",
                    name,
                    e
                );
                let code = match e {
                    EngineError::DriverUnknown(_) => ERROR_DRIVER_UNKNOWN,
                    _ => ERROR_DRIVER_START_FAILED,
                };
                self.events.send(EventKind::Error, code);
                self.create_driver("null")?
            }
        };
        self.install_driver(driver, buffer_size)
    }

    fn create_driver(self: &Arc<Self>, name: &str) -> Result<Box<dyn AudioOutput>, EngineError> {
        log::info!("creating driver [{}]", name);
        let driver: Box<dyn AudioOutput> = match name {
            "cpal" => Box::new(CpalDriver::new(self.process_callback())?),
            "null" => Box::new(NullDriver::new(44100)),
            "offline" => Box::new(rd_audio::OfflineDriver::new(44100, self.process_callback())),
            _ => return Err(EngineError::DriverUnknown(name.into())),
        };
        Ok(driver)
    }

    /// Initialize, connect and install a driver instance. Transitions the
    /// engine to `Prepared` (or `Ready` when a song is already set).
    pub fn install_driver(
        &self,
        mut driver: Box<dyn AudioOutput>,
        buffer_size: u32,
    ) -> Result<(), EngineError> {
        {
            let inner = self.inner.lock();
            if inner.state != State::Initialized {
                log::error!("engine is not in the initialized state but {:?}", inner.state);
                return Err(EngineError::InvalidState(inner.state));
            }
        }

        driver.init(buffer_size)?;
        driver.connect()?;

        let mut inner = self.lock(here!());
        *self.output.lock() = Some(driver.output());
        self.sample_rate
            .store(driver.sample_rate(), Ordering::Relaxed);
        self.offline_sink
            .store(driver.is_offline(), Ordering::Relaxed);
        inner.driver = Some(driver);
        if let Some(midi) = inner.midi_out.as_mut() {
            if !midi.active() {
                midi.open();
            }
        }
        if inner.song.is_some() {
            inner.set_state(State::Ready);
        } else {
            inner.set_state(State::Prepared);
        }
        drop(inner);

        self.events.send(EventKind::DriverChanged, 0);
        Ok(())
    }

    /// Disconnect and drop the drivers; back to `Initialized`.
    pub fn stop_drivers(&self) {
        let mut inner = self.lock(here!());
        if inner.state == State::Playing {
            inner.stop_playback();
        }
        if !matches!(inner.state, State::Prepared | State::Ready) {
            log::error!(
                "engine is not in the prepared or ready state but {:?}",
                inner.state
            );
            return;
        }
        inner.set_state(State::Initialized);
        if let Some(midi) = inner.midi_out.as_mut() {
            midi.close();
        }
        if let Some(mut driver) = inner.driver.take() {
            driver.disconnect();
        }
        drop(inner);
        *self.output.lock() = None;
        self.sample_rate.store(0, Ordering::Relaxed);
        self.offline_sink.store(false, Ordering::Relaxed);
    }

    /// Tear the engine down completely.
    pub fn shutdown(&self) {
        if matches!(self.state(), State::Prepared | State::Ready | State::Playing) {
            self.stop_drivers();
        }
        let mut inner = self.lock(here!());
        inner.sampler.stop_playing_notes();
        inner.clear_note_queues();
        inner.playhead.reset();
        inner.queuing.reset();
        inner.set_state(State::Uninitialized);
    }

    /// Load a song; requires `Prepared`. Ends `Ready`, located at tick 0.
    pub fn set_song(&self, song: Song) -> Result<(), EngineError> {
        log::info!("set song: {}", song.name);
        let mut inner = self.lock(here!());
        if inner.state != State::Prepared {
            log::error!("engine is not in the prepared state but {:?}", inner.state);
            return Err(EngineError::InvalidState(inner.state));
        }
        inner.set_next_bpm(song.bpm);
        inner.song_size_ticks = song.length_in_ticks() as f64;
        inner.song = Some(song);
        inner.reset();
        inner.set_state(State::Ready);
        inner.locate_inner(0.0, false)
    }

    /// Unload the current song; back to `Prepared`.
    pub fn remove_song(&self) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        if inner.state == State::Playing {
            inner.stop_transport();
            inner.stop_playback();
        }
        if inner.state != State::Ready {
            log::error!("engine is not in the ready state but {:?}", inner.state);
            return Err(EngineError::InvalidState(inner.state));
        }
        inner.sampler.stop_playing_notes();
        inner.song = None;
        inner.reset();
        inner.set_state(State::Prepared);
        Ok(())
    }

    /// Request playback; takes effect at the next callback boundary.
    pub fn play(&self) {
        self.lock(here!()).start_transport();
    }

    /// Request stop; takes effect at the next callback boundary, never
    /// interrupting an in-flight buffer.
    pub fn stop(&self) {
        self.lock(here!()).stop_transport();
    }

    /// Relocate transport to `tick`.
    pub fn locate(&self, tick: f64) -> Result<(), EngineError> {
        self.lock(here!()).locate_inner(tick, true)
    }

    /// Relocate transport to an absolute frame.
    pub fn locate_to_frame(&self, frame: i64) -> Result<(), EngineError> {
        self.lock(here!()).locate_to_frame_inner(frame)
    }

    pub fn next_bpm(&self) -> f32 {
        self.inner.lock().next_bpm
    }

    /// Set the pending tempo, clamped to `[MIN_BPM, MAX_BPM]`.
    pub fn set_next_bpm(&self, bpm: f32) {
        self.lock(here!()).set_next_bpm(bpm);
    }

    /// Append an externally played note (MIDI input, virtual keyboard) to
    /// the realtime queue.
    pub fn queue_note(&self, note: Note) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        if !matches!(
            inner.state,
            State::Ready | State::Playing | State::Testing
        ) {
            log::error!(
                "engine is not in the ready, playing or testing state but {:?}",
                inner.state
            );
            return Err(EngineError::InvalidState(inner.state));
        }
        inner.midi_queue.push_back(note);
        Ok(())
    }

    /// Apply `f` to the song under the engine lock, then reconcile both
    /// cursors and all in-flight notes with the new song size.
    pub fn edit_song(&self, f: impl FnOnce(&mut Song)) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        match inner.song.as_mut() {
            Some(song) => f(song),
            None => return Err(EngineError::NoSong),
        }
        inner.update_song_size_inner();
        Ok(())
    }

    /// Apply `f` to the timeline under the engine lock, then reconcile the
    /// transport offsets.
    pub fn edit_timeline(&self, f: impl FnOnce(&mut Timeline)) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        match inner.song.as_mut() {
            Some(song) => f(&mut song.timeline),
            None => return Err(EngineError::NoSong),
        }
        inner.handle_timeline_change();
        Ok(())
    }

    /// Toggle the timeline on or off.
    pub fn set_timeline_active(&self, active: bool) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        match inner.song.as_mut() {
            Some(song) => song.timeline_active = active,
            None => return Err(EngineError::NoSong),
        }
        inner.handle_timeline_change();
        Ok(())
    }

    /// Switch between song and pattern transport modes.
    pub fn set_mode(&self, mode: Mode) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        match inner.song.as_mut() {
            Some(song) => song.mode = mode,
            None => return Err(EngineError::NoSong),
        }
        inner.update_playing_patterns();
        Ok(())
    }

    /// Switch the pattern-mode flavor.
    pub fn set_pattern_mode(&self, pattern_mode: PatternMode) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        match inner.song.as_mut() {
            Some(song) => song.pattern_mode = pattern_mode,
            None => return Err(EngineError::NoSong),
        }
        inner.update_playing_patterns();
        Ok(())
    }

    /// Select the pattern driving Pattern/Selected playback.
    pub fn set_selected_pattern(&self, pattern: Option<PatternId>) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        match inner.song.as_mut() {
            Some(song) => song.selected_pattern = pattern,
            None => return Err(EngineError::NoSong),
        }
        inner.update_playing_patterns();
        Ok(())
    }

    /// Toggle a pattern in or out of the stacked-mode next set.
    pub fn toggle_next_pattern(&self, pattern: PatternId) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        if inner.song.is_none() {
            return Err(EngineError::NoSong);
        }
        for cursor in [Cursor::Playhead, Cursor::Queuing] {
            let next = &mut inner.pos_mut(cursor).next_patterns;
            if let Some(idx) = next.iter().position(|&p| p == pattern) {
                next.remove(idx);
            } else {
                next.push(pattern);
            }
        }
        Ok(())
    }

    pub fn clear_next_patterns(&self) {
        let mut inner = self.lock(here!());
        inner.playhead.next_patterns.clear();
        inner.queuing.next_patterns.clear();
    }

    /// Drop a pattern (about to be deleted from the song) from both playing
    /// sets.
    pub fn remove_playing_pattern(&self, pattern: PatternId) {
        let mut inner = self.lock(here!());
        for cursor in [Cursor::Playhead, Cursor::Queuing] {
            let playing = &mut inner.pos_mut(cursor).playing_patterns;
            if let Some(idx) = playing.iter().position(|&p| p == pattern) {
                playing.remove(idx);
            }
        }
    }

    /// Schedule all playing patterns to stop at the next pattern boundary,
    /// keeping (or adding) only `pattern`. `None` flushes everything.
    pub fn flush_and_add_next_pattern(
        &self,
        pattern: Option<PatternId>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock(here!());
        if inner.song.is_none() {
            return Err(EngineError::NoSong);
        }
        for cursor in [Cursor::Playhead, Cursor::Queuing] {
            let pos = inner.pos_mut(cursor);
            let mut already_playing = false;
            pos.next_patterns.clear();
            let playing = pos.playing_patterns.clone();
            for playing_pattern in playing {
                if Some(playing_pattern) != pattern {
                    pos.next_patterns.push(playing_pattern);
                } else {
                    already_playing = true;
                }
            }
            if !already_playing {
                if let Some(pattern) = pattern {
                    pos.next_patterns.push(pattern);
                }
            }
        }
        Ok(())
    }

    /// Enable or disable the metronome click.
    pub fn set_metronome(&self, enabled: bool, volume: f32) {
        let mut inner = self.lock(here!());
        inner.metronome_enabled = enabled;
        inner.metronome_volume = volume;
    }

    /// Append a slot to the master effects chain.
    pub fn add_effect(&self, effect: Box<dyn EffectSlot>) {
        self.lock(here!()).effects.push(effect);
    }

    /// Drop all effect slots.
    pub fn clear_effects(&self) {
        self.lock(here!()).effects.clear();
    }

    /// Last measured processing time and the per-buffer deadline, in
    /// milliseconds.
    pub fn process_times(&self) -> (f32, f32) {
        (
            self.process_time_us.load(Ordering::Relaxed) as f32 / 1000.0,
            self.max_process_time_us.load(Ordering::Relaxed) as f32 / 1000.0,
        )
    }

    /// The real-time process callback; pulled by the audio driver once per
    /// buffer of `frames` frames.
    ///
    /// Returns [`PROCESS_OK`], [`PROCESS_TERMINATE`] (offline sink reached
    /// the end of the song) or [`PROCESS_RETRY`] (offline sink, lock
    /// contended). Never blocks beyond the buffer's slack and never panics.
    pub fn process(&self, frames: u32) -> i32 {
        let started = Instant::now();

        self.clear_audio_buffers(frames);

        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        if sample_rate == 0 {
            return PROCESS_OK;
        }

        // Bound the wait for the engine lock by the slack left in this
        // buffer, estimated with the previous cycle's processing time. If
        // we expect to overrun anyway, require immediate locking.
        let max_us = (frames as u64 * 1_000_000 / sample_rate as u64) as u32;
        self.max_process_time_us.store(max_us, Ordering::Relaxed);
        let slack_us = max_us.saturating_sub(self.process_time_us.load(Ordering::Relaxed));

        let Some(mut inner) = self.try_lock_for(Duration::from_micros(slack_us as u64), here!())
        else {
            if self.offline_sink.load(Ordering::Relaxed) {
                // The offline sink can simply repeat this buffer.
                return PROCESS_RETRY;
            }
            self.events.send(EventKind::Xrun, -1);
            return PROCESS_OK;
        };

        if !matches!(inner.state, State::Ready | State::Playing) {
            return PROCESS_OK;
        }
        if inner.song.is_none() {
            return PROCESS_OK;
        }

        // Sync with an external transport master, if the driver has one.
        inner.pull_external_transport();

        // Absorb tempo changes.
        inner.update_bpm_and_tick_size(Cursor::Playhead);
        inner.update_bpm_and_tick_size(Cursor::Queuing);

        // Apply a pending start or stop request.
        if inner.next_state == State::Playing {
            if inner.state == State::Ready {
                inner.start_playback();
            }
            inner.realtime_frame = inner.playhead.frame;
        } else {
            if inner.state == State::Playing {
                inner.stop_playback();
            }
            // Keep the realtime frame rolling for MIDI and virtual keyboard
            // event timing.
            inner.realtime_frame += frames as i64;
        }

        // Always update the note queue; input can come from patterns or
        // realtime sources.
        if inner.update_note_queue(frames) == NoteQueueOutcome::EndOfSong {
            log::info!("end of song received");
            inner.stop_transport();
            if inner.state == State::Playing {
                inner.stop_playback();
            }
            if let Err(e) = inner.locate_inner(0.0, true) {
                log::warn!("relocation to the song start failed: {}", e);
            }
            if self.offline_sink.load(Ordering::Relaxed) {
                return PROCESS_TERMINATE;
            }
        }

        let output = self.output.lock().clone();
        inner.process_audio(frames, output.as_ref());

        if inner.state == State::Playing {
            inner.increment_transport_position(frames);
        }

        drop(inner);
        self.process_time_us
            .store(started.elapsed().as_micros() as u32, Ordering::Relaxed);
        PROCESS_OK
    }

    fn clear_audio_buffers(&self, frames: u32) {
        if let Some(output) = self.output.lock().as_ref() {
            output.lock().clear(frames as usize);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_state_testing(&self) {
        self.inner.lock().state = State::Testing;
    }
}
