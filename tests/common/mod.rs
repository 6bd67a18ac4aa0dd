//! Shared fixtures for the engine integration tests.

// Each test binary compiles its own copy; not every binary uses every helper.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rd_audio::NullDriver;
use rd_engine::{AudioEngine, EventReceiver, NullSynth, Sampler};
use rd_ir::{Instrument, Note, Pattern, Song};

pub const SAMPLE_RATE: u32 = 48000;
pub const BUFFER: u32 = 1024;

/// Sampler that records every delivered note and renders silence.
pub struct RecordingSampler {
    notes: Arc<Mutex<Vec<Note>>>,
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl RecordingSampler {
    pub fn new() -> (Self, Arc<Mutex<Vec<Note>>>) {
        let notes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                notes: notes.clone(),
                out_l: Vec::new(),
                out_r: Vec::new(),
            },
            notes,
        )
    }
}

impl Sampler for RecordingSampler {
    fn note_on(&mut self, note: &Note) {
        self.notes.lock().unwrap().push(note.clone());
    }

    fn process(&mut self, frames: usize, _song: &Song) {
        if self.out_l.len() < frames {
            self.out_l.resize(frames, 0.0);
            self.out_r.resize(frames, 0.0);
        }
        self.out_l[..frames].fill(0.0);
        self.out_r[..frames].fill(0.0);
    }

    fn main_out_l(&self) -> &[f32] {
        &self.out_l
    }

    fn main_out_r(&self) -> &[f32] {
        &self.out_r
    }

    fn stop_playing_notes(&mut self) {}
}

/// A song of `columns` single-pattern columns, each `pattern_len` ticks, with
/// one kick instrument (id 0).
pub fn sequence_song(columns: usize, pattern_len: i64) -> Song {
    let mut song = Song::new("fixture");
    song.instruments.push(Instrument::new(0, "kick"));
    for i in 0..columns {
        let id = song.add_pattern(Pattern::new(&format!("pat{}", i), pattern_len));
        song.add_column(vec![id]);
    }
    song
}

/// Engine wired to a recording sampler and a null driver, with `song` set.
pub fn recording_engine(
    song: Song,
) -> (Arc<AudioEngine>, EventReceiver, Arc<Mutex<Vec<Note>>>) {
    let (sampler, notes) = RecordingSampler::new();
    let (engine, events) = AudioEngine::new(
        Box::new(sampler),
        Box::<NullSynth>::default(),
        Some(Box::<rd_audio::NullMidiOutput>::default()),
    );
    engine
        .install_driver(Box::new(NullDriver::new(SAMPLE_RATE)), BUFFER)
        .unwrap();
    engine.set_song(song).unwrap();
    (engine, events, notes)
}

/// Run `count` process cycles of one buffer each.
pub fn run_buffers(engine: &AudioEngine, count: usize) {
    for _ in 0..count {
        engine.process(BUFFER);
    }
}
