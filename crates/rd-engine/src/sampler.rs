//! Contracts of the voice-rendering collaborators.
//!
//! Voice rendering itself (layers, envelopes, filtering) is outside the
//! engine; the engine delivers notes and reads mixed output through these
//! traits. Null implementations back the test suites.

use rd_ir::{Note, Song};

/// The sampler the engine dispatches notes to.
///
/// `note_on` takes the note by reference: the sampler copies what it needs
/// and the engine's queued copy ends at the call boundary.
pub trait Sampler: Send {
    fn note_on(&mut self, note: &Note);
    /// Render `frames` frames into the main output buffers.
    fn process(&mut self, frames: usize, song: &Song);
    fn main_out_l(&self) -> &[f32];
    fn main_out_r(&self) -> &[f32];
    /// Kill all voices immediately.
    fn stop_playing_notes(&mut self);
    /// Tick size changed; frame positions of running voices moved.
    fn handle_timeline_or_tempo_change(&mut self) {}
    /// The song was resized; tick positions of running voices moved.
    fn handle_song_size_change(&mut self) {}
}

/// The secondary voice source summed after the sampler.
pub trait Synth: Send {
    fn process(&mut self, frames: usize);
    fn out_l(&self) -> &[f32];
    fn out_r(&self) -> &[f32];
}

/// One slot of the master effects chain.
///
/// The engine runs the slots in order over the summed master buffers, in
/// place. What a slot does to the audio is its own business.
pub trait EffectSlot: Send {
    fn process(&mut self, left: &mut [f32], right: &mut [f32]);
}

/// Sampler producing silence.
#[derive(Debug, Default)]
pub struct NullSampler {
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Sampler for NullSampler {
    fn note_on(&mut self, _note: &Note) {}

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

/// Synth producing silence.
#[derive(Debug, Default)]
pub struct NullSynth {
    out_l: Vec<f32>,
    out_r: Vec<f32>,
}

impl Synth for NullSynth {
    fn process(&mut self, frames: usize) {
        if self.out_l.len() < frames {
            self.out_l.resize(frames, 0.0);
            self.out_r.resize(frames, 0.0);
        }
        self.out_l[..frames].fill(0.0);
        self.out_r[..frames].fill(0.0);
    }

    fn out_l(&self) -> &[f32] {
        &self.out_l
    }

    fn out_r(&self) -> &[f32] {
        &self.out_r
    }
}
