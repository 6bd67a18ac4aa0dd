//! Scenarios around editing a playing song: size changes, tempo changes,
//! note dispatch properties and the offline sink's return codes.

mod common;

use std::time::Duration;

use common::{recording_engine, run_buffers, sequence_song, BUFFER};
use rd_audio::{NullDriver, OfflineDriver, PROCESS_OK, PROCESS_RETRY, PROCESS_TERMINATE};
use rd_engine::{here, AudioEngine, EventKind, State};
use rd_ir::{Instrument, Note, Pattern, Song};

/// Extending a column before the playing one preserves the perceived
/// position and shifts all in-flight notes with the edit.
#[test]
fn resizing_an_earlier_column_preserves_the_position() {
    // Two 192-tick columns; column 1 carries a dense 6-tick note grid so
    // some notes are queued but not yet dispatched at any moment.
    let mut song = sequence_song(2, 192);
    for tick in (0..192).step_by(6) {
        song.patterns[1].insert_note(Note::new(0, tick, 1.0, 0.0, 0.0));
    }
    let (engine, _events, _notes) = recording_engine(song);

    engine.play();
    // Run to roughly tick 300 (column 1, pattern tick around 108).
    run_buffers(&engine, (300 * 500) / BUFFER as usize);
    let before = engine.playhead();
    assert_eq!(before.column, 1);
    let queued_before: Vec<i64> = engine.queued_notes().iter().map(|n| n.position).collect();
    assert!(!queued_before.is_empty(), "no notes in flight");

    // Extend column 0's pattern by 96 ticks: song grows from 384 to 480.
    engine
        .edit_song(|song| song.patterns[0].length = 288)
        .unwrap();

    let after = engine.playhead();
    assert_eq!(after.column, before.column);
    assert_eq!(after.pattern_tick_position, before.pattern_tick_position);
    assert!(
        (after.tick - before.tick - 96.0).abs() < 1e-6,
        "tick moved from {} to {}",
        before.tick,
        after.tick
    );
    // The offset is rounded to 1e-8, so it is bit-exact here.
    assert_eq!(after.tick_offset_song_size, 96.0);

    let queued_after: Vec<i64> = engine.queued_notes().iter().map(|n| n.position).collect();
    assert_eq!(queued_after.len(), queued_before.len());
    for (old, new) in queued_before.iter().zip(&queued_after) {
        assert_eq!(new - old, 96);
    }

    // Playback continues from the same musical spot.
    let frame = engine.playhead().frame;
    engine.process(BUFFER);
    assert_eq!(engine.playhead().frame, frame + BUFFER as i64);
}

#[test]
fn shrinking_below_the_playhead_ends_the_song() {
    let mut song = sequence_song(2, 192);
    song.patterns[1].insert_note(Note::new(0, 0, 1.0, 0.0, 0.0));
    let (engine, mut events, _notes) = recording_engine(song);

    engine.play();
    // Into column 1.
    run_buffers(&engine, (250 * 500) / BUFFER as usize);
    assert_eq!(engine.playhead().column, 1);
    events.drain();

    // Drop column 1 entirely; the old column now exceeds the song.
    engine
        .edit_song(|song| {
            song.pattern_groups.pop();
        })
        .unwrap();
    engine.process(BUFFER);

    assert_eq!(engine.state(), State::Ready);
    assert_eq!(engine.playhead().tick, 0.0);
    assert!(events
        .drain()
        .iter()
        .any(|e| e.kind == EventKind::SongSizeChanged));
}

/// A tempo change recomputes the start frames of queued notes before they
/// are dispatched.
#[test]
fn tempo_change_moves_queued_note_starts() {
    let mut song = sequence_song(1, 192);
    song.patterns[0].insert_note(Note::new(0, 6, 1.0, 0.0, 0.0));
    let (engine, _events, notes) = recording_engine(song);

    engine.play();
    // First buffer queues the note (start 3000 at 120 bpm) but does not
    // dispatch it yet (threshold 1024).
    engine.process(BUFFER);
    assert!(notes.lock().unwrap().is_empty());
    assert_eq!(engine.queued_notes()[0].note_start, 3000);

    // Doubling the tempo halves the tick size: the note now starts at 1500
    // and falls into the second buffer.
    engine.set_next_bpm(240.0);
    engine.process(BUFFER);

    let recorded = notes.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].note_start, 6 * 250);
}

#[test]
fn stop_note_instruments_get_a_note_off_first() {
    let mut song = sequence_song(1, 192);
    song.instruments[0].stop_notes = true;
    song.patterns[0].insert_note(Note::new(0, 0, 1.0, 0.0, 0.0));
    let (engine, _events, notes) = recording_engine(song);

    engine.play();
    run_buffers(&engine, 4);

    let recorded = notes.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(recorded[0].note_off);
    assert_eq!(recorded[0].instrument_id, 0);
    assert!(!recorded[1].note_off);
    assert_eq!(recorded[1].velocity, 1.0);
}

#[test]
fn zero_probability_notes_are_dropped() {
    let mut song = sequence_song(1, 192);
    let mut note = Note::new(0, 0, 1.0, 0.0, 0.0);
    note.probability = 0.0;
    song.patterns[0].insert_note(note);
    let (engine, mut events, notes) = recording_engine(song);
    events.drain();

    engine.play();
    run_buffers(&engine, 10);

    assert!(notes.lock().unwrap().is_empty());
    assert!(!events.drain().iter().any(|e| e.kind == EventKind::NoteOn));
}

#[test]
fn humanized_velocity_stays_in_range() {
    let mut song = sequence_song(1, 192);
    song.humanize_velocity = 1.0;
    for tick in (0..192).step_by(12) {
        song.patterns[0].insert_note(Note::new(0, tick, 0.5, 0.0, 0.0));
    }
    let (engine, _events, notes) = recording_engine(song);

    engine.play();
    run_buffers(&engine, (192 * 500) / BUFFER as usize);

    let recorded = notes.lock().unwrap();
    assert!(recorded.len() > 10);
    for note in recorded.iter() {
        assert!(
            (0.0..=1.0).contains(&note.velocity),
            "velocity {} out of range",
            note.velocity
        );
    }
}

/// The offline sink sees the retry code under lock contention and the
/// terminate code at the end of the song.
#[test]
fn offline_sink_return_codes() {
    let (engine, _events) = AudioEngine::with_defaults();
    let driver = OfflineDriver::new(48000, engine.process_callback());
    engine.install_driver(Box::new(driver), BUFFER).unwrap();
    engine.set_song(sequence_song(1, 192)).unwrap();
    engine.play();

    // Contended lock: the offline sink is asked to retry the buffer.
    std::thread::scope(|scope| {
        let blocker = engine.clone();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        scope.spawn(move || {
            blocker.with_lock(here!(), || {
                started_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(100));
            });
        });
        started_rx.recv().unwrap();
        assert_eq!(engine.process(BUFFER), PROCESS_RETRY);
    });

    // Unimpeded, the render runs to the end of the song and terminates.
    let mut saw_terminate = false;
    for _ in 0..300 {
        match engine.process(BUFFER) {
            PROCESS_TERMINATE => {
                saw_terminate = true;
                break;
            }
            code => assert_eq!(code, PROCESS_OK),
        }
    }
    assert!(saw_terminate);
    assert_eq!(engine.state(), State::Ready);
    assert_eq!(engine.playhead().tick, 0.0);
}

/// Notes played through the realtime input while transport is stopped are
/// dispatched against the realtime frame.
#[test]
fn realtime_input_plays_while_stopped() {
    let (engine, _events, notes) = recording_engine(sequence_song(1, 192));
    engine
        .queue_note(Note::new(0, 0, 0.9, 0.0, 0.0))
        .unwrap();
    run_buffers(&engine, 2);

    let recorded = notes.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].velocity, 0.9);
    assert_eq!(engine.state(), State::Ready);
}

/// Removing a song mid-session returns the engine to the prepared state and
/// a new song starts clean at tick 0.
#[test]
fn song_swap_round_trip() {
    let (engine, _events, _notes) = recording_engine(sequence_song(2, 192));
    engine.play();
    run_buffers(&engine, 20);
    assert!(engine.playhead().tick > 0.0);

    engine.stop();
    engine.process(BUFFER);
    engine.remove_song().unwrap();
    assert_eq!(engine.state(), State::Prepared);

    let mut replacement = Song::new("second");
    replacement.instruments.push(Instrument::new(0, "snare"));
    let id = replacement.add_pattern(Pattern::new("pat", 192));
    replacement.add_column(vec![id]);
    engine.set_song(replacement).unwrap();

    assert_eq!(engine.state(), State::Ready);
    let playhead = engine.playhead();
    assert_eq!(playhead.tick, 0.0);
    assert_eq!(playhead.frame, 0);
    assert_eq!(playhead.column, 0);
}

/// Drivers can be swapped; the new driver's sample rate takes over.
#[test]
fn driver_swap_updates_tick_size() {
    let (engine, _events, _notes) = recording_engine(sequence_song(1, 192));
    engine.stop_drivers();
    assert_eq!(engine.state(), State::Initialized);

    engine
        .install_driver(Box::new(NullDriver::new(96000)), BUFFER)
        .unwrap();
    // The song was kept; the engine went straight back to ready.
    assert_eq!(engine.state(), State::Ready);

    engine.play();
    engine.process(BUFFER);
    // 96000 * 60 / 120 / 48 = 1000 frames per tick.
    assert_eq!(engine.playhead().tick_size, 1000.0);
}

#[test]
fn unknown_driver_falls_back_to_null() {
    let (engine, mut events) = AudioEngine::with_defaults();
    engine.start_driver("bogus", BUFFER).unwrap();

    assert_eq!(engine.state(), State::Prepared);
    assert!(events.drain().iter().any(|e| e.kind == EventKind::Error));
}
