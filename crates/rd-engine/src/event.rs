//! Fire-and-forget event channel to the embedder.

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// What happened inside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Engine state changed; arg is the new state as integer.
    State,
    TempoChanged,
    PlayingPatternsChanged,
    Relocation,
    SongSizeChanged,
    /// A note was handed to the sampler; arg is the instrument id.
    NoteOn,
    /// Metronome beat queued; arg 1 for the accented first tick of a pattern.
    Metronome,
    /// The process callback missed its deadline.
    Xrun,
    /// arg carries an error code.
    Error,
    DriverChanged,
}

/// A notification pushed to the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub arg: i32,
}

/// Producer half of the event channel.
///
/// Pushes never block: the ring drops events on overflow. The producer is
/// shared between the engine lock scope and the xrun path of the process
/// callback, so the raw ring producer sits behind a micro-mutex that is only
/// ever held for a single push.
#[derive(Clone)]
pub struct EventSender {
    prod: Arc<Mutex<HeapProd<Event>>>,
}

impl EventSender {
    pub fn send(&self, kind: EventKind, arg: i32) {
        let event = Event { kind, arg };
        if let Some(mut prod) = self.prod.try_lock() {
            if prod.try_push(event).is_err() {
                log::debug!("event ring full, dropping {:?}", event);
            }
        } else {
            log::debug!("event ring contended, dropping {:?}", event);
        }
    }
}

/// Consumer half of the event channel.
pub struct EventReceiver {
    cons: HeapCons<Event>,
}

impl EventReceiver {
    pub fn try_pop(&mut self) -> Option<Event> {
        self.cons.try_pop()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.cons.try_pop() {
            events.push(event);
        }
        events
    }
}

/// Create an event channel holding up to `capacity` undelivered events.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (prod, cons) = HeapRb::<Event>::new(capacity).split();
    (
        EventSender {
            prod: Arc::new(Mutex::new(prod)),
        },
        EventReceiver { cons },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order() {
        let (tx, mut rx) = event_channel(8);
        tx.send(EventKind::State, 3);
        tx.send(EventKind::Metronome, 1);

        assert_eq!(
            rx.try_pop(),
            Some(Event {
                kind: EventKind::State,
                arg: 3
            })
        );
        assert_eq!(
            rx.try_pop(),
            Some(Event {
                kind: EventKind::Metronome,
                arg: 1
            })
        );
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let (tx, mut rx) = event_channel(2);
        tx.send(EventKind::NoteOn, 0);
        tx.send(EventKind::NoteOn, 1);
        tx.send(EventKind::NoteOn, 2);

        let drained = rx.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].arg, 0);
        assert_eq!(drained[1].arg, 1);
    }
}
