// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, info, span, Level};

use crate::{midi::MidiEvent, worker::Worker};

/// The default number of events each half of the double buffer holds before it is handed off.
pub const DEFAULT_CAPACITY: usize = 256;

/// Pending handoffs beyond this are dropped by the process callback.
const SIGNAL_CAPACITY: usize = 4;

/// Messages sent to the recorder thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// The store at the given index was just handed off and should be drained.
    Drain(usize),
    /// Check whether the recorder should exit.
    Wake,
}

/// The outcome of appending an event to the hot store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Push {
    Stored,
    /// The event filled the hot store and the stores swapped roles.
    Flipped,
    /// The hot store was full or busy and the event was discarded.
    Dropped,
}

/// Two preallocated event stores. The process callback appends to the hot one and hands it to
/// the recorder when it fills up. Only [DoubleBuffer::push] changes which store is hot.
pub struct DoubleBuffer {
    stores: [Mutex<Vec<MidiEvent>>; 2],
    hot: AtomicUsize,
    capacity: usize,
    signal_tx: Sender<Signal>,
    signal_rx: Receiver<Signal>,
}

impl DoubleBuffer {
    pub fn new(capacity: usize) -> DoubleBuffer {
        let capacity = capacity.max(1);
        let (signal_tx, signal_rx) = crossbeam_channel::bounded(SIGNAL_CAPACITY);
        DoubleBuffer {
            stores: [
                Mutex::new(Vec::with_capacity(capacity)),
                Mutex::new(Vec::with_capacity(capacity)),
            ],
            hot: AtomicUsize::new(0),
            capacity,
            signal_tx,
            signal_rx,
        }
    }

    /// Appends to the hot store without blocking or allocating. When the store reaches
    /// capacity the roles swap and the recorder is told to drain the filled store.
    pub fn push(&self, event: MidiEvent) -> Push {
        let hot = self.hot();
        let Some(mut store) = self.stores[hot].try_lock() else {
            return Push::Dropped;
        };
        if store.len() >= self.capacity {
            return Push::Dropped;
        }

        store.push(event);
        if store.len() < self.capacity {
            return Push::Stored;
        }
        drop(store);

        self.hot.store(hot ^ 1, Ordering::Release);
        // A full signal queue means the recorder is far behind. The store stays full and
        // later pushes to it are dropped until it is drained.
        let _ = self.signal_tx.try_send(Signal::Drain(hot));
        Push::Flipped
    }

    /// Moves every event in the given store onto the end of the log, leaving the store empty
    /// with its allocation intact. Returns the number of events moved.
    pub fn drain_into(&self, index: usize, log: &PlaybackLog) -> usize {
        let mut store = self.stores[index & 1].lock();
        log.append(&mut store)
    }

    /// Empties both stores and makes the first one hot. Only call while recording is disarmed.
    pub fn clear(&self) {
        let mut first = self.stores[0].lock();
        let mut second = self.stores[1].lock();
        first.clear();
        second.clear();
        while self.signal_rx.try_recv().is_ok() {}
        self.hot.store(0, Ordering::Release);
    }

    /// The index of the store currently being appended to.
    pub fn hot(&self) -> usize {
        self.hot.load(Ordering::Acquire)
    }

    /// The index of the store available for draining.
    pub fn cold(&self) -> usize {
        self.hot() ^ 1
    }

    /// The number of events held by the given store.
    pub fn len(&self, index: usize) -> usize {
        self.stores[index & 1].lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sends a signal to the recorder thread without blocking.
    pub fn signal(&self, signal: Signal) -> bool {
        self.signal_tx.try_send(signal).is_ok()
    }

    /// The receiving end of the handoff signals.
    pub fn signals(&self) -> Receiver<Signal> {
        self.signal_rx.clone()
    }
}

/// The recorded take. Appended to by the recorder thread, read by the process callback.
pub struct PlaybackLog {
    events: Mutex<Vec<MidiEvent>>,
}

impl PlaybackLog {
    pub fn new() -> PlaybackLog {
        PlaybackLog {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Moves the given events onto the end of the log.
    pub fn append(&self, events: &mut Vec<MidiEvent>) -> usize {
        let moved = events.len();
        if moved > 0 {
            self.events.lock().append(events);
        }
        moved
    }

    /// Returns the event at the given index, wrapped to the length of the log, along with the
    /// wrapped index. Returns None if the log is empty or busy being appended to.
    pub fn try_get(&self, index: usize) -> Option<(MidiEvent, usize)> {
        let events = self.events.try_lock()?;
        if events.is_empty() {
            return None;
        }
        let index = index % events.len();
        Some((events[index], index))
    }

    /// Removes every event. Only call while playback and recording are disarmed.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the log.
    pub fn snapshot(&self) -> Vec<MidiEvent> {
        self.events.lock().clone()
    }
}

impl Default for PlaybackLog {
    fn default() -> Self {
        PlaybackLog::new()
    }
}

/// Moves filled stores into the playback log on a background thread.
pub struct Recorder {
    buffer: Arc<DoubleBuffer>,
    log: Arc<PlaybackLog>,
    worker: Worker,
}

impl Recorder {
    pub fn new(buffer: Arc<DoubleBuffer>, log: Arc<PlaybackLog>) -> Recorder {
        let wake_buffer = buffer.clone();
        Recorder {
            buffer,
            log,
            worker: Worker::with_wake("recorder", move || {
                wake_buffer.signal(Signal::Wake);
            }),
        }
    }

    /// Starts the recorder thread, restarting it if it is already running.
    pub fn start(&self) -> Result<(), io::Error> {
        let buffer = self.buffer.clone();
        let log = self.log.clone();
        let signals = buffer.signals();
        self.worker.start(move |running| {
            let span = span!(Level::INFO, "recorder");
            let _enter = span.enter();

            while let Ok(signal) = signals.recv() {
                if let Signal::Drain(index) = signal {
                    let moved = buffer.drain_into(index, &log);
                    debug!(store = index, moved, "Drained store.");
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }

            // Handoffs that raced with the stop request.
            loop {
                match signals.try_recv() {
                    Ok(Signal::Drain(index)) => {
                        buffer.drain_into(index, &log);
                    }
                    Ok(Signal::Wake) => {}
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        })?;
        info!("Recorder started.");
        Ok(())
    }

    /// Stops the recorder thread. Does nothing if it is not running.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Stops the recorder and moves everything still buffered into the log, oldest first.
    pub fn finish(&self) {
        self.stop();

        let signals = self.buffer.signals();
        while let Ok(signal) = signals.try_recv() {
            if let Signal::Drain(index) = signal {
                self.buffer.drain_into(index, &self.log);
            }
        }
        let remainder = self.buffer.drain_into(self.buffer.hot(), &self.log);
        info!(remainder, recorded = self.log.len(), "Recording finished.");
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{
        midi::{Message, MidiEvent},
        testutil::eventually,
    };

    use super::{DoubleBuffer, PlaybackLog, Push, Recorder, Signal};

    fn event(key: u8) -> MidiEvent {
        MidiEvent::new(Message::note_on(key, 100), key as f64)
    }

    #[test]
    fn test_handoff() {
        let buffer = DoubleBuffer::new(4);
        let log = PlaybackLog::new();
        let signals = buffer.signals();

        assert_eq!(4, buffer.capacity());
        assert_eq!(0, buffer.hot());
        for key in 0..3 {
            assert_eq!(Push::Stored, buffer.push(event(key)));
        }
        assert!(signals.is_empty());

        assert_eq!(Push::Flipped, buffer.push(event(3)));
        assert_eq!(1, buffer.hot());
        assert_eq!(0, buffer.cold());
        assert_eq!(1, signals.len());
        assert_eq!(Ok(Signal::Drain(0)), signals.try_recv());

        // Appends continue into the other store while the first is drained.
        assert_eq!(Push::Stored, buffer.push(event(4)));
        assert_eq!(4, buffer.drain_into(0, &log));
        assert_eq!(0, buffer.len(0));
        assert_eq!(1, buffer.len(1));
        assert_eq!((0..4).map(event).collect::<Vec<_>>(), log.snapshot());

        // Draining twice moves nothing.
        assert_eq!(0, buffer.drain_into(0, &log));
        assert_eq!(4, log.len());
    }

    #[test]
    fn test_full_store_drops() {
        let buffer = DoubleBuffer::new(1);
        assert_eq!(Push::Flipped, buffer.push(event(0)));
        assert_eq!(Push::Flipped, buffer.push(event(1)));

        // Both stores are full and nothing has drained them.
        assert_eq!(Push::Dropped, buffer.push(event(2)));
        assert_eq!(1, buffer.len(0));
        assert_eq!(1, buffer.len(1));
    }

    #[test]
    fn test_clear() {
        let buffer = DoubleBuffer::new(2);
        buffer.push(event(0));
        buffer.push(event(1));
        buffer.push(event(2));
        assert_eq!(1, buffer.hot());

        buffer.clear();
        assert_eq!(0, buffer.hot());
        assert_eq!(0, buffer.len(0));
        assert_eq!(0, buffer.len(1));
        assert!(buffer.signals().is_empty());
    }

    #[test]
    fn test_log_try_get() {
        let log = PlaybackLog::new();
        assert!(log.is_empty());
        assert_eq!(None, log.try_get(0));

        let mut events = vec![event(1), event(2)];
        assert_eq!(2, log.append(&mut events));
        assert!(events.is_empty());
        assert_eq!(Some((event(2), 1)), log.try_get(1));
        assert_eq!(Some((event(1), 0)), log.try_get(2));
        assert_eq!(Some((event(2), 1)), log.try_get(5));

        log.clear();
        assert!(log.is_empty());
        assert_eq!(None, log.try_get(0));
    }

    #[test]
    fn test_recorder_drains_in_order() -> Result<(), std::io::Error> {
        let buffer = Arc::new(DoubleBuffer::new(8));
        let log = Arc::new(PlaybackLog::new());
        let recorder = Recorder::new(buffer.clone(), log.clone());
        recorder.start()?;
        assert!(recorder.is_running());

        for key in 0..20 {
            assert_ne!(Push::Dropped, buffer.push(event(key)));
            // Give the recorder a chance to keep up with the small stores.
            if key % 8 == 7 {
                eventually(|| log.len() == key as usize + 1, "Recorder never drained");
            }
        }

        recorder.finish();
        assert!(!recorder.is_running());
        assert_eq!((0..20).map(event).collect::<Vec<_>>(), log.snapshot());
        assert_eq!(0, buffer.len(0));
        assert_eq!(0, buffer.len(1));
        Ok(())
    }

    #[test]
    fn test_finish_without_start() {
        let buffer = Arc::new(DoubleBuffer::new(2));
        let log = Arc::new(PlaybackLog::new());
        let recorder = Recorder::new(buffer.clone(), log.clone());

        buffer.push(event(0));
        buffer.push(event(1));
        buffer.push(event(2));
        recorder.finish();

        assert_eq!((0..3).map(event).collect::<Vec<_>>(), log.snapshot());
    }

    #[test]
    fn test_stop_is_idempotent() -> Result<(), std::io::Error> {
        let recorder = Recorder::new(
            Arc::new(DoubleBuffer::new(2)),
            Arc::new(PlaybackLog::new()),
        );
        recorder.stop();
        recorder.start()?;
        recorder.start()?;
        recorder.stop();
        recorder.stop();
        assert!(!recorder.is_running());
        Ok(())
    }
}
