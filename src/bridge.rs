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
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::{
    config::Config,
    midi::{decode_key_event, KeyEvent, Message, MidiEvent},
    queue::EventQueue,
    recorder::{DoubleBuffer, PlaybackLog, Push, Recorder},
};

#[cfg(feature = "jack")]
pub mod jack;
pub mod mock;
mod thread_priority;

/// Errors raised while connecting to an audio graph.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unable to connect to the audio graph: {0}")]
    Connect(String),

    #[error("Unable to register port {port}: {reason}")]
    Port { port: String, reason: String },

    #[error("Unable to activate the audio graph client: {0}")]
    Activate(String),

    #[error("Unknown audio graph '{0}'")]
    UnknownGraph(String),

    #[error("Audio graph '{0}' is not supported by this build")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sent to the application when the audio graph goes away underneath the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quit {
    pub reason: String,
}

/// A MIDI event read from the graph's input port during one block.
#[derive(Clone, Copy, Debug)]
pub struct RawEvent<'a> {
    /// Frame offset within the block.
    pub time: u32,
    pub bytes: &'a [u8],
}

/// The graph's output port for one block.
pub trait MidiWriter {
    /// Reserves room for and writes an event at the given frame offset. Returns false if the
    /// output buffer has no room left.
    fn write(&mut self, time: u32, bytes: &[u8]) -> bool;
}

/// The timing of one process cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    /// The number of frames in the block.
    pub frames: u32,
    /// The graph's frame counter at the start of the block. Wraps.
    pub frame_time: u32,
}

/// State shared between the control surface and the process callback.
pub struct Controls {
    queue: EventQueue,
    buffer: Arc<DoubleBuffer>,
    log: Arc<PlaybackLog>,
    record: AtomicBool,
    play: AtomicBool,
    fresh_take: AtomicBool,
    first_play: AtomicBool,
    /// Set by the process callback while it decides whether to record an event.
    pushing: AtomicBool,
    /// Whether the graph's transport is rolling, as last reported by the process callback.
    transport: AtomicBool,
    dropped_notifications: AtomicU64,
    failed_writes: AtomicU64,
    dropped_records: AtomicU64,
}

/// Overload counters kept by the process callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Key notifications discarded because the consumer fell behind.
    pub dropped_notifications: u64,
    /// Events that did not fit in the output buffer.
    pub failed_writes: u64,
    /// Recorded events discarded because the record buffer was full.
    pub dropped_records: u64,
}

impl Stats {
    pub fn total(&self) -> u64 {
        self.dropped_notifications + self.failed_writes + self.dropped_records
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dropped notifications: {}, failed writes: {}, dropped records: {}",
            self.dropped_notifications, self.failed_writes, self.dropped_records
        )
    }
}

/// The process callback. Owned by whichever graph drives it. Never blocks, allocates or logs.
pub struct Processor {
    controls: Arc<Controls>,
    notifier: Sender<KeyEvent>,
    record_mark: u32,
    play_mark: u32,
    cursor: usize,
}

impl Processor {
    /// Handles one block: passes input through, sends at most one queued message per frame
    /// (recording it if armed), and otherwise plays back the recorded take.
    pub fn process<'a, I, W>(&mut self, block: Block, input: I, output: &mut W)
    where
        I: IntoIterator<Item = RawEvent<'a>>,
        W: MidiWriter + ?Sized,
    {
        let channel = self.controls.queue.channel();
        let mut input = input.into_iter().peekable();
        let mut pending = self.controls.queue.next(None);

        for n in 0..block.frames {
            while let Some(event) = input.next_if(|event| event.time <= n) {
                self.pass_through(event, channel, output);
            }

            let now = block.frame_time.wrapping_add(n);
            if let Some(index) = pending {
                self.send(index, now, n, output);
                pending = self.controls.queue.next(Some(index));
            } else if self.controls.play.load(Ordering::Relaxed) {
                self.play(now, n, channel, output);
            }
        }

        for event in input {
            self.pass_through(event, channel, output);
        }
    }

    fn pass_through<W>(&self, event: RawEvent<'_>, channel: u8, output: &mut W)
    where
        W: MidiWriter + ?Sized,
    {
        if !output.write(event.time, event.bytes) {
            self.controls.failed_writes.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(key) = decode_key_event(event.bytes, channel) {
            self.notify(key);
        }
    }

    fn send<W>(&mut self, index: usize, now: u32, frame: u32, output: &mut W)
    where
        W: MidiWriter + ?Sized,
    {
        let Some(message) = self.controls.queue.peek(index) else {
            return;
        };
        if !output.write(frame, message.bytes()) {
            // The slot stays occupied and goes out in a later block.
            self.controls.failed_writes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.controls.queue.take(index);

        // Pairs with the wait in Bridge::disarm_record so a disarmed take is never appended to
        // after it has been finished.
        self.controls.pushing.store(true, Ordering::SeqCst);
        if self.controls.record.load(Ordering::SeqCst) {
            self.record(message, now);
        }
        self.controls.pushing.store(false, Ordering::Release);
    }

    fn record(&mut self, message: Message, now: u32) {
        let fresh = self.controls.fresh_take.load(Ordering::Relaxed);
        // A reset left over from stopping playback does not start the new take.
        if fresh && message.is_all_notes_off() {
            return;
        }
        if fresh {
            self.controls.fresh_take.store(false, Ordering::Relaxed);
            self.record_mark = now;
        }
        let delta = now.wrapping_sub(self.record_mark) as f64;
        if self.controls.buffer.push(MidiEvent::new(message, delta)) == Push::Dropped {
            self.controls
                .dropped_records
                .fetch_add(1, Ordering::Relaxed);
        }
        self.record_mark = now;
    }

    fn play<W>(&mut self, now: u32, frame: u32, channel: u8, output: &mut W)
    where
        W: MidiWriter + ?Sized,
    {
        if self.controls.first_play.swap(false, Ordering::Relaxed) {
            self.play_mark = now;
            self.cursor = 0;
        }

        let Some((event, index)) = self.controls.log.try_get(self.cursor) else {
            return;
        };
        // The cursor only wraps from 1 to 0 for a single event take. It has no length to loop
        // over, so it plays once per arm instead of on every frame.
        if index == 0 && self.cursor == 1 {
            return;
        }
        if (now.wrapping_sub(self.play_mark) as f64) < event.delta_time() {
            self.cursor = index;
            return;
        }

        let message = event.message();
        if output.write(frame, message.bytes()) {
            if let Some(key) = message.key_event(channel) {
                self.notify(key);
            }
        } else {
            self.controls.failed_writes.fetch_add(1, Ordering::Relaxed);
        }
        self.cursor = index + 1;
        self.play_mark = now;
    }

    /// Reports the state of the graph's transport. Called once per block by graphs that have one.
    pub fn set_transport(&self, rolling: bool) {
        self.controls.transport.store(rolling, Ordering::Relaxed);
    }

    fn notify(&self, key: KeyEvent) {
        if self.notifier.try_send(key).is_err() {
            self.controls
                .dropped_notifications
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The control side of the bridge: queues outgoing messages and arms recording and playback.
pub struct Bridge {
    controls: Arc<Controls>,
    recorder: Recorder,
    notifier: Sender<KeyEvent>,
    key_events: Receiver<KeyEvent>,
    /// The transport state the bridge last followed.
    transport: AtomicBool,
}

impl Bridge {
    pub fn new(config: &Config) -> Bridge {
        let buffer = Arc::new(DoubleBuffer::new(config.record_buffer_capacity()));
        let log = Arc::new(PlaybackLog::new());
        let (notifier, key_events) = crossbeam_channel::bounded(config.notification_capacity());
        let queue = EventQueue::new(config.queue_capacity());
        info!(
            queue = queue.capacity(),
            record_buffer = buffer.capacity(),
            notifications = config.notification_capacity(),
            "Bridge created."
        );
        Bridge {
            controls: Arc::new(Controls {
                queue,
                buffer: buffer.clone(),
                log: log.clone(),
                record: AtomicBool::new(false),
                play: AtomicBool::new(false),
                fresh_take: AtomicBool::new(true),
                first_play: AtomicBool::new(true),
                pushing: AtomicBool::new(false),
                transport: AtomicBool::new(false),
                dropped_notifications: AtomicU64::new(0),
                failed_writes: AtomicU64::new(0),
                dropped_records: AtomicU64::new(0),
            }),
            recorder: Recorder::new(buffer, log),
            notifier,
            key_events,
            transport: AtomicBool::new(false),
        }
    }

    /// Creates a process callback for a graph to drive. Only one should be active at a time.
    pub fn processor(&self) -> Processor {
        Processor {
            controls: self.controls.clone(),
            notifier: self.notifier.clone(),
            record_mark: 0,
            play_mark: 0,
            cursor: 0,
        }
    }

    /// Key state changes seen on the input port or played back from the recorded take.
    pub fn key_events(&self) -> Receiver<KeyEvent> {
        self.key_events.clone()
    }

    /// Queues a message on the current channel. Returns false if the queue is full and the
    /// message was dropped.
    pub fn send(&self, message: Message) -> bool {
        self.controls.queue.enqueue(message)
    }

    pub fn channel(&self) -> u8 {
        self.controls.queue.channel()
    }

    pub fn set_channel(&self, channel: u8) {
        self.controls.queue.set_channel(channel);
    }

    /// Arms or disarms recording. Arming starts a new take, discarding the previous one and
    /// stopping playback. Disarming moves everything recorded into the playback log.
    pub fn set_record(&self, on: bool) -> Result<(), Error> {
        let controls = &self.controls;
        if on {
            self.disarm_play();
            controls.record.store(false, Ordering::SeqCst);
            self.recorder.stop();

            controls.buffer.clear();
            controls.log.clear();
            controls.fresh_take.store(true, Ordering::Relaxed);
            controls.first_play.store(true, Ordering::Relaxed);

            self.recorder.start()?;
            controls.record.store(true, Ordering::Relaxed);
            info!("Recording armed.");
        } else {
            self.disarm_record();
        }
        Ok(())
    }

    /// Arms or disarms looped playback of the recorded take. Arming stops recording and
    /// restarts from the first event. Disarming sends all notes off.
    pub fn set_play(&self, on: bool) {
        let controls = &self.controls;
        if on {
            self.disarm_record();
            controls.first_play.store(true, Ordering::Relaxed);
            controls.play.store(true, Ordering::Relaxed);
            info!(events = controls.log.len(), "Playback armed.");
        } else {
            self.disarm_play();
        }
    }

    /// Stops playback and queues all notes off. Returns false if playback was not armed.
    fn disarm_play(&self) -> bool {
        let controls = &self.controls;
        if !controls.play.swap(false, Ordering::Relaxed) {
            return false;
        }
        controls.first_play.store(true, Ordering::Relaxed);
        if !self.send(Message::all_notes_off()) {
            warn!("Queue full, all notes off dropped.");
        }
        info!("Playback stopped.");
        true
    }

    /// Stops recording and moves the take into the playback log. Returns false if recording
    /// was not armed.
    fn disarm_record(&self) -> bool {
        if !self.controls.record.swap(false, Ordering::SeqCst) {
            return false;
        }
        // The process callback may be between reading the flag and appending an event.
        while self.controls.pushing.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
        self.recorder.finish();
        true
    }

    /// Arms or disarms playback when the graph's transport has started or stopped since the
    /// last call. Returns the new transport state if it changed.
    pub fn follow_transport(&self) -> Option<bool> {
        let rolling = self.controls.transport.load(Ordering::Relaxed);
        if self.transport.swap(rolling, Ordering::Relaxed) == rolling {
            return None;
        }
        info!(rolling, "Transport changed.");
        self.set_play(rolling);
        Some(rolling)
    }

    pub fn is_recording(&self) -> bool {
        self.controls.record.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.controls.play.load(Ordering::Relaxed)
    }

    /// A copy of the recorded take.
    pub fn recorded(&self) -> Vec<MidiEvent> {
        self.controls.log.snapshot()
    }

    /// The number of messages waiting to be sent.
    pub fn pending(&self) -> usize {
        self.controls.queue.pending()
    }

    pub fn stats(&self) -> Stats {
        let controls = &self.controls;
        Stats {
            dropped_notifications: controls.dropped_notifications.load(Ordering::Relaxed),
            failed_writes: controls.failed_writes.load(Ordering::Relaxed),
            dropped_records: controls.dropped_records.load(Ordering::Relaxed),
        }
    }

    /// Disarms playback and recording and stops the recorder thread. Safe to call repeatedly.
    /// Stopping playback queues all notes off, so keep the graph running until [Bridge::flush]
    /// returns.
    pub fn shutdown(&self) {
        self.disarm_play();
        self.disarm_record();
        self.recorder.stop();
        info!(stats = %self.stats(), "Bridge shut down.");
    }

    /// Waits for the graph to send every queued message. Returns false if messages were still
    /// queued when the timeout passed.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                warn!(pending = self.pending(), "Queued messages were not sent.");
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

/// A running connection to an audio graph.
pub trait Graph: fmt::Display + Send {
    fn sample_rate(&self) -> u32;

    fn buffer_size(&self) -> u32;

    /// Disconnects from the graph.
    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Connects the bridge to the configured audio graph.
pub fn open(
    config: &Config,
    bridge: &Bridge,
    quit_tx: UnboundedSender<Quit>,
) -> Result<Box<dyn Graph>, Error> {
    let graph = config.graph();
    if graph.starts_with("mock") {
        return Ok(Box::new(mock::Graph::start(
            config,
            bridge.processor(),
            quit_tx,
        )?));
    }

    match graph {
        #[cfg(feature = "jack")]
        "jack" => Ok(Box::new(jack::Graph::open(
            config,
            bridge.processor(),
            quit_tx,
        )?)),
        #[cfg(not(feature = "jack"))]
        "jack" => {
            drop(quit_tx);
            Err(Error::Unsupported(graph.to_string()))
        }
        _ => Err(Error::UnknownGraph(graph.to_string())),
    }
}

/// Lists MIDI ports on the audio graph.
pub fn list_ports(config: &Config) -> Result<Vec<String>, Error> {
    match config.graph() {
        #[cfg(feature = "jack")]
        "jack" => jack::list_ports(),
        graph if graph.starts_with("mock") => Ok(vec![
            format!("{}:{}", config.client_name(), config.input_port()),
            format!("{}:{}", config.client_name(), config.output_port()),
        ]),
        #[cfg(not(feature = "jack"))]
        "jack" => Err(Error::Unsupported("jack".to_string())),
        graph => Err(Error::UnknownGraph(graph.to_string())),
    }
}
