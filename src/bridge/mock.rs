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
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, span, Level};

use super::{thread_priority, Block, Error, MidiWriter, Processor, Quit, RawEvent};
use crate::{config::Config, worker::Worker};

/// An event the simulated graph wrote to its output port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Emitted {
    /// The absolute frame the event was written at.
    pub frame: u32,
    pub bytes: Vec<u8>,
}

/// Output for one simulated block. Holds at most one event per frame of the block.
struct BlockWriter<'a> {
    frame_time: u32,
    room: usize,
    events: &'a mut Vec<Emitted>,
}

impl MidiWriter for BlockWriter<'_> {
    fn write(&mut self, time: u32, bytes: &[u8]) -> bool {
        if self.room == 0 {
            return false;
        }
        self.room -= 1;
        self.events.push(Emitted {
            frame: self.frame_time.wrapping_add(time),
            bytes: bytes.to_vec(),
        });
        true
    }
}

/// A simulated audio graph. A clock thread runs the processor once per block at the pace the
/// configured sample rate implies. Input can be injected and output inspected.
pub struct Graph {
    name: String,
    block_size: u32,
    sample_rate: u32,
    worker: Worker,
    input_tx: Sender<Vec<u8>>,
    emitted: Arc<Mutex<Vec<Emitted>>>,
    frame_time: Arc<AtomicU32>,
    transport: Arc<AtomicBool>,
    quit_tx: UnboundedSender<Quit>,
}

impl Graph {
    /// Starts the clock thread driving the given processor.
    pub fn start(
        config: &Config,
        processor: Processor,
        quit_tx: UnboundedSender<Quit>,
    ) -> Result<Graph, Error> {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let graph = Graph {
            name: config.client_name().to_string(),
            block_size: config.block_size(),
            sample_rate: config.sample_rate(),
            worker: Worker::new("mock-graph"),
            input_tx,
            emitted: Arc::new(Mutex::new(Vec::new())),
            frame_time: Arc::new(AtomicU32::new(0)),
            transport: Arc::new(AtomicBool::new(false)),
            quit_tx,
        };
        graph.run(processor, input_rx)?;

        info!(
            graph = %graph,
            input = config.input_port(),
            output = config.output_port(),
            "Mock graph started."
        );
        Ok(graph)
    }

    fn run(&self, mut processor: Processor, input_rx: Receiver<Vec<u8>>) -> Result<(), Error> {
        let block_size = self.block_size;
        let tick = Duration::from_secs(1).mul_f64(block_size as f64 / self.sample_rate as f64);
        let emitted = self.emitted.clone();
        let frame_time = self.frame_time.clone();
        let transport = self.transport.clone();
        let priority = thread_priority::clock_priority();
        let rt = thread_priority::rt_enabled();

        self.worker.start(move |running| {
            let span = span!(Level::INFO, "mock graph");
            let _enter = span.enter();
            thread_priority::configure_clock_thread(priority, rt);

            let mut inbox: Vec<Vec<u8>> = Vec::new();
            let mut events: Vec<Emitted> = Vec::new();
            let mut last_time = Instant::now();
            while running.load(Ordering::Acquire) {
                inbox.clear();
                inbox.extend(input_rx.try_iter());

                let now = frame_time.load(Ordering::Relaxed);
                processor.set_transport(transport.load(Ordering::Relaxed));
                let mut writer = BlockWriter {
                    frame_time: now,
                    room: block_size as usize,
                    events: &mut events,
                };
                processor.process(
                    Block {
                        frames: block_size,
                        frame_time: now,
                    },
                    inbox.iter().map(|bytes| RawEvent {
                        time: 0,
                        bytes: bytes.as_slice(),
                    }),
                    &mut writer,
                );
                if !events.is_empty() {
                    emitted.lock().append(&mut events);
                }
                frame_time.store(now.wrapping_add(block_size), Ordering::Relaxed);

                last_time += tick;
                spin_sleep::sleep(last_time.saturating_duration_since(Instant::now()));
            }
        })?;
        Ok(())
    }

    /// Delivers a raw MIDI event to the input port at the start of the next block.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.input_tx.send(bytes.to_vec());
    }

    /// Starts or stops the simulated transport.
    pub fn set_transport(&self, rolling: bool) {
        self.transport.store(rolling, Ordering::Relaxed);
    }

    /// Everything written to the output port so far.
    pub fn emitted(&self) -> Vec<Emitted> {
        self.emitted.lock().clone()
    }

    /// The frame counter at the start of the next block.
    pub fn frame_time(&self) -> u32 {
        self.frame_time.load(Ordering::Relaxed)
    }

    /// Simulates the graph going away: the clock stops and the application is told to quit.
    pub fn disconnect(&self, reason: &str) {
        self.worker.stop();
        let _ = self.quit_tx.send(Quit {
            reason: reason.to_string(),
        });
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

impl super::Graph for Graph {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.block_size
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        self.worker.stop();
        info!(graph = %self, frames = self.frame_time(), "Mock graph closed.");
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Mock, {} frames @ {}Hz)",
            self.name, self.block_size, self.sample_rate
        )
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use tokio::sync::mpsc;

    use crate::{
        bridge::{test::bridge, Graph as _, Quit},
        midi::{KeyEvent, Message},
        testutil::eventually,
    };

    use super::{Emitted, Graph};

    const CONFIG: &str = "graph: mock\nblock_size: 64\nsample_rate: 48000";

    #[test]
    fn test_sends_queued_messages() -> Result<(), Box<dyn Error>> {
        let bridge = bridge(CONFIG);
        let (quit_tx, _quit_rx) = mpsc::unbounded_channel();
        let config = crate::config::Config::parse(CONFIG)?;
        let graph = Graph::start(&config, bridge.processor(), quit_tx)?;
        assert!(graph.is_running());
        assert_eq!("keybridge (Mock, 64 frames @ 48000Hz)", graph.to_string());

        bridge.send(Message::note_on(60, 100));
        eventually(
            || {
                graph
                    .emitted()
                    .iter()
                    .any(|emitted| emitted.bytes == vec![0x90, 60, 100])
            },
            "Note was never emitted",
        );
        assert_eq!(0, bridge.pending());

        Box::new(graph).close()?;
        Ok(())
    }

    #[test]
    fn test_input_passes_through() -> Result<(), Box<dyn Error>> {
        let bridge = bridge(CONFIG);
        let key_events = bridge.key_events();
        let (quit_tx, _quit_rx) = mpsc::unbounded_channel();
        let config = crate::config::Config::parse(CONFIG)?;
        let graph = Graph::start(&config, bridge.processor(), quit_tx)?;

        graph.inject(&[0x90, 64, 80]);
        eventually(
            || {
                graph
                    .emitted()
                    .iter()
                    .any(|emitted| emitted.bytes == vec![0x90, 64, 80])
            },
            "Input was never passed through",
        );
        assert_eq!(
            Ok(KeyEvent { note: 64, on: true }),
            key_events.try_recv()
        );

        Box::new(graph).close()?;
        Ok(())
    }

    #[test]
    fn test_record_and_play() -> Result<(), Box<dyn Error>> {
        let bridge = bridge(CONFIG);
        let (quit_tx, _quit_rx) = mpsc::unbounded_channel();
        let config = crate::config::Config::parse(CONFIG)?;
        let graph = Graph::start(&config, bridge.processor(), quit_tx)?;

        bridge.set_record(true)?;
        for key in [60, 62, 64] {
            bridge.send(Message::note_on(key, 100));
            eventually(|| bridge.pending() == 0, "Queue never drained");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        bridge.set_record(false)?;
        assert_eq!(3, bridge.recorded().len());

        let before = graph.emitted().len();
        bridge.set_play(true);
        eventually(
            || graph.emitted().len() >= before + 6,
            "Take was never played back twice",
        );
        bridge.set_play(false);

        let played = graph.emitted()[before..before + 6]
            .iter()
            .map(|emitted| emitted.bytes[1])
            .collect::<Vec<u8>>();
        assert_eq!(vec![60, 62, 64, 60, 62, 64], played);

        Box::new(graph).close()?;
        bridge.shutdown();
        Ok(())
    }

    #[test]
    fn test_shutdown_flushes_all_notes_off() -> Result<(), Box<dyn Error>> {
        let bridge = bridge(CONFIG);
        let (quit_tx, _quit_rx) = mpsc::unbounded_channel();
        let config = crate::config::Config::parse(CONFIG)?;
        let graph = Graph::start(&config, bridge.processor(), quit_tx)?;

        bridge.set_record(true)?;
        bridge.send(Message::note_on(60, 100));
        eventually(|| bridge.pending() == 0, "Queue never drained");
        bridge.set_record(false)?;
        bridge.set_play(true);
        eventually(|| graph.emitted().len() >= 2, "Take was never played back");

        bridge.shutdown();
        assert!(bridge.flush(std::time::Duration::from_secs(5)));
        assert!(!bridge.is_playing());
        eventually(
            || {
                graph.emitted().last().map(|emitted| emitted.bytes.clone())
                    == Some(vec![0xB0, 123, 0])
            },
            "All notes off was never emitted",
        );

        Box::new(graph).close()?;
        Ok(())
    }

    #[test]
    fn test_transport_drives_playback() -> Result<(), Box<dyn Error>> {
        let bridge = bridge(CONFIG);
        let (quit_tx, _quit_rx) = mpsc::unbounded_channel();
        let config = crate::config::Config::parse(CONFIG)?;
        let graph = Graph::start(&config, bridge.processor(), quit_tx)?;
        assert_eq!(None, bridge.follow_transport());

        graph.set_transport(true);
        eventually(
            || bridge.follow_transport() == Some(true),
            "Transport start was never seen",
        );
        assert!(bridge.is_playing());
        assert_eq!(None, bridge.follow_transport());

        graph.set_transport(false);
        eventually(
            || bridge.follow_transport() == Some(false),
            "Transport stop was never seen",
        );
        assert!(!bridge.is_playing());

        Box::new(graph).close()?;
        bridge.shutdown();
        Ok(())
    }

    #[test]
    fn test_disconnect_requests_quit() -> Result<(), Box<dyn Error>> {
        let bridge = bridge(CONFIG);
        let (quit_tx, mut quit_rx) = mpsc::unbounded_channel();
        let config = crate::config::Config::parse(CONFIG)?;
        let graph = Graph::start(&config, bridge.processor(), quit_tx)?;

        graph.disconnect("server gone");
        assert!(!graph.is_running());
        assert_eq!(
            Ok(Quit {
                reason: "server gone".to_string()
            }),
            quit_rx.try_recv()
        );

        // Closing after a disconnect is harmless.
        Box::new(graph).close()?;
        Ok(())
    }

    #[test]
    fn test_block_writer_room() {
        let mut events = Vec::new();
        let mut writer = super::BlockWriter {
            frame_time: 100,
            room: 1,
            events: &mut events,
        };
        use crate::bridge::MidiWriter;
        assert!(writer.write(3, &[0xC0, 1]));
        assert!(!writer.write(4, &[0xC0, 2]));
        assert_eq!(
            vec![Emitted {
                frame: 103,
                bytes: vec![0xC0, 1]
            }],
            events
        );
    }
}
