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
use std::fmt;

use jack::{
    Client, ClientOptions, ClientStatus, Control, Frames, MidiIn, MidiOut, Port, ProcessScope,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use super::{Block, Error, MidiWriter, Processor, Quit, RawEvent};
use crate::config::Config;

const MIDI_PORT_TYPE: &str = "8 bit raw midi";

/// Receives server notifications on a non-realtime JACK thread.
pub struct Notifications {
    quit_tx: UnboundedSender<Quit>,
}

impl jack::NotificationHandler for Notifications {
    fn shutdown(&mut self, status: ClientStatus, reason: &str) {
        warn!(status = ?status, reason, "JACK server shut down.");
        let _ = self.quit_tx.send(Quit {
            reason: format!("JACK server shut down: {}", reason),
        });
    }

    fn sample_rate(&mut self, _: &Client, srate: Frames) -> Control {
        info!(sample_rate = srate, "JACK sample rate changed.");
        Control::Continue
    }

    fn xrun(&mut self, _: &Client) -> Control {
        warn!("JACK xrun.");
        Control::Continue
    }
}

/// The output port for the current cycle.
struct PortWriter<'a>(jack::MidiWriter<'a>);

impl MidiWriter for PortWriter<'_> {
    fn write(&mut self, time: u32, bytes: &[u8]) -> bool {
        self.0.write(&jack::RawMidi { time, bytes }).is_ok()
    }
}

/// Runs the processor on JACK's realtime thread.
pub struct Handler {
    processor: Processor,
    midi_in: Port<MidiIn>,
    midi_out: Port<MidiOut>,
}

impl jack::ProcessHandler for Handler {
    fn process(&mut self, client: &Client, ps: &ProcessScope) -> Control {
        let rolling = matches!(
            client.transport().query_state(),
            Ok(jack::TransportState::Rolling)
        );
        self.processor.set_transport(rolling);

        let block = Block {
            frames: ps.n_frames(),
            frame_time: ps.last_frame_time(),
        };
        let input = self.midi_in.iter(ps).map(|event| RawEvent {
            time: event.time,
            bytes: event.bytes,
        });
        let mut output = PortWriter(self.midi_out.writer(ps));
        self.processor.process(block, input, &mut output);
        Control::Continue
    }

    fn buffer_size(&mut self, _: &Client, size: Frames) -> Control {
        info!(buffer_size = size, "JACK buffer size changed.");
        Control::Continue
    }
}

/// An active JACK client with one MIDI input and one MIDI output port.
pub struct Graph {
    name: String,
    sample_rate: u32,
    buffer_size: u32,
    client: jack::AsyncClient<Notifications, Handler>,
}

impl Graph {
    /// Connects to a running JACK server, registers the ports and activates the client.
    pub fn open(
        config: &Config,
        processor: Processor,
        quit_tx: UnboundedSender<Quit>,
    ) -> Result<Graph, Error> {
        let (client, status) = Client::new(config.client_name(), ClientOptions::NO_START_SERVER)
            .map_err(|e| Error::Connect(e.to_string()))?;
        info!(name = client.name(), status = ?status, "Connected to JACK.");

        let midi_in = client
            .register_port(config.input_port(), MidiIn::default())
            .map_err(|e| Error::Port {
                port: config.input_port().to_string(),
                reason: e.to_string(),
            })?;
        let midi_out = client
            .register_port(config.output_port(), MidiOut::default())
            .map_err(|e| Error::Port {
                port: config.output_port().to_string(),
                reason: e.to_string(),
            })?;

        let name = client.name().to_string();
        let sample_rate = client.sample_rate() as u32;
        let buffer_size = client.buffer_size() as u32;
        let client = client
            .activate_async(
                Notifications { quit_tx },
                Handler {
                    processor,
                    midi_in,
                    midi_out,
                },
            )
            .map_err(|e| Error::Activate(e.to_string()))?;

        info!(
            name = %name,
            sample_rate,
            buffer_size,
            input = config.input_port(),
            output = config.output_port(),
            "JACK client activated."
        );
        Ok(Graph {
            name,
            sample_rate,
            buffer_size,
            client,
        })
    }
}

impl super::Graph for Graph {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        let name = self.name;
        self.client
            .deactivate()
            .map_err(|e| Error::Activate(e.to_string()))?;
        info!(name = %name, "JACK client deactivated.");
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (JACK, {} frames @ {}Hz)",
            self.name, self.buffer_size, self.sample_rate
        )
    }
}

/// Lists every MIDI port on the running JACK server.
pub fn list_ports() -> Result<Vec<String>, Error> {
    let (client, _) = Client::new("keybridge-ports", ClientOptions::NO_START_SERVER)
        .map_err(|e| Error::Connect(e.to_string()))?;
    Ok(client.ports(None, Some(MIDI_PORT_TYPE), jack::PortFlags::empty()))
}
