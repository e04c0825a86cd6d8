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
use std::{io, sync::Arc, time::Duration};

use crossbeam_channel::Receiver;
use tracing::warn;

use super::KeyMatrix;
use crate::{
    bridge::{Bridge, Stats},
    midi::{note_name, KeyEvent},
    worker::timer::Timer,
};

/// Keeps the incoming key matrix in step with the bridge's key notifications and renders the
/// active keys whenever they change. Playback follows the graph's transport on every tick.
pub struct Monitor<W: io::Write> {
    bridge: Arc<Bridge>,
    key_events: Receiver<KeyEvent>,
    typed: Arc<KeyMatrix>,
    incoming: Arc<KeyMatrix>,
    writer: W,
    last_typed: Vec<u8>,
    last_incoming: Vec<u8>,
    stats: Stats,
}

impl<W: io::Write> Monitor<W> {
    pub fn new(
        bridge: Arc<Bridge>,
        typed: Arc<KeyMatrix>,
        incoming: Arc<KeyMatrix>,
        writer: W,
    ) -> Monitor<W> {
        Monitor {
            key_events: bridge.key_events(),
            bridge,
            typed,
            incoming,
            writer,
            last_typed: Vec::new(),
            last_incoming: Vec::new(),
            stats: Stats::default(),
        }
    }

    /// Drains pending key notifications and renders the key state if it changed. Returns true if
    /// anything was rendered.
    pub fn tick(&mut self) -> Result<bool, io::Error> {
        for key in self.key_events.try_iter() {
            self.incoming.set(key.note, key.on);
        }

        if self.bridge.follow_transport() == Some(false) {
            self.incoming.clear();
        }

        let stats = self.bridge.stats();
        if stats.total() > self.stats.total() {
            warn!(stats = %stats, "Bridge is dropping events.");
        }
        self.stats = stats;

        let typed = self.typed.active();
        let incoming = self.incoming.active();
        if typed == self.last_typed && incoming == self.last_incoming {
            return Ok(false);
        }

        writeln!(
            self.writer,
            "Keys: {} | In: {}",
            names(&typed),
            names(&incoming)
        )?;
        self.writer.flush()?;
        self.last_typed = typed;
        self.last_incoming = incoming;
        Ok(true)
    }
}

impl<W: io::Write + Send + 'static> Monitor<W> {
    /// Runs the monitor on the timer until the timer is stopped.
    pub fn start(mut self, timer: &Timer, interval: Duration) -> Result<(), io::Error> {
        timer.start(interval, move || {
            if let Err(e) = self.tick() {
                warn!(err = %e, "Unable to render keys.");
            }
        })
    }
}

fn names(notes: &[u8]) -> String {
    if notes.is_empty() {
        return "-".to_string();
    }
    notes
        .iter()
        .map(|note| note_name(*note))
        .collect::<Vec<String>>()
        .join(" ")
}
