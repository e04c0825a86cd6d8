// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
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
use std::io;

use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{info, span, warn, Level};

use super::Event;
use crate::{keyboard::Layout, midi::Controller};

const TAP: &str = "tap";
const DOWN: &str = "down";
const UP: &str = "up";
const BEND: &str = "bend";
const SUSTAIN: &str = "sustain";
const SOSTENUTO: &str = "sostenuto";
const BANK: &str = "bank";
const PROGRAM: &str = "program";
const VELOCITY: &str = "velocity";
const CHANNEL: &str = "channel";
const OCTAVE: &str = "octave";
const LAYOUT: &str = "layout";
const RECORD: &str = "record";
const PLAY: &str = "play";
const PANIC: &str = "panic";
const QUIT: &str = "quit";
const HELP: &str = "help";

/// Knob names and the controllers they move.
const KNOBS: [(&str, Controller); 7] = [
    ("mod", Controller::ModWheel),
    ("balance", Controller::Balance),
    ("expression", Controller::Expression),
    ("volume", Controller::Volume),
    ("release", Controller::ReleaseTime),
    ("attack", Controller::AttackTime),
    ("detune", Controller::Detune),
];

const USAGE: &str = "\
tap <keys>          press and release typed keys
down <keys>         press typed keys
up <keys>           release typed keys
mod|balance|expression|volume|release|attack|detune <0-127>
bend <0-127>        pitch bend, 64 is centered
sustain on|off
sostenuto on|off
bank <n>, program <n>, velocity <n>, channel <0-15>, octave <0-4>
layout qwertz|qwerty|azerty
record on|off, play on|off
panic               release every key and send all notes off
quit";

/// A driver that reads commands from the terminal.
pub struct Driver {}

impl Driver {
    pub fn new() -> Driver {
        Driver {}
    }

    /// Reads and dispatches one command. Returns false once the reader is exhausted.
    fn monitor_io<R, W>(
        events_tx: &Sender<Event>,
        mut reader: R,
        mut writer: W,
    ) -> Result<bool, io::Error>
    where
        R: io::BufRead,
        W: io::Write,
    {
        write!(writer, "Command ({} for a list): ", HELP)?;
        writer.flush()?;
        let mut input: String = String::default();
        if reader.read_line(&mut input)? == 0 {
            return Ok(false);
        }

        let input = input.trim();
        if input.is_empty() {
            return Ok(true);
        }
        if input.eq_ignore_ascii_case(HELP) {
            writeln!(writer, "{}", USAGE)?;
            return Ok(true);
        }

        match parse(input) {
            Some(events) => {
                for event in events {
                    events_tx
                        .blocking_send(event)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                }
            }
            None => warn!(input = input, "Unrecognized input"),
        }
        Ok(true)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new()
    }
}

/// Parses a command line into the events it stands for.
fn parse(input: &str) -> Option<Vec<Event>> {
    let (command, argument) = match input.split_once(char::is_whitespace) {
        Some((command, argument)) => (command.to_lowercase(), argument.trim()),
        None => (input.to_lowercase(), ""),
    };

    let event = match command.as_str() {
        TAP => {
            return Some(
                keys(argument)?
                    .flat_map(|key| [Event::KeyDown(key), Event::KeyUp(key)])
                    .collect(),
            )
        }
        DOWN => return Some(keys(argument)?.map(Event::KeyDown).collect()),
        UP => return Some(keys(argument)?.map(Event::KeyUp).collect()),
        BEND => Event::PitchBend(value(argument)?),
        SUSTAIN => Event::Sustain(switch(argument)?),
        SOSTENUTO => Event::Sostenuto(switch(argument)?),
        BANK => Event::Bank(value(argument)?),
        PROGRAM => Event::Program(value(argument)?),
        VELOCITY => Event::Velocity(value(argument)?),
        CHANNEL => Event::Channel(argument.parse::<u8>().ok().filter(|c| *c < 16)?),
        OCTAVE => Event::Octave(argument.parse::<u8>().ok()?),
        LAYOUT => Event::Layout(argument.parse::<Layout>().ok()?),
        RECORD => Event::Record(switch(argument)?),
        PLAY => Event::Play(switch(argument)?),
        PANIC if argument.is_empty() => Event::Panic,
        QUIT if argument.is_empty() => Event::Quit,
        knob => {
            let (_, controller) = KNOBS.iter().find(|(name, _)| *name == knob)?;
            Event::Control(*controller, value(argument)?)
        }
    };
    Some(vec![event])
}

/// The characters of a non-empty key argument, ignoring whitespace.
fn keys(argument: &str) -> Option<impl Iterator<Item = char> + '_> {
    if argument.is_empty() {
        return None;
    }
    Some(argument.chars().filter(|key| !key.is_whitespace()))
}

/// A 7 bit value.
fn value(argument: &str) -> Option<u8> {
    argument.parse::<u8>().ok().filter(|value| *value < 128)
}

fn switch(argument: &str) -> Option<bool> {
    match argument.to_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

impl super::Driver for Driver {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>> {
        tokio::task::spawn_blocking(move || {
            let span = span!(Level::INFO, "keyboard driver");
            let _enter = span.enter();

            info!("Keyboard driver started.");

            while Self::monitor_io(&events_tx, io::stdin().lock(), io::stdout())? {}

            info!("Keyboard input closed.");
            Ok(())
        })
    }
}
