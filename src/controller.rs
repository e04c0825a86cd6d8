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
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{error, info, span, Level};

use crate::keyboard::Layout;
use crate::midi::Controller as Cc;

pub mod keyboard;
mod surface;

pub use surface::Surface;

/// Gestures on the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A computer keyboard key was pressed. Mapped to a note through the current layout.
    KeyDown(char),

    /// A computer keyboard key was released.
    KeyUp(char),

    /// A knob controller was moved to the given value.
    Control(Cc, u8),

    /// The pitch bend knob was moved to the given value, 0-127.
    PitchBend(u8),

    Sustain(bool),

    Sostenuto(bool),

    /// Selects a bank, resending the current program.
    Bank(u8),

    /// Selects a program in the current bank.
    Program(u8),

    /// Sets the note on velocity.
    Velocity(u8),

    /// Moves the surface to another MIDI channel.
    Channel(u8),

    /// Sets the octave offset for typed keys.
    Octave(u8),

    /// Switches the typing layout.
    Layout(Layout),

    /// Arms or disarms recording.
    Record(bool),

    /// Arms or disarms looped playback.
    Play(bool),

    /// Releases every typed key and sends all notes off.
    Panic,

    /// Asks the application to shut down.
    Quit,
}

pub trait Driver: Send + Sync + 'static {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>>;
}

/// How the controller finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The driver asked to quit.
    Quit,

    /// The driver stopped producing events.
    Closed,
}

/// Feeds driver events to the control surface.
pub struct Controller {
    handle: JoinHandle<Exit>,
}

impl Controller {
    /// Creates a new controller with the given driver.
    pub fn new(surface: Surface, driver: Arc<dyn Driver>) -> Controller {
        Controller {
            handle: tokio::spawn(async move { Controller::trigger_events(surface, driver).await }),
        }
    }

    /// Join will block until the controller finishes.
    pub async fn join(&mut self) -> Result<Exit, JoinError> {
        (&mut self.handle).await
    }

    async fn trigger_events(surface: Surface, driver: Arc<dyn Driver>) -> Exit {
        let span = span!(Level::INFO, "controller");
        let _enter = span.enter();

        let (events_tx, mut events_rx) = mpsc::channel(1);
        let join_handle = driver.monitor_events(events_tx);

        let session = surface.session();
        info!(
            channel = session.channel,
            layout = %session.layout,
            octave = session.octave,
            "Controller started."
        );

        loop {
            match events_rx.recv().await {
                Some(Event::Quit) => {
                    info!("Quit requested.");
                    return Exit::Quit;
                }
                Some(event) => {
                    info!(event = format!("{:?}", event), "Received event.");
                    if let Err(e) = surface.handle(event) {
                        error!("Error talking to bridge: {}", e);
                    }
                }
                None => {
                    info!("Controller closing.");
                    match join_handle.await {
                        Ok(Err(e)) => error!("Event monitor failed: {}", e),
                        Err(e) => error!("Error waiting for event monitor to stop: {}", e),
                        Ok(Ok(())) => {}
                    }
                    return Exit::Closed;
                }
            }
        }
    }
}
