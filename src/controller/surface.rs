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
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::Event;
use crate::{
    bridge::{self, Bridge},
    config::{Session, MAX_OCTAVE},
    keyboard::{note_for_key, KeyMatrix},
    midi::{Controller, Message},
};

/// Turns gestures into bridge messages and toggles, keeping the session in step.
pub struct Surface {
    bridge: Arc<Bridge>,
    session: Arc<Mutex<Session>>,
    typed: Arc<KeyMatrix>,
    incoming: Arc<KeyMatrix>,
}

impl Surface {
    /// Creates a surface and moves the bridge to the session's channel.
    pub fn new(
        bridge: Arc<Bridge>,
        session: Arc<Mutex<Session>>,
        typed: Arc<KeyMatrix>,
        incoming: Arc<KeyMatrix>,
    ) -> Surface {
        bridge.set_channel(session.lock().channel);
        Surface {
            bridge,
            session,
            typed,
            incoming,
        }
    }

    /// A copy of the current session.
    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    pub fn shared_session(&self) -> Arc<Mutex<Session>> {
        self.session.clone()
    }

    pub fn handle(&self, event: Event) -> Result<(), bridge::Error> {
        match event {
            Event::KeyDown(key) => self.key(key, true),
            Event::KeyUp(key) => self.key(key, false),
            Event::Control(controller, value) => {
                self.send(Message::control_change(controller, value.min(127)))
            }
            Event::PitchBend(value) => self.send(Message::pitch_bend(128 * value.min(127) as u16)),
            Event::Sustain(on) => self.send(Message::control_change(
                Controller::Sustain,
                if on { 127 } else { 0 },
            )),
            Event::Sostenuto(on) => self.send(Message::control_change(
                Controller::Sostenuto,
                if on { 127 } else { 0 },
            )),
            Event::Bank(bank) => {
                self.session.lock().bank = bank.min(127);
                self.select_program();
            }
            Event::Program(program) => {
                self.session.lock().program = program.min(127);
                self.select_program();
            }
            Event::Velocity(velocity) => self.session.lock().velocity = velocity.min(127),
            Event::Channel(channel) => {
                let channel = channel.min(15);
                self.session.lock().channel = channel;
                self.bridge.set_channel(channel);
                if self.bridge.is_playing() {
                    self.incoming.clear();
                }
            }
            Event::Octave(octave) => self.session.lock().octave = octave.min(MAX_OCTAVE),
            Event::Layout(layout) => self.session.lock().layout = layout,
            Event::Record(on) => {
                // Arming stops playback, which leaves no keys sounding.
                if on && self.bridge.is_playing() {
                    self.incoming.clear();
                }
                self.bridge.set_record(on)?;
            }
            Event::Play(on) => {
                if on {
                    self.bridge.set_play(true);
                } else {
                    self.stop_playback();
                }
            }
            Event::Panic => {
                self.typed.clear();
                self.send(Message::all_notes_off());
            }
            Event::Quit => {}
        }
        Ok(())
    }

    /// Presses or releases the note under the key. Repeated presses of a held key are ignored.
    fn key(&self, key: char, on: bool) {
        let (layout, octave, velocity) = {
            let session = self.session.lock();
            (session.layout, session.octave, session.velocity)
        };
        let Some(note) = note_for_key(layout, key, octave) else {
            debug!(key = %key, "Key is not mapped to a note.");
            return;
        };

        if on == self.typed.is_set(note) {
            return;
        }
        self.typed.set(note, on);
        if on {
            self.send(Message::note_on(note, velocity));
        } else {
            self.send(Message::note_off(note, 0));
        }
    }

    /// Sends the bank, then the program.
    fn select_program(&self) {
        let (bank, program) = {
            let session = self.session.lock();
            (session.bank, session.program)
        };
        self.send(Message::control_change(Controller::BankSelectLsb, bank));
        self.send(Message::program_change(program));
        info!(bank, program, "Program selected.");
    }

    fn stop_playback(&self) {
        self.bridge.set_play(false);
        self.incoming.clear();
    }

    fn send(&self, message: Message) {
        if !self.bridge.send(message) {
            debug!(message = %message, "Queue full, message dropped.");
        }
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, sync::Arc};

    use parking_lot::Mutex;

    use crate::{
        bridge::{
            test::{bridge, BufferWriter},
            Block, Bridge, Processor, RawEvent,
        },
        config::Session,
        controller::Event,
        keyboard::{KeyMatrix, Layout},
        midi::Controller,
    };

    use super::Surface;

    struct Fixture {
        surface: Surface,
        bridge: Arc<Bridge>,
        processor: Processor,
        typed: Arc<KeyMatrix>,
        incoming: Arc<KeyMatrix>,
        frame_time: u32,
    }

    impl Fixture {
        fn new(session: Session) -> Fixture {
            let bridge = Arc::new(bridge("{}"));
            let typed = Arc::new(KeyMatrix::new());
            let incoming = Arc::new(KeyMatrix::new());
            let surface = Surface::new(
                bridge.clone(),
                Arc::new(Mutex::new(session)),
                typed.clone(),
                incoming.clone(),
            );
            Fixture {
                processor: bridge.processor(),
                surface,
                bridge,
                typed,
                incoming,
                frame_time: 0,
            }
        }

        fn handle(&self, events: &[Event]) -> Result<(), Box<dyn Error>> {
            for event in events {
                self.surface.handle(*event)?;
            }
            Ok(())
        }

        /// Runs one block and returns the bytes written.
        fn sent(&mut self) -> Vec<Vec<u8>> {
            let mut output = BufferWriter::new();
            self.processor.process(
                Block {
                    frames: 32,
                    frame_time: self.frame_time,
                },
                std::iter::empty::<RawEvent>(),
                &mut output,
            );
            self.frame_time += 32;
            output.events.into_iter().map(|(_, bytes)| bytes).collect()
        }
    }

    #[test]
    fn test_typed_keys() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session::default());
        fixture.handle(&[Event::KeyDown('q'), Event::KeyDown('q'), Event::KeyDown('a')])?;
        assert!(fixture.typed.is_set(48));
        assert_eq!(vec![vec![0x90, 48, 127]], fixture.sent());

        fixture.handle(&[Event::KeyUp('q'), Event::KeyUp('q')])?;
        assert!(!fixture.typed.any());
        assert_eq!(vec![vec![0x80, 48, 0]], fixture.sent());
        Ok(())
    }

    #[test]
    fn test_octave_velocity_and_layout() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session::default());
        fixture.handle(&[
            Event::Octave(9),
            Event::Velocity(200),
            Event::Layout(Layout::Qwerty),
            Event::KeyDown('y'),
        ])?;

        let session = fixture.surface.session();
        assert_eq!(4, session.octave);
        assert_eq!(127, session.velocity);
        assert_eq!(Layout::Qwerty, session.layout);
        assert_eq!(vec![vec![0x90, 81, 127]], fixture.sent());
        Ok(())
    }

    #[test]
    fn test_controllers() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session::default());
        fixture.handle(&[
            Event::Control(Controller::ModWheel, 20),
            Event::Control(Controller::Volume, 200),
            Event::Sustain(true),
            Event::Sostenuto(false),
            Event::PitchBend(64),
        ])?;
        assert_eq!(
            vec![
                vec![0xB0, 1, 20],
                vec![0xB0, 39, 127],
                vec![0xB0, 64, 127],
                vec![0xB0, 66, 0],
                vec![0xE0, 0, 64],
            ],
            fixture.sent()
        );
        Ok(())
    }

    #[test]
    fn test_bank_and_program() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session::default());
        fixture.handle(&[Event::Program(5)])?;
        assert_eq!(vec![vec![0xB0, 32, 0], vec![0xC0, 5]], fixture.sent());

        fixture.handle(&[Event::Bank(2)])?;
        assert_eq!(vec![vec![0xB0, 32, 2], vec![0xC0, 5]], fixture.sent());

        let session = fixture.surface.session();
        assert_eq!(2, session.bank);
        assert_eq!(5, session.program);
        Ok(())
    }

    #[test]
    fn test_channel() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session {
            channel: 3,
            ..Session::default()
        });
        assert_eq!(3, fixture.bridge.channel());

        fixture.handle(&[Event::Channel(20), Event::Panic])?;
        assert_eq!(15, fixture.bridge.channel());
        assert_eq!(15, fixture.surface.session().channel);
        assert_eq!(vec![vec![0xBF, 123, 0]], fixture.sent());
        Ok(())
    }

    #[test]
    fn test_panic_releases_typed_keys() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session::default());
        fixture.handle(&[Event::KeyDown('q'), Event::KeyDown('w'), Event::Panic])?;
        assert!(!fixture.typed.any());
        assert_eq!(
            vec![
                vec![0x90, 48, 127],
                vec![0x90, 50, 127],
                vec![0xB0, 123, 0]
            ],
            fixture.sent()
        );

        // The key can be pressed again after a panic.
        fixture.handle(&[Event::KeyDown('q')])?;
        assert_eq!(vec![vec![0x90, 48, 127]], fixture.sent());
        Ok(())
    }

    #[test]
    fn test_record_and_play_toggles() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session::default());
        fixture.handle(&[Event::Record(true), Event::KeyDown('q')])?;
        assert!(fixture.bridge.is_recording());
        fixture.sent();

        fixture.handle(&[Event::Play(true)])?;
        assert!(fixture.bridge.is_playing());
        assert!(!fixture.bridge.is_recording());
        assert_eq!(1, fixture.bridge.recorded().len());

        fixture.incoming.set(60, true);
        fixture.handle(&[Event::Channel(2)])?;
        assert!(!fixture.incoming.any());

        fixture.incoming.set(60, true);
        fixture.handle(&[Event::Record(true)])?;
        assert!(!fixture.incoming.any());
        assert!(fixture.bridge.is_recording());
        assert!(!fixture.bridge.is_playing());
        assert!(fixture.bridge.recorded().is_empty());

        fixture.bridge.shutdown();
        Ok(())
    }

    #[test]
    fn test_play_off_clears_incoming_keys() -> Result<(), Box<dyn Error>> {
        let mut fixture = Fixture::new(Session::default());
        fixture.handle(&[Event::Play(true)])?;
        fixture.incoming.set(64, true);

        fixture.handle(&[Event::Play(false)])?;
        assert!(!fixture.bridge.is_playing());
        assert!(!fixture.incoming.any());
        assert_eq!(vec![vec![0xB0, 123, 0]], fixture.sent());
        Ok(())
    }
}
