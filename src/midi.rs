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

use midly::{live::LiveEvent, MidiMessage};

/// Note off status nibble.
pub const NOTE_OFF: u8 = 0x80;
/// Note on status nibble.
pub const NOTE_ON: u8 = 0x90;
/// Control change status nibble.
pub const CONTROL_CHANGE: u8 = 0xB0;
/// Program change status nibble.
pub const PROGRAM_CHANGE: u8 = 0xC0;
/// Pitch bend status nibble.
pub const PITCH_BEND: u8 = 0xE0;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Controller numbers the control surface sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Controller {
    ModWheel = 1,
    Balance = 8,
    Expression = 11,
    BankSelectLsb = 32,
    Volume = 39,
    Sustain = 64,
    Sostenuto = 66,
    ReleaseTime = 72,
    AttackTime = 73,
    Detune = 94,
    AllNotesOff = 123,
}

impl Controller {
    /// The controller number.
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// A short (2 or 3 byte) channel voice message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    bytes: [u8; 3],
    len: u8,
}

impl Message {
    /// Creates a message from its raw parts. Any length other than 2 is treated as 3.
    pub const fn new(status: u8, data1: u8, data2: u8, len: u8) -> Message {
        if len == 2 {
            Message {
                bytes: [status, data1, 0],
                len: 2,
            }
        } else {
            Message {
                bytes: [status, data1, data2],
                len: 3,
            }
        }
    }

    /// A note on message on channel 0.
    pub fn note_on(key: u8, velocity: u8) -> Message {
        Message::new(NOTE_ON, key & 0x7F, velocity & 0x7F, 3)
    }

    /// A note off message on channel 0.
    pub fn note_off(key: u8, velocity: u8) -> Message {
        Message::new(NOTE_OFF, key & 0x7F, velocity & 0x7F, 3)
    }

    /// A control change message on channel 0.
    pub fn control_change(controller: Controller, value: u8) -> Message {
        Message::new(CONTROL_CHANGE, controller.number(), value & 0x7F, 3)
    }

    /// A program change message on channel 0.
    pub fn program_change(program: u8) -> Message {
        Message::new(PROGRAM_CHANGE, program & 0x7F, 0, 2)
    }

    /// A pitch bend message on channel 0. The 14 bit value is split into its low and high 7 bits.
    pub fn pitch_bend(value: u16) -> Message {
        let value = value & 0x3FFF;
        Message::new(PITCH_BEND, (value & 0x7F) as u8, (value >> 7) as u8, 3)
    }

    /// Controller 123 on channel 0.
    pub fn all_notes_off() -> Message {
        Message::control_change(Controller::AllNotesOff, 0)
    }

    /// True for controller 123 on any channel.
    pub fn is_all_notes_off(&self) -> bool {
        self.kind() == CONTROL_CHANGE && self.data1() == Controller::AllNotesOff.number()
    }

    /// Parses a 2 or 3 byte message. Returns None for anything else.
    pub fn from_bytes(bytes: &[u8]) -> Option<Message> {
        match bytes {
            [status, data1] => Some(Message::new(*status, *data1, 0, 2)),
            [status, data1, data2] => Some(Message::new(*status, *data1, *data2, 3)),
            _ => None,
        }
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    pub fn data1(&self) -> u8 {
        self.bytes[1]
    }

    pub fn data2(&self) -> u8 {
        self.bytes[2]
    }

    /// The encoded length of the message, 2 or 3.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// The status nibble without the channel.
    pub fn kind(&self) -> u8 {
        self.status() & 0xF0
    }

    /// The channel in the low nibble of the status byte.
    pub fn channel(&self) -> u8 {
        self.status() & 0x0F
    }

    /// The encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    /// Returns the message retargeted to the given channel. System messages are left alone.
    pub fn with_channel(self, channel: u8) -> Message {
        if self.status() >= 0xF0 {
            return self;
        }

        let mut message = self;
        message.bytes[0] = (self.status() & 0xF0) | (channel & 0x0F);
        message
    }

    /// The key state change this message represents when it is addressed to the given channel.
    pub fn key_event(&self, channel: u8) -> Option<KeyEvent> {
        decode_key_event(self.bytes(), channel)
    }

    /// Packs the message into a single word so it can live in an atomic.
    pub(crate) fn pack(&self) -> u32 {
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.len])
    }

    /// Reverses [Message::pack].
    pub(crate) fn unpack(packed: u32) -> Message {
        let [status, data1, data2, len] = packed.to_le_bytes();
        Message::new(status, data1, data2, len)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self
            .bytes()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<String>>()
            .join(" ");
        match LiveEvent::parse(self.bytes()) {
            Ok(event) => write!(f, "{} ({:?})", hex, event),
            Err(_) => write!(f, "{}", hex),
        }
    }
}

/// A message captured while recording. `delta_time` is the number of graph frames
/// elapsed since the previously recorded event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MidiEvent {
    message: Message,
    delta_time: f64,
}

impl MidiEvent {
    /// Creates a new recorded event.
    pub fn new(message: Message, delta_time: f64) -> MidiEvent {
        MidiEvent {
            message,
            delta_time,
        }
    }

    pub fn message(&self) -> Message {
        self.message
    }

    pub fn delta_time(&self) -> f64 {
        self.delta_time
    }
}

/// A key on the keyboard was pressed or released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub note: u8,
    pub on: bool,
}

/// Decodes a note on or note off addressed to the given channel. A note on with zero velocity
/// counts as a release. Does not allocate, so it is safe to call from the process callback.
pub fn decode_key_event(bytes: &[u8], channel: u8) -> Option<KeyEvent> {
    match LiveEvent::parse(bytes) {
        Ok(LiveEvent::Midi {
            channel: event_channel,
            message,
        }) if event_channel.as_int() == channel & 0x0F => match message {
            MidiMessage::NoteOn { key, vel } => Some(KeyEvent {
                note: key.as_int(),
                on: vel.as_int() > 0,
            }),
            MidiMessage::NoteOff { key, .. } => Some(KeyEvent {
                note: key.as_int(),
                on: false,
            }),
            _ => None,
        },
        _ => None,
    }
}

/// Returns a note name such as C4 for 60.
pub fn note_name(note: u8) -> String {
    let octave = (note / 12) as i16 - 1;
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], octave)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_constructors() {
        assert_eq!(&[0x90, 60, 100], Message::note_on(60, 100).bytes());
        assert_eq!(&[0x80, 60, 0], Message::note_off(60, 0).bytes());
        assert_eq!(
            &[0xB0, 64, 127],
            Message::control_change(Controller::Sustain, 127).bytes()
        );
        assert_eq!(&[0xC0, 5], Message::program_change(5).bytes());
        assert_eq!(&[0xB0, 123, 0], Message::all_notes_off().bytes());
    }

    #[test]
    fn test_pitch_bend_split() {
        // Centre of the 14 bit range.
        assert_eq!(&[0xE0, 0x00, 0x40], Message::pitch_bend(8192).bytes());
        assert_eq!(&[0xE0, 0x7F, 0x7F], Message::pitch_bend(0x3FFF).bytes());
        assert_eq!(&[0xE0, 0x01, 0x00], Message::pitch_bend(1).bytes());
    }

    #[test]
    fn test_with_channel() {
        let message = Message::note_on(60, 100).with_channel(9);
        assert_eq!(0x99, message.status());
        assert_eq!(9, message.channel());
        assert_eq!(NOTE_ON, message.kind());

        // Retargeting replaces the previous channel rather than combining with it.
        assert_eq!(0x93, message.with_channel(3).status());

        let sysex = Message::new(0xF8, 0, 0, 2);
        assert_eq!(sysex, sysex.with_channel(4));
    }

    #[test]
    fn test_pack() {
        for message in [
            Message::note_on(60, 100),
            Message::program_change(127),
            Message::pitch_bend(1234).with_channel(15),
        ] {
            assert_eq!(message, Message::unpack(message.pack()));
        }
        assert_ne!(
            Message::program_change(1).pack(),
            Message::new(0xC0, 1, 0, 3).pack()
        );
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(
            Some(Message::note_on(1, 2)),
            Message::from_bytes(&[0x90, 1, 2])
        );
        assert_eq!(
            Some(Message::program_change(3)),
            Message::from_bytes(&[0xC0, 3])
        );
        assert_eq!(None, Message::from_bytes(&[0xF0, 1, 2, 3, 0xF7]));
        assert_eq!(None, Message::from_bytes(&[]));
    }

    #[test]
    fn test_decode_key_event() {
        assert_eq!(
            Some(KeyEvent { note: 60, on: true }),
            decode_key_event(&[0x92, 60, 100], 2)
        );
        assert_eq!(
            Some(KeyEvent {
                note: 61,
                on: false
            }),
            decode_key_event(&[0x82, 61, 100], 2)
        );
        assert_eq!(
            Some(KeyEvent {
                note: 62,
                on: false
            }),
            decode_key_event(&[0x92, 62, 0], 2)
        );

        // Other channels and other messages are ignored.
        assert_eq!(None, decode_key_event(&[0x93, 60, 100], 2));
        assert_eq!(None, decode_key_event(&[0xB2, 64, 127], 2));
        assert_eq!(None, decode_key_event(&[0x90], 0));
    }

    #[test]
    fn test_is_all_notes_off() {
        assert!(Message::all_notes_off().is_all_notes_off());
        assert!(Message::all_notes_off().with_channel(9).is_all_notes_off());
        assert!(!Message::control_change(Controller::Sustain, 0).is_all_notes_off());
        assert!(!Message::note_on(123, 0).is_all_notes_off());
    }

    #[test]
    fn test_note_name() {
        assert_eq!("C4", note_name(60));
        assert_eq!("A4", note_name(69));
        assert_eq!("C-1", note_name(0));
        assert_eq!("G9", note_name(127));
    }
}
