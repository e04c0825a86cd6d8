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
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};

pub mod monitor;

/// The number of semitones between octave steps.
const OCTAVE: u8 = 12;

const QWERTZ: [(char, u8); 31] = [
    ('y', 12),
    ('s', 13),
    ('x', 14),
    ('d', 15),
    ('c', 16),
    ('v', 17),
    ('g', 18),
    ('b', 19),
    ('h', 20),
    ('n', 21),
    ('j', 22),
    ('m', 23),
    ('q', 24),
    ('2', 25),
    ('w', 26),
    ('3', 27),
    ('e', 28),
    ('r', 29),
    ('5', 30),
    ('t', 31),
    ('6', 32),
    ('z', 33),
    ('7', 34),
    ('u', 35),
    ('i', 36),
    ('9', 37),
    ('o', 38),
    ('0', 39),
    ('p', 40),
    ('ü', 41),
    ('+', 42),
];

const AZERTY: [(char, u8); 31] = [
    ('w', 12),
    ('s', 13),
    ('x', 14),
    ('d', 15),
    ('c', 16),
    ('v', 17),
    ('g', 18),
    ('b', 19),
    ('h', 20),
    ('n', 21),
    ('j', 22),
    (',', 23),
    ('a', 24),
    ('é', 25),
    ('z', 26),
    ('"', 27),
    ('e', 28),
    ('r', 29),
    ('(', 30),
    ('t', 31),
    ('-', 32),
    ('y', 33),
    ('è', 34),
    ('u', 35),
    ('i', 36),
    ('ç', 37),
    ('o', 38),
    ('à', 39),
    ('p', 40),
    ('^', 41),
    ('¨', 41),
];

/// A computer keyboard layout used to map typed keys onto notes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Qwertz,
    Qwerty,
    Azerty,
}

impl Layout {
    pub const ALL: [Layout; 3] = [Layout::Qwertz, Layout::Qwerty, Layout::Azerty];

    /// The note for the key before any octave offset, between 12 and 42.
    pub fn note_for(&self, key: char) -> Option<u8> {
        let key = key.to_lowercase().next().unwrap_or(key);
        match self {
            Layout::Qwertz => lookup(&QWERTZ, key),
            // The same rows with the y and z keys trading places.
            Layout::Qwerty => lookup(&QWERTZ, key).map(|note| match note {
                12 => 33,
                33 => 12,
                note => note,
            }),
            Layout::Azerty => lookup(&AZERTY, key),
        }
    }

    /// Every mapped key and its note, lowest note first.
    pub fn keys(&self) -> Vec<(char, u8)> {
        let table: &[(char, u8)] = match self {
            Layout::Qwertz | Layout::Qwerty => &QWERTZ,
            Layout::Azerty => &AZERTY,
        };
        let mut keys = table
            .iter()
            .filter_map(|(key, _)| self.note_for(*key).map(|note| (*key, note)))
            .collect::<Vec<(char, u8)>>();
        keys.sort_by_key(|(_, note)| *note);
        keys
    }
}

fn lookup(table: &[(char, u8)], key: char) -> Option<u8> {
    table
        .iter()
        .find(|(mapped, _)| *mapped == key)
        .map(|(_, note)| *note)
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layout::Qwertz => "qwertz",
            Layout::Qwerty => "qwerty",
            Layout::Azerty => "azerty",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "qwertz" => Ok(Layout::Qwertz),
            "qwerty" => Ok(Layout::Qwerty),
            "azerty" => Ok(Layout::Azerty),
            _ => Err(format!("unknown keyboard layout '{}'", s)),
        }
    }
}

/// Maps a typed key to a MIDI note, shifted up by the given number of octaves. Keys that are not
/// part of the layout, or that land outside the MIDI note range, map to nothing.
pub fn note_for_key(layout: Layout, key: char, octave: u8) -> Option<u8> {
    let note = layout.note_for(key)? as u16 + octave as u16 * OCTAVE as u16;
    u8::try_from(note).ok().filter(|note| *note < 128)
}

/// The on/off state of all 128 notes. Safe to share between the notification consumer and the
/// threads that read it.
#[derive(Default)]
pub struct KeyMatrix {
    words: [AtomicU32; 4],
}

impl KeyMatrix {
    pub fn new() -> KeyMatrix {
        KeyMatrix::default()
    }

    /// Marks the note as on or off. Notes outside the MIDI range are ignored.
    pub fn set(&self, note: u8, on: bool) {
        if note >= 128 {
            return;
        }
        let bit = 1u32 << (note % 32);
        let word = &self.words[(note / 32) as usize];
        if on {
            word.fetch_or(bit, Ordering::Relaxed);
        } else {
            word.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    pub fn is_set(&self, note: u8) -> bool {
        if note >= 128 {
            return false;
        }
        self.words[(note / 32) as usize].load(Ordering::Relaxed) & (1u32 << (note % 32)) != 0
    }

    /// True if any note is on.
    pub fn any(&self) -> bool {
        self.words
            .iter()
            .any(|word| word.load(Ordering::Relaxed) != 0)
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// The notes that are on, lowest first.
    pub fn active(&self) -> Vec<u8> {
        (0..128u8).filter(|note| self.is_set(*note)).collect()
    }
}
