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
use std::{fs, io::Write, path::Path};

use config::{File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ConfigError;
use crate::keyboard::Layout;

/// The highest octave offset for typed keys.
pub const MAX_OCTAVE: u8 = 4;

/// Control surface state that survives restarts.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Session {
    /// The MIDI channel, 0-15.
    pub channel: u8,
    /// The note on velocity, 0-127.
    pub velocity: u8,
    /// The typing layout.
    pub layout: Layout,
    /// The octave offset applied to typed keys, 0-4.
    pub octave: u8,
    pub bank: u8,
    pub program: u8,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            channel: 0,
            velocity: 127,
            layout: Layout::default(),
            octave: 2,
            bank: 0,
            program: 0,
        }
    }
}

impl Session {
    /// Loads the session at the given path. A missing or unreadable file gives the defaults.
    pub fn load(path: &Path) -> Session {
        if !path.exists() {
            info!(path = ?path, "No saved session, using defaults.");
            return Session::default();
        }

        match config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()
            .and_then(|config| config.try_deserialize::<Session>())
        {
            Ok(session) => session.clamped(),
            Err(e) => {
                warn!(path = ?path, err = %e, "Unable to read session, using defaults.");
                Session::default()
            }
        }
    }

    /// Writes the session to the given path, creating its directory if needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let serialized = serde_yml::to_string(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::File::create(path)?;
        file.write_all(serialized.as_bytes())?;
        info!(path = ?path, "Session saved.");
        Ok(())
    }

    /// Pulls every value into its valid range.
    pub fn clamped(self) -> Session {
        Session {
            channel: self.channel.min(15),
            velocity: self.velocity.min(127),
            layout: self.layout,
            octave: self.octave.min(MAX_OCTAVE),
            bank: self.bank.min(127),
            program: self.program.min(127),
        }
    }
}
