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
    path::{Path, PathBuf},
    time::Duration,
};

use config::{File, FileFormat};
use duration_string::DurationString;
use serde::Deserialize;

mod error;
mod session;

pub use error::ConfigError;
pub use session::{Session, MAX_OCTAVE};

const DEFAULT_CLIENT_NAME: &str = "keybridge";
const DEFAULT_GRAPH: &str = "jack";
const DEFAULT_INPUT_PORT: &str = "in";
const DEFAULT_OUTPUT_PORT: &str = "out";
const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(30);
const DEFAULT_BLOCK_SIZE: u32 = 256;
const DEFAULT_SAMPLE_RATE: u32 = 48000;
const SESSION_FILE: &str = "keybridge-session.yaml";

/// A YAML representation of the bridge configuration. Every field is optional.
#[derive(Deserialize, Clone, Default, Debug)]
pub struct Config {
    /// The name the bridge registers with the audio graph.
    client_name: Option<String>,

    /// The audio graph to connect to: jack, or mock for the simulated graph.
    graph: Option<String>,

    /// The name of the MIDI input port.
    input_port: Option<String>,

    /// The name of the MIDI output port.
    output_port: Option<String>,

    /// The number of outgoing message slots.
    queue_capacity: Option<usize>,

    /// The number of events each half of the record buffer holds.
    record_buffer_capacity: Option<usize>,

    /// The number of key notifications that can wait for the monitor.
    notification_capacity: Option<usize>,

    /// How often the key monitor runs, e.g. 30ms.
    refresh_interval: Option<String>,

    /// Frames per block for the simulated graph.
    block_size: Option<u32>,

    /// Sample rate for the simulated graph.
    sample_rate: Option<u32>,

    /// Where the session is kept between runs.
    session: Option<PathBuf>,
}

impl Config {
    /// Loads the configuration from the given YAML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        Ok(config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()?)
    }

    /// Parses the configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Config, ConfigError> {
        Ok(config::Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()?)
    }

    pub fn client_name(&self) -> &str {
        self.client_name.as_deref().unwrap_or(DEFAULT_CLIENT_NAME)
    }

    pub fn graph(&self) -> &str {
        self.graph.as_deref().unwrap_or(DEFAULT_GRAPH)
    }

    pub fn input_port(&self) -> &str {
        self.input_port.as_deref().unwrap_or(DEFAULT_INPUT_PORT)
    }

    pub fn output_port(&self) -> &str {
        self.output_port.as_deref().unwrap_or(DEFAULT_OUTPUT_PORT)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(crate::queue::DEFAULT_CAPACITY)
            .max(1)
    }

    pub fn record_buffer_capacity(&self) -> usize {
        self.record_buffer_capacity
            .unwrap_or(crate::recorder::DEFAULT_CAPACITY)
            .max(1)
    }

    pub fn notification_capacity(&self) -> usize {
        self.notification_capacity
            .unwrap_or(DEFAULT_NOTIFICATION_CAPACITY)
            .max(1)
    }

    /// Returns the key monitor interval from the configuration.
    pub fn refresh_interval(&self) -> Result<Duration, ConfigError> {
        match &self.refresh_interval {
            Some(interval) => Ok(DurationString::from_string(interval.clone())
                .map_err(|e| ConfigError::Duration(format!("{} ({})", interval, e)))?
                .into()),
            None => Ok(DEFAULT_REFRESH_INTERVAL),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE).max(1)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE).max(1)
    }

    /// The session file. Defaults to the user's config directory, $XDG_CONFIG_HOME or
    /// $HOME/.config.
    pub fn session_path(&self) -> PathBuf {
        if let Some(session) = &self.session {
            return session.clone();
        }

        match std::env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(SESSION_FILE),
            _ => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(".config").join(SESSION_FILE),
                None => PathBuf::from(SESSION_FILE),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, io::Write, path::PathBuf, time::Duration};

    use serial_test::serial;

    use super::Config;

    #[test]
    fn test_defaults() -> Result<(), Box<dyn Error>> {
        let config = Config::default();
        assert_eq!("keybridge", config.client_name());
        assert_eq!("jack", config.graph());
        assert_eq!("in", config.input_port());
        assert_eq!("out", config.output_port());
        assert_eq!(128, config.queue_capacity());
        assert_eq!(256, config.record_buffer_capacity());
        assert_eq!(256, config.notification_capacity());
        assert_eq!(Duration::from_millis(30), config.refresh_interval()?);
        assert_eq!(256, config.block_size());
        assert_eq!(48000, config.sample_rate());
        Ok(())
    }

    #[test]
    fn test_parse() -> Result<(), Box<dyn Error>> {
        let config = Config::parse(
            r#"
            client_name: studio-keys
            graph: mock
            input_port: midi_in
            output_port: midi_out
            queue_capacity: 16
            record_buffer_capacity: 8
            refresh_interval: 100ms
            block_size: 64
            sample_rate: 44100
            session: /tmp/keys.yaml
        "#,
        )?;

        assert_eq!("studio-keys", config.client_name());
        assert_eq!("mock", config.graph());
        assert_eq!("midi_in", config.input_port());
        assert_eq!("midi_out", config.output_port());
        assert_eq!(16, config.queue_capacity());
        assert_eq!(8, config.record_buffer_capacity());
        assert_eq!(Duration::from_millis(100), config.refresh_interval()?);
        assert_eq!(64, config.block_size());
        assert_eq!(44100, config.sample_rate());
        assert_eq!(PathBuf::from("/tmp/keys.yaml"), config.session_path());
        Ok(())
    }

    #[test]
    fn test_invalid_interval() -> Result<(), Box<dyn Error>> {
        let config = Config::parse("refresh_interval: soon")?;
        assert!(config.refresh_interval().is_err());
        Ok(())
    }

    #[test]
    fn test_zero_capacities_are_raised() -> Result<(), Box<dyn Error>> {
        let config = Config::parse("queue_capacity: 0\nrecord_buffer_capacity: 0")?;
        assert_eq!(1, config.queue_capacity());
        assert_eq!(1, config.record_buffer_capacity());
        Ok(())
    }

    #[test]
    fn test_load_file() -> Result<(), Box<dyn Error>> {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        writeln!(file, "graph: mock\nblock_size: 32")?;

        let config = Config::load(file.path())?;
        assert_eq!("mock", config.graph());
        assert_eq!(32, config.block_size());

        assert!(Config::load(&file.path().with_extension("missing")).is_err());
        Ok(())
    }

    #[test]
    #[serial]
    fn test_session_path_from_environment() {
        let xdg = std::env::var_os("XDG_CONFIG_HOME");
        let home = std::env::var_os("HOME");

        std::env::set_var("XDG_CONFIG_HOME", "/xdg");
        assert_eq!(
            PathBuf::from("/xdg/keybridge-session.yaml"),
            Config::default().session_path()
        );

        std::env::remove_var("XDG_CONFIG_HOME");
        std::env::set_var("HOME", "/home/player");
        assert_eq!(
            PathBuf::from("/home/player/.config/keybridge-session.yaml"),
            Config::default().session_path()
        );

        match xdg {
            Some(xdg) => std::env::set_var("XDG_CONFIG_HOME", xdg),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
        match home {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }
    }
}
