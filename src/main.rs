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
use clap::{crate_version, Parser, Subcommand};
use keybridge::bridge::{self, Bridge};
use keybridge::config::{Config, Session};
use keybridge::controller::{self, Controller, Exit, Surface};
use keybridge::keyboard::{monitor::Monitor, KeyMatrix, Layout};
use keybridge::midi::note_name;
use keybridge::worker::timer::Timer;
use parking_lot::Mutex;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const SYSTEMD_SERVICE: &str = r#"
[Unit]
Description=virtual MIDI keyboard bridge
After=jack.service

[Service]
Type=simple
Restart=on-failure
EnvironmentFile=-/etc/default/keybridge
ExecStart=/usr/local/bin/keybridge start --config "$KEYBRIDGE_CONFIG"

[Install]
WantedBy=multi-user.target
Alias=keybridge.service
"#;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A virtual MIDI keyboard bridge."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start will connect to the audio graph and read commands from the terminal.
    Start {
        /// The path to the bridge config.
        #[arg[short, long]]
        config: Option<PathBuf>,
    },
    /// Lists the MIDI ports on the audio graph.
    Ports {
        /// The path to the bridge config.
        #[arg[short, long]]
        config: Option<PathBuf>,
    },
    /// Prints the key to note mapping of every keyboard layout.
    Layouts {},
    /// Prints a systemd service definition to stdout.
    Systemd {},
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => {
            start(load_config(config)?).await?;
            // The terminal driver may still be blocked reading stdin.
            std::process::exit(0);
        }
        Commands::Ports { config } => {
            for port in bridge::list_ports(&load_config(config)?)? {
                println!("{}", port);
            }
        }
        Commands::Layouts {} => {
            for layout in Layout::ALL {
                println!("{}:", layout);
                for (key, note) in layout.keys() {
                    println!("  {} -> {} ({})", key, note, note_name(note));
                }
            }
        }
        Commands::Systemd {} => {
            println!("{}", SYSTEMD_SERVICE)
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn Error>> {
    match path {
        Some(path) => Ok(Config::load(&path)?),
        None => Ok(Config::default()),
    }
}

/// Runs the bridge until the controller quits, Ctrl-C is pressed or the audio graph goes away.
async fn start(config: Config) -> Result<(), Box<dyn Error>> {
    let refresh_interval = config.refresh_interval()?;
    let session_path = config.session_path();
    let session = Arc::new(Mutex::new(Session::load(&session_path)));

    let bridge = Arc::new(Bridge::new(&config));
    let (quit_tx, mut quit_rx) = mpsc::unbounded_channel();
    let graph = bridge::open(&config, &bridge, quit_tx)?;
    info!(graph = %graph, "Bridge connected.");

    let typed = Arc::new(KeyMatrix::new());
    let incoming = Arc::new(KeyMatrix::new());
    let timer = Timer::new("key-monitor");
    Monitor::new(bridge.clone(), typed.clone(), incoming.clone(), io::stdout())
        .start(&timer, refresh_interval)?;

    let surface = Surface::new(bridge.clone(), session.clone(), typed, incoming);
    let mut controller = Controller::new(surface, Arc::new(controller::keyboard::Driver::new()));

    let mut closed = false;
    loop {
        tokio::select! {
            result = controller.join(), if !closed => match result {
                Ok(Exit::Quit) => break,
                Ok(Exit::Closed) => {
                    info!("Terminal closed, running until interrupted.");
                    closed = true;
                }
                Err(e) => {
                    error!("Error waiting for controller: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted.");
                break;
            }
            Some(quit) = quit_rx.recv() => {
                warn!(reason = quit.reason, "Audio graph went away.");
                break;
            }
        }
    }

    timer.stop();
    bridge.shutdown();
    // Give the graph a few blocks to send the all notes off queued by the shutdown.
    let block = Duration::from_secs_f64(graph.buffer_size() as f64 / graph.sample_rate() as f64);
    bridge.flush(block * 4 + Duration::from_millis(20));
    if let Err(e) = graph.close() {
        error!("Error closing audio graph: {}", e);
    }

    let session = session.lock().clone();
    session.save(&session_path)?;
    Ok(())
}
