//! Desktop simulator for the soil probe.
//!
//! Runs `probe-core` against real TCP sockets, a simulated access point,
//! file-backed credential storage and synthetic sensors. Console commands
//! are read from stdin exactly as the device reads them from its serial port.
//!
//! ```text
//! probe-simulator [config.json]
//! ```
//!
//! Start with e.g. `wifi-set lab lab-secret`, `wifi-autoconnect on` and
//! `server-autoconnect on`; a server listening on port 8000 of the simulated
//! /24 (127.0.0.0/24 by default) is then discovered, registered with and
//! streamed to.

mod devices;
mod net;

use std::fs;
use std::io::{self, BufRead};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use embassy_futures::block_on;
use embassy_time::Instant;
use log::{error, info, warn};
use serde::Deserialize;

use probe_core::console::response_line;
use probe_core::probe::{Drivers, Platform};
use probe_core::{Probe, ProbeConfig};

use devices::{FileStore, SimulatedRadio, SyntheticAnalog, SyntheticClimate};
use net::{StdHttpClient, StdWsTransport};

/// Main loop period
const TICK: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
#[serde(default)]
struct SimulatorConfig {
    /// Credentials the simulated access point accepts
    network_name: String,
    network_secret: String,
    /// Address the station gets once associated
    local_address: Ipv4Addr,
    /// File standing in for the credential flash sector
    store_path: PathBuf,
    probe: ProbeConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            network_name: "lab".into(),
            network_secret: "lab-secret".into(),
            local_address: Ipv4Addr::new(127, 0, 0, 20),
            store_path: PathBuf::from("probe-credentials.bin"),
            probe: ProbeConfig::default(),
        }
    }
}

fn load_config() -> SimulatorConfig {
    let Some(path) = std::env::args().nth(1) else {
        return SimulatorConfig::default();
    };

    match fs::read_to_string(&path).map(|text| serde_json::from_str(&text)) {
        Ok(Ok(config)) => {
            info!("Loaded configuration from {}", path);
            config
        }
        Ok(Err(e)) => {
            error!("{} is not a valid configuration: {}", path, e);
            SimulatorConfig::default()
        }
        Err(e) => {
            error!("Cannot read {}: {}", path, e);
            SimulatorConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

struct Desktop;

impl Platform for Desktop {
    type Store = FileStore;
    type Radio = SimulatedRadio;
    type Http = StdHttpClient;
    type Stream = StdWsTransport;
    type Climate = SyntheticClimate;
    type Analog = SyntheticAnalog;
}

/// Forward stdin lines to the main loop
fn spawn_console() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    info!("Starting soil probe simulator");

    let config = load_config();
    info!(
        "Access point '{}', station address {}, store {}",
        config.network_name,
        config.local_address,
        config.store_path.display()
    );

    let http = match StdHttpClient::new() {
        Ok(http) => http,
        Err(e) => {
            error!("Could not build HTTP client: {:?}", e);
            return;
        }
    };

    let drivers = Drivers::<Desktop> {
        store: FileStore::new(&config.store_path),
        radio: SimulatedRadio::new(
            &config.network_name,
            &config.network_secret,
            config.local_address,
        ),
        http,
        stream: StdWsTransport::new(config.probe.request_timeout()),
        climate: SyntheticClimate::new(),
        analog: SyntheticAnalog::new(),
    };
    let mut probe = Probe::new(drivers, config.probe);
    let console = spawn_console();

    loop {
        let now = Instant::now();

        match console.try_recv() {
            Ok(line) => {
                let result = probe.execute(&line, now);
                println!("{}", response_line(&result));
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        block_on(probe.tick(now));
        thread::sleep(TICK);
    }

    info!("Simulator exiting");
}
