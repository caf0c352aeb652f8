//! Simulated hardware: radio, flash and sensors.

use std::fs;
use std::io::{self, ErrorKind};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info};

use probe_core::credentials::{BlobStore, NetworkCredentials, RECORD_SIZE};
use probe_core::link::{LinkDriver, LinkStatus};
use probe_core::sensors::{AnalogSample, ClimateSample, SensorSource};

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

/// Time the fake access point takes to accept or reject a station
const ASSOCIATION_DELAY: Duration = Duration::from_millis(1500);

/// An access point with fixed credentials. Associating with anything else
/// fails after [`ASSOCIATION_DELAY`].
pub struct SimulatedRadio {
    network_name: String,
    network_secret: String,
    local_address: Ipv4Addr,
    /// Outcome of the pending association and when it resolves
    pending: Option<(Instant, bool)>,
    status: LinkStatus,
}

impl SimulatedRadio {
    pub fn new(network_name: &str, network_secret: &str, local_address: Ipv4Addr) -> Self {
        Self {
            network_name: network_name.to_owned(),
            network_secret: network_secret.to_owned(),
            local_address,
            pending: None,
            status: LinkStatus::Idle,
        }
    }
}

impl LinkDriver for SimulatedRadio {
    type Error = ();

    fn begin(&mut self, credentials: NetworkCredentials<'_>) -> Result<(), ()> {
        let accepted =
            credentials.name == self.network_name && credentials.secret == self.network_secret;
        debug!("Radio associating with '{}'", credentials.name);
        self.pending = Some((Instant::now() + ASSOCIATION_DELAY, accepted));
        self.status = LinkStatus::Idle;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.pending = None;
        self.status = LinkStatus::Disconnected;
    }

    fn status(&mut self) -> LinkStatus {
        if let Some((at, accepted)) = self.pending
            && Instant::now() >= at
        {
            self.pending = None;
            self.status = if accepted {
                LinkStatus::Connected
            } else {
                LinkStatus::ConnectFailed
            };
        }
        self.status
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        (self.status == LinkStatus::Connected).then_some(self.local_address)
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

/// Credential blob kept in a file. A missing or short file reads as erased
/// flash.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlobStore for FileStore {
    type Error = io::Error;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        buf.fill(0xFF);
        match fs::read(&self.path) {
            Ok(bytes) if bytes.len() == RECORD_SIZE => {
                buf.copy_from_slice(&bytes);
                Ok(())
            }
            Ok(bytes) => {
                info!(
                    "{} holds {} bytes, expected {}; treating as erased",
                    self.path.display(),
                    bytes.len(),
                    RECORD_SIZE
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        fs::write(&self.path, bytes)
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// Slowly drifting temperature and humidity
pub struct SyntheticClimate {
    started: Instant,
}

impl SyntheticClimate {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl SensorSource for SyntheticClimate {
    type Sample = ClimateSample;
    type Error = ();

    fn name(&self) -> &'static str {
        "dht11 (synthetic)"
    }

    async fn sample(&mut self) -> Result<ClimateSample, ()> {
        let t = self.started.elapsed().as_secs_f64();
        // DHT11 resolution is whole units
        let temperature = (23.0 + 3.0 * (t / 120.0).sin() + 0.5 * (t / 37.0).cos()).round();
        let humidity = (50.0 + 10.0 * (t / 180.0).sin() + 2.0 * (t / 23.0).cos()).round();
        Ok(ClimateSample {
            temperature: temperature as f32,
            humidity: humidity as f32,
        })
    }
}

/// Light following a day cycle, soil slowly drying out between waterings
pub struct SyntheticAnalog {
    started: Instant,
}

impl SyntheticAnalog {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl SensorSource for SyntheticAnalog {
    type Sample = AnalogSample;
    type Error = ();

    fn name(&self) -> &'static str {
        "pcf8591 (synthetic)"
    }

    async fn sample(&mut self) -> Result<AnalogSample, ()> {
        let t = self.started.elapsed().as_secs_f64();
        let light = 127.5 + 120.0 * (t / 300.0).sin();
        let soil = 60.0 + (t % 600.0) / 600.0 * 150.0;
        Ok(AnalogSample {
            light_raw: light.clamp(0.0, 255.0) as u8,
            soil_raw: soil.clamp(0.0, 255.0) as u8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::credentials::CredentialStore;

    #[test]
    fn test_missing_file_loads_empty() {
        let path = std::env::temp_dir().join(format!("probe-missing-{}.bin", std::process::id()));
        let _ = fs::remove_file(&path);

        let store = CredentialStore::load(FileStore::new(&path));
        assert_eq!(store.presence().bits(), 0);
        assert!(store.network().is_none());
    }

    #[test]
    fn test_file_store_persists_across_loads() {
        let path = std::env::temp_dir().join(format!("probe-store-{}.bin", std::process::id()));
        let _ = fs::remove_file(&path);

        let mut store = CredentialStore::load(FileStore::new(&path));
        store.set_server_info("127.0.0.1", "abc-123").unwrap();

        let reloaded = CredentialStore::load(FileStore::new(&path));
        assert_eq!(reloaded.server_address(), Some("127.0.0.1"));
        assert_eq!(reloaded.device_id(), Some("abc-123"));
        assert_eq!(fs::read(&path).unwrap().len(), RECORD_SIZE);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_radio_rejects_wrong_secret() {
        let mut radio = SimulatedRadio::new("lab", "secret", Ipv4Addr::LOCALHOST);
        radio
            .begin(NetworkCredentials {
                name: "lab",
                secret: "wrong",
            })
            .unwrap();
        // Skip the association delay
        radio.pending = radio.pending.map(|(_, accepted)| (Instant::now(), accepted));

        assert_eq!(radio.status(), LinkStatus::ConnectFailed);
        assert_eq!(radio.local_address(), None);
    }
}
