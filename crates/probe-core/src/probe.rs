//! Top-level orchestrator
//!
//! [`Probe`] owns every service object and advances them once per
//! [`Probe::tick`]: link supervision, automatic provisioning (discovery,
//! registration, stream start), session upkeep, sensor sampling and frame
//! emission. Console commands run between ticks through [`Probe::execute`].

use alloc::format;
use alloc::string::String;
use core::fmt::Write;

use embassy_time::Instant;
use log::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::console::{Command, Reading, Reply};
use crate::credentials::{BlobStore, CredentialStore};
use crate::discovery;
use crate::error::{ProbeError, Result};
use crate::http::HttpClient;
use crate::link::{LinkController, LinkDriver, LinkEvent};
use crate::registration;
use crate::sensors::{AnalogSample, ClimateSample, SensorAggregator, SensorSource};
use crate::session::{Session, StreamTransport};

const HEARTBEAT_PERIOD_MS: u64 = 1000;
const HEARTBEAT_ON_MS: u64 = 500;

/// Status LED level: lit for the first half of every second
pub fn heartbeat(now: Instant) -> bool {
    now.as_millis() % HEARTBEAT_PERIOD_MS < HEARTBEAT_ON_MS
}

/// The set of drivers a platform plugs into the probe
pub trait Platform {
    type Store: BlobStore;
    type Radio: LinkDriver;
    type Http: HttpClient;
    type Stream: StreamTransport;
    type Climate: SensorSource<Sample = ClimateSample>;
    type Analog: SensorSource<Sample = AnalogSample>;
}

/// Driver instances handed to [`Probe::new`]
pub struct Drivers<P: Platform> {
    pub store: P::Store,
    pub radio: P::Radio,
    pub http: P::Http,
    pub stream: P::Stream,
    pub climate: P::Climate,
    pub analog: P::Analog,
}

pub struct Probe<P: Platform> {
    config: ProbeConfig,
    store: CredentialStore<P::Store>,
    link: LinkController<P::Radio>,
    http: P::Http,
    session: Session<P::Stream>,
    sensors: SensorAggregator<P::Climate, P::Analog>,
    /// Latched once the session has begun; provisioning stops running
    provisioned: bool,
    /// Set by an explicit disconnect, suppresses automatic reconnects
    wifi_held_down: bool,
    last_wifi_attempt: Option<Instant>,
    last_frame: Option<Instant>,
}

impl<P: Platform> Probe<P> {
    pub fn new(drivers: Drivers<P>, config: ProbeConfig) -> Self {
        let store = CredentialStore::load(drivers.store);
        info!(
            "Probe starting (auto wifi: {}, auto server: {})",
            store.auto_connect_wifi(),
            store.auto_connect_server()
        );

        Self {
            link: LinkController::new(drivers.radio, &config),
            session: Session::new(drivers.stream, &config),
            sensors: SensorAggregator::new(drivers.climate, drivers.analog, &config),
            http: drivers.http,
            store,
            config,
            provisioned: false,
            wifi_held_down: false,
            last_wifi_attempt: None,
            last_frame: None,
        }
    }

    /// Advance every state machine by one step.
    pub async fn tick(&mut self, now: Instant) {
        if let Some(LinkEvent::Disconnected) = self.link.poll(now) {
            // The socket died with the association; reopen once it is back
            self.session.drop_link();
        }

        self.auto_connect_network(now);
        self.provision().await;

        self.session.poll(now);

        self.sensors.poll(now).await;
        self.emit_frame(now);
    }

    /// Parse and run one console line. Arguments are validated before any
    /// state is touched.
    pub fn execute(&mut self, line: &str, now: Instant) -> Result<Reply> {
        let command = Command::parse(line)?;
        debug!("Console: {:?}", command);

        match command {
            Command::WifiSet { name, secret } => self.store.set_network(&name, &secret)?,
            Command::WifiConnect => {
                self.link.connect(self.store.network(), now)?;
                self.wifi_held_down = false;
                self.last_wifi_attempt = Some(now);
            }
            Command::WifiDisconnect => {
                self.link.disconnect();
                self.wifi_held_down = true;
            }
            Command::WifiClear => self.store.clear_network()?,
            Command::WifiInfo => return Ok(Reply::Value(self.wifi_info())),
            Command::ServerInfo { address, device_id } => {
                self.store.set_server_info(&address, &device_id)?
            }
            Command::IpSet(address) => self.store.set_server_address(&address)?,
            Command::UuidSet(device_id) => self.store.set_device_id(&device_id)?,
            Command::IpClear => self.store.clear_server_address()?,
            Command::UuidClear => self.store.clear_device_id()?,
            Command::HttpClear => self.store.clear_server_info()?,
            Command::SendBegin => self.begin_from_store()?,
            Command::Get(reading) => return self.reading(reading),
            Command::WifiAutoConnect(enabled) => self.store.set_auto_connect_wifi(enabled)?,
            Command::ServerAutoConnect(enabled) => self.store.set_auto_connect_server(enabled)?,
        }

        Ok(Reply::Ok)
    }

    /// Store `name`/`secret` unless a network is already stored. Returns
    /// whether anything was written.
    pub fn seed_network(&mut self, name: &str, secret: &str) -> Result<bool> {
        if self.store.network().is_some() {
            return Ok(false);
        }
        info!("Seeding factory network '{}'", name);
        self.store.set_network(name, secret)?;
        Ok(true)
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore<P::Store> {
        &self.store
    }

    pub fn link(&self) -> &LinkController<P::Radio> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkController<P::Radio> {
        &mut self.link
    }

    pub fn http_mut(&mut self) -> &mut P::Http {
        &mut self.http
    }

    pub fn session(&self) -> &Session<P::Stream> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<P::Stream> {
        &mut self.session
    }

    pub fn sensors(&self) -> &SensorAggregator<P::Climate, P::Analog> {
        &self.sensors
    }

    pub fn sensors_mut(&mut self) -> &mut SensorAggregator<P::Climate, P::Analog> {
        &mut self.sensors
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    fn auto_connect_network(&mut self, now: Instant) {
        if self.wifi_held_down || !self.store.auto_connect_wifi() || !self.link.is_disconnected() {
            return;
        }
        let due = self.last_wifi_attempt.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.config.wifi_retry_interval()
        });
        if !due {
            return;
        }

        self.last_wifi_attempt = Some(now);
        match self.link.connect(self.store.network(), now) {
            Ok(()) => {}
            Err(ProbeError::NoCredentials) => debug!("Auto connect skipped, no network stored"),
            Err(e) => warn!("Auto connect failed: {}", e),
        }
    }

    async fn provision(&mut self) {
        if self.provisioned || !self.store.auto_connect_server() || !self.link.is_connected() {
            return;
        }
        let Some(local) = self.link.local_address() else {
            return;
        };

        if self.store.server_address().is_none() {
            let Some(found) = discovery::find_server(&mut self.http, local, &self.config).await else {
                warn!("Server discovery failed, retrying");
                return;
            };
            if let Err(e) = self.store.set_server_address(&found) {
                warn!("Could not persist server address: {}", e);
            }
        }

        let Some(address) = self.store.server_address() else {
            return;
        };
        self.session.set_address(address);

        if self.store.device_id().is_none() {
            match registration::request_identifier(&mut self.http, address, &self.config).await {
                Ok(device_id) => {
                    if let Err(e) = self.store.set_device_id(&device_id) {
                        warn!("Could not persist device identifier: {}", e);
                    }
                }
                Err(e) => {
                    warn!("Registration failed: {}, retrying", e);
                    return;
                }
            }
        }
        if let Some(device_id) = self.store.device_id() {
            self.session.set_device_id(device_id);
        }

        if self.session.is_ready_to_begin() && self.session.begin().is_ok() {
            info!("Provisioned, streaming started");
            self.provisioned = true;
        }
    }

    fn emit_frame(&mut self, now: Instant) {
        if !self.session.is_ready() {
            return;
        }
        let Some(measurement) = self.sensors.measurement() else {
            return;
        };
        let due = self
            .last_frame
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.send_interval());
        if !due {
            return;
        }

        self.last_frame = Some(now);
        match self.session.send_message(&measurement) {
            Ok(()) => {}
            Err(ProbeError::NotConnected) => debug!("Frame skipped, stream not connected"),
            Err(e) => warn!("Frame not sent: {}", e),
        }
    }

    fn begin_from_store(&mut self) -> Result<()> {
        let (Some(address), Some(device_id)) = (self.store.server_address(), self.store.device_id())
        else {
            return Err(ProbeError::NoCredentials);
        };
        self.session.set_address(address);
        self.session.set_device_id(device_id);
        self.session.begin()?;
        self.provisioned = true;
        Ok(())
    }

    fn reading(&self, reading: Reading) -> Result<Reply> {
        let value = match reading {
            Reading::Temperature => self.sensors.temperature(),
            Reading::Humidity => self.sensors.humidity(),
            Reading::SoilMoisture => self.sensors.soil_moisture(),
            Reading::LightLevel => self.sensors.light_level(),
        }
        .ok_or(ProbeError::SensorNotReady)?;
        Ok(Reply::Value(format!("{:.2}", value)))
    }

    fn wifi_info(&self) -> String {
        let mut info = String::new();
        let ssid = self.store.network().map_or("<none>", |n| n.name);
        let _ = write!(info, "ssid: {}, state: {:?}, ip: ", ssid, self.link.state());
        match self.link.local_address() {
            Some(address) if self.link.is_connected() => {
                let _ = write!(info, "{}", address);
            }
            _ => info.push_str("<none>"),
        }
        info
    }
}
