//! Probe tunables
//!
//! Every interval and port the state machines use lives here so the firmware
//! and the simulator can share one set of defaults. Durations are stored as
//! plain milliseconds to keep the struct trivially (de)serializable.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Port the server's HTTP API listens on
pub const DEFAULT_HTTP_PORT: u16 = 8000;
/// Port the server's streaming endpoint listens on
pub const DEFAULT_STREAM_PORT: u16 = 8000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProbeConfig {
    pub http_port: u16,
    pub stream_port: u16,
    /// Minimum spacing between two link status samples
    pub link_poll_interval_ms: u64,
    /// Deadline for a single association attempt
    pub connect_timeout_ms: u64,
    /// Spacing between automatic association attempts
    pub wifi_retry_interval_ms: u64,
    /// Upper bound for one discovery GET
    pub probe_timeout_ms: u64,
    /// Upper bound for the registration POST
    pub request_timeout_ms: u64,
    /// Spacing between streaming reconnect attempts
    pub reconnect_interval_ms: u64,
    /// Spacing between measurement frames
    pub send_interval_ms: u64,
    /// Sampling period of the temperature/humidity source
    pub climate_interval_ms: u64,
    /// Sampling period of the soil/light source
    pub analog_interval_ms: u64,
}

impl ProbeConfig {
    pub const fn link_poll_interval(&self) -> Duration {
        Duration::from_millis(self.link_poll_interval_ms)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn wifi_retry_interval(&self) -> Duration {
        Duration::from_millis(self.wifi_retry_interval_ms)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub const fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub const fn climate_interval(&self) -> Duration {
        Duration::from_millis(self.climate_interval_ms)
    }

    pub const fn analog_interval(&self) -> Duration {
        Duration::from_millis(self.analog_interval_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            link_poll_interval_ms: 100,
            connect_timeout_ms: 20_000,
            wifi_retry_interval_ms: 5_000,
            probe_timeout_ms: 400,
            request_timeout_ms: 5_000,
            reconnect_interval_ms: 5_000,
            send_interval_ms: 2_000,
            // DHT11 minimum sampling period
            climate_interval_ms: 1_000,
            analog_interval_ms: 500,
        }
    }
}
