//! WiFi link state machine
//!
//! Association is started by [`LinkController::connect`] and then tracked
//! by [`LinkController::poll`], which samples the radio status at a fixed
//! rate and never waits on the radio.

use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::credentials::{NETWORK_NAME_LEN, NetworkCredentials, NetworkName, bounded};
use crate::error::{ProbeError, Result};

/// Interval between "still connecting" progress lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Status as reported by the radio driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connected,
    ConnectFailed,
    Disconnected,
}

/// Hardware seam for the WiFi radio
pub trait LinkDriver {
    type Error: core::fmt::Debug;

    /// Start associating with the given network. Must not wait for the result.
    fn begin(
        &mut self,
        credentials: NetworkCredentials<'_>,
    ) -> core::result::Result<(), Self::Error>;

    /// Drop the association, or abort an association in progress.
    fn disconnect(&mut self);

    fn status(&mut self) -> LinkStatus;

    /// Address assigned to the station, once known
    fn local_address(&self) -> Option<Ipv4Addr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Transient, folded back to `Disconnected` before `poll` returns
    ConnectionTimedOut,
}

/// Transition notices, reported once per edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(Option<Ipv4Addr>),
    ConnectFailed,
    Disconnected,
    TimedOut,
}

impl LinkEvent {
    pub fn as_error(&self) -> Option<ProbeError> {
        match self {
            Self::TimedOut => Some(ProbeError::ConnectionTimeout),
            Self::ConnectFailed => Some(ProbeError::NetworkUnreachable),
            Self::Connected(_) | Self::Disconnected => None,
        }
    }
}

pub struct LinkController<D: LinkDriver> {
    driver: D,
    state: LinkState,
    poll_interval: Duration,
    connect_timeout: Duration,
    last_poll: Option<Instant>,
    attempt_started: Instant,
    last_progress: Instant,
    abort_requested: bool,
    network_name: NetworkName,
}

impl<D: LinkDriver> LinkController<D> {
    pub fn new(driver: D, config: &ProbeConfig) -> Self {
        Self {
            driver,
            state: LinkState::Disconnected,
            poll_interval: config.link_poll_interval(),
            connect_timeout: config.connect_timeout(),
            last_poll: None,
            attempt_started: Instant::MIN,
            last_progress: Instant::MIN,
            abort_requested: false,
            network_name: NetworkName::new(),
        }
    }

    /// Start associating with the stored network.
    pub fn connect(
        &mut self,
        credentials: Option<NetworkCredentials<'_>>,
        now: Instant,
    ) -> Result<()> {
        let credentials = credentials.ok_or(ProbeError::NoCredentials)?;

        info!("Connecting to {}...", credentials.name);
        self.driver.begin(credentials).map_err(|e| {
            error!("Radio refused to start association: {:?}", e);
            ProbeError::NetworkUnreachable
        })?;

        self.network_name = bounded::<NETWORK_NAME_LEN>(credentials.name).0;
        self.state = LinkState::Connecting;
        self.attempt_started = now;
        self.last_progress = now;
        self.abort_requested = false;
        Ok(())
    }

    /// Tear the association down. The state follows on the next poll.
    pub fn disconnect(&mut self) {
        info!("Disconnecting from {}...", self.network_name.as_str());
        self.driver.disconnect();
        if self.state == LinkState::Connecting {
            self.abort_requested = true;
        }
    }

    /// Sample the radio and advance the state machine.
    pub fn poll(&mut self, now: Instant) -> Option<LinkEvent> {
        if let Some(last) = self.last_poll
            && now.saturating_duration_since(last) < self.poll_interval
        {
            return None;
        }
        self.last_poll = Some(now);

        let previous = self.state;
        let status = self.driver.status();
        let aborted = self.handle_state(status, now);
        self.handle_transition(previous, aborted)
    }

    /// Returns whether a pending abort was applied.
    fn handle_state(&mut self, status: LinkStatus, now: Instant) -> bool {
        if self.state == LinkState::Connecting {
            if self.abort_requested {
                self.abort_requested = false;
                self.state = LinkState::Disconnected;
                return true;
            }

            if now.saturating_duration_since(self.last_progress) >= PROGRESS_INTERVAL {
                debug!(
                    "Still connecting to {} ({} ms)",
                    self.network_name.as_str(),
                    now.saturating_duration_since(self.attempt_started).as_millis()
                );
                self.last_progress = now;
            }

            if now.saturating_duration_since(self.attempt_started) > self.connect_timeout {
                self.state = LinkState::ConnectionTimedOut;
            }

            match status {
                LinkStatus::Connected => self.state = LinkState::Connected,
                LinkStatus::ConnectFailed => self.state = LinkState::Disconnected,
                LinkStatus::Idle | LinkStatus::Disconnected => {}
            }
        }

        if self.state == LinkState::Connected
            && matches!(status, LinkStatus::Disconnected | LinkStatus::Idle)
        {
            self.state = LinkState::Disconnected;
        }

        false
    }

    fn handle_transition(&mut self, previous: LinkState, aborted: bool) -> Option<LinkEvent> {
        match (previous, self.state) {
            (LinkState::Connecting, LinkState::Connected) => {
                let address = self.driver.local_address();
                match address {
                    Some(ip) => info!(
                        "Connected to {}! Local IP: {}",
                        self.network_name.as_str(),
                        ip
                    ),
                    None => info!(
                        "Connected to {}! Local IP pending",
                        self.network_name.as_str()
                    ),
                }
                Some(LinkEvent::Connected(address))
            }
            (LinkState::Connecting, LinkState::Disconnected) if aborted => {
                info!("Connection attempt to {} aborted", self.network_name.as_str());
                Some(LinkEvent::Disconnected)
            }
            (LinkState::Connecting, LinkState::Disconnected) => {
                warn!("Connection error!");
                Some(LinkEvent::ConnectFailed)
            }
            (LinkState::Connected, LinkState::Disconnected) => {
                info!("Disconnected!");
                Some(LinkEvent::Disconnected)
            }
            (_, LinkState::ConnectionTimedOut) => {
                warn!("Couldn't connect to {} - timed out", self.network_name.as_str());
                self.driver.disconnect();
                self.state = LinkState::Disconnected;
                Some(LinkEvent::TimedOut)
            }
            _ => None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == LinkState::Disconnected
    }

    pub fn local_address(&self) -> Option<Ipv4Addr> {
        self.driver.local_address()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
