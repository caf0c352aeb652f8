//! Streaming session towards the server
//!
//! The session owns its own copies of the server address and device
//! identifier. Once begun it keeps a WebSocket open to
//! `ws://{address}:{port}/ws/probe/{identifier}/`, reconnecting at a bounded
//! rate whenever the transport drops.

use alloc::format;
use alloc::string::String;

use embassy_time::{Duration, Instant};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::ProbeConfig;
use crate::credentials::{DeviceId, ServerAddress, bounded};
use crate::error::{ProbeError, Result};
use crate::sensors::Measurement;

/// Where a stream transport should connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub host: ServerAddress,
    pub port: u16,
    pub path: String,
}

/// Progress reported by [`StreamTransport::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Connect or handshake still in flight
    Opening,
    Open,
}

/// A message-oriented duplex link (a WebSocket client on every platform).
///
/// Every method returns without waiting on the network: the connect and
/// handshake run in the background and are observed through `poll`.
pub trait StreamTransport {
    type Error: core::fmt::Debug;

    /// Start opening a link to `target`, replacing any previous one.
    fn open(&mut self, target: &StreamTarget) -> core::result::Result<(), Self::Error>;

    /// Pump whatever arrived since the last call and report progress. An
    /// error means the link failed to open or is gone.
    fn poll(&mut self) -> core::result::Result<StreamState, Self::Error>;

    /// Queue one text message on an open link.
    fn send_text(&mut self, payload: &str) -> core::result::Result<(), Self::Error>;

    /// Tear the link down. Never fails.
    fn close(&mut self);
}

/// Wire shape of one streamed measurement. Values are strings with two
/// decimals, which is what the server's consumer expects.
#[derive(Serialize)]
struct MeasurementFrame {
    temperature: String,
    humidity: String,
    soil_moisture: String,
    light_level: String,
}

/// Serialize `measurement` to the JSON text sent over the stream.
pub fn encode_measurement(measurement: &Measurement) -> Result<String> {
    let frame = MeasurementFrame {
        temperature: format!("{:.2}", measurement.temperature),
        humidity: format!("{:.2}", measurement.humidity),
        soil_moisture: format!("{:.2}", measurement.soil_moisture),
        light_level: format!("{:.2}", measurement.light_level),
    };
    serde_json::to_string(&frame).map_err(|_| ProbeError::ParseFailure)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Down,
    Opening,
    Linked,
}

pub struct Session<T: StreamTransport> {
    transport: T,
    stream_port: u16,
    reconnect_interval: Duration,
    address: Option<ServerAddress>,
    device_id: Option<DeviceId>,
    target: Option<StreamTarget>,
    begun: bool,
    phase: Phase,
    /// Set when `begin` retargets a live or opening link
    restart: bool,
    last_attempt: Option<Instant>,
}

impl<T: StreamTransport> Session<T> {
    pub fn new(transport: T, config: &ProbeConfig) -> Self {
        Self {
            transport,
            stream_port: config.stream_port,
            reconnect_interval: config.reconnect_interval(),
            address: None,
            device_id: None,
            target: None,
            begun: false,
            phase: Phase::Down,
            restart: false,
            last_attempt: None,
        }
    }

    pub fn set_address(&mut self, address: &str) {
        let (address, truncated): (ServerAddress, bool) = bounded(address);
        if truncated {
            warn!("Session address truncated to '{}'", address.as_str());
        }
        self.address = Some(address);
    }

    pub fn set_device_id(&mut self, device_id: &str) {
        let (device_id, truncated): (DeviceId, bool) = bounded(device_id);
        if truncated {
            warn!("Session identifier truncated to '{}'", device_id.as_str());
        }
        self.device_id = Some(device_id);
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_ready_to_begin(&self) -> bool {
        self.address.is_some() && self.device_id.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.begun && self.is_ready_to_begin()
    }

    /// Whether the transport link is currently up
    pub fn is_linked(&self) -> bool {
        self.phase == Phase::Linked
    }

    /// Whether a connect is in flight
    pub fn is_opening(&self) -> bool {
        self.phase == Phase::Opening
    }

    pub fn target(&self) -> Option<&StreamTarget> {
        self.target.as_ref()
    }

    /// Fix the stream target from the current address and identifier. The
    /// link itself opens on the next [`Session::poll`].
    pub fn begin(&mut self) -> Result<()> {
        let (Some(address), Some(device_id)) = (&self.address, &self.device_id) else {
            return Err(ProbeError::NoCredentials);
        };

        let target = StreamTarget {
            host: address.clone(),
            port: self.stream_port,
            path: format!("/ws/probe/{}/", device_id.as_str()),
        };
        info!(
            "Streaming to ws://{}:{}{}",
            target.host.as_str(),
            target.port,
            target.path
        );

        if self.phase != Phase::Down && self.target.as_ref() != Some(&target) {
            self.restart = true;
        }
        self.target = Some(target);
        self.begun = true;
        self.last_attempt = None;
        Ok(())
    }

    /// Keep the link alive. Call once per tick after [`Session::begin`];
    /// never waits on the network.
    pub fn poll(&mut self, now: Instant) {
        if !self.begun {
            return;
        }
        if self.restart {
            self.restart = false;
            self.drop_link();
        }
        let Some(target) = self.target.as_ref() else {
            return;
        };

        if self.phase == Phase::Down {
            let due = self.last_attempt.is_none_or(|last| {
                now.saturating_duration_since(last) >= self.reconnect_interval
            });
            if !due {
                return;
            }

            self.last_attempt = Some(now);
            debug!("Opening stream to {}", target.host.as_str());
            match self.transport.open(target) {
                Ok(()) => self.phase = Phase::Opening,
                Err(e) => {
                    warn!("Stream connect failed: {:?}", e);
                    return;
                }
            }
        }

        match self.transport.poll() {
            Ok(StreamState::Open) => {
                if self.phase == Phase::Opening {
                    info!("Stream connected");
                }
                self.phase = Phase::Linked;
            }
            Ok(StreamState::Opening) => {}
            Err(e) => {
                if self.phase == Phase::Linked {
                    warn!("Stream dropped: {:?}", e);
                } else {
                    warn!("Stream connect failed: {:?}", e);
                }
                self.drop_link();
            }
        }
    }

    /// Send one measurement as a text frame.
    pub fn send_message(&mut self, measurement: &Measurement) -> Result<()> {
        if !self.is_ready() || !self.is_linked() {
            return Err(ProbeError::NotConnected);
        }

        let payload = encode_measurement(measurement)?;
        match self.transport.send_text(&payload) {
            Ok(()) => {
                debug!("Sent {}", payload);
                Ok(())
            }
            Err(e) => {
                warn!("Stream send failed: {:?}", e);
                self.drop_link();
                Err(ProbeError::NotConnected)
            }
        }
    }

    /// Close the transport and fall back to reconnecting. The session stays
    /// begun.
    pub fn drop_link(&mut self) {
        if self.phase != Phase::Down {
            self.phase = Phase::Down;
            self.transport.close();
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct FakeStream {
        opens: Vec<StreamTarget>,
        refuse_open: bool,
        /// Polls that report `Opening` after each open
        handshake_polls: usize,
        pending: usize,
        fail_poll: bool,
        fail_send: bool,
        sent: Vec<String>,
        closes: usize,
    }

    impl StreamTransport for FakeStream {
        type Error = &'static str;

        fn open(&mut self, target: &StreamTarget) -> core::result::Result<(), Self::Error> {
            self.opens.push(target.clone());
            self.pending = self.handshake_polls;
            if self.refuse_open {
                Err("no route")
            } else {
                Ok(())
            }
        }

        fn poll(&mut self) -> core::result::Result<StreamState, Self::Error> {
            if self.fail_poll {
                return Err("reset by peer");
            }
            if self.pending > 0 {
                self.pending -= 1;
                return Ok(StreamState::Opening);
            }
            Ok(StreamState::Open)
        }

        fn send_text(&mut self, payload: &str) -> core::result::Result<(), Self::Error> {
            if self.fail_send {
                return Err("broken pipe");
            }
            self.sent.push(String::from(payload));
            Ok(())
        }

        fn close(&mut self) {
            self.closes += 1;
        }
    }

    const SAMPLE: Measurement = Measurement {
        temperature: 21.456,
        humidity: 40.0,
        soil_moisture: 100.0,
        light_level: 0.0,
    };

    fn ms(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn session() -> Session<FakeStream> {
        Session::new(FakeStream::default(), &ProbeConfig::default())
    }

    fn begun_session() -> Session<FakeStream> {
        let mut session = session();
        session.set_address("192.168.1.57");
        session.set_device_id("abc-123");
        session.begin().unwrap();
        session
    }

    #[test]
    fn test_measurement_frame_uses_two_decimal_strings() {
        assert_eq!(
            encode_measurement(&SAMPLE).unwrap(),
            r#"{"temperature":"21.46","humidity":"40.00","soil_moisture":"100.00","light_level":"0.00"}"#
        );
    }

    #[test]
    fn test_readiness() {
        let mut session = session();
        assert!(!session.is_ready_to_begin());
        assert_eq!(session.begin(), Err(ProbeError::NoCredentials));

        session.set_address("192.168.1.57");
        assert!(!session.is_ready_to_begin());
        session.set_device_id("abc-123");
        assert!(session.is_ready_to_begin());
        assert!(!session.is_ready());

        session.begin().unwrap();
        assert!(session.is_ready());
        assert_eq!(
            session.target().map(|t| t.path.as_str()),
            Some("/ws/probe/abc-123/")
        );
        assert_eq!(session.target().map(|t| t.port), Some(8000));
    }

    #[test]
    fn test_begin_opens_link_on_next_poll() {
        let mut session = begun_session();
        assert!(!session.is_linked());
        assert!(session.transport().opens.is_empty());

        session.poll(ms(0));
        assert!(session.is_linked());
        assert_eq!(session.transport().opens.len(), 1);
        assert_eq!(session.transport().opens[0].host.as_str(), "192.168.1.57");
    }

    #[test]
    fn test_poll_before_begin_does_nothing() {
        let mut session = session();
        session.set_address("192.168.1.57");
        session.set_device_id("abc-123");

        session.poll(ms(0));
        assert!(session.transport().opens.is_empty());
    }

    #[test]
    fn test_slow_handshake_is_observed_across_polls() {
        let mut session = begun_session();
        session.transport_mut().handshake_polls = 3;

        for tick in 0..3 {
            session.poll(ms(tick * 20));
            assert!(session.is_opening());
            assert_eq!(
                session.send_message(&SAMPLE),
                Err(ProbeError::NotConnected)
            );
        }
        assert_eq!(session.transport().opens.len(), 1);

        session.poll(ms(60));
        assert!(session.is_linked());
        assert_eq!(session.send_message(&SAMPLE), Ok(()));
    }

    #[test]
    fn test_failed_handshake_waits_for_reconnect_interval() {
        let mut session = begun_session();
        session.transport_mut().handshake_polls = 1;
        session.poll(ms(0));
        assert!(session.is_opening());

        session.transport_mut().fail_poll = true;
        session.poll(ms(20));
        assert!(!session.is_opening());
        assert_eq!(session.transport().closes, 1);

        session.transport_mut().fail_poll = false;
        session.poll(ms(4_999));
        assert_eq!(session.transport().opens.len(), 1);
        session.poll(ms(5_000));
        assert_eq!(session.transport().opens.len(), 2);
    }

    #[test]
    fn test_reconnect_is_rate_limited() {
        let mut session = begun_session();
        session.transport_mut().refuse_open = true;

        session.poll(ms(0));
        session.poll(ms(4_999));
        assert_eq!(session.transport().opens.len(), 1);

        session.transport_mut().refuse_open = false;
        session.poll(ms(5_000));
        assert_eq!(session.transport().opens.len(), 2);
        assert!(session.is_linked());
    }

    #[test]
    fn test_transport_error_drops_link() {
        let mut session = begun_session();
        session.poll(ms(0));

        session.transport_mut().fail_poll = true;
        session.poll(ms(100));
        assert!(!session.is_linked());
        assert_eq!(session.transport().closes, 1);

        session.transport_mut().fail_poll = false;
        session.poll(ms(5_000));
        assert!(session.is_linked());
    }

    #[test]
    fn test_send_requires_link() {
        let mut session = begun_session();
        assert_eq!(
            session.send_message(&SAMPLE),
            Err(ProbeError::NotConnected)
        );

        session.poll(ms(0));
        assert_eq!(session.send_message(&SAMPLE), Ok(()));
        assert_eq!(session.transport().sent.len(), 1);
    }

    #[test]
    fn test_send_failure_drops_link() {
        let mut session = begun_session();
        session.poll(ms(0));
        session.transport_mut().fail_send = true;

        assert_eq!(
            session.send_message(&SAMPLE),
            Err(ProbeError::NotConnected)
        );
        assert!(!session.is_linked());
        assert_eq!(session.transport().closes, 1);
    }

    #[test]
    fn test_begin_with_new_target_restarts_link() {
        let mut session = begun_session();
        session.poll(ms(0));

        session.set_device_id("def-456");
        session.begin().unwrap();
        session.poll(ms(10));

        assert_eq!(session.transport().closes, 1);
        assert_eq!(session.transport().opens.len(), 2);
        assert_eq!(session.transport().opens[1].path, "/ws/probe/def-456/");
    }

    #[test]
    fn test_drop_link_keeps_session_begun() {
        let mut session = begun_session();
        session.poll(ms(0));

        session.drop_link();
        session.drop_link();
        assert!(session.is_ready());
        assert!(!session.is_linked());
        assert_eq!(session.transport().closes, 1);
    }
}
