//! Hardware-independent core library for the soil probe
//!
//! This crate contains all platform-agnostic logic of the probe: the WiFi
//! link state machine, server discovery and registration, the streaming
//! session, credential persistence, sensor aggregation and the serial console.
//! Hardware is reached only through the small driver traits declared next to
//! each state machine ([`link::LinkDriver`], [`http::HttpClient`],
//! [`session::StreamTransport`], [`credentials::BlobStore`],
//! [`sensors::SensorSource`]).
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod config;
pub mod console;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod http;
pub mod link;
pub mod probe;
pub mod registration;
pub mod sensors;
pub mod session;

pub use config::ProbeConfig;
pub use error::ProbeError;
pub use probe::Probe;
