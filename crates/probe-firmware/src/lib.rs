//! ESP32-S3 firmware-specific modules for the soil probe
//!
//! This crate contains the hardware implementations of the probe-core driver
//! traits: the esp-radio WiFi station, embassy-net HTTP and WebSocket
//! clients, the raw flash credential sector and the DHT11 / PCF8591 sensors.

#![no_std]

extern crate alloc;

pub mod factory;
pub mod flash;
pub mod net;
pub mod sensors;
pub mod wifi;
