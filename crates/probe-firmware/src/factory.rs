//! Factory WiFi credentials baked in at build time from `.env`
//!
//! They only seed a store that has no network yet; anything set through the
//! console takes precedence and survives reflashing.

pub const WIFI_SSID: Option<&str> = option_env!("PROBE_WIFI_SSID");
pub const WIFI_PASSWORD: Option<&str> = option_env!("PROBE_WIFI_PASSWORD");

/// Both halves of the factory network, when configured
pub fn network() -> Option<(&'static str, &'static str)> {
    match (WIFI_SSID, WIFI_PASSWORD) {
        (Some(ssid), Some(password)) if !ssid.is_empty() => Some((ssid, password)),
        _ => None,
    }
}
