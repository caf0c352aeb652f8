//! WiFi station driver over esp-radio
//!
//! Association is driven by the esp-radio controller; the address comes from
//! the embassy-net DHCP client running on the same interface.

use core::net::Ipv4Addr;

use alloc::string::String;
use embassy_net::Stack;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiError};
use log::{debug, warn};

use probe_core::credentials::NetworkCredentials;
use probe_core::link::{LinkDriver, LinkStatus};

pub struct EspRadio {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    started: bool,
    attempted: bool,
}

impl EspRadio {
    pub fn new(controller: WifiController<'static>, stack: Stack<'static>) -> Self {
        Self {
            controller,
            stack,
            started: false,
            attempted: false,
        }
    }
}

impl LinkDriver for EspRadio {
    type Error = WifiError;

    fn begin(&mut self, credentials: NetworkCredentials<'_>) -> Result<(), WifiError> {
        if self.started && self.controller.is_connected().unwrap_or(false) {
            // Switching networks: drop the current association first
            self.controller.disconnect()?;
        }

        let client = ClientConfig::default()
            .with_ssid(String::from(credentials.name))
            .with_password(String::from(credentials.secret));
        self.controller.set_config(&ModeConfig::Client(client))?;

        if !self.started {
            self.controller.start()?;
            self.started = true;
            debug!("wifi: started STA mode");
        }

        self.controller.connect()?;
        self.attempted = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.started {
            return;
        }
        if let Err(e) = self.controller.disconnect() {
            warn!("wifi: disconnect failed: {:?}", e);
        }
    }

    fn status(&mut self) -> LinkStatus {
        if !self.attempted {
            return LinkStatus::Idle;
        }
        match self.controller.is_connected() {
            Ok(true) => LinkStatus::Connected,
            Ok(false) => LinkStatus::Disconnected,
            Err(e) => {
                debug!("wifi: status unavailable: {:?}", e);
                LinkStatus::Disconnected
            }
        }
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.stack
            .config_v4()
            .map(|config| config.address.address())
    }
}
