//! Server discovery
//!
//! The server announces nothing, so the probe walks its own /24 and asks every
//! host for `/api/`. The first host answering with a 2xx status is the server.

use core::fmt::Write;
use core::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::credentials::ServerAddress;
use crate::http::{HttpClient, HttpRequest, Method};

/// Path probed on every candidate host
pub const DISCOVERY_PATH: &str = "/api/";

/// Last octets probed, in order
pub const CANDIDATE_HOSTS: core::ops::RangeInclusive<u8> = 1..=254;

/// Probe every host of `local`'s /24 in ascending order and return the first
/// that answers with a 2xx status.
///
/// Each probe is bounded by the configured probe timeout. Safe to call
/// repeatedly; the only side effect is network traffic.
pub async fn find_server<H: HttpClient>(
    http: &mut H,
    local: Ipv4Addr,
    config: &ProbeConfig,
) -> Option<ServerAddress> {
    let [a, b, c, _] = local.octets();
    info!("Searching for the server on {}.{}.{}.0/24...", a, b, c);

    for host in CANDIDATE_HOSTS {
        let candidate = Ipv4Addr::new(a, b, c, host);
        let mut address = ServerAddress::new();
        // An IPv4 address never exceeds 15 bytes
        let _ = write!(address, "{}", candidate);

        let request = HttpRequest {
            method: Method::Get,
            host: address.as_str(),
            port: config.http_port,
            path: DISCOVERY_PATH,
            body: &[],
            timeout: config.probe_timeout(),
        };

        match http.send(&request).await {
            Ok(response) if response.is_success() => {
                info!("Found server at {}", address.as_str());
                return Some(address);
            }
            Ok(response) => debug!("{}: status {}", address.as_str(), response.status),
            Err(e) => debug!("{}: {:?}", address.as_str(), e),
        }
    }

    warn!("No server answered on {}.{}.{}.0/24", a, b, c);
    None
}
