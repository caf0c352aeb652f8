//! Device registration against a discovered server

use alloc::string::String;

use log::{info, warn};
use serde::Deserialize;

use crate::config::ProbeConfig;
use crate::credentials::{DeviceId, bounded};
use crate::error::{ProbeError, Result};
use crate::http::{HttpClient, HttpRequest, Method};

pub const REGISTRATION_PATH: &str = "/api/probe/create/";

#[derive(Deserialize)]
struct CreatedProbe {
    probe_id: String,
}

/// Ask `server` to allocate a new identifier for this probe.
///
/// Nothing is stored here; the caller decides what to persist.
pub async fn request_identifier<H: HttpClient>(
    http: &mut H,
    server: &str,
    config: &ProbeConfig,
) -> Result<DeviceId> {
    let request = HttpRequest {
        method: Method::Post,
        host: server,
        port: config.http_port,
        path: REGISTRATION_PATH,
        body: &[],
        timeout: config.request_timeout(),
    };

    let response = http.send(&request).await.map_err(|e| {
        warn!("Registration request to {} failed: {:?}", server, e);
        ProbeError::NetworkUnreachable
    })?;

    if !response.is_success() {
        warn!("Registration rejected with status {}", response.status);
        return Err(ProbeError::UnexpectedStatus(response.status));
    }

    let created: CreatedProbe = serde_json::from_slice(&response.body).map_err(|e| {
        warn!("Registration response is not valid: {:?}", e);
        ProbeError::ParseFailure
    })?;

    if created.probe_id.is_empty() {
        warn!("Registration response carries an empty probe_id");
        return Err(ProbeError::ParseFailure);
    }

    let (id, truncated): (DeviceId, bool) = bounded(&created.probe_id);
    if truncated {
        warn!("probe_id truncated to {} bytes", id.len());
    }
    info!("Registered as {}", id.as_str());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use alloc::vec::Vec;
    use embassy_futures::block_on;

    struct Canned {
        reply: core::result::Result<HttpResponse, &'static str>,
        requests: usize,
    }

    impl HttpClient for Canned {
        type Error = &'static str;

        async fn send(&mut self, request: &HttpRequest<'_>) -> core::result::Result<HttpResponse, Self::Error> {
            assert_eq!(request.method, Method::Post);
            assert_eq!(request.path, "/api/probe/create/");
            assert_eq!(request.host, "192.168.1.57");
            assert!(request.body.is_empty());
            self.requests += 1;
            self.reply.clone()
        }
    }

    fn register(status: u16, body: &str) -> Result<DeviceId> {
        let mut http = Canned {
            reply: Ok(HttpResponse {
                status,
                body: Vec::from(body.as_bytes()),
            }),
            requests: 0,
        };
        let result = block_on(request_identifier(
            &mut http,
            "192.168.1.57",
            &ProbeConfig::default(),
        ));
        assert_eq!(http.requests, 1);
        result
    }

    #[test]
    fn test_created_returns_identifier() {
        let id = register(201, r#"{"probe_id":"abc-123"}"#).unwrap();
        assert_eq!(id.as_str(), "abc-123");
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let id = register(200, r#"{"name":"probe","probe_id":"f00d"}"#).unwrap();
        assert_eq!(id.as_str(), "f00d");
    }

    #[test]
    fn test_non_success_status_fails_whatever_the_body() {
        assert_eq!(
            register(404, r#"{"probe_id":"abc-123"}"#),
            Err(ProbeError::UnexpectedStatus(404))
        );
        assert_eq!(register(500, ""), Err(ProbeError::UnexpectedStatus(500)));
    }

    #[test]
    fn test_bad_payloads_are_parse_failures() {
        assert_eq!(register(201, "not json"), Err(ProbeError::ParseFailure));
        assert_eq!(register(201, r#"{"id":"x"}"#), Err(ProbeError::ParseFailure));
        assert_eq!(register(201, r#"{"probe_id":42}"#), Err(ProbeError::ParseFailure));
        assert_eq!(register(201, r#"{"probe_id":""}"#), Err(ProbeError::ParseFailure));
    }

    #[test]
    fn test_transport_failure_is_unreachable() {
        let mut http = Canned {
            reply: Err("timed out"),
            requests: 0,
        };
        let result = block_on(request_identifier(
            &mut http,
            "192.168.1.57",
            &ProbeConfig::default(),
        ));

        assert_eq!(result, Err(ProbeError::NetworkUnreachable));
    }
}
