//! HTTP client seam
//!
//! The probe only ever issues two kinds of request (the discovery `GET` and
//! the registration `POST`), always with `Connection: close`. Implementations
//! own the socket and the protocol handling; the core only sees the status
//! and a bounded body.

use alloc::vec::Vec;

use embassy_time::Duration;

/// Largest response body a client keeps. Longer bodies are a transport error.
pub const MAX_BODY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
    pub body: &'a [u8],
    /// Upper bound for connect plus exchange
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One synchronous request-response exchange
#[allow(async_fn_in_trait)]
pub trait HttpClient {
    type Error: core::fmt::Debug;

    async fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, Self::Error>;
}
