//! HTTP and WebSocket clients on top of edge-http and edge-ws
//!
//! Servers are always addressed by IPv4 literal, so no DNS socket is needed.
//! The WebSocket lives in [`stream_task`]; [`EmbassyWsTransport`] is only a
//! handle that queues commands and reads back events, so the main loop never
//! waits on the network.

use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use edge_http::Method as EdgeMethod;
use edge_http::io::Error as HttpError;
use edge_http::io::client::Connection;
use edge_http::ws::{MAX_BASE64_KEY_LEN, MAX_BASE64_KEY_RESPONSE_LEN, NONCE_LEN};
use edge_nal::Readable;
use edge_nal_embassy::{Tcp, TcpBuffers, TcpError, TcpSocket};
use edge_ws::{Error as WsError, FrameHeader, FrameType};
use embassy_futures::select::{Either, select};
use embassy_net::Stack;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, with_timeout};
use embedded_io_async::{Read, Write};
use esp_hal::rng::Rng;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use probe_core::http::{HttpClient, HttpRequest, HttpResponse, MAX_BODY, Method};
use probe_core::session::{StreamState, StreamTarget, StreamTransport};

const HTTP_TX_BUFFER: usize = 1024;
const HTTP_RX_BUFFER: usize = 2048;
const STREAM_BUFFER: usize = 2048;

/// Request and response head scratch space
const HEAD_BUFFER: usize = 1024;

/// Longest a frame may take to arrive once its first byte is in
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub type HttpBuffers = TcpBuffers<1, HTTP_TX_BUFFER, HTTP_RX_BUFFER>;
pub type StreamBuffers = TcpBuffers<1, STREAM_BUFFER, STREAM_BUFFER>;

type StreamSocket<'a> = TcpSocket<'a, 1, STREAM_BUFFER, STREAM_BUFFER>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Host is not an IPv4 address")]
    BadHost,
    #[error("Socket error: {0:?}")]
    Tcp(TcpError),
    #[error("Timed out")]
    Timeout,
    #[error("HTTP: {0:?}")]
    Http(HttpError<TcpError>),
    #[error("WebSocket: {0:?}")]
    Ws(WsError<TcpError>),
    #[error("Upgrade refused by server")]
    Refused,
    #[error("Response body too large")]
    BodyTooLarge,
    #[error("Server closed the stream")]
    Closed,
    #[error("Stream not open")]
    NotOpen,
    #[error("Stream worker is busy")]
    Busy,
}

impl From<HttpError<TcpError>> for NetError {
    fn from(e: HttpError<TcpError>) -> Self {
        Self::Http(e)
    }
}

impl From<WsError<TcpError>> for NetError {
    fn from(e: WsError<TcpError>) -> Self {
        Self::Ws(e)
    }
}

fn endpoint(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let address = host.parse::<Ipv4Addr>().map_err(|_| NetError::BadHost)?;
    Ok(SocketAddr::V4(SocketAddrV4::new(address, port)))
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// One short-lived connection per request
pub struct EmbassyHttpClient {
    tcp: Tcp<'static, 1, HTTP_TX_BUFFER, HTTP_RX_BUFFER>,
    head: Vec<u8>,
}

impl EmbassyHttpClient {
    pub fn new(stack: Stack<'static>, buffers: &'static HttpBuffers) -> Self {
        Self {
            tcp: Tcp::new(stack, buffers),
            head: vec![0; HEAD_BUFFER],
        }
    }

    async fn exchange(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, NetError> {
        let address = endpoint(request.host, request.port)?;
        let mut conn: Connection<'_, _, 16> = Connection::new(&mut self.head, &self.tcp, address);

        let method = match request.method {
            Method::Get => EdgeMethod::Get,
            Method::Post => EdgeMethod::Post,
        };
        let length = request.body.len().to_string();
        conn.initiate_request(
            true,
            method,
            request.path,
            &[("Host", request.host), ("Content-Length", length.as_str())],
        )
        .await?;
        if !request.body.is_empty() {
            conn.write_all(request.body).await?;
        }

        conn.initiate_response().await?;
        let status = conn.headers()?.code;

        let mut body = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            if body.len() + n > MAX_BODY {
                return Err(NetError::BodyTooLarge);
            }
            body.extend_from_slice(&chunk[..n]);
        }

        debug!("http: {} {} -> {}", request.method.as_str(), request.path, status);
        Ok(HttpResponse { status, body })
    }
}

impl HttpClient for EmbassyHttpClient {
    type Error = NetError;

    async fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, NetError> {
        with_timeout(request.timeout, self.exchange(request))
            .await
            .map_err(|_| NetError::Timeout)?
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Work for the stream task. `generation` ties events back to the `open`
/// that caused them.
pub enum StreamCommand {
    Open { generation: u32, target: StreamTarget },
    Send(String),
    Close,
}

pub enum StreamEvent {
    Opened(u32),
    Failed(u32, NetError),
}

/// The two queues between [`EmbassyWsTransport`] and [`stream_task`]
pub struct StreamLink {
    commands: Channel<CriticalSectionRawMutex, StreamCommand, 4>,
    events: Channel<CriticalSectionRawMutex, StreamEvent, 4>,
}

impl StreamLink {
    pub const fn new() -> Self {
        Self {
            commands: Channel::new(),
            events: Channel::new(),
        }
    }

    fn report(&self, event: StreamEvent) {
        if self.events.try_send(event).is_err() {
            warn!("ws: event queue full, dropping event");
        }
    }
}

impl Default for StreamLink {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening,
    Open,
}

pub struct EmbassyWsTransport {
    link: &'static StreamLink,
    generation: u32,
    phase: Phase,
}

impl EmbassyWsTransport {
    pub fn new(link: &'static StreamLink) -> Self {
        Self {
            link,
            generation: 0,
            phase: Phase::Idle,
        }
    }

    fn command(&self, command: StreamCommand) -> Result<(), NetError> {
        self.link.commands.try_send(command).map_err(|_| NetError::Busy)
    }
}

impl StreamTransport for EmbassyWsTransport {
    type Error = NetError;

    fn open(&mut self, target: &StreamTarget) -> Result<(), NetError> {
        self.generation = self.generation.wrapping_add(1);
        self.command(StreamCommand::Open {
            generation: self.generation,
            target: target.clone(),
        })?;
        self.phase = Phase::Opening;
        Ok(())
    }

    fn poll(&mut self) -> Result<StreamState, NetError> {
        while let Ok(event) = self.link.events.try_receive() {
            match event {
                StreamEvent::Opened(generation) if generation == self.generation => {
                    self.phase = Phase::Open;
                }
                StreamEvent::Failed(generation, e) if generation == self.generation => {
                    self.phase = Phase::Idle;
                    return Err(e);
                }
                // Left over from an abandoned attempt
                _ => {}
            }
        }

        match self.phase {
            Phase::Idle => Err(NetError::NotOpen),
            Phase::Opening => Ok(StreamState::Opening),
            Phase::Open => Ok(StreamState::Open),
        }
    }

    fn send_text(&mut self, payload: &str) -> Result<(), NetError> {
        if self.phase != Phase::Open {
            return Err(NetError::NotOpen);
        }
        self.command(StreamCommand::Send(payload.into()))
    }

    fn close(&mut self) {
        if self.phase != Phase::Idle && self.command(StreamCommand::Close).is_err() {
            warn!("ws: command queue full, close not delivered");
        }
        self.phase = Phase::Idle;
    }
}

/// Owns the stream socket. Spawn once with the link shared with
/// [`EmbassyWsTransport`].
#[embassy_executor::task]
pub async fn stream_task(
    stack: Stack<'static>,
    buffers: &'static StreamBuffers,
    link: &'static StreamLink,
    mut rng: Rng,
    connect_timeout: Duration,
) {
    let tcp = Tcp::new(stack, buffers);
    let mut buf = vec![0u8; STREAM_BUFFER];
    let mut next = None;

    loop {
        let command = match next.take() {
            Some(command) => command,
            None => link.commands.receive().await,
        };
        // Sends and closes for a stream that is already gone
        let StreamCommand::Open { generation, target } = command else {
            continue;
        };
        next = run_stream(&tcp, &target, generation, &mut buf, &mut rng, link, connect_timeout).await;
    }
}

/// Open one stream and serve it until it fails or is replaced. Returns a
/// pending `Open` if that is what ended it.
async fn run_stream(
    tcp: &Tcp<'static, 1, STREAM_BUFFER, STREAM_BUFFER>,
    target: &StreamTarget,
    generation: u32,
    buf: &mut [u8],
    rng: &mut Rng,
    link: &StreamLink,
    connect_timeout: Duration,
) -> Option<StreamCommand> {
    let upgraded = with_timeout(connect_timeout, upgrade(tcp, target, buf, rng)).await;
    let (mut socket, buf) = match upgraded {
        Ok(Ok(upgraded)) => upgraded,
        Ok(Err(e)) => {
            link.report(StreamEvent::Failed(generation, e));
            return None;
        }
        Err(_) => {
            link.report(StreamEvent::Failed(generation, NetError::Timeout));
            return None;
        }
    };

    info!("ws: open to {}:{}{}", target.host.as_str(), target.port, target.path);
    link.report(StreamEvent::Opened(generation));

    match serve(&mut socket, buf, rng, link).await {
        Ok(next) => {
            let _ = send_frame(&mut socket, rng, FrameType::Close, &1000u16.to_be_bytes()).await;
            next
        }
        Err(e) => {
            warn!("ws: stream ended: {:?}", e);
            link.report(StreamEvent::Failed(generation, e));
            None
        }
    }
}

/// TCP connect plus HTTP upgrade. Fails unless the server answers 101 with a
/// matching `Sec-WebSocket-Accept`.
async fn upgrade<'b>(
    tcp: &'b Tcp<'static, 1, STREAM_BUFFER, STREAM_BUFFER>,
    target: &StreamTarget,
    buf: &'b mut [u8],
    rng: &mut Rng,
) -> Result<(StreamSocket<'b>, &'b mut [u8]), NetError> {
    let address = endpoint(&target.host, target.port)?;

    let mut nonce = [0u8; NONCE_LEN];
    for chunk in nonce.chunks_mut(4) {
        let random = rng.random().to_ne_bytes();
        chunk.copy_from_slice(&random[..chunk.len()]);
    }

    let mut conn: Connection<'_, _, 8> = Connection::new(buf, tcp, address);
    let mut key = [0u8; MAX_BASE64_KEY_LEN];
    conn.initiate_ws_upgrade_request(Some(target.host.as_str()), None, &target.path, None, &nonce, &mut key)
        .await?;
    conn.initiate_response().await?;

    let mut accept = [0u8; MAX_BASE64_KEY_RESPONSE_LEN];
    if !conn.is_ws_upgrade_accepted(&nonce, &mut accept)? {
        return Err(NetError::Refused);
    }
    conn.complete().await?;

    Ok(conn.release())
}

async fn send_frame(
    socket: &mut StreamSocket<'_>,
    rng: &mut Rng,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<(), NetError> {
    let header = FrameHeader {
        frame_type,
        payload_len: payload.len() as u64,
        mask_key: Some(rng.random()),
    };
    header.send(&mut *socket).await?;
    header.send_payload(&mut *socket, payload).await?;
    Ok(())
}

/// Relay queued sends and answer the server until a close or a new open.
async fn serve(
    socket: &mut StreamSocket<'_>,
    buf: &mut [u8],
    rng: &mut Rng,
    link: &StreamLink,
) -> Result<Option<StreamCommand>, NetError> {
    loop {
        // Waiting for readability consumes nothing, so losing the race is safe
        match select(link.commands.receive(), socket.readable()).await {
            Either::First(StreamCommand::Send(text)) => {
                send_frame(socket, rng, FrameType::Text(false), text.as_bytes()).await?;
            }
            Either::First(StreamCommand::Close) => return Ok(None),
            Either::First(open @ StreamCommand::Open { .. }) => return Ok(Some(open)),
            Either::Second(ready) => {
                ready.map_err(NetError::Tcp)?;
                with_timeout(FRAME_TIMEOUT, receive_frame(socket, buf, rng))
                    .await
                    .map_err(|_| NetError::Timeout)??;
            }
        }
    }
}

async fn receive_frame(
    socket: &mut StreamSocket<'_>,
    buf: &mut [u8],
    rng: &mut Rng,
) -> Result<(), NetError> {
    let header = FrameHeader::recv(&mut *socket).await?;
    let payload = header.recv_payload(&mut *socket, buf).await?;

    match header.frame_type {
        FrameType::Text(_) => debug!("ws: server sent {} bytes", payload.len()),
        FrameType::Ping => {
            let reply = payload.to_vec();
            send_frame(socket, rng, FrameType::Pong, &reply).await?;
        }
        FrameType::Close => return Err(NetError::Closed),
        _ => {}
    }
    Ok(())
}
