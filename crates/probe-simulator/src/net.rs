//! Desktop implementations of the probe's network seams.
//!
//! HTTP goes through a blocking `reqwest` client, the stream through
//! `tungstenite` over a std socket. The WebSocket handshake runs on its own
//! thread so the main loop never waits on it.

use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use tungstenite::handshake::HandshakeError;
use tungstenite::handshake::client::ClientHandshake;
use tungstenite::{Message, WebSocket};

use probe_core::http::{HttpClient, HttpRequest, HttpResponse, MAX_BODY, Method};
use probe_core::session::{StreamState, StreamTarget, StreamTransport};

#[derive(Debug)]
pub enum NetError {
    Io(io::Error),
    Http(reqwest::Error),
    Ws(tungstenite::Error),
    BodyTooLarge,
    Resolve,
    NotOpen,
    /// The handshake thread went away without reporting
    Abandoned,
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<tungstenite::Error> for NetError {
    fn from(e: tungstenite::Error) -> Self {
        Self::Ws(e)
    }
}

impl From<HandshakeError<ClientHandshake<TcpStream>>> for NetError {
    fn from(e: HandshakeError<ClientHandshake<TcpStream>>) -> Self {
        match e {
            HandshakeError::Failure(e) => Self::Ws(e),
            // Only reachable on a non-blocking socket
            HandshakeError::Interrupted(_) => Self::Io(ErrorKind::WouldBlock.into()),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or(NetError::Resolve)
}

fn to_std(duration: embassy_time::Duration) -> Duration {
    Duration::from_millis(duration.as_millis())
}

fn would_block(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(e) if e.kind() == ErrorKind::WouldBlock)
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub struct StdHttpClient {
    client: reqwest::blocking::Client,
}

impl StdHttpClient {
    pub fn new() -> Result<Self, NetError> {
        // The simulated subnet is local, never route it through a proxy
        let client = reqwest::blocking::Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }
}

impl HttpClient for StdHttpClient {
    type Error = NetError;

    async fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, NetError> {
        let url = format!("http://{}:{}{}", request.host, request.port, request.path);
        let builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url).body(request.body.to_vec()),
        };

        let response = builder.timeout(to_std(request.timeout)).send()?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        response.take(MAX_BODY as u64 + 1).read_to_end(&mut body)?;
        if body.len() > MAX_BODY {
            return Err(NetError::BodyTooLarge);
        }
        debug!("{} {} -> {} ({} bytes)", request.method.as_str(), url, status, body.len());

        Ok(HttpResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type Socket = WebSocket<TcpStream>;

/// Connect and upgrade with blocking I/O bounded by `timeout`, then hand the
/// socket back non-blocking.
fn handshake(target: &StreamTarget, timeout: Duration) -> Result<Socket, NetError> {
    let addr = resolve(&target.host, target.port)?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    let url = format!("ws://{}:{}{}", target.host.as_str(), target.port, target.path);
    // Rejects anything but a 101 with matching Upgrade, Connection and
    // Sec-WebSocket-Accept headers
    let (socket, _) = tungstenite::client::client(url.as_str(), stream)?;

    socket.get_ref().set_nonblocking(true)?;
    Ok(socket)
}

/// Drain whatever the server sent and push out queued frames, including
/// automatic pong and close replies.
fn service(socket: &mut Socket) -> Result<(), tungstenite::Error> {
    loop {
        match socket.read() {
            Ok(Message::Text(text)) => debug!("Server: {}", text.as_str()),
            Ok(_) => {}
            Err(e) if would_block(&e) => break,
            Err(e) => return Err(e),
        }
    }
    match socket.flush() {
        Err(e) if !would_block(&e) => Err(e),
        _ => Ok(()),
    }
}

pub struct StdWsTransport {
    connect_timeout: Duration,
    pending: Option<Receiver<Result<Socket, NetError>>>,
    socket: Option<Socket>,
}

impl StdWsTransport {
    pub fn new(connect_timeout: embassy_time::Duration) -> Self {
        Self {
            connect_timeout: to_std(connect_timeout),
            pending: None,
            socket: None,
        }
    }

    /// Collect the handshake result if the worker has finished.
    fn settle(&mut self) -> Result<(), NetError> {
        let Some(pending) = &self.pending else {
            return Ok(());
        };
        match pending.try_recv() {
            Ok(Ok(socket)) => {
                self.pending = None;
                if let Ok(peer) = socket.get_ref().peer_addr() {
                    info!("WebSocket open to {}", peer);
                }
                self.socket = Some(socket);
                Ok(())
            }
            Ok(Err(e)) => {
                self.pending = None;
                Err(e)
            }
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => {
                self.pending = None;
                Err(NetError::Abandoned)
            }
        }
    }
}

impl StreamTransport for StdWsTransport {
    type Error = NetError;

    fn open(&mut self, target: &StreamTarget) -> Result<(), NetError> {
        self.close();

        let (tx, rx) = mpsc::channel();
        let target = target.clone();
        let timeout = self.connect_timeout;
        thread::Builder::new()
            .name("ws-connect".into())
            .spawn(move || {
                // A dropped receiver means the attempt was abandoned
                let _ = tx.send(handshake(&target, timeout));
            })?;

        self.pending = Some(rx);
        Ok(())
    }

    fn poll(&mut self) -> Result<StreamState, NetError> {
        self.settle()?;
        if self.pending.is_some() {
            return Ok(StreamState::Opening);
        }

        let socket = self.socket.as_mut().ok_or(NetError::NotOpen)?;
        if let Err(e) = service(socket) {
            self.socket = None;
            return Err(e.into());
        }
        Ok(StreamState::Open)
    }

    fn send_text(&mut self, payload: &str) -> Result<(), NetError> {
        let socket = self.socket.as_mut().ok_or(NetError::NotOpen)?;
        match socket.send(Message::text(payload.to_owned())) {
            // Queued, the next poll flushes it
            Err(e) if would_block(&e) => Ok(()),
            Err(e) => {
                self.socket = None;
                Err(e.into())
            }
            Ok(()) => Ok(()),
        }
    }

    fn close(&mut self) {
        self.pending = None;
        if let Some(mut socket) = self.socket.take() {
            // Best effort, the peer may already be gone
            let _ = socket.close(None);
            let _ = socket.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread::JoinHandle;
    use std::time::Instant;

    use embassy_futures::block_on;
    use probe_core::credentials::ServerAddress;

    /// Accept one connection, wait for the request head and answer with
    /// `response` verbatim.
    fn serve_once(response: Vec<u8>) -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 512];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    return;
                }
                received.extend_from_slice(&chunk[..n]);
            }
            let _ = stream.write_all(&response);
        });
        (port, handle)
    }

    fn get(port: u16) -> Result<HttpResponse, NetError> {
        let mut client = StdHttpClient::new().unwrap();
        block_on(client.send(&HttpRequest {
            method: Method::Get,
            host: "127.0.0.1",
            port,
            path: "/api/",
            body: &[],
            timeout: embassy_time::Duration::from_secs(2),
        }))
    }

    fn target(port: u16) -> StreamTarget {
        StreamTarget {
            host: ServerAddress::try_from("127.0.0.1").unwrap(),
            port,
            path: "/ws/probe/abc-123/".into(),
        }
    }

    /// Poll until the transport leaves `Opening` or the deadline passes
    fn settle(transport: &mut StdWsTransport) -> Result<StreamState, NetError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match transport.poll() {
                Ok(StreamState::Opening) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_get_returns_status_and_body() {
        let (port, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}".to_vec());

        let response = get(port).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"{}");
        server.join().unwrap();
    }

    #[test]
    fn test_overflowing_chunk_size_is_an_error() {
        let (port, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc".to_vec(),
        );

        assert!(get(port).is_err());
        server.join().unwrap();
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            MAX_BODY + 1
        )
        .into_bytes();
        response.resize(response.len() + MAX_BODY + 1, b'x');
        let (port, server) = serve_once(response);

        assert!(matches!(get(port), Err(NetError::BodyTooLarge)));
        server.join().unwrap();
    }

    #[test]
    fn test_stream_opens_and_delivers_text() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = tungstenite::accept(stream).unwrap();
            loop {
                if let Message::Text(text) = socket.read().unwrap() {
                    return text.as_str().to_owned();
                }
            }
        });

        let mut transport = StdWsTransport::new(embassy_time::Duration::from_secs(2));
        transport.open(&target(port)).unwrap();
        assert!(matches!(settle(&mut transport), Ok(StreamState::Open)));

        transport.send_text(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(server.join().unwrap(), r#"{"message":"hello"}"#);
        transport.close();
    }

    #[test]
    fn test_wrong_accept_key_fails_the_handshake() {
        let (port, server) = serve_once(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n"
                .to_vec(),
        );

        let mut transport = StdWsTransport::new(embassy_time::Duration::from_secs(2));
        transport.open(&target(port)).unwrap();
        assert!(settle(&mut transport).is_err());
        assert!(matches!(transport.send_text("x"), Err(NetError::NotOpen)));
        server.join().unwrap();
    }

    #[test]
    fn test_open_returns_while_server_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = StdWsTransport::new(embassy_time::Duration::from_millis(300));
        let started = Instant::now();
        transport.open(&target(port)).unwrap();
        assert!(matches!(transport.poll(), Ok(StreamState::Opening)));
        assert!(started.elapsed() < Duration::from_millis(100));

        // The worker gives up on its own once the read timeout passes
        assert!(settle(&mut transport).is_err());
        drop(listener);
    }
}
