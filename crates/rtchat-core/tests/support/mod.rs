//! In-process realtime server and helpers shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rtchat_core::TransportError;
use rtchat_core::retry::ReconnectPolicy;
use rtchat_core::transport::{Connection, Connector, WsConnector, WsStream};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const WAIT: Duration = Duration::from_secs(5);
pub const API_KEY: &str = "test-key";
pub const MODEL: &str = "test-model";

/// Short waits so reconnect tests finish quickly.
pub fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        initial_pause: Duration::from_millis(10),
        step: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
    }
}

pub fn connection_to(server: &MockServer, capacity: usize, policy: ReconnectPolicy) -> Connection {
    Connection::new(Arc::new(server.connector()), capacity, policy)
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Counts every dial before delegating to a real connector.
pub struct CountingConnector {
    inner: WsConnector,
    pub dials: Arc<AtomicUsize>,
}

impl CountingConnector {
    pub fn new(inner: WsConnector) -> Self {
        Self {
            inner,
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self) -> Result<WsStream, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.connect().await
    }
}

const HEALTHY: u8 = 0;
const BROKEN: u8 = 1;
const STALLED: u8 = 2;

/// TCP stream whose health the test controls once the handshake is done.
pub struct FaultySocket {
    inner: TcpStream,
    mode: Arc<AtomicU8>,
}

impl FaultySocket {
    fn failure(&self) -> Option<Poll<io::Result<()>>> {
        match self.mode.load(Ordering::SeqCst) {
            BROKEN => Some(Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))),
            STALLED => Some(Poll::Pending),
            _ => None,
        }
    }
}

impl AsyncRead for FaultySocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.mode.load(Ordering::SeqCst) == BROKEN {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultySocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(failure) = self.failure() {
            return failure.map(|result| result.map(|()| 0));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(failure) = self.failure() {
            return failure;
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(failure) = self.failure() {
            return failure;
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Dials through [`FaultySocket`]s; only the latest stream can be broken.
pub struct FaultyConnector {
    inner: WsConnector,
    addr: std::net::SocketAddr,
    current: Mutex<Arc<AtomicU8>>,
    pub dials: Arc<AtomicUsize>,
}

impl FaultyConnector {
    pub fn new(server: &MockServer) -> Self {
        Self {
            inner: server.connector(),
            addr: server.addr(),
            current: Mutex::new(Arc::new(AtomicU8::new(HEALTHY))),
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reads and writes on the latest stream fail from now on.
    pub fn break_current(&self) {
        self.current.lock().unwrap().store(BROKEN, Ordering::SeqCst);
    }

    /// Writes on the latest stream never complete from now on.
    pub fn stall_current(&self) {
        self.current.lock().unwrap().store(STALLED, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FaultyConnector {
    async fn connect(&self) -> Result<WsStream, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let inner = TcpStream::connect(self.addr)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        let mode = Arc::new(AtomicU8::new(HEALTHY));
        *self.current.lock().unwrap() = mode.clone();
        self.inner
            .connect_over(Box::new(FaultySocket { inner, mode }))
            .await
    }
}

pub struct MockServer {
    addr: std::net::SocketAddr,
    peers: mpsc::UnboundedReceiver<Peer>,
    accepted: Arc<AtomicUsize>,
    listener: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, peers) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        let listener = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(peer) = Peer::handshake(stream).await {
                        let _ = tx.send(peer);
                    }
                });
            }
        });

        Self {
            addr,
            peers,
            accepted,
            listener,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime?model={MODEL}", self.addr)
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn connector(&self) -> WsConnector {
        WsConnector::new(self.url(), API_KEY)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub async fn next_peer(&mut self) -> Peer {
        within("a client connection", self.peers.recv())
            .await
            .expect("server stopped")
    }

    /// Close the listening socket; later dials are refused.
    pub async fn stop_accepting(&mut self) {
        self.listener.abort();
        let _ = (&mut self.listener).await;
    }
}

enum PeerCommand {
    Send(String),
    Close(CloseCode),
    Drop,
}

/// Server side of one accepted connection.
pub struct Peer {
    pub authorization: Option<String>,
    pub target: String,
    frames: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    close_received: Arc<AtomicBool>,
}

impl Peer {
    async fn handshake(stream: TcpStream) -> Option<Self> {
        let mut authorization = None;
        let mut target = String::new();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            authorization = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            target = request.uri().to_string();
            Ok(response)
        };
        let ws = accept_hdr_async(stream, callback).await.ok()?;

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (commands, mut commands_rx) = mpsc::unbounded_channel();
        let close_received = Arc::new(AtomicBool::new(false));
        let flag = close_received.clone();

        tokio::spawn(async move {
            let (mut sink, mut source) = ws.split();
            loop {
                tokio::select! {
                    command = commands_rx.recv() => match command {
                        Some(PeerCommand::Send(text)) => {
                            if sink.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(PeerCommand::Close(code)) => {
                            let frame = CloseFrame { code, reason: "".into() };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                        }
                        Some(PeerCommand::Drop) | None => break,
                    },
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            let _ = frames_tx.send(text.as_str().to_owned());
                        }
                        Some(Ok(Message::Close(_))) => flag.store(true, Ordering::SeqCst),
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                }
            }
        });

        Some(Self {
            authorization,
            target,
            frames,
            commands,
            close_received,
        })
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.commands.send(PeerCommand::Send(text.to_owned()));
    }

    pub fn send_json(&self, value: Value) {
        self.send_raw(&value.to_string());
    }

    pub fn close(&self, code: CloseCode) {
        let _ = self.commands.send(PeerCommand::Close(code));
    }

    /// Drop the socket without a closing handshake.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(PeerCommand::Drop);
    }

    pub async fn recv(&mut self) -> String {
        within("a frame from the client", self.frames.recv())
            .await
            .expect("client connection ended")
    }

    pub async fn recv_json(&mut self) -> Value {
        serde_json::from_str(&self.recv().await).expect("client sent invalid JSON")
    }

    /// Assert nothing arrives for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(Some(frame)) = timeout(quiet, self.frames.recv()).await {
            panic!("unexpected frame from client: {frame}");
        }
    }

    /// Wait for the connection to end; true if the client sent a close frame.
    pub async fn wait_closed(&mut self) -> bool {
        within("the connection to end", async {
            while self.frames.recv().await.is_some() {}
        })
        .await;
        self.close_received.load(Ordering::SeqCst)
    }
}
