//! Resilient WebSocket link.
//!
//! A [`Connection`] owns one live stream at a time. Inbound text frames are
//! forwarded into a bounded channel without blocking the reader, outbound
//! frames are drained by a single writer, and any unexpected failure hands
//! off to one reconnect task that redials with linear backoff. Transport
//! problems are reported as [`AppError`]s on a separate channel.

mod connector;
mod state;

pub use connector::{BoxedSocket, Connector, Socket, WsConnector, WsStream};
pub use state::{ConnectionState, ReconnectState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, TransportError};
use crate::retry::{ReconnectPolicy, RetryError, retry_with_backoff};
use crate::sync::lock;
use state::Link;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of [`Connection::send`] when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the writer.
    Queued,
    /// The caller's token fired first; the frame was discarded.
    Dropped,
}

/// Published whenever a stream is established or lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    /// Number of streams established so far.
    pub generation: u64,
    pub connected: bool,
}

struct Channels {
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Sender<String>,
    errors: mpsc::Sender<AppError>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    link: Link,
    /// Producer handles; taken exactly once on teardown.
    channels: Mutex<Option<Channels>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<AppError>>>,
    /// Held by the active writer for its whole lifetime.
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    /// Child of the caller's token; cancelled on teardown.
    lifetime: Mutex<Option<CancellationToken>>,
    /// Child of `lifetime`; replaced for every established stream.
    current: Mutex<Option<CancellationToken>>,
    teardown: OnceCell<Result<(), TransportError>>,
    dropped: AtomicU64,
    status: watch::Sender<LinkStatus>,
}

/// A WebSocket link that reconnects on its own.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// `capacity` bounds every internal channel; zero is raised to one.
    pub fn new(connector: Arc<dyn Connector>, capacity: usize, policy: ReconnectPolicy) -> Self {
        let capacity = capacity.max(1);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (inbound, inbound_rx) = mpsc::channel(capacity);
        let (errors, errors_rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                link: Link::default(),
                channels: Mutex::new(Some(Channels {
                    outbound,
                    inbound,
                    errors,
                })),
                inbound_rx: Mutex::new(Some(inbound_rx)),
                errors_rx: Mutex::new(Some(errors_rx)),
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                sink: tokio::sync::Mutex::new(None),
                lifetime: Mutex::new(None),
                current: Mutex::new(None),
                teardown: OnceCell::new(),
                dropped: AtomicU64::new(0),
                status: watch::channel(LinkStatus::default()).0,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(WsConnector::from_config(config)),
            config.channel_buffer,
            config.reconnect_policy(),
        )
    }

    /// Dial and start the reader and writer. Cancelling `ctx` stops the
    /// loops and any reconnect in progress.
    pub async fn connect(&self, ctx: &CancellationToken) -> Result<(), TransportError> {
        if self.inner.link.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.inner.link.connection() != ConnectionState::Disconnected {
            return Err(TransportError::AlreadyConnected);
        }
        let lifetime = ctx.child_token();
        let previous = lock(&self.inner.lifetime).replace(lifetime);
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.inner.establish().await?;
        info!("WebSocket connected to the server.");
        Ok(())
    }

    /// Queue a text frame for the writer.
    ///
    /// Fails fast when the link is not connected. If `ctx` is cancelled
    /// before the frame is queued it is dropped without an error.
    pub async fn send(
        &self,
        ctx: &CancellationToken,
        frame: String,
    ) -> Result<Delivery, TransportError> {
        if !self.inner.link.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let outbound = lock(&self.inner.channels)
            .as_ref()
            .map(|channels| channels.outbound.clone())
            .ok_or(TransportError::ConnectionClosed)?;
        let lifetime = self
            .inner
            .lifetime_token()
            .ok_or(TransportError::ConnectionClosed)?;

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!("Send cancelled before the frame was queued");
                Ok(Delivery::Dropped)
            }
            _ = lifetime.cancelled() => Err(TransportError::ConnectionClosed),
            sent = outbound.send(frame) => sent
                .map(|()| Delivery::Queued)
                .map_err(|_| TransportError::ConnectionClosed),
        }
    }

    /// Close the link for good. Concurrent and repeated calls share one
    /// teardown and observe the same result.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .teardown
            .get_or_init(|| inner.shutdown())
            .await
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.connection()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.inner.link.reconnect()
    }

    /// Inbound text frames, in arrival order. Available once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        lock(&self.inner.inbound_rx).take()
    }

    /// Transport reports. Available once.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<AppError>> {
        lock(&self.inner.errors_rx).take()
    }

    /// Stream establishment and loss. The value current at subscription
    /// time counts as seen.
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// Streams established so far; bumped before the new stream reports
    /// connected.
    pub fn generation(&self) -> u64 {
        self.inner.status.borrow().generation
    }

    /// Inbound frames discarded because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn lifetime_token(&self) -> Option<CancellationToken> {
        lock(&self.lifetime).clone()
    }

    /// Dial once and, on success, install the stream and spawn its loops.
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let lifetime = self
            .lifetime_token()
            .ok_or(TransportError::ConnectionClosed)?;
        self.link.set_connection(ConnectionState::Connecting);

        let stream = match self.connector.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                self.link.set_connection(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        let (sink, source) = stream.split();

        let token = {
            let mut slot = self.sink.lock().await;
            if self.link.is_closed() || lifetime.is_cancelled() {
                return Err(TransportError::ConnectionClosed);
            }
            *slot = Some(sink);
            let token = lifetime.child_token();
            let stale = lock(&self.current).replace(token.clone());
            if let Some(stale) = stale {
                stale.cancel();
            }
            self.status.send_modify(|status| {
                status.generation += 1;
                status.connected = true;
            });
            if !self.link.mark_connected() {
                self.announce_lost();
                return Err(TransportError::ConnectionClosed);
            }
            token
        };

        tokio::spawn(read_loop(Arc::clone(self), source, token.clone()));
        tokio::spawn(write_loop(Arc::clone(self), token));
        Ok(())
    }

    fn announce_lost(&self) {
        let changed = self
            .status
            .send_if_modified(|status| std::mem::replace(&mut status.connected, false));
        if changed {
            debug!("Stream lost");
        }
    }

    /// Forward an inbound frame without blocking; a full buffer drops it.
    fn forward(&self, frame: String) {
        let channels = lock(&self.channels);
        let Some(channels) = channels.as_ref() else {
            return;
        };
        match channels.inbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Inbound buffer full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Report a transport problem without blocking.
    fn emit(&self, report: AppError) {
        let channels = lock(&self.channels);
        let Some(channels) = channels.as_ref() else {
            debug!(message = %report.message, "Link closed, report discarded");
            return;
        };
        if let Err(TrySendError::Full(report)) = channels.errors.try_send(report) {
            warn!(message = %report.message, "Error buffer full, dropping report");
        }
    }

    /// Start a reconnect unless one is already running or the link is done.
    fn trigger_reconnect(self: &Arc<Self>) {
        self.announce_lost();
        if !self.link.try_begin_reconnect() {
            debug!(state = %self.link.reconnect(), "Reconnect not started");
            return;
        }
        tokio::spawn(Arc::clone(self).reconnect());
    }

    async fn reconnect(self: Arc<Self>) {
        info!("Reconnecting to the server...");
        let stale = lock(&self.current).take();
        if let Some(stale) = stale {
            stale.cancel();
        }
        let Some(lifetime) = self.lifetime_token() else {
            self.link.fail_reconnect();
            return;
        };

        tokio::select! {
            biased;
            _ = lifetime.cancelled() => {
                self.link.fail_reconnect();
                return;
            }
            _ = tokio::time::sleep(self.policy.initial_pause) => {}
        }

        let result = retry_with_backoff(
            &self.policy,
            &lifetime,
            |_| {
                let inner = Arc::clone(&self);
                async move { inner.establish().await }
            },
            |attempt, err| {
                self.emit(
                    AppError::warning(format!("reconnection attempt {} failed", attempt.attempt))
                        .with_cause(err.clone()),
                );
            },
        )
        .await;

        match result {
            Ok(()) => info!("Reconnection successful"),
            Err(RetryError::Cancelled) => {
                self.link.fail_reconnect();
                debug!("Reconnect cancelled");
            }
            Err(RetryError::Exhausted { attempts, .. }) => {
                self.link.fail_reconnect();
                error!(attempts, "Giving up on reconnection");
                self.emit(AppError::error(format!(
                    "failed to reconnect after {attempts} attempts"
                )));
            }
        }
    }

    async fn shutdown(self: Arc<Self>) -> Result<(), TransportError> {
        debug!("WebSocket disconnecting from the server.");
        self.link.close();
        if let Some(lifetime) = self.lifetime_token() {
            lifetime.cancel();
        }
        let current = lock(&self.current).take();
        if let Some(current) = current {
            current.cancel();
        }
        drop(lock(&self.channels).take());

        self.announce_lost();

        let closing = async {
            let sink = self.sink.lock().await.take();
            match sink {
                Some(sink) => close_sink(sink).await,
                None => Ok(()),
            }
        };
        let result = match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Close("timed out closing the websocket".into())),
        };
        debug!("WebSocket disconnected from the server.");
        result
    }
}

async fn close_sink(mut sink: WsSink) -> Result<(), TransportError> {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    match sink.send(Message::Close(Some(frame))).await {
        Ok(()) => {}
        Err(err) if is_benign_close(&err) => return Ok(()),
        Err(err) => return Err(TransportError::Close(err.to_string())),
    }
    match sink.close().await {
        Ok(()) => Ok(()),
        Err(err) if is_benign_close(&err) => Ok(()),
        Err(err) => Err(TransportError::Close(err.to_string())),
    }
}

fn is_benign_close(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

fn is_expected_close(frame: Option<&CloseFrame>) -> bool {
    frame.is_none_or(|frame| matches!(frame.code, CloseCode::Normal | CloseCode::Away))
}

async fn read_loop(inner: Arc<Inner>, mut source: WsSource, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = source.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => inner.forward(text.as_str().to_owned()),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => inner.forward(text),
                Err(_) => debug!("Discarding non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                if cancel.is_cancelled() {
                    return;
                }
                inner.link.set_connection(ConnectionState::Disconnected);
                inner.announce_lost();
                if is_expected_close(frame.as_ref()) {
                    debug!("WebSocket closed by the server.");
                    inner.emit(TransportError::ConnectionClosed.into());
                } else {
                    warn!(?frame, "WebSocket closed abnormally");
                    inner.trigger_reconnect();
                }
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(WsError::ConnectionClosed)) => {
                inner.link.set_connection(ConnectionState::Disconnected);
                inner.announce_lost();
                inner.emit(TransportError::ConnectionClosed.into());
                return;
            }
            Some(Err(err)) => {
                if cancel.is_cancelled() {
                    return;
                }
                debug!(error = %err, "WebSocket read failed");
                inner.trigger_reconnect();
                return;
            }
            None => {
                if cancel.is_cancelled() {
                    return;
                }
                debug!("WebSocket stream ended");
                inner.trigger_reconnect();
                return;
            }
        }
    }
}

async fn write_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut outbound = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        guard = inner.outbound_rx.lock() => guard,
    };
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        if !inner.link.is_connected() {
            inner.emit(write_error(TransportError::ConnectionClosed));
            continue;
        }
        let sent = {
            let mut sink = inner.sink.lock().await;
            let result = match sink.as_mut() {
                Some(active) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = active.send(Message::text(frame)) => {
                        sent.map_err(|e| TransportError::Write(e.to_string()))
                    }
                },
                None => Err(TransportError::ConnectionClosed),
            };
            result
        };
        match sent {
            Ok(()) => {}
            Err(TransportError::ConnectionClosed) => {
                inner.emit(write_error(TransportError::ConnectionClosed));
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                inner.emit(write_error(err));
                inner.trigger_reconnect();
                return;
            }
        }
    }
}

fn write_error(cause: TransportError) -> AppError {
    AppError::warning("websocket write error").with_cause(cause)
}
