//! Protocol engine for the realtime conversation service.
//!
//! [`RealtimeClient`] sits on a [`Connection`]: it sends the session
//! configuration, decodes every inbound frame, turns output deltas into
//! [`MessageEvent`]s and answers function calls through the
//! [`FunctionRegistry`]. All failures inside the event loop are reported as
//! [`AppError`]s; the loop itself only stops on cancellation or teardown.

pub mod events;

pub use events::{ClientEvent, ServerEvent};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, TransportError};
use crate::functions::FunctionRegistry;
use crate::sync::lock;
use crate::transport::{Connection, Delivery, LinkStatus};
use events::FunctionCall;

/// Conversation bookkeeping shared between the loop and callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub response_id: Option<String>,
    pub is_streaming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A new streaming reply is starting.
    Prefix,
    /// A chunk of reply text.
    Delta,
    /// The reply is complete.
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub kind: MessageKind,
    pub text: String,
    pub is_final: bool,
}

impl MessageEvent {
    pub fn prefix() -> Self {
        Self {
            kind: MessageKind::Prefix,
            text: String::new(),
            is_final: false,
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Delta,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn done() -> Self {
        Self {
            kind: MessageKind::Done,
            text: String::new(),
            is_final: true,
        }
    }
}

struct Outputs {
    messages: mpsc::Sender<MessageEvent>,
    errors: mpsc::Sender<AppError>,
}

struct Engine {
    connection: Connection,
    registry: FunctionRegistry,
    session: Mutex<SessionState>,
    /// Link generation the current session was created on.
    session_generation: AtomicU64,
    outputs: Mutex<Option<Outputs>>,
    messages_rx: Mutex<Option<mpsc::Receiver<MessageEvent>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<AppError>>>,
    stop: CancellationToken,
    teardown: OnceCell<Result<(), TransportError>>,
}

/// Client for one realtime conversation.
pub struct RealtimeClient {
    inner: Arc<Engine>,
}

impl RealtimeClient {
    pub fn new(config: &Config, registry: FunctionRegistry) -> Self {
        Self::with_connection(Connection::from_config(config), registry, config.channel_buffer)
    }

    /// `capacity` bounds the message and error channels.
    pub fn with_connection(
        connection: Connection,
        registry: FunctionRegistry,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let (messages, messages_rx) = mpsc::channel(capacity);
        let (errors, errors_rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(Engine {
                connection,
                registry,
                session: Mutex::new(SessionState::default()),
                session_generation: AtomicU64::new(0),
                outputs: Mutex::new(Some(Outputs { messages, errors })),
                messages_rx: Mutex::new(Some(messages_rx)),
                errors_rx: Mutex::new(Some(errors_rx)),
                stop: CancellationToken::new(),
                teardown: OnceCell::new(),
            }),
        }
    }

    /// Open the link, send the session configuration and start the event
    /// loop. Returns once the configuration has been queued; the session is
    /// ready when [`RealtimeClient::is_connected`] turns true.
    pub async fn connect(&self, ctx: &CancellationToken) -> Result<(), AppError> {
        let engine = &self.inner;
        engine.connection.connect(ctx).await.map_err(|err| {
            AppError::error("failed to connect to the realtime service").with_cause(err)
        })?;

        let (Some(inbound), Some(transport_errors)) =
            (engine.connection.take_inbound(), engine.connection.take_errors())
        else {
            return Err(AppError::error("realtime client is already running"));
        };

        let link = engine.connection.subscribe();
        engine.send_session_config(ctx).await?;
        tokio::spawn(Arc::clone(engine).run(ctx.clone(), link, inbound, transport_errors));
        info!("Connected to the realtime service");
        Ok(())
    }

    /// Send a user turn followed by a response request.
    ///
    /// Rejected with a warning while a reply is still streaming.
    pub async fn send_message(&self, ctx: &CancellationToken, text: &str) -> Result<(), AppError> {
        if self.inner.session().is_streaming {
            return Err(AppError::warning("Message stream in progress"));
        }
        self.inner.send_event(ctx, &ClientEvent::user_message(text)).await?;
        self.inner
            .send_event(ctx, &ClientEvent::response_request(text))
            .await
    }

    /// Stop the event loop and close the link. Concurrent and repeated calls
    /// share one teardown.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let engine = &self.inner;
        engine
            .teardown
            .get_or_init(|| async {
                debug!("Disconnecting from the realtime service");
                engine.stop.cancel();
                drop(lock(&engine.outputs).take());
                engine.connection.disconnect().await
            })
            .await
            .clone()
    }

    /// Link up and a session created on the current stream.
    pub fn is_connected(&self) -> bool {
        let engine = &self.inner;
        engine.connection.is_connected()
            && engine.session().session_id.is_some()
            && engine.session_generation.load(Ordering::SeqCst) == engine.connection.generation()
    }

    pub fn session(&self) -> SessionState {
        self.inner.session()
    }

    /// Reply stream. Available once.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<MessageEvent>> {
        lock(&self.inner.messages_rx).take()
    }

    /// Reports from the engine and the transport. Available once.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<AppError>> {
        lock(&self.inner.errors_rx).take()
    }

    pub fn available_functions(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }
}

impl Engine {
    fn session(&self) -> SessionState {
        lock(&self.session).clone()
    }

    async fn send_session_config(&self, ctx: &CancellationToken) -> Result<(), AppError> {
        let tools = self.registry.tools_json();
        debug!(tools = tools.len(), "Sending session configuration");
        self.send_event(ctx, &ClientEvent::session_update(tools)).await
    }

    async fn send_event(&self, ctx: &CancellationToken, event: &ClientEvent) -> Result<(), AppError> {
        let frame = event.encode().map_err(AppError::marshal)?;
        match self.connection.send(ctx, frame).await {
            Ok(Delivery::Queued) => {
                debug!(event = event.kind(), "Event queued");
                Ok(())
            }
            Ok(Delivery::Dropped) => {
                debug!(event = event.kind(), "Event dropped during shutdown");
                Ok(())
            }
            Err(err) => Err(AppError::warning("failed to send message").with_cause(err)),
        }
    }

    async fn run(
        self: Arc<Self>,
        ctx: CancellationToken,
        mut link: watch::Receiver<LinkStatus>,
        mut inbound: mpsc::Receiver<String>,
        mut transport_errors: mpsc::Receiver<AppError>,
    ) {
        let mut errors_open = true;
        let mut link_open = true;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = self.stop.cancelled() => break,
                changed = link.changed(), if link_open => match changed {
                    Ok(()) => {
                        let status = *link.borrow_and_update();
                        self.on_link_change(&ctx, status).await;
                    }
                    Err(_) => link_open = false,
                },
                report = transport_errors.recv(), if errors_open => match report {
                    Some(report) => self.report(report),
                    None => errors_open = false,
                },
                frame = inbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = self.handle_frame(&ctx, &frame).await {
                            self.report(err);
                        }
                    }
                    None => {
                        if !self.stop.is_cancelled() && !ctx.is_cancelled() {
                            self.report(AppError::error("Disconnected from the realtime service"));
                        }
                        break;
                    }
                },
            }
        }
        debug!("Event loop stopped");
    }

    async fn handle_frame(&self, ctx: &CancellationToken, frame: &str) -> Result<(), AppError> {
        let event = ServerEvent::decode(frame).map_err(AppError::unmarshal)?;
        match event {
            ServerEvent::SessionCreated { session } => {
                debug!(session_id = %session.id, "Session created");
                let generation = self.connection.generation();
                let earlier = self.session_generation.swap(generation, Ordering::SeqCst);
                let previous = lock(&self.session).session_id.replace(session.id.clone());
                self.on_done(ctx).await;
                let relinked = earlier != 0 && earlier != generation;
                if relinked || previous.is_some_and(|id| id != session.id) {
                    info!("New session after reconnect, resending configuration");
                    self.send_session_config(ctx).await?;
                }
            }
            ServerEvent::SessionUpdated { .. } => debug!("Session updated"),
            ServerEvent::ResponseCreated { response } => {
                debug!(response_id = ?response.id, status = ?response.status, "Response created");
                lock(&self.session).response_id = response.id;
            }
            ServerEvent::OutputTextDelta { delta, .. } => self.on_delta(ctx, delta).await,
            ServerEvent::OutputTextDone { .. } => self.on_text_done(ctx).await,
            ServerEvent::FunctionCallArgumentsDone(call) => {
                let outcome = self.on_function_call(ctx, &call).await;
                self.on_done(ctx).await;
                outcome?;
            }
            event if event.is_terminal() => self.on_done(ctx).await,
            ServerEvent::ResponseFailed { response } => {
                lock(&self.session).is_streaming = false;
                return Err(AppError::error(format!(
                    "response failed: Code: {}, Message: {}",
                    response.error.code(),
                    response.error.message()
                )));
            }
            ServerEvent::Error { event_id, error } => {
                lock(&self.session).is_streaming = false;
                debug!(?event_id, param = ?error.param, "Server reported an error");
                return Err(AppError::error(format!(
                    "response error: Code: {}, Message: {}",
                    error.code(),
                    error.message()
                )));
            }
            _ => debug!("Ignoring unhandled event"),
        }
        Ok(())
    }

    /// A stream that is gone takes its session and any reply in flight with
    /// it; the interrupted reply still gets its final event.
    async fn on_link_change(&self, ctx: &CancellationToken, status: LinkStatus) {
        if status.connected
            && self.session_generation.load(Ordering::SeqCst) == status.generation
        {
            return;
        }
        let (stale, interrupted) = {
            let mut state = lock(&self.session);
            state.response_id = None;
            (
                state.session_id.take(),
                std::mem::replace(&mut state.is_streaming, false),
            )
        };
        if let Some(session_id) = stale {
            info!(%session_id, generation = status.generation, "Session lost with its stream");
        }
        if interrupted {
            debug!("Reply interrupted by a lost stream");
            self.emit_message(ctx, MessageEvent::done()).await;
        }
    }

    async fn on_delta(&self, ctx: &CancellationToken, delta: String) {
        let starting = {
            let mut state = lock(&self.session);
            !std::mem::replace(&mut state.is_streaming, true)
        };
        if starting {
            self.emit_message(ctx, MessageEvent::prefix()).await;
        }
        self.emit_message(ctx, MessageEvent::delta(delta)).await;
    }

    /// Text is complete: always final, even for a reply without deltas.
    async fn on_text_done(&self, ctx: &CancellationToken) {
        let was_streaming = std::mem::replace(&mut lock(&self.session).is_streaming, false);
        if !was_streaming {
            debug!("Text finished without deltas");
        }
        self.emit_message(ctx, MessageEvent::done()).await;
    }

    /// Emits the final event only if a reply was streaming.
    async fn on_done(&self, ctx: &CancellationToken) {
        let was_streaming = std::mem::replace(&mut lock(&self.session).is_streaming, false);
        if was_streaming {
            self.emit_message(ctx, MessageEvent::done()).await;
        }
    }

    async fn on_function_call(&self, ctx: &CancellationToken, call: &FunctionCall) -> Result<(), AppError> {
        debug!(function = %call.name, call_id = %call.call_id, "Function call requested");
        let output = self.registry.execute(&call.name, &call.arguments)?;
        let result = output.result.to_string();
        debug!(function = %call.name, %result, "Function returned");
        self.send_event(ctx, &ClientEvent::function_output(&call.call_id, &result))
            .await?;
        self.send_event(
            ctx,
            &ClientEvent::function_continue(&call.name, &call.arguments, &result),
        )
        .await
    }

    /// Waits for room so replies keep their order; gives up on shutdown.
    async fn emit_message(&self, ctx: &CancellationToken, event: MessageEvent) {
        let Some(messages) = lock(&self.outputs).as_ref().map(|o| o.messages.clone()) else {
            return;
        };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {}
            _ = self.stop.cancelled() => {}
            sent = messages.send(event) => {
                if sent.is_err() {
                    debug!("Message consumer gone");
                }
            }
        }
    }

    /// Never blocks; a full error buffer drops the report.
    fn report(&self, err: AppError) {
        let outputs = lock(&self.outputs);
        let Some(outputs) = outputs.as_ref() else {
            return;
        };
        if let Err(TrySendError::Full(err)) = outputs.errors.try_send(err) {
            warn!(message = %err.message, "Error buffer full, dropping report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::retry::ReconnectPolicy;
    use crate::transport::WsConnector;

    fn offline_client() -> RealtimeClient {
        let connection = Connection::new(
            Arc::new(WsConnector::new("ws://127.0.0.1:9/v1/realtime", "k")),
            8,
            ReconnectPolicy::from_timeout(1, 1),
        );
        RealtimeClient::with_connection(connection, FunctionRegistry::builtin(), 8)
    }

    async fn feed(client: &RealtimeClient, frame: &str) -> Result<(), AppError> {
        client
            .inner
            .handle_frame(&CancellationToken::new(), frame)
            .await
    }

    #[tokio::test]
    async fn deltas_stream_with_one_prefix_and_one_final() {
        let client = offline_client();
        let mut messages = client.take_messages().unwrap();

        feed(&client, r#"{"type":"response.output_text.delta","delta":"Hel"}"#).await.unwrap();
        assert!(client.session().is_streaming);
        feed(&client, r#"{"type":"response.output_text.delta","delta":"lo"}"#).await.unwrap();
        feed(&client, r#"{"type":"response.output_text.done","text":"Hello"}"#).await.unwrap();
        feed(&client, r#"{"type":"response.done","response":{"id":"r1"}}"#).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = messages.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                MessageEvent::prefix(),
                MessageEvent::delta("Hel"),
                MessageEvent::delta("lo"),
                MessageEvent::done(),
            ]
        );
        assert!(!client.session().is_streaming);
    }

    #[tokio::test]
    async fn reply_without_deltas_still_gets_a_final() {
        let client = offline_client();
        let mut messages = client.take_messages().unwrap();

        feed(&client, r#"{"type":"response.output_text.done","text":""}"#).await.unwrap();
        feed(&client, r#"{"type":"response.done","response":{"id":"r2"}}"#).await.unwrap();

        assert_eq!(messages.try_recv().unwrap(), MessageEvent::done());
        assert!(messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn lost_stream_finishes_the_interrupted_reply() {
        let client = offline_client();
        let mut messages = client.take_messages().unwrap();
        feed(&client, r#"{"type":"session.created","session":{"id":"sess_1"}}"#).await.unwrap();
        feed(&client, r#"{"type":"response.output_text.delta","delta":"par"}"#).await.unwrap();

        let lost = LinkStatus {
            generation: 1,
            connected: false,
        };
        client.inner.on_link_change(&CancellationToken::new(), lost).await;

        assert_eq!(client.session(), SessionState::default());
        let mut seen = Vec::new();
        while let Ok(event) = messages.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![MessageEvent::prefix(), MessageEvent::delta("par"), MessageEvent::done()]
        );
    }

    #[tokio::test]
    async fn session_created_records_id() {
        let client = offline_client();
        feed(&client, r#"{"type":"session.created","session":{"id":"sess_1"}}"#).await.unwrap();
        assert_eq!(client.session().session_id.as_deref(), Some("sess_1"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames() {
        let client = offline_client();
        feed(&client, r#"{"type":"rate_limits.updated"}"#).await.unwrap();

        let err = feed(&client, "{not json").await.unwrap_err();
        assert_eq!(err.severity, Severity::Warning);
        assert_eq!(err.message, "failed to unmarshal JSON");
    }

    #[tokio::test]
    async fn failures_are_fatal_and_clear_streaming() {
        let client = offline_client();
        feed(&client, r#"{"type":"response.output_text.delta","delta":"x"}"#).await.unwrap();

        let err = feed(
            &client,
            r#"{"type":"response.failed","response":{"error":{"code":"rate_limited","message":"slow down"}}}"#,
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.message, "response failed: Code: rate_limited, Message: slow down");
        assert!(!client.session().is_streaming);

        let err = feed(
            &client,
            r#"{"type":"error","event_id":"e1","error":{"code":"invalid_value","message":"nope","param":"x"}}"#,
        )
        .await
        .unwrap_err();
        assert_eq!(err.message, "response error: Code: invalid_value, Message: nope");
    }

    #[tokio::test]
    async fn streaming_blocks_new_messages() {
        let client = offline_client();
        feed(&client, r#"{"type":"response.output_text.delta","delta":"x"}"#).await.unwrap();
        let err = client
            .send_message(&CancellationToken::new(), "again")
            .await
            .unwrap_err();
        assert_eq!(err.message, "Message stream in progress");
        assert_eq!(err.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn unknown_function_is_a_warning() {
        let client = offline_client();
        let err = feed(
            &client,
            r#"{"type":"response.function_call_arguments.done","call_id":"c9","name":"divide","arguments":"{}"}"#,
        )
        .await
        .unwrap_err();
        assert_eq!(err.message, "function doesn't exist: divide");
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn disconnect_closes_outputs() {
        let client = offline_client();
        let mut messages = client.take_messages().unwrap();
        let mut errors = client.take_errors().unwrap();
        let (first, second) = tokio::join!(client.disconnect(), client.disconnect());
        assert_eq!(first, second);
        assert!(messages.recv().await.is_none());
        assert!(errors.recv().await.is_none());
    }

    #[test]
    fn lists_registered_functions() {
        assert_eq!(offline_client().available_functions(), vec!["multiply"]);
    }
}
