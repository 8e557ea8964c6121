//! Hub protocol client.
//!
//! A [`HubClient`] owns one WebSocket session at a time. `connect()` opens
//! the socket and runs the auth handshake; once `Ready`, a reader task
//! routes `result` frames to waiting callers and `event` frames through the
//! dispatcher, a writer task owns the send half, and the keepalive monitor
//! watches liveness. An unexpected close hands control to the reconnect
//! policy, which drives `connect()` again after a fixed delay.
//!
//! All mutable state (connection state, pending requests, fetch queue,
//! retry state, registry cache) sits behind a single mutex. The lock is
//! never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::auth;
use crate::config::HubConfig;
use crate::correlator::{Correlator, Outcome};
use crate::debouncer::FetchQueue;
use crate::dispatcher::{self, Dispatch};
use crate::error::{HubError, HubResult};
use crate::events::{ClientEvent, EventReceiver, HubEvents};
use crate::keepalive::{self, KeepaliveHost, PongSignal};
use crate::protocol::{self, HubEvent, InboundFrame, ServiceCall};
use crate::registry::{RegistryCache, RegistryCounts, ResourceKind};
use crate::supervisor::{RetryDecision, RetryState};
use crate::transport::{
    CloseInfo, Connector, FrameSink, FrameStream, Transport, WireMessage, WsConnector,
};

/// Close code sent when the client ends a session itself.
const NORMAL_CLOSURE: u16 = 1000;

/// Lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

/// Handles of the live socket.
struct Session {
    generation: u64,
    outbound: mpsc::UnboundedSender<WireMessage>,
    pongs: PongSignal,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl Session {
    fn stop_keepalive(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }

    /// Stop reading, optionally queue a close frame, and hand back the
    /// writer so the caller can wait for it to flush.
    fn release(mut self, close: Option<CloseInfo>) -> JoinHandle<()> {
        self.stop_keepalive();
        if let Some(close) = close {
            let _ = self.outbound.send(WireMessage::Close(Some(close)));
        }
        self.reader.abort();
        self.writer
    }
}

/// Why a session ended without `close()` being called.
enum Loss {
    Closed(Option<CloseInfo>),
    Failed(String),
    WatchdogExpired,
}

struct Shared {
    state: ConnectionState,
    version: Option<String>,
    generation: u64,
    explicit_close: bool,
    session: Option<Session>,
    correlator: Correlator,
    fetch_queue: FetchQueue,
    retry: RetryState,
    registry: RegistryCache,
    /// Subscription id -> event type filter
    subscriptions: HashMap<u64, Option<String>>,
}

impl Shared {
    fn take_session(&mut self, generation: u64) -> Option<Session> {
        match &self.session {
            Some(session) if session.generation == generation => self.session.take(),
            _ => None,
        }
    }

    fn live_session(&self, generation: u64) -> Option<&Session> {
        self.session
            .as_ref()
            .filter(|session| session.generation == generation)
    }
}

struct ClientInner {
    config: HubConfig,
    connector: Arc<dyn Connector>,
    events: HubEvents,
    shared: Mutex<Shared>,
}

/// Client for the hub's WebSocket API.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<ClientInner>,
}

impl HubClient {
    /// Create a client that connects with `tokio-tungstenite`.
    pub fn new(config: HubConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Create a client with a custom transport connector.
    pub fn with_connector(config: HubConfig, connector: Arc<dyn Connector>) -> Self {
        let events = HubEvents::with_capacity(config.event_capacity);
        let shared = Shared {
            state: ConnectionState::Disconnected,
            version: None,
            generation: 0,
            explicit_close: false,
            session: None,
            correlator: Correlator::new(),
            fetch_queue: FetchQueue::new(),
            retry: RetryState::from_config(&config),
            registry: RegistryCache::new(),
            subscriptions: HashMap::new(),
        };
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                events,
                shared: Mutex::new(shared),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Subscribe to client notifications.
    pub fn events(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Hub version reported by the last successful handshake.
    pub fn version(&self) -> Option<String> {
        self.inner.shared.lock().version.clone()
    }

    /// Open the socket and authenticate. Resolves with the hub version.
    pub async fn connect(&self) -> HubResult<String> {
        self.inner.config.validate()?;
        {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                ConnectionState::Disconnected => {}
                ConnectionState::Ready => return Err(HubError::AlreadyConnected),
                other => {
                    return Err(HubError::Connection(format!(
                        "connection is already {:?}",
                        other
                    )));
                }
            }
            shared.explicit_close = false;
            // A manual connect replaces a scheduled retry.
            shared.retry.cancel();
            shared.state = ConnectionState::Connecting;
        }
        ClientInner::establish(&self.inner).await
    }

    /// Send a correlated request and wait for its `result` frame.
    ///
    /// `payload` (a JSON object or `null`) is merged into the frame next to
    /// `id` and `type`.
    pub async fn request(
        &self,
        kind: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> HubResult<JsonValue> {
        self.inner.request(kind, payload, timeout).await
    }

    /// Fetch a resource, update the local cache and emit its snapshot event.
    pub async fn fetch(&self, kind: ResourceKind) -> HubResult<JsonValue> {
        self.inner.fetch(kind).await
    }

    /// Fetch every resource kind once.
    pub async fn sync_registry(&self) -> HubResult<()> {
        for kind in ResourceKind::ALL {
            self.inner.fetch(kind).await?;
        }
        Ok(())
    }

    /// Subscribe to hub events, all of them when `event_type` is `None`.
    ///
    /// Returns the subscription id carried by matching `event` frames.
    pub async fn subscribe_events(&self, event_type: Option<&str>) -> HubResult<u64> {
        self.inner.subscribe_events(event_type).await
    }

    pub async fn unsubscribe_events(&self, subscription: u64) -> HubResult<()> {
        self.inner
            .request(
                "unsubscribe_events",
                protocol::unsubscribe_payload(subscription),
                self.inner.config.response_timeout(),
            )
            .await?;
        self.inner.shared.lock().subscriptions.remove(&subscription);
        debug!(subscription, "Unsubscribed from hub events");
        Ok(())
    }

    pub async fn call_service(&self, call: ServiceCall) -> HubResult<JsonValue> {
        debug!(domain = %call.domain, service = %call.service, "Calling service");
        self.inner
            .request(
                "call_service",
                call.payload(),
                self.inner.config.response_timeout(),
            )
            .await
    }

    /// Close the session and disarm every timer. No reconnect follows.
    pub async fn close(&self) -> HubResult<()> {
        self.inner.close().await
    }

    /// Cached current state of an entity.
    pub fn entity_state(&self, entity_id: &str) -> Option<JsonValue> {
        self.inner.shared.lock().registry.state(entity_id).cloned()
    }

    /// Device an entity belongs to, per the cached entity registry.
    pub fn device_for_entity(&self, entity_id: &str) -> Option<String> {
        self.inner
            .shared
            .lock()
            .registry
            .entity(entity_id)
            .and_then(|entry| entry.device_id.clone())
    }

    /// Hub configuration from the last `get_config` fetch.
    pub fn hub_config(&self) -> Option<JsonValue> {
        self.inner.shared.lock().registry.config().cloned()
    }

    pub fn registry_counts(&self) -> RegistryCounts {
        self.inner.shared.lock().registry.counts()
    }

    /// Requests still waiting for a result.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.lock().correlator.len()
    }

    /// Whether a reconnect attempt is scheduled or running.
    pub fn reconnect_scheduled(&self) -> bool {
        self.inner.shared.lock().retry.in_flight()
    }
}

/// Removes a pending entry however the waiting call ends.
struct PendingGuard<'a> {
    inner: &'a ClientInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.shared.lock().correlator.forget(self.id);
    }
}

impl ClientInner {
    // =========================================================================
    // Connect + handshake
    // =========================================================================

    async fn establish(self: &Arc<Self>) -> HubResult<String> {
        let result = match self.open_and_authenticate().await {
            Ok((transport, version)) => self.install(transport, version),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            let mut shared = self.shared.lock();
            if matches!(
                shared.state,
                ConnectionState::Connecting | ConnectionState::Authenticating
            ) {
                shared.state = ConnectionState::Disconnected;
            }
            if shared.explicit_close {
                debug!(error = %e, "Connect abandoned by close()");
            } else {
                error!(url = %self.config.url, error = %e, "Failed to connect to hub");
                self.events.emit(ClientEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn open_and_authenticate(&self) -> HubResult<(Transport, String)> {
        info!(url = %self.config.url, "Connecting to hub");
        let mut transport = self.connector.open(&self.config).await?;
        self.events.emit(ClientEvent::SocketOpened);

        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Connecting {
                return Err(HubError::Connection("connect aborted by close()".into()));
            }
            shared.state = ConnectionState::Authenticating;
        }

        let timeout = self.config.response_timeout();
        let version = tokio::time::timeout(
            timeout,
            auth::authenticate(&mut transport, &self.config.access_token),
        )
        .await
        .map_err(|_| HubError::Timeout {
            kind: "auth".into(),
            id: 0,
            after: timeout,
        })??;

        Ok((transport, version))
    }

    /// Switch to `Ready` and start the steady-state tasks.
    fn install(self: &Arc<Self>, transport: Transport, version: String) -> HubResult<String> {
        let Transport { sink, stream } = transport;

        let mut shared = self.shared.lock();
        if shared.state != ConnectionState::Authenticating {
            return Err(HubError::Connection("connect aborted by close()".into()));
        }

        shared.generation += 1;
        let generation = shared.generation;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pongs = PongSignal::new();

        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(Arc::downgrade(self), generation, stream));
        let keepalive = self.config.ping_interval().map(|interval| {
            let host = SessionKeepalive {
                inner: Arc::downgrade(self),
                generation,
            };
            tokio::spawn(keepalive::run(
                host,
                pongs.clone(),
                interval,
                self.config.ping_timeout(),
            ))
        });

        shared.session = Some(Session {
            generation,
            outbound,
            pongs,
            reader,
            writer,
            keepalive,
        });
        shared.state = ConnectionState::Ready;
        shared.version = Some(version.clone());
        shared.retry.reset();

        info!(version = %version, generation, "Connected to hub");
        self.events.emit(ClientEvent::Connected {
            version: version.clone(),
        });
        Ok(version)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    fn begin_request(
        &self,
        kind: &str,
    ) -> HubResult<(u64, oneshot::Receiver<Outcome>, mpsc::UnboundedSender<WireMessage>)> {
        let mut shared = self.shared.lock();
        if shared.state != ConnectionState::Ready {
            return Err(HubError::NotConnected);
        }
        let outbound = shared
            .session
            .as_ref()
            .map(|session| session.outbound.clone())
            .ok_or(HubError::SocketNotOpen)?;
        let (id, rx) = shared.correlator.register(kind);
        Ok((id, rx, outbound))
    }

    async fn finish_request(
        &self,
        kind: &str,
        id: u64,
        payload: JsonValue,
        rx: oneshot::Receiver<Outcome>,
        outbound: mpsc::UnboundedSender<WireMessage>,
        timeout: Duration,
    ) -> HubResult<JsonValue> {
        let _guard = PendingGuard { inner: self, id };

        let frame = protocol::request_frame(id, kind, payload)?;
        debug!(id, kind, "Sending request");
        outbound
            .send(WireMessage::Text(frame))
            .map_err(|_| HubError::SocketNotOpen)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot dropped: close() released every pending request.
            Ok(Err(_)) => Err(HubError::NotConnected),
            Err(_) => {
                warn!(id, kind, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(HubError::Timeout {
                    kind: kind.to_string(),
                    id,
                    after: timeout,
                })
            }
        }
    }

    async fn request(
        &self,
        kind: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> HubResult<JsonValue> {
        let (id, rx, outbound) = self.begin_request(kind)?;
        self.finish_request(kind, id, payload, rx, outbound, timeout)
            .await
    }

    async fn fetch(&self, kind: ResourceKind) -> HubResult<JsonValue> {
        let value = self
            .request(kind.command(), JsonValue::Null, self.config.response_timeout())
            .await?;
        let event = self.shared.lock().registry.apply(kind, value.clone());
        debug!(kind = %kind, "Registry snapshot refreshed");
        self.events.emit(event);
        Ok(value)
    }

    async fn subscribe_events(&self, event_type: Option<&str>) -> HubResult<u64> {
        let (id, rx, outbound) = self.begin_request("subscribe_events")?;
        // Registered before sending so events right after the result are kept.
        self.shared
            .lock()
            .subscriptions
            .insert(id, event_type.map(String::from));

        let result = self
            .finish_request(
                "subscribe_events",
                id,
                protocol::subscribe_payload(event_type),
                rx,
                outbound,
                self.config.response_timeout(),
            )
            .await;

        match result {
            Ok(_) => {
                info!(subscription = id, event_type = ?event_type, "Subscribed to hub events");
                self.events.emit(ClientEvent::Subscribed { subscription: id });
                Ok(id)
            }
            Err(e) => {
                self.shared.lock().subscriptions.remove(&id);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Inbound frames
    // =========================================================================

    fn handle_text(self: &Arc<Self>, generation: u64, text: &str) {
        let frames = match protocol::decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };
        for frame in frames {
            self.handle_frame(generation, frame);
        }
    }

    fn handle_frame(self: &Arc<Self>, generation: u64, frame: InboundFrame) {
        match frame {
            InboundFrame::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result)
                } else {
                    let (code, message) = error
                        .map(|e| (e.code_string(), e.message))
                        .unwrap_or_else(|| ("unknown_error".into(), "request failed".into()));
                    Err(HubError::remote(code, message))
                };
                if !self.shared.lock().correlator.resolve(id, outcome) {
                    debug!(id, "Dropping result for unknown or expired request");
                }
            }
            InboundFrame::Pong { id } => {
                trace!(id = ?id, "Pong frame");
                self.handle_pong(generation);
            }
            InboundFrame::Event { id, event } => self.handle_event(id, event),
            InboundFrame::AuthRequired { .. }
            | InboundFrame::AuthOk { .. }
            | InboundFrame::AuthInvalid { .. } => {
                warn!("Dropping auth frame received after handshake");
            }
            InboundFrame::Unknown => debug!("Dropping frame of unknown type"),
        }
    }

    fn handle_pong(&self, generation: u64) {
        let shared = self.shared.lock();
        if let Some(session) = shared.live_session(generation) {
            session.pongs.pong();
            self.events.emit(ClientEvent::Pong);
        }
    }

    fn handle_event(self: &Arc<Self>, subscription: u64, event: HubEvent) {
        let mut shared = self.shared.lock();
        if !shared.subscriptions.contains_key(&subscription) {
            debug!(subscription, event_type = %event.event_type, "Event for unknown subscription");
            return;
        }

        match dispatcher::dispatch(&mut shared.registry, &event) {
            Dispatch::Emit(client_event) => {
                self.events.emit(client_event);
            }
            Dispatch::Invalidate(kind) => self.enqueue_fetch(&mut shared, kind),
            Dispatch::Drop => {}
        }
    }

    // =========================================================================
    // Fetch debouncing
    // =========================================================================

    fn enqueue_fetch(self: &Arc<Self>, shared: &mut Shared, kind: ResourceKind) {
        if !shared.fetch_queue.enqueue(kind) {
            trace!(kind = %kind, "Fetch already queued");
            return;
        }

        let window = self.config.fetch_debounce();
        let inner = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = inner.upgrade() {
                inner.flush_fetch_queue().await;
            }
        });
        shared.fetch_queue.set_timer(timer);
        debug!(kind = %kind, window_ms = window.as_millis() as u64, "Fetch debounce armed");
    }

    async fn flush_fetch_queue(&self) {
        let kinds = self.shared.lock().fetch_queue.drain();
        debug!(kinds = ?kinds, "Fetching invalidated resources");

        for kind in kinds {
            if self.state() != ConnectionState::Ready {
                debug!(kind = %kind, "Connection down, skipping debounced fetches");
                return;
            }
            if let Err(e) = self.fetch(kind).await {
                if self.state() != ConnectionState::Ready {
                    debug!(kind = %kind, error = %e, "Debounced fetch ended with the connection");
                    return;
                }
                warn!(kind = %kind, error = %e, "Debounced fetch failed");
                self.events.emit(ClientEvent::Error {
                    message: format!("failed to refresh {}: {}", kind, e),
                });
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    // =========================================================================
    // Keepalive
    // =========================================================================

    fn send_ping(&self, generation: u64) -> bool {
        let mut shared = self.shared.lock();
        if shared.state != ConnectionState::Ready {
            return false;
        }
        let id = shared.correlator.next_id();
        let Some(session) = shared.live_session(generation) else {
            return false;
        };

        let sent = session.outbound.send(WireMessage::Ping(Vec::new())).is_ok()
            && session
                .outbound
                .send(WireMessage::Text(protocol::ping_frame(id)))
                .is_ok();
        if sent {
            trace!(id, "Ping");
            self.events.emit(ClientEvent::Ping);
        }
        sent
    }

    // =========================================================================
    // Close + reconnect
    // =========================================================================

    fn connection_lost(self: &Arc<Self>, generation: u64, loss: Loss) {
        let mut shared = self.shared.lock();
        let Some(session) = shared.take_session(generation) else {
            return;
        };

        let forced = matches!(loss, Loss::WatchdogExpired);
        let (close, reason) = match loss {
            Loss::Closed(info) => {
                let reason = match &info {
                    Some(info) => format!("socket closed ({}): {}", info.code, info.reason),
                    None => "socket closed".to_string(),
                };
                (info, reason)
            }
            Loss::Failed(message) => {
                self.events.emit(ClientEvent::Error {
                    message: message.clone(),
                });
                (None, format!("socket error: {}", message))
            }
            Loss::WatchdogExpired => (
                Some(CloseInfo {
                    code: NORMAL_CLOSURE,
                    reason: "keepalive timeout".into(),
                }),
                "keepalive timeout".to_string(),
            ),
        };

        // Close frame only when the client forces the close.
        let close_frame = if forced { close.clone() } else { None };
        drop(session.release(close_frame));
        // A successful reconnect refetches everything.
        shared.fetch_queue.cancel();

        if shared.explicit_close {
            return;
        }

        // Pending requests are left to their own timeouts.
        shared.state = ConnectionState::Disconnected;
        warn!(reason = %reason, pending = shared.correlator.len(), "Connection to hub lost");
        self.events.emit(ClientEvent::SocketClosed {
            code: close.as_ref().map(|c| c.code),
            reason: close.map(|c| c.reason).unwrap_or_default(),
        });
        self.events.emit(ClientEvent::Disconnected { reason });

        self.schedule_reconnect(&mut shared);
    }

    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared) {
        if shared.retry.in_flight() {
            debug!("Reconnect already scheduled");
            return;
        }

        match shared.retry.next() {
            RetryDecision::Retry { attempt, delay } => {
                info!(
                    attempt,
                    max_retries = self.config.max_retries,
                    delay_secs = delay.as_secs(),
                    "Scheduling reconnect"
                );
                let inner = Arc::downgrade(self);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = inner.upgrade() {
                        inner.reconnect(attempt).await;
                    }
                });
                shared.retry.set_scheduled(task);
            }
            RetryDecision::Disabled => {
                warn!("Auto-reconnect is disabled, connection stays down");
                self.events.emit(ClientEvent::Fatal {
                    message: "connection lost and auto-reconnect is disabled".into(),
                });
            }
            RetryDecision::Exhausted { attempts } => {
                let err = HubError::FatalReconnectExhausted { attempts };
                error!(attempts, "Giving up on reconnecting to hub");
                self.events.emit(ClientEvent::Error {
                    message: err.to_string(),
                });
                self.events.emit(ClientEvent::Fatal {
                    message: err.to_string(),
                });
            }
        }
    }

    async fn reconnect(self: &Arc<Self>, attempt: u32) {
        {
            let mut shared = self.shared.lock();
            if shared.explicit_close || shared.state != ConnectionState::Disconnected {
                shared.retry.finish();
                return;
            }
            shared.state = ConnectionState::Connecting;
        }

        info!(attempt, "Reconnecting to hub");
        let result = self.establish().await;

        let resubscribe = {
            let mut shared = self.shared.lock();
            shared.retry.finish();
            match result {
                // The new session may already be gone; its loss found this
                // retry still in flight and scheduled nothing.
                Ok(_) if shared.state != ConnectionState::Ready => {
                    warn!(attempt, "Connection lost right after reconnecting");
                    if !shared.explicit_close {
                        self.schedule_reconnect(&mut shared);
                    }
                    Vec::new()
                }
                Ok(_) => {
                    for kind in ResourceKind::ALL {
                        self.enqueue_fetch(&mut shared, kind);
                    }
                    let mut subscriptions = shared
                        .subscriptions
                        .iter()
                        .map(|(id, event_type)| (*id, event_type.clone()))
                        .collect::<Vec<_>>();
                    subscriptions.sort_by_key(|(id, _)| *id);
                    subscriptions
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    if !shared.explicit_close {
                        self.schedule_reconnect(&mut shared);
                    }
                    Vec::new()
                }
            }
        };

        // An old id is dropped only once its replacement is confirmed, so a
        // session lost mid-restore leaves it for the next reconnect.
        for (old_id, event_type) in resubscribe {
            if !self.shared.lock().subscriptions.contains_key(&old_id) {
                continue;
            }
            match self.subscribe_events(event_type.as_deref()).await {
                Ok(new_id) => {
                    self.shared.lock().subscriptions.remove(&old_id);
                    debug!(old_id, new_id, "Subscription restored");
                }
                Err(e) => {
                    warn!(event_type = ?event_type, error = %e, "Failed to restore subscription");
                }
            }
        }
    }

    async fn close(&self) -> HubResult<()> {
        let (writer, had_session, was_connected) = {
            let mut shared = self.shared.lock();
            shared.explicit_close = true;
            // A lost session already announced its `disconnected`.
            let was_connected =
                shared.state == ConnectionState::Ready || shared.session.is_some();
            let in_progress = shared.state != ConnectionState::Disconnected;

            // Keepalive (and its watchdog), debounce timer, scheduled retry, then the socket.
            if let Some(session) = shared.session.as_mut() {
                session.stop_keepalive();
            }
            shared.fetch_queue.cancel();
            shared.retry.cancel();

            let writer = shared.session.take().map(|session| {
                session.release(Some(CloseInfo {
                    code: NORMAL_CLOSURE,
                    reason: "client closed".into(),
                }))
            });
            let released = shared.correlator.fail_all();
            if released > 0 {
                debug!(released, "Released pending requests on close");
            }
            if in_progress {
                shared.state = ConnectionState::Closing;
            }
            let had_session = writer.is_some();
            (writer, had_session, was_connected)
        };

        if let Some(writer) = writer {
            if tokio::time::timeout(self.config.response_timeout(), writer)
                .await
                .is_err()
            {
                warn!("Timed out flushing close frame");
            }
        }

        let mut shared = self.shared.lock();
        shared.state = ConnectionState::Disconnected;
        shared.version = None;
        if had_session {
            self.events.emit(ClientEvent::SocketClosed {
                code: Some(NORMAL_CLOSURE),
                reason: "client closed".into(),
            });
        }
        if was_connected {
            info!("Hub connection closed");
            self.events.emit(ClientEvent::Disconnected {
                reason: "closed by client".into(),
            });
        }
        Ok(())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        shared.fetch_queue.cancel();
        shared.retry.cancel();
        if let Some(session) = shared.session.take() {
            session.release(None).abort();
        }
    }
}

/// Keepalive host bound to one session generation.
struct SessionKeepalive {
    inner: Weak<ClientInner>,
    generation: u64,
}

impl KeepaliveHost for SessionKeepalive {
    fn send_ping(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.send_ping(self.generation),
            None => false,
        }
    }

    fn watchdog_expired(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connection_lost(self.generation, Loss::WatchdogExpired);
        }
    }
}

/// Single owner of the send half.
async fn write_loop(mut sink: FrameSink, mut outbound: mpsc::UnboundedReceiver<WireMessage>) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, WireMessage::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "Write failed, writer stopping");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Processes inbound frames one at a time, in arrival order.
async fn read_loop(inner: Weak<ClientInner>, generation: u64, mut stream: FrameStream) {
    let loss = loop {
        let Some(msg) = stream.next().await else {
            break Loss::Closed(None);
        };
        let Some(client) = inner.upgrade() else {
            return;
        };
        match msg {
            Ok(WireMessage::Text(text)) => client.handle_text(generation, &text),
            Ok(WireMessage::Pong(_)) => client.handle_pong(generation),
            // tungstenite answers transport pings itself
            Ok(WireMessage::Ping(_)) => trace!("Transport ping"),
            Ok(WireMessage::Close(info)) => break Loss::Closed(info),
            Err(e) => break Loss::Failed(e.to_string()),
        }
    };

    if let Some(client) = inner.upgrade() {
        client.connection_lost(generation, loss);
    }
}
