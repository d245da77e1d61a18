//! CarData Stream Manager
//!
//! Owns the MQTT session to the CarData streaming broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     StreamManager                        │
//! │                                                          │
//! │  start() ──► connect_once ──► CONNACK ──► subscribe      │
//! │                                   │                      │
//! │                                   ▼                      │
//! │                         network task (Link::next)        │
//! │                           │                 │            │
//! │                    publish│                 │link lost   │
//! │                           ▼                 ▼            │
//! │                  ┌──────────────┐   reconnect loop       │
//! │                  │  dispatcher  │   (backoff, cancel)    │
//! │                  └──────────────┘                        │
//! │                   message/status/error callbacks         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The network task never awaits a consumer: decoded messages and state
//! changes go through an unbounded channel to a single dispatcher task that
//! awaits each callback in arrival order.
//!
//! Session changes (`start`, `stop`, credential restarts and each reconnect
//! attempt) are serialized, so at most one session is ever live.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rumqttc::{ClientError, ConnectReturnCode, ConnectionError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::auth::{Credentials, describe};
use super::connection::{ConnectionTracker, FollowUp, Transition};
use super::messages::StreamMessage;
use super::reconnect::{BackoffConfig, ReconnectError, ReconnectPolicy};
use super::transport::{Connector, Handshake, Link, LinkEvent, MqttConnector, SessionParams};
use crate::domain::connection::{ConnectionState, StreamNotice};
use crate::infrastructure::metrics::{self, DropReason};

/// Production streaming endpoint.
pub const DEFAULT_STREAM_HOST: &str = "customer.streaming-cardata.bmwgroup.com";

/// Production streaming port.
pub const DEFAULT_STREAM_PORT: u16 = 9000;

// =============================================================================
// Callbacks
// =============================================================================

/// Receives `(vin, data)` for every decoded message.
pub type MessageCallback = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives every connection state transition with an optional reason.
pub type StatusCallback =
    Arc<dyn Fn(ConnectionState, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives the one-shot unauthorized/recovered notices.
pub type ErrorCallback = Arc<dyn Fn(StreamNotice) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    message: Option<MessageCallback>,
    status: Option<StatusCallback>,
    error: Option<ErrorCallback>,
}

enum Dispatch {
    Message { vin: String, data: Value },
    Status(ConnectionState, Option<String>),
    Notice(StreamNotice),
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    callbacks: Arc<RwLock<Callbacks>>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Message { vin, data } => {
                let callback = callbacks.read().message.clone();
                if let Some(callback) = callback {
                    callback(vin, data).await;
                }
            }
            Dispatch::Status(state, reason) => {
                let callback = callbacks.read().status.clone();
                if let Some(callback) = callback {
                    callback(state, reason).await;
                }
            }
            Dispatch::Notice(notice) => {
                let callback = callbacks.read().error.clone();
                if let Some(callback) = callback {
                    callback(notice).await;
                }
            }
        }
    }
    tracing::debug!("Stream dispatcher stopped");
}

// =============================================================================
// Configuration & Errors
// =============================================================================

/// Stream manager configuration.
#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT keepalive interval.
    pub keepalive: Duration,
    /// Upper bound for the wait on CONNACK.
    pub connect_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Log raw payloads at debug level.
    pub debug_log: bool,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_STREAM_HOST.to_string(),
            port: DEFAULT_STREAM_PORT,
            keepalive: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            debug_log: false,
        }
    }
}

/// Stream manager errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// `start()` called while the stream is enabled.
    #[error("stream is already running")]
    AlreadyRunning,

    /// Broker rejected the credentials.
    #[error("broker rejected credentials: {}", describe(*.0))]
    Unauthorized(ConnectReturnCode),

    /// Broker refused the connection for another reason.
    #[error("broker refused connection: {}", describe(*.0))]
    Refused(ConnectReturnCode),

    /// Transport failure (DNS, TCP, TLS, protocol).
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// No CONNACK within the connect timeout.
    #[error("no CONNACK within {0:?}")]
    ConnectTimeout(Duration),

    /// Request could not be queued on the client.
    #[error("MQTT client request failed: {0}")]
    Client(#[from] ClientError),
}

/// Outcome of [`StreamManager::update_credentials`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialUpdate {
    /// Same values as before; nothing happened.
    Unchanged,
    /// Values swapped; the stream is not enabled so no connect was made.
    Updated,
    /// Values swapped and the session was restarted.
    Restarted,
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Session {
    /// Stop the network task and wait for its link to close.
    async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "Stream network task panicked");
        }
    }
}

// =============================================================================
// Stream Manager
// =============================================================================

/// Single authenticated MQTT subscription for one CarData account.
pub struct StreamManager {
    config: StreamManagerConfig,
    connector: Arc<dyn Connector>,
    lifecycle: tokio::sync::Mutex<()>,
    credentials: Mutex<Credentials>,
    tracker: Mutex<ConnectionTracker>,
    policy: Mutex<ReconnectPolicy>,
    session: Mutex<Option<Session>>,
    reconnect_cancel: Mutex<CancellationToken>,
    reconnect_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    enabled: AtomicBool,
    callbacks: Arc<RwLock<Callbacks>>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    cancel: CancellationToken,
}

impl StreamManager {
    /// Create a stream manager over MQTT/TLS and spawn its callback
    /// dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        config: StreamManagerConfig,
        credentials: Credentials,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Self::with_connector(config, credentials, cancel, Arc::new(MqttConnector))
    }

    /// [`Self::new`] with a custom broker transport.
    #[must_use]
    pub fn with_connector(
        config: StreamManagerConfig,
        credentials: Credentials,
        cancel: CancellationToken,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let callbacks = Arc::new(RwLock::new(Callbacks::default()));
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(dispatch_rx, Arc::clone(&callbacks)));

        let policy = ReconnectPolicy::new(config.backoff.clone());
        Arc::new(Self {
            config,
            connector,
            lifecycle: tokio::sync::Mutex::new(()),
            credentials: Mutex::new(credentials),
            tracker: Mutex::new(ConnectionTracker::new()),
            policy: Mutex::new(policy),
            session: Mutex::new(None),
            reconnect_cancel: Mutex::new(cancel.child_token()),
            reconnect_task: Mutex::new(None),
            enabled: AtomicBool::new(false),
            callbacks,
            dispatch_tx,
            cancel,
        })
    }

    /// Register the consumer of decoded messages.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.write().message = Some(callback);
    }

    /// Register the consumer of state transitions.
    pub fn set_status_callback(&self, callback: StatusCallback) {
        self.callbacks.write().status = Some(callback);
    }

    /// Register the consumer of unauthorized/recovered notices.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.write().error = Some(callback);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.tracker.lock().state()
    }

    /// Whether the stream is enabled (started and not stopped).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current account identifier.
    #[must_use]
    pub fn gcid(&self) -> String {
        self.credentials.lock().gcid().to_string()
    }

    /// Connect, wait for CONNACK, and subscribe.
    ///
    /// Only this first attempt reports failure to the caller; later link
    /// losses are retried in the background.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AlreadyRunning`] if already started, or the
    /// failure of the initial connect.
    pub async fn start(self: &Arc<Self>) -> Result<(), StreamError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyRunning);
        }
        self.arm_reconnect();
        self.policy.lock().reset();

        if let Err(e) = self.connect_once().await {
            self.enabled.store(false, Ordering::SeqCst);
            self.teardown().await;
            return Err(e);
        }
        Ok(())
    }

    /// Tear down the session and cancel any pending reconnect.
    ///
    /// Safe to call when already stopped.
    pub async fn stop(&self) {
        let was_enabled = self.enabled.swap(false, Ordering::SeqCst);
        self.reconnect_cancel.lock().cancel();
        let _lifecycle = self.lifecycle.lock().await;
        let had_session = self.teardown().await;
        if was_enabled || had_session {
            let transition = self.tracker.lock().on_stopped();
            self.apply(transition);
            tracing::info!("CarData stream stopped");
        }
    }

    /// Stop and cancel the manager's root token.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.cancel.cancel();
    }

    /// Swap the GCID and/or ID token. Empty or absent values keep the
    /// current one.
    ///
    /// A change while the stream is enabled restarts the session with a
    /// reset backoff, including after an unauthorized stop.
    ///
    /// # Errors
    ///
    /// Returns the failure of the restart's connect attempt. Transient
    /// failures are also retried in the background.
    pub async fn update_credentials(
        self: &Arc<Self>,
        gcid: Option<&str>,
        id_token: Option<&str>,
    ) -> Result<CredentialUpdate, StreamError> {
        let _lifecycle = self.lifecycle.lock().await;
        let merged = self.credentials.lock().merged(gcid, id_token);
        let Some(credentials) = merged else {
            tracing::debug!("Credential update without changes");
            return Ok(CredentialUpdate::Unchanged);
        };

        tracing::info!(credentials = %credentials, "Stream credentials updated");
        *self.credentials.lock() = credentials;
        self.policy.lock().reset();

        if !self.is_running() {
            return Ok(CredentialUpdate::Updated);
        }

        self.arm_reconnect();
        self.teardown().await;
        match self.connect_once().await {
            Ok(()) => Ok(CredentialUpdate::Restarted),
            Err(e @ StreamError::Unauthorized(_)) => Err(e),
            Err(e) => {
                self.spawn_reconnect();
                Err(e)
            }
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    fn session_params(&self) -> SessionParams {
        SessionParams {
            host: self.config.host.clone(),
            port: self.config.port,
            keepalive: self.config.keepalive,
            credentials: self.credentials.lock().clone(),
        }
    }

    /// One connect attempt. Callers hold the lifecycle lock.
    async fn connect_once(self: &Arc<Self>) -> Result<(), StreamError> {
        let transition = self.tracker.lock().on_connecting();
        self.apply(transition);

        let params = self.session_params();
        let topic = params.credentials.topic();
        tracing::info!(
            host = %params.host,
            port = params.port,
            topic = %topic,
            "Connecting to CarData stream"
        );

        let handshake = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&params),
        )
        .await
        {
            Err(_) => {
                let transition = self.tracker.lock().on_connect_failed("connect timeout");
                self.apply(transition);
                return Err(StreamError::ConnectTimeout(self.config.connect_timeout));
            }
            Ok(Err(e)) => {
                let transition = self.tracker.lock().on_connect_failed(e.to_string());
                self.apply(transition);
                return Err(e);
            }
            Ok(Ok(handshake)) => handshake,
        };

        let (code, link) = match handshake {
            Handshake::Accepted(link) => (ConnectReturnCode::Success, Some(link)),
            Handshake::Refused(code) => (code, None),
        };
        let transition = self.tracker.lock().on_connack(code);
        let follow_up = transition.follow_up;
        self.apply(transition);
        let link = match (follow_up, link) {
            (FollowUp::Stop, _) => return Err(StreamError::Unauthorized(code)),
            (FollowUp::None, Some(link)) => link,
            _ => return Err(StreamError::Refused(code)),
        };

        self.policy.lock().reset();
        tracing::info!(topic = %topic, "Subscribed to CarData stream");

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(Arc::clone(self).drive(link, cancel.clone()));
        let displaced = self.session.lock().replace(Session { cancel, handle });
        if let Some(displaced) = displaced {
            tracing::warn!("Closing displaced CarData session");
            displaced.close().await;
        }
        Ok(())
    }

    /// Read the link until cancelled or it drops.
    async fn drive(self: Arc<Self>, mut link: Box<dyn Link>, cancel: CancellationToken) {
        let reason = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    link.close().await;
                    return;
                }
                event = link.next() => match event {
                    LinkEvent::Publish(payload) => self.on_publish(&payload),
                    LinkEvent::Lost(reason) => break reason,
                },
            }
        };

        if cancel.is_cancelled() {
            return;
        }
        tracing::warn!(reason = %reason, "CarData stream connection lost");
        let transition = self.tracker.lock().on_disconnected(reason);
        let follow_up = transition.follow_up;
        self.apply(transition);
        if follow_up == FollowUp::Reconnect {
            self.spawn_reconnect();
        }
    }

    fn on_publish(&self, payload: &[u8]) {
        metrics::record_message_received();
        if self.config.debug_log {
            tracing::debug!(payload = %String::from_utf8_lossy(payload), "Stream payload");
        }

        let message = match StreamMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                metrics::record_message_dropped(DropReason::Malformed);
                tracing::debug!(error = %e, "Dropping undecodable stream message");
                return;
            }
        };

        if message.vin.is_empty() || !message.data.is_object() {
            metrics::record_message_dropped(DropReason::Incomplete);
            tracing::debug!("Dropping stream message without vin or data");
            return;
        }

        self.emit(Dispatch::Message {
            vin: message.vin,
            data: message.data,
        });
    }

    /// Start the reconnect loop unless one is already pending for the
    /// current reconnect token.
    fn spawn_reconnect(self: &Arc<Self>) {
        let token = self.reconnect_cancel.lock().clone();
        if token.is_cancelled() {
            return;
        }
        let mut task = self.reconnect_task.lock();
        if let Some((owner, handle)) = task.as_ref()
            && !owner.is_cancelled()
            && !handle.is_finished()
        {
            return;
        }
        let handle = tokio::spawn(Arc::clone(self).reconnect_loop(token.clone()));
        *task = Some((token, handle));
    }

    async fn reconnect_loop(self: Arc<Self>, cancel: CancellationToken) {
        while self.is_running() && !cancel.is_cancelled() {
            let delay = self.policy.lock().next_delay();
            let Some(delay) = delay else {
                let attempts = self.policy.lock().attempt_count();
                tracing::error!(
                    error = %ReconnectError::AttemptsExhausted(attempts),
                    "Stopping CarData stream"
                );
                let _lifecycle = self.lifecycle.lock().await;
                self.enabled.store(false, Ordering::SeqCst);
                self.teardown().await;
                break;
            };

            tracing::info!(
                delay_ms = delay.as_millis(),
                attempt = self.policy.lock().attempt_count(),
                "Reconnecting to CarData stream"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Reconnect cancelled during backoff");
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }

            let _lifecycle = self.lifecycle.lock().await;
            if cancel.is_cancelled() || !self.is_running() {
                tracing::debug!("Reconnect superseded while waiting for the session lock");
                break;
            }
            metrics::record_reconnect();
            self.teardown().await;
            match self.connect_once().await {
                Ok(()) => {
                    if cancel.is_cancelled() || !self.is_running() {
                        self.teardown().await;
                    }
                    break;
                }
                Err(e @ StreamError::Unauthorized(_)) => {
                    tracing::warn!(error = %e, "Waiting for new credentials");
                    self.teardown().await;
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "Reconnect attempt failed"),
            }
        }
    }

    /// Cancel any pending reconnect and issue a fresh token for the next one.
    fn arm_reconnect(&self) {
        let mut token = self.reconnect_cancel.lock();
        token.cancel();
        *token = self.cancel.child_token();
    }

    /// Cancel pending reconnects and close the live session.
    ///
    /// Returns whether a session existed.
    async fn teardown(&self) -> bool {
        if !self.is_running() {
            self.reconnect_cancel.lock().cancel();
        }

        let session = self.session.lock().take();
        let Some(session) = session else {
            return false;
        };
        session.close().await;
        true
    }

    fn apply(&self, transition: Transition) {
        metrics::set_connection_state(transition.state);
        match transition.state {
            ConnectionState::Connected | ConnectionState::Recovered => {
                tracing::info!(state = %transition.state, "CarData stream connected");
            }
            ConnectionState::Connecting => {
                tracing::debug!(state = %transition.state, "CarData stream connecting");
            }
            _ => tracing::warn!(
                state = %transition.state,
                reason = transition.reason.as_deref().unwrap_or(""),
                "CarData stream state changed"
            ),
        }

        self.emit(Dispatch::Status(transition.state, transition.reason));
        if let Some(notice) = transition.notice {
            tracing::warn!(notice = notice.reason(), "CarData stream notice");
            self.emit(Dispatch::Notice(notice));
        }
    }

    fn emit(&self, item: Dispatch) {
        if self.dispatch_tx.send(item).is_err() {
            tracing::debug!("Stream dispatcher is gone; dropping callback");
        }
    }
}
