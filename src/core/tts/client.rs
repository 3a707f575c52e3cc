//! Multi-context client facade.
//!
//! [`MultiContextClient`] owns the shared connection and the context
//! registry. It turns every inbound text frame into a normalized message and
//! routes it to the owning context; frames it cannot place are logged and
//! dropped so the pump never stops on bad input.
//!
//! ```rust,no_run
//! use tts_multiplex::config::{ClientConfig, ConnectParams};
//! use tts_multiplex::core::tts::{ContextCallbacks, MultiContextClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MultiContextClient::new(ClientConfig::from_env()?);
//! client
//!     .connect(ConnectParams::new().with_model_id("flash_v2_5").with_format("pcm_16000"))
//!     .await?;
//!
//! let ctx = client.create_context("greeting")?;
//! ctx.register_callbacks(ContextCallbacks::new().with_complete(|| {
//!     Box::pin(async { println!("done") })
//! }));
//! ctx.send_text("Hello there!", true)?;
//! ctx.end_input()?;
//!
//! // ... wait for completion ...
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::base::{
    CONNECTION_LOST_CODE, ConnectedCallback, ConnectionState, DisconnectedCallback,
    GlobalErrorCallback, TTSError, TTSResult,
};
use super::connection::{
    CloseReason, InboundHandler, OutboundSender, build_connection_url, open, spawn_pump,
};
use super::context::{RoutedMessage, TTSContext};
use super::messages::InboundMessage;
use super::registry::ContextRegistry;
use crate::config::{ClientConfig, ConnectParams, TransportErrorPolicy};

/// Upper bound on waiting for the pump to flush and close during `disconnect()`
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct ConnectionObservers {
    on_connected: Option<ConnectedCallback>,
    on_disconnected: Option<DisconnectedCallback>,
    on_global_error: Option<GlobalErrorCallback>,
}

struct ClientInner {
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    registry: Arc<ContextRegistry>,
    /// Serializes connect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    outbound: Mutex<Option<OutboundSender>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    observers: RwLock<ConnectionObservers>,
}

/// Client multiplexing up to five TTS contexts over one WebSocket
#[derive(Clone)]
pub struct MultiContextClient {
    inner: Arc<ClientInner>,
}

impl MultiContextClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                registry: Arc::new(ContextRegistry::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                outbound: Mutex::new(None),
                pump: Mutex::new(None),
                observers: RwLock::new(ConnectionObservers::default()),
            }),
        }
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open the shared connection.
    ///
    /// `params` are merged over the configured defaults and sent on the query
    /// string. Returns once the connection is usable or has failed.
    ///
    /// # Errors
    /// * `AlreadyConnected` - a connection is already open
    /// * `InvalidConfiguration` - the configuration failed validation
    /// * `ConnectTimeout` - the handshake did not finish in time
    /// * `ConnectFailed` - the service rejected or could not be reached
    pub async fn connect(&self, params: ConnectParams) -> TTSResult<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if matches!(
            *inner.state.read(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Err(TTSError::AlreadyConnected);
        }

        inner.config.validate()?;
        let params = params.merged_over(&inner.config.default_params);
        let url = build_connection_url(&inner.config, &params)?;

        *inner.state.write() = ConnectionState::Connecting;
        inner.close_leftover_contexts();

        let ws_stream = match open(&url, &inner.config.api_key, inner.config.connect_timeout())
            .await
        {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                error!("Failed to connect to TTS service: {}", e);
                *inner.state.write() = ConnectionState::Error(e.to_string());
                return Err(e);
            }
        };

        let (outbound, commands) = OutboundSender::channel();
        {
            // Same lock the teardown of a lost connection takes
            let mut current = inner.outbound.lock();
            inner.registry.attach(outbound.clone());
            *current = Some(outbound.clone());
            *inner.state.write() = ConnectionState::Connected;
        }

        let handler = Arc::new(ClientInboundHandler {
            client: Arc::downgrade(&self.inner),
            outbound,
        });
        let pump = spawn_pump(ws_stream, commands, handler);
        if let Some(previous) = inner.pump.lock().replace(pump) {
            previous.abort();
        }

        info!(
            "Connected to multi-context TTS service (voice: {})",
            inner.config.voice_id
        );

        let on_connected = inner.observers.read().on_connected.clone();
        if let Some(callback) = on_connected {
            callback().await;
        }

        Ok(())
    }

    /// Create a new context on the connection.
    ///
    /// # Errors
    /// * `NotConnected` - no live connection
    /// * `CapacityExceeded` - five contexts are already live
    /// * `DuplicateContext` - the id is already in use
    pub fn create_context(&self, context_id: &str) -> TTSResult<TTSContext> {
        self.inner.registry.create(context_id)
    }

    pub fn get_context(&self, context_id: &str) -> Option<TTSContext> {
        self.inner.registry.get(context_id)
    }

    /// Close every live context, then the connection.
    ///
    /// Close frames for the contexts are written before the socket closes.
    /// Calling this again, or without a connection, is a no-op.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        // Detach first so no context can be created behind the snapshot
        let outbound = {
            let mut current = inner.outbound.lock();
            inner.registry.detach();
            *inner.state.write() = ConnectionState::Disconnected;
            current.take()
        };

        let contexts = inner.registry.contexts();
        if !contexts.is_empty() {
            info!("Closing {} active contexts", contexts.len());
        }
        for context in contexts {
            if let Err(e) = context.close() {
                debug!("Context {} close: {}", context.context_id(), e);
            }
        }
        inner.registry.clear();

        let pump = inner.pump.lock().take();

        if let Some(outbound) = outbound {
            outbound.shutdown();
        }

        if let Some(mut pump) = pump {
            if timeout(DISCONNECT_TIMEOUT, &mut pump).await.is_err() {
                warn!(
                    "TTS WebSocket pump did not stop within {:?}, aborting",
                    DISCONNECT_TIMEOUT
                );
                pump.abort();
            }
        }

        info!("Disconnected from multi-context TTS service");
    }

    pub fn active_context_count(&self) -> usize {
        self.inner.registry.active_count()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.state.read(), ConnectionState::Connected)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.read().clone()
    }

    /// Inbound records dropped because no live context matched their id
    pub fn dropped_messages(&self) -> u64 {
        self.inner.registry.dropped_messages()
    }

    /// Called after every successful `connect()`
    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.inner.observers.write().on_connected = Some(Arc::new(callback));
    }

    /// Called whenever the connection ends, requested or not
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.inner.observers.write().on_disconnected = Some(Arc::new(callback));
    }

    /// Called for service errors without a context id and for transport failures
    pub fn on_global_error<F>(&self, callback: F)
    where
        F: Fn(TTSError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.inner.observers.write().on_global_error = Some(Arc::new(callback));
    }
}

impl std::fmt::Debug for MultiContextClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiContextClient")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.read())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl ClientInner {
    /// Triage one inbound text frame
    fn handle_inbound(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to parse inbound message: {}", e);
                return;
            }
        };

        match message {
            InboundMessage::Error(record) => match record.context_id {
                Some(context_id) => {
                    debug!(
                        "Service error for context {}: {} - {}",
                        context_id, record.error_code, record.message
                    );
                    self.registry.route(
                        &context_id,
                        RoutedMessage::ServiceError {
                            code: record.error_code,
                            message: record.message,
                        },
                    );
                }
                None => {
                    error!(
                        "Connection-scoped service error: {} - {}",
                        record.error_code, record.message
                    );
                    self.spawn_global_error(TTSError::ServiceError {
                        code: record.error_code,
                        message: record.message,
                    });
                }
            },
            InboundMessage::Audio(record) => {
                self.registry.route(
                    &record.context_id,
                    RoutedMessage::Audio {
                        payload: record.audio,
                        is_final: record.is_final,
                    },
                );
            }
            InboundMessage::Unrecognized => {
                debug!("Ignoring unrecognized inbound message");
            }
        }
    }

    /// Deliver a global error without blocking the pump
    fn spawn_global_error(&self, error: TTSError) {
        let on_global_error = self.observers.read().on_global_error.clone();
        if let Some(callback) = on_global_error {
            tokio::spawn(callback(error));
        }
    }

    /// Tear down after the pump owning `own` stopped.
    ///
    /// Only the connection still current is torn down; a pump outliving a
    /// newer `connect()` or a `disconnect()` leaves the client state alone.
    async fn handle_closed(&self, reason: CloseReason, own: &OutboundSender) {
        let (state, message, failure) = match reason {
            CloseReason::Requested => {
                self.notify_disconnected().await;
                return;
            }
            CloseReason::ClosedByServer(detail) => {
                info!("TTS connection closed by server");
                let message = match detail.filter(|d| !d.is_empty()) {
                    Some(detail) => format!("Connection closed by server: {detail}"),
                    None => "Connection closed by server".to_string(),
                };
                (ConnectionState::Disconnected, message, None)
            }
            CloseReason::Failed(e) => {
                error!("TTS connection lost: {}", e);
                (ConnectionState::Error(e.to_string()), e.to_string(), Some(e))
            }
        };

        // Detach and snapshot before any observer can reconnect
        let contexts = {
            let mut current = self.outbound.lock();
            if !current.as_ref().is_some_and(|o| o.same_channel(own)) {
                debug!("Ignoring close of a superseded TTS connection");
                return;
            }
            current.take();
            // The finished pump must not be aborted by a reconnect
            drop(self.pump.lock().take());
            self.registry.detach();
            *self.state.write() = state;
            self.registry.contexts()
        };

        if let Some(e) = failure {
            let on_global_error = self.observers.read().on_global_error.clone();
            if let Some(callback) = on_global_error {
                callback(e).await;
            }
        }

        self.apply_transport_error_policy(contexts, message);
        self.notify_disconnected().await;
    }

    async fn notify_disconnected(&self) {
        let on_disconnected = self.observers.read().on_disconnected.clone();
        if let Some(callback) = on_disconnected {
            callback().await;
        }
    }

    /// Apply the configured policy to the contexts of a lost connection
    fn apply_transport_error_policy(&self, contexts: Vec<TTSContext>, message: String) {
        if contexts.is_empty() {
            return;
        }

        match self.config.transport_error_policy {
            TransportErrorPolicy::LeaveOpen => {
                warn!(
                    "{} contexts left open after connection loss",
                    contexts.len()
                );
            }
            TransportErrorPolicy::CloseContexts => {
                info!(
                    "Closing {} contexts after connection loss",
                    contexts.len()
                );
                for context in contexts {
                    let lost = RoutedMessage::ConnectionLost(TTSError::ServiceError {
                        code: CONNECTION_LOST_CODE.to_string(),
                        message: message.clone(),
                    });
                    if !context.enqueue(lost) {
                        let _ = context.close();
                    }
                }
            }
        }
    }

    /// Close contexts left registered by a connection that was lost
    fn close_leftover_contexts(&self) {
        let contexts = self.registry.contexts();
        if contexts.is_empty() {
            return;
        }

        warn!(
            "Closing {} contexts left over from a previous connection",
            contexts.len()
        );
        for context in contexts {
            let _ = context.close();
        }
        self.registry.clear();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(outbound) = self.outbound.get_mut().take() {
            outbound.shutdown();
        }
    }
}

/// Routes pump events back into the client without keeping it alive
struct ClientInboundHandler {
    client: Weak<ClientInner>,
    /// Identifies the connection this handler's pump serves
    outbound: OutboundSender,
}

#[async_trait]
impl InboundHandler for ClientInboundHandler {
    fn on_text(&self, text: &str) {
        if let Some(client) = self.client.upgrade() {
            client.handle_inbound(text);
        }
    }

    async fn on_closed(&self, reason: CloseReason) {
        if let Some(client) = self.client.upgrade() {
            client.handle_closed(reason, &self.outbound).await;
        }
    }
}
