//! # Shared TTS Types
//!
//! This module holds the types shared by every layer of the multi-context
//! client: the error enum, the connection state, the audio chunk delivered to
//! consumers and the callback aliases used to register consumers on a context.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use tts_multiplex::core::tts::{AudioChunk, ContextCallbacks, TTSError};
//!
//! let callbacks = ContextCallbacks::new()
//!     .with_audio(|chunk: AudioChunk| {
//!         Box::pin(async move {
//!             println!("{}: {} bytes (final: {})", chunk.context_id, chunk.data.len(), chunk.is_final);
//!         })
//!     })
//!     .with_error(|error: TTSError| {
//!         Box::pin(async move {
//!             eprintln!("TTS error [{}]: {}", error.code(), error);
//!         })
//!     });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Error code reported when an inbound audio payload is not valid base64
pub const DECODE_ERROR_CODE: &str = "DECODE_ERROR";

/// Error code delivered to contexts when the shared connection is lost
pub const CONNECTION_LOST_CODE: &str = "CONNECTION_LOST";

/// TTS-specific error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TTSError {
    #[error("Not connected to the TTS service")]
    NotConnected,

    #[error("Already connected to the TTS service")]
    AlreadyConnected,

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Maximum {max} contexts allowed per connection")]
    CapacityExceeded { max: usize },

    #[error("Context already exists: {0}")]
    DuplicateContext(String),

    #[error("Context is closed: {0}")]
    ContextClosed(String),

    #[error("Failed to decode audio: {0}")]
    DecodeError(String),

    #[error("Service error ({code}): {message}")]
    ServiceError { code: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl TTSError {
    /// Machine-readable code for the error.
    ///
    /// Service errors report the code sent by the remote service.
    pub fn code(&self) -> &str {
        match self {
            TTSError::NotConnected => "NOT_CONNECTED",
            TTSError::AlreadyConnected => "ALREADY_CONNECTED",
            TTSError::ConnectTimeout(_) => "CONNECT_TIMEOUT",
            TTSError::ConnectFailed(_) => "CONNECT_FAILED",
            TTSError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            TTSError::DuplicateContext(_) => "DUPLICATE_CONTEXT",
            TTSError::ContextClosed(_) => "CONTEXT_CLOSED",
            TTSError::DecodeError(_) => DECODE_ERROR_CODE,
            TTSError::ServiceError { code, .. } => code,
            TTSError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            TTSError::NetworkError(_) => "NETWORK_ERROR",
        }
    }

    /// Whether the error was reported by the remote service rather than raised locally
    #[inline]
    pub fn is_service_error(&self) -> bool {
        matches!(self, TTSError::ServiceError { .. })
    }
}

/// Result type for TTS operations
pub type TTSResult<T> = Result<T, TTSError>;

/// Connection state of the shared WebSocket
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected to the service
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and ready to create contexts
    Connected,
    /// Connection failed or was lost
    Error(String),
}

/// One decoded audio chunk routed to a context
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Context the chunk belongs to
    pub context_id: String,
    /// Decoded audio bytes
    pub data: Bytes,
    /// Base64 payload exactly as received on the wire
    pub encoded: String,
    /// Whether this is the last chunk of the context
    pub is_final: bool,
}

/// Tagged event pushed to a context consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    Audio(AudioChunk),
    Error(TTSError),
    Complete,
}

/// Callback type for audio chunks
pub type AudioCallback =
    Arc<dyn Fn(AudioChunk) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for service and decode errors
pub type ErrorCallback =
    Arc<dyn Fn(TTSError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for completion (final chunk delivered)
pub type CompleteCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Set of consumer callbacks for one context.
///
/// Registering a set on a context replaces each callback present in the set
/// and leaves the others untouched.
#[derive(Clone, Default)]
pub struct ContextCallbacks {
    pub on_audio: Option<AudioCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_complete: Option<CompleteCallback>,
}

impl ContextCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audio<F>(mut self, callback: F) -> Self
    where
        F: Fn(AudioChunk) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.on_audio = Some(Arc::new(callback));
        self
    }

    pub fn with_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(TTSError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn with_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Build a callback set that forwards every event into a channel.
    ///
    /// Useful for consumers that prefer to `recv()` events in their own task
    /// instead of running code inside the dispatch path.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ContextEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let audio_tx = tx.clone();
        let error_tx = tx.clone();
        let complete_tx = tx;

        let callbacks = Self::new()
            .with_audio(move |chunk| {
                let _ = audio_tx.send(ContextEvent::Audio(chunk));
                Box::pin(async {})
            })
            .with_error(move |error| {
                let _ = error_tx.send(ContextEvent::Error(error));
                Box::pin(async {})
            })
            .with_complete(move || {
                let _ = complete_tx.send(ContextEvent::Complete);
                Box::pin(async {})
            });

        (callbacks, rx)
    }
}

impl std::fmt::Debug for ContextCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCallbacks")
            .field("on_audio", &self.on_audio.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Callback type for connection established notifications
pub type ConnectedCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for connection closed notifications
pub type DisconnectedCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for connection-scoped errors (no routable context)
pub type GlobalErrorCallback =
    Arc<dyn Fn(TTSError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
