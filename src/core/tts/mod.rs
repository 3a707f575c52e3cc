//! Multi-context text-to-speech over a single WebSocket.
//!
//! - `base`: error type, connection state and callback types
//! - `messages`: outbound and inbound wire messages
//! - `connection`: URL and handshake building, the socket pump
//! - `context`: the per-context state machine
//! - `registry`: capacity-bounded context storage and routing
//! - `client`: the facade tying it together

mod base;
mod client;
mod connection;
mod context;
mod messages;
mod registry;

pub use base::{
    AudioCallback, AudioChunk, CONNECTION_LOST_CODE, CompleteCallback, ConnectedCallback,
    ConnectionState, ContextCallbacks, ContextEvent, DECODE_ERROR_CODE, DisconnectedCallback,
    ErrorCallback, GlobalErrorCallback, TTSError, TTSResult,
};
pub use client::MultiContextClient;
pub use connection::{API_KEY_HEADER, OutboundSender, PRIORITY_PARAM, build_connection_url};
pub use context::{ContextState, TTSContext};
pub use messages::{
    AudioRecord, InboundMessage, OutgoingMessage, ServiceErrorRecord, UNKNOWN_ERROR_MESSAGE,
};
pub use registry::{ContextRegistry, MAX_CONTEXTS};
