//! Shared WebSocket connection for the multi-context TTS API.
//!
//! This module owns everything that touches the socket:
//! - building the connection URL and the authenticated handshake request
//! - opening the socket under a bounded timeout
//! - the pump task that writes queued outbound frames and hands every inbound
//!   text frame to an [`InboundHandler`]
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────────┐     ┌─────────────────┐
//! │ TTSContext ops   │────▶│ OutboundSender    │────▶│   Pump Task     │────▶ WebSocket
//! └──────────────────┘     │ (unbounded mpsc)  │     │                 │
//!                          └───────────────────┘     │                 │◀──── WebSocket
//!                                                    └────────┬────────┘
//!                                                             │ on_text / on_closed
//!                                                    ┌────────▼────────┐
//!                                                    │ InboundHandler  │
//!                                                    └─────────────────┘
//! ```
//!
//! Outbound frames and the shutdown request travel through the same channel,
//! so close frames queued by `disconnect()` are written before the socket is
//! closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        handshake::client::generate_key,
        http::Request,
        http::header::USER_AGENT,
        protocol::Message,
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use super::base::{TTSError, TTSResult};
use super::messages::OutgoingMessage;
use crate::config::{ClientConfig, ConnectParams};

/// Header carrying the API key on the handshake request
pub const API_KEY_HEADER: &str = "api-key";

/// Query parameter requesting dedicated per-connection concurrency
pub const PRIORITY_PARAM: (&str, &str) = ("priority", "dedicated_concurrency");

/// WebSocket connection wrapper
pub(crate) type WebSocketConnection = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Command consumed by the pump task
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConnectionCommand {
    Send(OutgoingMessage),
    Shutdown,
}

/// Cloneable handle used to queue outbound frames on the shared connection
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl OutboundSender {
    /// Create a sender together with the receiving end consumed by the pump
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message for sending.
    ///
    /// Fails with `NotConnected` once the pump has stopped.
    pub fn send(&self, message: OutgoingMessage) -> TTSResult<()> {
        self.tx
            .send(ConnectionCommand::Send(message))
            .map_err(|_| TTSError::NotConnected)
    }

    /// Ask the pump to close the socket after the frames already queued
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(ConnectionCommand::Shutdown);
    }

    /// Whether the pump has stopped receiving
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both senders feed the same pump
    pub(crate) fn same_channel(&self, other: &OutboundSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Why the pump stopped
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CloseReason {
    /// The client asked for the shutdown
    Requested,
    /// The service closed the socket
    ClosedByServer(Option<String>),
    /// A transport error ended the connection
    Failed(TTSError),
}

/// Receiver of everything the pump reads from the socket
#[async_trait]
pub(crate) trait InboundHandler: Send + Sync + 'static {
    /// Called for each inbound text frame, in arrival order
    fn on_text(&self, text: &str);

    /// Called once when the pump stops
    async fn on_closed(&self, reason: CloseReason);
}

/// Build the connection URL.
///
/// `{base_url}/enterprise/v1/tts/{voice_id}/websocket/multi?priority=dedicated_concurrency&...`
/// followed by the synthesis parameters in order.
pub fn build_connection_url(config: &ClientConfig, params: &ConnectParams) -> TTSResult<Url> {
    let mut url = Url::parse(&config.base_url)
        .map_err(|e| TTSError::InvalidConfiguration(format!("Invalid base URL: {e}")))?;

    url.path_segments_mut()
        .map_err(|_| {
            TTSError::InvalidConfiguration(format!(
                "Base URL cannot carry a path: {}",
                config.base_url
            ))
        })?
        .pop_if_empty()
        .extend([
            "enterprise",
            "v1",
            "tts",
            config.voice_id.as_str(),
            "websocket",
            "multi",
        ]);

    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair(PRIORITY_PARAM.0, PRIORITY_PARAM.1);
        for (key, value) in params.query_pairs() {
            query.append_pair(key, value);
        }
    }

    Ok(url)
}

/// Build the handshake request carrying the API key header
pub(crate) fn build_handshake_request(url: &Url, api_key: &str) -> TTSResult<Request<()>> {
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(TTSError::InvalidConfiguration(format!(
                "Connection URL has no host: {url}"
            )));
        }
    };

    Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "upgrade")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header(API_KEY_HEADER, api_key)
        .header(USER_AGENT, concat!("tts-multiplex/", env!("CARGO_PKG_VERSION")))
        .body(())
        .map_err(|e| TTSError::ConnectFailed(format!("Failed to create request: {e}")))
}

/// Open the socket, failing with `ConnectTimeout` once `limit` elapses
pub(crate) async fn open(
    url: &Url,
    api_key: &str,
    limit: Duration,
) -> TTSResult<WebSocketConnection> {
    let request = build_handshake_request(url, api_key)?;

    debug!("Connecting to multi-context TTS WebSocket: {}", url);

    let (ws_stream, response) = match timeout(limit, connect_async(request)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            return Err(TTSError::ConnectFailed(format!(
                "WebSocket connection failed: {e}"
            )));
        }
        Err(_) => return Err(TTSError::ConnectTimeout(limit)),
    };

    info!(
        "WebSocket connection established, response status: {:?}",
        response.status()
    );

    Ok(ws_stream)
}

/// Start the pump task for an open socket
pub(crate) fn spawn_pump(
    ws_stream: WebSocketConnection,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    handler: Arc<dyn InboundHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("TTS WebSocket pump started");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let reason = loop {
            tokio::select! {
                message = ws_stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received text frame: {} bytes", text.len());
                            handler.on_text(text.as_str());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("WebSocket closed by server: {:?}", frame);
                            break CloseReason::ClosedByServer(
                                frame.map(|f| f.reason.as_str().to_string()),
                            );
                        }
                        Some(Ok(Message::Binary(data))) => {
                            debug!("Ignoring binary frame: {} bytes", data.len());
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            debug!("Received ping/pong");
                        }
                        Some(Ok(Message::Frame(_))) => {
                            debug!("Received raw frame");
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            break CloseReason::Failed(TTSError::NetworkError(format!(
                                "WebSocket error: {e}"
                            )));
                        }
                        None => {
                            info!("WebSocket stream ended");
                            break CloseReason::ClosedByServer(None);
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(message)) => {
                            let json = match message.to_json() {
                                Ok(json) => json,
                                Err(e) => {
                                    error!("Failed to serialize message: {}", e);
                                    continue;
                                }
                            };

                            debug!("Sending: {}", json);
                            if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                                error!("Failed to send message: {}", e);
                                break CloseReason::Failed(TTSError::NetworkError(format!(
                                    "Failed to send message: {e}"
                                )));
                            }
                        }
                        Some(ConnectionCommand::Shutdown) => {
                            info!("Closing TTS WebSocket connection");
                            if let Err(e) = ws_sink.send(Message::Close(None)).await {
                                warn!("Failed to send close frame: {}", e);
                            }
                            break CloseReason::Requested;
                        }
                        None => {
                            debug!("All outbound senders dropped");
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break CloseReason::Requested;
                        }
                    }
                }
            }
        };

        // Refuse further sends before reporting the close
        commands.close();
        handler.on_closed(reason).await;
        debug!("TTS WebSocket pump ended");
    })
}
