//! Per-context state machine.
//!
//! A [`TTSContext`] is one independent text-to-audio stream sharing the
//! connection with up to four others. It moves through three states:
//!
//! ```text
//!   Open ──end_input()──▶ InputEnded
//!    │                        │
//!    └──────close()───────────┴──▶ Closed (terminal)
//! ```
//!
//! Inbound audio and error records routed to a context are queued on its own
//! dispatch task, so callbacks for one context never hold up the socket or
//! any other context, and records for the same context are handled in
//! arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use base64::Engine;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::base::{AudioChunk, ContextCallbacks, TTSError, TTSResult};
use super::connection::OutboundSender;
use super::messages::OutgoingMessage;
use super::registry::ContextRegistry;

/// Lifecycle state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Accepting text
    Open,
    /// End-of-input sent; audio may still arrive
    InputEnded,
    /// Torn down; nothing is sent or delivered any more
    Closed,
}

/// Record routed from the registry to a context's dispatch task
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RoutedMessage {
    Audio { payload: String, is_final: bool },
    ServiceError { code: String, message: String },
    /// The shared connection went away; report it and close
    ConnectionLost(TTSError),
}

struct ContextInner {
    context_id: String,
    closed: AtomicBool,
    input_ended: AtomicBool,
    callbacks: RwLock<ContextCallbacks>,
    audio_chunks: Mutex<Vec<Bytes>>,
    outbound: OutboundSender,
    registry: Weak<ContextRegistry>,
    /// Taken on close so the dispatch task drains and exits
    dispatch_tx: Mutex<Option<mpsc::UnboundedSender<RoutedMessage>>>,
    /// Held across every check-then-send so nothing follows the close frame
    transition: Mutex<()>,
}

/// Handle to one logical TTS stream.
///
/// Cloning the handle is cheap; every clone refers to the same context.
#[derive(Clone)]
pub struct TTSContext {
    inner: Arc<ContextInner>,
}

impl TTSContext {
    /// Create a context and start its dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(
        context_id: String,
        outbound: OutboundSender,
        registry: Weak<ContextRegistry>,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let context = Self {
            inner: Arc::new(ContextInner {
                context_id,
                closed: AtomicBool::new(false),
                input_ended: AtomicBool::new(false),
                callbacks: RwLock::new(ContextCallbacks::default()),
                audio_chunks: Mutex::new(Vec::new()),
                outbound,
                registry,
                dispatch_tx: Mutex::new(Some(dispatch_tx)),
                transition: Mutex::new(()),
            }),
        };

        Self::spawn_dispatcher(Arc::downgrade(&context.inner), dispatch_rx);
        context
    }

    fn spawn_dispatcher(
        context: Weak<ContextInner>,
        mut dispatch_rx: mpsc::UnboundedReceiver<RoutedMessage>,
    ) {
        tokio::spawn(async move {
            while let Some(message) = dispatch_rx.recv().await {
                let Some(inner) = context.upgrade() else {
                    break;
                };
                TTSContext { inner }.dispatch(message).await;
            }
        });
    }

    #[inline]
    pub fn context_id(&self) -> &str {
        &self.inner.context_id
    }

    pub fn state(&self) -> ContextState {
        if self.inner.closed.load(Ordering::Acquire) {
            ContextState::Closed
        } else if self.inner.input_ended.load(Ordering::Acquire) {
            ContextState::InputEnded
        } else {
            ContextState::Open
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send text for synthesis.
    ///
    /// `flush` asks the service to start synthesizing right away instead of
    /// waiting for more text.
    ///
    /// # Errors
    /// * `ContextClosed` - the context was closed
    /// * `NotConnected` - the connection is gone
    pub fn send_text(&self, text: &str, flush: bool) -> TTSResult<()> {
        let _transition = self.inner.transition.lock();
        if self.is_closed() {
            return Err(TTSError::ContextClosed(self.inner.context_id.clone()));
        }

        self.inner.outbound.send(OutgoingMessage::text(
            self.inner.context_id.as_str(),
            text,
            flush,
        ))?;

        debug!(
            "Context {} queued {} chars of text (flush: {})",
            self.inner.context_id,
            text.chars().count(),
            flush
        );
        Ok(())
    }

    /// Signal that no more text will be sent.
    ///
    /// A no-op on a closed context. Audio already requested keeps streaming
    /// and the final chunk still triggers completion.
    pub fn end_input(&self) -> TTSResult<()> {
        let _transition = self.inner.transition.lock();
        if self.is_closed() {
            return Ok(());
        }

        self.inner
            .outbound
            .send(OutgoingMessage::eos(self.inner.context_id.as_str()))?;
        self.inner.input_ended.store(true, Ordering::Release);

        debug!("Context {} ended input", self.inner.context_id);
        Ok(())
    }

    /// Close the context.
    ///
    /// Only the first call has any effect: it sends one `close` message,
    /// drops the registered callbacks and removes the context from its
    /// registry. Later or concurrent calls return `Ok(())` without doing
    /// anything.
    ///
    /// # Errors
    /// * `NotConnected` - the close message could not be queued; the context
    ///   is closed locally regardless
    pub fn close(&self) -> TTSResult<()> {
        let sent = {
            let _transition = self.inner.transition.lock();
            if self
                .inner
                .closed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }

            // Dropping the sender lets the dispatch task finish
            self.inner.dispatch_tx.lock().take();

            self.inner
                .outbound
                .send(OutgoingMessage::close(self.inner.context_id.as_str()))
        };

        // Callbacks may hold handles to this context
        let callbacks = std::mem::take(&mut *self.inner.callbacks.write());
        drop(callbacks);

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove_context(self);
        }

        match sent {
            Ok(()) => {
                debug!("Context {} closed", self.inner.context_id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Context {} closed locally, close message not sent: {}",
                    self.inner.context_id, e
                );
                Err(e)
            }
        }
    }

    /// Register consumer callbacks.
    ///
    /// Each callback present in `callbacks` replaces the one of the same kind;
    /// kinds absent from `callbacks` are kept. Ignored once the context is
    /// closed.
    pub fn register_callbacks(&self, callbacks: ContextCallbacks) -> &Self {
        let mut current = self.inner.callbacks.write();
        if self.is_closed() {
            debug!(
                "Context {} closed, ignoring callback registration",
                self.inner.context_id
            );
            return self;
        }
        if let Some(on_audio) = callbacks.on_audio {
            current.on_audio = Some(on_audio);
        }
        if let Some(on_error) = callbacks.on_error {
            current.on_error = Some(on_error);
        }
        if let Some(on_complete) = callbacks.on_complete {
            current.on_complete = Some(on_complete);
        }
        self
    }

    /// Snapshot of the decoded audio chunks received so far, in arrival order
    pub fn audio_chunks(&self) -> Vec<Bytes> {
        self.inner.audio_chunks.lock().clone()
    }

    /// All decoded audio received so far, concatenated
    pub fn all_audio(&self) -> Vec<u8> {
        let chunks = self.inner.audio_chunks.lock();
        let total = chunks.iter().map(Bytes::len).sum();
        let mut audio = Vec::with_capacity(total);
        for chunk in chunks.iter() {
            audio.extend_from_slice(chunk);
        }
        audio
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.audio_chunks.lock().len()
    }

    pub fn clear_audio_buffer(&self) {
        self.inner.audio_chunks.lock().clear();
    }

    #[inline]
    pub(crate) fn same_as(&self, other: &TTSContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue a routed record for the dispatch task.
    ///
    /// Returns `false` when the context no longer accepts records.
    pub(crate) fn enqueue(&self, message: RoutedMessage) -> bool {
        match self.inner.dispatch_tx.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    async fn dispatch(&self, message: RoutedMessage) {
        if self.is_closed() {
            debug!(
                "Context {} closed, dropping routed message",
                self.inner.context_id
            );
            return;
        }

        match message {
            RoutedMessage::Audio { payload, is_final } => {
                self.handle_audio(payload, is_final).await;
            }
            RoutedMessage::ServiceError { code, message } => {
                self.handle_error(TTSError::ServiceError { code, message })
                    .await;
            }
            RoutedMessage::ConnectionLost(error) => {
                self.handle_error(error).await;
                let _ = self.close();
            }
        }
    }

    /// Decode, buffer and deliver one audio record.
    ///
    /// A payload that is not valid base64 is reported as `DecodeError` and
    /// not buffered.
    pub(crate) async fn handle_audio(&self, payload: String, is_final: bool) {
        let data = match base64::engine::general_purpose::STANDARD.decode(payload.as_bytes()) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!(
                    "Context {} received undecodable audio: {}",
                    self.inner.context_id, e
                );
                self.handle_error(TTSError::DecodeError(e.to_string())).await;
                return;
            }
        };

        debug!(
            "Context {} received {} bytes of audio (final: {})",
            self.inner.context_id,
            data.len(),
            is_final
        );

        self.inner.audio_chunks.lock().push(data.clone());

        // Clone callbacks out so no lock is held across the awaits
        let (on_audio, on_complete) = {
            let callbacks = self.inner.callbacks.read();
            (callbacks.on_audio.clone(), callbacks.on_complete.clone())
        };

        if let Some(callback) = on_audio {
            callback(AudioChunk {
                context_id: self.inner.context_id.clone(),
                data,
                encoded: payload,
                is_final,
            })
            .await;
        }

        if is_final {
            if let Some(callback) = on_complete {
                callback().await;
            }
        }
    }

    /// Deliver an error to the registered error callback, if any
    pub(crate) async fn handle_error(&self, error: TTSError) {
        let on_error = self.inner.callbacks.read().on_error.clone();
        match on_error {
            Some(callback) => callback(error).await,
            None => debug!(
                "Context {} error (no callback registered): {}",
                self.inner.context_id, error
            ),
        }
    }
}

impl std::fmt::Debug for TTSContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TTSContext")
            .field("context_id", &self.inner.context_id)
            .field("state", &self.state())
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tts::base::ContextEvent;
    use crate::core::tts::connection::ConnectionCommand;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn detached_context(id: &str) -> (TTSContext, UnboundedReceiver<ConnectionCommand>) {
        let (outbound, rx) = OutboundSender::channel();
        (TTSContext::new(id.to_string(), outbound, Weak::new()), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ConnectionCommand>) -> Vec<OutgoingMessage> {
        let mut sent = Vec::new();
        while let Ok(ConnectionCommand::Send(message)) = rx.try_recv() {
            sent.push(message);
        }
        sent
    }

    async fn next_event(rx: &mut UnboundedReceiver<ContextEvent>) -> ContextEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event not delivered in time")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (ctx, _rx) = detached_context("c1");
        assert_eq!(ctx.context_id(), "c1");
        assert_eq!(ctx.state(), ContextState::Open);
        assert!(!ctx.is_closed());
        assert_eq!(ctx.chunk_count(), 0);
        assert!(ctx.all_audio().is_empty());
    }

    #[tokio::test]
    async fn test_send_text_and_end_input() {
        let (ctx, mut rx) = detached_context("c1");

        ctx.send_text("hello", true).unwrap();
        assert_eq!(ctx.state(), ContextState::Open);

        ctx.end_input().unwrap();
        assert_eq!(ctx.state(), ContextState::InputEnded);

        // Text after end of input is still accepted
        ctx.send_text("late", false).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                OutgoingMessage::text("c1", "hello", true),
                OutgoingMessage::eos("c1"),
                OutgoingMessage::text("c1", "late", false),
            ]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (ctx, mut rx) = detached_context("c1");

        ctx.close().unwrap();
        ctx.close().unwrap();
        ctx.clone().close().unwrap();

        assert_eq!(ctx.state(), ContextState::Closed);
        assert_eq!(drain(&mut rx), vec![OutgoingMessage::close("c1")]);
    }

    #[tokio::test]
    async fn test_concurrent_close_sends_once() {
        let (ctx, mut rx) = detached_context("c1");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.close() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(drain(&mut rx), vec![OutgoingMessage::close("c1")]);
    }

    #[tokio::test]
    async fn test_closed_context_rejects_text_and_ignores_eos() {
        let (ctx, mut rx) = detached_context("c1");
        ctx.close().unwrap();

        assert_eq!(
            ctx.send_text("hello", false),
            Err(TTSError::ContextClosed("c1".to_string()))
        );
        assert_eq!(ctx.end_input(), Ok(()));
        assert_eq!(ctx.state(), ContextState::Closed);
        assert_eq!(drain(&mut rx), vec![OutgoingMessage::close("c1")]);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let (ctx, rx) = detached_context("c1");
        drop(rx);

        assert_eq!(ctx.send_text("hello", false), Err(TTSError::NotConnected));
        assert_eq!(ctx.end_input(), Err(TTSError::NotConnected));
        assert_eq!(ctx.state(), ContextState::Open);

        // Close still transitions locally
        assert_eq!(ctx.close(), Err(TTSError::NotConnected));
        assert!(ctx.is_closed());
        assert_eq!(ctx.close(), Ok(()));
    }

    #[tokio::test]
    async fn test_handle_audio_buffers_and_calls_back() {
        let (ctx, _rx) = detached_context("c1");
        let (callbacks, mut events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        // "AQID" is base64 for [1, 2, 3]
        ctx.handle_audio("AQID".to_string(), false).await;

        match next_event(&mut events).await {
            ContextEvent::Audio(chunk) => {
                assert_eq!(chunk.context_id, "c1");
                assert_eq!(chunk.data.as_ref(), &[1, 2, 3]);
                assert_eq!(chunk.encoded, "AQID");
                assert!(!chunk.is_final);
            }
            other => panic!("Expected audio event, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "no completion for non-final chunk");

        // "BAU=" is base64 for [4, 5]
        ctx.handle_audio("BAU=".to_string(), true).await;
        assert!(matches!(next_event(&mut events).await, ContextEvent::Audio(c) if c.is_final));
        assert_eq!(next_event(&mut events).await, ContextEvent::Complete);

        assert_eq!(ctx.chunk_count(), 2);
        assert_eq!(ctx.all_audio(), vec![1, 2, 3, 4, 5]);

        ctx.clear_audio_buffer();
        assert_eq!(ctx.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_audio_decode_error() {
        let (ctx, _rx) = detached_context("c1");
        let (callbacks, mut events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        ctx.handle_audio("not base64!!".to_string(), true).await;

        match next_event(&mut events).await {
            ContextEvent::Error(TTSError::DecodeError(_)) => {}
            other => panic!("Expected decode error, got {other:?}"),
        }
        // No audio, no completion, nothing buffered, state unchanged
        assert!(events.try_recv().is_err());
        assert_eq!(ctx.chunk_count(), 0);
        assert_eq!(ctx.state(), ContextState::Open);
    }

    #[tokio::test]
    async fn test_handle_audio_without_callbacks_still_buffers() {
        let (ctx, _rx) = detached_context("c1");
        ctx.handle_audio("AQID".to_string(), true).await;
        assert_eq!(ctx.audio_chunks(), vec![Bytes::from_static(&[1, 2, 3])]);
    }

    #[tokio::test]
    async fn test_handle_error_does_not_close() {
        let (ctx, _rx) = detached_context("c1");
        let (callbacks, mut events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        ctx.handle_error(TTSError::ServiceError {
            code: "TEST_ERROR".into(),
            message: "Test error message".into(),
        })
        .await;

        assert_eq!(
            next_event(&mut events).await,
            ContextEvent::Error(TTSError::ServiceError {
                code: "TEST_ERROR".into(),
                message: "Test error message".into(),
            })
        );
        assert_eq!(ctx.state(), ContextState::Open);
    }

    #[tokio::test]
    async fn test_register_callbacks_last_wins_per_kind() {
        let (ctx, _rx) = detached_context("c1");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        let complete_counter = completes.clone();
        ctx.register_callbacks(
            ContextCallbacks::new()
                .with_audio(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {})
                })
                .with_complete(move || {
                    complete_counter.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {})
                }),
        );

        // Replaces the audio callback only; completion stays registered
        let counter = second.clone();
        ctx.register_callbacks(ContextCallbacks::new().with_audio(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }));

        ctx.handle_audio("AQID".to_string(), true).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let (ctx, _rx) = detached_context("c1");
        let (callbacks, mut events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        let payloads = ["AA==", "AQ==", "Ag==", "Aw==", "BA=="];
        for (i, payload) in payloads.iter().enumerate() {
            assert!(ctx.enqueue(RoutedMessage::Audio {
                payload: payload.to_string(),
                is_final: i == payloads.len() - 1,
            }));
        }

        for expected in 0u8..5 {
            match next_event(&mut events).await {
                ContextEvent::Audio(chunk) => assert_eq!(chunk.data.as_ref(), &[expected]),
                other => panic!("Expected audio event, got {other:?}"),
            }
        }
        assert_eq!(next_event(&mut events).await, ContextEvent::Complete);
        assert_eq!(ctx.all_audio(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_no_delivery_after_close() {
        let (ctx, _rx) = detached_context("c1");
        let (callbacks, mut events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        ctx.close().unwrap();
        assert!(!ctx.enqueue(RoutedMessage::Audio {
            payload: "AQID".to_string(),
            is_final: true,
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(ctx.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_lost_reports_and_closes() {
        let (ctx, mut rx) = detached_context("c1");
        let (callbacks, mut events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        let error = TTSError::ServiceError {
            code: "CONNECTION_LOST".into(),
            message: "gone".into(),
        };
        assert!(ctx.enqueue(RoutedMessage::ConnectionLost(error.clone())));

        assert_eq!(next_event(&mut events).await, ContextEvent::Error(error));
        timeout(Duration::from_secs(1), async {
            while !ctx.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(drain(&mut rx), vec![OutgoingMessage::close("c1")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_frame_is_last_under_concurrent_sends() {
        for _ in 0..20 {
            let (ctx, mut rx) = detached_context("c1");

            let senders: Vec<_> = (0..4)
                .map(|i| {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        loop {
                            let sent = if i % 2 == 0 {
                                ctx.send_text("hello", false)
                            } else {
                                ctx.end_input()
                            };
                            if sent.is_err() || ctx.is_closed() {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            ctx.close().unwrap();
            for sender in senders {
                sender.await.unwrap();
            }

            let sent = drain(&mut rx);
            let closes = sent
                .iter()
                .filter(|m| **m == OutgoingMessage::close("c1"))
                .count();
            assert_eq!(closes, 1);
            assert_eq!(sent.last(), Some(&OutgoingMessage::close("c1")));
        }
    }

    #[tokio::test]
    async fn test_close_releases_callbacks_holding_the_context() {
        let (ctx, _rx) = detached_context("c1");
        let captured = ctx.clone();
        ctx.register_callbacks(ContextCallbacks::new().with_complete(move || {
            let _ = captured.context_id();
            Box::pin(async {})
        }));
        let weak = Arc::downgrade(&ctx.inner);

        ctx.close().unwrap();
        drop(ctx);

        // The dispatch task only holds a weak handle
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_register_callbacks_after_close_is_ignored() {
        let (ctx, _rx) = detached_context("c1");
        ctx.close().unwrap();

        let (callbacks, mut events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        // Nothing kept the channel's sender alive
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
