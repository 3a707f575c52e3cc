//! Capacity-bounded registry of live contexts.
//!
//! The registry owns every context created on the connection, enforces the
//! per-connection limit and routes inbound records to the owning context.
//! The context map and the outbound sender share one lock, so the
//! connected, capacity and duplicate checks and the insert happen atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::base::{TTSError, TTSResult};
use super::connection::OutboundSender;
use super::context::{RoutedMessage, TTSContext};

/// Maximum number of concurrently live contexts per connection
pub const MAX_CONTEXTS: usize = 5;

#[derive(Default)]
struct RegistryState {
    contexts: HashMap<String, TTSContext>,
    outbound: Option<OutboundSender>,
}

/// Keyed storage of the contexts live on one connection
#[derive(Default)]
pub struct ContextRegistry {
    state: Mutex<RegistryState>,
    dropped_messages: AtomicU64,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the registry to a freshly opened connection
    pub(crate) fn attach(&self, outbound: OutboundSender) {
        self.state.lock().outbound = Some(outbound);
    }

    /// Unbind the registry from its connection.
    ///
    /// Contexts stay registered; creation fails with `NotConnected` until the
    /// next `attach`.
    pub(crate) fn detach(&self) -> Option<OutboundSender> {
        self.state.lock().outbound.take()
    }

    /// Create and register a new open context.
    ///
    /// # Errors
    /// * `NotConnected` - no live connection is attached
    /// * `CapacityExceeded` - `MAX_CONTEXTS` contexts are already live
    /// * `DuplicateContext` - a live context already uses `context_id`
    pub fn create(self: &Arc<Self>, context_id: &str) -> TTSResult<TTSContext> {
        let mut state = self.state.lock();

        let outbound = match state.outbound.as_ref() {
            Some(outbound) if !outbound.is_closed() => outbound.clone(),
            _ => return Err(TTSError::NotConnected),
        };

        if state.contexts.len() >= MAX_CONTEXTS {
            return Err(TTSError::CapacityExceeded { max: MAX_CONTEXTS });
        }

        if state.contexts.contains_key(context_id) {
            return Err(TTSError::DuplicateContext(context_id.to_string()));
        }

        let context = TTSContext::new(context_id.to_string(), outbound, Arc::downgrade(self));
        state.contexts.insert(context_id.to_string(), context.clone());

        info!(
            "Created context: {} (active: {}/{})",
            context_id,
            state.contexts.len(),
            MAX_CONTEXTS
        );

        Ok(context)
    }

    pub fn get(&self, context_id: &str) -> Option<TTSContext> {
        self.state.lock().contexts.get(context_id).cloned()
    }

    /// Remove whatever context is registered under `context_id`.
    ///
    /// The removed context stops receiving routed records but is not closed.
    /// Removing an absent id is a no-op that returns `None`.
    pub fn remove(&self, context_id: &str) -> Option<TTSContext> {
        let mut state = self.state.lock();
        let removed = state.contexts.remove(context_id)?;
        info!(
            "Removed context: {} (active: {}/{})",
            context_id,
            state.contexts.len(),
            MAX_CONTEXTS
        );
        Some(removed)
    }

    /// Remove `context` if it is still the entry registered under its id.
    ///
    /// A newer context that reused the id is left in place.
    pub(crate) fn remove_context(&self, context: &TTSContext) -> bool {
        let mut state = self.state.lock();

        let registered = state
            .contexts
            .get(context.context_id())
            .is_some_and(|entry| entry.same_as(context));
        if !registered {
            return false;
        }

        state.contexts.remove(context.context_id());
        info!(
            "Removed context: {} (active: {}/{})",
            context.context_id(),
            state.contexts.len(),
            MAX_CONTEXTS
        );
        true
    }

    /// Hand a record to the context registered under `context_id`.
    ///
    /// Records for unknown or closed contexts are dropped and counted.
    pub(crate) fn route(&self, context_id: &str, message: RoutedMessage) -> bool {
        let context = self.get(context_id);

        let delivered = context.is_some_and(|context| context.enqueue(message));
        if !delivered {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping message for unknown context: {}", context_id);
        }
        delivered
    }

    /// Number of contexts currently registered
    pub fn active_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Snapshot of every registered context
    pub fn contexts(&self) -> Vec<TTSContext> {
        self.state.lock().contexts.values().cloned().collect()
    }

    /// Forget every registered context without closing it
    pub(crate) fn clear(&self) {
        self.state.lock().contexts.clear();
    }

    /// Inbound records dropped because no live context matched their id
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ContextRegistry")
            .field("active", &state.contexts.len())
            .field("attached", &state.outbound.is_some())
            .field("dropped_messages", &self.dropped_messages())
            .finish()
    }
}
