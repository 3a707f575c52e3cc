//! Configuration for the multi-context TTS client
//!
//! The configuration is split into:
//! - `ClientConfig`: where to connect and how to authenticate, plus client behavior
//! - `ConnectParams`: synthesis parameters sent on the connection query string
//!
//! # Modules
//! - `env`: Environment variable loading (with `.env` support)
//! - `validation`: Configuration validation logic
//! - `utils`: Utility functions for configuration parsing
//!
//! # Example
//! ```rust,no_run
//! use tts_multiplex::config::{ClientConfig, ConnectParams};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables
//! let config = ClientConfig::from_env()?;
//!
//! // Or build it in code
//! let config = ClientConfig::new("wss://tts.example.com", "api-key", "voice-id");
//! let params = ConnectParams::new()
//!     .with_model_id("flash_v2_5")
//!     .with_format("pcm_16000");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod env;
mod utils;
mod validation;

pub use utils::parse_bool;

/// Default handshake timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// What happens to live contexts when the shared connection is lost
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorPolicy {
    /// Contexts stay registered; the caller decides what to do
    #[default]
    LeaveOpen,
    /// Every live context receives a `CONNECTION_LOST` service error and is closed
    CloseContexts,
}

/// Client configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket base URL, e.g. `wss://tts.example.com`
    pub base_url: String,
    /// API key sent in the `api-key` handshake header
    pub api_key: String,
    /// Voice used for every context on the connection
    pub voice_id: String,
    /// Upper bound on the connection handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub transport_error_policy: TransportErrorPolicy,
    /// Parameters merged under the ones passed to `connect()`
    #[serde(default)]
    pub default_params: ConnectParams,
}

impl ClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            transport_error_policy: TransportErrorPolicy::default(),
            default_params: ConnectParams::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_transport_error_policy(mut self, policy: TransportErrorPolicy) -> Self {
        self.transport_error_policy = policy;
        self
    }

    pub fn with_default_params(mut self, params: ConnectParams) -> Self {
        self.default_params = params;
        self
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("voice_id", &self.voice_id)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("transport_error_policy", &self.transport_error_policy)
            .field("default_params", &self.default_params)
            .finish()
    }
}

/// Synthesis parameters carried on the connection query string
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Synthesis model, e.g. `flash_v2_5`
    #[serde(default)]
    pub model_id: Option<String>,
    /// Output audio format, e.g. `pcm_16000`
    #[serde(default)]
    pub format: Option<String>,
    /// Language code, e.g. `en` or `zh`
    #[serde(default)]
    pub language_code: Option<String>,
    /// Any other parameters, sent in insertion order
    #[serde(default)]
    pub extra: Vec<(String, String)>,
}

impl ConnectParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_language_code(mut self, language_code: impl Into<String>) -> Self {
        self.language_code = Some(language_code.into());
        self
    }

    /// Set an arbitrary parameter.
    ///
    /// The well-known keys (`model_id`, `format`, `language_code`) land in
    /// their dedicated fields; setting a key twice keeps the last value.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key.into(), value.into());
        self
    }

    fn set(&mut self, key: String, value: String) {
        match key.as_str() {
            "model_id" => self.model_id = Some(value),
            "format" => self.format = Some(value),
            "language_code" => self.language_code = Some(value),
            _ => match self.extra.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => self.extra.push((key, value)),
            },
        }
    }

    /// Overlay `self` on top of `defaults`; values in `self` win
    pub fn merged_over(&self, defaults: &ConnectParams) -> ConnectParams {
        let mut merged = defaults.clone();
        for (key, value) in self.query_pairs() {
            merged.set(key.to_string(), value.to_string());
        }
        merged
    }

    /// All parameters as query pairs, well-known keys first
    pub fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        let known = [
            ("model_id", self.model_id.as_deref()),
            ("format", self.format.as_deref()),
            ("language_code", self.language_code.as_deref()),
        ];

        known
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn is_empty(&self) -> bool {
        self.query_pairs().next().is_none()
    }
}

impl<K, V> FromIterator<(K, V)> for ConnectParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |params, (k, v)| params.with_param(k, v))
    }
}
