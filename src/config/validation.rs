use url::Url;

use super::ClientConfig;
use crate::core::tts::{TTSError, TTSResult};

/// Validate the base URL: must parse and use the `ws` or `wss` scheme
pub fn validate_base_url(base_url: &str) -> TTSResult<()> {
    let url = Url::parse(base_url)
        .map_err(|e| TTSError::InvalidConfiguration(format!("Invalid base URL '{base_url}': {e}")))?;

    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(TTSError::InvalidConfiguration(format!(
            "Base URL must use ws:// or wss://, got '{other}://'"
        ))),
    }
}

/// Validate that credentials and voice are present
pub fn validate_credentials(api_key: &str, voice_id: &str) -> TTSResult<()> {
    if api_key.trim().is_empty() {
        return Err(TTSError::InvalidConfiguration(
            "API key is required".to_string(),
        ));
    }

    if voice_id.trim().is_empty() {
        return Err(TTSError::InvalidConfiguration(
            "Voice ID is required".to_string(),
        ));
    }

    Ok(())
}

impl ClientConfig {
    /// Validate the configuration before connecting
    ///
    /// # Errors
    /// Returns `TTSError::InvalidConfiguration` if:
    /// - the base URL is not a `ws`/`wss` URL
    /// - the API key or voice ID is empty
    /// - the connect timeout is zero
    pub fn validate(&self) -> TTSResult<()> {
        validate_base_url(&self.base_url)?;
        validate_credentials(&self.api_key, &self.voice_id)?;

        if self.connect_timeout_ms == 0 {
            return Err(TTSError::InvalidConfiguration(
                "Connect timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
