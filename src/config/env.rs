use std::env;
use std::path::Path;

use super::utils::{parse_bool, parse_secs};
use super::{ClientConfig, ConnectParams, TransportErrorPolicy};

/// Base URL used when `TTS_BASE_URL` is not set
pub const DEFAULT_BASE_URL: &str = "wss://your-domain.com";

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// | Variable | Required | Default |
    /// |----------|----------|---------|
    /// | `TTS_BASE_URL` | no | `wss://your-domain.com` |
    /// | `TTS_API_KEY` | yes | |
    /// | `TTS_VOICE_ID` | yes | |
    /// | `TTS_CONNECT_TIMEOUT_SECS` | no | `10` |
    /// | `TTS_MODEL_ID`, `TTS_FORMAT`, `TTS_LANGUAGE_CODE` | no | unset |
    /// | `TTS_CLOSE_CONTEXTS_ON_TRANSPORT_ERROR` | no | `false` |
    ///
    /// # Errors
    /// Returns an error if:
    /// - `TTS_API_KEY` or `TTS_VOICE_ID` is missing
    /// - a numeric or boolean variable is malformed
    /// - the resulting configuration fails validation
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();
        Self::read_env()
    }

    /// Load configuration from a specific `.env` file, then the environment
    ///
    /// Variables already present in the process environment win over the file.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        dotenvy::from_path(path)
            .map_err(|e| format!("Failed to load {}: {e}", path.display()))?;
        Self::read_env()
    }

    fn read_env() -> Result<Self, Box<dyn std::error::Error>> {
        let base_url = env::var("TTS_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = env::var("TTS_API_KEY").map_err(|_| "TTS_API_KEY is required")?;
        let voice_id = env::var("TTS_VOICE_ID").map_err(|_| "TTS_VOICE_ID is required")?;

        let mut config = ClientConfig::new(base_url, api_key, voice_id);

        if let Ok(value) = env::var("TTS_CONNECT_TIMEOUT_SECS") {
            let timeout = parse_secs(&value)
                .ok_or_else(|| format!("Invalid TTS_CONNECT_TIMEOUT_SECS: {value}"))?;
            config = config.with_connect_timeout(timeout);
        }

        if let Ok(value) = env::var("TTS_CLOSE_CONTEXTS_ON_TRANSPORT_ERROR") {
            let close = parse_bool(&value).ok_or_else(|| {
                format!("Invalid TTS_CLOSE_CONTEXTS_ON_TRANSPORT_ERROR: {value}")
            })?;
            if close {
                config = config.with_transport_error_policy(TransportErrorPolicy::CloseContexts);
            }
        }

        let mut params = ConnectParams::new();
        if let Ok(model_id) = env::var("TTS_MODEL_ID") {
            params = params.with_model_id(model_id);
        }
        if let Ok(format) = env::var("TTS_FORMAT") {
            params = params.with_format(format);
        }
        if let Ok(language_code) = env::var("TTS_LANGUAGE_CODE") {
            params = params.with_language_code(language_code);
        }
        config.default_params = params;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const VARS: &[&str] = &[
        "TTS_BASE_URL",
        "TTS_API_KEY",
        "TTS_VOICE_ID",
        "TTS_CONNECT_TIMEOUT_SECS",
        "TTS_MODEL_ID",
        "TTS_FORMAT",
        "TTS_LANGUAGE_CODE",
        "TTS_CLOSE_CONTEXTS_ON_TRANSPORT_ERROR",
    ];

    // Helper to clean up environment variables after tests
    fn cleanup_env_vars() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn test_read_env_defaults() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TTS_API_KEY", "test-key");
            env::set_var("TTS_VOICE_ID", "test-voice");
        }

        let config = ClientConfig::read_env().expect("Should load config");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.voice_id, "test-voice");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.transport_error_policy, TransportErrorPolicy::LeaveOpen);
        assert!(config.default_params.is_empty());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_read_env_all_values() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TTS_BASE_URL", "ws://localhost:5001");
            env::set_var("TTS_API_KEY", "test-key");
            env::set_var("TTS_VOICE_ID", "test-voice");
            env::set_var("TTS_CONNECT_TIMEOUT_SECS", "3");
            env::set_var("TTS_MODEL_ID", "flash_v2_5");
            env::set_var("TTS_FORMAT", "pcm_16000");
            env::set_var("TTS_LANGUAGE_CODE", "zh");
            env::set_var("TTS_CLOSE_CONTEXTS_ON_TRANSPORT_ERROR", "yes");
        }

        let config = ClientConfig::read_env().expect("Should load config");
        assert_eq!(config.base_url, "ws://localhost:5001");
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.transport_error_policy,
            TransportErrorPolicy::CloseContexts
        );
        assert_eq!(config.default_params.model_id.as_deref(), Some("flash_v2_5"));
        assert_eq!(config.default_params.format.as_deref(), Some("pcm_16000"));
        assert_eq!(config.default_params.language_code.as_deref(), Some("zh"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_read_env_missing_api_key() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TTS_VOICE_ID", "test-voice");
        }

        let err = ClientConfig::read_env().unwrap_err();
        assert!(err.to_string().contains("TTS_API_KEY"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_read_env_invalid_timeout() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TTS_API_KEY", "test-key");
            env::set_var("TTS_VOICE_ID", "test-voice");
            env::set_var("TTS_CONNECT_TIMEOUT_SECS", "soon");
        }

        let err = ClientConfig::read_env().unwrap_err();
        assert!(err.to_string().contains("TTS_CONNECT_TIMEOUT_SECS"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_read_env_rejects_http_base_url() {
        cleanup_env_vars();
        unsafe {
            env::set_var("TTS_BASE_URL", "http://localhost:5001");
            env::set_var("TTS_API_KEY", "test-key");
            env::set_var("TTS_VOICE_ID", "test-voice");
        }

        assert!(ClientConfig::read_env().is_err());

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_file() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let env_path = temp_dir.path().join(".env");
        fs::write(
            &env_path,
            "TTS_BASE_URL=wss://tts.internal\nTTS_API_KEY=file-key\nTTS_VOICE_ID=file-voice\nTTS_FORMAT=pcm_24000\n",
        )
        .unwrap();

        let config = ClientConfig::from_env_file(&env_path).expect("Should load .env file");
        assert_eq!(config.base_url, "wss://tts.internal");
        assert_eq!(config.api_key, "file-key");
        assert_eq!(config.voice_id, "file-voice");
        assert_eq!(config.default_params.format.as_deref(), Some("pcm_24000"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_file_missing() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let result = ClientConfig::from_env_file(temp_dir.path().join("missing.env"));
        assert!(result.is_err());
    }
}
