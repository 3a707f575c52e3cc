pub mod tts;

// Re-export commonly used types for convenience
pub use tts::{
    AudioChunk, ConnectionState, ContextCallbacks, ContextEvent, ContextState, MAX_CONTEXTS,
    MultiContextClient, TTSContext, TTSError, TTSResult,
};
