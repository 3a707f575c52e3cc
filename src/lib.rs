pub mod config;
pub mod core;

// Re-export commonly used items for convenience
pub use config::{ClientConfig, ConnectParams, TransportErrorPolicy};
pub use core::*;
