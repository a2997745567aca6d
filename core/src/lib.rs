//! dockershim core - foundational types shared by the CRI shim.
//!
//! Error taxonomy, configuration, log retrieval options, exec types and the
//! framing used on upgraded streaming connections.

pub mod config;
pub mod error;
pub mod exec;
pub mod frame;
pub mod log;

// Re-export commonly used types
pub use config::{LogFormat, ShimConfig, StreamingConfig};
pub use error::{EntityKind, Result, ShimError};
pub use log::{LogDriver, LogEntry, LogOptions, LogStream};

/// dockershim version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
