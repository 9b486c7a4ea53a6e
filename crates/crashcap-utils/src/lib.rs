//! # crashcap Utilities
//!
//! Shared helpers for the crashcap workspace.
//!
//! For now this is the logging setup used by the CLI and the FFI library,
//! built on `tracing`. The capture engine itself only emits events and never
//! installs a subscriber.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{
    default_log_path, init_logging, init_logging_file_only, init_logging_with_level, LogFormat, LogGuard, LogLevel,
    LoggingError,
};
pub use tracing::{debug, error, info, trace, warn};
