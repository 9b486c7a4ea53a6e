//! # Error Types
//!
//! General error handling for the capture engine.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! These errors only exist on the healthy path: `handler::install`, the
//! [`Writer`](crate::writer::Writer) facade, and the FFI layer built on top of
//! it. The fault handler never constructs a `CaptureError`; a failure there
//! means "no dump", followed by the operating system's default behavior.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for capture operations
///
/// ## Error Categories
///
/// 1. **Lifecycle errors**: AlreadyInstalled, UseAfterFree
/// 2. **Platform errors**: UnsupportedPlatform
/// 3. **Output errors**: Io (opening or creating the dump file), WriteFailed (serialization)
/// 4. **Caller errors**: InvalidArgument
/// 5. **Capture errors**: CaptureFailed
///
/// A dump that was written but is missing some threads, modules or memory is
/// *not* an error. See [`DumpStatus::Partial`](crate::writer::DumpStatus).
#[derive(Error, Debug)]
pub enum CaptureError
{
    /// A handler set is already installed in this process
    ///
    /// Call `handler::uninstall()` before installing again.
    #[error("Crash handlers are already installed")]
    AlreadyInstalled,

    /// The current OS or CPU architecture has no capture backend
    ///
    /// Backends exist for Linux and macOS on x86_64 and aarch64.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),

    /// The writer handle was already released
    ///
    /// Rust callers cannot produce this error because [`Writer::free`](crate::writer::Writer::free)
    /// consumes the writer. It is reported by the FFI handle table when a host
    /// passes a token that was already freed.
    #[error("Writer handle used after free")]
    UseAfterFree,

    /// Opening, creating or syncing the output path failed
    ///
    /// Covers unwritable paths, missing permissions, and a full disk at open time.
    #[error("I/O error on {}: {source}", path.display())]
    Io
    {
        /// Path that was being opened or created
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// A write failed in the middle of serialization
    ///
    /// The partially written file is left on disk; callers may delete it.
    #[error("Failed to write minidump while emitting {stream}: {source}")]
    WriteFailed
    {
        /// The part of the dump that was being emitted
        stream: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Invalid argument passed to an engine function
    ///
    /// Examples:
    /// - A null or non-UTF-8 path at the FFI boundary
    /// - Capture limits of zero
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Capture could not produce any snapshot at all
    ///
    /// Individual threads or modules that cannot be read never produce this;
    /// they are recorded as partial capture instead.
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
}

/// Convenience type alias for `Result<T, CaptureError>`
///
/// ```rust
/// use crashcap_core::error::CaptureResult;
/// fn foo() -> CaptureResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

impl CaptureError
{
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self
    {
        CaptureError::Io {
            path: path.into(),
            source,
        }
    }
}
