//! # Configuration
//!
//! [`HandlerConfig`] describes where fault dumps go and how much state a
//! capture may hold. [`CaptureLimits`] sizes the storage that is reserved up
//! front by `handler::install` (and allocated per call by the on-demand
//! writer).
//!
//! ## Environment overrides
//!
//! [`CaptureLimits::from_env`] reads:
//!
//! - `CRASHCAP_MAX_THREADS`: maximum number of threads recorded per dump
//! - `CRASHCAP_MAX_STACK_BYTES`: per-thread stack capture cap in bytes

use std::path::{Path, PathBuf};

use crate::error::{CaptureError, CaptureResult};

/// Environment variable overriding [`CaptureLimits::max_threads`]
pub const MAX_THREADS_ENV: &str = "CRASHCAP_MAX_THREADS";
/// Environment variable overriding [`CaptureLimits::max_stack_bytes`]
pub const MAX_STACK_BYTES_ENV: &str = "CRASHCAP_MAX_STACK_BYTES";

/// Bounds on a single capture
///
/// Every collection in a snapshot has a fixed capacity derived from these
/// values. Anything beyond them is dropped and the dump is flagged as partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits
{
    /// Maximum number of threads recorded
    pub max_threads: usize,
    /// Per-thread stack capture cap in bytes
    pub max_stack_bytes: usize,
    /// Maximum number of loaded modules recorded
    pub max_modules: usize,
    /// Bytes available for module paths
    pub name_pool_bytes: usize,
}

impl CaptureLimits
{
    pub const DEFAULT_MAX_THREADS: usize = 256;
    pub const DEFAULT_MAX_STACK_BYTES: usize = 64 * 1024;
    pub const DEFAULT_MAX_MODULES: usize = 1024;
    pub const DEFAULT_NAME_POOL_BYTES: usize = 256 * 1024;

    /// Defaults with `CRASHCAP_MAX_THREADS` / `CRASHCAP_MAX_STACK_BYTES` applied
    ///
    /// Values that fail to parse or are zero are ignored with a warning.
    pub fn from_env() -> Self
    {
        let mut limits = Self::default();
        if let Some(threads) = read_env_usize(MAX_THREADS_ENV) {
            limits.max_threads = threads;
        }
        if let Some(stack) = read_env_usize(MAX_STACK_BYTES_ENV) {
            limits.max_stack_bytes = stack;
        }
        limits
    }

    #[must_use]
    pub const fn with_max_threads(mut self, max_threads: usize) -> Self
    {
        self.max_threads = max_threads;
        self
    }

    #[must_use]
    pub const fn with_max_stack_bytes(mut self, max_stack_bytes: usize) -> Self
    {
        self.max_stack_bytes = max_stack_bytes;
        self
    }

    #[must_use]
    pub const fn with_max_modules(mut self, max_modules: usize) -> Self
    {
        self.max_modules = max_modules;
        self
    }

    /// Reject limits that would make every capture empty or overflow a 32-bit RVA
    pub fn validate(&self) -> CaptureResult<()>
    {
        if self.max_threads == 0 || self.max_stack_bytes == 0 || self.max_modules == 0 {
            return Err(CaptureError::InvalidArgument(format!("capture limits must be non-zero: {self:?}")));
        }
        let stack_pool = self.max_threads.checked_mul(self.max_stack_bytes);
        match stack_pool {
            Some(total) if u32::try_from(total).is_ok() => Ok(()),
            _ => Err(CaptureError::InvalidArgument(format!(
                "{} threads x {} stack bytes exceeds the 4 GiB minidump limit",
                self.max_threads, self.max_stack_bytes
            ))),
        }
    }
}

impl Default for CaptureLimits
{
    fn default() -> Self
    {
        Self {
            max_threads: Self::DEFAULT_MAX_THREADS,
            max_stack_bytes: Self::DEFAULT_MAX_STACK_BYTES,
            max_modules: Self::DEFAULT_MAX_MODULES,
            name_pool_bytes: Self::DEFAULT_NAME_POOL_BYTES,
        }
    }
}

fn read_env_usize(name: &str) -> Option<usize>
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring invalid capture limit override");
            None
        }
        Ok(value) => Some(value),
    }
}

/// Where a fault dump is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpTarget
{
    /// Always write to exactly this path (truncating any previous file)
    File(PathBuf),
    /// Generate `{prefix}_{signal}_{unix_seconds}.dmp` inside `dir` (`crash_sigsegv_1700000000.dmp`)
    ///
    /// With `append_timestamp = false` the name is `{prefix}_{signal}.dmp`.
    Directory
    {
        dir: PathBuf,
        prefix: String,
        append_timestamp: bool,
    },
}

impl DumpTarget
{
    /// Directory target with the default `crash` prefix and timestamps
    pub fn directory(dir: impl Into<PathBuf>) -> Self
    {
        DumpTarget::Directory {
            dir: dir.into(),
            prefix: HandlerConfig::DEFAULT_PREFIX.to_string(),
            append_timestamp: true,
        }
    }
}

/// Callback run inside the fault handler right before capture starts
///
/// It executes in signal context: it must be async-signal-safe and must not
/// allocate, lock, or panic.
pub type PreDumpCallback = fn();

/// Configuration for `handler::install`
///
/// ```rust
/// use crashcap_core::config::{CaptureLimits, DumpTarget, HandlerConfig};
///
/// let config = HandlerConfig::new(DumpTarget::directory("/tmp/dumps"))
///     .with_prefix("my_app")
///     .with_limits(CaptureLimits::default().with_max_threads(64));
/// assert_eq!(config.limits.max_threads, 64);
/// ```
#[derive(Debug, Clone)]
pub struct HandlerConfig
{
    pub target: DumpTarget,
    pub limits: CaptureLimits,
    pub pre_dump: Option<PreDumpCallback>,
}

impl HandlerConfig
{
    pub const DEFAULT_PREFIX: &'static str = "crash";

    pub fn new(target: DumpTarget) -> Self
    {
        Self {
            target,
            limits: CaptureLimits::from_env(),
            pre_dump: None,
        }
    }

    /// Write fault dumps to exactly `path`
    pub fn file(path: impl AsRef<Path>) -> Self
    {
        Self::new(DumpTarget::File(path.as_ref().to_path_buf()))
    }

    /// Set the file name prefix (directory targets only)
    #[must_use]
    pub fn with_prefix(mut self, new_prefix: impl Into<String>) -> Self
    {
        if let DumpTarget::Directory { prefix, .. } = &mut self.target {
            *prefix = new_prefix.into();
        }
        self
    }

    /// Toggle the `_{unix_seconds}` suffix (directory targets only)
    #[must_use]
    pub fn with_timestamp(mut self, enabled: bool) -> Self
    {
        if let DumpTarget::Directory { append_timestamp, .. } = &mut self.target {
            *append_timestamp = enabled;
        }
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: CaptureLimits) -> Self
    {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_pre_dump(mut self, callback: PreDumpCallback) -> Self
    {
        self.pre_dump = Some(callback);
        self
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_default_limits_are_valid()
    {
        assert!(CaptureLimits::default().validate().is_ok());
    }

    #[test]
    fn test_zero_limits_are_rejected()
    {
        let limits = CaptureLimits::default().with_max_threads(0);
        assert!(matches!(limits.validate(), Err(CaptureError::InvalidArgument(_))));
    }

    #[test]
    fn test_oversized_stack_pool_is_rejected()
    {
        let limits = CaptureLimits::default()
            .with_max_threads(1 << 16)
            .with_max_stack_bytes(1 << 20);
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_prefix_only_applies_to_directory_targets()
    {
        let config = HandlerConfig::file("/tmp/a.dmp").with_prefix("ignored");
        assert_eq!(config.target, DumpTarget::File(PathBuf::from("/tmp/a.dmp")));

        let config = HandlerConfig::new(DumpTarget::directory("/tmp")).with_prefix("app").with_timestamp(false);
        assert_eq!(
            config.target,
            DumpTarget::Directory {
                dir: PathBuf::from("/tmp"),
                prefix: "app".to_string(),
                append_timestamp: false,
            }
        );
    }
}
