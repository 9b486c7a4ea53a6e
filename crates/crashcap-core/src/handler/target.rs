//! Dump file naming inside the fault handler.
//!
//! Everything that can fail (directory creation, path encoding, length) is
//! checked at install time. The handler only appends the signal name and the
//! timestamp into a [`FixedPath`].

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::config::DumpTarget;
use crate::error::{CaptureError, CaptureResult};
use crate::fixed::FixedPath;

/// Install-time form of a [`DumpTarget`]
pub(crate) enum FaultTarget
{
    File(FixedPath),
    /// `{dir}/{prefix}_`, completed per fault
    Directory
    {
        stem: FixedPath,
        append_timestamp: bool,
    },
}

impl FaultTarget
{
    /// Validate `target` and create its directory
    pub(crate) fn prepare(target: &DumpTarget) -> CaptureResult<Self>
    {
        let prepared = match target {
            DumpTarget::File(path) => FaultTarget::File(fixed_path(path)?),
            DumpTarget::Directory {
                dir,
                prefix,
                append_timestamp,
            } => {
                if prefix.contains('/') {
                    return Err(CaptureError::InvalidArgument(format!("dump prefix {prefix:?} contains '/'")));
                }
                std::fs::create_dir_all(dir).map_err(|source| CaptureError::io(dir, source))?;
                let mut stem = fixed_path(dir)?;
                stem.push_bytes(b"/").push_bytes(prefix.as_bytes()).push_bytes(b"_");
                FaultTarget::Directory {
                    stem,
                    append_timestamp: *append_timestamp,
                }
            }
        };

        // The longest name the handler can produce must still fit
        let mut longest = FixedPath::new();
        prepared.write_path(libc::SIGSEGV, u64::MAX, &mut longest);
        if longest.as_c_str().is_none() {
            return Err(CaptureError::InvalidArgument(format!("dump path {target:?} is too long")));
        }
        Ok(prepared)
    }

    /// Write the full path of the dump for `signo` raised at `unix_seconds` into `out`
    ///
    /// `out` is overwritten. The handler passes a buffer reserved at install
    /// time, so no path is ever built on the signal stack.
    pub(crate) fn write_path(&self, signo: i32, unix_seconds: u64, out: &mut FixedPath)
    {
        out.clear();
        match self {
            FaultTarget::File(path) => {
                out.push_bytes(path.as_bytes());
            }
            FaultTarget::Directory {
                stem,
                append_timestamp,
            } => {
                out.push_bytes(stem.as_bytes()).push_bytes(signal_name(signo));
                if *append_timestamp {
                    out.push_bytes(b"_").push_decimal(unix_seconds);
                }
                out.push_bytes(b".dmp");
            }
        }
    }
}

/// Lowercase signal name used in generated file names
pub(crate) fn signal_name(signo: i32) -> &'static [u8]
{
    match signo {
        libc::SIGSEGV => b"sigsegv",
        libc::SIGBUS => b"sigbus",
        libc::SIGABRT => b"sigabrt",
        libc::SIGFPE => b"sigfpe",
        libc::SIGILL => b"sigill",
        libc::SIGTRAP => b"sigtrap",
        _ => b"signal",
    }
}

fn fixed_path(path: &Path) -> CaptureResult<FixedPath>
{
    FixedPath::from_bytes(path.as_os_str().as_bytes()).ok_or_else(|| {
        CaptureError::InvalidArgument(format!("dump path {} is empty, too long or contains NUL", path.display()))
    })
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn path_for(target: &FaultTarget, signo: i32, unix_seconds: u64) -> FixedPath
    {
        let mut path = FixedPath::new();
        target.write_path(signo, unix_seconds, &mut path);
        path
    }

    #[test]
    fn test_directory_names_include_signal_and_time()
    {
        let dir = tempfile::tempdir().unwrap();
        let target = DumpTarget::Directory {
            dir: dir.path().join("nested"),
            prefix: "app".to_string(),
            append_timestamp: true,
        };
        let prepared = FaultTarget::prepare(&target).unwrap();
        assert!(dir.path().join("nested").is_dir());

        let path = path_for(&prepared, libc::SIGFPE, 1_700_000_000);
        let expected = dir.path().join("nested/app_sigfpe_1700000000.dmp");
        assert_eq!(path.as_bytes(), expected.as_os_str().as_bytes());
    }

    #[test]
    fn test_timestamp_can_be_omitted()
    {
        let dir = tempfile::tempdir().unwrap();
        let target = DumpTarget::Directory {
            dir: dir.path().to_path_buf(),
            prefix: "crash".to_string(),
            append_timestamp: false,
        };
        let path = path_for(&FaultTarget::prepare(&target).unwrap(), libc::SIGABRT, 42);
        assert!(path.as_bytes().ends_with(b"/crash_sigabrt.dmp"));
    }

    #[test]
    fn test_file_target_is_used_verbatim()
    {
        let prepared = FaultTarget::prepare(&DumpTarget::File("/tmp/a.dmp".into())).unwrap();
        assert_eq!(path_for(&prepared, libc::SIGSEGV, 7).as_bytes(), b"/tmp/a.dmp");
    }

    #[test]
    fn test_reused_buffer_holds_only_the_latest_path()
    {
        let dir = tempfile::tempdir().unwrap();
        let target = DumpTarget::Directory {
            dir: dir.path().to_path_buf(),
            prefix: "app".to_string(),
            append_timestamp: true,
        };
        let prepared = FaultTarget::prepare(&target).unwrap();

        let mut path = FixedPath::new();
        prepared.write_path(libc::SIGSEGV, 1_700_000_000, &mut path);
        prepared.write_path(libc::SIGILL, 5, &mut path);
        let expected = dir.path().join("app_sigill_5.dmp");
        assert_eq!(path.as_bytes(), expected.as_os_str().as_bytes());
    }

    #[test]
    fn test_prefix_with_separator_is_rejected()
    {
        let target = DumpTarget::Directory {
            dir: std::env::temp_dir(),
            prefix: "../escape".to_string(),
            append_timestamp: true,
        };
        assert!(matches!(FaultTarget::prepare(&target), Err(CaptureError::InvalidArgument(_))));
    }

    #[test]
    fn test_overlong_path_is_rejected()
    {
        let long = "x".repeat(5000);
        assert!(FaultTarget::prepare(&DumpTarget::File(long.into())).is_err());
    }
}
