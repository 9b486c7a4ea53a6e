//! The result struct returned by every fallible entry point.

use std::ffi::CString;
use std::fmt::Display;
use std::os::raw::c_char;
use std::ptr;

use crashcap_core::error::CaptureResult;
use crashcap_core::writer::{DumpReport, DumpStatus};

/// Outcome of an FFI call
///
/// - success, `message` null: done
/// - success, `message` set: done with a warning (partial dump)
/// - failure: `message` describes the error
///
/// A non-null `message` is owned by the caller and must be released exactly
/// once with `crashcap_free_message`.
#[repr(C)]
#[derive(Debug)]
pub struct CrashcapResult
{
    pub success: bool,
    pub message: *mut c_char,
}

impl CrashcapResult
{
    pub(crate) fn ok() -> Self
    {
        Self {
            success: true,
            message: ptr::null_mut(),
        }
    }

    pub(crate) fn warning(message: impl Display) -> Self
    {
        Self {
            success: true,
            message: into_c_message(message),
        }
    }

    pub(crate) fn failure(message: impl Display) -> Self
    {
        Self {
            success: false,
            message: into_c_message(message),
        }
    }
}

impl From<CaptureResult<()>> for CrashcapResult
{
    fn from(result: CaptureResult<()>) -> Self
    {
        match result {
            Ok(()) => CrashcapResult::ok(),
            Err(error) => CrashcapResult::failure(error),
        }
    }
}

impl From<CaptureResult<DumpReport>> for CrashcapResult
{
    fn from(result: CaptureResult<DumpReport>) -> Self
    {
        match result {
            Ok(report) => match report.status() {
                DumpStatus::Complete => CrashcapResult::ok(),
                DumpStatus::Partial(missing) => {
                    let names: Vec<&str> = missing.iter_names().map(|(name, _)| name).collect();
                    CrashcapResult::warning(format!(
                        "Minidump written to {} with missing state: {}",
                        report.path.display(),
                        names.join(", ")
                    ))
                }
            },
            Err(error) => CrashcapResult::failure(error),
        }
    }
}

/// Heap copy of `message` for the caller; interior NULs become spaces
fn into_c_message(message: impl Display) -> *mut c_char
{
    let text = message.to_string().replace('\0', " ");
    CString::new(text).map_or(ptr::null_mut(), CString::into_raw)
}
