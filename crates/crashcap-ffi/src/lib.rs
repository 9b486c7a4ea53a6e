//! # crashcap C ABI
//!
//! The boundary between a host application (Swift, Kotlin, C, ...) and the
//! capture engine. It is built as a `cdylib`, a `staticlib` and an `rlib`;
//! the matching declarations are in `include/crashcap.h`.
//!
//! ## Conventions
//!
//! - Writers are referred to by opaque [`CrashcapHandle`] tokens, never pointers
//! - Fallible calls return a [`CrashcapResult`]; a non-null message must be
//!   released with [`crashcap_free_message`]
//! - Paths are NUL-terminated UTF-8
//! - No panic crosses the boundary: each entry point catches unwinds and
//!   reports them as a failure
//!
//! ## Why unsafe code is needed
//!
//! Exported symbols (`#[no_mangle]`) and reading C strings from raw pointers
//! cannot be expressed in safe Rust. Everything past argument decoding is the
//! safe `crashcap-core` API.

#![allow(unsafe_code)]

mod handles;
mod result;

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use crashcap_core::error::{CaptureError, CaptureResult};
use crashcap_core::handler;
use crashcap_core::writer::Writer;
use crashcap_utils::{LogFormat, LogGuard};
use once_cell::sync::OnceCell;

pub use handles::CrashcapHandle;
pub use result::CrashcapResult;

/// Value returned by [`crashcap_test`]
pub const CRASHCAP_TEST_SENTINEL: c_int = 1;

/// Keeps file logging alive for the rest of the process
static LOG_GUARD: OnceCell<LogGuard> = OnceCell::new();

/// Run `body`, turning a panic into a failed result
fn guarded(name: &'static str, body: impl FnOnce() -> CrashcapResult) -> CrashcapResult
{
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
        tracing::error!(entry_point = name, "Panic caught at FFI boundary");
        CrashcapResult::failure(format!("internal error in {name}"))
    })
}

/// Decode a C path argument
///
/// # Safety
///
/// `raw` must be null or point to a NUL-terminated string that stays valid for the call.
unsafe fn path_arg(raw: *const c_char, what: &str) -> CaptureResult<PathBuf>
{
    if raw.is_null() {
        return Err(CaptureError::InvalidArgument(format!("{what} is null")));
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract
    let text = unsafe { CStr::from_ptr(raw) }
        .to_str()
        .map_err(|_| CaptureError::InvalidArgument(format!("{what} is not valid UTF-8")))?;
    if text.is_empty() {
        return Err(CaptureError::InvalidArgument(format!("{what} is empty")));
    }
    Ok(PathBuf::from(text))
}

/// Create a writer
///
/// Returns a non-zero handle, or 0 when this platform cannot capture.
#[no_mangle]
pub extern "C" fn crashcap_create() -> CrashcapHandle
{
    panic::catch_unwind(|| match Writer::create() {
        Ok(writer) => {
            let handle = handles::table().insert(writer);
            tracing::debug!(handle, "Writer handle created");
            handle
        }
        Err(error) => {
            tracing::error!(%error, "crashcap_create failed");
            0
        }
    })
    .unwrap_or(0)
}

/// Release a writer; a second call with the same handle fails with a use-after-free message
#[no_mangle]
pub extern "C" fn crashcap_free(handle: CrashcapHandle) -> CrashcapResult
{
    guarded("crashcap_free", || handles::table().free(handle).into())
}

/// Install process-wide fault handlers writing to exactly `dump_path`
///
/// # Safety
///
/// `dump_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crashcap_install_handlers(dump_path: *const c_char) -> CrashcapResult
{
    guarded("crashcap_install_handlers", || {
        // SAFETY: forwarded caller contract
        let result = unsafe { path_arg(dump_path, "dump path") }.and_then(handler::install_at);
        result.into()
    })
}

/// Restore the signal handlers that were in place before install; always succeeds
#[no_mangle]
pub extern "C" fn crashcap_uninstall_handlers() -> CrashcapResult
{
    guarded("crashcap_uninstall_handlers", || {
        handler::uninstall();
        CrashcapResult::ok()
    })
}

/// Give the calling thread an alternate signal stack large enough for a fault dump
///
/// Call it at the start of every host thread that should produce dumps.
#[no_mangle]
pub extern "C" fn crashcap_register_current_thread() -> CrashcapResult
{
    guarded("crashcap_register_current_thread", || {
        handler::register_current_thread().into()
    })
}

/// Dump the current process to `path`
///
/// # Safety
///
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crashcap_write_dump(handle: CrashcapHandle, path: *const c_char) -> CrashcapResult
{
    guarded("crashcap_write_dump", || {
        // SAFETY: forwarded caller contract
        let result = unsafe { path_arg(path, "dump path") }
            .and_then(|path| handles::table().with_writer(handle, |writer| writer.write_dump(&path)));
        result.into()
    })
}

/// Dump the current process with a host-supplied exception record
///
/// # Safety
///
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crashcap_write_dump_with_exception(
    handle: CrashcapHandle,
    path: *const c_char,
    exception_kind: u32,
    exception_code: u64,
    exception_address: u64,
) -> CrashcapResult
{
    guarded("crashcap_write_dump_with_exception", || {
        // SAFETY: forwarded caller contract
        let result = unsafe { path_arg(path, "dump path") }.and_then(|path| {
            handles::table().with_writer(handle, |writer| {
                writer.write_dump_with_exception(&path, exception_kind, exception_code, exception_address)
            })
        });
        result.into()
    })
}

/// Release a message returned in a [`CrashcapResult`]; null is ignored
///
/// # Safety
///
/// `message` must be null or a pointer from a `CrashcapResult` that has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn crashcap_free_message(message: *mut c_char)
{
    if !message.is_null() {
        // SAFETY: allocated by CString::into_raw in this library, freed once per the contract
        drop(unsafe { std::ffi::CString::from_raw(message) });
    }
}

/// Send engine logs to a file, leaving the host's stdout and stderr alone
///
/// A null `log_path` uses `~/.crashcap/YYYY-MM-DD-crashcap.log`. Only the
/// first successful call takes effect.
///
/// # Safety
///
/// `log_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn crashcap_init_logging(log_path: *const c_char) -> CrashcapResult
{
    guarded("crashcap_init_logging", || {
        let path = if log_path.is_null() {
            None
        } else {
            // SAFETY: forwarded caller contract
            match unsafe { path_arg(log_path, "log path") } {
                Ok(path) => Some(path),
                Err(error) => return CrashcapResult::failure(error),
            }
        };
        if LOG_GUARD.get().is_some() {
            return CrashcapResult::warning("logging is already initialized");
        }
        match crashcap_utils::init_logging_file_only(path, LogFormat::Pretty, None) {
            Ok((guard, path)) => {
                let _ = LOG_GUARD.set(guard);
                tracing::info!(path = %path.display(), "FFI logging initialized");
                CrashcapResult::ok()
            }
            Err(error) => CrashcapResult::failure(error),
        }
    })
}

/// Liveness check: always returns 1
#[no_mangle]
pub extern "C" fn crashcap_test() -> c_int
{
    CRASHCAP_TEST_SENTINEL
}

/// Whether the `crashcap_trigger_*` functions are compiled in (debug builds)
#[no_mangle]
pub extern "C" fn crashcap_has_fault_triggers() -> bool
{
    cfg!(debug_assertions)
}

/// Deliberate faults for exercising installed handlers
///
/// These do not return when the fault terminates the process.
#[cfg(debug_assertions)]
mod triggers
{
    use crashcap_core::triggers;

    #[no_mangle]
    pub extern "C" fn crashcap_trigger_segfault()
    {
        triggers::trigger_segfault();
    }

    #[no_mangle]
    pub extern "C" fn crashcap_trigger_abort()
    {
        triggers::trigger_abort();
    }

    #[no_mangle]
    pub extern "C" fn crashcap_trigger_bus_error()
    {
        triggers::trigger_bus_error();
    }

    #[no_mangle]
    pub extern "C" fn crashcap_trigger_divide_by_zero()
    {
        triggers::trigger_divide_by_zero();
    }

    #[no_mangle]
    pub extern "C" fn crashcap_trigger_illegal_instruction()
    {
        triggers::trigger_illegal_instruction();
    }

    #[no_mangle]
    pub extern "C" fn crashcap_trigger_stack_overflow()
    {
        triggers::trigger_stack_overflow();
    }

    #[no_mangle]
    pub extern "C" fn crashcap_trigger_breakpoint()
    {
        triggers::trigger_breakpoint();
    }
}

#[cfg(debug_assertions)]
pub use triggers::*;
