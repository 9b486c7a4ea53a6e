//! # Handler Registry
//!
//! Installs the process-wide fault handler.
//!
//! At most one handler set exists per process. Its state lives behind the
//! [`INSTALLED`] slot: everything the fault path needs (snapshot storage, the
//! system description, the prepared dump path, the saved signal actions) is
//! allocated by [`install`] and published through one atomic pointer, so the
//! handler itself never allocates or locks.
//!
//! ## Preconditions
//!
//! [`install`] and [`uninstall`] are single-writer: the host must not call
//! them concurrently with each other. Call [`uninstall`] on the thread that
//! installed, since only that thread's alternate signal stack is replaced.
//!
//! ## Other threads
//!
//! The handler runs on whatever alternate stack the faulting thread has.
//! Threads started by the Rust runtime get a small one (a few pages), and a
//! fault on such a thread can overflow it before the dump is written. Call
//! [`register_current_thread`] at the start of every thread that should
//! produce dumps; it may be called before or after [`install`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use crashcap_core::config::{DumpTarget, HandlerConfig};
//! use crashcap_core::handler;
//!
//! handler::install(HandlerConfig::new(DumpTarget::directory("/tmp/dumps")))?;
//! // ... run the application ...
//! handler::uninstall();
//! # Ok::<(), crashcap_core::error::CaptureError>(())
//! ```

mod signals;
mod target;

use std::cell::RefCell;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use signals::{AltStack, PreviousActions};
use target::FaultTarget;

pub use signals::{ALT_STACK_SIZE, HANDLED_SIGNALS};

use crate::capture::CaptureBackend;
use crate::config::{HandlerConfig, PreDumpCallback};
use crate::error::{CaptureError, CaptureResult};
use crate::fixed::FixedPath;
use crate::platform::NativeBackend;
use crate::snapshot::{SnapshotStorage, SystemSnapshot};

/// Everything the fault path uses, reserved at install time
pub(crate) struct Installed
{
    storage: SnapshotStorage,
    system: SystemSnapshot,
    target: FaultTarget,
    /// Dump path of the fault being handled
    path: FixedPath,
    pre_dump: Option<PreDumpCallback>,
    previous: PreviousActions,
    /// Kept alive for as long as the handlers may run on it
    _altstack: Option<AltStack>,
}

/// The installed handler set, or null
static INSTALLED: AtomicPtr<Installed> = AtomicPtr::new(ptr::null_mut());

/// One-shot latch taken by the first fault
static HANDLING: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Stack from [`register_current_thread`], released when the thread exits
    static THREAD_ALTSTACK: RefCell<Option<AltStack>> = const { RefCell::new(None) };
}

/// Install fault handlers writing dumps as described by `config`
///
/// # Errors
///
/// - [`CaptureError::AlreadyInstalled`] if a handler set is active
/// - [`CaptureError::UnsupportedPlatform`] without a capture backend
/// - [`CaptureError::InvalidArgument`] for unusable limits or paths
/// - [`CaptureError::Io`] if the dump directory cannot be created
pub fn install(config: HandlerConfig) -> CaptureResult<()>
{
    NativeBackend::ensure_supported()?;
    if is_installed() {
        return Err(CaptureError::AlreadyInstalled);
    }
    config.limits.validate()?;

    let target = FaultTarget::prepare(&config.target)?;
    let installed = Box::new(Installed {
        storage: SnapshotStorage::new(&config.limits),
        system: NativeBackend::system_snapshot(),
        target,
        path: FixedPath::new(),
        pre_dump: config.pre_dump,
        previous: signals::current_actions()?,
        _altstack: AltStack::install()?,
    });

    // Published before the actions change so the first fault finds it
    let installed = Box::into_raw(installed);
    if INSTALLED
        .compare_exchange(ptr::null_mut(), installed, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // SAFETY: never published, still uniquely ours
        drop(unsafe { Box::from_raw(installed) });
        return Err(CaptureError::AlreadyInstalled);
    }
    HANDLING.store(false, Ordering::Release);

    if let Err(error) = signals::register() {
        uninstall();
        return Err(error);
    }

    tracing::info!(
        target = ?config.target,
        max_threads = config.limits.max_threads,
        max_stack_bytes = config.limits.max_stack_bytes,
        "Crash handlers installed"
    );
    Ok(())
}

/// Install handlers that always write to exactly `path`
pub fn install_at(path: impl AsRef<Path>) -> CaptureResult<()>
{
    install(HandlerConfig::file(path))
}

/// Restore the signal actions and alternate stack that were in place before [`install`]
///
/// Does nothing when no handler set is installed.
pub fn uninstall()
{
    let current = INSTALLED.load(Ordering::Acquire);
    if current.is_null() {
        return;
    }
    // SAFETY: published by install and only freed below
    signals::restore(unsafe { &(*current).previous });

    let installed = INSTALLED.swap(ptr::null_mut(), Ordering::AcqRel);
    if !installed.is_null() {
        // SAFETY: the slot owned this allocation and no longer refers to it
        drop(unsafe { Box::from_raw(installed) });
    }
    HANDLING.store(false, Ordering::Release);
    tracing::info!("Crash handlers uninstalled");
}

/// Whether a handler set is currently installed
pub fn is_installed() -> bool
{
    !INSTALLED.load(Ordering::Acquire).is_null()
}

/// Give the calling thread an alternate signal stack of [`ALT_STACK_SIZE`] bytes
///
/// Does nothing if the thread already has one at least that large. The
/// stack is unregistered and unmapped when the thread exits.
///
/// # Errors
///
/// [`CaptureError::CaptureFailed`] if the stack cannot be mapped or registered.
pub fn register_current_thread() -> CaptureResult<()>
{
    THREAD_ALTSTACK.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = AltStack::install()?;
            if slot.is_some() {
                tracing::debug!("Alternate signal stack registered for this thread");
            }
        }
        Ok(())
    })
}
