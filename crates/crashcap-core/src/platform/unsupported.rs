//! Fallback backend for targets without a capture implementation.

use crate::capture::{CaptureBackend, FaultingThread, Probes, Restricted};
use crate::error::{CaptureError, CaptureResult};
use crate::snapshot::{Incomplete, SystemSnapshot};
use crate::types::{RegisterSet, ThreadId};

/// Refuses everything; `collect` records nothing
pub struct UnsupportedBackend;

impl CaptureBackend for UnsupportedBackend
{
    fn ensure_supported() -> CaptureResult<()>
    {
        Err(CaptureError::UnsupportedPlatform(concat!(
            "no capture backend for ",
            env!("CRASHCAP_TARGET_DESCRIPTION")
        )))
    }

    fn current_thread() -> ThreadId
    {
        ThreadId(0)
    }

    fn current_registers() -> RegisterSet
    {
        RegisterSet::empty()
    }

    unsafe fn signal_registers(_context: *const libc::c_void) -> RegisterSet
    {
        RegisterSet::empty()
    }

    fn system_snapshot() -> SystemSnapshot
    {
        SystemSnapshot::unknown()
    }

    fn collect(scope: &mut Restricted<'_>, faulting: &FaultingThread, _probes: &mut Probes)
    {
        let storage = scope.storage();
        if let Some(thread) = storage.add_thread(faulting.id, faulting.registers) {
            thread.is_faulting = true;
        }
        storage.mark(Incomplete::THREAD_LIST | Incomplete::MODULES);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_unsupported_backend_reports_platform()
    {
        assert!(matches!(
            UnsupportedBackend::ensure_supported(),
            Err(CaptureError::UnsupportedPlatform(_))
        ));
    }
}
