//! Opaque handle table.
//!
//! Hosts hold a 64-bit token instead of a pointer. Tokens come from a
//! counter and are never reused, so any issued token that is no longer live
//! has been freed: a stale handle is reported as
//! [`CaptureError::UseAfterFree`] instead of touching freed memory, and the
//! table only holds the writers that are still alive.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crashcap_core::error::{CaptureError, CaptureResult};
use crashcap_core::writer::Writer;
use once_cell::sync::Lazy;

/// Token handed to C callers; 0 is never valid
pub type CrashcapHandle = u64;

#[derive(Default)]
pub(crate) struct HandleTable
{
    /// Highest token issued so far
    last: CrashcapHandle,
    live: HashMap<CrashcapHandle, Writer>,
}

static HANDLES: Lazy<Mutex<HandleTable>> = Lazy::new(|| Mutex::new(HandleTable::default()));

/// Lock the process-wide table
///
/// A panic while the lock was held cannot leave an entry half-updated, so a
/// poisoned lock is simply taken over.
pub(crate) fn table() -> MutexGuard<'static, HandleTable>
{
    HANDLES.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HandleTable
{
    pub(crate) fn insert(&mut self, writer: Writer) -> CrashcapHandle
    {
        self.last += 1;
        self.live.insert(self.last, writer);
        self.last
    }

    /// Run `f` on the writer behind `handle`
    pub(crate) fn with_writer<T>(
        &mut self,
        handle: CrashcapHandle,
        f: impl FnOnce(&mut Writer) -> CaptureResult<T>,
    ) -> CaptureResult<T>
    {
        match self.live.get_mut(&handle) {
            Some(writer) => f(writer),
            None => Err(self.missing(handle)),
        }
    }

    /// Release the writer behind `handle`
    pub(crate) fn free(&mut self, handle: CrashcapHandle) -> CaptureResult<()>
    {
        match self.live.remove(&handle) {
            Some(writer) => {
                writer.free();
                Ok(())
            }
            None => Err(self.missing(handle)),
        }
    }

    pub(crate) fn live_count(&self) -> usize
    {
        self.live.len()
    }

    /// Error for a token with no live writer
    fn missing(&self, handle: CrashcapHandle) -> CaptureError
    {
        if handle != 0 && handle <= self.last {
            CaptureError::UseAfterFree
        } else {
            unknown(handle)
        }
    }
}

fn unknown(handle: CrashcapHandle) -> CaptureError
{
    CaptureError::InvalidArgument(format!("unknown handle {handle}"))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_tokens_are_not_reused()
    {
        let mut table = HandleTable::default();
        let first = table.insert(Writer::create().unwrap());
        table.free(first).unwrap();
        let second = table.insert(Writer::create().unwrap());
        assert_ne!(first, 0);
        assert_ne!(first, second);
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_freed_handle_reports_use_after_free()
    {
        let mut table = HandleTable::default();
        let handle = table.insert(Writer::create().unwrap());
        table.free(handle).unwrap();

        assert!(matches!(table.free(handle), Err(CaptureError::UseAfterFree)));
        let result = table.with_writer(handle, |_| Ok(()));
        assert!(matches!(result, Err(CaptureError::UseAfterFree)));
    }

    #[test]
    fn test_freed_writers_leave_nothing_behind()
    {
        let mut table = HandleTable::default();
        for _ in 0..100 {
            let handle = table.insert(Writer::create().unwrap());
            table.free(handle).unwrap();
        }
        assert_eq!(table.live_count(), 0);
        assert!(table.live.capacity() < 100);
        assert!(matches!(table.free(1), Err(CaptureError::UseAfterFree)));
        assert!(matches!(table.free(100), Err(CaptureError::UseAfterFree)));
        assert!(matches!(table.free(101), Err(CaptureError::InvalidArgument(_))));
    }

    #[test]
    fn test_unknown_handle_is_invalid_argument()
    {
        let mut table = HandleTable::default();
        assert!(matches!(table.free(0), Err(CaptureError::InvalidArgument(_))));
        assert!(matches!(table.with_writer(42, |_| Ok(())), Err(CaptureError::InvalidArgument(_))));
    }
}
