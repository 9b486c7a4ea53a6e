//! # Context Capture
//!
//! Fills a [`SnapshotStorage`] with the state of the current process.
//!
//! Capture is the part of the engine that runs inside the fault handler, so
//! everything reachable from [`capture`] follows the same rules:
//!
//! - no heap allocation (all buffers come from the storage)
//! - no locks, no formatted output, no panics
//! - every OS query may fail, and a failure only marks the snapshot
//!   [`Incomplete`]
//!
//! Those rules are carried by [`Restricted`]: backends only get to touch a
//! storage through it, and it can only be built from storage that already
//! exists.
//!
//! The OS-specific work lives behind [`CaptureBackend`], implemented once per
//! platform under [`crate::platform`].

use crate::error::CaptureResult;
use crate::snapshot::{FaultKind, FaultRecord, Incomplete, Snapshot, SnapshotStorage, SystemSnapshot, ThreadFlags};
use crate::types::{Address, ProcessId, RegisterSet, ThreadId};

/// Distance below the stack pointer that still counts as running off the stack
pub const STACK_OVERFLOW_PROXIMITY: u64 = 64 * 1024;

/// Capability to run a capture over pre-reserved storage
///
/// Holding a `Restricted` means the storage is exclusively ours for the
/// duration of the capture. It exposes nothing that allocates.
pub struct Restricted<'s>
{
    storage: &'s mut SnapshotStorage,
}

impl<'s> Restricted<'s>
{
    /// Take exclusive use of `storage` for one capture
    ///
    /// The previous capture held by the storage is discarded.
    pub fn new(storage: &'s mut SnapshotStorage) -> Self
    {
        storage.reset();
        Self { storage }
    }

    pub fn storage(&mut self) -> &mut SnapshotStorage
    {
        self.storage
    }

    fn into_storage(self) -> &'s mut SnapshotStorage
    {
        self.storage
    }
}

/// The thread that faulted, or asked for the dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultingThread
{
    pub id: ThreadId,
    /// Full register state from the signal context or `getcontext`
    pub registers: RegisterSet,
}

/// What the backend learned about the fault address while walking mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Probes
{
    /// Address to look up, usually `FaultRecord::address`
    pub fault_address: Option<Address>,
    /// Set by the backend: whether `fault_address` lies in an accessible mapping
    pub fault_address_mapped: Option<bool>,
}

/// One capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest
{
    pub thread: FaultingThread,
    pub fault: Option<FaultRecord>,
    /// Seconds since the Unix epoch, written to the dump header
    pub captured_at: u32,
}

/// Platform half of a capture
///
/// `collect` runs in signal context; the other functions only run on the
/// healthy path (install time or the on-demand writer).
pub trait CaptureBackend
{
    /// Fail with `UnsupportedPlatform` when this target has no real backend
    fn ensure_supported() -> CaptureResult<()>;

    /// OS identifier of the calling thread
    fn current_thread() -> ThreadId;

    /// Register state of the calling thread, for on-demand dumps
    fn current_registers() -> RegisterSet;

    /// Register state saved by the kernel for an `SA_SIGINFO` handler
    ///
    /// # Safety
    ///
    /// `context` must be the third handler argument of the signal being
    /// handled on this thread.
    unsafe fn signal_registers(context: *const libc::c_void) -> RegisterSet;

    /// Query architecture, CPU and OS version
    fn system_snapshot() -> SystemSnapshot;

    /// Enumerate threads, stacks, modules and fault windows into `scope`
    ///
    /// `faulting` must end up as the first thread, flagged `is_faulting`.
    fn collect(scope: &mut Restricted<'_>, faulting: &FaultingThread, probes: &mut Probes);
}

/// Run `B` over `scope` and borrow the result as a [`Snapshot`]
///
/// `request.fault` is reclassified as [`FaultKind::StackOverflow`] when a
/// SIGSEGV hit unmapped memory just below the faulting stack pointer.
pub fn capture<'s, B: CaptureBackend>(
    mut scope: Restricted<'s>,
    request: &CaptureRequest,
    system: &'s SystemSnapshot,
) -> Snapshot<'s>
{
    let mut probes = Probes {
        fault_address: request.fault.map(|fault| fault.address),
        fault_address_mapped: None,
    };
    B::collect(&mut scope, &request.thread, &mut probes);

    let storage = scope.into_storage();
    finish(storage);

    let fault = request
        .fault
        .map(|fault| classify(fault, request.thread.registers.context.sp(), probes.fault_address_mapped));
    let storage: &'s SnapshotStorage = storage;
    storage.snapshot(ProcessId::current(), request.captured_at, fault, system)
}

/// Sort modules and derive the thread-state flags
fn finish(storage: &mut SnapshotStorage)
{
    storage.modules_mut().sort_unstable_by_key(|module| module.base);

    let mut missing_state = false;
    for thread in storage.threads_mut() {
        if !thread.registers.has_control() {
            thread.flags |= ThreadFlags::NO_CONTEXT;
        }
        missing_state |= thread.flags.contains(ThreadFlags::NO_CONTEXT);
    }
    if missing_state {
        storage.mark(Incomplete::THREAD_STATE);
    }
}

/// Apply the stack-overflow heuristic to a signal fault
pub fn classify(mut fault: FaultRecord, sp: Address, fault_address_mapped: Option<bool>) -> FaultRecord
{
    let near_stack = sp.value().abs_diff(fault.address.value()) <= STACK_OVERFLOW_PROXIMITY;
    if fault.kind == FaultKind::Segfault && fault_address_mapped == Some(false) && near_stack {
        fault.kind = FaultKind::StackOverflow;
    }
    fault
}
