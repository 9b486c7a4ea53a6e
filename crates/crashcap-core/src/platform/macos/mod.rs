//! # macOS Capture Backend
//!
//! Capture works on our own task through Mach calls:
//!
//! 1. **Threads**: `task_threads()`; every thread except the capturing one is
//!    suspended for the rest of the capture and its registers are read with
//!    `thread_get_state()`.
//! 2. **Stacks**: the VM region holding each stack pointer, read from the
//!    stack pointer (minus the red zone) to the region end.
//! 3. **Modules**: dyld's image list, with `LC_UUID` identities.
//! 4. **Windows**: memory around the program counter and fault address.
//!
//! Threads are resumed when the capture returns, before serialization.
//!
//! ## Modules
//!
//! - [`ffi`]: Mach declarations `mach2` does not provide
//! - [`images`]: dyld image list
//! - [`memory`]: fault-tolerant reads and region lookup
//! - [`registers`]: thread state to register set
//! - [`system`]: CPU and OS version
//! - [`threads`]: enumeration and suspension

pub mod ffi;
pub mod images;
pub mod memory;
pub mod registers;
pub mod system;
pub mod threads;

use memory::{read_self, region_at_or_above, Region};
use threads::{current_thread_port, TaskThreads};

use crate::capture::{CaptureBackend, FaultingThread, Probes, Restricted, STACK_OVERFLOW_PROXIMITY};
use crate::error::CaptureResult;
use crate::snapshot::{Incomplete, SnapshotStorage, SystemSnapshot, WINDOW_BYTES};
use crate::types::{Address, Architecture, RegisterSet, ThreadId};

/// Capture backend built on Mach task and thread calls
pub struct MacOsBackend;

impl CaptureBackend for MacOsBackend
{
    fn ensure_supported() -> CaptureResult<()>
    {
        Ok(())
    }

    fn current_thread() -> ThreadId
    {
        ThreadId(current_thread_port())
    }

    fn current_registers() -> RegisterSet
    {
        registers::thread_registers(current_thread_port())
    }

    unsafe fn signal_registers(context: *const libc::c_void) -> RegisterSet
    {
        registers::signal_registers(context)
    }

    fn system_snapshot() -> SystemSnapshot
    {
        system::system_snapshot()
    }

    fn collect(scope: &mut Restricted<'_>, faulting: &FaultingThread, probes: &mut Probes)
    {
        let storage = scope.storage();
        let mut scratch = storage.take_scratch();

        if let Some(thread) = storage.add_thread(faulting.id, faulting.registers) {
            thread.is_faulting = true;
        }
        // Held until the end of collect: other threads stay stopped while
        // their stacks are copied
        let suspended = TaskThreads::suspend_others(current_thread_port());
        match &suspended {
            Some(threads) => {
                for port in threads.ports() {
                    if port == faulting.id.raw() {
                        continue;
                    }
                    let _ = storage.add_thread(ThreadId(port), registers::thread_registers(port));
                }
            }
            None => storage.mark(Incomplete::THREAD_LIST),
        }

        capture_stacks(storage);
        images::collect_images(storage, &mut scratch.header);

        if let Some(address) = probes.fault_address {
            let region = region_at_or_above(address.value());
            probes.fault_address_mapped = Some(region.is_some_and(|region| region.accessible && region.contains(address.value())));
        }
        let targets = [Some(faulting.registers.context.pc()), probes.fault_address];
        for address in targets.into_iter().flatten() {
            if let Some((start, len)) = window_around(address.value()) {
                storage.add_region(Address::new(start), len, read_self);
            }
        }

        drop(suspended);
        storage.restore_scratch(scratch);
    }
}

/// Readable region a stack pointer belongs to
///
/// A stack pointer in unmapped memory (a blown guard page) falls back to the
/// first readable region above it within [`STACK_OVERFLOW_PROXIMITY`].
fn stack_region(sp: u64) -> Option<Region>
{
    let region = region_at_or_above(sp)?;
    let usable = region.contains(sp) || region.start - sp <= STACK_OVERFLOW_PROXIMITY;
    (region.readable && usable).then_some(region)
}

fn capture_stacks(storage: &mut SnapshotStorage)
{
    let red_zone = Architecture::current().red_zone();
    let fallback = storage.limits().max_stack_bytes as u64;
    for index in 0..storage.threads().len() {
        let thread = storage.threads()[index];
        if !thread.registers.has_control() {
            storage.capture_stack(index, Address::ZERO, 0, |_, _| None);
            continue;
        }
        let sp = thread.registers.context.sp().value();
        let (start, available) = match stack_region(sp) {
            Some(region) => {
                let start = sp.saturating_sub(red_zone).max(region.start);
                (start, region.end - start)
            }
            None => (sp.saturating_sub(red_zone), fallback),
        };
        storage.capture_stack(index, Address::new(start), available, read_self);
    }
}

/// Window around `address`, clipped to its readable region
fn window_around(address: u64) -> Option<(u64, usize)>
{
    let region = region_at_or_above(address)?;
    if !region.readable || !region.contains(address) {
        return None;
    }
    let half = (WINDOW_BYTES / 2) as u64;
    let start = address.saturating_sub(half).max(region.start);
    let end = address.saturating_add(half).min(region.end);
    Some((start, (end - start) as usize))
}
