//! # Linux Capture Backend
//!
//! Capture reads everything about the process from `/proc/self` and its own
//! address space, in this order:
//!
//! 1. **Threads**: `/proc/self/task`, with stack pointer and program counter
//!    from each thread's `syscall` file (the faulting thread brings its own
//!    full context).
//! 2. **Mappings**: one pass over `/proc/self/maps` that finds stack bounds,
//!    groups file mappings into modules, and locates the memory windows.
//! 3. **Stacks**: from the stack pointer (minus the red zone) to the end of
//!    the stack mapping, capped at `max_stack_bytes`.
//! 4. **Modules**: ELF identity from the mapped image; mappings that are not
//!    ELF images are dropped.
//! 5. **Windows**: memory around the program counter and the fault address.
//!
//! Other threads are not stopped. Their stacks are read while they run, so
//! they describe the thread at some point during capture rather than at the
//! instant of the fault.
//!
//! ## Modules
//!
//! - [`context`]: `ucontext_t` to register set
//! - [`maps`]: `/proc/self/maps` line parser
//! - [`memory`]: fault-tolerant reads of our own memory
//! - [`modules`]: build-id lookup
//! - [`procfs`]: raw file access and line reading without allocation
//! - [`system`]: CPU and kernel information
//! - [`threads`]: task enumeration and blocked-thread registers

pub mod context;
pub mod maps;
pub mod memory;
pub mod modules;
pub mod procfs;
pub mod system;
pub mod threads;

use maps::{parse_maps_line, MapsEntry};
use memory::read_self;
use procfs::{LineReader, RawFile};

use crate::capture::{CaptureBackend, FaultingThread, Probes, Restricted, STACK_OVERFLOW_PROXIMITY};
use crate::error::CaptureResult;
use crate::snapshot::{Incomplete, ModuleIdentity, SnapshotStorage, SystemSnapshot, MAX_WINDOWS, WINDOW_BYTES};
use crate::types::{Address, Architecture, ContextValidity, CpuContext, RegisterSet, ThreadId};

/// Capture backend built on `/proc/self`
pub struct LinuxBackend;

impl CaptureBackend for LinuxBackend
{
    fn ensure_supported() -> CaptureResult<()>
    {
        Ok(())
    }

    fn current_thread() -> ThreadId
    {
        ThreadId(threads::current_tid())
    }

    fn current_registers() -> RegisterSet
    {
        context::current_registers()
    }

    unsafe fn signal_registers(context: *const libc::c_void) -> RegisterSet
    {
        context::from_ucontext(context.cast())
    }

    fn system_snapshot() -> SystemSnapshot
    {
        system::system_snapshot()
    }

    fn collect(scope: &mut Restricted<'_>, faulting: &FaultingThread, probes: &mut Probes)
    {
        let storage = scope.storage();
        let mut scratch = storage.take_scratch();

        collect_threads(storage, faulting, &mut scratch.io);
        let windows = walk_mappings(storage, faulting, probes, &mut scratch.io);
        capture_stacks(storage);
        identify_modules(storage, &mut scratch.header);
        for window in windows.iter().flatten() {
            storage.add_region(Address::new(window.start), window.len, read_self);
        }

        storage.restore_scratch(scratch);
    }
}

/// Faulting thread first, then every other task with whatever registers it exposes
fn collect_threads(storage: &mut SnapshotStorage, faulting: &FaultingThread, buffer: &mut [u8])
{
    if let Some(thread) = storage.add_thread(faulting.id, faulting.registers) {
        thread.is_faulting = true;
    }

    let (dirents, file_buffer) = buffer.split_at_mut(buffer.len() / 2);
    let listed = threads::for_each_task(dirents, |tid| {
        if tid == faulting.id.raw() {
            return;
        }
        let registers = threads::read_control_registers(tid, file_buffer)
            .map_or(RegisterSet::empty(), |control| control_only(control.pc, control.sp));
        // A full thread list already marked the dump
        let _ = storage.add_thread(ThreadId(tid), registers);
    });
    if !listed {
        storage.mark(Incomplete::THREAD_LIST);
    }
}

/// Mapping-clipped range to capture around an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window
{
    start: u64,
    len: usize,
}

impl Window
{
    fn around(address: u64, entry: &MapsEntry<'_>) -> Self
    {
        let half = (WINDOW_BYTES / 2) as u64;
        let start = address.saturating_sub(half).max(entry.start);
        let end = address.saturating_add(half).min(entry.end);
        Self {
            start,
            len: (end - start) as usize,
        }
    }
}

/// Module being grown from consecutive mappings of one file
struct OpenModule
{
    index: usize,
    inode: u64,
}

/// One pass over `/proc/self/maps`
///
/// Leaves each thread's stack bounds in `thread.stack.start/available`
/// for [`capture_stacks`], adds modules with unknown identity, and returns
/// the windows to capture.
fn walk_mappings(
    storage: &mut SnapshotStorage,
    faulting: &FaultingThread,
    probes: &mut Probes,
    buffer: &mut [u8],
) -> [Option<Window>; MAX_WINDOWS]
{
    let mut windows = [None; MAX_WINDOWS];
    let targets = [Some(faulting.registers.context.pc().value()), probes.fault_address.map(Address::value)];

    let Some(file) = RawFile::open(c"/proc/self/maps") else {
        storage.mark(Incomplete::MODULES);
        return windows;
    };

    let red_zone = Architecture::current().red_zone();
    let mut mapped = false;
    let mut open: Option<OpenModule> = None;
    let mut reader = LineReader::new(file, buffer);

    while let Some(line) = reader.next_line() {
        let Some(entry) = parse_maps_line(line) else {
            continue;
        };

        // Guard pages are mapped `---p`; hitting one counts as unmapped
        let accessible = entry.perms.read || entry.perms.write || entry.perms.exec;
        if accessible && probes.fault_address.is_some_and(|address| entry.contains(address.value())) {
            mapped = true;
        }
        if entry.perms.read {
            for (slot, target) in windows.iter_mut().zip(targets) {
                if let Some(address) = target.filter(|&address| entry.contains(address)) {
                    *slot = Some(Window::around(address, &entry));
                }
            }
            locate_stacks(storage, &entry, red_zone);
        }
        track_module(storage, &entry, &mut open);
    }

    if probes.fault_address.is_some() {
        probes.fault_address_mapped = Some(mapped);
    }
    windows
}

/// Record `entry` as the stack mapping of every thread whose stack pointer it holds
///
/// A stack pointer in unmapped memory (a blown guard page) falls back to the
/// first readable mapping above it within [`STACK_OVERFLOW_PROXIMITY`].
fn locate_stacks(storage: &mut SnapshotStorage, entry: &MapsEntry<'_>, red_zone: u64)
{
    for thread in storage.threads_mut() {
        if !thread.registers.has_control() || thread.stack.available != 0 {
            continue;
        }
        let sp = thread.registers.context.sp().value();
        let start = if entry.contains(sp) {
            sp.saturating_sub(red_zone).max(entry.start)
        } else if entry.start > sp && entry.start - sp <= STACK_OVERFLOW_PROXIMITY {
            entry.start
        } else {
            continue;
        };
        thread.stack.start = Address::new(start);
        thread.stack.available = entry.end - start;
    }
}

/// Start a module at an offset-0 mapping of a file (or the vDSO) and extend
/// it over the following mappings of the same file
fn track_module(storage: &mut SnapshotStorage, entry: &MapsEntry<'_>, open: &mut Option<OpenModule>)
{
    if let Some(module) = open {
        let record = &storage.modules()[module.index];
        let same_file = entry.inode == module.inode && storage.module_name(record) == entry.path;
        if same_file && entry.offset != 0 {
            let base = record.base.value();
            storage.modules_mut()[module.index].size = entry.end - base;
            return;
        }
        *open = None;
    }

    let is_vdso = entry.path == b"[vdso]";
    if entry.offset != 0 || !(entry.is_file_backed() || is_vdso) {
        return;
    }
    if storage.modules_full() {
        storage.mark(Incomplete::MODULES);
        return;
    }
    if storage
        .add_module(Address::new(entry.start), entry.len(), entry.path, ModuleIdentity::UNKNOWN)
        .is_some()
    {
        *open = Some(OpenModule {
            index: storage.modules().len() - 1,
            inode: entry.inode,
        });
    }
}

fn capture_stacks(storage: &mut SnapshotStorage)
{
    let fallback = storage.limits().max_stack_bytes as u64;
    for index in 0..storage.threads().len() {
        // Copy out the few fields used, never the register file
        let thread = &storage.threads()[index];
        let has_control = thread.registers.has_control();
        let sp = thread.registers.context.sp().value();
        let (stack_start, stack_available) = (thread.stack.start, thread.stack.available);

        if !has_control {
            storage.capture_stack(index, Address::ZERO, 0, |_, _| None);
            continue;
        }
        let (start, available) = if stack_available == 0 {
            // No mapping found; read from the stack pointer until memory runs out
            (Address::new(sp.saturating_sub(Architecture::current().red_zone())), fallback)
        } else {
            (stack_start, stack_available)
        };
        storage.capture_stack(index, start, available, read_self);
    }
}

/// Fill in module identities and drop mappings that are not ELF images
fn identify_modules(storage: &mut SnapshotStorage, buffer: &mut [u8])
{
    for index in 0..storage.modules().len() {
        let base = storage.modules()[index].base;
        let module = &mut storage.modules_mut()[index];
        match modules::identify(base, buffer) {
            Some(identity) => module.identity = identity,
            // Zero size marks the record for removal below
            None => module.size = 0,
        }
    }
    storage.retain_modules(|module| module.size != 0);
}

/// Zeroed register file with only the control registers set
fn control_only(pc: u64, sp: u64) -> RegisterSet
{
    let mut context = CpuContext::zeroed_native();
    context.set_control(pc, sp);
    RegisterSet {
        context,
        validity: ContextValidity::CONTROL,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::capture::{capture, CaptureRequest};
    use crate::config::CaptureLimits;
    use crate::snapshot::IdentitySource;

    fn capture_self(limits: &CaptureLimits) -> (SnapshotStorage, SystemSnapshot, CaptureRequest)
    {
        let storage = SnapshotStorage::new(limits);
        let system = LinuxBackend::system_snapshot();
        let request = CaptureRequest {
            thread: FaultingThread {
                id: LinuxBackend::current_thread(),
                registers: LinuxBackend::current_registers(),
            },
            fault: None,
            captured_at: 0,
        };
        (storage, system, request)
    }

    #[test]
    fn test_capture_finds_background_thread()
    {
        let (parked_tx, parked_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            parked_tx.send(threads::current_tid()).unwrap();
            done_rx.recv().unwrap();
        });
        let worker_tid = parked_rx.recv().unwrap();

        let (mut storage, system, request) = capture_self(&CaptureLimits::default());
        let snapshot = capture::<LinuxBackend>(Restricted::new(&mut storage), &request, &system);

        assert_eq!(snapshot.threads[0].id, request.thread.id);
        assert!(snapshot.threads[0].is_faulting);
        assert!(!snapshot.threads[0].stack.is_empty());
        assert!(snapshot.threads.iter().any(|thread| thread.id.raw() == worker_tid));
        assert_eq!(snapshot.threads.iter().filter(|thread| thread.is_faulting).count(), 1);

        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_capture_lists_elf_modules_in_order()
    {
        let (mut storage, system, request) = capture_self(&CaptureLimits::default());
        let snapshot = capture::<LinuxBackend>(Restricted::new(&mut storage), &request, &system);

        assert!(!snapshot.modules.is_empty());
        assert!(snapshot.modules.windows(2).all(|pair| pair[0].base < pair[1].base));
        assert!(snapshot
            .modules
            .iter()
            .all(|module| module.size > 0 && module.identity.source != IdentitySource::MachOUuid));

        let pc = request.thread.registers.context.pc().value();
        let own = snapshot
            .modules
            .iter()
            .find(|module| module.base.value() <= pc && pc < module.base.value() + module.size);
        assert!(own.is_some(), "no module contains the capturing code");
    }

    #[test]
    fn test_small_stack_cap_truncates_faulting_thread()
    {
        let limits = CaptureLimits::default().with_max_stack_bytes(256);
        let (mut storage, system, request) = capture_self(&limits);
        let snapshot = capture::<LinuxBackend>(Restricted::new(&mut storage), &request, &system);

        let thread = &snapshot.threads[0];
        assert!(thread.is_truncated());
        assert_eq!(thread.stack.len(), 256);
    }

    #[test]
    fn test_unmapped_fault_address_is_reported_unmapped()
    {
        let (mut storage, _system, request) = capture_self(&CaptureLimits::default());
        let mut probes = Probes {
            fault_address: Some(Address::new(8)),
            fault_address_mapped: None,
        };
        let mut scope = Restricted::new(&mut storage);
        LinuxBackend::collect(&mut scope, &request.thread, &mut probes);
        assert_eq!(probes.fault_address_mapped, Some(false));
    }

    #[test]
    fn test_window_is_clipped_to_mapping()
    {
        let entry = parse_maps_line(b"1000-2000 r-xp 00000000 00:00 0").unwrap();
        assert_eq!(Window::around(0x1010, &entry), Window { start: 0x1000, len: 0x90 });
        assert_eq!(Window::around(0x1800, &entry), Window { start: 0x1780, len: 0x100 });
    }
}
