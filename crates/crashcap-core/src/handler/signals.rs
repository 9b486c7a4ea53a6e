//! # Signal Plumbing
//!
//! Registration of the fault handler, the alternate signal stack it runs on,
//! and the handler itself.
//!
//! The handler runs with every handled signal masked. It only touches the
//! state published through [`INSTALLED`](super::INSTALLED) and calls
//! async-signal-safe functions: `open`, `write`, `fsync`, `close`,
//! `clock_gettime`, `sigaction` and `tgkill` / `pthread_kill`.

use std::mem::{self, ManuallyDrop};
use std::ptr;
use std::sync::atomic::Ordering;

use libc::{c_int, c_void, siginfo_t};
use memmap2::MmapMut;

use super::{Installed, HANDLING, INSTALLED};
use crate::capture::{capture, CaptureBackend, CaptureRequest, FaultingThread, Restricted};
use crate::error::{CaptureError, CaptureResult};
use crate::platform::NativeBackend;
use crate::serializer::{serialize, FdSink};
use crate::snapshot::FaultRecord;
use crate::types::Address;

/// Signals that produce a dump
pub const HANDLED_SIGNALS: [c_int; 6] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGTRAP,
];

/// Room for capture on top of what the OS needs to deliver a signal
pub const ALT_STACK_SIZE: usize = 64 * 1024 + libc::SIGSTKSZ;

/// Actions that were in place before ours, in [`HANDLED_SIGNALS`] order
pub(crate) type PreviousActions = [libc::sigaction; HANDLED_SIGNALS.len()];

/// Read the current action of every handled signal
pub(crate) fn current_actions() -> CaptureResult<PreviousActions>
{
    // SAFETY: an all-zero sigaction is SIG_DFL with an empty mask
    let mut actions: PreviousActions = unsafe { mem::zeroed() };
    for (signo, action) in HANDLED_SIGNALS.into_iter().zip(actions.iter_mut()) {
        // SAFETY: `action` is a valid out-pointer
        if unsafe { libc::sigaction(signo, ptr::null(), action) } != 0 {
            return Err(sigaction_failed(signo));
        }
    }
    Ok(actions)
}

/// Point every handled signal at [`handle_signal`]
pub(crate) fn register() -> CaptureResult<()>
{
    // SAFETY: zeroed is a valid starting value; every field used is set below
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    // SAFETY: `sa_mask` is a valid sigset_t
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        for signo in HANDLED_SIGNALS {
            libc::sigaddset(&mut action.sa_mask, signo);
        }
    }
    action.sa_sigaction = handle_signal as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;

    for signo in HANDLED_SIGNALS {
        // SAFETY: `action` is fully initialized
        if unsafe { libc::sigaction(signo, &action, ptr::null_mut()) } != 0 {
            return Err(sigaction_failed(signo));
        }
    }
    Ok(())
}

/// Put back the actions saved at install time
///
/// A signal whose old action cannot be restored falls back to `SIG_DFL`.
pub(crate) fn restore(previous: &PreviousActions)
{
    for (signo, action) in HANDLED_SIGNALS.into_iter().zip(previous) {
        // SAFETY: `action` came from sigaction()
        if unsafe { libc::sigaction(signo, action, ptr::null_mut()) } != 0 {
            reset_to_default(signo);
        }
    }
}

fn reset_to_default(signo: c_int)
{
    // SAFETY: SIG_DFL is always a valid disposition
    unsafe {
        libc::signal(signo, libc::SIG_DFL);
    }
}

fn sigaction_failed(signo: c_int) -> CaptureError
{
    CaptureError::CaptureFailed(format!(
        "sigaction({signo}) failed: {}",
        std::io::Error::last_os_error()
    ))
}

/// Alternate signal stack registered for one thread
///
/// Dropping it on the owning thread restores the previous alternate stack
/// when ours is still the active one, then unmaps it. Dropped on any other
/// thread, the mapping is left in place since the owner may still deliver
/// signals onto it.
pub(crate) struct AltStack
{
    memory: ManuallyDrop<MmapMut>,
    previous: libc::stack_t,
    owner: libc::pthread_t,
}

impl AltStack
{
    /// Map and register a stack, unless the thread already has one big enough
    pub(crate) fn install() -> CaptureResult<Option<Self>>
    {
        // SAFETY: zeroed stack_t is a valid out-parameter
        let mut previous: libc::stack_t = unsafe { mem::zeroed() };
        // SAFETY: query only
        if unsafe { libc::sigaltstack(ptr::null(), &mut previous) } != 0 {
            return Err(altstack_failed());
        }
        if previous.ss_flags & libc::SS_DISABLE == 0 && previous.ss_size >= ALT_STACK_SIZE {
            return Ok(None);
        }

        let mut memory = MmapMut::map_anon(ALT_STACK_SIZE).map_err(|error| {
            CaptureError::CaptureFailed(format!("failed to map the alternate signal stack: {error}"))
        })?;
        let stack = libc::stack_t {
            ss_sp: memory.as_mut_ptr().cast(),
            ss_flags: 0,
            ss_size: memory.len(),
        };
        // SAFETY: `stack` describes a live read-write mapping owned by the returned value
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(altstack_failed());
        }
        Ok(Some(Self {
            memory: ManuallyDrop::new(memory),
            previous,
            // SAFETY: pthread_self has no preconditions
            owner: unsafe { libc::pthread_self() },
        }))
    }
}

impl Drop for AltStack
{
    fn drop(&mut self)
    {
        // SAFETY: pthread_self has no preconditions
        if unsafe { libc::pthread_self() } != self.owner {
            return;
        }
        // SAFETY: zeroed stack_t is a valid out-parameter
        let mut current: libc::stack_t = unsafe { mem::zeroed() };
        // SAFETY: query only
        if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
            return;
        }

        // At thread exit the runtime may already have disabled it
        let registered =
            current.ss_flags & libc::SS_DISABLE == 0 && current.ss_sp == self.memory.as_mut_ptr().cast::<c_void>();
        if registered {
            let restore = if self.previous.ss_flags & libc::SS_DISABLE == 0 {
                self.previous
            } else {
                // SAFETY: zeroed stack_t plus SS_DISABLE is a valid argument
                let mut disable: libc::stack_t = unsafe { mem::zeroed() };
                disable.ss_flags = libc::SS_DISABLE;
                disable
            };
            // SAFETY: `restore` is either the old stack or a disable request
            if unsafe { libc::sigaltstack(&restore, ptr::null_mut()) } != 0 {
                return;
            }
        }
        // SAFETY: the mapping is no longer registered with the kernel
        unsafe { ManuallyDrop::drop(&mut self.memory) };
    }
}

fn altstack_failed() -> CaptureError
{
    CaptureError::CaptureFailed(format!("sigaltstack failed: {}", std::io::Error::last_os_error()))
}

/// The installed `SA_SIGINFO` handler
extern "C" fn handle_signal(signo: c_int, info: *mut siginfo_t, context: *mut c_void)
{
    let installed = INSTALLED.load(Ordering::Acquire);
    // A second fault (on any thread) while a dump is in progress gets the default action
    if installed.is_null() || HANDLING.swap(true, Ordering::AcqRel) {
        debug_print(b"crashcap: fault while not armed, using default action\n");
        reset_to_default(signo);
        // SAFETY: `info` is the kernel-provided siginfo for this signal
        if unsafe { needs_reraise(signo, info) } {
            reraise(signo);
        }
        return;
    }

    // SAFETY: the latch gives this thread exclusive use of the installed
    // state, and uninstall is not called concurrently with a fault
    let installed = unsafe { &mut *installed };
    // SAFETY: arguments come straight from the kernel
    unsafe { write_fault_dump(installed, signo, info, context) };

    restore(&installed.previous);
    // SAFETY: as above
    if unsafe { needs_reraise(signo, info) } {
        reraise(signo);
    }
}

/// Capture and serialize straight to the dump file
///
/// # Safety
///
/// `info` and `context` must be the handler arguments of `signo`.
unsafe fn write_fault_dump(installed: &mut Installed, signo: c_int, info: *const siginfo_t, context: *const c_void)
{
    debug_print(b"crashcap: fault intercepted, writing dump\n");
    if let Some(callback) = installed.pre_dump {
        callback();
    }

    let (si_code, address) = if info.is_null() {
        (0, 0)
    } else {
        ((*info).si_code, fault_address(info))
    };
    let request = CaptureRequest {
        thread: FaultingThread {
            id: NativeBackend::current_thread(),
            registers: NativeBackend::signal_registers(context),
        },
        fault: Some(FaultRecord::from_signal(signo, si_code, Address::new(address))),
        captured_at: unix_seconds() as u32,
    };

    installed
        .target
        .write_path(signo, u64::from(request.captured_at), &mut installed.path);
    let Some(path) = installed.path.as_c_str() else {
        return;
    };
    let fd = libc::open(
        path.as_ptr(),
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
        0o600 as libc::c_uint,
    );
    if fd < 0 {
        debug_print(b"crashcap: could not open dump file\n");
        return;
    }

    let snapshot = capture::<NativeBackend>(Restricted::new(&mut installed.storage), &request, &installed.system);
    let mut sink = FdSink::new(fd);
    if serialize(&snapshot, &mut sink).is_err() {
        debug_print(b"crashcap: dump write failed\n");
    } else {
        debug_print(b"crashcap: dump written\n");
    }
    libc::fsync(fd);
    libc::close(fd);
}

/// `si_addr`, meaningful for hardware faults only
unsafe fn fault_address(info: *const siginfo_t) -> u64
{
    if (*info).si_code <= 0 {
        return 0;
    }
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            (*info).si_addr() as u64
        } else {
            (*info).si_addr as u64
        }
    }
}

/// Whether returning from the handler would skip the restored action
///
/// Faulting instructions execute again on return and fault into whatever
/// action is restored. Signals sent with kill/raise/tgkill (`si_code <= 0`)
/// and traps, which resume after the trapping instruction, do not.
unsafe fn needs_reraise(signo: c_int, info: *const siginfo_t) -> bool
{
    info.is_null() || (*info).si_code <= 0 || signo == libc::SIGABRT || signo == libc::SIGTRAP
}

/// Send `signo` to the calling thread again
///
/// The signal stays blocked until the handler returns, then hits whatever
/// action is in place by then.
fn reraise(signo: c_int)
{
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // SAFETY: plain syscalls on our own process and thread
            let sent = unsafe {
                let tid = libc::syscall(libc::SYS_gettid);
                libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signo)
            };
            if sent < 0 {
                // SAFETY: terminating is the only option left
                unsafe { libc::_exit(1) };
            }
        } else {
            // SAFETY: signalling the calling thread
            if unsafe { libc::pthread_kill(libc::pthread_self(), signo) } != 0 {
                // SAFETY: terminating is the only option left
                unsafe { libc::_exit(1) };
            }
        }
    }
}

fn unix_seconds() -> u64
{
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: clock_gettime is async-signal-safe and `now` is a valid out-pointer
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return 0;
    }
    u64::try_from(now.tv_sec).unwrap_or(0)
}

#[cfg(feature = "debug-print")]
fn debug_print(message: &[u8])
{
    // SAFETY: write(2) on stderr; the result is irrelevant
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    }
}

#[cfg(not(feature = "debug-print"))]
fn debug_print(_message: &[u8]) {}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_alt_stack_covers_capture()
    {
        assert!(ALT_STACK_SIZE >= 64 * 1024 + libc::SIGSTKSZ);
    }

    fn query_alt_stack() -> libc::stack_t
    {
        let mut current: libc::stack_t = unsafe { mem::zeroed() };
        assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
        current
    }

    #[test]
    fn test_alt_stack_is_registered_and_restored()
    {
        // Own thread, so the harness thread keeps its stack
        std::thread::spawn(|| {
            let before = query_alt_stack();
            let stack = AltStack::install().unwrap().expect("default alternate stack is smaller");

            let current = query_alt_stack();
            assert_eq!(current.ss_size, ALT_STACK_SIZE);
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);

            drop(stack);
            let after = query_alt_stack();
            assert_eq!(after.ss_sp, before.ss_sp);
            assert_eq!(after.ss_flags & libc::SS_DISABLE, before.ss_flags & libc::SS_DISABLE);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_current_actions_are_readable()
    {
        let actions = current_actions().unwrap();
        assert_eq!(actions.len(), HANDLED_SIGNALS.len());
    }
}
