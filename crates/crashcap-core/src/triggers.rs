//! Deliberate faults for exercising the handlers.
//!
//! Debug builds only. Each function raises its fault on the calling thread
//! and does not return when the fault's action terminates the process.

use std::hint::black_box;

/// SIGSEGV: store to an unmapped low address
pub fn trigger_segfault()
{
    // Non-null and aligned, so debug precondition checks pass and the CPU faults
    let target = black_box(8usize) as *mut u32;
    // SAFETY: not safe at all, faulting is the point
    unsafe { std::ptr::write_volatile(target, 42) };
}

/// SIGABRT through `abort()`
pub fn trigger_abort()
{
    std::process::abort();
}

/// SIGBUS: read a file mapping past the end of its truncated file
///
/// Misaligned loads do not fault on x86_64 or aarch64, so the bus error
/// comes from touching a mapped page with no file backing left.
pub fn trigger_bus_error()
{
    let path = std::env::temp_dir().join(format!("crashcap-sigbus-{}", std::process::id()));
    let Ok(file) = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
    else {
        return;
    };
    let _ = std::fs::remove_file(&path);
    if file.set_len(4096).is_err() {
        return;
    }
    // SAFETY: the mapping is only ever read, and the fault below is intended
    let Ok(map) = (unsafe { memmap2::Mmap::map(&file) }) else {
        return;
    };
    if file.set_len(0).is_err() {
        return;
    }
    // SAFETY: see above
    let _ = unsafe { std::ptr::read_volatile(map.as_ptr()) };
}

/// SIGFPE: integer division by zero
///
/// aarch64 division returns 0 instead of trapping, so there the signal is raised directly.
pub fn trigger_divide_by_zero()
{
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            // SAFETY: faults on `div`
            unsafe {
                std::arch::asm!(
                    "xor edx, edx",
                    "div {divisor:e}",
                    divisor = in(reg) black_box(0u32),
                    inout("eax") 42u32 => _,
                    out("edx") _,
                );
            }
        } else {
            // SAFETY: raise has no preconditions
            unsafe {
                libc::raise(libc::SIGFPE);
            }
        }
    }
}

/// SIGILL: the architecture's permanently undefined instruction
pub fn trigger_illegal_instruction()
{
    // SAFETY: faults immediately
    unsafe {
        #[cfg(target_arch = "x86_64")]
        std::arch::asm!("ud2");
        #[cfg(target_arch = "aarch64")]
        std::arch::asm!("udf #0");
    }
}

/// SIGTRAP: software breakpoint
pub fn trigger_breakpoint()
{
    // SAFETY: traps immediately
    unsafe {
        #[cfg(target_arch = "x86_64")]
        std::arch::asm!("int3");
        #[cfg(target_arch = "aarch64")]
        std::arch::asm!("brk #0");
    }
}

/// SIGSEGV on the stack guard page through unbounded recursion
pub fn trigger_stack_overflow()
{
    #[inline(never)]
    #[allow(unconditional_recursion)]
    fn recurse(depth: u64) -> u64
    {
        let frame = black_box([depth as u8; 4096]);
        recurse(depth + 1) + u64::from(frame[0])
    }
    black_box(recurse(0));
}
