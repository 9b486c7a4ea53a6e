//! # macOS Mach API FFI Declarations
//!
//! Mach functions the `mach2` crate does not bind (or binds with a signature
//! we cannot rely on), and the register state layouts as they appear both in
//! `thread_get_state()` output and in a signal handler's machine context.
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [XNU `osfmk/mach/i386/_structs.h` and `osfmk/mach/arm/_structs.h`](https://github.com/apple-oss-distributions/xnu)

#![allow(unused_doc_comments)]

use libc::{c_int, kern_return_t, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t, vm_address_t, vm_map_t, vm_size_t};

/// `TASK_DYLD_INFO` flavor of `task_info()`
pub const TASK_DYLD_INFO: u32 = 17;

/// Output of `task_info(TASK_DYLD_INFO)`
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskDyldInfo
{
    /// Address of the process's `dyld_all_image_infos`
    pub all_image_info_addr: u64,
    pub all_image_info_size: u64,
    pub all_image_info_format: c_int,
}

/// `TASK_DYLD_INFO_COUNT`: size of [`TaskDyldInfo`] in `natural_t` units
pub const TASK_DYLD_INFO_COUNT: mach_msg_type_number_t = state_count::<TaskDyldInfo>();

#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Send right to the calling thread's kernel port
    ///
    /// Each call adds a user reference that must be released with
    /// `mach_port_deallocate()`.
    pub fn mach_thread_self() -> thread_act_t;

    /// Query task-wide information (`TASK_DYLD_INFO` and friends)
    pub fn task_info(
        target_task: mach_port_t,
        flavor: u32,
        task_info_out: *mut c_int,
        task_info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Read thread state (registers) of the given flavor into `old_state`
    ///
    /// `old_state_count` is the buffer size in `natural_t` units on input and
    /// the size used on output.
    ///
    /// See: [thread_get_state documentation](https://developer.apple.com/documentation/kernel/1418576-thread_get_state/)
    pub fn thread_get_state(
        target_act: thread_act_t,
        flavor: c_int,
        old_state: *mut natural_t,
        old_state_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Increment a thread's suspend count
    pub fn thread_suspend(target_act: thread_act_t) -> kern_return_t;

    /// Decrement a thread's suspend count
    pub fn thread_resume(target_act: thread_act_t) -> kern_return_t;

    /// Release one user reference on a port right
    pub fn mach_port_deallocate(target_task: mach_port_t, name: mach_port_t) -> kern_return_t;

    /// Free memory the kernel allocated into our task (e.g. the `task_threads()` array)
    pub fn vm_deallocate(target_task: vm_map_t, address: vm_address_t, size: vm_size_t) -> kern_return_t;
}

// ============================================================================
// x86-64 state
// ============================================================================

/// `X86_THREAD_STATE64` flavor
#[cfg(target_arch = "x86_64")]
pub const X86_THREAD_STATE64: c_int = 4;
/// `X86_FLOAT_STATE64` flavor
#[cfg(target_arch = "x86_64")]
pub const X86_FLOAT_STATE64: c_int = 5;

/// `x86_thread_state64_t`
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct X86ThreadState64
{
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

/// `x86_float_state64_t`
///
/// Everything between the two reserved words is laid out exactly like the
/// 512-byte `FXSAVE` area.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86FloatState64
{
    pub reserved: [c_int; 2],
    pub fxsave: [u8; 512],
    pub reserved1: c_int,
}

/// `x86_exception_state64_t`
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86ExceptionState64
{
    pub trapno: u16,
    pub cpu: u16,
    pub err: u32,
    pub faultvaddr: u64,
}

/// `struct __darwin_mcontext64` (what `ucontext_t::uc_mcontext` points at)
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MachineContext
{
    pub es: X86ExceptionState64,
    pub ss: X86ThreadState64,
    pub fs: X86FloatState64,
}

// ============================================================================
// ARM64 state
// ============================================================================

/// `ARM_THREAD_STATE64` flavor
#[cfg(target_arch = "aarch64")]
pub const ARM_THREAD_STATE64: c_int = 6;
/// `ARM_NEON_STATE64` flavor
#[cfg(target_arch = "aarch64")]
pub const ARM_NEON_STATE64: c_int = 17;

/// `arm_thread_state64_t`
///
/// On arm64e the kernel may sign `fp`, `lr`, `sp` and `pc`; user space sees
/// them stripped when read through `thread_get_state()`.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmThreadState64
{
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    pub pad: u32,
}

/// `arm_neon_state64_t`
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArmNeonState64
{
    pub v: [u128; 32],
    pub fpsr: u32,
    pub fpcr: u32,
}

/// `arm_exception_state64_t`
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArmExceptionState64
{
    pub far: u64,
    pub esr: u32,
    pub exception: u32,
}

/// `struct __darwin_mcontext64` (what `ucontext_t::uc_mcontext` points at)
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MachineContext
{
    pub es: ArmExceptionState64,
    pub ss: ArmThreadState64,
    pub ns: ArmNeonState64,
}

/// Size of a state struct in `natural_t` units, as `thread_get_state()` counts it
pub const fn state_count<T>() -> mach_msg_type_number_t
{
    (std::mem::size_of::<T>() / std::mem::size_of::<natural_t>()) as mach_msg_type_number_t
}
