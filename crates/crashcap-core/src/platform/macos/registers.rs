//! # macOS Register Reading
//!
//! Register state for a thread comes from one of two places:
//!
//! - the machine context the kernel saved for a signal handler (faulting thread)
//! - `thread_get_state()` with the architecture's thread and float flavors
//!   (every other thread, and the calling thread for on-demand dumps)
//!
//! Both use the same state layouts from [`super::ffi`], so they share the
//! conversion into [`CpuContext`].
//!
//! ## References
//!
//! - [thread_get_state documentation](https://developer.apple.com/documentation/kernel/1418576-thread_get_state/)

use libc::{c_int, mach_msg_type_number_t, natural_t, thread_act_t};
use mach2::kern_return::KERN_SUCCESS;

use super::ffi::{self, state_count, MachineContext};
use crate::types::{ContextValidity, CpuContext, RegisterSet};

/// `thread_get_state()` into a typed state struct
///
/// # Safety
///
/// `T` must be the state layout of `flavor`.
unsafe fn get_state<T>(thread: thread_act_t, flavor: c_int, state: &mut T) -> bool
{
    let mut count: mach_msg_type_number_t = state_count::<T>();
    ffi::thread_get_state(thread, flavor, (state as *mut T).cast::<natural_t>(), &mut count) == KERN_SUCCESS
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use ffi::{X86FloatState64, X86ThreadState64, X86_FLOAT_STATE64, X86_THREAD_STATE64};
        use crate::types::Amd64Registers;

        /// Registers of a thread that is suspended (or is the caller)
        ///
        /// Returns an empty set when the thread state cannot be read.
        pub fn thread_registers(thread: thread_act_t) -> RegisterSet
        {
            let mut state = X86ThreadState64::default();
            // SAFETY: X86ThreadState64 is the X86_THREAD_STATE64 layout
            if !unsafe { get_state(thread, X86_THREAD_STATE64, &mut state) } {
                return RegisterSet::empty();
            }
            let mut float = X86FloatState64 { reserved: [0; 2], fxsave: [0; 512], reserved1: 0 };
            // SAFETY: X86FloatState64 is the X86_FLOAT_STATE64 layout
            let float = unsafe { get_state(thread, X86_FLOAT_STATE64, &mut float) }.then_some(&float);
            convert(&state, float)
        }

        /// Registers saved in a signal handler's machine context
        pub fn context_registers(context: &MachineContext) -> RegisterSet
        {
            convert(&context.ss, Some(&context.fs))
        }

        fn convert(state: &X86ThreadState64, float: Option<&X86FloatState64>) -> RegisterSet
        {
            let mut regs = Amd64Registers::zeroed();
            regs.rax = state.rax;
            regs.rbx = state.rbx;
            regs.rcx = state.rcx;
            regs.rdx = state.rdx;
            regs.rdi = state.rdi;
            regs.rsi = state.rsi;
            regs.rbp = state.rbp;
            regs.rsp = state.rsp;
            regs.r8 = state.r8;
            regs.r9 = state.r9;
            regs.r10 = state.r10;
            regs.r11 = state.r11;
            regs.r12 = state.r12;
            regs.r13 = state.r13;
            regs.r14 = state.r14;
            regs.r15 = state.r15;
            regs.rip = state.rip;
            regs.rflags = state.rflags;
            regs.cs = state.cs as u16;
            regs.fs = state.fs as u16;
            regs.gs = state.gs as u16;

            let mut validity = ContextValidity::CONTROL | ContextValidity::INTEGER;
            if let Some(float) = float {
                regs.fxsave = float.fxsave;
                regs.mxcsr = u32::from_le_bytes([float.fxsave[24], float.fxsave[25], float.fxsave[26], float.fxsave[27]]);
                validity |= ContextValidity::FLOATING;
            }
            RegisterSet { context: CpuContext::Amd64(regs), validity }
        }
    } else {
        use ffi::{ArmNeonState64, ArmThreadState64, ARM_NEON_STATE64, ARM_THREAD_STATE64};
        use crate::types::Arm64Registers;

        /// Registers of a thread that is suspended (or is the caller)
        ///
        /// Returns an empty set when the thread state cannot be read.
        pub fn thread_registers(thread: thread_act_t) -> RegisterSet
        {
            let mut state = ArmThreadState64::default();
            // SAFETY: ArmThreadState64 is the ARM_THREAD_STATE64 layout
            if !unsafe { get_state(thread, ARM_THREAD_STATE64, &mut state) } {
                return RegisterSet::empty();
            }
            let mut neon = ArmNeonState64 { v: [0; 32], fpsr: 0, fpcr: 0 };
            // SAFETY: ArmNeonState64 is the ARM_NEON_STATE64 layout
            let neon = unsafe { get_state(thread, ARM_NEON_STATE64, &mut neon) }.then_some(&neon);
            convert(&state, neon)
        }

        /// Registers saved in a signal handler's machine context
        pub fn context_registers(context: &MachineContext) -> RegisterSet
        {
            convert(&context.ss, Some(&context.ns))
        }

        fn convert(state: &ArmThreadState64, neon: Option<&ArmNeonState64>) -> RegisterSet
        {
            let mut regs = Arm64Registers::zeroed();
            regs.x[..29].copy_from_slice(&state.x);
            regs.x[29] = state.fp;
            regs.x[30] = state.lr;
            regs.sp = state.sp;
            regs.pc = state.pc;
            regs.pstate = u64::from(state.cpsr);

            let mut validity = ContextValidity::CONTROL | ContextValidity::INTEGER;
            if let Some(neon) = neon {
                regs.v = neon.v;
                regs.fpsr = neon.fpsr;
                regs.fpcr = neon.fpcr;
                validity |= ContextValidity::FLOATING;
            }
            RegisterSet { context: CpuContext::Arm64(regs), validity }
        }
    }
}

/// Registers from the third argument of an `SA_SIGINFO` handler
///
/// # Safety
///
/// `context` must point at the `ucontext_t` the kernel passed to the handler.
pub unsafe fn signal_registers(context: *const libc::c_void) -> RegisterSet
{
    let mcontext = (*context.cast::<libc::ucontext_t>()).uc_mcontext;
    if mcontext.is_null() {
        return RegisterSet::empty();
    }
    context_registers(&*mcontext.cast::<MachineContext>())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::platform::macos::threads::current_thread_port;

    #[test]
    fn test_calling_thread_state_is_readable()
    {
        let regs = thread_registers(current_thread_port());
        assert!(regs.has_control());
        assert!(regs.validity.contains(ContextValidity::FLOATING));
        assert_ne!(regs.context.sp().value(), 0);
    }

    #[test]
    fn test_invalid_port_gives_empty_set()
    {
        assert!(!thread_registers(0).has_control());
    }
}
