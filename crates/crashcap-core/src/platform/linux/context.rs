//! Register state from a `ucontext_t`.
//!
//! The signal handler's third argument and `getcontext` both produce a
//! `ucontext_t`; this module turns one into a [`RegisterSet`].

use std::mem::MaybeUninit;

use crash_context::ucontext_t;

#[cfg(target_arch = "x86_64")]
use crate::types::Amd64Registers;
#[cfg(target_arch = "aarch64")]
use crate::types::Arm64Registers;
use crate::types::{ContextValidity, CpuContext, RegisterSet};

/// Register state of the calling thread
///
/// The program counter is inside `current_registers` itself; debuggers unwind
/// from there to the caller.
pub fn current_registers() -> RegisterSet
{
    let mut context = MaybeUninit::<ucontext_t>::zeroed();
    // SAFETY: `context` is valid for writes of one `ucontext_t`
    let status = unsafe { crash_context::crash_context_getcontext(context.as_mut_ptr()) };
    if status != 0 {
        return RegisterSet::empty();
    }
    // SAFETY: getcontext filled the whole context. It is converted in place
    // because the x86_64 `fpregs` pointer points back into the struct.
    unsafe { from_ucontext(context.as_ptr()) }
}

/// Convert a machine context into a register set
///
/// # Safety
///
/// `context` must point at a live `ucontext_t`, as passed to an
/// `SA_SIGINFO` handler or filled by `getcontext`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn from_ucontext(context: *const ucontext_t) -> RegisterSet
{
    // Offsets into `gregs` (REG_* in <sys/ucontext.h>)
    const R8: usize = 0;
    const RDI: usize = 8;
    const RSI: usize = 9;
    const RBP: usize = 10;
    const RBX: usize = 11;
    const RDX: usize = 12;
    const RAX: usize = 13;
    const RCX: usize = 14;
    const RSP: usize = 15;
    const RIP: usize = 16;
    const EFL: usize = 17;
    const CSGSFS: usize = 18;

    let mcontext = &(*context).uc_mcontext;
    let greg = |index: usize| mcontext.gregs[index] as u64;

    let mut regs = Amd64Registers::zeroed();
    regs.rax = greg(RAX);
    regs.rcx = greg(RCX);
    regs.rdx = greg(RDX);
    regs.rbx = greg(RBX);
    regs.rsp = greg(RSP);
    regs.rbp = greg(RBP);
    regs.rsi = greg(RSI);
    regs.rdi = greg(RDI);
    regs.r8 = greg(R8);
    regs.r9 = greg(R8 + 1);
    regs.r10 = greg(R8 + 2);
    regs.r11 = greg(R8 + 3);
    regs.r12 = greg(R8 + 4);
    regs.r13 = greg(R8 + 5);
    regs.r14 = greg(R8 + 6);
    regs.r15 = greg(R8 + 7);
    regs.rip = greg(RIP);
    regs.rflags = greg(EFL);

    // cs | gs << 16 | fs << 32 | ss << 48
    let segments = greg(CSGSFS);
    regs.cs = segments as u16;
    regs.gs = (segments >> 16) as u16;
    regs.fs = (segments >> 32) as u16;
    regs.ss = (segments >> 48) as u16;

    let mut validity = ContextValidity::CONTROL | ContextValidity::INTEGER;
    let fpregs = mcontext.fpregs.cast::<u8>().cast_const();
    if !fpregs.is_null() {
        std::ptr::copy_nonoverlapping(fpregs, regs.fxsave.as_mut_ptr(), regs.fxsave.len());
        // MXCSR sits at byte 24 of the FXSAVE area
        regs.mxcsr = u32::from_le_bytes([regs.fxsave[24], regs.fxsave[25], regs.fxsave[26], regs.fxsave[27]]);
        validity |= ContextValidity::FLOATING;
    }

    RegisterSet {
        context: CpuContext::Amd64(regs),
        validity,
    }
}

/// Convert a machine context into a register set
///
/// # Safety
///
/// `context` must point at a live `ucontext_t`, as passed to an
/// `SA_SIGINFO` handler or filled by `getcontext`.
#[cfg(target_arch = "aarch64")]
pub unsafe fn from_ucontext(context: *const ucontext_t) -> RegisterSet
{
    let mcontext = &(*context).uc_mcontext;
    let mut regs = Arm64Registers::zeroed();
    regs.x = mcontext.regs;
    regs.sp = mcontext.sp;
    regs.pc = mcontext.pc;
    regs.pstate = mcontext.pstate;

    let reserved = std::ptr::addr_of!(mcontext.__reserved).cast::<u8>();
    let reserved = std::slice::from_raw_parts(reserved, std::mem::size_of_val(&mcontext.__reserved));

    let mut validity = ContextValidity::CONTROL | ContextValidity::INTEGER;
    if parse_fpsimd(reserved, &mut regs) {
        validity |= ContextValidity::FLOATING;
    }
    RegisterSet {
        context: CpuContext::Arm64(regs),
        validity,
    }
}

/// `FPSIMD_MAGIC` record tag in the AArch64 signal frame
#[cfg(target_arch = "aarch64")]
const FPSIMD_MAGIC: u32 = 0x4650_8001;

/// Find the FPSIMD record in the `__reserved` area of an AArch64 context
///
/// The area is a sequence of `{ magic: u32, size: u32, .. }` records ending
/// with a zero magic.
#[cfg(target_arch = "aarch64")]
fn parse_fpsimd(reserved: &[u8], regs: &mut Arm64Registers) -> bool
{
    const VREGS_OFFSET: usize = 16;
    const RECORD_LEN: usize = VREGS_OFFSET + 32 * 16;

    let word = |bytes: &[u8], at: usize| u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

    let mut offset = 0;
    while offset + 8 <= reserved.len() {
        let magic = word(reserved, offset);
        let size = word(reserved, offset + 4) as usize;
        if magic == 0 || size < 8 || offset + size > reserved.len() {
            return false;
        }
        if magic == FPSIMD_MAGIC && size >= RECORD_LEN {
            let record = &reserved[offset..offset + RECORD_LEN];
            regs.fpsr = word(record, 8);
            regs.fpcr = word(record, 12);
            for (index, v) in regs.v.iter_mut().enumerate() {
                let at = VREGS_OFFSET + index * 16;
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&record[at..at + 16]);
                *v = u128::from_ne_bytes(bytes);
            }
            return true;
        }
        offset += size;
    }
    false
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_current_registers_are_full()
    {
        let regs = current_registers();
        assert!(regs.validity.contains(ContextValidity::CONTROL | ContextValidity::INTEGER));
        assert_ne!(regs.context.pc().value(), 0);

        // The stack pointer lies on this thread's stack, near a local
        let local = 0u64;
        let here = std::ptr::addr_of!(local) as u64;
        assert!(regs.context.sp().value().abs_diff(here) < 64 * 1024);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_fpsimd_record_is_found_after_other_records()
    {
        let mut reserved = vec![0u8; 4096];
        // An unrelated 16-byte record first
        reserved[0..4].copy_from_slice(&0x1234_5678u32.to_ne_bytes());
        reserved[4..8].copy_from_slice(&16u32.to_ne_bytes());
        reserved[16..20].copy_from_slice(&FPSIMD_MAGIC.to_ne_bytes());
        reserved[20..24].copy_from_slice(&528u32.to_ne_bytes());
        reserved[24..28].copy_from_slice(&0x11u32.to_ne_bytes());
        reserved[28..32].copy_from_slice(&0x22u32.to_ne_bytes());
        reserved[32] = 0xab;

        let mut regs = Arm64Registers::zeroed();
        assert!(parse_fpsimd(&reserved, &mut regs));
        assert_eq!(regs.fpsr, 0x11);
        assert_eq!(regs.fpcr, 0x22);
        assert_eq!(regs.v[0] & 0xff, 0xab);
    }
}
