//! CPU register sets captured per thread.
//!
//! Register sets are fixed-size, `Copy` values so they can live inside the
//! pre-reserved snapshot storage and be filled from a signal context without
//! allocating. Which parts of a set hold real values is tracked separately in
//! [`ContextValidity`], since other threads on Linux only expose their
//! stack pointer and program counter.

use bitflags::bitflags;

use super::{Address, Architecture};

bitflags! {
    /// Register groups that hold captured (rather than zeroed) values
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextValidity: u8
    {
        /// Program counter, stack pointer, frame pointer and flags
        const CONTROL = 1 << 0;
        /// All general-purpose registers
        const INTEGER = 1 << 1;
        /// Floating-point and vector state
        const FLOATING = 1 << 2;

        /// Everything the signal context provides
        const FULL = Self::CONTROL.bits() | Self::INTEGER.bits() | Self::FLOATING.bits();
    }
}

/// x86-64 register file
///
/// Field order follows `CONTEXT_AMD64` so the serializer can copy straight
/// across. `fxsave` is the 512-byte legacy `FXSAVE` area (x87, MXCSR, XMM0-15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Amd64Registers
{
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Instruction pointer
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub mxcsr: u32,
    pub fxsave: [u8; 512],
}

impl Amd64Registers
{
    /// All-zero register file
    pub const fn zeroed() -> Self
    {
        Self {
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            mxcsr: 0,
            fxsave: [0; 512],
        }
    }
}

/// AArch64 register file
///
/// `x[29]` is the frame pointer and `x[30]` the link register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm64Registers
{
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    /// PSTATE / CPSR
    pub pstate: u64,
    pub fpsr: u32,
    pub fpcr: u32,
    /// NEON/SIMD registers V0-V31
    pub v: [u128; 32],
}

impl Arm64Registers
{
    /// All-zero register file
    pub const fn zeroed() -> Self
    {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
            fpsr: 0,
            fpcr: 0,
            v: [0; 32],
        }
    }
}

/// Architecture-specific register file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuContext
{
    Amd64(Amd64Registers),
    Arm64(Arm64Registers),
}

impl CpuContext
{
    /// Zeroed register file for the architecture this binary runs on
    ///
    /// Unknown architectures fall back to the AMD64 layout; they never reach
    /// capture because no backend exists for them.
    pub const fn zeroed_native() -> Self
    {
        match Architecture::current() {
            Architecture::Arm64 => CpuContext::Arm64(Arm64Registers::zeroed()),
            Architecture::X86_64 | Architecture::Unknown(_) => CpuContext::Amd64(Amd64Registers::zeroed()),
        }
    }

    pub const fn architecture(&self) -> Architecture
    {
        match self {
            CpuContext::Amd64(_) => Architecture::X86_64,
            CpuContext::Arm64(_) => Architecture::Arm64,
        }
    }

    /// Program counter (RIP / PC)
    pub const fn pc(&self) -> Address
    {
        match self {
            CpuContext::Amd64(regs) => Address::new(regs.rip),
            CpuContext::Arm64(regs) => Address::new(regs.pc),
        }
    }

    /// Stack pointer (RSP / SP)
    pub const fn sp(&self) -> Address
    {
        match self {
            CpuContext::Amd64(regs) => Address::new(regs.rsp),
            CpuContext::Arm64(regs) => Address::new(regs.sp),
        }
    }

    /// Frame pointer (RBP / X29)
    pub const fn fp(&self) -> Address
    {
        match self {
            CpuContext::Amd64(regs) => Address::new(regs.rbp),
            CpuContext::Arm64(regs) => Address::new(regs.x[29]),
        }
    }

    /// Set only the control registers, leaving everything else untouched
    pub fn set_control(&mut self, pc: u64, sp: u64)
    {
        match self {
            CpuContext::Amd64(regs) => {
                regs.rip = pc;
                regs.rsp = sp;
            }
            CpuContext::Arm64(regs) => {
                regs.pc = pc;
                regs.sp = sp;
            }
        }
    }
}

/// Register file plus which parts of it are meaningful
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet
{
    pub context: CpuContext,
    pub validity: ContextValidity,
}

impl RegisterSet
{
    /// A register set with nothing captured
    pub const fn empty() -> Self
    {
        Self {
            context: CpuContext::zeroed_native(),
            validity: ContextValidity::empty(),
        }
    }

    pub const fn full(context: CpuContext) -> Self
    {
        Self {
            context,
            validity: ContextValidity::FULL,
        }
    }

    /// `true` when at least the program counter and stack pointer are known
    pub const fn has_control(&self) -> bool
    {
        self.validity.contains(ContextValidity::CONTROL)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_set_control_updates_pc_and_sp()
    {
        let mut context = CpuContext::zeroed_native();
        context.set_control(0x4000_1000, 0x7fff_0000);
        assert_eq!(context.pc(), Address::new(0x4000_1000));
        assert_eq!(context.sp(), Address::new(0x7fff_0000));
        assert_eq!(context.fp(), Address::ZERO);
    }

    #[test]
    fn test_empty_register_set_has_no_control()
    {
        let regs = RegisterSet::empty();
        assert!(!regs.has_control());
        assert_eq!(regs.context.architecture(), Architecture::current());
    }
}
