//! Conversion from snapshot records to format records.

use crate::format::{
    context_flags, fault_kind_tag, ContextAmd64, ContextArm64, ExceptionRecord, ExceptionStream, LocationDescriptor,
    SystemInfo, CV_SIGNATURE_ELF, CV_SIGNATURE_RSDS,
};
use crate::snapshot::{FaultKind, FaultRecord, IdentitySource, ModuleIdentity, SystemSnapshot};
use crate::types::{Amd64Registers, Architecture, Arm64Registers, ContextValidity, CpuContext, RegisterSet};

pub const AMD64_CONTEXT_SIZE: u32 = 1232;
pub const ARM64_CONTEXT_SIZE: u32 = 912;

/// Encoded size of one thread context for `arch`
pub const fn context_size(arch: Architecture) -> u32
{
    match arch {
        Architecture::Arm64 => ARM64_CONTEXT_SIZE,
        Architecture::X86_64 | Architecture::Unknown(_) => AMD64_CONTEXT_SIZE,
    }
}

/// A thread context ready for encoding
pub enum EncodedContext
{
    Amd64(ContextAmd64),
    Arm64(ContextArm64),
}

impl EncodedContext
{
    /// Build the context record for `arch`
    ///
    /// A register file of another architecture (which no backend produces)
    /// is written as an empty context so every record keeps the planned size.
    pub fn new(arch: Architecture, registers: &RegisterSet) -> Self
    {
        match (arch, &registers.context) {
            (Architecture::Arm64, CpuContext::Arm64(regs)) => EncodedContext::Arm64(arm64_context(regs, registers.validity)),
            (Architecture::Arm64, CpuContext::Amd64(_)) => EncodedContext::Arm64(arm64_context(
                &Arm64Registers::zeroed(),
                ContextValidity::empty(),
            )),
            (_, CpuContext::Amd64(regs)) => EncodedContext::Amd64(amd64_context(regs, registers.validity)),
            (_, CpuContext::Arm64(_)) => {
                EncodedContext::Amd64(amd64_context(&Amd64Registers::zeroed(), ContextValidity::empty()))
            }
        }
    }
}

fn amd64_context(regs: &Amd64Registers, validity: ContextValidity) -> ContextAmd64
{
    let mut flags = context_flags::AMD64;
    if validity.contains(ContextValidity::CONTROL) {
        flags |= context_flags::AMD64_CONTROL;
    }
    if validity.contains(ContextValidity::INTEGER) {
        flags |= context_flags::AMD64_INTEGER;
    }
    if validity.contains(ContextValidity::FLOATING) {
        flags |= context_flags::AMD64_FLOATING_POINT;
    }

    let mut context = ContextAmd64::zeroed();
    context.context_flags = flags;
    context.mx_csr = regs.mxcsr;
    context.cs = regs.cs;
    context.fs = regs.fs;
    context.gs = regs.gs;
    context.ss = regs.ss;
    context.eflags = regs.rflags as u32;
    context.rax = regs.rax;
    context.rcx = regs.rcx;
    context.rdx = regs.rdx;
    context.rbx = regs.rbx;
    context.rsp = regs.rsp;
    context.rbp = regs.rbp;
    context.rsi = regs.rsi;
    context.rdi = regs.rdi;
    context.r8 = regs.r8;
    context.r9 = regs.r9;
    context.r10 = regs.r10;
    context.r11 = regs.r11;
    context.r12 = regs.r12;
    context.r13 = regs.r13;
    context.r14 = regs.r14;
    context.r15 = regs.r15;
    context.rip = regs.rip;
    if validity.contains(ContextValidity::FLOATING) {
        context.float_save = regs.fxsave;
    }
    context
}

fn arm64_context(regs: &Arm64Registers, validity: ContextValidity) -> ContextArm64
{
    let mut flags = context_flags::ARM64;
    if validity.contains(ContextValidity::CONTROL) {
        flags |= context_flags::ARM64_CONTROL;
    }
    if validity.contains(ContextValidity::INTEGER) {
        flags |= context_flags::ARM64_INTEGER;
    }
    if validity.contains(ContextValidity::FLOATING) {
        flags |= context_flags::ARM64_FLOATING_POINT;
    }

    let mut context = ContextArm64::zeroed();
    context.context_flags = flags;
    context.cpsr = regs.pstate as u32;
    context.iregs[..31].copy_from_slice(&regs.x);
    context.iregs[ContextArm64::STACK_POINTER] = regs.sp;
    context.pc = regs.pc;
    if validity.contains(ContextValidity::FLOATING) {
        context.float_save.regs = regs.v;
        context.float_save.fpsr = regs.fpsr;
        context.float_save.fpcr = regs.fpcr;
    }
    context
}

/// Bytes of the CodeView record for `identity` (0 when there is none)
pub const fn cv_record_len(identity: &ModuleIdentity) -> u64
{
    match identity.source {
        IdentitySource::ElfBuildId | IdentitySource::ElfTextHash => 4 + identity.len() as u64,
        // RSDS: signature, GUID, age, empty NUL-terminated PDB name
        IdentitySource::MachOUuid => 4 + 16 + 4 + 1,
        IdentitySource::Unknown => 0,
    }
}

/// Encode the CodeView record for `identity` into `out`, returning its length
pub fn encode_cv_record(identity: &ModuleIdentity, out: &mut [u8; 64]) -> usize
{
    let id = identity.as_bytes();
    match identity.source {
        IdentitySource::ElfBuildId | IdentitySource::ElfTextHash => {
            out[..4].copy_from_slice(&CV_SIGNATURE_ELF.to_le_bytes());
            out[4..4 + id.len()].copy_from_slice(id);
            4 + id.len()
        }
        IdentitySource::MachOUuid => {
            out[..4].copy_from_slice(&CV_SIGNATURE_RSDS.to_le_bytes());
            let mut guid = [0u8; 16];
            let len = id.len().min(16);
            guid[..len].copy_from_slice(&id[..len]);
            out[4..20].copy_from_slice(&guid);
            out[20..24].copy_from_slice(&0u32.to_le_bytes());
            out[24] = 0;
            25
        }
        IdentitySource::Unknown => 0,
    }
}

/// Exception stream for `fault` on `thread_id`
///
/// `exception_code` carries the signal (or host-supplied kind) and
/// `exception_flags` the sub-code. Both are repeated in full width in
/// `exception_information` so readers can recover a 64-bit code.
pub fn exception_stream(fault: &FaultRecord, thread_id: u32, context: LocationDescriptor) -> ExceptionStream
{
    let mut stream = ExceptionStream::zeroed();
    stream.thread_id = thread_id;
    stream.thread_context = context;

    let record: &mut ExceptionRecord = &mut stream.exception_record;
    record.exception_code = fault.exception_code;
    record.exception_flags = fault.code as u32;
    record.exception_address = fault.address.value();
    record.exception_information[0] = u64::from(fault.exception_code);
    record.exception_information[1] = fault.code;
    record.number_parameters = 2;
    stream
}

pub fn system_info(system: &SystemSnapshot, csd_version_rva: u32) -> SystemInfo
{
    SystemInfo {
        processor_architecture: system.arch.processor_architecture(),
        processor_level: system.processor_level,
        processor_revision: system.processor_revision,
        number_of_processors: system.cpu_count,
        product_type: 0,
        major_version: system.os_major,
        minor_version: system.os_minor,
        build_number: system.os_build,
        platform_id: system.os.platform_id(),
        csd_version_rva,
        suite_mask: 0,
        reserved2: 0,
        cpu: system.cpu_info,
    }
}

pub const fn fault_tag(fault: Option<&FaultRecord>) -> u32
{
    match fault {
        None => fault_kind_tag::NONE,
        Some(record) => match record.kind {
            FaultKind::Segfault => fault_kind_tag::SEGFAULT,
            FaultKind::IllegalInstruction => fault_kind_tag::ILLEGAL_INSTRUCTION,
            FaultKind::DivideByZero => fault_kind_tag::DIVIDE_BY_ZERO,
            FaultKind::BusError => fault_kind_tag::BUS_ERROR,
            FaultKind::Abort => fault_kind_tag::ABORT,
            FaultKind::StackOverflow => fault_kind_tag::STACK_OVERFLOW,
            FaultKind::UserRequested => fault_kind_tag::USER_REQUESTED,
            FaultKind::Trap => fault_kind_tag::TRAP,
        },
    }
}
