//! # Snapshot Model
//!
//! The in-memory picture of a process at capture time, decoupled from the
//! minidump encoding.
//!
//! All records are fixed-size `Copy` values. Variable-length data (stack
//! bytes, memory windows, module paths) lives in the byte pools of
//! [`SnapshotStorage`] and is referenced through [`Span`]s, so a snapshot can
//! be built on the faulting thread out of storage that was reserved at
//! install time.
//!
//! A [`Snapshot`] borrows that storage for exactly as long as it takes to
//! serialize it. It is consumed by [`serialize`](crate::serializer::serialize).

mod storage;

use bitflags::bitflags;

pub use storage::{Bounded, BytePool, Scratch, SnapshotStorage, Span, MAX_WINDOWS, WINDOW_BYTES};

use crate::types::{Address, Architecture, OsFamily, ProcessId, RegisterSet, ThreadId};

/// Category of a captured fault
///
/// The set is closed: each variant corresponds to a fault the handler
/// intercepts, plus `UserRequested` for synthesized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind
{
    /// Invalid memory access (SIGSEGV)
    Segfault,
    /// Undefined or privileged instruction (SIGILL)
    IllegalInstruction,
    /// Integer division by zero (SIGFPE)
    DivideByZero,
    /// Misaligned or non-existent physical address (SIGBUS)
    BusError,
    /// `abort()` or an explicit SIGABRT
    Abort,
    /// SIGSEGV on the guard area just beyond a thread's stack
    StackOverflow,
    /// Breakpoint or trace trap (SIGTRAP)
    Trap,
    /// A dump requested by the host, possibly with its own exception code
    UserRequested,
}

impl FaultKind
{
    /// Classify a signal number (stack overflow detection needs the fault address, see `capture`)
    pub const fn from_signal(signo: i32) -> Option<Self>
    {
        match signo {
            libc::SIGSEGV => Some(FaultKind::Segfault),
            libc::SIGILL => Some(FaultKind::IllegalInstruction),
            libc::SIGFPE => Some(FaultKind::DivideByZero),
            libc::SIGBUS => Some(FaultKind::BusError),
            libc::SIGABRT => Some(FaultKind::Abort),
            libc::SIGTRAP => Some(FaultKind::Trap),
            _ => None,
        }
    }

    /// Exception code a dump of this kind carries when nothing more specific is known
    pub const fn default_exception_code(self) -> u32
    {
        match self {
            FaultKind::Segfault | FaultKind::StackOverflow => libc::SIGSEGV as u32,
            FaultKind::IllegalInstruction => libc::SIGILL as u32,
            FaultKind::DivideByZero => libc::SIGFPE as u32,
            FaultKind::BusError => libc::SIGBUS as u32,
            FaultKind::Abort => libc::SIGABRT as u32,
            FaultKind::Trap => libc::SIGTRAP as u32,
            FaultKind::UserRequested => DUMP_REQUESTED,
        }
    }

    /// Short lowercase name, used in generated dump file names
    pub const fn name(self) -> &'static str
    {
        match self {
            FaultKind::Segfault => "segfault",
            FaultKind::IllegalInstruction => "illegal_instruction",
            FaultKind::DivideByZero => "divide_by_zero",
            FaultKind::BusError => "bus_error",
            FaultKind::Abort => "abort",
            FaultKind::StackOverflow => "stack_overflow",
            FaultKind::Trap => "trap",
            FaultKind::UserRequested => "user_requested",
        }
    }
}

/// Exception code Breakpad uses for dumps written without a real exception
pub const DUMP_REQUESTED: u32 = 0xffff_ffff;

/// The exception a dump describes
///
/// `exception_code` is what lands in the dump's exception record. For signal
/// faults it is the signal number and `code` is `si_code`. Synthesized records
/// keep whatever the host passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord
{
    pub kind: FaultKind,
    pub exception_code: u32,
    pub code: u64,
    pub address: Address,
}

impl FaultRecord
{
    /// Record for an intercepted signal
    pub fn from_signal(signo: i32, si_code: i32, address: Address) -> Self
    {
        Self {
            kind: FaultKind::from_signal(signo).unwrap_or(FaultKind::UserRequested),
            exception_code: signo as u32,
            code: si_code as u32 as u64,
            address,
        }
    }

    /// Record for an on-demand dump that did not come from an OS fault
    ///
    /// Raw codes matching a handled signal keep that kind, everything else is
    /// `UserRequested`.
    ///
    /// ```rust
    /// use crashcap_core::snapshot::{FaultKind, FaultRecord};
    /// use crashcap_core::types::Address;
    ///
    /// let record = FaultRecord::synthesized(0x1234, 99, Address::new(0xdead_beef));
    /// assert_eq!(record.kind, FaultKind::UserRequested);
    /// assert_eq!(record.exception_code, 0x1234);
    /// ```
    pub fn synthesized(exception_code: u32, code: u64, address: Address) -> Self
    {
        let kind = i32::try_from(exception_code)
            .ok()
            .and_then(FaultKind::from_signal)
            .unwrap_or(FaultKind::UserRequested);
        Self {
            kind,
            exception_code,
            code,
            address,
        }
    }
}

bitflags! {
    /// What a thread record is missing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadFlags: u32
    {
        /// The stack was longer than the per-thread cap
        const STACK_TRUNCATED = 1 << 0;
        /// No stack bytes could be read
        const STACK_UNREADABLE = 1 << 1;
        /// No register state could be obtained
        const NO_CONTEXT = 1 << 2;
    }
}

bitflags! {
    /// Collections a dump could not capture completely
    ///
    /// An empty set means the dump is complete.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Incomplete: u32
    {
        /// Thread enumeration failed or exceeded `max_threads`
        const THREAD_LIST = 1 << 0;
        /// At least one thread has no register state
        const THREAD_STATE = 1 << 1;
        /// At least one stack could not be read
        const STACKS = 1 << 2;
        /// Module enumeration failed or exceeded `max_modules`
        const MODULES = 1 << 3;
        /// A memory window around the fault could not be read
        const MEMORY = 1 << 4;
        /// The module path pool ran out of space
        const NAMES = 1 << 5;
    }
}

/// Captured stack of one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackCapture
{
    /// Lowest captured address (stack pointer minus red zone)
    pub start: Address,
    /// Bytes in the stack pool; `span.len()` is the captured length
    pub span: Span,
    /// Bytes between `start` and the end of the stack mapping, before capping
    pub available: u64,
}

impl StackCapture
{
    pub const fn len(&self) -> usize
    {
        self.span.len()
    }

    pub const fn is_empty(&self) -> bool
    {
        self.span.is_empty()
    }
}

/// One thread at capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot
{
    pub id: ThreadId,
    pub registers: RegisterSet,
    pub stack: StackCapture,
    /// Set on exactly one thread in fault dumps (and on the requesting thread on demand)
    pub is_faulting: bool,
    pub flags: ThreadFlags,
}

impl ThreadSnapshot
{
    pub const fn new(id: ThreadId, registers: RegisterSet) -> Self
    {
        Self {
            id,
            registers,
            stack: StackCapture {
                start: Address::ZERO,
                span: Span::EMPTY,
                available: 0,
            },
            is_faulting: false,
            flags: ThreadFlags::empty(),
        }
    }

    pub const fn is_truncated(&self) -> bool
    {
        self.flags.contains(ThreadFlags::STACK_TRUNCATED)
    }
}

/// Where a module's identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentitySource
{
    /// `NT_GNU_BUILD_ID` ELF note
    ElfBuildId,
    /// XOR of the first page of `.text`, for ELF files without a build-id
    ElfTextHash,
    /// Mach-O `LC_UUID` load command
    MachOUuid,
    /// Nothing could be read
    Unknown,
}

/// Build/debug identifier of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleIdentity
{
    pub source: IdentitySource,
    bytes: [u8; Self::CAPACITY],
    len: u8,
}

impl ModuleIdentity
{
    /// Longest identifier kept (GNU build-ids are 20 bytes with SHA-1, up to 32 in practice)
    pub const CAPACITY: usize = 32;

    pub const UNKNOWN: Self = Self {
        source: IdentitySource::Unknown,
        bytes: [0; Self::CAPACITY],
        len: 0,
    };

    /// Copy an identifier, truncating it to [`Self::CAPACITY`] bytes
    pub fn new(source: IdentitySource, id: &[u8]) -> Self
    {
        let len = id.len().min(Self::CAPACITY);
        let mut bytes = [0; Self::CAPACITY];
        bytes[..len].copy_from_slice(&id[..len]);
        Self {
            source,
            bytes,
            len: len as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes[..usize::from(self.len)]
    }

    pub const fn len(&self) -> usize
    {
        self.len as usize
    }

    pub const fn is_empty(&self) -> bool
    {
        self.len == 0
    }
}

/// One loaded code module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRecord
{
    pub base: Address,
    pub size: u64,
    /// Path bytes in the name pool
    pub name: Span,
    pub identity: ModuleIdentity,
}

/// Extra memory captured by value (windows around the fault)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion
{
    pub start: Address,
    /// Bytes in the stack pool
    pub span: Span,
}

/// Static facts about the machine and OS
///
/// Fault dumps use a copy taken at install time, because most of these
/// queries are not async-signal-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemSnapshot
{
    pub arch: Architecture,
    pub os: OsFamily,
    pub cpu_count: u8,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub os_major: u32,
    pub os_minor: u32,
    pub os_build: u32,
    /// Raw `CPU_INFORMATION` union (x86 vendor/version/features or zeros)
    pub cpu_info: [u8; 24],
    description: [u8; Self::DESCRIPTION_CAPACITY],
    description_len: u16,
}

impl SystemSnapshot
{
    pub const DESCRIPTION_CAPACITY: usize = 256;

    pub const fn unknown() -> Self
    {
        Self {
            arch: Architecture::current(),
            os: OsFamily::current(),
            cpu_count: 1,
            processor_level: 0,
            processor_revision: 0,
            os_major: 0,
            os_minor: 0,
            os_build: 0,
            cpu_info: [0; 24],
            description: [0; Self::DESCRIPTION_CAPACITY],
            description_len: 0,
        }
    }

    /// Replace the OS description, truncating it to the inline capacity
    pub fn set_description(&mut self, parts: &[&[u8]])
    {
        let mut len = 0;
        for (index, part) in parts.iter().enumerate() {
            if index > 0 && len < Self::DESCRIPTION_CAPACITY {
                self.description[len] = b' ';
                len += 1;
            }
            let take = part.len().min(Self::DESCRIPTION_CAPACITY - len);
            self.description[len..len + take].copy_from_slice(&part[..take]);
            len += take;
        }
        self.description_len = len as u16;
    }

    /// Free-form OS description ("Linux 6.1.0 #1 SMP x86_64")
    pub fn description(&self) -> &[u8]
    {
        &self.description[..usize::from(self.description_len)]
    }
}

/// A complete capture, ready for serialization
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'s>
{
    pub pid: ProcessId,
    /// Seconds since the Unix epoch
    pub captured_at: u32,
    pub fault: Option<FaultRecord>,
    pub threads: &'s [ThreadSnapshot],
    pub modules: &'s [ModuleRecord],
    pub regions: &'s [MemoryRegion],
    pub system: &'s SystemSnapshot,
    pub incomplete: Incomplete,
    pub max_stack_bytes: usize,
    memory: &'s BytePool,
    names: &'s BytePool,
}

impl<'s> Snapshot<'s>
{
    pub fn stack_bytes(&self, thread: &ThreadSnapshot) -> &'s [u8]
    {
        self.memory.get(thread.stack.span)
    }

    pub fn region_bytes(&self, region: &MemoryRegion) -> &'s [u8]
    {
        self.memory.get(region.span)
    }

    pub fn module_name(&self, module: &ModuleRecord) -> &'s [u8]
    {
        self.names.get(module.name)
    }

    /// The thread the fault (or request) happened on
    pub fn faulting_thread(&self) -> Option<&'s ThreadSnapshot>
    {
        self.threads.iter().find(|thread| thread.is_faulting)
    }

    pub const fn is_partial(&self) -> bool
    {
        !self.incomplete.is_empty()
    }
}
