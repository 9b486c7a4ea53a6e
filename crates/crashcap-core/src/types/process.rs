//! Process, thread, architecture and OS identifiers.

use std::fmt;

/// Process identifier (PID)
///
/// The capture engine only ever dumps its own process, so this is mostly
/// carried around for the dump header and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    /// PID of the calling process.
    pub fn current() -> Self
    {
        ProcessId(std::process::id())
    }
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

/// Thread identifier
///
/// The exact representation is platform-specific:
///
/// - **Linux**: kernel thread ID (TID), as listed in `/proc/self/task`
/// - **macOS**: Mach thread port (`thread_act_t`) as seen from this task
///
/// Minidump thread records store a 32-bit identifier, so that is what we keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ThreadId(pub u32);

impl ThreadId
{
    /// Get the raw thread identifier
    ///
    /// ```rust
    /// use crashcap_core::types::ThreadId;
    ///
    /// let thread = ThreadId::from(12345);
    /// assert_eq!(thread.raw(), 12345);
    /// ```
    pub const fn raw(&self) -> u32
    {
        self.0
    }
}

impl From<u32> for ThreadId
{
    fn from(value: u32) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// CPU architecture of the captured process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM (AArch64)
    ///
    /// 31 general-purpose registers (X0-X30) plus SP, PC and PSTATE.
    ///
    /// See: [ARM64 Architecture Reference Manual](https://developer.arm.com/documentation/ddi0487/latest)
    Arm64,
    /// 64-bit x86 (Intel/AMD)
    ///
    /// 16 general-purpose registers plus RIP, RFLAGS and the segment selectors.
    X86_64,
    /// Any other architecture. No capture backend exists for these.
    Unknown(&'static str),
}

impl Architecture
{
    /// Architecture this binary was compiled for
    ///
    /// Since the engine dumps its own process, this is also the architecture
    /// of every captured thread.
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }

        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }

        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            Architecture::Unknown(std::env::consts::ARCH)
        }
    }

    /// `PROCESSOR_ARCHITECTURE_*` value written to the system info stream
    pub const fn processor_architecture(self) -> u16
    {
        match self {
            Architecture::X86_64 => 9,
            Architecture::Arm64 => 12,
            // PROCESSOR_ARCHITECTURE_UNKNOWN
            Architecture::Unknown(_) => 0xffff,
        }
    }

    /// Number of bytes below the stack pointer that leaf functions may use
    ///
    /// The System V x86_64 ABI reserves a 128-byte red zone; AArch64 has none.
    pub const fn red_zone(self) -> u64
    {
        match self {
            Architecture::X86_64 => 128,
            Architecture::Arm64 | Architecture::Unknown(_) => 0,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Unknown(name) => write!(f, "{name}"),
        }
    }
}

/// Operating system family of the captured process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily
{
    /// Linux and Android
    Linux,
    /// macOS
    MacOs,
    /// Anything without a capture backend
    Unknown(&'static str),
}

impl OsFamily
{
    /// OS this binary was compiled for
    pub const fn current() -> Self
    {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            OsFamily::Linux
        }

        #[cfg(target_os = "macos")]
        {
            OsFamily::MacOs
        }

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
        {
            OsFamily::Unknown(std::env::consts::OS)
        }
    }

    /// `PlatformId` value written to the system info stream
    ///
    /// Linux and macOS use the Breakpad extension values.
    pub const fn platform_id(self) -> u32
    {
        match self {
            OsFamily::Linux => 0x8201,
            OsFamily::MacOs => 0x8101,
            OsFamily::Unknown(_) => 0xffff_ffff,
        }
    }
}

impl fmt::Display for OsFamily
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::MacOs => write!(f, "macos"),
            OsFamily::Unknown(name) => write!(f, "{name}"),
        }
    }
}
