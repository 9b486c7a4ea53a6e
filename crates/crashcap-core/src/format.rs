//! # Minidump Format
//!
//! On-disk records of the Microsoft minidump container, plus the one vendor
//! stream crashcap adds.
//!
//! Records are declared with `scroll`'s derives and always encoded little
//! endian, with no padding between fields. Field order and widths follow
//! `minidumpapiset.h` (and Breakpad's extensions for ARM64 contexts and ELF
//! CodeView records), which is what every minidump reader expects.
//!
//! The vendor stream ([`CAPTURE_INFO_STREAM`]) records what a capture had to
//! leave out. Readers that do not know it skip it.

use scroll::ctx::SizeWith;
use scroll::{Pread, Pwrite, SizeWith, LE};

/// `MDMP`, little endian
pub const MINIDUMP_SIGNATURE: u32 = 0x504d_444d;
/// Version in the low 16 bits; the high 16 are implementation specific
pub const MINIDUMP_VERSION: u32 = 0xa793;

pub mod stream_type
{
    pub const THREAD_LIST: u32 = 3;
    pub const MODULE_LIST: u32 = 4;
    pub const MEMORY_LIST: u32 = 5;
    pub const EXCEPTION: u32 = 6;
    pub const SYSTEM_INFO: u32 = 7;
}

/// Vendor stream describing capture completeness (`CC` + 1)
pub const CAPTURE_INFO_STREAM: u32 = 0x4343_0001;
pub const CAPTURE_INFO_VERSION: u32 = 1;

pub mod processor_architecture
{
    pub const AMD64: u16 = 9;
    pub const ARM64: u16 = 12;
    pub const UNKNOWN: u16 = 0xffff;
}

pub mod platform_id
{
    /// Breakpad extension
    pub const LINUX: u32 = 0x8201;
    /// Breakpad extension
    pub const MAC_OS: u32 = 0x8101;
    pub const UNKNOWN: u32 = 0xffff_ffff;
}

pub mod context_flags
{
    pub const AMD64: u32 = 0x0010_0000;
    pub const AMD64_CONTROL: u32 = AMD64 | 0x1;
    pub const AMD64_INTEGER: u32 = AMD64 | 0x2;
    pub const AMD64_SEGMENTS: u32 = AMD64 | 0x4;
    pub const AMD64_FLOATING_POINT: u32 = AMD64 | 0x8;
    pub const AMD64_FULL: u32 = AMD64_CONTROL | AMD64_INTEGER | AMD64_FLOATING_POINT;

    pub const ARM64: u32 = 0x0040_0000;
    pub const ARM64_CONTROL: u32 = ARM64 | 0x1;
    pub const ARM64_INTEGER: u32 = ARM64 | 0x2;
    pub const ARM64_FLOATING_POINT: u32 = ARM64 | 0x4;
    pub const ARM64_FULL: u32 = ARM64_CONTROL | ARM64_INTEGER | ARM64_FLOATING_POINT;
}

/// CodeView signature for Breakpad's ELF build-id records (`BpEL`)
pub const CV_SIGNATURE_ELF: u32 = 0x4270_454c;
/// CodeView signature for PDB 7.0 records (`RSDS`)
pub const CV_SIGNATURE_RSDS: u32 = 0x5344_5352;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct MinidumpHeader
{
    pub signature: u32,
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub flags: u64,
}

/// Size and offset of a blob inside the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct LocationDescriptor
{
    pub data_size: u32,
    pub rva: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct Directory
{
    pub stream_type: u32,
    pub location: LocationDescriptor,
}

/// A range of process memory and where its bytes live in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct MemoryDescriptor
{
    pub start_of_memory_range: u64,
    pub memory: LocationDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct MinidumpThread
{
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64,
    pub stack: MemoryDescriptor,
    pub thread_context: LocationDescriptor,
}

/// `VS_FIXEDFILEINFO`; left zeroed except for the signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct FixedFileInfo
{
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_hi: u32,
    pub file_version_lo: u32,
    pub product_version_hi: u32,
    pub product_version_lo: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_hi: u32,
    pub file_date_lo: u32,
}

impl FixedFileInfo
{
    pub const SIGNATURE: u32 = 0xfeef_04bd;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct MinidumpModule
{
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub module_name_rva: u32,
    pub version_info: FixedFileInfo,
    pub cv_record: LocationDescriptor,
    pub misc_record: LocationDescriptor,
    pub reserved0: u64,
    pub reserved1: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct ExceptionRecord
{
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: u64,
    pub exception_address: u64,
    pub number_parameters: u32,
    pub __align: u32,
    pub exception_information: [u64; 15],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct ExceptionStream
{
    pub thread_id: u32,
    pub __align: u32,
    pub exception_record: ExceptionRecord,
    pub thread_context: LocationDescriptor,
}

impl ExceptionStream
{
    pub const fn zeroed() -> Self
    {
        Self {
            thread_id: 0,
            __align: 0,
            exception_record: ExceptionRecord {
                exception_code: 0,
                exception_flags: 0,
                exception_record: 0,
                exception_address: 0,
                number_parameters: 0,
                __align: 0,
                exception_information: [0; 15],
            },
            thread_context: LocationDescriptor { data_size: 0, rva: 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct SystemInfo
{
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: u32,
    pub suite_mask: u16,
    pub reserved2: u16,
    /// `CPU_INFORMATION` union
    pub cpu: [u8; 24],
}

/// `CONTEXT_AMD64` from WinNT.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct ContextAmd64
{
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
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
    pub rip: u64,
    /// 512-byte `FXSAVE` area
    pub float_save: [u8; 512],
    pub vector_register: [u128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

impl ContextAmd64
{
    pub const fn zeroed() -> Self
    {
        Self {
            p1_home: 0,
            p2_home: 0,
            p3_home: 0,
            p4_home: 0,
            p5_home: 0,
            p6_home: 0,
            context_flags: 0,
            mx_csr: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            eflags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
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
            float_save: [0; 512],
            vector_register: [0; 26],
            vector_control: 0,
            debug_control: 0,
            last_branch_to_rip: 0,
            last_branch_from_rip: 0,
            last_exception_to_rip: 0,
            last_exception_from_rip: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct FloatSaveArm64
{
    pub regs: [u128; 32],
    pub fpsr: u32,
    pub fpcr: u32,
}

/// Breakpad's `CONTEXT_ARM64`; `iregs[31]` is SP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct ContextArm64
{
    pub context_flags: u32,
    pub cpsr: u32,
    pub iregs: [u64; 32],
    pub pc: u64,
    pub float_save: FloatSaveArm64,
    pub bcr: [u32; 8],
    pub bvr: [u64; 8],
    pub wcr: [u32; 2],
    pub wvr: [u64; 2],
}

impl ContextArm64
{
    pub const STACK_POINTER: usize = 31;

    pub const fn zeroed() -> Self
    {
        Self {
            context_flags: 0,
            cpsr: 0,
            iregs: [0; 32],
            pc: 0,
            float_save: FloatSaveArm64 {
                regs: [0; 32],
                fpsr: 0,
                fpcr: 0,
            },
            bcr: [0; 8],
            bvr: [0; 8],
            wcr: [0; 2],
            wvr: [0; 2],
        }
    }
}

/// Vendor stream header; followed by `thread_count` [`CaptureInfoThread`] entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct CaptureInfoHeader
{
    pub version: u32,
    /// [`fault_kind_tag`] of the dump's fault, 0 for none
    pub fault_kind: u32,
    /// `Incomplete` bits
    pub incomplete: u32,
    pub thread_count: u32,
    pub max_stack_bytes: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pread, Pwrite, SizeWith)]
pub struct CaptureInfoThread
{
    pub thread_id: u32,
    /// `ThreadFlags` bits
    pub flags: u32,
    pub captured_len: u32,
    /// Stack bytes available before capping, saturated to `u32::MAX`
    pub original_len: u32,
}

/// Numeric tags of fault kinds in the vendor stream
pub mod fault_kind_tag
{
    pub const NONE: u32 = 0;
    pub const SEGFAULT: u32 = 1;
    pub const ILLEGAL_INSTRUCTION: u32 = 2;
    pub const DIVIDE_BY_ZERO: u32 = 3;
    pub const BUS_ERROR: u32 = 4;
    pub const ABORT: u32 = 5;
    pub const STACK_OVERFLOW: u32 = 6;
    pub const USER_REQUESTED: u32 = 7;
    pub const TRAP: u32 = 8;
}

/// Locate a stream in an encoded dump by walking its directory
pub fn find_stream(dump: &[u8], wanted: u32) -> Option<&[u8]>
{
    let header: MinidumpHeader = dump.pread_with(0, LE).ok()?;
    if header.signature != MINIDUMP_SIGNATURE {
        return None;
    }
    let entry_size = Directory::size_with(&LE);
    (0..header.stream_count as usize).find_map(|index| {
        let offset = header.stream_directory_rva as usize + index * entry_size;
        let entry: Directory = dump.pread_with(offset, LE).ok()?;
        if entry.stream_type != wanted {
            return None;
        }
        let start = entry.location.rva as usize;
        dump.get(start..start + entry.location.data_size as usize)
    })
}

/// Number of directory entries of type `wanted` (0 for anything that is not a minidump)
pub fn count_streams(dump: &[u8], wanted: u32) -> usize
{
    let Ok(header) = dump.pread_with::<MinidumpHeader>(0, LE) else {
        return 0;
    };
    if header.signature != MINIDUMP_SIGNATURE {
        return 0;
    }
    let entry_size = Directory::size_with(&LE);
    (0..header.stream_count as usize)
        .filter_map(|index| dump.pread_with::<Directory>(header.stream_directory_rva as usize + index * entry_size, LE).ok())
        .filter(|entry| entry.stream_type == wanted)
        .count()
}

/// Decoded vendor capture-info stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInfo
{
    pub header: CaptureInfoHeader,
    pub threads: Vec<CaptureInfoThread>,
}

impl CaptureInfo
{
    /// Parse the stream body returned by [`find_stream`]
    pub fn parse(bytes: &[u8]) -> Result<Self, scroll::Error>
    {
        let offset = &mut 0;
        let header: CaptureInfoHeader = bytes.gread_with(offset, LE)?;
        let threads = (0..header.thread_count)
            .map(|_| bytes.gread_with(offset, LE))
            .collect::<Result<Vec<CaptureInfoThread>, _>>()?;
        Ok(Self { header, threads })
    }

    /// Entry for `thread_id`, if the thread was recorded
    pub fn thread(&self, thread_id: u32) -> Option<&CaptureInfoThread>
    {
        self.threads.iter().find(|thread| thread.thread_id == thread_id)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_record_sizes_match_minidumpapiset()
    {
        assert_eq!(MinidumpHeader::size_with(&LE), 32);
        assert_eq!(Directory::size_with(&LE), 12);
        assert_eq!(MemoryDescriptor::size_with(&LE), 16);
        assert_eq!(MinidumpThread::size_with(&LE), 48);
        assert_eq!(MinidumpModule::size_with(&LE), 108);
        assert_eq!(ExceptionStream::size_with(&LE), 168);
        assert_eq!(SystemInfo::size_with(&LE), 56);
        assert_eq!(ContextAmd64::size_with(&LE), 1232);
        assert_eq!(ContextArm64::size_with(&LE), 912);
        assert_eq!(CaptureInfoHeader::size_with(&LE), 24);
        assert_eq!(CaptureInfoThread::size_with(&LE), 16);
    }

    #[test]
    fn test_find_stream_rejects_bad_signature()
    {
        let mut bytes = [0u8; 64];
        bytes[..].pwrite_with(
            MinidumpHeader {
                signature: 0x1234,
                version: MINIDUMP_VERSION,
                stream_count: 0,
                stream_directory_rva: 32,
                checksum: 0,
                time_date_stamp: 0,
                flags: 0,
            },
            0,
            LE,
        )
        .unwrap();
        assert!(find_stream(&bytes, stream_type::THREAD_LIST).is_none());
    }

    #[test]
    fn test_signature_spells_mdmp()
    {
        assert_eq!(&MINIDUMP_SIGNATURE.to_le_bytes(), b"MDMP");
        assert_eq!(&CV_SIGNATURE_ELF.to_le_bytes(), b"LEpB");
        assert_eq!(&CV_SIGNATURE_RSDS.to_le_bytes(), b"RSDS");
    }
}
