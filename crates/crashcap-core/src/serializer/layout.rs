//! File layout of an encoded snapshot.
//!
//! Every offset is computed before the first byte is written, so the emitter
//! can stream records strictly in order to a non-seekable sink.

use scroll::ctx::SizeWith;
use scroll::LE;

use super::streams::{context_size, cv_record_len};
use crate::error::{CaptureError, CaptureResult};
use crate::format::{
    CaptureInfoHeader, CaptureInfoThread, Directory, ExceptionStream, MemoryDescriptor, MinidumpHeader,
    MinidumpModule, MinidumpThread, SystemInfo,
};
use crate::snapshot::Snapshot;

/// Streams always present; the exception stream is added for fault dumps
pub const BASE_STREAM_COUNT: u32 = 5;

/// Section start offsets of one dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout
{
    pub stream_count: u32,
    pub context_size: u32,
    pub thread_list: u32,
    pub contexts: u32,
    pub module_list: u32,
    pub names: u32,
    pub cv_records: u32,
    pub memory_list: u32,
    pub exception: Option<u32>,
    pub system_info: u32,
    pub csd_version: u32,
    pub capture_info: u32,
    pub memory: u32,
    pub total: u32,
}

impl Layout
{
    /// Plan the file for `snapshot`
    ///
    /// Fails only when the dump would not fit the 32-bit offsets of the format.
    pub fn plan(snapshot: &Snapshot<'_>) -> CaptureResult<Self>
    {
        let mut cursor = Cursor::default();
        let header = cursor.take(MinidumpHeader::size_with(&LE) as u64);
        debug_assert_eq!(header, 0);

        let stream_count = BASE_STREAM_COUNT + u32::from(snapshot.fault.is_some());
        cursor.take(u64::from(stream_count) * Directory::size_with(&LE) as u64);

        let thread_count = snapshot.threads.len() as u64;
        let thread_list = cursor.take(4 + thread_count * MinidumpThread::size_with(&LE) as u64);

        let context_size = context_size(snapshot.system.arch);
        let contexts = cursor.take(thread_count * u64::from(context_size));

        let module_count = snapshot.modules.len() as u64;
        let module_list = cursor.take(4 + module_count * MinidumpModule::size_with(&LE) as u64);

        let names = cursor.position();
        for module in snapshot.modules {
            cursor.take(string_record_len(snapshot.module_name(module)));
            cursor.align(4);
        }

        let cv_records = cursor.position();
        for module in snapshot.modules {
            cursor.take(cv_record_len(&module.identity));
            cursor.align(4);
        }

        let memory_list = cursor.take(4 + memory_region_count(snapshot) * MemoryDescriptor::size_with(&LE) as u64);

        let exception = snapshot
            .fault
            .map(|_| cursor.take(ExceptionStream::size_with(&LE) as u64));

        let system_info = cursor.take(SystemInfo::size_with(&LE) as u64);
        let csd_version = cursor.take(string_record_len(snapshot.system.description()));
        cursor.align(4);

        let capture_info = cursor.take(
            CaptureInfoHeader::size_with(&LE) as u64 + thread_count * CaptureInfoThread::size_with(&LE) as u64,
        );

        let memory = cursor.position();
        for thread in snapshot.threads {
            cursor.take(thread.stack.len() as u64);
        }
        for region in snapshot.regions {
            cursor.take(region.span.len() as u64);
        }

        let narrow = |offset: u64| {
            u32::try_from(offset).map_err(|_| CaptureError::CaptureFailed("dump exceeds 4 GiB".to_string()))
        };

        Ok(Self {
            stream_count,
            context_size,
            thread_list: narrow(thread_list)?,
            contexts: narrow(contexts)?,
            module_list: narrow(module_list)?,
            names: narrow(names)?,
            cv_records: narrow(cv_records)?,
            memory_list: narrow(memory_list)?,
            exception: exception.map(narrow).transpose()?,
            system_info: narrow(system_info)?,
            csd_version: narrow(csd_version)?,
            capture_info: narrow(capture_info)?,
            memory: narrow(memory)?,
            total: narrow(cursor.position())?,
        })
    }

    /// RVA of the context of thread `index`
    pub const fn context_rva(&self, index: usize) -> u32
    {
        self.contexts + index as u32 * self.context_size
    }
}

/// Memory list entries: non-empty stacks followed by fault windows
pub fn memory_region_count(snapshot: &Snapshot<'_>) -> u64
{
    let stacks = snapshot.threads.iter().filter(|thread| !thread.stack.is_empty()).count();
    (stacks + snapshot.regions.len()) as u64
}

#[derive(Debug, Default)]
struct Cursor
{
    position: u64,
}

impl Cursor
{
    /// Reserve `len` bytes and return where they start
    fn take(&mut self, len: u64) -> u64
    {
        let start = self.position;
        self.position += len;
        start
    }

    fn align(&mut self, to: u64)
    {
        self.position = self.position.next_multiple_of(to);
    }

    const fn position(&self) -> u64
    {
        self.position
    }
}

/// Bytes of a `MINIDUMP_STRING`: length prefix, UTF-16 body, NUL terminator
pub fn string_record_len(utf8: &[u8]) -> u64
{
    let mut units = 0u64;
    for_each_utf16(utf8, |_| units += 1);
    4 + units * 2 + 2
}

/// Decode `bytes` as UTF-8 and hand out UTF-16 code units
///
/// Each invalid sequence becomes one U+FFFD. Nothing is allocated.
pub fn for_each_utf16(mut bytes: &[u8], mut emit: impl FnMut(u16))
{
    let mut units = [0u16; 2];
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                for ch in valid.chars() {
                    ch.encode_utf16(&mut units).iter().for_each(|unit| emit(*unit));
                }
                return;
            }
            Err(error) => {
                let (valid, rest) = bytes.split_at(error.valid_up_to());
                // SAFETY: `valid_up_to` marks the end of a valid UTF-8 prefix
                let valid = unsafe { std::str::from_utf8_unchecked(valid) };
                for ch in valid.chars() {
                    ch.encode_utf16(&mut units).iter().for_each(|unit| emit(*unit));
                }
                emit(0xfffd);
                match error.error_len() {
                    Some(len) => bytes = &rest[len..],
                    None => return,
                }
            }
        }
    }
}
