//! # Serializer
//!
//! Turns a [`Snapshot`] into the bytes of a minidump file.
//!
//! The whole layout is planned first ([`Layout::plan`]) and records are then
//! written strictly in file order to a [`Sink`], so the same code runs for a
//! `BufWriter<File>` ([`IoSink`]) on the healthy path and for a raw descriptor
//! ([`FdSink`]) inside the fault handler. Records are encoded into a stack
//! buffer, and nothing on this path allocates.
//!
//! File order:
//!
//! 1. header and stream directory
//! 2. thread list, then one context per thread
//! 3. module list, module names, CodeView records
//! 4. memory list
//! 5. exception stream (fault dumps only)
//! 6. system info and its OS description string
//! 7. capture-info vendor stream
//! 8. raw memory: every captured stack, then the fault windows
//!
//! Thread stack descriptors and memory-list descriptors point at the same
//! bytes, so stacks are stored once.

mod layout;
mod sink;
mod streams;

use std::io;

use scroll::ctx::TryIntoCtx;
use scroll::{Endian, Pwrite, LE};

pub use layout::{for_each_utf16, string_record_len, Layout};
pub use sink::{FdSink, IoSink, Sink};
pub use streams::{context_size, AMD64_CONTEXT_SIZE, ARM64_CONTEXT_SIZE};

use self::streams::{encode_cv_record, exception_stream, fault_tag, system_info, EncodedContext};
use crate::error::{CaptureError, CaptureResult};
use crate::format::{
    stream_type, CaptureInfoHeader, CaptureInfoThread, Directory, FixedFileInfo, LocationDescriptor,
    MemoryDescriptor, MinidumpHeader, MinidumpModule, MinidumpThread, CAPTURE_INFO_STREAM, CAPTURE_INFO_VERSION,
    MINIDUMP_SIGNATURE, MINIDUMP_VERSION,
};
use crate::snapshot::Snapshot;

/// Largest single record (`CONTEXT_AMD64`)
const RECORD_BUFFER: usize = 1232;

/// Encode `snapshot` into `out`, returning the number of bytes written
///
/// On error the output holds a truncated dump; the error names the part that
/// was being written.
pub fn serialize<S: Sink>(snapshot: &Snapshot<'_>, out: &mut S) -> CaptureResult<u64>
{
    let layout = Layout::plan(snapshot)?;
    let mut emitter = Emitter::new(out);

    write_header(&mut emitter, snapshot, &layout)?;
    write_threads(&mut emitter, snapshot, &layout)?;
    write_modules(&mut emitter, snapshot, &layout)?;
    write_memory_list(&mut emitter, snapshot, &layout)?;
    if let (Some(fault), Some(rva)) = (snapshot.fault.as_ref(), layout.exception) {
        emitter.expect(rva);
        let (thread_id, context) = match snapshot.threads.iter().position(|thread| thread.is_faulting) {
            Some(index) => (
                snapshot.threads[index].id.raw(),
                LocationDescriptor {
                    data_size: layout.context_size,
                    rva: layout.context_rva(index),
                },
            ),
            None => (0, LocationDescriptor::default()),
        };
        emitter.record("exception", &exception_stream(fault, thread_id, context))?;
    }
    write_system_info(&mut emitter, snapshot, &layout)?;
    write_capture_info(&mut emitter, snapshot, &layout)?;
    write_memory(&mut emitter, snapshot, &layout)?;

    emitter.flush()?;
    debug_assert_eq!(emitter.position, u64::from(layout.total));
    Ok(emitter.position)
}

fn write_header<S: Sink>(emitter: &mut Emitter<'_, S>, snapshot: &Snapshot<'_>, layout: &Layout) -> CaptureResult<()>
{
    let header = MinidumpHeader {
        signature: MINIDUMP_SIGNATURE,
        version: MINIDUMP_VERSION,
        stream_count: layout.stream_count,
        stream_directory_rva: 32,
        checksum: 0,
        time_date_stamp: snapshot.captured_at,
        flags: 0,
    };
    emitter.record("header", &header)?;

    let entry = |stream_type: u32, rva: u32, end: u32| Directory {
        stream_type,
        location: LocationDescriptor {
            data_size: end - rva,
            rva,
        },
    };
    // Each stream ends where the next section starts
    let entries = [
        Some(entry(stream_type::THREAD_LIST, layout.thread_list, layout.contexts)),
        Some(entry(stream_type::MODULE_LIST, layout.module_list, layout.names)),
        Some(entry(stream_type::MEMORY_LIST, layout.memory_list, layout.exception.unwrap_or(layout.system_info))),
        layout
            .exception
            .map(|rva| entry(stream_type::EXCEPTION, rva, layout.system_info)),
        Some(entry(stream_type::SYSTEM_INFO, layout.system_info, layout.csd_version)),
        Some(entry(CAPTURE_INFO_STREAM, layout.capture_info, layout.memory)),
    ];
    for directory in entries.iter().flatten() {
        emitter.record("directory", directory)?;
    }
    Ok(())
}

fn write_threads<S: Sink>(emitter: &mut Emitter<'_, S>, snapshot: &Snapshot<'_>, layout: &Layout) -> CaptureResult<()>
{
    emitter.expect(layout.thread_list);
    emitter.bytes("thread list", &(snapshot.threads.len() as u32).to_le_bytes())?;

    let mut memory_rva = layout.memory;
    for (index, thread) in snapshot.threads.iter().enumerate() {
        let len = thread.stack.len() as u32;
        let stack = if len == 0 {
            MemoryDescriptor {
                start_of_memory_range: thread.registers.context.sp().value(),
                memory: LocationDescriptor::default(),
            }
        } else {
            MemoryDescriptor {
                start_of_memory_range: thread.stack.start.value(),
                memory: LocationDescriptor {
                    data_size: len,
                    rva: memory_rva,
                },
            }
        };
        memory_rva += len;

        let record = MinidumpThread {
            thread_id: thread.id.raw(),
            stack,
            thread_context: LocationDescriptor {
                data_size: layout.context_size,
                rva: layout.context_rva(index),
            },
            ..MinidumpThread::default()
        };
        emitter.record("thread list", &record)?;
    }

    emitter.expect(layout.contexts);
    for thread in snapshot.threads {
        match EncodedContext::new(snapshot.system.arch, &thread.registers) {
            EncodedContext::Amd64(context) => emitter.record("thread context", &context)?,
            EncodedContext::Arm64(context) => emitter.record("thread context", &context)?,
        }
    }
    Ok(())
}

fn write_modules<S: Sink>(emitter: &mut Emitter<'_, S>, snapshot: &Snapshot<'_>, layout: &Layout) -> CaptureResult<()>
{
    emitter.expect(layout.module_list);
    emitter.bytes("module list", &(snapshot.modules.len() as u32).to_le_bytes())?;

    let mut name_rva = u64::from(layout.names);
    let mut cv_rva = u64::from(layout.cv_records);
    for module in snapshot.modules {
        let cv_len = streams::cv_record_len(&module.identity);
        let record = MinidumpModule {
            base_of_image: module.base.value(),
            size_of_image: u32::try_from(module.size).unwrap_or(u32::MAX),
            module_name_rva: name_rva as u32,
            version_info: FixedFileInfo {
                signature: FixedFileInfo::SIGNATURE,
                struct_version: 0x0001_0000,
                ..FixedFileInfo::default()
            },
            cv_record: if cv_len == 0 {
                LocationDescriptor::default()
            } else {
                LocationDescriptor {
                    data_size: cv_len as u32,
                    rva: cv_rva as u32,
                }
            },
            ..MinidumpModule::default()
        };
        emitter.record("module list", &record)?;

        name_rva = (name_rva + string_record_len(snapshot.module_name(module))).next_multiple_of(4);
        cv_rva = (cv_rva + cv_len).next_multiple_of(4);
    }

    emitter.expect(layout.names);
    for module in snapshot.modules {
        emitter.string("module name", snapshot.module_name(module))?;
        emitter.align("module name", 4)?;
    }

    emitter.expect(layout.cv_records);
    let mut cv = [0u8; 64];
    for module in snapshot.modules {
        let len = encode_cv_record(&module.identity, &mut cv);
        emitter.bytes("codeview record", &cv[..len])?;
        emitter.align("codeview record", 4)?;
    }
    Ok(())
}

fn write_memory_list<S: Sink>(emitter: &mut Emitter<'_, S>, snapshot: &Snapshot<'_>, layout: &Layout) -> CaptureResult<()>
{
    emitter.expect(layout.memory_list);
    let count = layout::memory_region_count(snapshot) as u32;
    emitter.bytes("memory list", &count.to_le_bytes())?;

    let mut memory_rva = layout.memory;
    for thread in snapshot.threads {
        let len = thread.stack.len() as u32;
        if len == 0 {
            continue;
        }
        let descriptor = MemoryDescriptor {
            start_of_memory_range: thread.stack.start.value(),
            memory: LocationDescriptor {
                data_size: len,
                rva: memory_rva,
            },
        };
        emitter.record("memory list", &descriptor)?;
        memory_rva += len;
    }
    for region in snapshot.regions {
        let len = region.span.len() as u32;
        let descriptor = MemoryDescriptor {
            start_of_memory_range: region.start.value(),
            memory: LocationDescriptor {
                data_size: len,
                rva: memory_rva,
            },
        };
        emitter.record("memory list", &descriptor)?;
        memory_rva += len;
    }
    Ok(())
}

fn write_system_info<S: Sink>(emitter: &mut Emitter<'_, S>, snapshot: &Snapshot<'_>, layout: &Layout) -> CaptureResult<()>
{
    emitter.expect(layout.system_info);
    emitter.record("system info", &system_info(snapshot.system, layout.csd_version))?;
    emitter.expect(layout.csd_version);
    emitter.string("system info", snapshot.system.description())?;
    emitter.align("system info", 4)
}

fn write_capture_info<S: Sink>(emitter: &mut Emitter<'_, S>, snapshot: &Snapshot<'_>, layout: &Layout) -> CaptureResult<()>
{
    emitter.expect(layout.capture_info);
    let header = CaptureInfoHeader {
        version: CAPTURE_INFO_VERSION,
        fault_kind: fault_tag(snapshot.fault.as_ref()),
        incomplete: snapshot.incomplete.bits(),
        thread_count: snapshot.threads.len() as u32,
        max_stack_bytes: u32::try_from(snapshot.max_stack_bytes).unwrap_or(u32::MAX),
        reserved: 0,
    };
    emitter.record("capture info", &header)?;
    for thread in snapshot.threads {
        let entry = CaptureInfoThread {
            thread_id: thread.id.raw(),
            flags: thread.flags.bits(),
            captured_len: thread.stack.len() as u32,
            original_len: u32::try_from(thread.stack.available).unwrap_or(u32::MAX),
        };
        emitter.record("capture info", &entry)?;
    }
    Ok(())
}

fn write_memory<S: Sink>(emitter: &mut Emitter<'_, S>, snapshot: &Snapshot<'_>, layout: &Layout) -> CaptureResult<()>
{
    emitter.expect(layout.memory);
    for thread in snapshot.threads {
        emitter.bytes("thread stack", snapshot.stack_bytes(thread))?;
    }
    for region in snapshot.regions {
        emitter.bytes("memory region", snapshot.region_bytes(region))?;
    }
    Ok(())
}

/// Sequential writer that tracks the file offset
struct Emitter<'w, S: Sink>
{
    out: &'w mut S,
    position: u64,
}

impl<'w, S: Sink> Emitter<'w, S>
{
    fn new(out: &'w mut S) -> Self
    {
        Self { out, position: 0 }
    }

    /// The next byte must land at `rva`
    fn expect(&self, rva: u32)
    {
        debug_assert_eq!(self.position, u64::from(rva), "serializer drifted from its layout");
    }

    fn bytes(&mut self, stream: &'static str, data: &[u8]) -> CaptureResult<()>
    {
        self.out
            .write_all(data)
            .map_err(|source| CaptureError::WriteFailed { stream, source })?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn record<T>(&mut self, stream: &'static str, value: T) -> CaptureResult<()>
    where
        T: TryIntoCtx<Endian, Error = scroll::Error>,
    {
        let mut buffer = [0u8; RECORD_BUFFER];
        let len = buffer[..].pwrite_with(value, 0, LE).map_err(|_| CaptureError::WriteFailed {
            stream,
            source: io::ErrorKind::InvalidData.into(),
        })?;
        self.bytes(stream, &buffer[..len])
    }

    /// Write a `MINIDUMP_STRING`
    fn string(&mut self, stream: &'static str, utf8: &[u8]) -> CaptureResult<()>
    {
        let body = string_record_len(utf8) - 6;
        self.bytes(stream, &(body as u32).to_le_bytes())?;

        let mut chunk = [0u8; 256];
        let mut filled = 0;
        let mut result = Ok(());
        for_each_utf16(utf8, |unit| {
            if result.is_err() {
                return;
            }
            chunk[filled..filled + 2].copy_from_slice(&unit.to_le_bytes());
            filled += 2;
            if filled == chunk.len() {
                result = self.bytes(stream, &chunk);
                filled = 0;
            }
        });
        result?;
        self.bytes(stream, &chunk[..filled])?;
        self.bytes(stream, &[0, 0])
    }

    fn align(&mut self, stream: &'static str, to: u64) -> CaptureResult<()>
    {
        let padding = self.position.next_multiple_of(to) - self.position;
        self.bytes(stream, &[0u8; 8][..padding as usize])
    }

    fn flush(&mut self) -> CaptureResult<()>
    {
        self.out
            .flush()
            .map_err(|source| CaptureError::WriteFailed { stream: "flush", source })
    }
}
