//! Tests for on-demand dumps through the writer facade

use std::fs;

use crashcap_core::config::CaptureLimits;
use crashcap_core::error::CaptureError;
use crashcap_core::format::{self, stream_type, CaptureInfo, ExceptionStream, CAPTURE_INFO_STREAM};
use crashcap_core::snapshot::ThreadFlags;
use crashcap_core::writer::{DumpStatus, Writer, WriterState};
use minidump::{Minidump, MinidumpException, MinidumpModuleList, MinidumpThreadList};
use scroll::{Pread, LE};

#[test]
fn test_repeated_writes_produce_independent_dumps()
{
    let dir = tempfile::tempdir().unwrap();
    let mut writer = Writer::create().unwrap();

    let first = writer.write_dump(dir.path().join("first.dmp")).unwrap();
    let second = writer.write_dump(dir.path().join("second.dmp")).unwrap();
    assert_eq!(writer.state(), WriterState::Ready);

    for report in [&first, &second] {
        let bytes = fs::read(&report.path).unwrap();
        assert_eq!(bytes.len() as u64, report.bytes_written);
        assert_eq!(format::count_streams(&bytes, stream_type::EXCEPTION), 0);

        let dump = Minidump::read(bytes).unwrap();
        let threads: MinidumpThreadList = dump.get_stream().unwrap();
        assert_eq!(threads.threads.len(), report.threads);
        assert!(report.threads >= 1);
    }
    writer.free();
}

#[test]
fn test_calling_thread_is_recorded_with_stack()
{
    let dir = tempfile::tempdir().unwrap();
    let report = Writer::create().unwrap().write_dump(dir.path().join("self.dmp")).unwrap();
    let bytes = fs::read(&report.path).unwrap();

    let info = CaptureInfo::parse(format::find_stream(&bytes, CAPTURE_INFO_STREAM).unwrap()).unwrap();
    assert_eq!(info.threads.len(), report.threads);

    let dump = Minidump::read(bytes).unwrap();
    let threads: MinidumpThreadList = dump.get_stream().unwrap();
    assert!(threads.threads.iter().any(|thread| thread.raw.stack.memory.data_size > 0));
}

#[test]
fn test_synthesized_exception_keeps_host_values()
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("synthetic.dmp");
    Writer::create()
        .unwrap()
        .write_dump_with_exception(&path, 0x1234, 99, 0xdead_beef)
        .unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(format::count_streams(&bytes, stream_type::EXCEPTION), 1);

    let raw: ExceptionStream = format::find_stream(&bytes, stream_type::EXCEPTION)
        .unwrap()
        .pread_with(0, LE)
        .unwrap();
    assert_eq!(raw.exception_record.exception_code, 0x1234);
    assert_eq!(raw.exception_record.exception_flags, 99);
    assert_eq!(raw.exception_record.exception_address, 0xdead_beef);
    assert_eq!(raw.exception_record.exception_information[0], 0x1234);
    assert_eq!(raw.exception_record.exception_information[1], 99);

    // The exception names the thread that asked for the dump
    let dump = Minidump::read(bytes).unwrap();
    let exception: MinidumpException = dump.get_stream().unwrap();
    let threads: MinidumpThreadList = dump.get_stream().unwrap();
    assert!(threads
        .threads
        .iter()
        .any(|thread| thread.raw.thread_id == exception.raw.thread_id));
}

#[test]
fn test_stack_cap_truncates_and_flags()
{
    let dir = tempfile::tempdir().unwrap();
    let limits = CaptureLimits::default().with_max_stack_bytes(256);
    let report = Writer::with_limits(limits)
        .unwrap()
        .write_dump(dir.path().join("capped.dmp"))
        .unwrap();
    let bytes = fs::read(&report.path).unwrap();

    let dump = Minidump::read(bytes.clone()).unwrap();
    let threads: MinidumpThreadList = dump.get_stream().unwrap();
    assert!(threads.threads.iter().all(|thread| thread.raw.stack.memory.data_size <= 256));

    // The calling thread's stack is far deeper than 256 bytes
    let info = CaptureInfo::parse(format::find_stream(&bytes, CAPTURE_INFO_STREAM).unwrap()).unwrap();
    assert!(info
        .threads
        .iter()
        .any(|thread| thread.flags & ThreadFlags::STACK_TRUNCATED.bits() != 0 && thread.original_len > 256));
}

#[test]
fn test_modules_include_the_test_binary()
{
    let dir = tempfile::tempdir().unwrap();
    let report = Writer::create().unwrap().write_dump(dir.path().join("modules.dmp")).unwrap();
    assert!(report.modules >= 1);

    let dump = Minidump::read_path(&report.path).unwrap();
    let modules: MinidumpModuleList = dump.get_stream().unwrap();
    let exe = std::env::current_exe().unwrap();
    let exe_name = exe.file_name().unwrap().to_string_lossy().into_owned();
    assert!(modules.iter().any(|module| module.name.ends_with(&exe_name)));
}

#[test]
fn test_zero_limits_are_rejected()
{
    let result = Writer::with_limits(CaptureLimits::default().with_max_threads(0));
    assert!(matches!(result, Err(CaptureError::InvalidArgument(_))));
}

#[test]
fn test_thread_limit_yields_partial_status()
{
    let dir = tempfile::tempdir().unwrap();
    // Keep a second thread alive for the duration of the dump
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let worker = std::thread::spawn(move || {
        let _ = stop_rx.recv();
    });

    let report = Writer::with_limits(CaptureLimits::default().with_max_threads(1))
        .unwrap()
        .write_dump(dir.path().join("partial.dmp"))
        .unwrap();
    assert_eq!(report.threads, 1);
    assert!(matches!(report.status(), DumpStatus::Partial(_)));

    drop(stop_tx);
    worker.join().unwrap();
}
