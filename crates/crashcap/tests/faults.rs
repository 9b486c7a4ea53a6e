//! Tests for fault dumps, run through the `crashcap` binary in child processes

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use crashcap_core::format::{self, fault_kind_tag, CaptureInfo, CAPTURE_INFO_STREAM};
use minidump::{Minidump, MinidumpException, MinidumpThreadList};

fn crashcap(args: &[&str]) -> Output
{
    Command::new(env!("CARGO_BIN_EXE_crashcap"))
        .args(args)
        .env_remove("CRASHCAP_LOG_FILE")
        .output()
        .unwrap()
}

fn dumps_in(dir: &Path) -> Vec<PathBuf>
{
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "dmp"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Exception code recorded in the dump at `path`
fn exception_code(path: &Path) -> u32
{
    let dump = Minidump::read_path(path).unwrap();
    let threads: MinidumpThreadList = dump.get_stream().unwrap();
    assert!(!threads.threads.is_empty());
    let exception: MinidumpException = dump.get_stream().unwrap();
    exception.raw.exception_record.exception_code
}

/// Vendor capture-info stream of the dump at `path`
#[cfg(debug_assertions)]
fn capture_info(path: &Path) -> CaptureInfo
{
    let bytes = fs::read(path).unwrap();
    CaptureInfo::parse(format::find_stream(&bytes, CAPTURE_INFO_STREAM).unwrap()).unwrap()
}

#[cfg(debug_assertions)]
fn crash_into(dir: &Path, kind: &str) -> (Output, Vec<PathBuf>)
{
    let output = crashcap(&["-o", dir.to_str().unwrap(), "crash", kind]);
    (output, dumps_in(dir))
}

#[cfg(debug_assertions)]
fn assert_fault_dump(kind: &str, signal: i32, file_stem: &str)
{
    let dir = tempfile::tempdir().unwrap();
    let (output, dumps) = crash_into(dir.path(), kind);

    assert_eq!(output.status.signal(), Some(signal), "{kind}: {output:?}");
    assert_eq!(dumps.len(), 1, "{kind}: {dumps:?}");
    let name = dumps[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with(&format!("crash_{file_stem}_")), "{name}");
    assert_eq!(exception_code(&dumps[0]), signal as u32);
}

#[cfg(debug_assertions)]
#[test]
fn test_segfault_dump()
{
    assert_fault_dump("segfault", libc::SIGSEGV, "sigsegv");
}

#[cfg(debug_assertions)]
#[test]
fn test_abort_dump()
{
    assert_fault_dump("abort", libc::SIGABRT, "sigabrt");
}

#[cfg(debug_assertions)]
#[test]
fn test_bus_error_dump()
{
    assert_fault_dump("bus-error", libc::SIGBUS, "sigbus");
}

#[cfg(debug_assertions)]
#[test]
fn test_divide_by_zero_dump()
{
    assert_fault_dump("divide-by-zero", libc::SIGFPE, "sigfpe");
}

#[cfg(debug_assertions)]
#[test]
fn test_illegal_instruction_dump()
{
    assert_fault_dump("illegal-instruction", libc::SIGILL, "sigill");
}

#[cfg(debug_assertions)]
#[test]
fn test_breakpoint_dump()
{
    assert_fault_dump("breakpoint", libc::SIGTRAP, "sigtrap");
}

#[cfg(debug_assertions)]
#[test]
fn test_stack_overflow_dump()
{
    let dir = tempfile::tempdir().unwrap();
    let (output, dumps) = crash_into(dir.path(), "stack-overflow");

    // The runtime's own overflow handler runs after ours and may abort instead
    assert!(output.status.signal().is_some(), "{output:?}");
    assert_eq!(dumps.len(), 1, "{dumps:?}");
    let code = exception_code(&dumps[0]);
    assert!(code == libc::SIGSEGV as u32 || code == libc::SIGBUS as u32, "{code}");

    // The guard-page hit is reported as an overflow, not a plain segfault
    #[cfg(target_os = "linux")]
    assert_eq!(capture_info(&dumps[0]).header.fault_kind, fault_kind_tag::STACK_OVERFLOW);
}

#[cfg(debug_assertions)]
#[test]
fn test_segfault_classified_as_segfault()
{
    let dir = tempfile::tempdir().unwrap();
    let (_, dumps) = crash_into(dir.path(), "segfault");
    assert_eq!(capture_info(&dumps[0]).header.fault_kind, fault_kind_tag::SEGFAULT);
}

#[cfg(debug_assertions)]
fn assert_worker_thread_dump(kind: &str, signal: i32)
{
    let dir = tempfile::tempdir().unwrap();
    let child = Command::new(env!("CARGO_BIN_EXE_crashcap"))
        .args(["-o", dir.path().to_str().unwrap(), "crash", kind, "--thread"])
        .env_remove("CRASHCAP_LOG_FILE")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let pid = child.id();
    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.signal(), Some(signal), "{kind}: {output:?}");

    let dumps = dumps_in(dir.path());
    assert_eq!(dumps.len(), 1, "{kind}: {dumps:?}");
    let dump = Minidump::read_path(&dumps[0]).unwrap();
    let exception: MinidumpException = dump.get_stream().unwrap();
    assert_eq!(exception.raw.exception_record.exception_code, signal as u32);

    // The worker faulted while the main thread waited for it
    let threads: MinidumpThreadList = dump.get_stream().unwrap();
    assert!(threads.threads.len() >= 2, "{}", threads.threads.len());
    let faulting = exception.raw.thread_id;
    assert!(threads.threads.iter().any(|thread| thread.raw.thread_id == faulting));
    #[cfg(target_os = "linux")]
    {
        // The main thread's id is the process id
        assert_ne!(faulting, pid);
        assert!(threads.threads.iter().any(|thread| thread.raw.thread_id == pid));
    }
    #[cfg(not(target_os = "linux"))]
    let _ = pid;
}

#[cfg(debug_assertions)]
#[test]
fn test_segfault_on_worker_thread_dump()
{
    assert_worker_thread_dump("segfault", libc::SIGSEGV);
}

#[cfg(debug_assertions)]
#[test]
fn test_abort_on_worker_thread_dump()
{
    assert_worker_thread_dump("abort", libc::SIGABRT);
}

#[cfg(debug_assertions)]
#[test]
fn test_exact_dump_file_for_divide_by_zero()
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.dmp");
    let output = crashcap(&["--dump-file", path.to_str().unwrap(), "crash", "divide-by-zero"]);
    assert_eq!(output.status.signal(), Some(libc::SIGFPE));

    let bytes = fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], b"MDMP");
    assert_eq!(
        format::count_streams(&bytes, format::stream_type::EXCEPTION),
        1
    );
    assert_eq!(exception_code(&path), libc::SIGFPE as u32);
}

#[cfg(debug_assertions)]
#[test]
fn test_uninstalled_handlers_write_nothing()
{
    let dir = tempfile::tempdir().unwrap();
    let output = crashcap(&["-o", dir.path().to_str().unwrap(), "crash", "segfault", "--uninstall"]);
    assert_eq!(output.status.signal(), Some(libc::SIGSEGV));
    assert!(dumps_in(dir.path()).is_empty());
}

#[cfg(debug_assertions)]
#[test]
fn test_timestamp_can_be_disabled()
{
    let dir = tempfile::tempdir().unwrap();
    let output = crashcap(&["-o", dir.path().to_str().unwrap(), "-p", "app", "--no-timestamp", "crash", "abort"]);
    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    assert!(dir.path().join("app_sigabrt.dmp").is_file());
}

#[test]
fn test_dump_command_writes_named_file()
{
    let dir = tempfile::tempdir().unwrap();
    let output = crashcap(&["-o", dir.path().to_str().unwrap(), "dump", "--name", "snapshot"]);
    assert!(output.status.success(), "{output:?}");

    let path = dir.path().join("snapshot.dmp");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("snapshot.dmp"));

    let bytes = fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], b"MDMP");
    assert_eq!(
        format::count_streams(&bytes, format::stream_type::EXCEPTION),
        0
    );
}

#[test]
fn test_list_names_every_fault()
{
    let output = crashcap(&["list"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for kind in [
        "segfault",
        "abort",
        "bus-error",
        "divide-by-zero",
        "illegal-instruction",
        "stack-overflow",
        "breakpoint",
    ] {
        assert!(stdout.contains(kind), "missing {kind}");
    }
}

#[test]
fn test_interactive_exits_after_timeout()
{
    let dir = tempfile::tempdir().unwrap();
    let output = crashcap(&["-o", dir.path().to_str().unwrap(), "interactive", "--timeout", "1"]);
    assert!(output.status.success(), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("Timeout reached"));
    assert!(dumps_in(dir.path()).is_empty());
}
