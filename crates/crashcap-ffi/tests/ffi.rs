//! Tests for the C ABI, called the way a host would

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use crashcap_ffi::{
    crashcap_create, crashcap_free, crashcap_free_message, crashcap_has_fault_triggers, crashcap_install_handlers,
    crashcap_register_current_thread, crashcap_test, crashcap_uninstall_handlers, crashcap_write_dump,
    crashcap_write_dump_with_exception, CrashcapResult,
};
use minidump::{Minidump, MinidumpException};

fn c_path(path: &Path) -> CString
{
    CString::new(path.as_os_str().as_bytes()).unwrap()
}

/// Copy out and release the message of `result`
fn message(result: CrashcapResult) -> Option<String>
{
    if result.message.is_null() {
        return None;
    }
    let text = unsafe { CStr::from_ptr(result.message) }.to_string_lossy().into_owned();
    unsafe { crashcap_free_message(result.message) };
    Some(text)
}

#[test]
fn test_sentinel_and_trigger_flag()
{
    assert_eq!(crashcap_test(), 1);
    assert_eq!(crashcap_has_fault_triggers(), cfg!(debug_assertions));
}

#[test]
fn test_write_then_free_twice()
{
    let dir = tempfile::tempdir().unwrap();
    let handle = crashcap_create();
    assert_ne!(handle, 0);

    let first = c_path(&dir.path().join("one.dmp"));
    let second = c_path(&dir.path().join("two.dmp"));
    let result = unsafe { crashcap_write_dump(handle, first.as_ptr()) };
    assert!(result.success);
    message(result);
    let result = unsafe { crashcap_write_dump(handle, second.as_ptr()) };
    assert!(result.success);
    message(result);

    for name in ["one.dmp", "two.dmp"] {
        let bytes = std::fs::read(dir.path().join(name)).unwrap();
        assert_eq!(&bytes[..4], b"MDMP");
    }

    let result = crashcap_free(handle);
    assert!(result.success);
    assert_eq!(message(result), None);

    let result = crashcap_free(handle);
    assert!(!result.success);
    assert!(message(result).unwrap().contains("after free"));
}

#[test]
fn test_write_after_free_is_reported()
{
    let dir = tempfile::tempdir().unwrap();
    let handle = crashcap_create();
    assert!(crashcap_free(handle).success);

    let path = c_path(&dir.path().join("late.dmp"));
    let result = unsafe { crashcap_write_dump(handle, path.as_ptr()) };
    assert!(!result.success);
    assert!(message(result).unwrap().contains("after free"));
    assert!(!dir.path().join("late.dmp").exists());
}

#[test]
fn test_bad_paths_are_invalid_arguments()
{
    let handle = crashcap_create();

    let result = unsafe { crashcap_write_dump(handle, ptr::null()) };
    assert!(!result.success);
    assert!(message(result).unwrap().contains("Invalid argument"));

    let not_utf8 = CString::new(vec![b'/', b't', b'm', b'p', b'/', 0xff, 0xfe]).unwrap();
    let result = unsafe { crashcap_write_dump(handle, not_utf8.as_ptr()) };
    assert!(!result.success);
    assert!(message(result).unwrap().contains("UTF-8"));

    assert!(crashcap_free(handle).success);
}

#[test]
fn test_unknown_handle_is_rejected()
{
    let result = crashcap_free(0);
    assert!(!result.success);
    assert!(message(result).unwrap().contains("unknown handle"));
}

#[test]
fn test_exception_values_reach_the_dump()
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exception.dmp");
    let c_path = c_path(&path);

    let handle = crashcap_create();
    let result = unsafe { crashcap_write_dump_with_exception(handle, c_path.as_ptr(), 0x1234, 99, 0xdead_beef) };
    assert!(result.success);
    message(result);
    assert!(crashcap_free(handle).success);

    let dump = Minidump::read_path(&path).unwrap();
    let exception: MinidumpException = dump.get_stream().unwrap();
    assert_eq!(exception.raw.exception_record.exception_code, 0x1234);
    assert_eq!(exception.raw.exception_record.exception_flags, 99);
    assert_eq!(exception.raw.exception_record.exception_information[1], 99);
    assert_eq!(exception.raw.exception_record.exception_address, 0xdead_beef);
}

#[test]
fn test_install_and_uninstall_handlers()
{
    let dir = tempfile::tempdir().unwrap();
    let path = c_path(&dir.path().join("crash.dmp"));

    let result = unsafe { crashcap_install_handlers(ptr::null()) };
    assert!(!result.success);
    message(result);

    let result = unsafe { crashcap_install_handlers(path.as_ptr()) };
    assert!(result.success);
    message(result);

    let result = unsafe { crashcap_install_handlers(path.as_ptr()) };
    assert!(!result.success);
    assert!(message(result).unwrap().contains("already installed"));

    assert!(crashcap_uninstall_handlers().success);
    assert!(crashcap_uninstall_handlers().success);
    assert!(!dir.path().join("crash.dmp").exists());
}

#[test]
fn test_register_host_thread()
{
    std::thread::spawn(|| {
        let result = crashcap_register_current_thread();
        assert!(result.success);
        assert_eq!(message(result), None);

        // A second call keeps the stack already in place
        let result = crashcap_register_current_thread();
        assert!(result.success);
        assert_eq!(message(result), None);
    })
    .join()
    .unwrap();
}

#[test]
fn test_free_message_accepts_null()
{
    unsafe { crashcap_free_message(ptr::null_mut()) };
}
