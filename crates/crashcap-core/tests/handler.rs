//! Tests for installing and removing the fault handlers
//!
//! Signal actions are process-wide, so the install/uninstall sequence runs in
//! one test. Alternate stacks are per thread and get tests of their own.

use std::{mem, ptr};

use crashcap_core::config::{CaptureLimits, DumpTarget, HandlerConfig};
use crashcap_core::error::CaptureError;
use crashcap_core::handler;

#[test]
fn test_handler_lifecycle()
{
    let dir = tempfile::tempdir().unwrap();
    let dumps = dir.path().join("dumps");
    assert!(!handler::is_installed());

    // Uninstalling with nothing installed is a no-op
    handler::uninstall();
    assert!(!handler::is_installed());

    handler::install(HandlerConfig::new(DumpTarget::directory(&dumps)).with_prefix("lifecycle")).unwrap();
    assert!(handler::is_installed());
    assert!(dumps.is_dir());

    // A second install is refused and leaves the first in place
    let again = handler::install_at(dir.path().join("other.dmp"));
    assert!(matches!(again, Err(CaptureError::AlreadyInstalled)));
    assert!(handler::is_installed());

    handler::uninstall();
    assert!(!handler::is_installed());
    handler::uninstall();

    // Installing again after uninstall works
    handler::install_at(dir.path().join("crash.dmp")).unwrap();
    assert!(handler::is_installed());
    handler::uninstall();

    // Invalid configurations are rejected before anything is registered
    let bad_limits = HandlerConfig::file(dir.path().join("x.dmp")).with_limits(CaptureLimits::default().with_max_modules(0));
    assert!(matches!(handler::install(bad_limits), Err(CaptureError::InvalidArgument(_))));
    let bad_prefix = HandlerConfig::new(DumpTarget::directory(&dumps)).with_prefix("a/b");
    assert!(matches!(handler::install(bad_prefix), Err(CaptureError::InvalidArgument(_))));
    assert!(!handler::is_installed());

    // No fault happened, so nothing was written
    assert_eq!(std::fs::read_dir(&dumps).unwrap().count(), 0);
}

fn alt_stack() -> libc::stack_t
{
    let mut current: libc::stack_t = unsafe { mem::zeroed() };
    assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
    current
}

#[test]
fn test_registered_thread_gets_a_capture_sized_stack()
{
    std::thread::spawn(|| {
        handler::register_current_thread().unwrap();
        let registered = alt_stack();
        assert_eq!(registered.ss_flags & libc::SS_DISABLE, 0);
        assert!(registered.ss_size >= handler::ALT_STACK_SIZE);

        // Registering again keeps the same stack
        handler::register_current_thread().unwrap();
        assert_eq!(alt_stack().ss_sp, registered.ss_sp);
    })
    .join()
    .unwrap();
}
