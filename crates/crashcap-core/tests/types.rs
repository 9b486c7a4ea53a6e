//! Tests for platform-agnostic types

use crashcap_core::types::{Address, Architecture, ContextValidity, CpuContext, OsFamily, ProcessId, RegisterSet, ThreadId};

#[test]
fn test_process_id_round_trips_u32()
{
    let pid = ProcessId::from(12345);
    let value: u32 = pid.into();
    assert_eq!(value, 12345);
    assert_eq!(ProcessId::current().0, std::process::id());
}

#[test]
fn test_thread_id_display()
{
    let thread = ThreadId::from(4242);
    assert_eq!(thread.raw(), 4242);
    assert_eq!(format!("{}", thread), "4242");
}

#[test]
fn test_address_arithmetic()
{
    let addr = Address::from(0x1000);
    assert_eq!((addr + 0x10).value(), 0x1010);
    assert_eq!(addr.saturating_sub(0x2000), Address::ZERO);
    assert_eq!(Address::new(u64::MAX).saturating_add(1).value(), u64::MAX);
    assert_eq!(Address::new(0x1fff).align_down(0x1000), Address::new(0x1000));
}

#[test]
fn test_native_architecture_is_known()
{
    let arch = Architecture::current();
    if cfg!(target_arch = "x86_64") {
        assert_eq!(arch, Architecture::X86_64);
        assert_eq!(arch.processor_architecture(), 9);
        assert_eq!(arch.red_zone(), 128);
    } else if cfg!(target_arch = "aarch64") {
        assert_eq!(arch, Architecture::Arm64);
        assert_eq!(arch.processor_architecture(), 12);
        assert_eq!(arch.red_zone(), 0);
    }
}

#[test]
fn test_platform_ids_use_breakpad_values()
{
    assert_eq!(OsFamily::Linux.platform_id(), 0x8201);
    assert_eq!(OsFamily::MacOs.platform_id(), 0x8101);
}

#[test]
fn test_control_registers_round_trip()
{
    let mut context = CpuContext::zeroed_native();
    context.set_control(0x4000_1000, 0x7fff_0000);
    assert_eq!(context.pc().value(), 0x4000_1000);
    assert_eq!(context.sp().value(), 0x7fff_0000);
    assert_eq!(context.architecture(), Architecture::current());
}

#[test]
fn test_register_set_validity()
{
    assert!(!RegisterSet::empty().has_control());

    let full = RegisterSet::full(CpuContext::zeroed_native());
    assert!(full.has_control());
    assert!(full.validity.contains(ContextValidity::INTEGER | ContextValidity::FLOATING));
}
