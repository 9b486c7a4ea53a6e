//! Machine and kernel facts for the system info stream.
//!
//! Queried on the healthy path only: once at install time for fault dumps,
//! per call for on-demand dumps.

use std::ffi::CStr;
use std::mem::MaybeUninit;

use crate::snapshot::SystemSnapshot;

pub fn system_snapshot() -> SystemSnapshot
{
    let mut system = SystemSnapshot::unknown();

    // SAFETY: sysconf has no preconditions
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    system.cpu_count = u8::try_from(online.max(1)).unwrap_or(u8::MAX);

    let mut uts = MaybeUninit::<libc::utsname>::zeroed();
    // SAFETY: `uts` is valid for writes of one utsname
    if unsafe { libc::uname(uts.as_mut_ptr()) } == 0 {
        // SAFETY: uname succeeded and NUL-terminated every field
        let uts = unsafe { uts.assume_init() };
        let release = field(&uts.release);
        let (major, minor, build) = parse_release(release);
        system.os_major = major;
        system.os_minor = minor;
        system.os_build = build;
        system.set_description(&[field(&uts.sysname), release, field(&uts.version), field(&uts.machine)]);
    }

    fill_cpu_info(&mut system);
    system
}

fn field(raw: &[libc::c_char]) -> &[u8]
{
    // SAFETY: c_char and u8 have the same layout
    let bytes = unsafe { std::slice::from_raw_parts(raw.as_ptr().cast::<u8>(), raw.len()) };
    CStr::from_bytes_until_nul(bytes).map_or(bytes, CStr::to_bytes)
}

/// `major.minor.patch[-suffix]` as found in `uname -r`
fn parse_release(release: &[u8]) -> (u32, u32, u32)
{
    let mut numbers = release
        .split(|&byte| byte == b'.')
        .map(|part| {
            let digits = part.iter().take_while(|byte| byte.is_ascii_digit()).count();
            std::str::from_utf8(&part[..digits])
                .ok()
                .and_then(|digits| digits.parse().ok())
                .unwrap_or(0)
        });
    (
        numbers.next().unwrap_or(0),
        numbers.next().unwrap_or(0),
        numbers.next().unwrap_or(0),
    )
}

#[cfg(target_arch = "x86_64")]
fn fill_cpu_info(system: &mut SystemSnapshot)
{
    use std::arch::x86_64::__cpuid;

    // SAFETY: every x86_64 CPU implements cpuid leaves 0 and 1
    #[allow(unused_unsafe)]
    let (vendor, version) = unsafe { (__cpuid(0), __cpuid(1)) };

    let family = (version.eax >> 8) & 0xf;
    let model = (version.eax >> 4) & 0xf;
    let stepping = version.eax & 0xf;
    let (family, model) = if family == 0xf {
        (family + ((version.eax >> 20) & 0xff), model | ((version.eax >> 12) & 0xf0))
    } else {
        (family, model)
    };
    system.processor_level = family as u16;
    system.processor_revision = ((model << 8) | stepping) as u16;

    // CPU_INFORMATION.X86CpuInfo: vendor id (ebx, edx, ecx), version, features
    let words = [vendor.ebx, vendor.edx, vendor.ecx, version.eax, version.edx, 0];
    for (slot, word) in system.cpu_info.chunks_exact_mut(4).zip(words) {
        slot.copy_from_slice(&word.to_le_bytes());
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn fill_cpu_info(_system: &mut SystemSnapshot) {}
