//! Machine and OS facts for the system info stream.
//!
//! The product version (`14.4.1`) gives the major/minor/build numbers; the
//! kernel build string (`23E224`) goes into the description next to it.

use std::ffi::CStr;

use crate::snapshot::SystemSnapshot;

/// Longest sysctl string we read
const SYSCTL_BYTES: usize = 64;

pub fn system_snapshot() -> SystemSnapshot
{
    let mut system = SystemSnapshot::unknown();

    // SAFETY: sysconf has no preconditions
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    system.cpu_count = u8::try_from(online.max(1)).unwrap_or(u8::MAX);

    let mut product = [0u8; SYSCTL_BYTES];
    let mut build = [0u8; SYSCTL_BYTES];
    let product = sysctl_string(c"kern.osproductversion", &mut product);
    let build = sysctl_string(c"kern.osversion", &mut build);
    let (major, minor, patch) = parse_product_version(product);
    system.os_major = major;
    system.os_minor = minor;
    system.os_build = patch;
    system.set_description(&[b"macOS", product, build]);

    fill_cpu_info(&mut system);
    system
}

/// String value of a sysctl, or empty when it does not exist
fn sysctl_string<'b>(name: &CStr, buffer: &'b mut [u8]) -> &'b [u8]
{
    let mut len = buffer.len();
    // SAFETY: `buffer` is valid for `len` bytes and `len` is updated in place
    let result = unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            buffer.as_mut_ptr().cast(),
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if result != 0 {
        return &[];
    }
    let bytes = &buffer[..len.min(buffer.len())];
    CStr::from_bytes_until_nul(bytes).map_or(bytes, CStr::to_bytes)
}

/// `major.minor[.patch]`
fn parse_product_version(version: &[u8]) -> (u32, u32, u32)
{
    let mut numbers = version.split(|&byte| byte == b'.').map(|part| {
        std::str::from_utf8(part)
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
    let model = ((version.eax >> 4) & 0xf) | ((version.eax >> 12) & 0xf0);
    system.processor_level = family as u16;
    system.processor_revision = ((model << 8) | (version.eax & 0xf)) as u16;

    let words = [vendor.ebx, vendor.edx, vendor.ecx, version.eax, version.edx, 0];
    for (slot, word) in system.cpu_info.chunks_exact_mut(4).zip(words) {
        slot.copy_from_slice(&word.to_le_bytes());
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn fill_cpu_info(_system: &mut SystemSnapshot) {}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::OsFamily;

    #[test]
    fn test_product_version_parsing()
    {
        assert_eq!(parse_product_version(b"14.4.1"), (14, 4, 1));
        assert_eq!(parse_product_version(b"13.0"), (13, 0, 0));
        assert_eq!(parse_product_version(b""), (0, 0, 0));
    }

    #[test]
    fn test_snapshot_describes_macos()
    {
        let system = system_snapshot();
        assert_eq!(system.os, OsFamily::MacOs);
        assert!(system.cpu_count >= 1);
        assert!(system.os_major >= 10);
        assert!(system.description().starts_with(b"macOS "));
    }
}
