//! # Loaded Images
//!
//! dyld publishes the list of loaded images in `dyld_all_image_infos`, whose
//! address `task_info(TASK_DYLD_INFO)` reports. Every structure involved is
//! read through [`read_self`], so a list that is being updated while we look
//! at it costs us modules, not a second fault.
//!
//! Mach-O headers are parsed in place with `object`: `LC_UUID` gives the
//! identity and the `__TEXT` segment the module size.

use libc::c_int;
use mach2::kern_return::KERN_SUCCESS;
use mach2::traps::mach_task_self;
use object::macho::{MachHeader64, LC_SEGMENT_64, LC_UUID};
use object::read::macho::MachHeader;
use object::Endianness;

use super::ffi::{self, TaskDyldInfo, TASK_DYLD_INFO, TASK_DYLD_INFO_COUNT};
use super::memory::read_self;
use crate::snapshot::{IdentitySource, Incomplete, ModuleIdentity, SnapshotStorage};
use crate::types::Address;

/// `dyld_all_image_infos` fields we use: version, count, array, and dyld's own load address
const INFOS_HEADER_BYTES: usize = 40;
const INFO_ARRAY_OFFSET: usize = 8;
const DYLD_LOAD_ADDRESS_OFFSET: usize = 32;
/// Size of one `dyld_image_info` (load address, path pointer, mod date)
const IMAGE_INFO_BYTES: usize = 24;
/// Longest path kept per image
const PATH_BYTES: usize = 1024;

/// Add every loaded image (and dyld itself) to `storage`
pub fn collect_images(storage: &mut SnapshotStorage, scratch: &mut [u8])
{
    let Some(infos) = all_image_infos() else {
        storage.mark(Incomplete::MODULES);
        return;
    };

    let mut header = [0u8; INFOS_HEADER_BYTES];
    if read_self(infos, &mut header) != Some(INFOS_HEADER_BYTES) {
        storage.mark(Incomplete::MODULES);
        return;
    }
    let count = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let array = read_u64(&header, INFO_ARRAY_OFFSET);
    let dyld = read_u64(&header, DYLD_LOAD_ADDRESS_OFFSET);

    let (path, image) = scratch.split_at_mut(PATH_BYTES);
    if array == 0 {
        // dyld is rewriting the list right now
        storage.mark(Incomplete::MODULES);
    }
    for index in 0..u64::from(count) {
        if array == 0 {
            break;
        }
        let mut info = [0u8; IMAGE_INFO_BYTES];
        let at = array.saturating_add(index * IMAGE_INFO_BYTES as u64);
        if read_self(Address::new(at), &mut info) != Some(IMAGE_INFO_BYTES) {
            storage.mark(Incomplete::MODULES);
            break;
        }
        let base = read_u64(&info, 0);
        let name = read_c_string(read_u64(&info, 8), path);
        if !add_image(storage, base, name, image) {
            break;
        }
    }

    if dyld != 0 {
        add_image(storage, dyld, b"/usr/lib/dyld", image);
    }
}

/// Returns `false` once the module list is full
fn add_image(storage: &mut SnapshotStorage, base: u64, name: &[u8], image: &mut [u8]) -> bool
{
    if storage.modules_full() {
        storage.mark(Incomplete::MODULES);
        return false;
    }
    let Some(len) = read_self(Address::new(base), image) else {
        return true;
    };
    let Some((size, identity)) = parse_image(&image[..len]) else {
        return true;
    };
    let _ = storage.add_module(Address::new(base), size, name, identity);
    true
}

/// `__TEXT` size and `LC_UUID` of a 64-bit Mach-O image
pub fn parse_image(data: &[u8]) -> Option<(u64, ModuleIdentity)>
{
    let header = MachHeader64::<Endianness>::parse(data, 0).ok()?;
    let endian = header.endian().ok()?;
    let mut commands = header.load_commands(endian, data, 0).ok()?;

    let mut size = None;
    let mut identity = ModuleIdentity::UNKNOWN;
    while let Ok(Some(command)) = commands.next() {
        match command.cmd() {
            LC_SEGMENT_64 => {
                if let Ok(Some((segment, _))) = command.segment_64() {
                    if trim_name(&segment.segname) == b"__TEXT" {
                        size = Some(segment.vmsize.get(endian));
                    }
                }
            }
            LC_UUID => {
                if let Ok(Some(uuid)) = command.uuid() {
                    identity = ModuleIdentity::new(IdentitySource::MachOUuid, &uuid.uuid);
                }
            }
            _ => {}
        }
    }
    Some((size?, identity))
}

fn all_image_infos() -> Option<Address>
{
    let mut info = TaskDyldInfo::default();
    let mut count = TASK_DYLD_INFO_COUNT;
    // SAFETY: `info` is TASK_DYLD_INFO_COUNT natural_t words long
    let result = unsafe {
        ffi::task_info(
            mach_task_self(),
            TASK_DYLD_INFO,
            (&mut info as *mut TaskDyldInfo).cast::<c_int>(),
            &mut count,
        )
    };
    let address = info.all_image_info_addr;
    (result == KERN_SUCCESS && address != 0).then(|| Address::new(address))
}

fn read_u64(bytes: &[u8], at: usize) -> u64
{
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

/// Copy a NUL-terminated string from our memory into `buffer`
fn read_c_string(address: u64, buffer: &mut [u8]) -> &[u8]
{
    if address == 0 {
        return &[];
    }
    let len = read_self(Address::new(address), buffer).unwrap_or(0);
    let bytes = &buffer[..len];
    let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(len);
    &bytes[..end]
}

fn trim_name(name: &[u8; 16]) -> &[u8]
{
    let end = name.iter().position(|&byte| byte == 0).unwrap_or(name.len());
    &name[..end]
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::config::CaptureLimits;

    #[test]
    fn test_collects_system_libraries()
    {
        let mut storage = SnapshotStorage::new(&CaptureLimits::default());
        let mut scratch = vec![0u8; 16 * 1024];
        collect_images(&mut storage, &mut scratch);

        assert!(storage.modules().len() > 1);
        let names: Vec<&[u8]> = storage.modules().iter().map(|module| storage.module_name(module)).collect();
        assert!(names.iter().any(|name| name.ends_with(b"libSystem.B.dylib")));
        assert!(names.contains(&&b"/usr/lib/dyld"[..]));
        assert!(storage
            .modules()
            .iter()
            .all(|module| module.size > 0 && module.identity.source == IdentitySource::MachOUuid));
    }

    #[test]
    fn test_garbage_is_not_an_image()
    {
        assert!(parse_image(&[0u8; 64]).is_none());
    }
}
