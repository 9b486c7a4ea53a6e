//! # macOS Memory Operations
//!
//! Fault-tolerant reads of our own address space and region lookup.
//!
//! `mach_vm_read_overwrite()` copies into a caller buffer and fails cleanly
//! on unmapped or unreadable pages instead of raising a signal. It fails for
//! the whole range, so reads go page by page and stop at the first page that
//! cannot be read.
//!
//! ## References
//!
//! - [mach_vm_read_overwrite](https://developer.apple.com/documentation/kernel/1402127-mach_vm_read_overwrite)
//! - [mach_vm_region_recurse](https://developer.apple.com/documentation/kernel/1402149-mach_vm_region_recurse)

use libc::vm_map_t;
use mach2::kern_return::KERN_SUCCESS;
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region_recurse};
use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_recurse_info_t, vm_region_submap_short_info_data_64_t, VM_REGION_SUBMAP_SHORT_INFO_COUNT_64};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t};

use crate::types::Address;

/// Smallest page size on any supported Mac; reads are split on this boundary
const READ_PAGE: u64 = 4096;

/// Copy memory at `address` into `buffer`
///
/// Returns the number of bytes copied before the first unreadable page, or
/// `None` when nothing could be read.
pub fn read_self(address: Address, buffer: &mut [u8]) -> Option<usize>
{
    let mut copied = 0usize;
    while copied < buffer.len() {
        let cursor = address.value().checked_add(copied as u64)?;
        let to_boundary = READ_PAGE - (cursor % READ_PAGE);
        let chunk = (buffer.len() - copied).min(to_boundary as usize);
        let mut actual: mach_vm_size_t = 0;
        // SAFETY: the destination range lies inside `buffer`
        let result = unsafe {
            mach_vm_read_overwrite(
                mach_task_self() as vm_map_t,
                cursor as mach_vm_address_t,
                chunk as mach_vm_size_t,
                buffer[copied..].as_mut_ptr() as mach_vm_address_t,
                &mut actual,
            )
        };
        if result != KERN_SUCCESS || actual == 0 {
            break;
        }
        copied += actual as usize;
    }
    (copied > 0).then_some(copied)
}

/// A VM region of our task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region
{
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    /// Any of read, write or execute
    pub accessible: bool,
}

impl Region
{
    pub const fn contains(&self, address: u64) -> bool
    {
        self.start <= address && address < self.end
    }
}

/// The region containing `address`, or the first one above it
///
/// Submaps (the shared cache) are descended into so the result is a leaf region.
pub fn region_at_or_above(address: u64) -> Option<Region>
{
    let mut start: mach_vm_address_t = address;
    let mut depth: natural_t = 0;
    loop {
        let mut size: mach_vm_size_t = 0;
        let mut info = vm_region_submap_short_info_data_64_t::default();
        let mut count = VM_REGION_SUBMAP_SHORT_INFO_COUNT_64;
        // SAFETY: all out-pointers are valid for the duration of the call
        let result = unsafe {
            mach_vm_region_recurse(
                mach_task_self() as vm_map_t,
                &mut start,
                &mut size,
                &mut depth,
                &mut info as *mut _ as vm_region_recurse_info_t,
                &mut count,
            )
        };
        if result != KERN_SUCCESS {
            return None;
        }
        if info.is_submap != 0 {
            depth += 1;
            continue;
        }
        return Some(Region {
            start,
            end: start.saturating_add(size),
            readable: info.protection & VM_PROT_READ != 0,
            accessible: info.protection & (VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE) != 0,
        });
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_reads_across_page_boundary()
    {
        let data = vec![0x5au8; 3 * READ_PAGE as usize];
        let start = data.as_ptr() as u64 + READ_PAGE - 16;
        let mut buffer = [0u8; 64];
        assert_eq!(read_self(Address::new(start), &mut buffer), Some(64));
        assert!(buffer.iter().all(|&byte| byte == 0x5a));
    }

    #[test]
    fn test_null_page_is_unreadable()
    {
        let mut buffer = [0u8; 16];
        assert_eq!(read_self(Address::ZERO, &mut buffer), None);
    }

    #[test]
    fn test_stack_variable_region()
    {
        let local = 7u64;
        let here = std::ptr::addr_of!(local) as u64;
        let region = region_at_or_above(here).unwrap();
        assert!(region.contains(here));
        assert!(region.readable);
    }
}
