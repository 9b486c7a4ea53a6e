//! Fault-tolerant reads of our own memory.
//!
//! A plain pointer read of an unmapped or guard page would fault again inside
//! the handler. `process_vm_readv` against our own pid reports `EFAULT`
//! instead, and stops early at the first unreadable page.
//!
//! Sandboxes that filter `process_vm_readv` (older container seccomp
//! profiles) get a `pread` of `/proc/self/mem` instead, which fails with
//! `EIO` on unmapped ranges.

use std::io;

use super::procfs::RawFile;
use crate::types::Address;

/// Copy memory at `address` into `buffer`
///
/// Returns the number of bytes copied (possibly fewer than requested), or
/// `None` when nothing at `address` is readable.
pub fn read_self(address: Address, buffer: &mut [u8]) -> Option<usize>
{
    if buffer.is_empty() {
        return Some(0);
    }
    let local = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };
    let remote = libc::iovec {
        iov_base: address.value() as *mut libc::c_void,
        iov_len: buffer.len(),
    };
    // SAFETY: `local` describes `buffer`; the kernel validates `remote`
    let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if read > 0 {
        return Some(read as usize);
    }
    if read < 0 {
        let errno = io::Error::last_os_error().raw_os_error();
        if matches!(errno, Some(libc::ENOSYS | libc::EPERM)) {
            return read_proc_mem(address, buffer);
        }
    }
    None
}

fn read_proc_mem(address: Address, buffer: &mut [u8]) -> Option<usize>
{
    let file = RawFile::open(c"/proc/self/mem")?;
    let offset = libc::off_t::try_from(address.value()).ok()?;
    // SAFETY: `buffer` is valid for writes of `buffer.len()` bytes
    let read = unsafe { libc::pread(file.fd(), buffer.as_mut_ptr().cast(), buffer.len(), offset) };
    (read > 0).then_some(read as usize)
}
