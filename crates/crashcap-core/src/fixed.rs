//! Fixed-capacity byte strings for the fault path.
//!
//! Paths like `/proc/self/task/1234/syscall` or `dumps/crash_sigsegv_1700000000.dmp`
//! have to be assembled inside the signal handler. `FixedPath` builds them in
//! an inline array and hands out a NUL-terminated pointer for `open(2)`.
//! Numbers are formatted with `itoa`, which never allocates.

use std::ffi::CStr;

/// `PATH_MAX` on Linux and macOS is at most 4096
pub const PATH_CAPACITY: usize = 4096;

/// Inline, NUL-terminated path buffer
///
/// Pushes that would not fit (including the terminator) are rejected and
/// leave the buffer marked as overflowed, so a truncated path is never opened.
#[derive(Clone)]
pub struct FixedPath<const N: usize = PATH_CAPACITY>
{
    bytes: [u8; N],
    len: usize,
    overflowed: bool,
}

impl<const N: usize> FixedPath<N>
{
    pub const fn new() -> Self
    {
        Self {
            bytes: [0; N],
            len: 0,
            overflowed: false,
        }
    }

    /// Build a path from a byte string
    pub fn from_bytes(bytes: &[u8]) -> Option<Self>
    {
        let mut path = Self::new();
        path.push_bytes(bytes);
        path.is_valid().then_some(path)
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self
    {
        // Interior NULs would silently shorten the path seen by the kernel
        if bytes.contains(&0) || self.len + bytes.len() >= N {
            self.overflowed = true;
            return self;
        }
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.bytes[self.len] = 0;
        self
    }

    pub fn push_decimal(&mut self, value: u64) -> &mut Self
    {
        let mut buffer = itoa::Buffer::new();
        let digits = buffer.format(value);
        self.push_bytes(digits.as_bytes())
    }

    /// Empty the buffer and clear the overflow mark
    pub fn clear(&mut self)
    {
        self.len = 0;
        self.overflowed = false;
        self.bytes[0] = 0;
    }

    /// Drop everything after the first `len` bytes
    pub fn truncate(&mut self, len: usize)
    {
        if len < self.len {
            self.len = len;
            self.bytes[len] = 0;
        }
    }

    pub const fn len(&self) -> usize
    {
        self.len
    }

    pub const fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    /// `false` once any push was rejected
    pub const fn is_valid(&self) -> bool
    {
        !self.overflowed && self.len > 0
    }

    pub fn as_bytes(&self) -> &[u8]
    {
        &self.bytes[..self.len]
    }

    /// NUL-terminated view, or `None` if the path overflowed or is empty
    pub fn as_c_str(&self) -> Option<&CStr>
    {
        if !self.is_valid() {
            return None;
        }
        CStr::from_bytes_with_nul(&self.bytes[..=self.len]).ok()
    }
}

impl<const N: usize> Default for FixedPath<N>
{
    fn default() -> Self
    {
        Self::new()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_builds_proc_path()
    {
        let mut path = FixedPath::<64>::new();
        path.push_bytes(b"/proc/self/task/").push_decimal(4242).push_bytes(b"/syscall");
        assert_eq!(path.as_bytes(), b"/proc/self/task/4242/syscall");
        assert_eq!(path.as_c_str().map(CStr::to_bytes), Some(&b"/proc/self/task/4242/syscall"[..]));
    }

    #[test]
    fn test_overflow_invalidates_path()
    {
        let mut path = FixedPath::<8>::new();
        path.push_bytes(b"/tmp/").push_bytes(b"much-too-long");
        assert!(!path.is_valid());
        assert!(path.as_c_str().is_none());
    }

    #[test]
    fn test_clear_allows_reuse_after_overflow()
    {
        let mut path = FixedPath::<8>::new();
        path.push_bytes(b"much-too-long");
        assert!(!path.is_valid());

        path.clear();
        path.push_bytes(b"/tmp/a");
        assert_eq!(path.as_c_str().map(CStr::to_bytes), Some(&b"/tmp/a"[..]));
    }

    #[test]
    fn test_interior_nul_is_rejected()
    {
        assert!(FixedPath::<32>::from_bytes(b"/tmp/a\0b").is_none());
    }

    #[test]
    fn test_truncate_restores_prefix()
    {
        let mut path = FixedPath::<32>::from_bytes(b"/tmp/dumps").unwrap();
        let base = path.len();
        path.push_bytes(b"/a.dmp");
        path.truncate(base);
        assert_eq!(path.as_bytes(), b"/tmp/dumps");
    }
}
