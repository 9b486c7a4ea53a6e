//! Async-signal-safe access to `/proc/self`.
//!
//! `std::fs` allocates for paths and buffers, so files are opened with raw
//! `open(2)` on a [`FixedPath`] and read into caller-supplied buffers.

use std::ffi::CStr;
use std::io;

use crate::fixed::{FixedPath, PATH_CAPACITY};

/// Owned read-only descriptor, closed on drop
pub struct RawFile
{
    fd: libc::c_int,
}

impl RawFile
{
    pub fn open(path: &CStr) -> Option<Self>
    {
        Self::open_with(path, libc::O_RDONLY | libc::O_CLOEXEC)
    }

    pub fn open_dir(path: &CStr) -> Option<Self>
    {
        Self::open_with(path, libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC)
    }

    fn open_with(path: &CStr, flags: libc::c_int) -> Option<Self>
    {
        loop {
            // SAFETY: `path` is NUL-terminated
            let fd = unsafe { libc::open(path.as_ptr(), flags) };
            if fd >= 0 {
                return Some(Self { fd });
            }
            if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return None;
            }
        }
    }

    pub const fn fd(&self) -> libc::c_int
    {
        self.fd
    }

    /// One `read(2)`; `None` on error, `Some(0)` at end of file
    pub fn read(&self, buffer: &mut [u8]) -> Option<usize>
    {
        loop {
            // SAFETY: `buffer` is valid for writes of `buffer.len()` bytes
            let read = unsafe { libc::read(self.fd, buffer.as_mut_ptr().cast(), buffer.len()) };
            if read >= 0 {
                return Some(read as usize);
            }
            if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return None;
            }
        }
    }

    /// Read until `buffer` is full or the file ends
    pub fn read_fill(&self, buffer: &mut [u8]) -> Option<usize>
    {
        let mut filled = 0;
        while filled < buffer.len() {
            match self.read(&mut buffer[filled..])? {
                0 => break,
                read => filled += read,
            }
        }
        Some(filled)
    }
}

impl Drop for RawFile
{
    fn drop(&mut self)
    {
        // SAFETY: we own `fd` and close it once
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Room for `/proc/self/task/<u32>/<leaf>` with a short leaf
pub const TASK_PATH_CAPACITY: usize = 64;

/// `/proc/self/task/<tid>/<leaf>`
pub fn task_path(tid: u32, leaf: &[u8]) -> FixedPath<TASK_PATH_CAPACITY>
{
    let mut path = FixedPath::new();
    path.push_bytes(b"/proc/self/task/").push_decimal(u64::from(tid)).push_bytes(b"/").push_bytes(leaf);
    path
}

/// Line iterator over a file, using only the supplied buffer
///
/// Lines longer than the buffer are skipped whole.
pub struct LineReader<'b>
{
    file: RawFile,
    buffer: &'b mut [u8],
    start: usize,
    end: usize,
    eof: bool,
    skipping: bool,
}

impl<'b> LineReader<'b>
{
    pub fn new(file: RawFile, buffer: &'b mut [u8]) -> Self
    {
        Self {
            file,
            buffer,
            start: 0,
            end: 0,
            eof: false,
            skipping: false,
        }
    }

    /// The next line without its newline, or `None` at end of file (or on a read error)
    pub fn next_line(&mut self) -> Option<&[u8]>
    {
        loop {
            if let Some(newline) = self.buffer[self.start..self.end].iter().position(|&byte| byte == b'\n') {
                let line_start = self.start;
                self.start += newline + 1;
                if self.skipping {
                    self.skipping = false;
                    continue;
                }
                return Some(&self.buffer[line_start..line_start + newline]);
            }

            if self.eof {
                if self.start < self.end && !self.skipping {
                    let line_start = self.start;
                    self.start = self.end;
                    return Some(&self.buffer[line_start..self.end]);
                }
                return None;
            }

            if self.start > 0 {
                self.buffer.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            if self.end == self.buffer.len() {
                // No newline in a full buffer: drop what we have and skip to the next line
                self.skipping = true;
                self.end = 0;
            }

            match self.file.read(&mut self.buffer[self.end..]) {
                Some(0) | None => self.eof = true,
                Some(read) => self.end += read,
            }
        }
    }
}

/// Parse an unsigned hex number, with or without a `0x` prefix
pub fn parse_hex(token: &[u8]) -> Option<u64>
{
    let digits = token.strip_prefix(b"0x").unwrap_or(token);
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    digits.iter().try_fold(0u64, |value, &byte| {
        let digit = (byte as char).to_digit(16)?;
        Some(value << 4 | u64::from(digit))
    })
}

/// Parse an unsigned decimal number
pub fn parse_decimal(token: &[u8]) -> Option<u64>
{
    if token.is_empty() {
        return None;
    }
    token.iter().try_fold(0u64, |value, &byte| {
        let digit = (byte as char).to_digit(10)?;
        value.checked_mul(10)?.checked_add(u64::from(digit))
    })
}

#[cfg(test)]
mod tests
{
    use std::io::Write;

    use super::*;

    fn open_temp(contents: &[u8]) -> (tempfile::NamedTempFile, RawFile)
    {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        let path = FixedPath::<PATH_CAPACITY>::from_bytes(file.path().as_os_str().as_encoded_bytes()).unwrap();
        let raw = RawFile::open(path.as_c_str().unwrap()).unwrap();
        (file, raw)
    }

    #[test]
    fn test_line_reader_splits_lines()
    {
        let mut buffer = [0u8; 64];
        let (_guard, file) = open_temp(b"first\nsecond\nlast");
        let mut reader = LineReader::new(file, &mut buffer);
        assert_eq!(reader.next_line(), Some(&b"first"[..]));
        assert_eq!(reader.next_line(), Some(&b"second"[..]));
        assert_eq!(reader.next_line(), Some(&b"last"[..]));
        assert_eq!(reader.next_line(), None);
    }

    #[test]
    fn test_line_reader_skips_overlong_lines()
    {
        let mut contents = vec![b'x'; 40];
        contents.extend_from_slice(b"\nshort\n");
        let mut buffer = [0u8; 16];
        let (_guard, file) = open_temp(&contents);
        let mut reader = LineReader::new(file, &mut buffer);
        assert_eq!(reader.next_line(), Some(&b"short"[..]));
        assert_eq!(reader.next_line(), None);
    }

    #[test]
    fn test_parse_hex_accepts_prefix()
    {
        assert_eq!(parse_hex(b"0x7ffd1000"), Some(0x7ffd_1000));
        assert_eq!(parse_hex(b"00400000"), Some(0x40_0000));
        assert_eq!(parse_hex(b"0xzz"), None);
        assert_eq!(parse_hex(b""), None);
    }

    #[test]
    fn test_task_path_formats_tid()
    {
        assert_eq!(task_path(77, b"syscall").as_bytes(), b"/proc/self/task/77/syscall");
        assert!(task_path(u32::MAX, b"syscall").is_valid());
    }
}
