use std::io;
use std::os::fd::RawFd;

/// Destination of an encoded dump
///
/// The serializer only ever appends, so a sink needs no seeking.
pub trait Sink
{
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>
    {
        Ok(())
    }
}

/// Sink over a raw file descriptor
///
/// Every write is a plain `write(2)` call, which is async-signal-safe. The
/// descriptor is borrowed: closing it is up to the caller.
#[derive(Debug)]
pub struct FdSink
{
    fd: RawFd,
}

impl FdSink
{
    pub const fn new(fd: RawFd) -> Self
    {
        Self { fd }
    }
}

impl Sink for FdSink
{
    fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()>
    {
        while !bytes.is_empty() {
            // SAFETY: `bytes` is valid for `bytes.len()` bytes for the duration of the call
            let written = unsafe { libc::write(self.fd, bytes.as_ptr().cast(), bytes.len()) };
            if written < 0 {
                let error = io::Error::last_os_error();
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(error);
            }
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            bytes = &bytes[written as usize..];
        }
        Ok(())
    }
}

/// Sink over any [`io::Write`]
#[derive(Debug)]
pub struct IoSink<W: io::Write>(pub W);

impl<W: io::Write> IoSink<W>
{
    pub fn into_inner(self) -> W
    {
        self.0
    }
}

impl<W: io::Write> Sink for IoSink<W>
{
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>
    {
        self.0.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()>
    {
        self.0.flush()
    }
}

#[cfg(test)]
mod tests
{
    use std::io::{Read, Seek};
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn test_writes_reach_the_descriptor()
    {
        let mut file = tempfile::tempfile().unwrap();
        let mut sink = FdSink::new(file.as_raw_fd());
        sink.write_all(b"MDMP").unwrap();

        file.rewind().unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"MDMP");
    }

    #[test]
    fn test_invalid_descriptor_reports_error()
    {
        let mut sink = FdSink::new(-1);
        assert!(sink.write_all(b"x").is_err());
    }

    #[test]
    fn test_io_sink_collects_bytes()
    {
        let mut sink = IoSink(Vec::new());
        sink.write_all(b"ab").unwrap();
        sink.write_all(b"cd").unwrap();
        assert_eq!(sink.into_inner(), b"abcd");
    }
}
