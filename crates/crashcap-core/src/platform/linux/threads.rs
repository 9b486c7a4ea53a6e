//! Thread enumeration and per-thread control registers.
//!
//! Threads are listed with `getdents64` over `/proc/self/task`. Threads other
//! than the faulting one keep running during capture; the only register
//! state the kernel exposes for them without ptrace is the stack pointer and
//! program counter in `/proc/self/task/<tid>/syscall`.

use super::procfs::{parse_hex, task_path, RawFile};

/// Header of a `linux_dirent64` record (`d_ino`, `d_off`, `d_reclen`, `d_type`)
const DIRENT_NAME_OFFSET: usize = 19;
const DIRENT_RECLEN_OFFSET: usize = 16;

/// Call `visit` with every thread id in `/proc/self/task`
///
/// Returns `false` when the directory could not be read completely.
pub fn for_each_task(buffer: &mut [u8], mut visit: impl FnMut(u32)) -> bool
{
    let Some(dir) = RawFile::open_dir(c"/proc/self/task") else {
        return false;
    };

    loop {
        // SAFETY: `buffer` is valid for writes of `buffer.len()` bytes
        let read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                dir.fd(),
                buffer.as_mut_ptr(),
                buffer.len(),
            )
        };
        if read < 0 {
            return false;
        }
        if read == 0 {
            return true;
        }

        let records = &buffer[..read as usize];
        let mut offset = 0;
        while offset + DIRENT_NAME_OFFSET <= records.len() {
            let reclen = usize::from(u16::from_ne_bytes([
                records[offset + DIRENT_RECLEN_OFFSET],
                records[offset + DIRENT_RECLEN_OFFSET + 1],
            ]));
            if reclen == 0 || offset + reclen > records.len() {
                return false;
            }
            let name = &records[offset + DIRENT_NAME_OFFSET..offset + reclen];
            let name = name.split(|&byte| byte == 0).next().unwrap_or(&[]);
            if let Some(tid) = parse_tid(name) {
                visit(tid);
            }
            offset += reclen;
        }
    }
}

/// `.` and `..` are skipped by failing to parse
fn parse_tid(name: &[u8]) -> Option<u32>
{
    super::procfs::parse_decimal(name).and_then(|tid| u32::try_from(tid).ok())
}

/// Stack pointer and program counter of a thread that is not running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegisters
{
    pub sp: u64,
    pub pc: u64,
}

/// Parse the contents of `/proc/<tid>/syscall`
///
/// The file holds the syscall number and arguments followed by the stack
/// pointer and program counter, or just `-1 sp pc` when the thread is blocked
/// outside a syscall. A thread that is on a CPU reads `running` and has no
/// usable state.
pub fn parse_syscall_line(line: &[u8]) -> Option<ControlRegisters>
{
    let mut tokens = line.split(u8::is_ascii_whitespace).filter(|token| !token.is_empty());
    let first = tokens.next()?;
    if first == b"running" {
        return None;
    }

    let (mut sp, mut pc) = (None, None);
    for token in tokens {
        sp = pc;
        pc = Some(token);
    }
    Some(ControlRegisters {
        sp: parse_hex(sp?)?,
        pc: parse_hex(pc?)?,
    })
}

/// Read the control registers of `tid`, using `buffer` as scratch
pub fn read_control_registers(tid: u32, buffer: &mut [u8]) -> Option<ControlRegisters>
{
    let path = task_path(tid, b"syscall");
    let file = RawFile::open(path.as_c_str()?)?;
    let len = file.read_fill(buffer)?;
    let line = buffer[..len].split(|&byte| byte == b'\n').next()?;
    parse_syscall_line(line)
}

/// Kernel thread id of the caller
pub fn current_tid() -> u32
{
    // SAFETY: gettid has no preconditions
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_blocked_in_syscall()
    {
        let line = b"202 0x7f1c2c000b60 0x80 0x0 0x0 0x0 0x0 0x7f1c2bffe5f8 0x7f1c31a8d7b9";
        assert_eq!(
            parse_syscall_line(line),
            Some(ControlRegisters {
                sp: 0x7f1c_2bff_e5f8,
                pc: 0x7f1c_31a8_d7b9,
            })
        );
    }

    #[test]
    fn test_blocked_outside_syscall()
    {
        assert_eq!(
            parse_syscall_line(b"-1 0x7ffc9a3d2f40 0x55d0c4a01234"),
            Some(ControlRegisters {
                sp: 0x7ffc_9a3d_2f40,
                pc: 0x55d0_c4a0_1234,
            })
        );
    }

    #[test]
    fn test_running_thread_has_no_state()
    {
        assert_eq!(parse_syscall_line(b"running"), None);
        assert_eq!(parse_syscall_line(b""), None);
    }

    #[test]
    fn test_enumerates_current_thread()
    {
        let mut buffer = [0u8; 4096];
        let mut found = false;
        let me = current_tid();
        assert!(for_each_task(&mut buffer, |tid| found |= tid == me));
        assert!(found);
    }
}
