//! `/proc/self/maps` parsing.

use super::procfs::{parse_decimal, parse_hex};

/// Permission column of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perms
{
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
}

/// One line of `/proc/self/maps`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapsEntry<'l>
{
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub inode: u64,
    /// File path, pseudo-path like `[stack]`, or empty for anonymous memory
    pub path: &'l [u8],
}

impl MapsEntry<'_>
{
    pub const fn contains(&self, address: u64) -> bool
    {
        self.start <= address && address < self.end
    }

    pub const fn len(&self) -> u64
    {
        self.end - self.start
    }

    /// Backed by a file on disk (as opposed to anonymous or `[pseudo]` mappings)
    pub fn is_file_backed(&self) -> bool
    {
        self.inode != 0 && self.path.first() == Some(&b'/')
    }
}

/// Parse `start-end perms offset dev inode [path]`
///
/// Paths may contain spaces; everything after the inode column (minus
/// leading padding) is the path.
pub fn parse_maps_line(line: &[u8]) -> Option<MapsEntry<'_>>
{
    let mut rest = line;
    let range = next_field(&mut rest);
    let perms = next_field(&mut rest);
    let offset = next_field(&mut rest);
    let _device = next_field(&mut rest);
    let inode = next_field(&mut rest);

    let dash = range.iter().position(|&byte| byte == b'-')?;
    let start = parse_hex(&range[..dash])?;
    let end = parse_hex(&range[dash + 1..])?;
    if end <= start || perms.len() < 4 {
        return None;
    }

    Some(MapsEntry {
        start,
        end,
        perms: Perms {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            exec: perms[2] == b'x',
            private: perms[3] == b'p',
        },
        offset: parse_hex(offset)?,
        inode: parse_decimal(inode)?,
        path: trim_start(rest),
    })
}

/// Split off the next whitespace-separated column
fn next_field<'l>(rest: &mut &'l [u8]) -> &'l [u8]
{
    let trimmed = trim_start(rest);
    let end = trimmed
        .iter()
        .position(u8::is_ascii_whitespace)
        .unwrap_or(trimmed.len());
    let (token, tail) = trimmed.split_at(end);
    *rest = tail;
    token
}

fn trim_start(bytes: &[u8]) -> &[u8]
{
    let skip = bytes.iter().take_while(|byte| byte.is_ascii_whitespace()).count();
    &bytes[skip..]
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_file_backed_mapping()
    {
        let line = b"7f3a1c200000-7f3a1c228000 r--p 00000000 08:02 1835281                    /usr/lib/x86_64-linux-gnu/libc.so.6";
        let entry = parse_maps_line(line).unwrap();
        assert_eq!(entry.start, 0x7f3a_1c20_0000);
        assert_eq!(entry.end, 0x7f3a_1c22_8000);
        assert!(entry.perms.read && !entry.perms.write && !entry.perms.exec && entry.perms.private);
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.inode, 1_835_281);
        assert_eq!(entry.path, b"/usr/lib/x86_64-linux-gnu/libc.so.6");
        assert!(entry.is_file_backed());
    }

    #[test]
    fn test_anonymous_mapping_has_empty_path()
    {
        let entry = parse_maps_line(b"7ffd5a1e0000-7ffd5a201000 rw-p 00000000 00:00 0").unwrap();
        assert!(entry.path.is_empty());
        assert!(!entry.is_file_backed());
        assert!(entry.contains(0x7ffd_5a1f_0000));
        assert!(!entry.contains(0x7ffd_5a20_1000));
    }

    #[test]
    fn test_path_with_spaces_and_pseudo_paths()
    {
        let entry = parse_maps_line(b"55d0c4a00000-55d0c4a01000 r-xp 00001000 fd:01 42 /opt/my app/bin (deleted)").unwrap();
        assert_eq!(entry.path, b"/opt/my app/bin (deleted)");
        assert_eq!(entry.offset, 0x1000);

        let vdso = parse_maps_line(b"7ffd5a3f0000-7ffd5a3f2000 r-xp 00000000 00:00 0                          [vdso]").unwrap();
        assert_eq!(vdso.path, b"[vdso]");
    }

    #[test]
    fn test_malformed_lines_are_rejected()
    {
        assert!(parse_maps_line(b"").is_none());
        assert!(parse_maps_line(b"not-a-range r--p 0 0:0 0").is_none());
        assert!(parse_maps_line(b"2000-1000 r--p 00000000 00:00 0").is_none());
    }
}
