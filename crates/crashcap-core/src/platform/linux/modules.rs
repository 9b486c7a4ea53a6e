//! ELF module identification.
//!
//! Images are identified from their mapped copy in memory rather than the
//! file on disk, which may have been replaced or deleted since it was loaded.
//! Program headers and notes are parsed in place with `object`'s zero-copy
//! readers over the scratch buffer; nothing here allocates.

use object::elf::{FileHeader64, NT_GNU_BUILD_ID, PF_X, PT_LOAD, PT_NOTE};
use object::read::elf::{FileHeader, NoteIterator, ProgramHeader};
use object::Endianness;

use super::memory::read_self;
use crate::snapshot::{IdentitySource, ModuleIdentity};
use crate::types::Address;

type Elf = FileHeader64<Endianness>;

/// Bytes read from the start of an image to find its program headers
const HEADER_WINDOW: usize = 4096;
/// Length of the text-hash identifier (the size of a GUID)
const TEXT_HASH_BYTES: usize = 16;
/// Bytes of code folded into the text hash
const TEXT_HASH_PAGE: usize = 4096;

/// Identify the ELF image mapped at `base`
///
/// Returns `None` when `base` does not hold a 64-bit ELF header (mapped data
/// files, fonts, locale archives). An ELF image whose notes and text are both
/// unreadable is still a module, with [`ModuleIdentity::UNKNOWN`].
pub fn identify(base: Address, scratch: &mut [u8]) -> Option<ModuleIdentity>
{
    if scratch.len() < HEADER_WINDOW + TEXT_HASH_PAGE {
        return None;
    }
    let (header_buf, rest) = scratch.split_at_mut(HEADER_WINDOW);
    let read = read_self(base, header_buf)?;
    let data = &header_buf[..read];

    let header = Elf::parse(data).ok()?;
    let endian = header.endian().ok()?;
    let phdrs = header.program_headers(endian, data).ok()?;

    // Runtime address = link-time address + bias; the offset-0 segment is mapped at `base`
    let first_load = phdrs
        .iter()
        .find(|phdr| phdr.p_type(endian) == PT_LOAD && phdr.p_offset(endian) == 0)?;
    let bias = base.value().wrapping_sub(first_load.p_vaddr(endian));

    for phdr in phdrs.iter().filter(|phdr| phdr.p_type(endian) == PT_NOTE) {
        let Ok(size) = usize::try_from(phdr.p_filesz(endian)) else {
            continue;
        };
        let room = rest.len();
        let notes = &mut rest[..size.min(room)];
        let Some(len) = read_self(Address::new(bias.wrapping_add(phdr.p_vaddr(endian))), notes) else {
            continue;
        };
        if let Some(id) = find_build_id(endian, phdr.p_align(endian), &notes[..len]) {
            return Some(ModuleIdentity::new(IdentitySource::ElfBuildId, id));
        }
    }

    let Some(text) = phdrs
        .iter()
        .find(|phdr| phdr.p_type(endian) == PT_LOAD && phdr.p_flags(endian) & PF_X != 0)
    else {
        return Some(ModuleIdentity::UNKNOWN);
    };
    let page = &mut rest[..TEXT_HASH_PAGE];
    match read_self(Address::new(bias.wrapping_add(text.p_vaddr(endian))), page) {
        Some(len) => Some(ModuleIdentity::new(IdentitySource::ElfTextHash, &text_hash(&page[..len]))),
        None => Some(ModuleIdentity::UNKNOWN),
    }
}

/// Descriptor of the first `NT_GNU_BUILD_ID` note in a `PT_NOTE` segment
pub fn find_build_id(endian: Endianness, align: u64, notes: &[u8]) -> Option<&[u8]>
{
    let mut iter = NoteIterator::<Elf>::new(endian, align, notes).ok()?;
    while let Ok(Some(note)) = iter.next() {
        if strip_nul(note.name()) == b"GNU" && note.n_type(endian) == NT_GNU_BUILD_ID && !note.desc().is_empty() {
            return Some(note.desc());
        }
    }
    None
}

fn strip_nul(name: &[u8]) -> &[u8]
{
    let end = name.iter().rposition(|&byte| byte != 0).map_or(0, |last| last + 1);
    &name[..end]
}

/// Fold a page of code into 16 bytes by XOR, the identifier Breakpad
/// computes for ELF files linked without a build-id
pub fn text_hash(text: &[u8]) -> [u8; TEXT_HASH_BYTES]
{
    let mut hash = [0u8; TEXT_HASH_BYTES];
    for chunk in text.chunks(TEXT_HASH_BYTES) {
        for (slot, byte) in hash.iter_mut().zip(chunk) {
            *slot ^= byte;
        }
    }
    hash
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn gnu_note(kind: u32, desc: &[u8]) -> Vec<u8>
    {
        let mut note = Vec::new();
        note.extend_from_slice(&4u32.to_le_bytes());
        note.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        note.extend_from_slice(&kind.to_le_bytes());
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(desc);
        while note.len() % 4 != 0 {
            note.push(0);
        }
        note
    }

    #[test]
    fn test_build_id_note_is_found()
    {
        let id = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
        let mut notes = gnu_note(1, &[0, 0, 0, 0]);
        notes.extend(gnu_note(NT_GNU_BUILD_ID, &id));
        assert_eq!(find_build_id(Endianness::Little, 4, &notes), Some(&id[..]));
    }

    #[test]
    fn test_other_notes_are_ignored()
    {
        let notes = gnu_note(1, &[1, 2, 3, 4]);
        assert_eq!(find_build_id(Endianness::Little, 4, &notes), None);
        assert_eq!(find_build_id(Endianness::Little, 4, &[]), None);
    }

    #[test]
    fn test_text_hash_folds_pages()
    {
        let mut text = [0u8; 32];
        text[0] = 0x0f;
        text[16] = 0xf0;
        text[31] = 0x11;
        let hash = text_hash(&text);
        assert_eq!(hash[0], 0xff);
        assert_eq!(hash[15], 0x11);
        assert!(hash[1..15].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_non_elf_memory_is_not_a_module()
    {
        let data = [0x55u8; 64];
        let mut scratch = vec![0u8; HEADER_WINDOW + TEXT_HASH_PAGE];
        assert!(identify(Address::new(data.as_ptr() as u64), &mut scratch).is_none());
    }

    #[test]
    fn test_own_executable_is_identified()
    {
        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        let base = maps
            .lines()
            .find(|line| line.ends_with(exe.to_str().unwrap()) && line.split_whitespace().nth(2) == Some("00000000"))
            .and_then(|line| line.split('-').next())
            .map(|start| u64::from_str_radix(start, 16).unwrap())
            .unwrap();

        let mut scratch = vec![0u8; HEADER_WINDOW + TEXT_HASH_PAGE];
        let identity = identify(Address::new(base), &mut scratch).unwrap();
        assert!(matches!(
            identity.source,
            IdentitySource::ElfBuildId | IdentitySource::ElfTextHash
        ));
        assert!(!identity.is_empty());
    }
}
