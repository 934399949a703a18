//! USTAR inventory: a module that only enumerates the archive's entries
//! (name, type, content offset, size) rather than mounting a filesystem
//! over them. The filesystem that would consume an initrd is out of scope,
//! so this stops at the boundary the loader's handoff actually crosses.

use alloc::string::String;
use alloc::vec::Vec;

const BLOCK_SIZE: usize = 512;
const NAME_OFFSET: usize = 0;
const NAME_LEN: usize = 100;
const SIZE_OFFSET: usize = 124;
const SIZE_LEN: usize = 12;
const TYPEFLAG_OFFSET: usize = 156;
const MAGIC_OFFSET: usize = 257;
const MAGIC: &[u8] = b"ustar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Other(u8),
}

impl EntryType {
    fn from_flag(flag: u8) -> Self {
        match flag {
            b'0' | 0 => EntryType::File,
            b'5' => EntryType::Directory,
            other => EntryType::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub kind: EntryType,
    /// Byte offset of the entry's content within the archive, immediately
    /// following its header block.
    pub offset: usize,
    pub size: usize,
}

fn parse_octal(field: &[u8]) -> usize {
    let mut value: usize = 0;
    for &b in field {
        if b == 0 || b == b' ' {
            break;
        }
        if !(b'0'..=b'7').contains(&b) {
            break;
        }
        value = value * 8 + (b - b'0') as usize;
    }
    value
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Walk the archive's header blocks and record each entry's name, type,
/// content offset, and size. Stops at the first all-zero block (the
/// standard USTAR end-of-archive marker) or when the remaining bytes can't
/// hold another header.
pub fn inventory(data: &[u8]) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + BLOCK_SIZE <= data.len() {
        let header = &data[pos..pos + BLOCK_SIZE];

        if header.iter().all(|&b| b == 0) {
            break;
        }

        if &header[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] != MAGIC {
            break;
        }

        let name = field_str(&header[NAME_OFFSET..NAME_OFFSET + NAME_LEN]);
        let size = parse_octal(&header[SIZE_OFFSET..SIZE_OFFSET + SIZE_LEN]);
        let kind = EntryType::from_flag(header[TYPEFLAG_OFFSET]);
        let content_offset = pos + BLOCK_SIZE;

        entries.push(Entry { name, kind, offset: content_offset, size });

        let content_blocks = (size + BLOCK_SIZE - 1) / BLOCK_SIZE;
        pos = content_offset + content_blocks * BLOCK_SIZE;
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(name: &str, size: usize, typeflag: u8) -> [u8; BLOCK_SIZE] {
        let mut header = [0u8; BLOCK_SIZE];
        header[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        let size_str = alloc::format!("{:011o}\0", size);
        header[SIZE_OFFSET..SIZE_OFFSET + size_str.len()].copy_from_slice(size_str.as_bytes());
        header[TYPEFLAG_OFFSET] = typeflag;
        header[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()].copy_from_slice(MAGIC);
        header
    }

    #[test]
    fn single_file_entry_round_trips_name_and_size() {
        let header = build_header("hello.txt", 5, b'0');
        let mut archive = Vec::new();
        archive.extend_from_slice(&header);
        archive.extend_from_slice(b"world");
        archive.resize(archive.len() + (BLOCK_SIZE - 5), 0);
        archive.extend_from_slice(&[0u8; BLOCK_SIZE]);

        let entries = inventory(&archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.txt");
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[0].kind, EntryType::File);
        assert_eq!(entries[0].offset, BLOCK_SIZE);
    }

    #[test]
    fn directory_entry_is_classified() {
        let header = build_header("bin/", 0, b'5');
        let mut archive = Vec::new();
        archive.extend_from_slice(&header);
        archive.extend_from_slice(&[0u8; BLOCK_SIZE]);

        let entries = inventory(&archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryType::Directory);
    }

    #[test]
    fn empty_archive_yields_no_entries() {
        assert!(inventory(&[0u8; BLOCK_SIZE]).is_empty());
    }
}
