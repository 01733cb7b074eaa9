use std::convert::TryFrom;

use anyhow::{bail, Result};

use crate::ext2::InodeNo;
use crate::util::{read_u16_le, read_u32_le, write_u16_le, write_u32_le};

/// Fixed header bytes of a directory entry: inode number, record length, name length and file
/// type, followed by the (unterminated) name.
pub const DENTRY_HEADER_SIZE: usize = 8;
const ALIGNMENT: usize = 4;

// `file_type` codes stored in directory entries.
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REGULAR_FILE: u8 = 1;
pub const FT_DIRECTORY: u8 = 2;
pub const FT_CHAR_DEVICE: u8 = 3;
pub const FT_BLOCK_DEVICE: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCKET: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

/// One decoded directory entry together with its byte offset inside the owning data block, so
/// that callers can rewrite the record in place.
#[derive(Debug, Clone)]
pub struct Dentry {
    pub inode_no: InodeNo,
    /// Total record length including header, name and alignment padding. Record lengths tile a
    /// directory block completely: the final record stretches to the block's end.
    pub rec_len: u16,
    pub file_type: u8,
    pub name: Vec<u8>,
    /// Byte offset of this record within its data block.
    pub offset: usize,
}

impl Dentry {
    /// A record with inode number 0 is a free slot; its span is reusable.
    pub fn is_free(&self) -> bool {
        self.inode_no == 0
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FT_DIRECTORY
    }

    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    pub fn is_dot_dot(&self) -> bool {
        self.name == b".."
    }
}

/// The aligned record length needed to store an entry whose name is `name_len` bytes long.
pub fn dentry_len(name_len: usize) -> u16 {
    u16::try_from(aligned_length(DENTRY_HEADER_SIZE + name_len, ALIGNMENT)).unwrap()
}

const fn aligned_length(n: usize, alignment: usize) -> usize {
    n.next_multiple_of(alignment)
}

/// Rewrites the inode number of the record at `offset`, leaving the rest of the record alone.
pub fn patch_inode_no(block: &mut [u8], offset: usize, inode_no: InodeNo) {
    write_u32_le(block, offset, inode_no);
}

/// Encodes a complete record at `offset`. The caller is responsible for `rec_len` keeping the
/// block exactly tiled.
/// PANICS: Panics if the record does not fit the block or `name` is longer than 255 bytes.
pub fn write_record(block: &mut [u8], offset: usize, inode_no: InodeNo, rec_len: u16, file_type: u8, name: &[u8]) {
    assert!(offset + usize::from(rec_len) <= block.len());
    assert!(usize::from(dentry_len(name.len())) <= usize::from(rec_len));
    write_u32_le(block, offset, inode_no);
    write_u16_le(block, offset + 4, rec_len);
    block[offset + 6] = u8::try_from(name.len()).unwrap();
    block[offset + 7] = file_type;
    block[offset + 8..offset + 8 + name.len()].copy_from_slice(name);
}

/// Lazily decodes the records tiling one directory data block. Yields `Err` once and then
/// stops if a record is malformed, since decoding cannot resynchronize past a bad record
/// length.
pub struct DentryIter<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> DentryIter<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self { block, offset: 0, failed: false }
    }

    fn decode_at(&self, offset: usize) -> Result<Dentry> {
        if offset + DENTRY_HEADER_SIZE > self.block.len() {
            bail!("Directory entry header at offset {} overruns the {}-byte block", offset, self.block.len());
        }
        let inode_no = read_u32_le(self.block, offset);
        let rec_len = read_u16_le(self.block, offset + 4);
        let name_len = usize::from(self.block[offset + 6]);
        let file_type = self.block[offset + 7];

        let span = usize::from(rec_len);
        if span < DENTRY_HEADER_SIZE || span % ALIGNMENT != 0 || offset + span > self.block.len() {
            bail!("Directory entry at offset {} has invalid record length {}", offset, rec_len);
        }
        if DENTRY_HEADER_SIZE + name_len > span {
            bail!(
                "Directory entry at offset {}: name of {} bytes does not fit its {}-byte record",
                offset,
                name_len,
                rec_len
            );
        }
        let name = self.block[offset + DENTRY_HEADER_SIZE..offset + DENTRY_HEADER_SIZE + name_len].to_vec();
        Ok(Dentry { inode_no, rec_len, file_type, name, offset })
    }
}

impl Iterator for DentryIter<'_> {
    type Item = Result<Dentry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.block.len() {
            return None;
        }
        match self.decode_at(self.offset) {
            Ok(dentry) => {
                self.offset += usize::from(dentry.rec_len);
                Some(Ok(dentry))
            }
            Err(reason) => {
                self.failed = true;
                Some(Err(reason))
            }
        }
    }
}
