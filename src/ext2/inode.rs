use anyhow::{bail, Result};

use crate::ext2::{
    BlockIdx, FT_BLOCK_DEVICE, FT_CHAR_DEVICE, FT_DIRECTORY, FT_FIFO, FT_REGULAR_FILE, FT_SOCKET, FT_SYMLINK,
};
use crate::util::{read_u16_le, read_u32_le};

/// Number of direct block pointers in an inode.
pub const DIRECT_BLOCK_COUNT: usize = 12;
/// Total block pointer slots: 12 direct plus the single, double and triple indirect pointers.
pub const BLOCK_POINTER_COUNT: usize = 15;

/// Byte offset of `i_links_count` within the on-disk inode record, for in-place rewrites.
pub const LINKS_COUNT_OFFSET: usize = 26;
const MODE_OFFSET: usize = 0;
const BLOCK_POINTERS_OFFSET: usize = 40;
const INODE_DECODED_SIZE: usize = BLOCK_POINTERS_OFFSET + 4 * BLOCK_POINTER_COUNT;

const TYPE_MASK: u16 = 0xF000;
const S_IFIFO: u16 = 0x1000;
const S_IFCHR: u16 = 0x2000;
const S_IFDIR: u16 = 0x4000;
const S_IFBLK: u16 = 0x6000;
const S_IFREG: u16 = 0x8000;
const S_IFLNK: u16 = 0xA000;
const S_IFSOCK: u16 = 0xC000;

/// File types encoded in the top nibble of `i_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    RegularFile,
    Symlink,
    Socket,
}

impl FileType {
    /// Masks the type nibble out of `mode`. A pattern that matches no known type means the
    /// inode record is garbage, so nothing derived from it can be trusted.
    pub fn from_mode(mode: u16) -> Result<Self> {
        match mode & TYPE_MASK {
            S_IFIFO => Ok(Self::Fifo),
            S_IFCHR => Ok(Self::CharDevice),
            S_IFDIR => Ok(Self::Directory),
            S_IFBLK => Ok(Self::BlockDevice),
            S_IFREG => Ok(Self::RegularFile),
            S_IFLNK => Ok(Self::Symlink),
            S_IFSOCK => Ok(Self::Socket),
            pattern => bail!("Unknown file type pattern 0x{:04X} in inode mode", pattern),
        }
    }

    /// The `file_type` byte a directory entry pointing at an inode of this type carries.
    pub fn dentry_code(self) -> u8 {
        match self {
            Self::RegularFile => FT_REGULAR_FILE,
            Self::Directory => FT_DIRECTORY,
            Self::CharDevice => FT_CHAR_DEVICE,
            Self::BlockDevice => FT_BLOCK_DEVICE,
            Self::Fifo => FT_FIFO,
            Self::Socket => FT_SOCKET,
            Self::Symlink => FT_SYMLINK,
        }
    }
}

/// A decoded on-disk inode record. Only the fields a consistency check consumes are kept; the
/// indirect block pointers are decoded but never followed.
#[derive(Debug, Clone)]
pub struct Inode {
    pub i_mode: u16,
    pub i_links_count: u16,
    pub i_block: [BlockIdx; BLOCK_POINTER_COUNT],
}

impl Inode {
    /// Decodes an inode from its on-disk record, `buf` being the record's bytes.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < INODE_DECODED_SIZE {
            bail!("Inode record holds only {} bytes", buf.len());
        }
        let mut i_block = [0; BLOCK_POINTER_COUNT];
        for (slot, block) in i_block.iter_mut().enumerate() {
            *block = read_u32_le(buf, BLOCK_POINTERS_OFFSET + 4 * slot);
        }
        Ok(Self {
            i_mode: read_u16_le(buf, MODE_OFFSET),
            i_links_count: read_u16_le(buf, LINKS_COUNT_OFFSET),
            i_block,
        })
    }

    pub fn file_type(&self) -> Result<FileType> {
        FileType::from_mode(self.i_mode)
    }

    pub fn is_dir(&self) -> bool {
        self.i_mode & TYPE_MASK == S_IFDIR
    }

    /// The allocated direct data blocks, in order. Data reachable only through indirect
    /// pointers is outside this tool's scope.
    pub fn direct_blocks(&self) -> impl Iterator<Item = BlockIdx> + '_ {
        self.i_block[..DIRECT_BLOCK_COUNT].iter().copied().filter(|&block| block != 0)
    }
}
