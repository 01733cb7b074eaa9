use anyhow::{bail, Result};

use crate::disk::SECTOR_SIZE;
use crate::ext2::{BlockIdx, InodeNo};
use crate::util::{read_u16_le, read_u32_le};

/// Byte offset of the superblock within its partition. The first 1024 bytes are reserved for
/// boot code and are not interpreted.
pub const SUPERBLOCK_OFFSET: usize = 1024;
/// On-disk footprint of the superblock, 1024 bytes of which only the head is structured.
pub const SUPERBLOCK_SIZE: usize = 1024;

const SUPERBLOCK_MAGIC: u16 = 0xEF53;
/// In revision 0 filesystems the inode size and first usable inode are fixed instead of being
/// read from the superblock.
const GOOD_OLD_REVISION: u32 = 0;
const GOOD_OLD_INODE_SIZE: u16 = 128;
const GOOD_OLD_FIRST_INODE_NO: InodeNo = 11;

/// Block sizes above 64 KiB do not occur in well-formed filesystems; a larger shift means the
/// superblock is garbage.
const MAX_LOG_BLOCK_SIZE: u32 = 6;

/// The superblock fields this tool consumes, decoded to owned values. Field names follow the
/// on-disk structure.
#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_log_block_size: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_rev_level: u32,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
}

impl SuperBlock {
    /// Decodes a superblock and validates the magic number and the fields that every later
    /// piece of arithmetic divides by.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            bail!("Superblock buffer holds only {} bytes", buf.len());
        }
        let magic = read_u16_le(buf, 56);
        if magic != SUPERBLOCK_MAGIC {
            bail!("Bad superblock magic number 0x{:04X}, expected 0x{:04X}", magic, SUPERBLOCK_MAGIC);
        }

        let superblock = Self {
            s_inodes_count: read_u32_le(buf, 0),
            s_blocks_count: read_u32_le(buf, 4),
            s_log_block_size: read_u32_le(buf, 24),
            s_blocks_per_group: read_u32_le(buf, 32),
            s_inodes_per_group: read_u32_le(buf, 40),
            s_rev_level: read_u32_le(buf, 76),
            s_first_ino: read_u32_le(buf, 84),
            s_inode_size: read_u16_le(buf, 88),
        };

        if superblock.s_log_block_size > MAX_LOG_BLOCK_SIZE {
            bail!("Implausible block size shift {} in superblock", superblock.s_log_block_size);
        }
        if superblock.s_blocks_per_group == 0 || superblock.s_inodes_per_group == 0 {
            bail!("Superblock declares an empty block group layout");
        }
        let inode_size_plausible =
            superblock.s_inode_size.is_power_of_two() && superblock.s_inode_size >= GOOD_OLD_INODE_SIZE;
        if superblock.s_rev_level != GOOD_OLD_REVISION && !inode_size_plausible {
            bail!("Implausible inode size {} in superblock", superblock.s_inode_size);
        }
        Ok(superblock)
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        1024 << self.s_log_block_size
    }

    /// How many 512-byte sectors make up one filesystem block.
    pub fn sectors_per_block(&self) -> usize {
        self.block_size() / SECTOR_SIZE
    }

    /// Size of one on-disk inode record in bytes.
    pub fn inode_size(&self) -> usize {
        if self.s_rev_level == GOOD_OLD_REVISION {
            usize::from(GOOD_OLD_INODE_SIZE)
        } else {
            usize::from(self.s_inode_size)
        }
    }

    /// The first inode number not reserved by the filesystem itself. The root directory is the
    /// one reserved inode that still appears in the directory tree.
    pub fn first_inode_no(&self) -> InodeNo {
        if self.s_rev_level == GOOD_OLD_REVISION {
            GOOD_OLD_FIRST_INODE_NO
        } else {
            self.s_first_ino
        }
    }

    pub fn block_group_count(&self) -> u32 {
        self.s_blocks_count.div_ceil(self.s_blocks_per_group)
    }

    /// Partition-relative block number of the first block of the group descriptor table, which
    /// starts in the block after the one containing the superblock.
    pub fn gdt_start_block(&self) -> BlockIdx {
        if self.block_size() == 1024 {
            2
        } else {
            1
        }
    }
}
