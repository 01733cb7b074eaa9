use anyhow::{bail, Result};

use crate::ext2::BlockIdx;
use crate::util::read_u32_le;

/// On-disk size of one block group descriptor.
pub const GROUP_DESCRIPTOR_SIZE: usize = 32;

/// Describes one block group. The descriptor also locates the group's block and inode bitmaps
/// and carries free counts, but a link-count check only ever needs the inode table.
#[derive(Debug, Clone, Copy)]
pub struct GroupDescriptor {
    /// Partition-relative block number of the first block of this group's inode table.
    pub bg_inode_table: BlockIdx,
}

impl GroupDescriptor {
    /// Decodes the descriptor at `index` within a contiguous group descriptor table buffer.
    pub fn parse(table: &[u8], index: usize) -> Result<Self> {
        let offset = index * GROUP_DESCRIPTOR_SIZE;
        if offset + GROUP_DESCRIPTOR_SIZE > table.len() {
            bail!("Group descriptor {} lies beyond the descriptor table buffer", index);
        }
        // bg_block_bitmap and bg_inode_bitmap occupy the first 8 bytes
        Ok(Self { bg_inode_table: read_u32_le(table, offset + 8) })
    }
}
