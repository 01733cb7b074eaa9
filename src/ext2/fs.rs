use anyhow::{bail, Context, Result};
use log::debug;
use num::Integer;

use crate::disk::{DiskImage, SECTOR_SIZE};
use crate::ext2::{
    BlockIdx, GroupDescriptor, Inode, InodeNo, SuperBlock, GROUP_DESCRIPTOR_SIZE, LINKS_COUNT_OFFSET,
    SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use crate::mbr::PartitionEntry;
use crate::util::{write_u16_le, FromU32, FromUsize};

/// Per-partition filesystem context: the partition's location, its superblock and its group
/// descriptor table. All block and inode arithmetic for one partition goes through one
/// instance, so checking several partitions with different geometry never shares state.
pub struct Ext2Fs {
    /// Absolute sector at which the partition starts.
    partition_start: u64,
    superblock: SuperBlock,
    group_descriptors: Vec<GroupDescriptor>,
}

impl Ext2Fs {
    /// Reads and validates the superblock, then loads the group descriptor table. The block
    /// size established here gates every subsequent block-to-sector conversion.
    pub fn open(disk: &DiskImage, partition: &PartitionEntry) -> Result<Self> {
        let partition_start = partition.start_sector;
        let superblock_sector = partition_start + u64::fromx(SUPERBLOCK_OFFSET / SECTOR_SIZE);
        let buf = disk.read_sectors(superblock_sector, SUPERBLOCK_SIZE / SECTOR_SIZE)?;
        let superblock = SuperBlock::parse(&buf)
            .with_context(|| format!("No ext2 filesystem on the partition at sector {}", partition_start))?;
        debug!(
            "partition at sector {}: block size {}, {} inodes in {} group(s)",
            partition_start,
            superblock.block_size(),
            superblock.s_inodes_count,
            superblock.block_group_count()
        );

        let mut fs = Self { partition_start, superblock, group_descriptors: Vec::new() };
        fs.group_descriptors = fs.read_group_descriptors(disk)?;
        Ok(fs)
    }

    fn read_group_descriptors(&self, disk: &DiskImage) -> Result<Vec<GroupDescriptor>> {
        let group_count = usize::fromx(self.superblock.block_group_count());
        let table_blocks = (group_count * GROUP_DESCRIPTOR_SIZE).div_ceil(self.block_size());
        let start_sector = self.block_to_sector(self.superblock.gdt_start_block());
        let table = disk.read_sectors(start_sector, table_blocks * self.superblock.sectors_per_block())?;
        (0..group_count).map(|index| GroupDescriptor::parse(&table, index)).collect()
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn block_size(&self) -> usize {
        self.superblock.block_size()
    }

    /// Absolute device sector of a partition-relative block number.
    pub fn block_to_sector(&self, block: BlockIdx) -> u64 {
        self.partition_start + u64::from(block) * u64::fromx(self.superblock.sectors_per_block())
    }

    pub fn read_block(&self, disk: &DiskImage, block: BlockIdx) -> Result<Vec<u8>> {
        disk.read_sectors(self.block_to_sector(block), self.superblock.sectors_per_block())
    }

    /// PANICS: Panics if `data` is not exactly one block.
    pub fn write_block(&self, disk: &mut DiskImage, block: BlockIdx, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), self.block_size());
        disk.write_sectors(self.block_to_sector(block), data)
    }

    /// Absolute sector holding inode `inode_no`'s record plus the record's byte offset within
    /// that sector. Inode numbering starts at 1.
    fn locate_inode(&self, inode_no: InodeNo) -> Result<(u64, usize)> {
        if inode_no == 0 || inode_no > self.superblock.s_inodes_count {
            bail!(
                "Inode number {} out of range, the filesystem has {} inodes",
                inode_no,
                self.superblock.s_inodes_count
            );
        }
        let (group, index) = (inode_no - 1).div_rem(&self.superblock.s_inodes_per_group);
        let descriptor = self.group_descriptors.get(usize::fromx(group)).with_context(|| {
            format!("Inode {} falls into block group {}, beyond the descriptor table", inode_no, group)
        })?;
        let byte_offset = usize::fromx(index) * self.superblock.inode_size();
        let sector = self.block_to_sector(descriptor.bg_inode_table) + u64::fromx(byte_offset / SECTOR_SIZE);
        Ok((sector, byte_offset % SECTOR_SIZE))
    }

    /// Resolves an inode number to its decoded on-disk record.
    pub fn resolve_inode(&self, disk: &DiskImage, inode_no: InodeNo) -> Result<Inode> {
        let (sector, offset) = self.locate_inode(inode_no)?;
        let sector_count = (offset + self.superblock.inode_size()).div_ceil(SECTOR_SIZE);
        let buf = disk.read_sectors(sector, sector_count)?;
        Inode::parse(&buf[offset..offset + self.superblock.inode_size()])
            .with_context(|| format!("Inode {} is not decodable", inode_no))
    }

    /// Overwrites the stored link count of `inode_no` with a read-modify-write of the sector
    /// holding the record's head.
    pub fn write_links_count(&self, disk: &mut DiskImage, inode_no: InodeNo, links_count: u16) -> Result<()> {
        let (sector, offset) = self.locate_inode(inode_no)?;
        // valid inode sizes keep the record head inside one sector
        assert!(offset + LINKS_COUNT_OFFSET + 2 <= SECTOR_SIZE);
        let mut buf = disk.read_sectors(sector, 1)?;
        write_u16_le(&mut buf, offset + LINKS_COUNT_OFFSET, links_count);
        disk.write_sectors(sector, &buf)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use crate::ext2::ROOT_INODE_NO;
    use crate::test_helpers::{partition_entry, ImageBuilder, LOST_FOUND_INODE, PART_START, ROOT_DIR_BLOCK};

    use super::*;

    #[test]
    fn opens_the_filesystem_behind_the_partition() {
        let (_tmp_file, disk) = ImageBuilder::new().with_base_tree().open();
        let fs = Ext2Fs::open(&disk, &partition_entry()).unwrap();

        assert_eq!(fs.block_size(), 1024);
        assert_eq!(fs.superblock().s_inodes_count, 32);
        assert_eq!(fs.superblock().inode_size(), 128);
        assert_eq!(fs.group_descriptors.len(), 1);
    }

    #[test]
    fn refuses_a_partition_without_a_filesystem() {
        let (_tmp_file, disk) = ImageBuilder::new().with_base_tree().open();
        let bogus = PartitionEntry { type_code: 0x83, start_sector: 1, sector_count: 64 };
        assert!(Ext2Fs::open(&disk, &bogus).is_err());
    }

    #[test]
    fn resolves_the_root_inode() {
        let (_tmp_file, disk) = ImageBuilder::new().with_base_tree().open();
        let fs = Ext2Fs::open(&disk, &partition_entry()).unwrap();

        let root = fs.resolve_inode(&disk, ROOT_INODE_NO).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.i_links_count, 3);
        assert_eq!(root.direct_blocks().collect_vec(), vec![ROOT_DIR_BLOCK]);
    }

    #[test]
    fn rejects_out_of_range_inode_numbers() {
        let (_tmp_file, disk) = ImageBuilder::new().with_base_tree().open();
        let fs = Ext2Fs::open(&disk, &partition_entry()).unwrap();

        assert!(fs.resolve_inode(&disk, 0).is_err());
        assert!(fs.resolve_inode(&disk, 33).is_err());
        assert!(fs.resolve_inode(&disk, 32).is_ok());
    }

    #[test]
    fn block_to_sector_scales_by_the_block_size() {
        let (_tmp_file, disk) = ImageBuilder::new().with_base_tree().open();
        let fs = Ext2Fs::open(&disk, &partition_entry()).unwrap();
        // 1 KiB blocks are two sectors each
        assert_eq!(fs.block_to_sector(0), PART_START);
        assert_eq!(fs.block_to_sector(9), PART_START + 18);
    }

    #[test]
    fn locates_inodes_across_block_groups() {
        // geometry from a larger filesystem: 4 KiB blocks, 1856 inodes per group
        let superblock = SuperBlock {
            s_inodes_count: 32000,
            s_blocks_count: 120000,
            s_log_block_size: 2,
            s_blocks_per_group: 32768,
            s_inodes_per_group: 1856,
            s_rev_level: 1,
            s_first_ino: 11,
            s_inode_size: 128,
        };
        let mut group_descriptors = vec![GroupDescriptor { bg_inode_table: 0 }; 17];
        group_descriptors[16].bg_inode_table = 100;
        let fs = Ext2Fs { partition_start: 63, superblock, group_descriptors };

        // inode 30000: group 16, index 303, byte 38784 = 75 sectors + 384 bytes
        let (sector, offset) = fs.locate_inode(30000).unwrap();
        assert_eq!(sector, 63 + 100 * 8 + 75);
        assert_eq!(offset, 384);
    }

    #[test]
    fn rewrites_the_link_count_in_place() {
        let (_tmp_file, mut disk) = ImageBuilder::new().with_base_tree().open();
        let fs = Ext2Fs::open(&disk, &partition_entry()).unwrap();

        fs.write_links_count(&mut disk, LOST_FOUND_INODE, 7).unwrap();

        let lost_found = fs.resolve_inode(&disk, LOST_FOUND_INODE).unwrap();
        assert_eq!(lost_found.i_links_count, 7);
        assert!(lost_found.is_dir()); // the rest of the record is untouched
        let root = fs.resolve_inode(&disk, ROOT_INODE_NO).unwrap();
        assert_eq!(root.i_links_count, 3);
    }

    #[test]
    fn reads_and_writes_whole_blocks() {
        let (_tmp_file, mut disk) = ImageBuilder::new().with_base_tree().open();
        let fs = Ext2Fs::open(&disk, &partition_entry()).unwrap();

        let mut block = fs.read_block(&disk, 20).unwrap();
        assert_eq!(block.len(), 1024);
        block[0] = 0x5A;
        block[1023] = 0xA5;
        fs.write_block(&mut disk, 20, &block).unwrap();
        assert_eq!(fs.read_block(&disk, 20).unwrap(), block);
    }
}
