//! Builders for the synthetic disk images the tests run against: a one-group ext2 filesystem
//! with 1 KiB blocks behind a single-entry partition table.

use std::convert::TryFrom;
use std::io::Write;

use tempfile::NamedTempFile;

use crate::disk::{DiskImage, SECTOR_SIZE};
use crate::ext2::{write_record, BlockIdx, Dentry, DentryIter, Ext2Fs, InodeNo, FT_DIRECTORY};
use crate::mbr::PartitionEntry;
use crate::util::{write_u16_le, write_u32_le};

/// Start sector of the test partition.
pub const PART_START: u64 = 63;
pub const BLOCK_SIZE: usize = 1024;
pub const INODE_SIZE: usize = 128;
pub const INODES_COUNT: u32 = 32;
pub const BLOCKS_COUNT: u32 = 64;
/// First block of the inode table; 32 inodes of 128 bytes occupy blocks 5 through 8.
pub const INODE_TABLE_BLOCK: BlockIdx = 5;
/// Data blocks start here; the base tree uses 9 and 10, tests are free to use the rest.
pub const ROOT_DIR_BLOCK: BlockIdx = 9;
pub const LOST_FOUND_BLOCK: BlockIdx = 10;
pub const LOST_FOUND_INODE: InodeNo = 11;

pub const MODE_DIR: u16 = 0x41ED;
pub const MODE_FILE: u16 = 0x81A4;

/// The table entry describing the test partition.
pub fn partition_entry() -> PartitionEntry {
    let sectors_per_block = u32::try_from(BLOCK_SIZE / SECTOR_SIZE).unwrap();
    PartitionEntry { type_code: 0x83, start_sector: PART_START, sector_count: BLOCKS_COUNT * sectors_per_block }
}

/// Decodes a directory block, asserting that every record is well-formed.
pub fn decoded_block(disk: &DiskImage, fs: &Ext2Fs, block: BlockIdx) -> Vec<Dentry> {
    let buf = fs.read_block(disk, block).unwrap();
    DentryIter::new(&buf).collect::<anyhow::Result<Vec<_>>>().unwrap()
}

pub struct ImageBuilder {
    bytes: Vec<u8>,
}

impl ImageBuilder {
    /// An image holding a valid MBR (one Linux partition at `PART_START`) and an empty
    /// revision-1 filesystem: superblock and group descriptor table in place, no inodes yet.
    pub fn new() -> Self {
        let image_len = PART_START as usize * SECTOR_SIZE + BLOCKS_COUNT as usize * BLOCK_SIZE;
        let mut builder = Self { bytes: vec![0u8; image_len] };

        builder.bytes[446 + 4] = 0x83;
        write_u32_le(&mut builder.bytes, 446 + 8, u32::try_from(PART_START).unwrap());
        write_u32_le(&mut builder.bytes, 446 + 12, partition_entry().sector_count);
        builder.bytes[510] = 0x55;
        builder.bytes[511] = 0xAA;

        // superblock at partition byte 1024
        let sb = PART_START as usize * SECTOR_SIZE + 1024;
        write_u32_le(&mut builder.bytes, sb, INODES_COUNT);
        write_u32_le(&mut builder.bytes, sb + 4, BLOCKS_COUNT);
        write_u32_le(&mut builder.bytes, sb + 24, 0); // 1 KiB blocks
        write_u32_le(&mut builder.bytes, sb + 32, 8192); // blocks per group
        write_u32_le(&mut builder.bytes, sb + 40, INODES_COUNT); // inodes per group
        write_u16_le(&mut builder.bytes, sb + 56, 0xEF53);
        write_u32_le(&mut builder.bytes, sb + 76, 1); // dynamic revision
        write_u32_le(&mut builder.bytes, sb + 84, 11); // first non-reserved inode
        write_u16_le(&mut builder.bytes, sb + 88, u16::try_from(INODE_SIZE).unwrap());

        // group descriptor 0, in block 2 for 1 KiB blocks
        let gdt = builder.block_offset(2);
        write_u32_le(&mut builder.bytes, gdt, 3); // block bitmap
        write_u32_le(&mut builder.bytes, gdt + 4, 4); // inode bitmap
        write_u32_le(&mut builder.bytes, gdt + 8, INODE_TABLE_BLOCK);
        builder
    }

    fn block_offset(&self, block: BlockIdx) -> usize {
        PART_START as usize * SECTOR_SIZE + block as usize * BLOCK_SIZE
    }

    /// Fills in mode, link count and direct block pointers of an inode record.
    pub fn set_inode(&mut self, inode_no: InodeNo, mode: u16, links_count: u16, blocks: &[BlockIdx]) {
        assert!(inode_no >= 1 && inode_no <= INODES_COUNT);
        assert!(blocks.len() <= 12);
        let offset = self.block_offset(INODE_TABLE_BLOCK) + (inode_no as usize - 1) * INODE_SIZE;
        write_u16_le(&mut self.bytes, offset, mode);
        write_u16_le(&mut self.bytes, offset + 26, links_count);
        for (slot, &block) in blocks.iter().enumerate() {
            write_u32_le(&mut self.bytes, offset + 40 + 4 * slot, block);
        }
    }

    /// Tiles a directory data block with records, given as (inode, rec_len, name, file_type).
    /// A record length of 0 stretches that record to the end of the block.
    pub fn fill_dir_block(&mut self, block: BlockIdx, entries: &[(InodeNo, u16, &[u8], u8)]) {
        let start = self.block_offset(block);
        let block_buf = &mut self.bytes[start..start + BLOCK_SIZE];
        let mut offset = 0;
        for &(inode_no, rec_len, name, file_type) in entries {
            let rec_len = if rec_len == 0 { u16::try_from(BLOCK_SIZE - offset).unwrap() } else { rec_len };
            write_record(block_buf, offset, inode_no, rec_len, file_type, name);
            offset += usize::from(rec_len);
        }
        assert_eq!(offset, BLOCK_SIZE);
    }

    /// A consistent minimal tree: root (inode 2) holding `.`, `..` and lost+found, and
    /// lost+found (inode 11) holding `.`, `..` and a free record spanning the block's rest.
    pub fn with_base_tree(mut self) -> Self {
        self.set_inode(2, MODE_DIR, 3, &[ROOT_DIR_BLOCK]);
        self.set_inode(LOST_FOUND_INODE, MODE_DIR, 2, &[LOST_FOUND_BLOCK]);
        self.fill_dir_block(
            ROOT_DIR_BLOCK,
            &[
                (2, 12, b".", FT_DIRECTORY),
                (2, 12, b"..", FT_DIRECTORY),
                (LOST_FOUND_INODE, 0, b"lost+found", FT_DIRECTORY),
            ],
        );
        self.fill_dir_block(
            LOST_FOUND_BLOCK,
            &[(LOST_FOUND_INODE, 12, b".", FT_DIRECTORY), (2, 12, b"..", FT_DIRECTORY), (0, 0, b"", 0)],
        );
        self
    }

    /// Writes the image to a temp file without opening it, for tests that exercise the
    /// program's own open path (`DiskImage::open` takes an exclusive lock).
    pub fn into_file(self) -> NamedTempFile {
        let mut tmp_file = NamedTempFile::new().unwrap();
        tmp_file.as_file_mut().write_all(&self.bytes).unwrap();
        tmp_file
    }

    /// Writes the image to a temp file and memory-maps it. The temp file handle must stay
    /// alive for as long as the image is used.
    pub fn open(self) -> (NamedTempFile, DiskImage) {
        let tmp_file = self.into_file();
        let disk = DiskImage::open(tmp_file.path()).unwrap();
        (tmp_file, disk)
    }
}
