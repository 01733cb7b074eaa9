use std::fmt;

use anyhow::Result;
use log::debug;

use crate::disk::DiskImage;
use crate::util::read_u32_le;

/// Byte offsets of the four primary partition entries within an MBR sector.
const PRIMARY_ENTRY_OFFSETS: [usize; 4] = [446, 462, 478, 494];
/// Type code of a DOS extended partition, the container for the logical partition chain.
const DOS_EXTENDED_PARTITION: u8 = 0x05;
/// Type code of a Linux native partition, which is where ext2 filesystems live.
pub const EXT2_PARTITION_TYPE: u8 = 0x83;

/// One partition table entry with its start sector already made absolute. On disk the start is
/// relative: to sector 0 for primaries (so effectively absolute), to the containing extended
/// boot record for logicals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_code: u8,
    pub start_sector: u64,
    pub sector_count: u32,
}

impl PartitionEntry {
    /// Decodes the 16-byte entry at `offset`. Only the type code, start and length are
    /// consumed; the boot flag and CHS fields are irrelevant to a consistency check.
    fn decode(sector: &[u8], offset: usize) -> Self {
        Self {
            type_code: sector[offset + 4],
            start_sector: u64::from(read_u32_le(sector, offset + 8)),
            sector_count: read_u32_le(sector, offset + 12),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.type_code == 0
    }

    pub fn is_extended(&self) -> bool {
        self.type_code == DOS_EXTENDED_PARTITION
    }

    pub fn is_ext2(&self) -> bool {
        self.type_code == EXT2_PARTITION_TYPE
    }
}

impl fmt::Display for PartitionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} {} {}", self.type_code, self.start_sector, self.sector_count)
    }
}

/// The flattened partition table: the four primary slots (empty ones included, they still own
/// a partition number) followed by any logical partitions found in the extended chain.
pub struct PartitionTable {
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Parses sector 0 and, if one of the primary entries is a DOS extended partition, follows
    /// its chain of extended boot records to collect the logical partitions.
    pub fn read(disk: &DiskImage) -> Result<Self> {
        let mbr = disk.read_sectors(0, 1)?;
        let mut entries = Vec::with_capacity(4);
        let mut extended_base = None;

        for offset in PRIMARY_ENTRY_OFFSETS {
            let entry = PartitionEntry::decode(&mbr, offset);
            if entry.is_extended() && extended_base.is_none() {
                extended_base = Some(entry.start_sector);
            }
            entries.push(entry);
        }

        if let Some(base) = extended_base {
            Self::read_logical_chain(disk, base, &mut entries)?;
        }
        Ok(Self { entries })
    }

    /// Walks the singly-linked list of extended boot records starting at `extended_base`. Each
    /// record holds up to two entries: the first describes a logical partition (start relative
    /// to the record's own sector), the second either links to the next record (start relative
    /// to the extended partition's base) or is empty, which terminates the chain.
    ///
    /// Termination is structural only. A corrupt chain that never presents an empty link is
    /// followed until a record falls outside the device, which fails the sector read; a chain
    /// that cycles within the device is not detected.
    fn read_logical_chain(disk: &DiskImage, extended_base: u64, entries: &mut Vec<PartitionEntry>) -> Result<()> {
        let mut record_sector = extended_base;
        loop {
            let record = disk.read_sectors(record_sector, 1)?;

            let mut logical = PartitionEntry::decode(&record, PRIMARY_ENTRY_OFFSETS[0]);
            logical.start_sector += record_sector;
            debug!("logical partition from record at sector {}: {}", record_sector, logical);
            entries.push(logical);

            let link = PartitionEntry::decode(&record, PRIMARY_ENTRY_OFFSETS[1]);
            if link.is_empty() {
                return Ok(());
            }
            record_sector = extended_base + link.start_sector;
        }
    }

    /// Looks up a partition by its 1-based number: primaries are 1 through 4, logicals count
    /// up from 5 in chain order. Returns `None` for 0 and for numbers past the table.
    pub fn get(&self, number: usize) -> Option<&PartitionEntry> {
        number.checked_sub(1).and_then(|index| self.entries.get(index))
    }

    /// The line printed for a partition-number query: the entry's table row, or the `-1`
    /// sentinel when the number names no partition.
    pub fn listing_line(&self, number: usize) -> String {
        match self.get(number) {
            Some(entry) => entry.to_string(),
            None => "-1".to_string(),
        }
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }
}
