use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use memmap::{MmapMut, MmapOptions};
use nix::ioctl_read;
use static_assertions::const_assert;

use crate::util::FromUsize;

/// All partition table and filesystem arithmetic in this tool is done in units of 512-byte
/// sectors, the logical sector size of the devices it targets.
pub const SECTOR_SIZE: usize = 512;

const_assert!(SECTOR_SIZE.is_power_of_two());

/// A disk image or block device, memory-mapped for sector-granularity access. Every access is
/// bounds-checked against the device size; a transfer that cannot be satisfied in full is an
/// error, there are no short reads or writes.
pub struct DiskImage {
    mmap: MmapMut,
}

impl DiskImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)
            .with_context(|| format!("Could not open {}", path.display()))?;
        // the lock is only advisory, other processes may still access the file
        file.try_lock_exclusive()?;

        let size = Self::get_file_size(&file)?;
        // SAFETY: We assume that no other process is modifying the device
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        Ok(Self { mmap })
    }

    /// Number of whole sectors the device holds. A trailing partial sector is not addressable.
    pub fn sector_count(&self) -> u64 {
        u64::fromx(self.mmap.len() / SECTOR_SIZE)
    }

    /// Reads `count` sectors starting at `start_sector` into an owned buffer.
    pub fn read_sectors(&self, start_sector: u64, count: usize) -> Result<Vec<u8>> {
        let range = self.sector_range(start_sector, count)?;
        Ok(self.mmap[range].to_vec())
    }

    /// Writes `data` back to the device starting at `start_sector`.
    /// PANICS: Panics if `data.len()` is not a multiple of the sector size.
    pub fn write_sectors(&mut self, start_sector: u64, data: &[u8]) -> Result<()> {
        assert_eq!(data.len() % SECTOR_SIZE, 0);
        let range = self.sector_range(start_sector, data.len() / SECTOR_SIZE)?;
        self.mmap[range].copy_from_slice(data);
        Ok(())
    }

    fn sector_range(&self, start_sector: u64, count: usize) -> Result<Range<usize>> {
        let start_byte = start_sector
            .checked_mul(u64::fromx(SECTOR_SIZE))
            .and_then(|byte| usize::try_from(byte).ok())
            .with_context(|| format!("Sector {} is not addressable", start_sector))?;
        let end_byte = count
            .checked_mul(SECTOR_SIZE)
            .and_then(|len| start_byte.checked_add(len))
            .with_context(|| format!("Sector range {}+{} is not addressable", start_sector, count))?;
        if end_byte > self.mmap.len() {
            bail!(
                "Cannot access {} sector(s) at sector {}: the device holds only {} sectors",
                count,
                start_sector,
                self.sector_count()
            );
        }
        Ok(start_byte..end_byte)
    }

    fn get_file_size(file: &File) -> Result<usize> {
        let metadata = file.metadata()?;
        let filetype = metadata.file_type();
        let len = if filetype.is_file() {
            metadata.len()
        } else if filetype.is_block_device() {
            Self::get_block_device_size(file)?
        } else {
            bail!("Expected path to a file or a block device")
        };

        len.try_into()
            .with_context(|| format!("File size {} does not fit into a usize", len))
    }

    // declared in linux/fs.h
    // The type is declared as size_t due to a bug that cannot be fixed due to backwards compatibility. If I understand
    // correctly, passing u64 instead of usize should work even on 32bit systems, I haven't had a chance to test it
    // though. cfr. https://lists.debian.org/debian-glibc/2005/12/msg00069.html
    #[cfg(target_os = "linux")]
    ioctl_read!(block_device_size, 0x12, 114, u64);

    /// PANICS: Panics if `file` is not a block device.
    #[cfg(target_os = "linux")]
    fn get_block_device_size(file: &File) -> Result<u64> {
        assert!(file.metadata()?.file_type().is_block_device());
        let mut size = 0;
        // SAFETY: the nix crate provides no safety documentation, so we must just assume that this is safe.
        unsafe {
            Self::block_device_size(file.as_raw_fd(), &mut size)?;
        }
        Ok(size)
    }
}
