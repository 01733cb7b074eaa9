use anyhow::Result;
use log::{debug, info, warn};

use crate::disk::DiskImage;
use crate::ext2::{
    dentry_len, write_record, Dentry, DentryIter, Ext2Fs, FileType, InodeNo, DENTRY_HEADER_SIZE, FT_UNKNOWN,
    LOST_FOUND_NAME, ROOT_INODE_NO,
};

/// Outcome of trying to reattach an orphan below lost+found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// No free record in any of lost+found's direct blocks is large enough, or there is no
    /// usable lost+found directory at all. The orphan stays in place.
    NoSpace,
}

/// Writes a directory entry for `orphan_no` into the lost+found directory, naming the entry
/// after the orphan's decimal inode number. The entry goes into the first free record large
/// enough to hold it; the record is split so that the block stays exactly tiled. Allocating
/// new blocks to a full lost+found is out of scope, that case is reported as `NoSpace`.
pub fn insert_orphan(disk: &mut DiskImage, fs: &Ext2Fs, orphan_no: InodeNo, file_type: FileType) -> Result<InsertOutcome> {
    let lost_found_no = match find_lost_found(disk, fs)? {
        Some(lost_found_no) => lost_found_no,
        None => {
            warn!("the root directory has no lost+found entry");
            return Ok(InsertOutcome::NoSpace);
        }
    };
    let lost_found = match fs.resolve_inode(disk, lost_found_no) {
        Ok(inode) => inode,
        Err(reason) => {
            warn!("the lost+found entry references inode {}, which does not resolve: {:#}", lost_found_no, reason);
            return Ok(InsertOutcome::NoSpace);
        }
    };
    if !lost_found.is_dir() {
        warn!("the lost+found entry references inode {}, which is not a directory", lost_found_no);
        return Ok(InsertOutcome::NoSpace);
    }

    let name = orphan_no.to_string();
    let needed = dentry_len(name.len());

    for block in lost_found.direct_blocks() {
        let mut buf = fs.read_block(disk, block)?;
        let slot = match find_free_record(&buf, needed) {
            Some(slot) => slot,
            None => continue,
        };

        let remainder = slot.rec_len - needed;
        if usize::from(remainder) >= DENTRY_HEADER_SIZE {
            write_record(&mut buf, slot.offset, orphan_no, needed, file_type.dentry_code(), name.as_bytes());
            // what is left of the free record stays a free record
            write_record(&mut buf, slot.offset + usize::from(needed), 0, remainder, FT_UNKNOWN, b"");
        } else {
            // too small to stand alone as a record, the new entry absorbs it
            write_record(&mut buf, slot.offset, orphan_no, slot.rec_len, file_type.dentry_code(), name.as_bytes());
        }
        fs.write_block(disk, block, &buf)?;
        info!("wrote entry '{}' into block {} of lost+found (inode {})", name, block, lost_found_no);
        return Ok(InsertOutcome::Inserted);
    }
    Ok(InsertOutcome::NoSpace)
}

/// The inode number behind the root directory's `lost+found` entry. The directory is found by
/// name, its inode number is whatever the entry says.
fn find_lost_found(disk: &DiskImage, fs: &Ext2Fs) -> Result<Option<InodeNo>> {
    let root = fs.resolve_inode(disk, ROOT_INODE_NO)?;
    for block in root.direct_blocks() {
        let buf = fs.read_block(disk, block)?;
        for result in DentryIter::new(&buf) {
            match result {
                Ok(dentry) if !dentry.is_free() && dentry.name == LOST_FOUND_NAME => {
                    return Ok(Some(dentry.inode_no));
                }
                Ok(_) => {}
                Err(reason) => {
                    debug!("while scanning the root directory for lost+found: {:#}", reason);
                    break;
                }
            }
        }
    }
    Ok(None)
}

/// The first free record in `block` spanning at least `needed` bytes.
fn find_free_record(block: &[u8], needed: u16) -> Option<Dentry> {
    for result in DentryIter::new(block) {
        match result {
            Ok(dentry) if dentry.is_free() && dentry.rec_len >= needed => return Some(dentry),
            Ok(_) => {}
            Err(reason) => {
                debug!("while scanning a lost+found block for free records: {:#}", reason);
                return None;
            }
        }
    }
    None
}
