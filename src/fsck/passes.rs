use std::convert::TryFrom;
use std::fmt;

use anyhow::Result;
use log::{debug, info, warn};

use crate::disk::DiskImage;
use crate::ext2::{patch_inode_no, BlockIdx, Dentry, DentryIter, Ext2Fs, FileType, Inode, InodeNo, ROOT_INODE_NO};
use crate::fsck::{insert_orphan, InsertOutcome};
use crate::mbr::PartitionEntry;
use crate::util::FromU32;

/// What a check run did to one partition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    /// `.` and `..` records whose inode number was rewritten.
    pub dots_rewritten: usize,
    /// Orphaned inodes reattached under lost+found.
    pub orphans_reattached: usize,
    /// Orphans that no free lost+found record could hold; they are reported and left in place.
    pub orphans_unplaced: usize,
    /// Stored link counts overwritten with the observed reference count.
    pub link_counts_corrected: usize,
    /// Entries or inodes skipped because their metadata did not decode.
    pub entries_skipped: usize,
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::default() {
            return write!(f, "clean");
        }
        write!(
            f,
            "{} dot entries rewritten, {} orphans reattached ({} unplaced), {} link counts corrected, {} entries skipped",
            self.dots_rewritten,
            self.orphans_reattached,
            self.orphans_unplaced,
            self.link_counts_corrected,
            self.entries_skipped
        )
    }
}

/// Three-pass consistency check of one ext2 partition: pass 1 repairs `.`/`..` records, pass 2
/// reattaches orphaned inodes under lost+found, pass 3 corrects stored link counts. Every
/// successful reattachment restarts the sequence at pass 1, because the insertion changes the
/// directory tree that passes 1 and 2 reason about; each restart has strictly fewer orphans
/// left, so the sequence terminates.
pub struct Fsck<'a> {
    disk: &'a mut DiskImage,
    fs: Ext2Fs,
    report: CheckReport,
}

impl<'a> Fsck<'a> {
    pub fn new(disk: &'a mut DiskImage, partition: &PartitionEntry) -> Result<Self> {
        let fs = Ext2Fs::open(disk, partition)?;
        Ok(Self { disk, fs, report: CheckReport::default() })
    }

    /// Runs the full pass sequence. Returns `None` without touching anything if the root
    /// directory is unusable, in which case the partition cannot be checked at all.
    pub fn run(mut self) -> Result<Option<CheckReport>> {
        if self.root_directory()?.is_none() {
            return Ok(None);
        }
        loop {
            self.repair_dot_entries()?;
            if !self.reattach_orphans()? {
                break;
            }
        }
        self.correct_link_counts()?;
        Ok(Some(self.report))
    }

    /// The root directory's inode, or `None` if inode 2 does not resolve to a directory.
    fn root_directory(&mut self) -> Result<Option<Inode>> {
        if ROOT_INODE_NO > self.fs.superblock().s_inodes_count {
            warn!("filesystem declares fewer than {} inodes, there is no root directory", ROOT_INODE_NO);
            return Ok(None);
        }
        let root = match self.fs.resolve_inode(self.disk, ROOT_INODE_NO) {
            Ok(root) => root,
            Err(reason) => {
                warn!("cannot resolve the root directory inode: {:#}", reason);
                return Ok(None);
            }
        };
        if root.file_type()? != FileType::Directory {
            warn!("the root inode is not a directory (mode 0x{:04X})", root.i_mode);
            return Ok(None);
        }
        Ok(Some(root))
    }

    fn inode_slots(&self) -> usize {
        usize::fromx(self.fs.superblock().s_inodes_count) + 1
    }

    /// Pass 1: walks the tree from the root and rewrites each directory's `.` record to the
    /// directory's own inode number and its `..` record to the parent it was entered from. A
    /// work list stack replaces recursion so that deep or cyclic trees cannot overflow the
    /// call stack; the visited set keeps cycles from being walked twice.
    fn repair_dot_entries(&mut self) -> Result<()> {
        let mut visited = vec![false; self.inode_slots()];
        let mut work_list = vec![(ROOT_INODE_NO, ROOT_INODE_NO)];

        while let Some((dir_no, parent_no)) = work_list.pop() {
            if visited[usize::fromx(dir_no)] {
                continue;
            }
            visited[usize::fromx(dir_no)] = true;

            let inode = match self.fs.resolve_inode(self.disk, dir_no) {
                Ok(inode) => inode,
                Err(reason) => {
                    warn!("skipping directory inode {}: {:#}", dir_no, reason);
                    self.report.entries_skipped += 1;
                    continue;
                }
            };
            for (position, block) in inode.direct_blocks().enumerate() {
                let result =
                    self.repair_directory_block(dir_no, parent_no, block, position == 0, &mut work_list, &visited);
                if let Err(reason) = result {
                    warn!("skipping block {} of directory inode {}: {:#}", block, dir_no, reason);
                    self.report.entries_skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Repairs the dot records of one directory data block (only the first block of a
    /// directory holds them) and pushes the subdirectories it names onto the work list.
    fn repair_directory_block(
        &mut self,
        dir_no: InodeNo,
        parent_no: InodeNo,
        block: BlockIdx,
        is_first_block: bool,
        work_list: &mut Vec<(InodeNo, InodeNo)>,
        visited: &[bool],
    ) -> Result<()> {
        let mut buf = self.fs.read_block(self.disk, block)?;
        let entries = self.decode_block_entries(dir_no, block, &buf);
        let mut dirty = false;

        if is_first_block {
            dirty |= self.repair_dot_record(&mut buf, entries.first(), b".", dir_no);
            dirty |= self.repair_dot_record(&mut buf, entries.get(1), b"..", parent_no);
        }

        let children_from = if is_first_block { 2 } else { 0 };
        for dentry in entries.iter().skip(children_from) {
            if dentry.is_free() || !dentry.is_dir() {
                continue;
            }
            let child = usize::fromx(dentry.inode_no);
            if child >= visited.len() {
                warn!(
                    "entry '{}' in directory inode {} references out-of-range inode {}",
                    String::from_utf8_lossy(&dentry.name),
                    dir_no,
                    dentry.inode_no
                );
                self.report.entries_skipped += 1;
            } else if !visited[child] {
                work_list.push((dentry.inode_no, dir_no));
            }
        }

        if dirty {
            self.fs.write_block(self.disk, block, &buf)?;
        }
        Ok(())
    }

    /// Rewrites the inode number of a `.` or `..` record if it does not match `expected_no`.
    /// A record that is not named `name` in the first place is reported but left alone, since
    /// rewriting its inode number would not make the directory well-formed either.
    fn repair_dot_record(&mut self, buf: &mut [u8], dentry: Option<&Dentry>, name: &[u8], expected_no: InodeNo) -> bool {
        let dentry = match dentry {
            Some(dentry) => dentry,
            None => return false,
        };
        if dentry.name != name {
            warn!(
                "expected a '{}' record but found '{}'",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(&dentry.name)
            );
            return false;
        }
        if dentry.inode_no == expected_no {
            return false;
        }
        info!(
            "'{}' record points at inode {} instead of {}, rewriting",
            String::from_utf8_lossy(name),
            dentry.inode_no,
            expected_no
        );
        patch_inode_no(buf, dentry.offset, expected_no);
        self.report.dots_rewritten += 1;
        true
    }

    /// Pass 2: counts how many directory entries reference each inode, then reattaches the
    /// first live inode nobody references into lost+found. Returns whether an inode was
    /// reattached, in which case the whole pass sequence must rerun: the new entry makes the
    /// orphan reachable, and if it is a directory, its dot records need pass 1.
    fn reattach_orphans(&mut self) -> Result<bool> {
        let counts = self.count_references();
        let mut unplaced = 0;

        for inode_no in self.fs.superblock().first_inode_no()..=self.fs.superblock().s_inodes_count {
            if counts[usize::fromx(inode_no)] != 0 {
                continue;
            }
            let inode = match self.fs.resolve_inode(self.disk, inode_no) {
                Ok(inode) => inode,
                Err(reason) => {
                    debug!("inode {} not considered for reattachment: {:#}", inode_no, reason);
                    continue;
                }
            };
            if inode.i_links_count == 0 {
                // neither referenced nor live, an ordinary free inode
                continue;
            }
            let file_type = inode.file_type()?;
            info!(
                "inode {} claims {} link(s) but no directory entry references it, reattaching under lost+found",
                inode_no,
                inode.i_links_count
            );
            match insert_orphan(self.disk, &self.fs, inode_no, file_type)? {
                InsertOutcome::Inserted => {
                    self.report.orphans_reattached += 1;
                    return Ok(true);
                }
                InsertOutcome::NoSpace => {
                    warn!("no free lost+found record can hold inode {}, leaving it orphaned", inode_no);
                    unplaced += 1;
                }
            }
        }
        // overwrite instead of accumulate: earlier sweeps saw the same orphans
        self.report.orphans_unplaced = unplaced;
        Ok(false)
    }

    /// Pass 3: walks the tree once more and overwrites every reachable inode's stored link
    /// count with the observed reference count where the two disagree. Inodes that no entry
    /// references are pass 2's business, not ours, and stay untouched.
    fn correct_link_counts(&mut self) -> Result<()> {
        let counts = self.count_references();

        for inode_no in 1..=self.fs.superblock().s_inodes_count {
            let observed = counts[usize::fromx(inode_no)];
            if observed == 0 {
                continue;
            }
            let inode = match self.fs.resolve_inode(self.disk, inode_no) {
                Ok(inode) => inode,
                Err(reason) => {
                    warn!("cannot verify the link count of inode {}: {:#}", inode_no, reason);
                    self.report.entries_skipped += 1;
                    continue;
                }
            };
            if inode.i_links_count == 0 {
                warn!("inode {} is referenced {} time(s) but claims zero links, leaving it alone", inode_no, observed);
                continue;
            }
            let observed = match u16::try_from(observed) {
                Ok(observed) => observed,
                Err(_) => {
                    warn!("inode {} is referenced {} times, more than a link count can store", inode_no, observed);
                    continue;
                }
            };
            if inode.i_links_count != observed {
                info!(
                    "inode {} claims {} link(s) but {} directory entries reference it, correcting",
                    inode_no,
                    inode.i_links_count,
                    observed
                );
                self.fs.write_links_count(self.disk, inode_no, observed)?;
                self.report.link_counts_corrected += 1;
            }
        }
        Ok(())
    }

    /// Observed reference counts for every inode number, gathered by one full traversal from
    /// the root. Every non-free entry counts, including `.` and `..`; a directory-typed entry
    /// is descended into when its target's count leaves zero, so no directory is walked twice
    /// and reference cycles terminate.
    fn count_references(&mut self) -> Vec<u32> {
        let mut counts = vec![0u32; self.inode_slots()];
        let mut work_list = vec![ROOT_INODE_NO];

        while let Some(dir_no) = work_list.pop() {
            let inode = match self.fs.resolve_inode(self.disk, dir_no) {
                Ok(inode) => inode,
                Err(reason) => {
                    warn!("not descending into directory inode {}: {:#}", dir_no, reason);
                    self.report.entries_skipped += 1;
                    continue;
                }
            };
            for block in inode.direct_blocks() {
                let buf = match self.fs.read_block(self.disk, block) {
                    Ok(buf) => buf,
                    Err(reason) => {
                        warn!("skipping block {} of directory inode {}: {:#}", block, dir_no, reason);
                        self.report.entries_skipped += 1;
                        continue;
                    }
                };
                for dentry in self.decode_block_entries(dir_no, block, &buf) {
                    if dentry.is_free() {
                        continue;
                    }
                    let index = usize::fromx(dentry.inode_no);
                    if index >= counts.len() {
                        warn!(
                            "entry '{}' in directory inode {} references out-of-range inode {}",
                            String::from_utf8_lossy(&dentry.name),
                            dir_no,
                            dentry.inode_no
                        );
                        self.report.entries_skipped += 1;
                        continue;
                    }
                    counts[index] += 1;
                    if dentry.is_dir() && !dentry.is_dot() && !dentry.is_dot_dot() && counts[index] == 1 {
                        work_list.push(dentry.inode_no);
                    }
                }
            }
        }
        counts
    }

    /// Decodes as many records of a directory block as are well-formed. Decoding stops at the
    /// first malformed record, which is logged; the records before it remain usable.
    fn decode_block_entries(&mut self, dir_no: InodeNo, block: BlockIdx, buf: &[u8]) -> Vec<Dentry> {
        let mut entries = Vec::new();
        for result in DentryIter::new(buf) {
            match result {
                Ok(dentry) => entries.push(dentry),
                Err(reason) => {
                    warn!("in block {} of directory inode {}: {:#}", block, dir_no, reason);
                    self.report.entries_skipped += 1;
                    break;
                }
            }
        }
        entries
    }
}
