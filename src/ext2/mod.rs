mod dentry;
mod fs;
mod group_descriptor;
mod inode;
mod superblock;

pub use self::dentry::*;
pub use self::fs::*;
pub use self::group_descriptor::*;
pub use self::inode::*;
pub use self::superblock::*;

/// An inode number. Numbering starts at 1; the number 0 marks a free directory entry slot.
pub type InodeNo = u32;
/// An index identifying a filesystem block, relative to the start of the partition.
pub type BlockIdx = u32;

/// The root directory always lives in inode 2.
pub const ROOT_INODE_NO: InodeNo = 2;
/// Name of the directory that orphaned inodes are re-attached under.
pub const LOST_FOUND_NAME: &[u8] = b"lost+found";
