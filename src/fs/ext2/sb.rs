//! On-disk superblock.
//!
//! The superblock sits at byte offset 1024 from the start of the image,
//! occupies 1024 bytes, and describes the volume geometry: block size,
//! group layout, inode record size, and the global free counters. Every
//! field is little-endian.

use crate::fatal;
use alloc::string::String;
use bytemuck::{Pod, Zeroable};

/// Byte offset of the superblock from the start of the image.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// On-disk size of the superblock in bytes.
pub const SUPERBLOCK_SIZE: usize = 1024;

/// Ext2 signature field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FsMagic(u16);

impl FsMagic {
    /// The ext2 signature, `0xEF53`.
    pub const EXT2: Self = Self(0xEF53);

    pub fn is_valid(self) -> bool {
        self == Self::EXT2
    }
}

/// Filesystem state field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FsState(u16);

impl FsState {
    /// Cleanly unmounted.
    pub const VALID: Self = Self(1);
    /// Errors were detected.
    pub const ERROR: Self = Self(2);

    pub fn is_clean(self) -> bool {
        self == Self::VALID
    }
}

/// Major revision level field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FsRevision(u32);

impl FsRevision {
    /// Original format, fixed inode size.
    pub const GOOD_OLD: Self = Self(0);
    /// Dynamic revision: variable inode sizes, extended superblock fields.
    pub const DYNAMIC: Self = Self(1);
}

/// Volume label, 16 bytes of ISO-Latin-1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct VolumeLabel(pub [u8; 16]);

impl VolumeLabel {
    /// Returns an [`Iterator`] over the characters of the label.
    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        // ISO-Latin-1 maps onto the first Unicode block byte for byte.
        self.0.iter().copied().filter(|&b| b != 0).map(char::from)
    }
}

impl From<VolumeLabel> for String {
    fn from(value: VolumeLabel) -> Self {
        value.chars().collect()
    }
}

/// The ext2 superblock.
///
/// Only revision-1 ("dynamic") volumes are accepted; the extended fields
/// past `s_rev_level` are therefore always meaningful.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// Total number of inodes in the filesystem.
    pub s_inodes_count: u32,
    /// Total number of blocks in the filesystem.
    pub s_blocks_count: u32,
    /// Number of blocks reserved for the superuser.
    pub s_r_blocks_count: u32,
    /// Total number of unallocated blocks.
    pub s_free_blocks_count: u32,
    /// Total number of unallocated inodes.
    pub s_free_inodes_count: u32,
    /// Block number of the block containing the superblock.
    pub s_first_data_block: u32,
    /// `log2(block_size) - 10`
    pub s_log_block_size: u32,
    /// `log2(fragment_size) - 10`
    pub s_log_frag_size: u32,
    /// The number of blocks per block group.
    pub s_blocks_per_group: u32,
    /// The number of fragments per block group.
    pub s_frags_per_group: u32,
    /// The number of inodes per block group.
    pub s_inodes_per_group: u32,
    /// Timestamp of the last mount operation.
    pub s_mtime: u32,
    /// Timestamp of the last write operation.
    pub s_wtime: u32,
    /// Number of mounts since the last consistency check.
    pub s_mnt_count: u16,
    /// Number of mounts allowed before a consistency check must be done.
    pub s_max_mnt_count: u16,
    /// The ext2 signature.
    pub s_magic: FsMagic,
    /// The filesystem's state.
    pub s_state: FsState,
    /// The action to perform when an error is detected.
    pub s_errors: u16,
    /// The minor revision level.
    pub s_minor_rev_level: u16,
    /// Timestamp of the last consistency check.
    pub s_lastcheck: u32,
    /// Interval between mandatory consistency checks.
    pub s_checkinterval: u32,
    /// Id of the operating system that created the filesystem.
    pub s_creator_os: u32,
    /// The major revision level.
    pub s_rev_level: FsRevision,
    /// UID that can use reserved blocks.
    pub s_def_resuid: u16,
    /// GID that can use reserved blocks.
    pub s_def_resgid: u16,

    // Extended (revision 1) fields.
    /// First usable inode number.
    pub s_first_ino: u32,
    /// Size of the on-disk inode record in bytes.
    pub s_inode_size: u16,
    /// Block group containing this superblock copy.
    pub s_block_group_nr: u16,
    /// Optional feature set.
    pub s_feature_compat: u32,
    /// Required feature set.
    pub s_feature_incompat: u32,
    /// Write-required feature set.
    pub s_feature_ro_compat: u32,
    /// Volume UUID.
    pub s_uuid: [u8; 16],
    /// Volume label.
    pub s_volume_name: VolumeLabel,
    /// Path the volume was last mounted to.
    pub s_last_mounted: [u8; 64],
    /// Compression algorithms in use.
    pub s_algo_bitmap: u32,
    /// Number of blocks to preallocate for files.
    pub s_prealloc_blocks: u8,
    /// Number of blocks to preallocate for directories.
    pub s_prealloc_dir_blocks: u8,
    pub s_pad: u16,
    /// Journal UUID.
    pub s_journal_uuid: [u8; 16],
    /// Journal inode.
    pub s_journal_inum: u32,
    /// Journal device.
    pub s_journal_dev: u32,
    /// Head of the orphan inode list.
    pub s_last_orphan: u32,

    pub s_reserved: [u8; 788],
}

/// Directory entries carry a file-type indicator byte.
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x2;

impl Superblock {
    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        1024 << self.s_log_block_size
    }

    /// Fragment size in bytes.
    pub fn frag_size(&self) -> u32 {
        1024 << self.s_log_frag_size
    }

    /// On-disk inode record size in bytes.
    pub fn inode_size(&self) -> u32 {
        u32::from(self.s_inode_size)
    }

    /// Number of block groups on the volume. The last group may be shorter
    /// than `s_blocks_per_group`.
    pub fn block_groups_count(&self) -> u32 {
        let data_blocks = self.s_blocks_count - self.s_first_data_block;
        data_blocks.div_ceil(self.s_blocks_per_group)
    }

    /// First block belonging to group `group`.
    pub fn group_first_block(&self, group: u32) -> u32 {
        self.s_first_data_block + group * self.s_blocks_per_group
    }

    /// Number of blocks actually covered by group `group`.
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let first = self.group_first_block(group);
        (self.s_blocks_count - first).min(self.s_blocks_per_group)
    }

    /// Checks every structural invariant of the superblock. Any violation
    /// means the volume cannot be safely interpreted and aborts.
    pub fn validate(&self) {
        if !self.s_magic.is_valid() {
            fatal!(target: "ext2", "bad superblock signature {:#x?}", self.s_magic);
        }
        if !self.s_state.is_clean() {
            fatal!(target: "ext2", "volume was not cleanly unmounted: {:?}", self.s_state);
        }
        if self.s_rev_level != FsRevision::DYNAMIC {
            fatal!(target: "ext2", "unsupported revision {:?}", self.s_rev_level);
        }
        if self.s_log_block_size > 2 {
            fatal!(target: "ext2", "unsupported block size log {}", self.s_log_block_size);
        }
        if self.s_log_frag_size != self.s_log_block_size {
            fatal!(
                target: "ext2",
                "fragment size {} != block size {}",
                self.frag_size(),
                self.block_size()
            );
        }
        let expected_first = u32::from(self.block_size() == 1024);
        if self.s_first_data_block != expected_first {
            fatal!(target: "ext2", "bogus first data block {}", self.s_first_data_block);
        }
        if self.s_blocks_per_group == 0 || self.s_inodes_per_group == 0 {
            fatal!(target: "ext2", "zero blocks or inodes per group");
        }
        // A single bitmap block must cover a whole group.
        let bits_per_block = self.block_size() * 8;
        if self.s_blocks_per_group > bits_per_block || self.s_inodes_per_group > bits_per_block {
            fatal!(target: "ext2", "group wider than one bitmap block");
        }
        if self.s_inode_size % 2 != 0 || u32::from(self.s_inode_size) > self.block_size() {
            fatal!(target: "ext2", "misaligned inode size {}", self.s_inode_size);
        }
        if self.s_free_blocks_count > self.s_blocks_count
            || self.s_free_inodes_count > self.s_inodes_count
        {
            fatal!(target: "ext2", "free counters exceed totals");
        }
        if self.s_blocks_count <= self.s_first_data_block {
            fatal!(target: "ext2", "volume has no data blocks");
        }
    }
}
