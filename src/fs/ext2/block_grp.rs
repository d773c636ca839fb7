//! Block group descriptors.
//!
//! Blocks are clustered into groups, each owning a block bitmap, an inode
//! bitmap and an inode table, all placed inside the group's own block range.
//! The descriptor table starts at the block immediately following the
//! superblock and holds one packed 32-byte record per group.

use super::sb::Superblock;
use crate::fatal;
use bytemuck::{Pod, Zeroable};

/// On-disk size of one descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = 32;

/// A block group descriptor.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BlockGroupDescriptor {
    /// Block number of the group's block bitmap.
    pub bg_block_bitmap: u32,
    /// Block number of the group's inode bitmap.
    pub bg_inode_bitmap: u32,
    /// First block of the group's inode table.
    pub bg_inode_table: u32,
    /// Number of unallocated blocks in the group.
    pub bg_free_blocks_count: u16,
    /// Number of unallocated inodes in the group.
    pub bg_free_inodes_count: u16,
    /// Number of directory inodes in the group.
    pub bg_used_dirs_count: u16,
    pub bg_pad: u16,
    pub bg_reserved: [u8; 12],
}

/// First block of the descriptor table: the block right after the one
/// holding the superblock.
pub fn table_first_block(sb: &Superblock) -> u32 {
    sb.s_first_data_block + 1
}

/// Byte offset of descriptor `group` within the image.
pub fn descriptor_offset(sb: &Superblock, group: u32) -> u64 {
    u64::from(table_first_block(sb)) * u64::from(sb.block_size())
        + u64::from(group) * DESCRIPTOR_SIZE as u64
}

impl BlockGroupDescriptor {
    /// Number of blocks occupied by the group's inode table.
    pub fn inode_table_blocks(sb: &Superblock) -> u32 {
        (sb.s_inodes_per_group * sb.inode_size()).div_ceil(sb.block_size())
    }

    /// Checks the structural invariants of descriptor `group`. Violations
    /// abort: a descriptor pointing outside its own group means the image
    /// cannot be interpreted safely.
    pub fn validate(&self, sb: &Superblock, group: u32) {
        let first = sb.group_first_block(group);
        let end = first + sb.blocks_in_group(group);
        let in_group = |blk: u32| blk >= first && blk < end;

        if !in_group(self.bg_block_bitmap) || !in_group(self.bg_inode_bitmap) {
            fatal!(
                target: "ext2",
                "group {group}: bitmap blocks ({}, {}) outside [{first}, {end})",
                self.bg_block_bitmap,
                self.bg_inode_bitmap
            );
        }
        let table_end = self.bg_inode_table + Self::inode_table_blocks(sb);
        if !in_group(self.bg_inode_table) || table_end > end {
            fatal!(
                target: "ext2",
                "group {group}: inode table [{}, {table_end}) outside [{first}, {end})",
                self.bg_inode_table
            );
        }
        if u32::from(self.bg_free_blocks_count) > sb.s_blocks_per_group {
            fatal!(target: "ext2", "group {group}: free blocks counter out of range");
        }
        if u32::from(self.bg_free_inodes_count) > sb.s_inodes_per_group
            || u32::from(self.bg_used_dirs_count) > sb.s_inodes_per_group
        {
            fatal!(target: "ext2", "group {group}: inode counters out of range");
        }
    }
}
