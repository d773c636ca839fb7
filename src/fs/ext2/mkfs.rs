//! Volume formatter.
//!
//! Lays a fresh revision-1 ext2 volume out over a zeroed image: superblock,
//! block group descriptor table, per-group bitmaps and inode tables, and a
//! root directory holding `.` and `..`. Each group's metadata lives inside
//! the group's own block range; in a short last group the bitmap bits past
//! the end of the volume are pre-set so the allocator never hands them out.

use super::block_grp::{self, BlockGroupDescriptor};
use super::inode::{Inode, ROOT_INODE};
use super::sb::{FsMagic, FsRevision, FsState, Superblock, SUPERBLOCK_OFFSET};
use crate::fatal;
use crate::fs::device::RamImage;
use crate::fs::FileType;
use alloc::string::String;
use alloc::vec;
use bytemuck::Zeroable;

/// Error-detection policy recorded in the superblock: remount read-only.
const ERRORS_RO: u16 = 2;
/// First inode handed out to user files; lower numbers are reserved.
const FIRST_INODE: u32 = 11;
/// On-disk inode record size written by this formatter.
const INODE_SIZE: u32 = 128;

/// Formatting parameters. Zero values are derived from the volume size.
#[derive(Clone, Debug)]
pub struct FormatOptions {
    /// Block size in bytes: 1024, 2048 or 4096.
    pub block_size: u32,
    /// Blocks per group; `0` picks the bitmap capacity (`8 * block_size`).
    pub blocks_per_group: u32,
    /// Inodes per group; `0` derives one inode per four blocks.
    pub inodes_per_group: u32,
    /// Volume label, truncated to 16 bytes.
    pub label: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_per_group: 0,
            inodes_per_group: 0,
            label: None,
        }
    }
}

fn write_dirent(img: &RamImage, off: u64, inode: u32, rec_len: u16, name: &[u8], ftype: u8) {
    let mut rec = vec![0u8; usize::from(rec_len)];
    rec[0..4].copy_from_slice(&inode.to_le_bytes());
    rec[4..6].copy_from_slice(&rec_len.to_le_bytes());
    rec[6] = name.len() as u8;
    rec[7] = ftype;
    rec[8..8 + name.len()].copy_from_slice(name);
    img.write_at(off, &rec);
}

/// Formats a volume of `len` bytes and returns the image, ready to mount.
pub fn format(len: usize, opts: &FormatOptions) -> RamImage {
    let bs = opts.block_size;
    if !matches!(bs, 1024 | 2048 | 4096) {
        fatal!(target: "ext2", "unsupported block size {bs}");
    }
    let first_data_block = u32::from(bs == 1024);
    let total_blocks = (len / bs as usize) as u32;
    let bpg = match opts.blocks_per_group {
        0 => bs * 8,
        n => n.min(bs * 8),
    };
    if total_blocks <= first_data_block {
        fatal!(target: "ext2", "image of {len} bytes is too small for a volume");
    }
    let groups = (total_blocks - first_data_block).div_ceil(bpg);
    let ipg = match opts.inodes_per_group {
        0 => (total_blocks / groups / 4).clamp(16, bs * 8),
        n => n.min(bs * 8),
    }
    .next_multiple_of(8);
    let total_inodes = ipg * groups;

    let itb_blocks = (ipg * INODE_SIZE).div_ceil(bs);
    let bgdt_blocks = (groups * block_grp::DESCRIPTOR_SIZE as u32).div_ceil(bs);

    let img = RamImage::zeroed(len);
    let mut free_blocks_total = 0u32;
    let mut free_inodes_total = 0u32;
    let mut group0_data_start = 0u32;

    // The superblock is assembled first so descriptor offsets can be
    // computed, and flushed last with the final free counters.
    let mut sb = Superblock::zeroed();
    sb.s_inodes_count = total_inodes;
    sb.s_blocks_count = total_blocks;
    sb.s_first_data_block = first_data_block;
    sb.s_log_block_size = bs.trailing_zeros() - 10;
    sb.s_log_frag_size = sb.s_log_block_size;
    sb.s_blocks_per_group = bpg;
    sb.s_frags_per_group = bpg;
    sb.s_inodes_per_group = ipg;
    sb.s_max_mnt_count = u16::MAX;
    sb.s_magic = FsMagic::EXT2;
    sb.s_state = FsState::VALID;
    sb.s_errors = ERRORS_RO;
    sb.s_rev_level = FsRevision::DYNAMIC;
    sb.s_first_ino = FIRST_INODE;
    sb.s_inode_size = INODE_SIZE as u16;
    sb.s_feature_incompat = super::sb::FEATURE_INCOMPAT_FILETYPE;
    if let Some(label) = &opts.label {
        let raw = label.as_bytes();
        let n = raw.len().min(16);
        sb.s_volume_name.0[..n].copy_from_slice(&raw[..n]);
    }

    for group in 0..groups {
        let group_first = first_data_block + group * bpg;
        let blocks_in_group = (total_blocks - group_first).min(bpg);

        // Group 0 additionally hosts the superblock and the descriptor
        // table at its head.
        let meta_first = if group == 0 {
            group_first + 1 + bgdt_blocks
        } else {
            group_first
        };
        let block_bitmap = meta_first;
        let inode_bitmap = meta_first + 1;
        let inode_table = meta_first + 2;
        let data_start = inode_table + itb_blocks;
        // Group 0 must also fit the root directory's data block.
        if data_start + u32::from(group == 0) > group_first + blocks_in_group {
            fatal!(
                target: "ext2",
                "group {group} cannot hold its metadata ({} blocks available)",
                blocks_in_group
            );
        }
        if group == 0 {
            group0_data_start = data_start;
        }

        // Block bitmap: metadata blocks in use, the tail of a short group
        // unusable.
        let used = data_start - group_first;
        let mut map = vec![0u8; bs as usize];
        for bit in 0..used {
            map[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        for bit in blocks_in_group..bpg {
            map[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        img.write_at(u64::from(block_bitmap) * u64::from(bs), &map);
        let free_blocks = blocks_in_group - used;

        // Inode bitmap: the reserved inodes live in group 0.
        let reserved = if group == 0 { FIRST_INODE - 1 } else { 0 };
        let mut map = vec![0u8; bs as usize];
        for bit in 0..reserved {
            map[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        img.write_at(u64::from(inode_bitmap) * u64::from(bs), &map);
        let free_inodes = ipg - reserved;

        let desc = BlockGroupDescriptor {
            bg_block_bitmap: block_bitmap,
            bg_inode_bitmap: inode_bitmap,
            bg_inode_table: inode_table,
            bg_free_blocks_count: free_blocks as u16,
            bg_free_inodes_count: free_inodes as u16,
            bg_used_dirs_count: u16::from(group == 0),
            ..BlockGroupDescriptor::zeroed()
        };
        img.write_at(block_grp::descriptor_offset(&sb, group), bytemuck::bytes_of(&desc));

        free_blocks_total += free_blocks;
        free_inodes_total += free_inodes;
    }

    // Root directory: one data block with `.` and `..`, both pointing back
    // at the root.
    let root_block = group0_data_start;
    let root_off = u64::from(root_block) * u64::from(bs);
    write_dirent(&img, root_off, ROOT_INODE, 12, b".", FileType::Directory.indicator());
    write_dirent(
        &img,
        root_off + 12,
        ROOT_INODE,
        (bs - 12) as u16,
        b"..",
        FileType::Directory.indicator(),
    );

    let mut root = Inode::zeroed();
    root.i_mode = FileType::Directory.to_mode() | 0o755;
    root.i_links_count = 2;
    root.i_block[0] = root_block;
    root.set_size(u64::from(bs));
    let group0 = {
        let mut raw = [0u8; block_grp::DESCRIPTOR_SIZE];
        img.read_at(block_grp::descriptor_offset(&sb, 0), &mut raw);
        let mut desc: BlockGroupDescriptor = bytemuck::pod_read_unaligned(&raw);
        // Claim the root's data block.
        let bit = root_block - first_data_block;
        let mut map = vec![0u8; bs as usize];
        let map_off = u64::from(desc.bg_block_bitmap) * u64::from(bs);
        img.read_at(map_off, &mut map);
        map[(bit / 8) as usize] |= 1 << (bit % 8);
        img.write_at(map_off, &map);
        desc.bg_free_blocks_count -= 1;
        free_blocks_total -= 1;
        desc
    };
    img.write_at(block_grp::descriptor_offset(&sb, 0), bytemuck::bytes_of(&group0));
    let root_record_off =
        u64::from(group0.bg_inode_table) * u64::from(bs) + u64::from(ROOT_INODE - 1) * u64::from(INODE_SIZE);
    img.write_at(root_record_off, bytemuck::bytes_of(&root));

    sb.s_free_blocks_count = free_blocks_total;
    sb.s_free_inodes_count = free_inodes_total;
    img.write_at(SUPERBLOCK_OFFSET, bytemuck::bytes_of(&sb));
    img
}
