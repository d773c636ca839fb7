//! Ext2 driver core.
//!
//! The volume is divided into block groups, each carrying a block bitmap, an
//! inode bitmap and a slice of the inode table. File content is reached
//! through the inode's block map: 12 direct slots backed by one, two and
//! three levels of indirect pointer blocks (writes only ever populate the
//! direct slots; the indirect trees are still released on truncate and
//! delete so volumes written by other implementations stay collectable).
//!
//! [`Ext2Fs`] is the in-memory mount state: the backing image, the cached
//! superblock and block-group descriptor table, the derived geometry, and
//! the two volume-wide allocation locks. All structural mutation of the
//! bitmaps and free counters happens under those locks; mutations are
//! flushed to the image immediately, so the on-disk counters are always in
//! step with the caches.

pub mod bitmap;
pub mod block_grp;
pub mod dir;
pub mod file;
pub mod inode;
pub mod mkfs;
pub mod sb;

use crate::fatal;
use crate::fs::device::RamImage;
use crate::fs::FileType;
use crate::sync::IrqSpinlock;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use block_grp::BlockGroupDescriptor;
use inode::{Inode, NEW_DIR_PERMS, NEW_FILE_PERMS, ROOT_INODE};
use sb::{Superblock, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use spin::RwLock;

/// Volume geometry derived from the superblock at mount time. These values
/// never change while the volume is mounted, so they are kept out of the
/// superblock lock.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
    pub block_size: u32,
    pub inode_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_data_block: u32,
    pub first_inode: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub groups_count: u32,
}

impl Geometry {
    fn from_superblock(sb: &Superblock) -> Self {
        Self {
            block_size: sb.block_size(),
            inode_size: sb.inode_size(),
            blocks_per_group: sb.s_blocks_per_group,
            inodes_per_group: sb.s_inodes_per_group,
            first_data_block: sb.s_first_data_block,
            first_inode: sb.s_first_ino,
            blocks_count: sb.s_blocks_count,
            inodes_count: sb.s_inodes_count,
            groups_count: sb.block_groups_count(),
        }
    }

    /// Number of blocks covered by group `group` (the last group may be
    /// short).
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let first = self.first_data_block + group * self.blocks_per_group;
        (self.blocks_count - first).min(self.blocks_per_group)
    }

    /// Number of inodes covered by group `group`.
    pub fn inodes_in_group(&self, group: u32) -> u32 {
        (self.inodes_count - group * self.inodes_per_group).min(self.inodes_per_group)
    }
}

/// A mounted ext2 volume.
pub struct Ext2Fs {
    img: RamImage,
    geom: Geometry,
    sb: RwLock<Superblock>,
    bgdt: RwLock<Vec<BlockGroupDescriptor>>,
    /// Serializes block-bitmap scans and the block free counters.
    block_alloc_lock: IrqSpinlock<()>,
    /// Serializes inode-bitmap scans, the inode free counters and all
    /// `i_links_count` transitions.
    pub(crate) inode_alloc_lock: IrqSpinlock<()>,
}

impl Ext2Fs {
    /// Mounts the volume contained in `img`.
    ///
    /// Every structural invariant of the superblock, the descriptor table
    /// and the root directory is checked; a violation aborts, a corrupted
    /// volume must not be mutated.
    pub fn mount(img: RamImage) -> Ext2Fs {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        img.read_at(SUPERBLOCK_OFFSET, &mut raw);
        let sb: Superblock = bytemuck::pod_read_unaligned(&raw);
        sb.validate();

        let geom = Geometry::from_superblock(&sb);
        let volume_end = u64::from(geom.blocks_count) * u64::from(geom.block_size);
        if volume_end > img.len() as u64 {
            fatal!(
                target: "ext2",
                "volume claims {volume_end} bytes but the image holds {}",
                img.len()
            );
        }

        let mut bgdt = Vec::with_capacity(geom.groups_count as usize);
        for group in 0..geom.groups_count {
            let mut raw = [0u8; block_grp::DESCRIPTOR_SIZE];
            img.read_at(block_grp::descriptor_offset(&sb, group), &mut raw);
            let desc: BlockGroupDescriptor = bytemuck::pod_read_unaligned(&raw);
            desc.validate(&sb, group);
            bgdt.push(desc);
        }

        let fs = Ext2Fs {
            img,
            geom,
            sb: RwLock::new(sb),
            bgdt: RwLock::new(bgdt),
            block_alloc_lock: IrqSpinlock::new(()),
            inode_alloc_lock: IrqSpinlock::new(()),
        };
        fs.check_root();

        log::info!(
            target: "ext2",
            "mounted volume '{}': {} inodes, {} blocks of {} bytes, {} groups",
            String::from(fs.sb.read().s_volume_name),
            fs.geom.inodes_count,
            fs.geom.blocks_count,
            fs.geom.block_size,
            fs.geom.groups_count
        );
        fs
    }

    /// The root inode must be a directory of nonzero size whose `.` and
    /// `..` both resolve to itself.
    fn check_root(&self) {
        let root = Inode::get(self, ROOT_INODE);
        if !root.is_directory() || root.size() == 0 {
            fatal!(target: "ext2", "root inode is not a populated directory");
        }
        for name in [b".".as_slice(), b"..".as_slice()] {
            match dir::lookup(self, ROOT_INODE, name) {
                Some((_, entry)) if entry.inode == ROOT_INODE => (),
                _ => fatal!(target: "ext2", "root directory lacks a self-referential `{}`",
                            core::str::from_utf8(name).unwrap()),
            }
        }
    }

    /// Tears the mount state down, handing the image back.
    pub fn unmount(self) -> RamImage {
        log::info!(target: "ext2", "unmounting volume '{}'", self.volume_label());
        self.img
    }

    pub(crate) fn image(&self) -> &RamImage {
        &self.img
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geom
    }

    /// Block size of the volume in bytes.
    pub fn block_size(&self) -> u32 {
        self.geom.block_size
    }

    /// Number of block groups.
    pub fn groups_count(&self) -> u32 {
        self.geom.groups_count
    }

    /// Copy of the cached superblock.
    pub fn superblock(&self) -> Superblock {
        *self.sb.read()
    }

    /// Copy of the cached descriptor of group `group`.
    pub fn group_desc(&self, group: u32) -> BlockGroupDescriptor {
        let bgdt = self.bgdt.read();
        let Some(desc) = bgdt.get(group as usize) else {
            fatal!(target: "ext2", "block group {group} out of range");
        };
        *desc
    }

    /// Volume label.
    pub fn volume_label(&self) -> String {
        String::from(self.sb.read().s_volume_name)
    }

    /// Global free-block counter.
    pub fn free_blocks(&self) -> u32 {
        self.sb.read().s_free_blocks_count
    }

    /// Global free-inode counter.
    pub fn free_inodes(&self) -> u32 {
        self.sb.read().s_free_inodes_count
    }

    /// Allocates a zeroed block-sized scratch buffer.
    pub(crate) fn scratch_block(&self) -> Vec<u8> {
        vec![0u8; self.geom.block_size as usize]
    }

    /// Reads `buf.len()` bytes from block `blk`, starting `off` bytes into
    /// the block. Out-of-volume blocks and ranges crossing the block end are
    /// contract violations.
    pub(crate) fn block_read(&self, blk: u32, buf: &mut [u8], off: u32) {
        self.check_block_range(blk, off, buf.len());
        self.img
            .read_at(u64::from(blk) * u64::from(self.geom.block_size) + u64::from(off), buf);
    }

    /// Writes `src` into block `blk`, starting `off` bytes into the block.
    pub(crate) fn block_write(&self, blk: u32, src: &[u8], off: u32) {
        self.check_block_range(blk, off, src.len());
        self.img
            .write_at(u64::from(blk) * u64::from(self.geom.block_size) + u64::from(off), src);
    }

    fn check_block_range(&self, blk: u32, off: u32, len: usize) {
        if blk >= self.geom.blocks_count {
            fatal!(target: "ext2", "block {blk} out of volume ({} blocks)", self.geom.blocks_count);
        }
        if u64::from(off) + len as u64 > u64::from(self.geom.block_size) {
            fatal!(target: "ext2", "access [{off}, {off}+{len}) crosses the block end");
        }
    }

    fn flush_superblock(&self, sb: &Superblock) {
        self.img.write_at(SUPERBLOCK_OFFSET, bytemuck::bytes_of(sb));
    }

    fn flush_group_desc(&self, sb: &Superblock, group: u32, desc: &BlockGroupDescriptor) {
        self.img
            .write_at(block_grp::descriptor_offset(sb, group), bytemuck::bytes_of(desc));
    }

    /// Allocates one data block, scanning the groups in order. Returns
    /// `None` when the volume is full.
    pub(crate) fn alloc_block(&self) -> Option<u32> {
        let _guard = self.block_alloc_lock.lock();
        let mut bgdt = self.bgdt.write();
        let mut sb = self.sb.write();
        for group in 0..self.geom.groups_count {
            let desc = &mut bgdt[group as usize];
            if desc.bg_free_blocks_count == 0 {
                continue;
            }
            let nbits = self.geom.blocks_in_group(group) as usize;
            let mut map = self.scratch_block();
            self.block_read(desc.bg_block_bitmap, &mut map, 0);
            let Some(idx) = bitmap::first_zero(&map, nbits) else {
                fatal!(
                    target: "ext2",
                    "group {group} counts {} free blocks but its bitmap is full",
                    desc.bg_free_blocks_count
                );
            };
            bitmap::set(&mut map, idx, nbits);
            self.block_write(desc.bg_block_bitmap, &map, 0);

            let blk =
                self.geom.first_data_block + group * self.geom.blocks_per_group + idx as u32;
            if blk >= self.geom.blocks_count {
                fatal!(target: "ext2", "allocated block {blk} past the end of the volume");
            }
            desc.bg_free_blocks_count -= 1;
            sb.s_free_blocks_count -= 1;
            self.flush_group_desc(&sb, group, desc);
            self.flush_superblock(&sb);
            return Some(blk);
        }
        if sb.s_free_blocks_count != 0 {
            fatal!(
                target: "ext2",
                "no free block found but the superblock counts {}",
                sb.s_free_blocks_count
            );
        }
        None
    }

    /// Releases data block `blk`.
    pub(crate) fn free_block(&self, blk: u32) {
        if blk < self.geom.first_data_block || blk >= self.geom.blocks_count {
            fatal!(target: "ext2", "freeing block {blk} outside the data area");
        }
        let _guard = self.block_alloc_lock.lock();
        let mut bgdt = self.bgdt.write();
        let mut sb = self.sb.write();

        let group = (blk - self.geom.first_data_block) / self.geom.blocks_per_group;
        let idx = ((blk - self.geom.first_data_block) % self.geom.blocks_per_group) as usize;
        let nbits = self.geom.blocks_in_group(group) as usize;
        let desc = &mut bgdt[group as usize];

        let mut map = self.scratch_block();
        self.block_read(desc.bg_block_bitmap, &mut map, 0);
        if !bitmap::test(&map, idx, nbits) {
            fatal!(target: "ext2", "double free of block {blk}");
        }
        bitmap::clear(&mut map, idx, nbits);
        self.block_write(desc.bg_block_bitmap, &map, 0);

        desc.bg_free_blocks_count += 1;
        sb.s_free_blocks_count += 1;
        self.flush_group_desc(&sb, group, desc);
        self.flush_superblock(&sb);
    }

    /// Allocates an inode of the given type, scanning the groups in order.
    /// The record is zeroed and its mode initialized; the links count starts
    /// at zero and is raised by directory-entry insertion. Returns `None`
    /// when no inode is free.
    pub(crate) fn alloc_inode(&self, ftype: FileType) -> Option<u32> {
        let _guard = self.inode_alloc_lock.lock();
        let mut inum = None;
        {
            let mut bgdt = self.bgdt.write();
            let mut sb = self.sb.write();
            for group in 0..self.geom.groups_count {
                let desc = &mut bgdt[group as usize];
                if desc.bg_free_inodes_count == 0 {
                    continue;
                }
                let nbits = self.geom.inodes_in_group(group) as usize;
                let mut map = self.scratch_block();
                self.block_read(desc.bg_inode_bitmap, &mut map, 0);
                let Some(idx) = bitmap::first_zero(&map, nbits) else {
                    fatal!(
                        target: "ext2",
                        "group {group} counts {} free inodes but its bitmap is full",
                        desc.bg_free_inodes_count
                    );
                };
                bitmap::set(&mut map, idx, nbits);
                self.block_write(desc.bg_inode_bitmap, &map, 0);

                let n = group * self.geom.inodes_per_group + idx as u32 + 1;
                if n < self.geom.first_inode || n > self.geom.inodes_count {
                    fatal!(target: "ext2", "allocated reserved or out-of-range inode {n}");
                }
                desc.bg_free_inodes_count -= 1;
                sb.s_free_inodes_count -= 1;
                if ftype == FileType::Directory {
                    desc.bg_used_dirs_count += 1;
                }
                self.flush_group_desc(&sb, group, desc);
                self.flush_superblock(&sb);
                inum = Some(n);
                break;
            }
            if inum.is_none() && sb.s_free_inodes_count != 0 {
                fatal!(
                    target: "ext2",
                    "no free inode found but the superblock counts {}",
                    sb.s_free_inodes_count
                );
            }
        }

        let inum = inum?;
        let mut record: Inode = bytemuck::Zeroable::zeroed();
        record.i_mode = ftype.to_mode()
            | if ftype == FileType::Directory {
                NEW_DIR_PERMS
            } else {
                NEW_FILE_PERMS
            };
        Inode::set(self, inum, &record);
        Some(inum)
    }

    /// Releases inode `inum`. `directory` tells whether the inode was a
    /// directory (its group keeps a directory census).
    pub(crate) fn free_inode(&self, inum: u32, directory: bool) {
        if inum == 0 || inum > self.geom.inodes_count {
            fatal!(target: "ext2", "freeing inode {inum} out of range");
        }
        let _guard = self.inode_alloc_lock.lock();
        let mut bgdt = self.bgdt.write();
        let mut sb = self.sb.write();

        let group = (inum - 1) / self.geom.inodes_per_group;
        let idx = ((inum - 1) % self.geom.inodes_per_group) as usize;
        let nbits = self.geom.inodes_in_group(group) as usize;
        let desc = &mut bgdt[group as usize];

        let mut map = self.scratch_block();
        self.block_read(desc.bg_inode_bitmap, &mut map, 0);
        if !bitmap::test(&map, idx, nbits) {
            fatal!(target: "ext2", "double free of inode {inum}");
        }
        bitmap::clear(&mut map, idx, nbits);
        self.block_write(desc.bg_inode_bitmap, &map, 0);

        desc.bg_free_inodes_count += 1;
        sb.s_free_inodes_count += 1;
        if directory {
            desc.bg_used_dirs_count -= 1;
        }
        self.flush_group_desc(&sb, group, desc);
        self.flush_superblock(&sb);
    }
}

#[cfg(test)]
mod tests {
    use super::mkfs::{format, FormatOptions};
    use super::*;

    fn fs() -> Ext2Fs {
        Ext2Fs::mount(format(1 << 20, &FormatOptions::default()))
    }

    #[test]
    fn block_alloc_roundtrip() {
        let fs = fs();
        let free = fs.free_blocks();
        let group_free = fs.group_desc(0).bg_free_blocks_count;
        let blk = fs.alloc_block().unwrap();
        assert!(blk >= fs.geometry().first_data_block);
        assert!(blk < fs.geometry().blocks_count);
        assert_eq!(fs.free_blocks(), free - 1);
        assert_eq!(fs.group_desc(0).bg_free_blocks_count, group_free - 1);
        fs.free_block(blk);
        assert_eq!(fs.free_blocks(), free);
        assert_eq!(fs.group_desc(0).bg_free_blocks_count, group_free);
    }

    #[test]
    fn blocks_allocate_in_bitmap_order() {
        let fs = fs();
        let a = fs.alloc_block().unwrap();
        let b = fs.alloc_block().unwrap();
        assert_eq!(b, a + 1);
        fs.free_block(a);
        // The scan restarts at the lowest clear bit.
        assert_eq!(fs.alloc_block().unwrap(), a);
    }

    #[test]
    fn inode_alloc_roundtrip() {
        let fs = fs();
        let free = fs.free_inodes();
        let used_dirs = fs.group_desc(0).bg_used_dirs_count;
        let inum = fs.alloc_inode(FileType::Regular).unwrap();
        // The reserved range is pre-marked, so a fresh volume hands out
        // the first usable inode.
        assert_eq!(inum, fs.geometry().first_inode);
        let ino = Inode::get(&fs, inum);
        assert_eq!(ino.i_mode, FileType::Regular.to_mode() | NEW_FILE_PERMS);
        assert_eq!(ino.i_links_count, 0);
        assert_eq!(ino.size(), 0);
        assert_eq!(fs.free_inodes(), free - 1);
        assert_eq!(fs.group_desc(0).bg_used_dirs_count, used_dirs);
        fs.free_inode(inum, false);
        assert_eq!(fs.free_inodes(), free);
    }

    #[test]
    fn directory_inodes_are_censused() {
        let fs = fs();
        let used_dirs = fs.group_desc(0).bg_used_dirs_count;
        let inum = fs.alloc_inode(FileType::Directory).unwrap();
        let ino = Inode::get(&fs, inum);
        assert_eq!(ino.i_mode, FileType::Directory.to_mode() | NEW_DIR_PERMS);
        assert_eq!(fs.group_desc(0).bg_used_dirs_count, used_dirs + 1);
        fs.free_inode(inum, true);
        assert_eq!(fs.group_desc(0).bg_used_dirs_count, used_dirs);
    }

    #[test]
    fn exhaustion_drains_the_counters() {
        let opts = FormatOptions {
            inodes_per_group: 16,
            ..FormatOptions::default()
        };
        let fs = Ext2Fs::mount(format(64 * 1024, &opts));
        while fs.alloc_block().is_some() {}
        assert_eq!(fs.free_blocks(), 0);
        while fs.alloc_inode(FileType::Regular).is_some() {}
        assert_eq!(fs.free_inodes(), 0);
    }

    #[test]
    #[should_panic]
    fn block_double_free_aborts() {
        let fs = fs();
        let blk = fs.alloc_block().unwrap();
        fs.free_block(blk);
        fs.free_block(blk);
    }

    #[test]
    #[should_panic]
    fn inode_double_free_aborts() {
        let fs = fs();
        let inum = fs.alloc_inode(FileType::Regular).unwrap();
        fs.free_inode(inum, false);
        fs.free_inode(inum, false);
    }

    #[test]
    #[should_panic]
    fn freeing_the_boot_block_aborts() {
        let fs = fs();
        // Block 0 precedes the data area on a 1 KiB-block volume.
        fs.free_block(0);
    }
}
