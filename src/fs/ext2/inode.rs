//! On-disk inode records.
//!
//! An inode is a fixed-size record describing one file; the record size is
//! declared by the superblock and only the first 128 bytes are interpreted.
//! Inode numbers are 1-based, `0` is the "no inode" sentinel. Records are
//! accessed copy-in/copy-out: mutators read the record, update it and write
//! it back through [`Inode::set`].

use super::Ext2Fs;
use crate::fatal;
use crate::fs::FileType;
use bytemuck::{Pod, Zeroable};

/// Number of direct block slots in an inode.
pub const DIRECT_BLOCKS: usize = 12;
/// Slot of the singly-indirect block pointer.
pub const SINGLY_INDIRECT: usize = 12;
/// Slot of the doubly-indirect block pointer.
pub const DOUBLY_INDIRECT: usize = 13;
/// Slot of the triply-indirect block pointer.
pub const TRIPLY_INDIRECT: usize = 14;

/// Inode number of the root directory.
pub const ROOT_INODE: u32 = 2;

/// Size of the interpreted part of an inode record.
pub const INODE_RECORD_SIZE: usize = 128;

/// Sector granularity of `i_blocks`.
const SECTOR_SIZE: u32 = 512;

/// Permission bits set on freshly allocated regular files: `rw-rw-r--`.
pub const NEW_FILE_PERMS: u16 = 0o664;
/// Permission bits set on freshly allocated directories: `rwxrwxr-x`.
pub const NEW_DIR_PERMS: u16 = 0o775;

/// An inode record. Field layout matches the on-disk format, little-endian,
/// no padding.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Inode {
    /// File type (top nibble) and permission bits.
    pub i_mode: u16,
    /// Owner UID.
    pub i_uid: u16,
    /// Lower 32 bits of the file size in bytes.
    pub i_size: u32,
    /// Timestamp of the last access.
    pub i_atime: u32,
    /// Timestamp of the last metadata change.
    pub i_ctime: u32,
    /// Timestamp of the last content change.
    pub i_mtime: u32,
    /// Timestamp of the deletion.
    pub i_dtime: u32,
    /// Owner GID.
    pub i_gid: u16,
    /// Number of directory entries referencing this inode.
    pub i_links_count: u16,
    /// Number of 512-byte sectors covered by the content.
    pub i_blocks: u32,
    /// Inode flags.
    pub i_flags: u32,
    /// OS-specific value.
    pub i_osd1: u32,
    /// Block map: 12 direct slots, then the singly, doubly and triply
    /// indirect pointers.
    pub i_block: [u32; DIRECT_BLOCKS + 3],
    /// Generation number.
    pub i_generation: u32,
    /// File ACL block.
    pub i_file_acl: u32,
    /// Upper 32 bits of the file size for regular files.
    pub i_size_high: u32,
    /// Fragment address.
    pub i_faddr: u32,
    /// OS-specific value.
    pub i_osd2: [u8; 12],
}

impl Inode {
    /// Decodes the file type nibble of `i_mode`.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.i_mode)
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == Some(FileType::Regular)
    }

    /// File size in bytes. The upper half is only meaningful for regular
    /// files; directories use a 32-bit size.
    pub fn size(&self) -> u64 {
        if self.is_regular() {
            u64::from(self.i_size) | (u64::from(self.i_size_high) << 32)
        } else {
            u64::from(self.i_size)
        }
    }

    /// Updates the size and the derived sector counter.
    pub fn set_size(&mut self, size: u64) {
        self.i_size = size as u32;
        if self.is_regular() {
            self.i_size_high = (size >> 32) as u32;
        }
        self.i_blocks = size.div_ceil(u64::from(SECTOR_SIZE)) as u32;
    }

    /// Byte position of record `inum` within the image.
    fn disk_offset(fs: &Ext2Fs, inum: u32) -> u64 {
        let geom = fs.geometry();
        if inum == 0 || inum > geom.inodes_count {
            fatal!(target: "ext2", "inode number {inum} out of range");
        }
        let group = (inum - 1) / geom.inodes_per_group;
        let index = (inum - 1) % geom.inodes_per_group;
        let table = fs.group_desc(group).bg_inode_table;
        u64::from(table) * u64::from(geom.block_size)
            + u64::from(index) * u64::from(geom.inode_size)
    }

    /// Reads record `inum` from the inode table.
    pub(crate) fn get(fs: &Ext2Fs, inum: u32) -> Inode {
        let mut raw = [0u8; INODE_RECORD_SIZE];
        fs.image().read_at(Self::disk_offset(fs, inum), &mut raw);
        bytemuck::pod_read_unaligned(&raw)
    }

    /// Writes record `inum` back to the inode table.
    pub(crate) fn set(fs: &Ext2Fs, inum: u32, inode: &Inode) {
        fs.image()
            .write_at(Self::disk_offset(fs, inum), bytemuck::bytes_of(inode));
    }
}
