//! Byte-level file I/O.
//!
//! Reads and writes go through the inode's 12 direct block slots, so the
//! largest reachable file is `12 * block_size` bytes. Truncation and
//! deletion additionally walk the three indirect pointer trees: a volume
//! written by another implementation may have populated them, and releasing
//! an inode must return every block it references.

use super::inode::{Inode, DIRECT_BLOCKS, DOUBLY_INDIRECT, SINGLY_INDIRECT, TRIPLY_INDIRECT};
use super::Ext2Fs;
use crate::err::Errno;
use crate::fatal;
use crate::fs::FileType;

/// Largest byte offset reachable through the direct block map.
pub(crate) fn direct_limit(fs: &Ext2Fs) -> u64 {
    DIRECT_BLOCKS as u64 * u64::from(fs.block_size())
}

/// Reads up to `buf.len()` bytes of `inum`'s content starting at byte
/// `offset`, returning the number of bytes read.
///
/// Only regular files and directories have readable content; other types
/// read as empty. Reads past the end of the file, or past the direct
/// region, are clipped.
pub(crate) fn read(fs: &Ext2Fs, inum: u32, buf: &mut [u8], offset: u64) -> usize {
    let ino = Inode::get(fs, inum);
    if !matches!(ino.file_type(), Some(FileType::Regular | FileType::Directory)) {
        return 0;
    }
    let size = ino.size();
    if offset >= size {
        return 0;
    }
    let bs = u64::from(fs.block_size());
    let end = (offset + buf.len() as u64).min(size).min(direct_limit(fs));
    if end <= offset {
        return 0;
    }

    let mut pos = offset;
    let mut copied = 0usize;
    while pos < end {
        let block_idx = (pos / bs) as usize;
        let block_off = (pos % bs) as u32;
        let chunk = (bs - u64::from(block_off)).min(end - pos) as usize;
        let blk = ino.i_block[block_idx];
        if blk == 0 {
            // The size covers this offset, so the slot must be mapped.
            fatal!(target: "ext2", "inode {inum}: unmapped block {block_idx} within size {size}");
        }
        fs.block_read(blk, &mut buf[copied..copied + chunk], block_off);
        pos += chunk as u64;
        copied += chunk;
    }
    copied
}

/// Writes `buf` into `inum`'s content starting at byte `offset`, allocating
/// data blocks on demand. Returns the number of bytes written.
///
/// Writes are confined to the direct region: offsets at or past
/// `12 * block_size` (or past the 32-bit size field) are rejected with
/// `EFBIG`. When the volume fills up mid-write, the bytes already committed
/// are reported; `ENOSPC` is only returned when nothing could be written.
pub(crate) fn write(fs: &Ext2Fs, inum: u32, buf: &[u8], offset: u64) -> Result<usize, Errno> {
    let mut ino = Inode::get(fs, inum);
    if !matches!(ino.file_type(), Some(FileType::Regular | FileType::Directory)) {
        return Err(Errno::EBADF);
    }
    if offset >= direct_limit(fs) || offset >= u64::from(u32::MAX) {
        return Err(Errno::EFBIG);
    }
    let bs = u64::from(fs.block_size());
    let end = (offset + buf.len() as u64).min(direct_limit(fs));
    if end <= offset {
        return Ok(0);
    }

    let mut pos = offset;
    let mut copied = 0usize;
    let mut out_of_space = false;
    while pos < end {
        let block_idx = (pos / bs) as usize;
        let block_off = (pos % bs) as u32;
        let chunk = (bs - u64::from(block_off)).min(end - pos) as usize;
        if ino.i_block[block_idx] == 0 {
            match fs.alloc_block() {
                Some(blk) => ino.i_block[block_idx] = blk,
                None => {
                    out_of_space = true;
                    break;
                }
            }
        }
        fs.block_write(ino.i_block[block_idx], &buf[copied..copied + chunk], block_off);
        pos += chunk as u64;
        copied += chunk;
        if pos > ino.size() {
            ino.set_size(pos);
        }
    }
    if copied == 0 && out_of_space {
        return Err(Errno::ENOSPC);
    }
    Inode::set(fs, inum, &ino);
    Ok(copied)
}

/// Releases an indirect pointer block of the given `level` and every block
/// reachable through it. Level 0 is a plain data block.
fn dispose(fs: &Ext2Fs, blk: u32, level: u32) {
    if blk == 0 {
        return;
    }
    if level > 0 {
        let mut table = fs.scratch_block();
        fs.block_read(blk, &mut table, 0);
        for entry in table.chunks_exact(4) {
            let ptr = u32::from_le_bytes(entry.try_into().unwrap());
            if ptr != 0 {
                dispose(fs, ptr, level - 1);
            }
        }
    }
    fs.free_block(blk);
}

/// Returns every content block of `ino` to the free pool and clears the
/// block map and the size. The caller writes the record back.
pub(crate) fn release_content(fs: &Ext2Fs, ino: &mut Inode) {
    for slot in 0..DIRECT_BLOCKS {
        if ino.i_block[slot] != 0 {
            fs.free_block(ino.i_block[slot]);
        }
    }
    dispose(fs, ino.i_block[SINGLY_INDIRECT], 1);
    dispose(fs, ino.i_block[DOUBLY_INDIRECT], 2);
    dispose(fs, ino.i_block[TRIPLY_INDIRECT], 3);
    ino.i_block = [0; DIRECT_BLOCKS + 3];
    ino.set_size(0);
}

/// Truncates a regular file to zero length. Other file types are left
/// untouched.
pub(crate) fn truncate(fs: &Ext2Fs, inum: u32) {
    let mut ino = Inode::get(fs, inum);
    if !ino.is_regular() {
        return;
    }
    release_content(fs, &mut ino);
    Inode::set(fs, inum, &ino);
}
