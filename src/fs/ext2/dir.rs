//! Directory records and path resolution.
//!
//! A directory's content is a sequence of variable-length records:
//!
//! ```text
//! | inode: u32 | rec_len: u16 | name_len: u8 | file_type: u8 | name ... |
//! ```
//!
//! `rec_len` is the displacement to the next record. Records and record
//! lengths are 4-byte aligned, no record crosses a block boundary, and the
//! last record of a directory is stretched so it ends exactly at a block
//! end. A record with `inode == 0` is a hole left by a deletion and is
//! skipped by scans.
//!
//! Scans treat a malformed record as the end of the directory rather than
//! corruption: a damaged directory degrades to "not found" instead of
//! taking the volume down.

use super::file;
use super::inode::{Inode, ROOT_INODE};
use super::Ext2Fs;
use crate::err::Errno;
use crate::fs::FileType;
use alloc::vec;
use alloc::vec::Vec;
use bytemuck::{Pod, Zeroable};

/// Size of the fixed part of a record.
pub(crate) const HEADER_SIZE: usize = 8;
/// Alignment of records and record lengths.
pub(crate) const ALIGN: usize = 4;
/// Width of the on-disk `name_len` field; creation rejects names that would
/// not fit below it.
pub const NAME_MAX: usize = 255;
/// Longest path component the resolver accumulates.
pub const COMPONENT_MAX: usize = 254;

/// The fixed header of a directory record.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
struct DirentHeader {
    inode: u32,
    rec_len: u16,
    name_len: u8,
    file_type: u8,
}

/// A parsed directory record with its name copied out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Referenced inode; `0` marks a hole.
    pub inode: u32,
    /// Displacement to the next record.
    pub rec_len: u16,
    /// File-type indicator byte.
    pub file_type: u8,
    /// Name bytes, no terminator.
    pub name: Vec<u8>,
}

/// Smallest legal record length for a name of `name_len` bytes.
pub(crate) fn min_rec_len(name_len: usize) -> usize {
    (HEADER_SIZE + name_len.max(1)).next_multiple_of(ALIGN)
}

/// Checks a record header against the framing rules. `file_off` is the
/// record's offset within the directory, `avail` the number of header bytes
/// actually read, `dir_size` the directory file size.
fn entry_valid(
    fs: &Ext2Fs,
    hdr: &DirentHeader,
    file_off: u64,
    avail: usize,
    dir_size: u64,
) -> bool {
    let bs = u64::from(fs.block_size());
    let rec_len = u64::from(hdr.rec_len);
    let ok = avail >= HEADER_SIZE
        && file_off % ALIGN as u64 == 0
        && rec_len % ALIGN as u64 == 0
        && rec_len >= min_rec_len(usize::from(hdr.name_len)) as u64
        && rec_len + file_off % bs <= bs
        && file_off + rec_len <= dir_size
        && hdr.inode <= fs.geometry().inodes_count;
    if !ok {
        log::warn!(
            target: "ext2",
            "malformed directory record at offset {file_off}: inode={} rec_len={} name_len={}",
            hdr.inode,
            hdr.rec_len,
            hdr.name_len
        );
    }
    ok
}

/// Iterator over a directory's records, holes included, yielding each
/// record together with its byte offset. Stops at the first malformed
/// record.
pub(crate) struct DirWalker<'f> {
    fs: &'f Ext2Fs,
    dinum: u32,
    size: u64,
    off: u64,
}

impl<'f> DirWalker<'f> {
    pub(crate) fn new(fs: &'f Ext2Fs, dinum: u32) -> Self {
        Self::from_offset(fs, dinum, 0)
    }

    /// Starts the walk at byte `off`, which must be a record boundary.
    fn from_offset(fs: &'f Ext2Fs, dinum: u32, off: u64) -> Self {
        let ino = Inode::get(fs, dinum);
        let size = if ino.is_directory() { ino.size() } else { 0 };
        Self {
            fs,
            dinum,
            size,
            off,
        }
    }
}

impl Iterator for DirWalker<'_> {
    type Item = (u64, DirEntry);

    fn next(&mut self) -> Option<Self::Item> {
        if self.off >= self.size {
            return None;
        }
        let mut raw = [0u8; HEADER_SIZE];
        let avail = file::read(self.fs, self.dinum, &mut raw, self.off);
        let hdr: DirentHeader = bytemuck::pod_read_unaligned(&raw);
        if !entry_valid(self.fs, &hdr, self.off, avail, self.size) {
            self.off = self.size;
            return None;
        }
        let mut name = vec![0u8; usize::from(hdr.name_len)];
        file::read(self.fs, self.dinum, &mut name, self.off + HEADER_SIZE as u64);
        let entry = DirEntry {
            inode: hdr.inode,
            rec_len: hdr.rec_len,
            file_type: hdr.file_type,
            name,
        };
        let off = self.off;
        self.off += u64::from(hdr.rec_len);
        Some((off, entry))
    }
}

/// Finds the live record named `name` in directory `dinum`.
pub(crate) fn lookup(fs: &Ext2Fs, dinum: u32, name: &[u8]) -> Option<(u64, DirEntry)> {
    DirWalker::new(fs, dinum).find(|(_, e)| e.inode != 0 && e.name == name)
}

/// Serializes a record (header, name, zeroed tail up to `rec_len`) at byte
/// `off` of directory `dinum`.
fn write_record(
    fs: &Ext2Fs,
    dinum: u32,
    off: u64,
    inode: u32,
    rec_len: usize,
    name: &[u8],
    file_type: u8,
) -> Result<(), Errno> {
    let hdr = DirentHeader {
        inode,
        rec_len: rec_len as u16,
        name_len: name.len() as u8,
        file_type,
    };
    let mut rec = vec![0u8; rec_len];
    rec[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&hdr));
    rec[HEADER_SIZE..HEADER_SIZE + name.len()].copy_from_slice(name);
    match file::write(fs, dinum, &rec, off) {
        Ok(n) if n == rec_len => Ok(()),
        // A directory that has outgrown its direct blocks cannot take more
        // entries.
        Ok(_) | Err(Errno::EFBIG) | Err(Errno::ENOSPC) => Err(Errno::ENOSPC),
        Err(e) => Err(e),
    }
}

/// Rewrites only the `rec_len` field of the record at `off`.
fn write_rec_len(fs: &Ext2Fs, dinum: u32, off: u64, inode: u32, rec_len: usize, rest: (u8, u8)) {
    let hdr = DirentHeader {
        inode,
        rec_len: rec_len as u16,
        name_len: rest.0,
        file_type: rest.1,
    };
    // The header is already in place, so this cannot allocate and cannot
    // fail.
    let _ = file::write(fs, dinum, bytemuck::bytes_of(&hdr), off);
}

/// Raises the links count of `inum`. Links transitions happen under the
/// inode-allocation lock.
fn link_inc(fs: &Ext2Fs, inum: u32) {
    let _guard = fs.inode_alloc_lock.lock();
    let mut ino = Inode::get(fs, inum);
    ino.i_links_count += 1;
    Inode::set(fs, inum, &ino);
}

/// Lowers the links count of `inum`, returning the new count.
fn link_dec(fs: &Ext2Fs, inum: u32) -> u16 {
    let _guard = fs.inode_alloc_lock.lock();
    let mut ino = Inode::get(fs, inum);
    ino.i_links_count = ino.i_links_count.saturating_sub(1);
    Inode::set(fs, inum, &ino);
    ino.i_links_count
}

/// Inserts a record mapping `name` to `target` into directory `parent`, and
/// raises `target`'s links count.
///
/// The insertion policy keeps the framing invariants: the last record of
/// the directory always stretches to its block end, so an insert either
/// reuses that tail hole, carves the slack off the last record, or opens a
/// fresh block.
pub(crate) fn add_entry(
    fs: &Ext2Fs,
    parent: u32,
    target: u32,
    name: &[u8],
    file_type: Option<FileType>,
) -> Result<(), Errno> {
    if name.is_empty() {
        return Err(Errno::ENOENT);
    }
    if name.len() >= NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    if !Inode::get(fs, parent).is_directory() {
        return Err(Errno::ENOTDIR);
    }
    let indicator = file_type.map(FileType::indicator).unwrap_or(0);
    let needed = min_rec_len(name.len());
    let bs = fs.block_size() as usize;

    // One pass: refuse duplicates and remember the last record.
    let mut last: Option<(u64, DirEntry)> = None;
    for (off, entry) in DirWalker::new(fs, parent) {
        if entry.inode != 0 && entry.name == name {
            return Err(Errno::EEXIST);
        }
        last = Some((off, entry));
    }

    match last {
        // The tail record is a hole large enough: take it over, keeping its
        // span so the new record still reaches the block end.
        Some((off, ref hole)) if hole.inode == 0 && usize::from(hole.rec_len) >= needed => {
            write_record(fs, parent, off, target, usize::from(hole.rec_len), name, indicator)?;
        }
        // Carve the slack off the last record if the new one fits behind it
        // in the same block.
        Some((off, ref tail)) => {
            let min_tail = min_rec_len(tail.name.len());
            let slack = usize::from(tail.rec_len) - min_tail;
            if slack >= needed {
                write_rec_len(
                    fs,
                    parent,
                    off,
                    tail.inode,
                    min_tail,
                    (tail.name.len() as u8, tail.file_type),
                );
                write_record(
                    fs,
                    parent,
                    off + min_tail as u64,
                    target,
                    slack,
                    name,
                    indicator,
                )?;
            } else {
                // The tail keeps its stretched span; the new record opens a
                // fresh block and stretches over all of it.
                let dir_size = Inode::get(fs, parent).size();
                write_record(fs, parent, dir_size, target, bs, name, indicator)?;
            }
        }
        // Empty directory file: start the first block.
        None => {
            write_record(fs, parent, 0, target, bs, name, indicator)?;
        }
    }

    link_inc(fs, target);
    Ok(())
}

/// Removes the record named `name` from directory `parent` and drops the
/// target's links count, releasing the inode when it reaches zero.
pub(crate) fn remove_entry(fs: &Ext2Fs, parent: u32, name: &[u8]) -> Result<(), Errno> {
    if name.is_empty() {
        return Err(Errno::ENOENT);
    }
    let bs = u64::from(fs.block_size());

    // Find the victim and its in-block predecessor.
    let mut prev: Option<(u64, DirEntry)> = None;
    let mut victim: Option<(u64, DirEntry)> = None;
    for (off, entry) in DirWalker::new(fs, parent) {
        if entry.inode != 0 && entry.name == name {
            victim = Some((off, entry));
            break;
        }
        prev = Some((off, entry));
    }
    let Some((victim_off, victim)) = victim else {
        return Err(Errno::ENOENT);
    };

    if victim_off % bs == 0 {
        // First record of its block: punch a hole, keep the span.
        write_rec_len(
            fs,
            parent,
            victim_off,
            0,
            usize::from(victim.rec_len),
            (victim.name.len() as u8, victim.file_type),
        );
    } else {
        // Fold the victim's span into its predecessor.
        let (prev_off, prev) = prev.expect("record not at block start has a predecessor");
        write_rec_len(
            fs,
            parent,
            prev_off,
            prev.inode,
            usize::from(prev.rec_len) + usize::from(victim.rec_len),
            (prev.name.len() as u8, prev.file_type),
        );
    }

    shrink_tail(fs, parent);

    if link_dec(fs, victim.inode) == 0 {
        let mut ino = Inode::get(fs, victim.inode);
        let was_dir = ino.is_directory();
        file::release_content(fs, &mut ino);
        ino.i_dtime = 1;
        Inode::set(fs, victim.inode, &ino);
        fs.free_inode(victim.inode, was_dir);
    }
    Ok(())
}

/// Releases trailing directory blocks that contain nothing but holes. The
/// first block always stays: a directory keeps at least `.` and `..`.
fn shrink_tail(fs: &Ext2Fs, dinum: u32) {
    let bs = u64::from(fs.block_size());
    loop {
        let mut ino = Inode::get(fs, dinum);
        let size = ino.size();
        if size <= bs {
            return;
        }
        let tail_start = size - bs;
        // The whole tail block must parse as holes; a live or malformed
        // record keeps it.
        let mut walked = tail_start;
        let mut live = false;
        for (off, entry) in DirWalker::from_offset(fs, dinum, tail_start) {
            live |= entry.inode != 0;
            walked = off + u64::from(entry.rec_len);
        }
        if live || walked != size {
            return;
        }
        let slot = (tail_start / bs) as usize;
        let blk = ino.i_block[slot];
        ino.i_block[slot] = 0;
        ino.set_size(tail_start);
        Inode::set(fs, dinum, &ino);
        if blk != 0 {
            fs.free_block(blk);
        }
    }
}

/// Writes the initial content of a fresh directory: `.` referring to the
/// directory itself and `..` referring to its parent, together spanning one
/// block.
pub(crate) fn init_directory(fs: &Ext2Fs, dinum: u32, parent: u32) -> Result<(), Errno> {
    let bs = fs.block_size() as usize;
    let dot_len = min_rec_len(1);
    write_record(fs, dinum, 0, dinum, dot_len, b".", FileType::Directory.indicator())?;
    write_record(
        fs,
        dinum,
        dot_len as u64,
        parent,
        bs - dot_len,
        b"..",
        FileType::Directory.indicator(),
    )?;
    link_inc(fs, dinum);
    link_inc(fs, parent);
    Ok(())
}

/// Creates `name` in directory `parent` as a fresh inode of type `ftype`,
/// returning the new inode number.
pub(crate) fn create(
    fs: &Ext2Fs,
    parent: u32,
    name: &[u8],
    ftype: FileType,
) -> Result<u32, Errno> {
    if !Inode::get(fs, parent).is_directory() {
        return Err(Errno::ENOTDIR);
    }
    if name.is_empty() {
        return Err(Errno::ENOENT);
    }
    if name.len() >= NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    if lookup(fs, parent, name).is_some() {
        return Err(Errno::EEXIST);
    }
    let inum = fs.alloc_inode(ftype).ok_or(Errno::ENOSPC)?;
    if ftype == FileType::Directory {
        if let Err(e) = init_directory(fs, inum, parent) {
            fs.free_inode(inum, true);
            return Err(e);
        }
    }
    if let Err(e) = add_entry(fs, parent, inum, name, Some(ftype)) {
        let mut ino = Inode::get(fs, inum);
        file::release_content(fs, &mut ino);
        Inode::set(fs, inum, &ino);
        if ftype == FileType::Directory {
            // Undo the `..` reference taken on the parent.
            link_dec(fs, parent);
        }
        fs.free_inode(inum, ftype == FileType::Directory);
        return Err(e);
    }
    Ok(inum)
}

/// Resolves a path to an inode number.
///
/// An absolute path starts at the root directory, anything else at `cwd`.
/// Consecutive slashes collapse; trailing slashes are accepted as long as
/// the path resolves to a directory.
pub(crate) fn resolve(fs: &Ext2Fs, path: &[u8], cwd: u32) -> Result<u32, Errno> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    let mut cur = if path[0] == b'/' { ROOT_INODE } else { cwd };
    let mut i = 0;
    while i < path.len() {
        while i < path.len() && path[i] == b'/' {
            i += 1;
        }
        let start = i;
        while i < path.len() && path[i] != b'/' {
            i += 1;
        }
        let component = &path[start..i];
        if component.is_empty() {
            break;
        }
        if component.len() > COMPONENT_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        if !Inode::get(fs, cur).is_directory() {
            return Err(Errno::ENOTDIR);
        }
        let (_, entry) = lookup(fs, cur, component).ok_or(Errno::ENOENT)?;
        cur = entry.inode;
    }
    if path.ends_with(b"/") && !Inode::get(fs, cur).is_directory() {
        return Err(Errno::ENOTDIR);
    }
    Ok(cur)
}

/// Splits a path into its parent directory part and final component. The
/// leaf has trailing slashes stripped; a path with no leaf (empty, `/`) is
/// `ENOENT`.
pub(crate) fn split(path: &[u8]) -> Result<(&[u8], &[u8]), Errno> {
    let mut end = path.len();
    while end > 0 && path[end - 1] == b'/' {
        end -= 1;
    }
    if end == 0 {
        return Err(Errno::ENOENT);
    }
    let trimmed = &path[..end];
    match trimmed.iter().rposition(|&b| b == b'/') {
        Some(0) => Ok((b"/", &trimmed[1..])),
        Some(idx) => Ok((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Ok((b"", trimmed)),
    }
}

/// Resolves the parent part returned by [`split`]: an empty parent is the
/// working directory.
pub(crate) fn resolve_parent(fs: &Ext2Fs, parent: &[u8], cwd: u32) -> Result<u32, Errno> {
    if parent.is_empty() {
        Ok(cwd)
    } else {
        resolve(fs, parent, cwd)
    }
}
