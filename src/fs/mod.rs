//! File subsystem surface.
//!
//! The types here are the contract between the kernel's syscall stubs and
//! the ext2 core: open flags, seek anchors, file types, the `stat` record,
//! and the POSIX-shaped operations themselves, implemented as methods on
//! [`ext2::Ext2Fs`]. Each operation takes the calling thread's
//! [`fd::ProcCtx`] explicitly and returns `Result`; stubs encode errors as
//! negative integers via [`Errno::to_neg`](crate::err::Errno::to_neg).

pub mod device;
pub mod ext2;
pub mod fd;

use crate::err::Errno;
use alloc::vec::Vec;
use ext2::dir::{self, DirEntry};
use ext2::file;
use ext2::inode::Inode;
use ext2::Ext2Fs;
use fd::{OpenFile, ProcCtx};

/// Open flags. Access modes are a two-bit mask (`RDONLY`, `WRONLY`,
/// `RDWR = RDONLY | WRONLY`), the remaining flags are independent bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open for reading.
    pub const RDONLY: Self = Self(0x01);
    /// Open for writing.
    pub const WRONLY: Self = Self(0x02);
    /// Open for reading and writing.
    pub const RDWR: Self = Self(0x03);
    /// Create the file if it does not exist.
    pub const CREAT: Self = Self(0x04);
    /// With `CREAT`: fail if the file already exists.
    pub const EXCL: Self = Self(0x08);
    /// Truncate a writable regular file on open.
    pub const TRUNC: Self = Self(0x10);
    /// Start with the offset at end of file.
    pub const APPEND: Self = Self(0x20);

    /// Builds flags from their raw bit representation.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag of `other` is set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(Self::RDONLY)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRONLY)
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for OpenFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Anchor of an `lseek` displacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum SeekWhence {
    /// From the beginning of the file.
    Set = 0,
    /// From the current offset.
    Cur = 1,
    /// From the end of the file.
    End = 2,
}

impl TryFrom<i32> for SeekWhence {
    type Error = Errno;

    fn try_from(value: i32) -> Result<Self, Errno> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// File types, as stored in the top nibble of an inode's mode and in the
/// type indicator byte of directory records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
}

impl FileType {
    /// Decodes the type nibble of a mode word.
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & 0xf000 {
            0x1000 => Some(Self::Fifo),
            0x2000 => Some(Self::CharDevice),
            0x4000 => Some(Self::Directory),
            0x6000 => Some(Self::BlockDevice),
            0x8000 => Some(Self::Regular),
            0xa000 => Some(Self::Symlink),
            0xc000 => Some(Self::Socket),
            _ => None,
        }
    }

    /// The type nibble for a mode word.
    pub fn to_mode(self) -> u16 {
        match self {
            Self::Fifo => 0x1000,
            Self::CharDevice => 0x2000,
            Self::Directory => 0x4000,
            Self::BlockDevice => 0x6000,
            Self::Regular => 0x8000,
            Self::Symlink => 0xa000,
            Self::Socket => 0xc000,
        }
    }

    /// The directory-record type indicator.
    pub(crate) fn indicator(self) -> u8 {
        match self {
            Self::Regular => 1,
            Self::Directory => 2,
            Self::CharDevice => 3,
            Self::BlockDevice => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
        }
    }
}

/// File status, as reported by `stat` and `fstat`. Fields the filesystem
/// does not track are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub st_ino: u32,
    pub st_mode: u16,
    pub st_nlink: u16,
    pub st_uid: u16,
    pub st_gid: u16,
    pub st_size: u64,
    pub st_atime: u32,
    pub st_mtime: u32,
    pub st_ctime: u32,
}

impl Stat {
    fn from_inode(inum: u32, ino: &Inode) -> Self {
        Self {
            st_ino: inum,
            st_mode: ino.i_mode,
            st_nlink: ino.i_links_count,
            st_uid: ino.i_uid,
            st_gid: ino.i_gid,
            st_size: ino.size(),
            st_atime: ino.i_atime,
            st_mtime: ino.i_mtime,
            st_ctime: ino.i_ctime,
        }
    }
}

impl Ext2Fs {
    /// Opens `path`, returning the new descriptor index.
    ///
    /// At least one of the access-mode bits must be set. With
    /// [`OpenFlags::CREAT`] a missing regular file is created in the
    /// resolved parent directory; adding [`OpenFlags::EXCL`] makes an
    /// existing file an error. Opening a directory for writing is
    /// [`Errno::EISDIR`].
    pub fn open(&self, ctx: &mut ProcCtx, path: &[u8], flags: OpenFlags) -> Result<usize, Errno> {
        if !flags.readable() && !flags.writable() {
            return Err(Errno::EINVAL);
        }
        let inum = match dir::resolve(self, path, ctx.cwd) {
            Ok(inum) => {
                if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                    return Err(Errno::EEXIST);
                }
                inum
            }
            Err(Errno::ENOENT) if flags.contains(OpenFlags::CREAT) => {
                let (parent, leaf) = dir::split(path)?;
                let pnum = dir::resolve_parent(self, parent, ctx.cwd)?;
                dir::create(self, pnum, leaf, FileType::Regular)?
            }
            Err(e) => return Err(e),
        };
        let ino = Inode::get(self, inum);
        if flags.writable() && ino.is_directory() {
            return Err(Errno::EISDIR);
        }
        if flags.contains(OpenFlags::TRUNC) && flags.writable() && ino.is_regular() {
            file::truncate(self, inum);
        }
        let pos = if flags.contains(OpenFlags::APPEND) {
            Inode::get(self, inum).size()
        } else {
            0
        };
        Ok(ctx.fds.install(OpenFile::new(inum, flags, pos)))
    }

    /// Closes descriptor `fd`. The open-file entry is freed when its last
    /// descriptor goes away.
    pub fn close(&self, ctx: &mut ProcCtx, fd: usize) -> Result<(), Errno> {
        ctx.fds.remove(fd).map(drop)
    }

    /// Reads from `fd` at its current offset, advancing it by the number of
    /// bytes read.
    pub fn read(&self, ctx: &ProcCtx, fd: usize, buf: &mut [u8]) -> Result<usize, Errno> {
        let f = ctx.fds.get(fd)?;
        if !f.flags.readable() {
            return Err(Errno::EBADF);
        }
        match Inode::get(self, f.inum).file_type() {
            Some(FileType::Regular) => (),
            Some(FileType::Directory) => return Err(Errno::EISDIR),
            _ => return Err(Errno::EBADF),
        }
        let mut pos = f.pos.lock();
        let n = file::read(self, f.inum, buf, *pos);
        *pos += n as u64;
        Ok(n)
    }

    /// Writes to `fd` at its current offset, advancing it by the number of
    /// bytes written.
    pub fn write(&self, ctx: &ProcCtx, fd: usize, buf: &[u8]) -> Result<usize, Errno> {
        let f = ctx.fds.get(fd)?;
        if !f.flags.writable() {
            return Err(Errno::EBADF);
        }
        match Inode::get(self, f.inum).file_type() {
            Some(FileType::Regular) => (),
            Some(FileType::Directory) => return Err(Errno::EISDIR),
            _ => return Err(Errno::EBADF),
        }
        let mut pos = f.pos.lock();
        let n = file::write(self, f.inum, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Moves the offset of `fd` and returns the new offset. The
    /// displacement is unsigned; positions past the end of file are legal.
    pub fn lseek(
        &self,
        ctx: &ProcCtx,
        fd: usize,
        offset: u64,
        whence: SeekWhence,
    ) -> Result<u64, Errno> {
        let f = ctx.fds.get(fd)?;
        let ino = Inode::get(self, f.inum);
        if matches!(ino.file_type(), Some(FileType::Fifo | FileType::Socket)) {
            return Err(Errno::ESPIPE);
        }
        let mut pos = f.pos.lock();
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => *pos,
            SeekWhence::End => ino.size(),
        };
        let new = base.checked_add(offset).ok_or(Errno::EOVERFLOW)?;
        *pos = new;
        Ok(new)
    }

    /// Returns the status of the file at `path`.
    pub fn stat(&self, ctx: &ProcCtx, path: &[u8]) -> Result<Stat, Errno> {
        let inum = dir::resolve(self, path, ctx.cwd)?;
        Ok(Stat::from_inode(inum, &Inode::get(self, inum)))
    }

    /// Returns the status of the file open on `fd`.
    pub fn fstat(&self, ctx: &ProcCtx, fd: usize) -> Result<Stat, Errno> {
        let f = ctx.fds.get(fd)?;
        Ok(Stat::from_inode(f.inum, &Inode::get(self, f.inum)))
    }

    /// Changes the calling thread's working directory.
    pub fn chdir(&self, ctx: &mut ProcCtx, path: &[u8]) -> Result<(), Errno> {
        let inum = dir::resolve(self, path, ctx.cwd)?;
        if !Inode::get(self, inum).is_directory() {
            return Err(Errno::ENOTDIR);
        }
        ctx.cwd = inum;
        Ok(())
    }

    /// Removes the directory entry at `path`. The inode is released once
    /// its links count drops to zero. Directories cannot be unlinked.
    pub fn unlink(&self, ctx: &ProcCtx, path: &[u8]) -> Result<(), Errno> {
        let (parent, leaf) = dir::split(path)?;
        let pnum = dir::resolve_parent(self, parent, ctx.cwd)?;
        if !Inode::get(self, pnum).is_directory() {
            return Err(Errno::ENOTDIR);
        }
        let (_, entry) = dir::lookup(self, pnum, leaf).ok_or(Errno::ENOENT)?;
        if Inode::get(self, entry.inode).is_directory() {
            return Err(Errno::EISDIR);
        }
        dir::remove_entry(self, pnum, leaf)
    }

    /// Creates a second directory entry for the inode at `oldpath`.
    pub fn link(&self, ctx: &ProcCtx, oldpath: &[u8], newpath: &[u8]) -> Result<(), Errno> {
        let target = dir::resolve(self, oldpath, ctx.cwd)?;
        let (parent, leaf) = dir::split(newpath)?;
        let pnum = dir::resolve_parent(self, parent, ctx.cwd)?;
        let ftype = Inode::get(self, target).file_type();
        dir::add_entry(self, pnum, target, leaf, ftype)
    }

    /// Creates a directory at `path`, populated with `.` and `..`.
    pub fn mkdir(&self, ctx: &ProcCtx, path: &[u8]) -> Result<(), Errno> {
        let (parent, leaf) = dir::split(path)?;
        let pnum = dir::resolve_parent(self, parent, ctx.cwd)?;
        dir::create(self, pnum, leaf, FileType::Directory).map(drop)
    }

    /// Duplicates descriptor `fd` onto the lowest free slot; both
    /// descriptors share one open-file entry and offset.
    pub fn dup(&self, ctx: &mut ProcCtx, fd: usize) -> Result<usize, Errno> {
        ctx.fds.dup(fd)
    }

    /// Lists the live entries of the directory at `path`.
    pub fn read_dir(&self, ctx: &ProcCtx, path: &[u8]) -> Result<Vec<DirEntry>, Errno> {
        let inum = dir::resolve(self, path, ctx.cwd)?;
        if !Inode::get(self, inum).is_directory() {
            return Err(Errno::ENOTDIR);
        }
        Ok(dir::DirWalker::new(self, inum)
            .map(|(_, entry)| entry)
            .filter(|entry| entry.inode != 0)
            .collect())
    }
}
