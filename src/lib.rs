//! Ext2 read/write core of the Cute kernel.
//!
//! The filesystem operates over a contiguous RAM-backed image laid out in the
//! ext2 revision-1 on-disk format. The crate carries the whole data path of
//! the kernel's file subsystem: superblock and block-group parsing, block and
//! inode allocation over the on-disk bitmaps, byte-level file I/O through the
//! direct block map, directory-record packing, path resolution, and the
//! per-thread file-descriptor layer.
//!
//! Kernel collaborators are consumed through narrow seams so the core also
//! builds hosted:
//!
//! - the block device is [`fs::device::RamImage`];
//! - mutual exclusion is [`sync::IrqSpinlock`], whose interrupt masking is
//!   installed by the embedder (a no-op when hosted);
//! - the per-thread state (working directory, descriptor table) is
//!   [`fs::fd::ProcCtx`], passed explicitly to every operation;
//! - logging goes through the `log` facade, target `"ext2"`.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod err;
pub mod fs;
pub mod sync;

pub use err::Errno;
pub use fs::{
    device::RamImage,
    ext2::{mkfs, Ext2Fs},
    fd::ProcCtx,
    FileType, OpenFlags, SeekWhence, Stat,
};
