//! RAM-backed block image.
//!
//! The whole volume lives in one contiguous, byte-addressable allocation.
//! Keeping this surface minimal (bounded byte-range reads and writes) means
//! swapping the backing store for a file or a real device later is a boundary
//! change only.

use crate::fatal;
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

/// A contiguous in-memory volume image.
///
/// All threads share the image read/write; consistency of the on-disk
/// structures is the business of the filesystem locks above this layer, the
/// `RwLock` only keeps individual range copies racefree.
pub struct RamImage {
    bytes: RwLock<Vec<u8>>,
    len: usize,
}

impl RamImage {
    /// Wraps an existing image.
    pub fn new(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            bytes: RwLock::new(bytes),
            len,
        }
    }

    /// Allocates a zero-filled image of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `buf.len()` bytes starting at byte offset `off` into `buf`.
    ///
    /// Reading outside the image is a contract violation and aborts.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) {
        let Some(end) = off.checked_add(buf.len() as u64) else {
            fatal!(target: "ext2", "image read overflows: off={off} len={}", buf.len());
        };
        if end > self.len as u64 {
            fatal!(target: "ext2", "image read out of range: [{off}, {end}) > {}", self.len);
        }
        let bytes = self.bytes.read();
        buf.copy_from_slice(&bytes[off as usize..end as usize]);
    }

    /// Copies `src` into the image starting at byte offset `off`.
    ///
    /// Writing outside the image is a contract violation and aborts.
    pub fn write_at(&self, off: u64, src: &[u8]) {
        let Some(end) = off.checked_add(src.len() as u64) else {
            fatal!(target: "ext2", "image write overflows: off={off} len={}", src.len());
        };
        if end > self.len as u64 {
            fatal!(target: "ext2", "image write out of range: [{off}, {end}) > {}", self.len);
        }
        let mut bytes = self.bytes.write();
        bytes[off as usize..end as usize].copy_from_slice(src);
    }

    /// Consumes the image, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into_inner()
    }
}
