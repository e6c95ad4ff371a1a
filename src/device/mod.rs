//! # Storage Device Capability
//!
//! The allocator does not implement a block device; it consumes one through
//! the [`StorageDevice`] trait. Two instances are attached to a log: the
//! primary log device (dense pages at `page_size · page_number`) and,
//! when records carry out-of-line objects, an object-log device written
//! append-only per segment.
//!
//! ## Contract
//!
//! - Sources, destinations, offsets, and lengths are sector-aligned.
//! - Operations are asynchronous: they enqueue the transfer and return; the
//!   completion callback fires exactly once, on an arbitrary thread, with
//!   `(error_code, bytes_transferred)`. Error code 0 is success; non-zero
//!   codes are surfaced to user callbacks unchanged, never retried here.
//! - The flat offset space maps onto fixed-size segments internally; the
//!   segmented variants address a segment directly by id.
//! - `delete_segment_range` reclaims whole segments synchronously.
//!
//! ## Buffer handles
//!
//! Transfers reference memory the caller keeps alive until the completion
//! fires (page frames, pooled buffers). [`IoSource`] and [`IoTarget`] carry
//! the raw pointer and length across the thread boundary; constructing one
//! is the caller's promise that the region outlives the operation.
//!
//! ## Implementations
//!
//! - [`FileDevice`]: per-segment files and a worker-thread pool.
//! - [`MemDevice`]: in-memory segments with inline completions and fault
//!   injection, for tests.

mod file;
mod mem;

pub use file::{FileDevice, FileDeviceOptions};
pub use mem::{MemDevice, WriteRecord};

use eyre::Result;

/// Successful completion.
pub const ERR_OK: u32 = 0;
/// The device rejected or failed the transfer and reported no OS code.
pub const ERR_IO: u32 = 1;
/// An object-log fragment exceeded the 2 GiB single-read limit.
pub const ERR_OBJECT_TOO_LARGE: u32 = 2;

/// Completion callback: `(error_code, bytes_transferred)`.
pub type IoCompletion = Box<dyn FnOnce(u32, usize) + Send + 'static>;

/// Read-only view of a caller-owned region handed to a write.
#[derive(Debug, Clone, Copy)]
pub struct IoSource {
    ptr: *const u8,
    len: usize,
}

impl IoSource {
    /// # Safety
    ///
    /// `ptr` must be valid for `len` reads until the operation's completion
    /// callback has fired, and no thread may mutate the region meanwhile.
    pub unsafe fn from_raw(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// Only the device executing the operation may call this, under the
    /// validity promise made at construction.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// Writable view of a caller-owned region handed to a read.
#[derive(Debug, Clone, Copy)]
pub struct IoTarget {
    ptr: *mut u8,
    len: usize,
}

impl IoTarget {
    /// # Safety
    ///
    /// `ptr` must be valid for `len` writes until the operation's completion
    /// callback has fired, and no other thread may access the region
    /// meanwhile.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// Only the device executing the operation may call this, under the
    /// validity promise made at construction.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

// SAFETY: the handles are inert pointer/length pairs; the validity and
// exclusivity obligations are taken on at construction (see from_raw) and
// simply travel with the value to the I/O thread.
unsafe impl Send for IoSource {}
unsafe impl Sync for IoSource {}
unsafe impl Send for IoTarget {}
unsafe impl Sync for IoTarget {}

/// Sector-aligned asynchronous block storage over a segmented file space.
pub trait StorageDevice: Send + Sync {
    /// Sector size all offsets and lengths must be multiples of.
    fn sector_size(&self) -> usize;

    /// Size of one segment in the flat offset space.
    fn segment_size(&self) -> u64;

    /// Writes `source` at flat offset `offset`.
    fn write_async(&self, source: IoSource, offset: u64, completion: IoCompletion);

    /// Reads `target.len()` bytes from flat offset `offset`.
    fn read_async(&self, offset: u64, target: IoTarget, completion: IoCompletion);

    /// Writes `source` at `offset` within segment `segment`.
    fn write_segment_async(
        &self,
        segment: u64,
        offset: u64,
        source: IoSource,
        completion: IoCompletion,
    );

    /// Reads `target.len()` bytes from `offset` within segment `segment`.
    fn read_segment_async(
        &self,
        segment: u64,
        offset: u64,
        target: IoTarget,
        completion: IoCompletion,
    );

    /// Deletes segments `from..to`.
    fn delete_segment_range(&self, from: u64, to: u64) -> Result<()>;
}
