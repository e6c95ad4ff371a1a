//! # Configuration Module
//!
//! This module centralizes the crate's configuration surface. Constants that
//! depend on each other live together in [`constants`] where the relationships
//! are documented and enforced through compile-time assertions. Runtime
//! configuration goes through [`LogConfig`], which validates every knob once
//! at construction so the hot paths never re-check them.
//!
//! ## Module Organization
//!
//! - [`constants`]: fixed layout values (record alignment, the reserved
//!   null-address prefix, default object block size) with dependency notes

pub mod constants;
pub use constants::*;

use eyre::{ensure, Result};

/// Runtime configuration for a [`crate::log::LogAllocator`].
///
/// Every field is validated by [`LogConfig::validate`], called from the
/// allocator constructor. Invalid configurations fail synchronously; nothing
/// is re-validated on the allocation or translation paths.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Intra-page offset width in bits. Page size is `1 << page_size_bits`.
    pub page_size_bits: u32,
    /// Number of page frames in the circular buffer. Must be a power of two.
    pub buffer_size: usize,
    /// Device sector size in bytes. Must be a power of two.
    pub sector_size: usize,
    /// Fixed key length in bytes.
    pub key_len: usize,
    /// Fixed value length in bytes. Handlers with out-of-line objects store
    /// an 8-byte object reference in this region, so it must be at least
    /// [`crate::record::AddressInfo::SIZE`] for such handlers.
    pub value_len: usize,
    /// Number of pages behind the tail kept mutable before a read-only shift
    /// is requested. Defaults to `buffer_size`, meaning pages become
    /// read-only only when eviction needs them flushed.
    pub mutable_pages: usize,
    /// Number of slots in the object-log segment offset table.
    pub segment_buffer_size: usize,
    /// Maximum serialized object bytes per object-log write batch.
    pub object_block_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            page_size_bits: DEFAULT_PAGE_SIZE_BITS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sector_size: DEFAULT_SECTOR_SIZE,
            key_len: 16,
            value_len: 16,
            mutable_pages: DEFAULT_BUFFER_SIZE,
            segment_buffer_size: DEFAULT_SEGMENT_BUFFER_SIZE,
            object_block_size: DEFAULT_OBJECT_BLOCK_SIZE,
        }
    }
}

impl LogConfig {
    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        1usize << self.page_size_bits
    }

    /// `log2(buffer_size)`.
    pub fn buffer_bits(&self) -> u32 {
        self.buffer_size.trailing_zeros()
    }

    /// Fixed record footprint: header + key + value, rounded up to the
    /// record alignment.
    pub fn record_size(&self) -> usize {
        let raw = crate::record::RecordInfo::SIZE + self.key_len + self.value_len;
        (raw + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.buffer_size.is_power_of_two(),
            "buffer size {} must be a power of two",
            self.buffer_size
        );
        ensure!(
            self.sector_size.is_power_of_two(),
            "sector size {} must be a power of two",
            self.sector_size
        );
        ensure!(
            self.page_size_bits >= MIN_PAGE_SIZE_BITS && self.page_size_bits <= MAX_PAGE_SIZE_BITS,
            "page size bits {} outside supported range {}..={}",
            self.page_size_bits,
            MIN_PAGE_SIZE_BITS,
            MAX_PAGE_SIZE_BITS
        );
        ensure!(
            self.page_size() % self.sector_size == 0,
            "page size {} is not a multiple of sector size {}",
            self.page_size(),
            self.sector_size
        );
        ensure!(
            self.record_size() <= self.page_size() - FIRST_VALID_ADDRESS as usize,
            "record size {} does not fit in a page of {} bytes",
            self.record_size(),
            self.page_size()
        );
        ensure!(self.key_len > 0, "key length must be non-zero");
        ensure!(self.value_len > 0, "value length must be non-zero");
        ensure!(
            self.mutable_pages >= 1 && self.mutable_pages <= self.buffer_size,
            "mutable pages {} must be in 1..={}",
            self.mutable_pages,
            self.buffer_size
        );
        ensure!(
            self.segment_buffer_size >= 1,
            "segment buffer size must be non-zero"
        );
        ensure!(
            self.object_block_size >= self.sector_size,
            "object block size {} must be at least one sector ({})",
            self.object_block_size,
            self.sector_size
        );
        Ok(())
    }
}
