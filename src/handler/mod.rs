//! # Page Handler Capability
//!
//! The allocator core treats records as opaque fixed-size byte runs. Whether
//! the key or value region embeds out-of-line objects, and how those objects
//! move between live handles and object-log bytes, is encapsulated behind
//! [`PageHandler`]. The flush and read engines drive the handler; the
//! handler never touches devices or watermarks.
//!
//! ## Walking protocol
//!
//! Records are laid out back to back at a fixed stride
//! ([`RecordLayout::record_size`]). An all-zero [`RecordInfo`] marks a slot
//! that was never written (trailing page waste, abandoned allocations);
//! walks skip such slots and keep going.
//!
//! The batch-oriented calls ([`PageHandler::serialize`],
//! [`PageHandler::object_info`]) take a cursor they advance, so the engines
//! can drive multi-batch flushes and multi-fragment reads without the
//! handler holding state between calls:
//!
//! ```text
//! flush:  serialize(scratch, &mut pos, stream, block, patches), repeated;
//!         the engine reserves object-log space, rebases every patched
//!         AddressInfo by the reservation, and writes the stream
//! read:   object_info(frame, &mut pos, block) -> ObjectRange, repeated;
//!         the engine reads the fragment, then deserialize() reinflates
//!         the covered records and installs live handles
//! ```
//!
//! ## Implementations
//!
//! - [`FixedHandler`]: purely blittable records, every object call inert.
//! - [`ByteObjectHandler`]: the value region holds one out-of-line byte
//!   string per record (see `handler/bytes.rs`).

mod bytes;

pub use bytes::ByteObjectHandler;

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::config::LogConfig;
use crate::record::RecordInfo;

/// Fixed per-record geometry, derived once from a validated [`LogConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RecordLayout {
    pub key_len: usize,
    pub value_len: usize,
    /// Full record stride, 8-byte aligned.
    pub record_size: usize,
}

impl RecordLayout {
    pub fn from_config(config: &LogConfig) -> Self {
        Self {
            key_len: config.key_len,
            value_len: config.value_len,
            record_size: config.record_size(),
        }
    }

    /// Byte offset of the key region within a record.
    #[inline(always)]
    pub fn key_offset(&self) -> usize {
        RecordInfo::SIZE
    }

    /// Byte offset of the value region within a record.
    #[inline(always)]
    pub fn value_offset(&self) -> usize {
        RecordInfo::SIZE + self.key_len
    }
}

/// A contiguous byte range in one object-log segment, produced by
/// [`PageHandler::object_info`] and consumed by the read engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRange {
    /// Segment-relative start offset.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
}

/// In-slice byte offsets of `AddressInfo` slots a flush batch must rebase.
pub type PatchList = SmallVec<[usize; 16]>;

/// Encapsulates object payload handling for one record format.
pub trait PageHandler: Send + Sync {
    fn key_has_objects(&self) -> bool {
        false
    }

    fn value_has_objects(&self) -> bool {
        false
    }

    fn has_objects(&self) -> bool {
        self.key_has_objects() || self.value_has_objects()
    }

    /// Releases live object handles held by the records in `records` (a
    /// whole-record slice). The caller zeroes the memory afterwards.
    fn clear_page(&self, records: &mut [u8]);

    /// Serializes object payloads for records from `*pos`, stopping at the
    /// end of the slice or before the batch would push `stream` past
    /// `block_size` (a lone oversized object still forms a batch of one).
    ///
    /// Consumed records have their object slots rewritten as
    /// stream-relative [`crate::record::AddressInfo`]s, with each slot's
    /// in-slice byte offset pushed to `patches`; `*pos` advances past them.
    fn serialize(
        &self,
        records: &mut [u8],
        pos: &mut usize,
        stream: &mut Vec<u8>,
        block_size: usize,
        patches: &mut PatchList,
    ) -> Result<()>;

    /// Reinflates objects for every record in `records` whose `AddressInfo`
    /// points into `stream` (which begins at segment-relative offset
    /// `stream_base`), replacing each slot with a live handle.
    fn deserialize(&self, records: &mut [u8], stream: &[u8], stream_base: u64) -> Result<()>;

    /// Returns the object-log range needed by records from `*pos`,
    /// accumulating until the range would exceed `block_size` or the slice
    /// ends, and advancing `*pos` past the records covered. `None` means no
    /// remaining record carries objects.
    fn object_info(
        &self,
        records: &[u8],
        pos: &mut usize,
        block_size: usize,
    ) -> Result<Option<ObjectRange>>;
}

/// Handler for purely blittable records: fixed key, fixed value, nothing
/// out of line. All object operations are inert.
#[derive(Debug, Clone, Copy)]
pub struct FixedHandler;

impl PageHandler for FixedHandler {
    fn clear_page(&self, _records: &mut [u8]) {}

    fn serialize(
        &self,
        _records: &mut [u8],
        _pos: &mut usize,
        _stream: &mut Vec<u8>,
        _block_size: usize,
        _patches: &mut PatchList,
    ) -> Result<()> {
        bail!("blittable records carry no object payloads");
    }

    fn deserialize(&self, _records: &mut [u8], _stream: &[u8], _stream_base: u64) -> Result<()> {
        bail!("blittable records carry no object payloads");
    }

    fn object_info(
        &self,
        records: &[u8],
        pos: &mut usize,
        _block_size: usize,
    ) -> Result<Option<ObjectRange>> {
        *pos = records.len();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_partition_the_record() {
        let cfg = LogConfig {
            key_len: 16,
            value_len: 8,
            ..LogConfig::default()
        };
        let layout = RecordLayout::from_config(&cfg);
        assert_eq!(layout.key_offset(), 8);
        assert_eq!(layout.value_offset(), 24);
        assert_eq!(layout.record_size, 32);
    }

    #[test]
    fn fixed_handler_reports_no_objects() {
        let handler = FixedHandler;
        assert!(!handler.has_objects());

        let records = [0u8; 64];
        let mut pos = 0;
        let range = handler.object_info(&records, &mut pos, 4096).unwrap();
        assert!(range.is_none());
        assert_eq!(pos, 64);
    }
}
