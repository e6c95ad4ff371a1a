//! # Layout Constants
//!
//! Fixed values the address scheme and the on-disk format depend on. Runtime
//! knobs (page size, ring capacity, sector size) live in
//! [`super::LogConfig`]; everything here is baked into the format itself.
//!
//! ## Dependency Graph
//!
//! ```text
//! RECORD_ALIGNMENT (8 bytes)
//!       │
//!       ├─> FIRST_VALID_ADDRESS (must be a multiple)
//!       │     Logical address 0 is the null sentinel; the first record of
//!       │     the log starts at this offset into page zero, so the reserved
//!       │     prefix must leave the record stream aligned.
//!       │
//!       └─> RecordInfo::SIZE / AddressInfo::SIZE (both exactly 8)
//!
//! DEFAULT_SECTOR_SIZE (512)
//!       │
//!       └─> DEFAULT_OBJECT_BLOCK_SIZE (must be a multiple)
//!             Object-log reservations are rounded up to whole sectors, so a
//!             block boundary that is not sector-aligned would leak padding
//!             into the next batch's reservation.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced below with compile-time assertions:
//!
//! 1. `FIRST_VALID_ADDRESS % RECORD_ALIGNMENT == 0`
//! 2. `DEFAULT_OBJECT_BLOCK_SIZE % DEFAULT_SECTOR_SIZE == 0`
//! 3. `DEFAULT_BUFFER_SIZE` is a power of two (ring slot math uses masks)

/// Records are laid out on 8-byte boundaries; allocation sizes are rounded
/// up to this before bumping the tail.
pub const RECORD_ALIGNMENT: usize = 8;

/// Lowest logical address ever handed out. Address 0 is reserved as the null
/// sentinel, and the first `FIRST_VALID_ADDRESS` bytes of page zero stay
/// zeroed for the log's lifetime.
pub const FIRST_VALID_ADDRESS: u64 = 64;

const _: () = assert!(
    FIRST_VALID_ADDRESS % RECORD_ALIGNMENT as u64 == 0,
    "reserved page-zero prefix must leave the record stream aligned"
);

/// Default intra-page offset width: 4 MiB pages.
pub const DEFAULT_PAGE_SIZE_BITS: u32 = 22;

/// Smallest supported page: 512 bytes (one sector).
pub const MIN_PAGE_SIZE_BITS: u32 = 9;

/// Largest supported page: 1 GiB. Offsets must also leave room for the
/// packed tail word, which keeps page offsets in 32 bits.
pub const MAX_PAGE_SIZE_BITS: u32 = 30;

/// Default number of page frames in the circular buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16;

const _: () = assert!(
    DEFAULT_BUFFER_SIZE.is_power_of_two(),
    "ring slot selection masks the page number with buffer_size - 1"
);

/// Default device sector size.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// Default number of slots in the object-log segment offset table.
pub const DEFAULT_SEGMENT_BUFFER_SIZE: usize = 16;

/// Default cap on serialized object bytes per object-log write batch
/// (100 MiB). Tests shrink this through [`super::LogConfig`] to exercise
/// multi-batch flushes cheaply.
pub const DEFAULT_OBJECT_BLOCK_SIZE: usize = 100 * 1024 * 1024;

const _: () = assert!(
    DEFAULT_OBJECT_BLOCK_SIZE % DEFAULT_SECTOR_SIZE == 0,
    "object block boundaries must be sector-aligned"
);

/// Largest object-log fragment a single read will attempt: 2 GiB. Reads
/// needing more fail with [`crate::device::ERR_OBJECT_TOO_LARGE`].
pub const MAX_OBJECT_FRAGMENT: u64 = 2 * 1024 * 1024 * 1024;

/// Number of worker threads a [`crate::device::FileDevice`] spawns by
/// default.
pub const DEFAULT_IO_WORKERS: usize = 2;
