//! # Memory Module
//!
//! Sector-aligned buffer management for the allocator and its I/O engines.
//!
//! Device transfers must be sector-aligned at both ends, so page frames,
//! flush scratch buffers, and record-read windows all come from aligned
//! heap allocations rather than plain `Vec<u8>`:
//!
//! - [`AlignedBuf`]: an owned, zero-initialized, sector-aligned byte region
//!   with a stable address for the buffer's whole lifetime. Page frames are
//!   exactly this; the ring publishes the raw pointer and translation reads
//!   it wait-free.
//! - [`SectorBufferPool`] / [`PooledBuf`]: a size-classed pool of reusable
//!   `AlignedBuf`s for transient I/O (flush scratch copies, object-log
//!   streams, record-read windows). Buffers return to their size class when
//!   dropped, so steady-state flushing and reading allocate nothing.
//!
//! ## Thread Safety
//!
//! `AlignedBuf` is `Send + Sync`; the bytes it owns are plain data and the
//! allocation never moves. The pool shards its free lists behind
//! `parking_lot::Mutex` and is shared by `Arc`.

mod aligned;
mod pool;

pub use aligned::AlignedBuf;
pub use pool::{PooledBuf, SectorBufferPool};
