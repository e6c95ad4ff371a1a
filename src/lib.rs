//! # pagelog: Page-Resident Log Allocator
//!
//! `pagelog` is the log allocator at the core of a hybrid log-structured
//! key/value store: an append-only logical address space backed
//! simultaneously by a bounded circular buffer of fixed-size pages in main
//! memory and by one or two block devices behind it (the main log, plus an
//! "object log" for variable-sized payloads referenced from records).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │      Enclosing store (hash index, sessions, ...)     │
//! ├──────────────────────────────────────────────────────┤
//! │  LogAllocator                                        │
//! │    allocation (packed tail, wait-free translation)   │
//! │    watermarks (Begin/Head/ReadOnly/Tail + Safe/…)    │
//! │    page status machine (packed flush/close CAS)      │
//! ├───────────────────────┬──────────────────────────────┤
//! │  Flush engine         │  Read engine                 │
//! │  (object batching,    │  (page read-in, object       │
//! │   scratch patching)   │   reinflation, point reads)  │
//! ├───────────────────────┴──────────────────────────────┤
//! │  PageHandler      Epoch        SectorBufferPool      │
//! ├──────────────────────────────────────────────────────┤
//! │  StorageDevice (main log)   StorageDevice (obj log)  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## What lives where
//!
//! A 64-bit logical address splits into segment, ring slot, and intra-page
//! offset ([`addr::PageLayout`]). While a page is inside the in-memory
//! window, translating an address is a wait-free pointer load; once the
//! head watermark passes it, the page lives only on the log device and is
//! recovered through the read engine. Records with out-of-line payloads
//! carry an 8-byte [`record::AddressInfo`] that alternates between a live
//! object handle (in memory) and an object-log back-reference (on disk);
//! the flush engine patches one into the other on the way out, the read
//! engine on the way back in.
//!
//! ## Collaborators
//!
//! The hash index that points into the log, the session/epoch framework,
//! and checkpoint metadata live outside this crate. The allocator consumes
//! an [`epoch::Epoch`] to bound how long raw pointers stay valid, a
//! [`device::StorageDevice`] per log, and a [`handler::PageHandler`] that
//! knows whether records embed objects and how to move them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pagelog::{LogAllocator, LogConfig, FixedHandler, ImmediateEpoch, FileDevice,
//!               FileDeviceOptions};
//!
//! let device = Arc::new(FileDevice::open("./log", "main", FileDeviceOptions::default())?);
//! let log = LogAllocator::new(
//!     LogConfig::default(),
//!     Arc::new(FixedHandler),
//!     Arc::new(ImmediateEpoch),
//!     device,
//!     None,
//! )?;
//!
//! let addr = log.allocate(log.record_layout().record_size)?;
//! // ... fill the record through log.record_bytes_mut(addr) ...
//! log.shift_read_only_to_tail(); // make it flushable
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and the validated [`LogConfig`]
//! - [`addr`]: logical-address partitioning
//! - [`record`]: record header and object back-reference layouts
//! - [`memory`]: sector-aligned frames and the reusable buffer pool
//! - [`device`]: the device capability and its file/in-memory backends
//! - [`epoch`]: the epoch-protection collaborator interface
//! - [`handler`]: the page-handler capability and stock handlers
//! - [`log`]: the allocator core, flush engine, and read engine

pub mod addr;
pub mod config;
pub mod device;
pub mod epoch;
pub mod handler;
pub mod log;
pub mod memory;
pub mod record;

pub use crate::config::LogConfig;
pub use crate::device::{FileDevice, FileDeviceOptions, MemDevice, StorageDevice};
pub use crate::epoch::{Epoch, ImmediateEpoch};
pub use crate::handler::{ByteObjectHandler, FixedHandler, PageHandler};
pub use crate::log::LogAllocator;
pub use crate::record::{AddressInfo, RecordInfo};
