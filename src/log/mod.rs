//! # Log Allocator Core
//!
//! [`LogAllocator`] owns an append-only logical address space backed by a
//! bounded circular buffer of page frames in memory and one or two block
//! devices behind it (the main log, plus an object log when records carry
//! out-of-line payloads).
//!
//! ## Address space and watermarks
//!
//! Six monotonic watermarks partition the logical space:
//!
//! ```text
//! Begin ≤ Head ≤ SafeHead ≤ ReadOnly ≤ SafeReadOnly ≤ Tail
//!
//!   [Begin, Head)          on disk only
//!   [Head, ReadOnly)       in memory, read-only, flushed or flushing
//!   [ReadOnly, Tail)       in memory, mutable
//! ```
//!
//! `SafeReadOnly` and `SafeHead` are *requested* shift targets; the
//! unprefixed watermarks advance only after the epoch collaborator confirms
//! every thread has drained past the epoch in which the request was made.
//! Threads stop mutating a page as soon as it falls below `SafeReadOnly`;
//! flushing starts once `ReadOnly` (confirmed) crosses the page; pages close
//! once `Head` (confirmed) crosses them. Automatic head shifts are clamped
//! to the page-aligned `FlushedUntilAddress` so eviction never outruns
//! durability.
//!
//! ## Allocation
//!
//! The tail is one packed `(page, offset)` word advanced by `fetch_add` on
//! the offset half. Within a page, allocation is a single wait-free add.
//! The unique thread whose add crosses the page size owns the boundary: it
//! requests the watermark shifts, claims the next ring slot, installs the
//! new `(page, offset)` pair and takes its allocation at the new page
//! start. If the slot's previous occupant is not yet retired the owner
//! restores the offset to exactly the page size and reports a stall; the
//! caller refreshes its epoch and retries, and the next crossing add
//! becomes a fresh owner.
//!
//! ## Slot lifecycle
//!
//! A slot is materialized on first use and reused when its packed status
//! reads `(Flushed, Closed)`. Claiming releases the previous occupant's
//! object handles, zeroes the frame, and publishes `(Flushed, Open)`. The
//! flush engine ([`flush`]) and eviction path race on the packed word; see
//! `log/status.rs`.
//!
//! ## Pointer discipline
//!
//! Address translation is a wait-free load of the slot's frame pointer plus
//! the intra-page offset. The allocator hands out raw pointers; the epoch
//! collaborator bounds how long callers may hold them, and the phase rules
//! above decide who may write through them. Functions returning references
//! into frames are `unsafe` with those preconditions spelled out.

pub mod status;

mod flush;
mod read;

pub use flush::{PageFlushCallback, SnapshotCompletion};
pub use read::{PageReadCompletion, RecordReadCompletion};

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;

use crate::addr::PageLayout;
use crate::config::{LogConfig, FIRST_VALID_ADDRESS, RECORD_ALIGNMENT};
use crate::device::StorageDevice;
use crate::epoch::Epoch;
use crate::handler::{PageHandler, RecordLayout};
use crate::memory::{AlignedBuf, SectorBufferPool};
use status::{CloseStatus, FlushCloseStatus, PageStatus};

/// Bound on blocking-allocate retries before giving up; each retry yields,
/// so a healthy ring turns over long before this.
const MAX_ALLOC_RETRIES: usize = 1_000_000;

/// Packed tail word: page number in the high half, intra-page offset in the
/// low half. The offset half may transiently exceed the page size while a
/// boundary is being resolved; see `try_allocate`.
#[derive(Debug, Clone, Copy)]
struct PageOffset {
    page: u32,
    offset: u32,
}

impl PageOffset {
    #[inline(always)]
    fn from_word(word: u64) -> Self {
        Self {
            page: (word >> 32) as u32,
            offset: word as u32,
        }
    }

    #[inline(always)]
    fn to_word(self) -> u64 {
        ((self.page as u64) << 32) | self.offset as u64
    }
}

/// CAS-loop monotonic advance. Returns whether the value moved and the
/// value it moved from.
pub(crate) fn monotonic_update(atom: &AtomicU64, target: u64) -> (bool, u64) {
    let mut current = atom.load(Ordering::Acquire);
    loop {
        if target <= current {
            return (false, current);
        }
        match atom.compare_exchange_weak(current, target, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (true, current),
            Err(observed) => current = observed,
        }
    }
}

/// One ring slot: the frame allocation, its published pointer, and the page
/// currently backed by it.
struct PageFrame {
    ptr: AtomicPtr<u8>,
    page: AtomicU64,
    buf: Mutex<Option<AlignedBuf>>,
}

impl PageFrame {
    fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            page: AtomicU64::new(0),
            buf: Mutex::new(None),
        }
    }
}

pub(crate) struct LogInner {
    pub(crate) config: LogConfig,
    pub(crate) layout: PageLayout,
    pub(crate) record_layout: RecordLayout,
    pub(crate) handler: Arc<dyn PageHandler>,
    pub(crate) epoch: Arc<dyn Epoch>,
    pub(crate) device: Arc<dyn StorageDevice>,
    pub(crate) object_device: Option<Arc<dyn StorageDevice>>,
    pub(crate) pool: SectorBufferPool,

    frames: Box<[PageFrame]>,
    pub(crate) status: Box<[PageStatus]>,
    pub(crate) segment_offsets: Box<[AtomicU64]>,

    tail: AtomicU64,
    begin_address: AtomicU64,
    head_address: AtomicU64,
    safe_head_address: AtomicU64,
    read_only_address: AtomicU64,
    safe_read_only_address: AtomicU64,
    pub(crate) flushed_until_address: AtomicU64,

    pub(crate) flush_callback: Mutex<Option<PageFlushCallback>>,
}

impl LogInner {
    #[inline(always)]
    pub(crate) fn page_size(&self) -> u64 {
        self.layout.page_size()
    }

    /// First record byte within a page: page zero reserves a null-address
    /// prefix that is never handed out.
    #[inline(always)]
    pub(crate) fn record_start(&self, page: u64) -> usize {
        if page == 0 {
            FIRST_VALID_ADDRESS as usize
        } else {
            0
        }
    }

    #[inline(always)]
    pub(crate) fn frame_ptr(&self, slot: usize) -> *mut u8 {
        self.frames[slot].ptr.load(Ordering::Acquire)
    }

    /// Full-page byte view of a materialized frame.
    ///
    /// # Safety
    ///
    /// The slot must be materialized, and the caller must hold the access
    /// right for the page's current lifecycle phase (writer below the tail,
    /// flusher/reader once read-only, clearer during reuse).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn page_slice_mut(&self, page: u64) -> &mut [u8] {
        let ptr = self.frame_ptr(self.layout.slot_of_page(page));
        debug_assert!(!ptr.is_null(), "page {} is not materialized", page);
        std::slice::from_raw_parts_mut(ptr, self.page_size() as usize)
    }

    /// Releases the current occupant's object handles and zeroes the frame.
    pub(crate) fn clear_frame(&self, slot: usize) {
        let ptr = self.frame_ptr(slot);
        if ptr.is_null() {
            return;
        }
        let occupant = self.frames[slot].page.load(Ordering::Acquire);
        // SAFETY: callers hold the clearer role for this slot (flush
        // completion observing Closed, or a claim that won the slot).
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(ptr, self.page_size() as usize) };
        if self.handler.has_objects() {
            let start = self.record_start(occupant);
            self.handler.clear_page(&mut bytes[start..]);
        }
        bytes.fill(0);
    }

    /// Whether `page`'s ring slot can be (re)claimed right now.
    fn can_claim(&self, page: u64) -> bool {
        let slot = self.layout.slot_of_page(page);
        if self.frame_ptr(slot).is_null() {
            return true;
        }
        self.status[slot].load() == FlushCloseStatus::retired()
    }

    /// Takes the slot for `page`: materializes or clears the frame, then
    /// publishes it as active. The caller must have established exclusivity
    /// (boundary ownership, or construction/read-in discipline).
    fn claim_slot(&self, page: u64) {
        let slot = self.layout.slot_of_page(page);
        if self.frame_ptr(slot).is_null() {
            let frame = AlignedBuf::zeroed(self.page_size() as usize, self.config.sector_size);
            let ptr = frame.as_ptr();
            *self.frames[slot].buf.lock() = Some(frame);
            self.frames[slot].ptr.store(ptr, Ordering::Release);
        } else {
            self.clear_frame(slot);
        }
        self.frames[slot].page.store(page, Ordering::Release);
        self.status[slot].set_last_flushed_until(0);
        self.status[slot].store(FlushCloseStatus::active());
    }

    /// Lock-free allocation; `None` means the caller must refresh its epoch
    /// and retry.
    fn try_allocate(self: &Arc<Self>, bytes: usize) -> Option<u64> {
        let page_size = self.page_size();
        debug_assert!(bytes > 0 && bytes as u64 <= page_size);

        let prev = PageOffset::from_word(self.tail.fetch_add(bytes as u64, Ordering::AcqRel));
        let new_offset = prev.offset as u64 + bytes as u64;

        if new_offset <= page_size {
            return Some(self.layout.page_start(prev.page as u64) + prev.offset as u64);
        }

        if prev.offset as u64 <= page_size {
            // This thread's add crossed the boundary; it alone resolves it.
            let next = prev.page as u64 + 1;
            self.page_aligned_shifts(next);

            if !self.can_claim(next) {
                // Park the offset at exactly the page size so the next
                // crossing add elects a fresh owner.
                self.tail.swap(
                    PageOffset {
                        page: prev.page,
                        offset: page_size as u32,
                    }
                    .to_word(),
                    Ordering::AcqRel,
                );
                return None;
            }

            self.claim_slot(next);
            self.tail.swap(
                PageOffset {
                    page: next as u32,
                    offset: bytes as u32,
                }
                .to_word(),
                Ordering::AcqRel,
            );
            return Some(self.layout.page_start(next));
        }

        // Another thread owns the boundary; stall until it resolves.
        None
    }

    /// Requests the watermark shifts a crossing into `next_page` implies:
    /// flush far enough back that the slot `next_page` needs can retire,
    /// and (clamped to durability) evict behind that.
    fn page_aligned_shifts(self: &Arc<Self>, next_page: u64) {
        let ring = self.config.buffer_size as u64;
        let head_target = self
            .layout
            .page_start(next_page.saturating_sub(ring - 1));
        let ro_target = head_target.max(
            self.layout
                .page_start(next_page.saturating_sub(self.config.mutable_pages as u64)),
        );

        if ro_target > self.safe_read_only_address.load(Ordering::Acquire) {
            self.shift_safe_read_only(ro_target);
        }

        let durable = self
            .layout
            .page_align_down(self.flushed_until_address.load(Ordering::Acquire));
        let clamped = head_target.min(durable);
        if clamped > self.safe_head_address.load(Ordering::Acquire) {
            self.shift_safe_head(clamped);
        }
    }

    /// Requests `SafeReadOnly := target`; once the epoch drains, confirms
    /// `ReadOnly` and flushes the newly read-only interval.
    pub(crate) fn shift_safe_read_only(self: &Arc<Self>, target: u64) {
        let (updated, old) = monotonic_update(&self.safe_read_only_address, target);
        if !updated {
            return;
        }
        let inner = Arc::clone(self);
        self.epoch.bump_current_epoch(Box::new(move || {
            inner.on_pages_marked_read_only(old, target);
        }));
    }

    fn on_pages_marked_read_only(self: &Arc<Self>, from: u64, to: u64) {
        monotonic_update(&self.read_only_address, to);
        self.flush_pages(from, to);
    }

    /// Requests `SafeHead := target` (page-aligned); once the epoch drains,
    /// closes the interval and confirms `Head`.
    pub(crate) fn shift_safe_head(self: &Arc<Self>, target: u64) {
        let target = self.layout.page_align_down(target);
        let (updated, old) = monotonic_update(&self.safe_head_address, target);
        if !updated {
            return;
        }
        let inner = Arc::clone(self);
        self.epoch.bump_current_epoch(Box::new(move || {
            inner.on_pages_closed(old, target);
        }));
    }

    /// Marks every page in `[from, to)` closed. The evicting thread never
    /// clears; whoever later observes `(Flushed, Closed)` does (flush
    /// completion, or the claim that reuses the slot).
    fn on_pages_closed(self: &Arc<Self>, from: u64, to: u64) {
        for page in self.layout.page(from)..self.layout.page(to) {
            let st = &self.status[self.layout.slot_of_page(page)];
            loop {
                let old = st.load();
                if old.close == CloseStatus::Closed {
                    break;
                }
                if st.compare_exchange(old, FlushCloseStatus::new(old.flush, CloseStatus::Closed))
                {
                    log::debug!("page {} closed", page);
                    break;
                }
            }
        }
        monotonic_update(&self.head_address, to);
    }
}

impl Drop for LogInner {
    fn drop(&mut self) {
        if !self.handler.has_objects() {
            return;
        }
        for slot in 0..self.config.buffer_size {
            let ptr = self.frames[slot].ptr.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            let occupant = self.frames[slot].page.load(Ordering::Acquire);
            let start = self.record_start(occupant);
            // SAFETY: drop has exclusive access to every frame.
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(ptr, self.layout.page_size() as usize)
            };
            self.handler.clear_page(&mut bytes[start..]);
        }
    }
}

/// The page-resident log allocator. Cheap to clone handles are not
/// provided; share it behind an `Arc` like any other engine component.
pub struct LogAllocator {
    inner: Arc<LogInner>,
}

impl LogAllocator {
    /// Builds an allocator over `device`, with `object_device` required
    /// whenever the handler declares out-of-line objects.
    pub fn new(
        config: LogConfig,
        handler: Arc<dyn PageHandler>,
        epoch: Arc<dyn Epoch>,
        device: Arc<dyn StorageDevice>,
        object_device: Option<Arc<dyn StorageDevice>>,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            !handler.has_objects() || object_device.is_some(),
            "page handler declares object payloads but no object-log device was provided"
        );
        ensure!(
            device.sector_size() == config.sector_size,
            "log device sector size {} disagrees with configured {}",
            device.sector_size(),
            config.sector_size
        );
        if let Some(od) = &object_device {
            ensure!(
                od.sector_size() == config.sector_size,
                "object-log device sector size {} disagrees with configured {}",
                od.sector_size(),
                config.sector_size
            );
        }

        let layout = PageLayout::new(&config);
        let record_layout = RecordLayout::from_config(&config);
        let frames = (0..config.buffer_size)
            .map(|_| PageFrame::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let status = (0..config.buffer_size)
            .map(|_| PageStatus::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let segment_offsets = (0..config.segment_buffer_size)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let pool = SectorBufferPool::new(config.sector_size);

        let inner = Arc::new(LogInner {
            layout,
            record_layout,
            handler,
            epoch,
            device,
            object_device,
            pool,
            frames,
            status,
            segment_offsets,
            tail: AtomicU64::new(
                PageOffset {
                    page: 0,
                    offset: FIRST_VALID_ADDRESS as u32,
                }
                .to_word(),
            ),
            begin_address: AtomicU64::new(FIRST_VALID_ADDRESS),
            head_address: AtomicU64::new(FIRST_VALID_ADDRESS),
            safe_head_address: AtomicU64::new(FIRST_VALID_ADDRESS),
            read_only_address: AtomicU64::new(FIRST_VALID_ADDRESS),
            safe_read_only_address: AtomicU64::new(FIRST_VALID_ADDRESS),
            flushed_until_address: AtomicU64::new(FIRST_VALID_ADDRESS),
            flush_callback: Mutex::new(None),
            config,
        });

        inner.claim_slot(0);
        Ok(Self { inner })
    }

    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    pub fn record_layout(&self) -> RecordLayout {
        self.inner.record_layout
    }

    // Watermark accessors; all monotonic non-decreasing.

    pub fn begin_address(&self) -> u64 {
        self.inner.begin_address.load(Ordering::Acquire)
    }

    pub fn head_address(&self) -> u64 {
        self.inner.head_address.load(Ordering::Acquire)
    }

    pub fn safe_head_address(&self) -> u64 {
        self.inner.safe_head_address.load(Ordering::Acquire)
    }

    pub fn read_only_address(&self) -> u64 {
        self.inner.read_only_address.load(Ordering::Acquire)
    }

    pub fn safe_read_only_address(&self) -> u64 {
        self.inner.safe_read_only_address.load(Ordering::Acquire)
    }

    pub fn flushed_until_address(&self) -> u64 {
        self.inner.flushed_until_address.load(Ordering::Acquire)
    }

    pub fn tail_address(&self) -> u64 {
        let po = PageOffset::from_word(self.inner.tail.load(Ordering::Acquire));
        let offset = (po.offset as u64).min(self.inner.page_size());
        self.inner.layout.page_start(po.page as u64) + offset
    }

    /// Translates a logical address to the in-memory location of its bytes.
    ///
    /// No bounds check: the caller must have ensured the address lies in
    /// the live window (`HeadAddress ≤ addr < TailAddress`, under epoch
    /// protection) or in a slot it read a page into.
    #[inline]
    pub fn physical_address(&self, logical: u64) -> *mut u8 {
        let slot = self.inner.layout.slot(logical);
        let ptr = self.inner.frame_ptr(slot);
        debug_assert!(!ptr.is_null(), "translated address on an empty slot");
        // SAFETY(offset): intra-page offsets are < page_size by
        // construction of the address partitioning.
        unsafe { ptr.add(self.inner.layout.offset(logical) as usize) }
    }

    /// Borrow of one record's bytes.
    ///
    /// # Safety
    ///
    /// Same preconditions as [`Self::physical_address`], plus: no thread
    /// may mutate the record while the borrow lives.
    pub unsafe fn record_bytes(&self, logical: u64) -> &[u8] {
        std::slice::from_raw_parts(
            self.physical_address(logical),
            self.inner.record_layout.record_size,
        )
    }

    /// Mutable borrow of one record's bytes.
    ///
    /// # Safety
    ///
    /// Same preconditions as [`Self::physical_address`], plus: the record's
    /// page must still be above `SafeReadOnlyAddress` and the caller must
    /// be its only writer.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn record_bytes_mut(&self, logical: u64) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.physical_address(logical),
            self.inner.record_layout.record_size,
        )
    }

    /// Lock-free allocation of `bytes` contiguous bytes (rounded up to the
    /// record alignment). `None` is an allocation stall: the target page is
    /// not yet present or not yet writable; refresh the epoch and retry.
    pub fn try_allocate(&self, bytes: usize) -> Option<u64> {
        let rounded = (bytes + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1);
        self.inner.try_allocate(rounded)
    }

    /// Blocking allocation: retries [`Self::try_allocate`] with epoch
    /// refreshes until the ring turns over.
    pub fn allocate(&self, bytes: usize) -> Result<u64> {
        ensure!(bytes > 0, "cannot allocate zero bytes");
        ensure!(
            bytes as u64 <= self.inner.page_size(),
            "allocation of {} bytes exceeds the page size",
            bytes
        );
        for _ in 0..MAX_ALLOC_RETRIES {
            if let Some(addr) = self.try_allocate(bytes) {
                return Ok(addr);
            }
            self.inner.epoch.refresh();
            std::thread::yield_now();
        }
        bail!(
            "allocation of {} bytes stalled: ring could not turn over",
            bytes
        );
    }

    /// Requests the read-only boundary to move to `addr` (clamped to the
    /// tail), flushing everything below it once the epoch drains.
    pub fn shift_read_only(&self, addr: u64) {
        let clamped = addr.min(self.tail_address());
        self.inner.shift_safe_read_only(clamped);
    }

    /// Requests the read-only boundary to move to the current tail,
    /// flushing everything below it once the epoch drains.
    pub fn shift_read_only_to_tail(&self) {
        self.shift_read_only(self.tail_address());
    }

    /// Requests eviction of every whole page below `addr`. Unlike the
    /// automatic shifts, this is not clamped to `FlushedUntilAddress`;
    /// closing a page whose flush is still in flight is legal (the slot is
    /// reused only after the flush lands), but reads of evicted addresses
    /// must then go through the read engine. The target is clamped to
    /// `ReadOnlyAddress` so mutable pages can never leave memory.
    pub fn shift_head(&self, addr: u64) {
        let clamped = addr.min(self.read_only_address());
        self.inner.shift_safe_head(clamped);
    }

    /// Bytes of page frames currently materialized in the ring.
    pub fn memory_used(&self) -> usize {
        let frames = self
            .inner
            .frames
            .iter()
            .filter(|frame| frame.buf.lock().is_some())
            .count();
        frames * self.inner.page_size() as usize
    }

    /// Registers a callback invoked once per flushed page with
    /// `(page, error_code)`; error code 0 is success.
    pub fn set_flush_callback(&self, callback: PageFlushCallback) {
        *self.inner.flush_callback.lock() = Some(callback);
    }

    /// Spins until `FlushedUntilAddress >= addr`.
    pub fn wait_for_flush(&self, addr: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.flushed_until_address() < addr {
            ensure!(
                Instant::now() < deadline,
                "flush did not reach {} before the deadline (at {})",
                addr,
                self.flushed_until_address()
            );
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Resets the recycled object-log segment offset slot for `segment`.
    pub fn segment_closed(&self, segment: u64) {
        let slot = (segment as usize) % self.inner.config.segment_buffer_size;
        self.inner.segment_offsets[slot].store(0, Ordering::Release);
    }

    /// Current append offset of `segment`'s object-log slot.
    pub fn segment_offset(&self, segment: u64) -> u64 {
        let slot = (segment as usize) % self.inner.config.segment_buffer_size;
        self.inner.segment_offsets[slot].load(Ordering::Acquire)
    }

    /// Advances `BeginAddress` to `addr` and deletes the device segments
    /// that fall wholly below it, on both devices.
    pub fn truncate_until(&self, addr: u64) -> Result<()> {
        let (updated, old) = monotonic_update(&self.inner.begin_address, addr);
        if !updated {
            return Ok(());
        }

        let seg_size = self.inner.device.segment_size();
        let (from, to) = (old / seg_size, addr / seg_size);
        if to > from {
            self.inner.device.delete_segment_range(from, to)?;
        }

        if let Some(object_device) = &self.inner.object_device {
            let (from, to) = (
                self.inner.layout.segment(old),
                self.inner.layout.segment(addr),
            );
            if to > from {
                object_device.delete_segment_range(from, to)?;
            }
        }
        Ok(())
    }

    pub(crate) fn inner(&self) -> &Arc<LogInner> {
        &self.inner
    }
}
