//! Flush engine: asynchronous page writes with an optional object-log
//! side channel.
//!
//! Pages with purely blittable records are written straight from their
//! frame. Pages whose records embed objects are flushed through a scratch
//! copy so the in-record object slots can be patched from live handles to
//! on-disk back-references without disturbing readers of the live frame:
//!
//! 1. copy the frame into a pooled scratch buffer;
//! 2. serialize object payloads batch by batch (each batch bounded by the
//!    configured object block size), reserving sector-aligned space in the
//!    page's object-log segment by fetch-add and rebasing every patched
//!    `AddressInfo` onto its reservation;
//! 3. write each batch to the object log; non-final batches are awaited
//!    before the next begins, because each depends on the prefix of the
//!    serializer's walk, while the final batch joins the page write under
//!    a shared refcount;
//! 4. write the patched scratch page to the log device.
//!
//! Exactly one top-level completion fires per flushed page, after both the
//! object-log writes and the main-page write have landed. Ring flushes then
//! record `last_flushed_until`, resolve the flush/close race (clearing the
//! frame when eviction got there first), and drive the monotone
//! `FlushedUntilAddress` scan. The snapshot variant (`flush_pages_to`)
//! reuses the same engine against a caller-supplied device and segment
//! offset vector, placing pages densely from the start page, and leaves
//! ring state untouched.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use super::status::{CloseStatus, FlushCloseStatus, FlushStatus};
use super::{monotonic_update, LogAllocator, LogInner};
use crate::addr::align_up;
use crate::device::{IoSource, StorageDevice, ERR_IO};
use crate::handler::PatchList;
use crate::memory::PooledBuf;
use crate::record::AddressInfo;

/// Per-page flush observer: `(page, error_code)`, error code 0 on success.
pub type PageFlushCallback = Arc<dyn Fn(u64, u32) + Send + Sync>;

/// Aggregate completion for a snapshot flush.
pub type SnapshotCompletion = Box<dyn FnOnce(u32) + Send>;

/// Where a flush writes and where it reserves object-log space.
struct FlushTarget {
    device: Arc<dyn StorageDevice>,
    object_device: Option<Arc<dyn StorageDevice>>,
    segment_offsets: SegmentOffsetSource,
    /// Destination file offset is `(page - base_page) * page_size`.
    base_page: u64,
}

enum SegmentOffsetSource {
    /// The allocator's live table.
    Live,
    /// A caller-supplied table (snapshot flushes).
    Provided(Arc<Vec<AtomicU64>>),
}

impl FlushTarget {
    fn reserve(&self, inner: &LogInner, segment: u64, len: u64) -> u64 {
        match &self.segment_offsets {
            SegmentOffsetSource::Live => {
                let slot = (segment as usize) % inner.config.segment_buffer_size;
                inner.segment_offsets[slot].fetch_add(len, Ordering::AcqRel)
            }
            SegmentOffsetSource::Provided(table) => {
                let slot = (segment as usize) % table.len();
                table[slot].fetch_add(len, Ordering::AcqRel)
            }
        }
    }
}

/// Refcounted completion state for one page flush: one count for the main
/// page write plus one for the final object batch, if any.
struct FlushOutcome {
    remaining: AtomicU32,
    error: AtomicU32,
    done: Mutex<Option<Box<dyn FnOnce(u32) + Send>>>,
    scratch: Mutex<Option<PooledBuf>>,
}

impl FlushOutcome {
    fn new(done: Box<dyn FnOnce(u32) + Send>) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicU32::new(1),
            error: AtomicU32::new(0),
            done: Mutex::new(Some(done)),
            scratch: Mutex::new(None),
        })
    }

    fn record_error(&self, code: u32) {
        if code != 0 {
            let _ = self
                .error
                .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn complete_one(&self, code: u32) {
        self.record_error(code);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.scratch.lock().take();
            if let Some(done) = self.done.lock().take() {
                done(self.error.load(Ordering::Acquire));
            }
        }
    }
}

impl LogInner {
    /// Flushes every page overlapping `[from, to)`; per-page durability is
    /// recorded up to `min(page_end, to)`.
    pub(crate) fn flush_pages(self: &Arc<Self>, from: u64, to: u64) {
        if to <= from {
            return;
        }
        let first = self.layout.page(from);
        let last = self.layout.page(to - 1);
        for page in first..=last {
            let until = self.layout.page_end(page).min(to);
            self.flush_page(page, until);
        }
    }

    fn flush_page(self: &Arc<Self>, page: u64, until: u64) {
        let slot = self.layout.slot_of_page(page);
        // A previous partial flush of this page may still be in flight;
        // batches of the same page are ordered, so wait it out.
        while !self.status[slot].try_begin_flush() {
            std::hint::spin_loop();
        }
        log::debug!("flushing page {} until {}", page, until);

        let target = FlushTarget {
            device: Arc::clone(&self.device),
            object_device: self.object_device.clone(),
            segment_offsets: SegmentOffsetSource::Live,
            base_page: 0,
        };
        let inner = Arc::clone(self);
        self.flush_page_core(
            &target,
            page,
            Box::new(move |code| inner.finish_flush(page, until, code)),
        );
    }

    /// Issues the writes for one page against `target`. `done` fires once,
    /// after every write for the page has completed.
    fn flush_page_core(
        self: &Arc<Self>,
        target: &FlushTarget,
        page: u64,
        done: Box<dyn FnOnce(u32) + Send>,
    ) {
        let page_size = self.page_size() as usize;
        let dest = (page - target.base_page) * page_size as u64;
        let slot = self.layout.slot_of_page(page);

        if !self.handler.has_objects() {
            let ptr = self.frame_ptr(slot);
            debug_assert!(!ptr.is_null());
            // SAFETY: the page is read-only for the duration of the flush;
            // the frame outlives the completion because slots are reused
            // only after this flush publishes Flushed.
            let source = unsafe { IoSource::from_raw(ptr, page_size) };
            self.device
                .write_async(source, dest, Box::new(move |code, _| done(code)));
            return;
        }

        // Object path: serialize out of a scratch copy so live records keep
        // their handles while the on-disk image gets back-references.
        let mut scratch = self.pool.get(page_size);
        {
            // SAFETY: flushed pages are read-only; the copy races only with
            // writers above the flush boundary, whose records are skipped
            // as null during serialization.
            let frame = unsafe { self.page_slice_mut(page) };
            scratch[..page_size].copy_from_slice(frame);
        }

        let outcome = FlushOutcome::new(done);
        let rec_start = self.record_start(page);
        let records_len = page_size - rec_start;
        let record_size = self.record_layout.record_size;
        let segment = self.layout.segment_of_page(page);
        let sector = self.config.sector_size as u64;
        let block = self.config.object_block_size;
        let object_device = target
            .object_device
            .as_ref()
            .expect("object handler without object device rejected at construction");

        let mut pos = 0usize;
        loop {
            let mut stream = Vec::new();
            let mut patches = PatchList::new();
            let serialized = self.handler.serialize(
                &mut scratch[rec_start..page_size],
                &mut pos,
                &mut stream,
                block,
                &mut patches,
            );
            if let Err(err) = serialized {
                log::error!("object serialization for page {} failed: {err:#}", page);
                outcome.complete_one(ERR_IO);
                return;
            }

            if stream.is_empty() {
                break;
            }

            let aligned_len = align_up(stream.len() as u64, sector);
            let reservation = target.reserve(self, segment, aligned_len);
            for &patch in &patches {
                let at = rec_start + patch;
                let mut info = AddressInfo::from_bytes(&scratch[at..at + AddressInfo::SIZE]);
                info.rebase(reservation);
                info.write_to(&mut scratch[at..at + AddressInfo::SIZE]);
            }

            let mut batch = self.pool.get(aligned_len as usize);
            batch[..stream.len()].copy_from_slice(&stream);
            // SAFETY: batch is moved into the completion closure below, so
            // the allocation outlives the write.
            let source = unsafe { IoSource::from_raw(batch.as_ptr(), aligned_len as usize) };

            let finished = pos + record_size > records_len;
            if finished {
                outcome.remaining.fetch_add(1, Ordering::AcqRel);
                let outcome = Arc::clone(&outcome);
                object_device.write_segment_async(
                    segment,
                    reservation,
                    source,
                    Box::new(move |code, _| {
                        drop(batch);
                        outcome.complete_one(code);
                    }),
                );
                break;
            }

            // Non-final batch: the next batch extends this walk, so order
            // them by waiting for the completion here.
            let (tx, rx) = std::sync::mpsc::channel();
            object_device.write_segment_async(
                segment,
                reservation,
                source,
                Box::new(move |code, _| {
                    drop(batch);
                    let _ = tx.send(code);
                }),
            );
            match rx.recv() {
                Ok(code) => outcome.record_error(code),
                Err(_) => outcome.record_error(ERR_IO),
            }
        }

        let src = scratch.as_ptr();
        *outcome.scratch.lock() = Some(scratch);
        // SAFETY: the scratch buffer now lives inside `outcome`, which the
        // completion holds until the last count drops.
        let source = unsafe { IoSource::from_raw(src, page_size) };
        let outcome = Arc::clone(&outcome);
        target
            .device
            .write_async(source, dest, Box::new(move |code, _| outcome.complete_one(code)));
    }

    /// Runs on the completion of a ring flush: records durability, resolves
    /// the flush/close race, advances `FlushedUntilAddress`, and notifies
    /// the registered observer. Device errors are logged and surfaced but
    /// the slot is still released, so the ring cannot wedge on a bad write.
    pub(crate) fn finish_flush(self: &Arc<Self>, page: u64, until: u64, code: u32) {
        if code != 0 {
            log::error!("flush of page {} completed with device error {}", page, code);
        }

        let slot = self.layout.slot_of_page(page);
        self.status[slot].set_last_flushed_until(until);

        let mut cleared = false;
        loop {
            let old = self.status[slot].load();
            debug_assert_eq!(old.flush, FlushStatus::InProgress);
            // Eviction may have passed this page while the flush was in
            // flight; the observer of Closed clears before publishing.
            if old.close == CloseStatus::Closed && !cleared {
                self.clear_frame(slot);
                cleared = true;
            }
            if self.status[slot]
                .compare_exchange(old, FlushCloseStatus::new(FlushStatus::Flushed, old.close))
            {
                break;
            }
        }

        self.shift_flushed_until();

        let callback = self.flush_callback.lock().clone();
        if let Some(callback) = callback {
            callback(page, code);
        }
    }

    /// Advances `FlushedUntilAddress` over every completed page, smallest
    /// page first, stopping at the first gap.
    pub(crate) fn shift_flushed_until(&self) {
        let current = self.flushed_until_address.load(Ordering::Acquire);
        let mut page = self.layout.page(current);
        let mut target = current;
        loop {
            let last = self.status[self.layout.slot_of_page(page)].last_flushed_until();
            if last > target {
                target = last;
                if target == self.layout.page_end(page) {
                    page += 1;
                    continue;
                }
            }
            break;
        }
        if target > current {
            monotonic_update(&self.flushed_until_address, target);
        }
    }
}

impl LogAllocator {
    /// Flushes pages `[start_page, end_page)` to a separate device pair,
    /// placed densely from file offset zero, reserving object-log space
    /// from the caller-supplied `segment_offsets` table. Ring status and
    /// watermarks are untouched; the pages must be resident and read-only
    /// for the duration. `completion` fires once with the first error code
    /// observed, or 0.
    pub fn flush_pages_to(
        &self,
        start_page: u64,
        end_page: u64,
        device: Arc<dyn StorageDevice>,
        object_device: Option<Arc<dyn StorageDevice>>,
        segment_offsets: Arc<Vec<AtomicU64>>,
        completion: SnapshotCompletion,
    ) -> Result<()> {
        ensure!(end_page > start_page, "empty snapshot page range");
        ensure!(
            !self.inner().handler.has_objects() || object_device.is_some(),
            "snapshot of an object log requires an object-log device"
        );
        ensure!(
            !self.inner().handler.has_objects() || !segment_offsets.is_empty(),
            "snapshot of an object log requires a segment offset table"
        );

        let target = FlushTarget {
            device,
            object_device,
            segment_offsets: SegmentOffsetSource::Provided(segment_offsets),
            base_page: start_page,
        };

        let remaining = Arc::new(AtomicU64::new(end_page - start_page));
        let error = Arc::new(AtomicU32::new(0));
        let completion = Arc::new(Mutex::new(Some(completion)));

        for page in start_page..end_page {
            let remaining = Arc::clone(&remaining);
            let error = Arc::clone(&error);
            let completion = Arc::clone(&completion);
            self.inner().flush_page_core(
                &target,
                page,
                Box::new(move |code| {
                    if code != 0 {
                        let _ = error.compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire);
                    }
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(completion) = completion.lock().take() {
                            completion(error.load(Ordering::Acquire));
                        }
                    }
                }),
            );
        }
        Ok(())
    }
}
