//! Read engine: page read-in and record-granular reads.
//!
//! Whole pages are read back into their ring slot, re-inflating any object
//! payloads in a second phase: a progress function walks the record stream,
//! asks the handler for the next object-log range, reads that fragment
//! (sector-aligned, capped at 2 GiB), deserializes the covered records, and
//! re-enters itself from the completion until the walk reaches the end of
//! the page. Record-granular reads fetch a sector-aligned window around one
//! evicted record into a pooled buffer, recording `valid_offset` /
//! `available_bytes` so the caller can locate the true record; a second
//! entry point fetches one record's object payload once the record itself
//! is in hand.

use std::sync::Arc;

use eyre::{ensure, Result};

use super::LogInner;
use crate::addr::{align_down, align_up};
use crate::config::MAX_OBJECT_FRAGMENT;
use crate::device::{IoTarget, ERR_IO, ERR_OBJECT_TOO_LARGE, ERR_OK};
use crate::memory::PooledBuf;
use crate::record::AddressInfo;

/// Completion for a whole-page read-in.
pub type PageReadCompletion = Box<dyn FnOnce(u32) + Send>;

/// Completion for a record-granular read: the buffer's `valid_offset`,
/// `available_bytes`, and `required_bytes` locate the payload inside the
/// sector-rounded window.
pub type RecordReadCompletion = Box<dyn FnOnce(u32, PooledBuf) + Send>;

/// State for one page's object re-inflation walk; `pos` is the cursor into
/// the page's record region, carried across chained fragment reads.
struct ObjectReadState {
    inner: Arc<LogInner>,
    page: u64,
    pos: usize,
    completion: Option<PageReadCompletion>,
}

impl ObjectReadState {
    fn finish(&mut self, code: u32) {
        if let Some(completion) = self.completion.take() {
            completion(code);
        }
    }
}

/// Issues the next object-log fragment read, or completes the page. Each
/// device completion re-enters this function, forming the recursive
/// completion chain that drains a page with many object fragments.
fn drive_object_reads(mut state: ObjectReadState) {
    let inner = Arc::clone(&state.inner);
    let rec_start = inner.record_start(state.page);

    // SAFETY: the slot was claimed for this read; nothing else touches the
    // frame until the page-read completion fires.
    let records = unsafe { &mut inner.page_slice_mut(state.page)[rec_start..] };

    let mut pos = state.pos;
    let range = match inner
        .handler
        .object_info(records, &mut pos, inner.config.object_block_size)
    {
        Ok(Some(range)) => range,
        Ok(None) => {
            state.finish(ERR_OK);
            return;
        }
        Err(err) => {
            log::error!("object scan of page {} failed: {err:#}", state.page);
            state.finish(ERR_IO);
            return;
        }
    };

    if range.len > MAX_OBJECT_FRAGMENT {
        log::error!(
            "object fragment of {} bytes on page {} exceeds the single-read limit",
            range.len,
            state.page
        );
        state.finish(ERR_OBJECT_TOO_LARGE);
        return;
    }

    let sector = inner.config.sector_size as u64;
    let aligned_start = align_down(range.start, sector);
    let aligned_len = align_up(range.start + range.len - aligned_start, sector) as usize;

    let buf = inner.pool.get(aligned_len);
    // SAFETY: buf is moved into the completion closure; the allocation
    // outlives the read.
    let target = unsafe { IoTarget::from_raw(buf.as_ptr(), aligned_len) };

    let segment = inner.layout.segment_of_page(state.page);
    let object_device = Arc::clone(
        inner
            .object_device
            .as_ref()
            .expect("object walk without object device rejected at construction"),
    );

    let span = (state.pos, pos);
    state.pos = pos;

    object_device.read_segment_async(
        segment,
        aligned_start,
        target,
        Box::new(move |code, _bytes| {
            let mut state = state;
            let buf = buf;
            if code != ERR_OK {
                state.finish(code);
                return;
            }

            let inner = Arc::clone(&state.inner);
            let rec_start = inner.record_start(state.page);
            // SAFETY: as above; the fragment read has completed and this is
            // the only path touching the frame.
            let covered = unsafe {
                &mut inner.page_slice_mut(state.page)[rec_start + span.0..rec_start + span.1]
            };
            let skew = (range.start - aligned_start) as usize;
            let stream = &buf[skew..skew + range.len as usize];

            match inner.handler.deserialize(covered, stream, range.start) {
                Ok(()) => drive_object_reads(state),
                Err(err) => {
                    log::error!("object reinflation of page {} failed: {err:#}", state.page);
                    state.finish(ERR_IO);
                }
            }
        }),
    );
}

impl super::LogAllocator {
    /// Reads a previously flushed page back into its ring slot,
    /// re-inflating object payloads, and fires `completion` when the page
    /// is usable. The slot must be empty or retired.
    pub fn read_page_async(&self, page: u64, completion: PageReadCompletion) -> Result<()> {
        let inner = Arc::clone(self.inner());
        ensure!(
            inner.can_claim(page),
            "ring slot for page {} is still live",
            page
        );
        inner.claim_slot(page);

        let page_size = inner.page_size() as usize;
        let slot = inner.layout.slot_of_page(page);
        let ptr = inner.frame_ptr(slot);
        // SAFETY: the slot was just claimed; the frame is exclusively ours
        // until `completion` fires, and outlives the read.
        let target = unsafe { IoTarget::from_raw(ptr, page_size) };

        let file_offset = inner.layout.page_start(page);
        let chained = Arc::clone(&inner);
        inner.device.read_async(
            file_offset,
            target,
            Box::new(move |code, _bytes| {
                if code != ERR_OK {
                    log::error!("page {} read failed with device error {}", page, code);
                    completion(code);
                    return;
                }
                if !chained.handler.has_objects() {
                    completion(ERR_OK);
                    return;
                }
                drive_object_reads(ObjectReadState {
                    inner: chained,
                    page,
                    pos: 0,
                    completion: Some(completion),
                });
            }),
        );
        Ok(())
    }

    /// Fetches `num_bytes` starting at the evicted record `logical` into a
    /// sector-aligned window. The completion's buffer locates the record at
    /// `valid_offset`.
    pub fn read_record_async(
        &self,
        logical: u64,
        num_bytes: usize,
        completion: RecordReadCompletion,
    ) {
        let inner = self.inner();
        let sector = inner.config.sector_size as u64;

        // The main log is dense: a record's file offset is its address.
        let aligned_offset = align_down(logical, sector);
        let pad = (logical - aligned_offset) as usize;
        let aligned_len = align_up((num_bytes + pad) as u64, sector) as usize;

        let mut buf = inner.pool.get(aligned_len);
        buf.valid_offset = pad;
        buf.required_bytes = num_bytes;
        // SAFETY: buf moves into the completion closure; the allocation
        // outlives the read.
        let target = unsafe { IoTarget::from_raw(buf.as_ptr(), aligned_len) };

        inner.device.read_async(
            aligned_offset,
            target,
            Box::new(move |code, bytes| {
                let mut buf = buf;
                buf.available_bytes = bytes.saturating_sub(buf.valid_offset);
                completion(code, buf);
            }),
        );
    }

    /// Fetches the object payload of an evicted record whose main bytes are
    /// already in hand: `address_info` is the record's on-disk
    /// back-reference and `logical` its address, from which the object-log
    /// segment is derived. The completion's buffer locates the serialized
    /// payload at `valid_offset`.
    pub fn read_record_objects_async(
        &self,
        logical: u64,
        address_info: AddressInfo,
        completion: RecordReadCompletion,
    ) -> Result<()> {
        let inner = self.inner();
        ensure!(
            inner.object_device.is_some(),
            "record object read without an object-log device"
        );
        ensure!(
            !address_info.is_null(),
            "record at {} carries no object payload",
            logical
        );

        let size = address_info.size();
        let sector = inner.config.sector_size as u64;
        let aligned_start = align_down(address_info.offset(), sector);
        let pad = (address_info.offset() - aligned_start) as usize;
        let aligned_len = align_up(address_info.offset() + size - aligned_start, sector) as usize;

        if aligned_len as u64 > MAX_OBJECT_FRAGMENT {
            let mut buf = inner.pool.get(sector as usize);
            buf.required_bytes = size as usize;
            completion(ERR_OBJECT_TOO_LARGE, buf);
            return Ok(());
        }

        let mut buf = inner.pool.get(aligned_len);
        buf.valid_offset = pad;
        buf.required_bytes = size as usize;
        // SAFETY: buf moves into the completion closure; the allocation
        // outlives the read.
        let target = unsafe { IoTarget::from_raw(buf.as_ptr(), aligned_len) };

        let segment = inner.layout.segment(logical);
        let object_device = inner.object_device.as_ref().unwrap();
        object_device.read_segment_async(
            segment,
            aligned_start,
            target,
            Box::new(move |code, bytes| {
                let mut buf = buf;
                buf.available_bytes = bytes.saturating_sub(buf.valid_offset);
                completion(code, buf);
            }),
        );
        Ok(())
    }
}
