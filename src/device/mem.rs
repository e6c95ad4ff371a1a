//! In-memory device for tests.
//!
//! Segments are byte vectors grown on demand; completions run inline on the
//! calling thread, which makes tests deterministic without sleeps or
//! polling. The device records every write it performs and can be armed to
//! fail the next write with a chosen error code, for exercising the error
//! propagation paths.

use std::sync::atomic::{AtomicU32, Ordering};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{IoCompletion, IoSource, IoTarget, StorageDevice, ERR_OK};
use crate::config::DEFAULT_SECTOR_SIZE;

/// One completed write, for assertions about alignment and placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub segment: u64,
    pub offset: u64,
    pub len: usize,
}

/// In-memory [`StorageDevice`] with inline completions.
pub struct MemDevice {
    sector_size: usize,
    segment_size_bits: u32,
    segments: Mutex<HashMap<u64, Vec<u8>>>,
    writes: Mutex<Vec<WriteRecord>>,
    fail_next_write: AtomicU32,
}

impl MemDevice {
    pub fn new(sector_size: usize) -> Self {
        Self {
            sector_size,
            segment_size_bits: 40,
            segments: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            fail_next_write: AtomicU32::new(ERR_OK),
        }
    }

    /// Arms the device to complete its next write with `code` instead of
    /// performing it.
    pub fn fail_next_write(&self, code: u32) {
        self.fail_next_write.store(code, Ordering::SeqCst);
    }

    /// Every write performed so far, in completion order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    /// Bytes currently stored in `segment`.
    pub fn segment_len(&self, segment: u64) -> usize {
        self.segments
            .lock()
            .get(&segment)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Snapshot of `segment`'s current contents.
    pub fn segment_bytes(&self, segment: u64) -> Vec<u8> {
        self.segments
            .lock()
            .get(&segment)
            .cloned()
            .unwrap_or_default()
    }

    fn store(&self, segment: u64, offset: u64, data: &[u8]) {
        let mut segments = self.segments.lock();
        let vec = segments.entry(segment).or_default();
        let end = offset as usize + data.len();
        if vec.len() < end {
            vec.resize(end, 0);
        }
        vec[offset as usize..end].copy_from_slice(data);
    }

    fn load(&self, segment: u64, offset: u64, buf: &mut [u8]) -> usize {
        let segments = self.segments.lock();
        let Some(vec) = segments.get(&segment) else {
            return 0;
        };
        let offset = offset as usize;
        if offset >= vec.len() {
            return 0;
        }
        let n = buf.len().min(vec.len() - offset);
        buf[..n].copy_from_slice(&vec[offset..offset + n]);
        n
    }

    #[inline]
    fn split(&self, offset: u64) -> (u64, u64) {
        (
            offset >> self.segment_size_bits,
            offset & ((1u64 << self.segment_size_bits) - 1),
        )
    }
}

impl Default for MemDevice {
    fn default() -> Self {
        Self::new(DEFAULT_SECTOR_SIZE)
    }
}

impl StorageDevice for MemDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn segment_size(&self) -> u64 {
        1u64 << self.segment_size_bits
    }

    fn write_async(&self, source: IoSource, offset: u64, completion: IoCompletion) {
        let (segment, intra) = self.split(offset);
        self.write_segment_async(segment, intra, source, completion);
    }

    fn read_async(&self, offset: u64, target: IoTarget, completion: IoCompletion) {
        let (segment, intra) = self.split(offset);
        self.read_segment_async(segment, intra, target, completion);
    }

    fn write_segment_async(
        &self,
        segment: u64,
        offset: u64,
        source: IoSource,
        completion: IoCompletion,
    ) {
        let armed = self.fail_next_write.swap(ERR_OK, Ordering::SeqCst);
        if armed != ERR_OK {
            completion(armed, 0);
            return;
        }

        // SAFETY: the IoSource contract guarantees validity until the
        // completion fires, which happens inside this call.
        let data = unsafe { source.as_slice() };
        self.store(segment, offset, data);
        self.writes.lock().push(WriteRecord {
            segment,
            offset,
            len: data.len(),
        });
        completion(ERR_OK, data.len());
    }

    fn read_segment_async(
        &self,
        segment: u64,
        offset: u64,
        target: IoTarget,
        completion: IoCompletion,
    ) {
        // SAFETY: the IoTarget contract guarantees exclusive validity until
        // the completion fires, which happens inside this call.
        let buf = unsafe { target.as_mut_slice() };
        let n = self.load(segment, offset, buf);
        completion(ERR_OK, n);
    }

    fn delete_segment_range(&self, from: u64, to: u64) -> Result<()> {
        let mut segments = self.segments.lock();
        for segment in from..to {
            segments.remove(&segment);
        }
        Ok(())
    }
}
