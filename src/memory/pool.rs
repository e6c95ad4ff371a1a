//! Reusable pool of sector-aligned I/O buffers.
//!
//! Flushing and reading allocate transient buffers constantly: a scratch
//! copy per object-page flush, a stream buffer per object batch, a window
//! per record read. The pool recycles them by size class (next power of
//! two) so the steady state performs no heap allocation.
//!
//! A [`PooledBuf`] returns itself to its size class when dropped, using
//! `ManuallyDrop` so the invalid "already returned" state is unrepresentable.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::AlignedBuf;

/// Maximum buffers retained per size class; beyond this, returned buffers
/// are simply freed.
const MAX_RETAINED_PER_CLASS: usize = 32;

/// A pool of reusable sector-aligned buffers, shared by `Arc`.
pub struct SectorBufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    align: usize,
    classes: Mutex<HashMap<usize, Vec<AlignedBuf>>>,
}

impl SectorBufferPool {
    /// Creates a pool whose buffers are aligned to `align` (the device
    /// sector size).
    pub fn new(align: usize) -> Self {
        assert!(align.is_power_of_two());
        Self {
            inner: Arc::new(PoolInner {
                align,
                classes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquires a zeroed buffer of at least `size` bytes, rounded up to the
    /// next power of two. The buffer returns to the pool when dropped.
    pub fn get(&self, size: usize) -> PooledBuf {
        let class = size.max(self.inner.align).next_power_of_two();

        let recycled = {
            let mut classes = self.inner.classes.lock();
            classes.get_mut(&class).and_then(Vec::pop)
        };

        let buf = match recycled {
            Some(mut buf) => {
                buf.zero();
                buf
            }
            None => AlignedBuf::zeroed(class, self.inner.align),
        };

        PooledBuf {
            buf: ManuallyDrop::new(buf),
            pool: Arc::clone(&self.inner),
            valid_offset: 0,
            available_bytes: 0,
            required_bytes: 0,
        }
    }

    /// Number of idle buffers currently retained, across all size classes.
    pub fn available(&self) -> usize {
        self.inner.classes.lock().values().map(Vec::len).sum()
    }

    pub fn align(&self) -> usize {
        self.inner.align
    }
}

impl Clone for SectorBufferPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A pooled, sector-aligned buffer plus the bookkeeping a sector-rounded
/// transfer needs to locate the caller's payload inside it.
///
/// `valid_offset` is where the requested bytes begin (the distance the read
/// start was rounded down to a sector boundary), `available_bytes` is how
/// many bytes past that offset actually landed, and `required_bytes` is what
/// the caller originally asked for.
pub struct PooledBuf {
    buf: ManuallyDrop<AlignedBuf>,
    pool: Arc<PoolInner>,
    pub valid_offset: usize,
    pub available_bytes: usize,
    pub required_bytes: usize,
}

impl PooledBuf {
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// The requested bytes, once a transfer has filled the buffer.
    pub fn valid(&self) -> &[u8] {
        let end = (self.valid_offset + self.available_bytes).min(self.buf.len());
        &self.buf.as_slice()[self.valid_offset..end]
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_slice()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        // SAFETY: taken exactly once; self.buf is not touched afterwards.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        let class = buf.len();
        let mut classes = self.pool.classes.lock();
        let slot = classes.entry(class).or_default();
        if slot.len() < MAX_RETAINED_PER_CLASS {
            slot.push(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .field("valid_offset", &self.valid_offset)
            .field("available_bytes", &self.available_bytes)
            .field("required_bytes", &self.required_bytes)
            .finish()
    }
}
