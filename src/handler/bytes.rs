//! Handler for records whose value is one out-of-line byte string.
//!
//! The value region of every record is exactly 8 bytes and does double
//! duty:
//!
//! - in memory it holds a live object handle (non-zero `u64`) keyed into
//!   this handler's object table;
//! - in a flushed page it holds an [`AddressInfo`] pointing at the
//!   serialized payload in the object log.
//!
//! ## Stream format
//!
//! Each payload is serialized as a little-endian `u64` length prefix
//! followed by the raw bytes; the `AddressInfo` covers prefix plus bytes.
//! A zero-length payload is a valid object (8-byte entry), distinct from a
//! record that never had one (null slot).

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, eyre, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{ObjectRange, PageHandler, PatchList, RecordLayout};
use crate::record::{AddressInfo, RecordInfo};

/// Page handler storing one variable-length byte string per record value.
pub struct ByteObjectHandler {
    layout: RecordLayout,
    objects: Mutex<HashMap<u64, Box<[u8]>>>,
    next_handle: AtomicU64,
}

impl ByteObjectHandler {
    /// The value region must be exactly one object slot wide.
    pub fn new(layout: RecordLayout) -> Result<Self> {
        ensure!(
            layout.value_len == AddressInfo::SIZE,
            "value region must be exactly {} bytes to hold an object slot, got {}",
            AddressInfo::SIZE,
            layout.value_len
        );
        Ok(Self {
            layout,
            objects: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Attaches `payload` to a record by writing a fresh live handle into
    /// its 8-byte value slot.
    pub fn set_payload(&self, value_slot: &mut [u8], payload: &[u8]) {
        debug_assert_eq!(value_slot.len(), AddressInfo::SIZE);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.objects
            .lock()
            .insert(handle, payload.to_vec().into_boxed_slice());
        value_slot.copy_from_slice(&handle.to_le_bytes());
    }

    /// Returns a copy of the payload behind a record's value slot, or
    /// `None` if the slot is null or the handle is unknown.
    pub fn payload(&self, value_slot: &[u8]) -> Option<Vec<u8>> {
        let handle = u64::from_le_bytes(value_slot[..8].try_into().unwrap());
        if handle == 0 {
            return None;
        }
        self.objects.lock().get(&handle).map(|b| b.to_vec())
    }

    /// Number of live handles currently held.
    pub fn live_objects(&self) -> usize {
        self.objects.lock().len()
    }

    #[inline]
    fn slot_range(&self, record_off: usize) -> std::ops::Range<usize> {
        let start = record_off + self.layout.value_offset();
        start..start + AddressInfo::SIZE
    }
}

impl PageHandler for ByteObjectHandler {
    fn value_has_objects(&self) -> bool {
        true
    }

    fn clear_page(&self, records: &mut [u8]) {
        let rs = self.layout.record_size;
        let mut objects = self.objects.lock();
        let mut off = 0;
        while off + rs <= records.len() {
            let info = RecordInfo::from_bytes(&records[off..]);
            if !info.is_null() {
                let slot = self.slot_range(off);
                let handle = u64::from_le_bytes(records[slot].try_into().unwrap());
                if handle != 0 {
                    objects.remove(&handle);
                }
            }
            off += rs;
        }
    }

    fn serialize(
        &self,
        records: &mut [u8],
        pos: &mut usize,
        stream: &mut Vec<u8>,
        block_size: usize,
        patches: &mut PatchList,
    ) -> Result<()> {
        let rs = self.layout.record_size;
        let objects = self.objects.lock();
        let mut off = *pos;

        while off + rs <= records.len() {
            let info = RecordInfo::from_bytes(&records[off..]);
            if info.is_null() {
                off += rs;
                continue;
            }

            let slot = self.slot_range(off);
            let handle = u64::from_le_bytes(records[slot.clone()].try_into().unwrap());
            if handle == 0 {
                off += rs;
                continue;
            }

            let payload = objects
                .get(&handle)
                .ok_or_else(|| eyre!("record references unknown object handle {}", handle))?;
            let entry_len = 8 + payload.len();
            ensure!(
                (entry_len as u64) <= AddressInfo::MAX_SIZE,
                "object payload of {} bytes exceeds the per-object limit",
                payload.len()
            );

            // Batch boundary: never split an object, never start one that
            // would push a non-empty batch past the block size.
            if !stream.is_empty() && stream.len() + entry_len > block_size {
                break;
            }

            let stream_offset = stream.len() as u64;
            stream.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            stream.extend_from_slice(payload);

            AddressInfo::new(stream_offset, entry_len as u64).write_to(&mut records[slot.clone()]);
            patches.push(slot.start);

            off += rs;
        }

        *pos = off;
        Ok(())
    }

    fn deserialize(&self, records: &mut [u8], stream: &[u8], stream_base: u64) -> Result<()> {
        let rs = self.layout.record_size;
        let mut off = 0;

        while off + rs <= records.len() {
            let info = RecordInfo::from_bytes(&records[off..]);
            if info.is_null() {
                off += rs;
                continue;
            }

            let slot = self.slot_range(off);
            let ai = AddressInfo::from_bytes(&records[slot.clone()]);
            if ai.is_null() {
                off += rs;
                continue;
            }

            ensure!(
                ai.offset() >= stream_base,
                "object back-reference {} precedes the fetched fragment at {}",
                ai.offset(),
                stream_base
            );
            let idx = (ai.offset() - stream_base) as usize;
            ensure!(
                idx + ai.size() as usize <= stream.len(),
                "object back-reference extends past the fetched fragment"
            );

            let len = u64::from_le_bytes(stream[idx..idx + 8].try_into().unwrap()) as usize;
            ensure!(
                8 + len == ai.size() as usize,
                "serialized object length {} disagrees with back-reference size {}",
                len,
                ai.size()
            );
            let payload = &stream[idx + 8..idx + 8 + len];

            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            self.objects
                .lock()
                .insert(handle, payload.to_vec().into_boxed_slice());
            records[slot].copy_from_slice(&handle.to_le_bytes());

            off += rs;
        }

        Ok(())
    }

    fn object_info(
        &self,
        records: &[u8],
        pos: &mut usize,
        block_size: usize,
    ) -> Result<Option<ObjectRange>> {
        let rs = self.layout.record_size;
        let mut off = *pos;
        let mut start: Option<u64> = None;
        let mut end = 0u64;

        while off + rs <= records.len() {
            let info = RecordInfo::from_bytes(&records[off..]);
            if info.is_null() {
                off += rs;
                continue;
            }

            let ai = AddressInfo::from_bytes(&records[self.slot_range(off)]);
            if ai.is_null() {
                off += rs;
                continue;
            }

            let obj_end = ai.offset() + ai.size();
            if let Some(s) = start {
                if obj_end.max(end) - s > block_size as u64 {
                    break;
                }
            } else {
                start = Some(ai.offset());
            }
            end = end.max(obj_end);
            off += rs;
        }

        *pos = off;
        Ok(start.map(|s| ObjectRange { start: s, len: end - s }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;

    fn handler() -> ByteObjectHandler {
        let cfg = LogConfig {
            key_len: 16,
            value_len: 8,
            ..LogConfig::default()
        };
        ByteObjectHandler::new(RecordLayout::from_config(&cfg)).unwrap()
    }

    fn make_page(handler: &ByteObjectHandler, payloads: &[&[u8]]) -> Vec<u8> {
        let rs = handler.layout().record_size;
        let mut page = vec![0u8; rs * payloads.len()];
        for (i, payload) in payloads.iter().enumerate() {
            let off = i * rs;
            RecordInfo::new(0, false).write_to(&mut page[off..]);
            let slot = off + handler.layout().value_offset();
            handler.set_payload(&mut page[slot..slot + 8], payload);
        }
        page
    }

    #[test]
    fn serialize_then_deserialize_restores_payloads() {
        let h = handler();
        let payloads: Vec<&[u8]> = vec![b"", b"x", b"hello world", &[0xAB; 700]];
        let mut page = make_page(&h, &payloads);

        let mut pos = 0;
        let mut stream = Vec::new();
        let mut patches = PatchList::new();
        h.serialize(&mut page, &mut pos, &mut stream, 1 << 20, &mut patches)
            .unwrap();
        assert_eq!(pos, page.len());
        assert_eq!(patches.len(), payloads.len());

        let expected_stream: usize = payloads.iter().map(|p| 8 + p.len()).sum();
        assert_eq!(stream.len(), expected_stream);

        h.deserialize(&mut page, &stream, 0).unwrap();
        let rs = h.layout().record_size;
        for (i, payload) in payloads.iter().enumerate() {
            let slot = i * rs + h.layout().value_offset();
            assert_eq!(h.payload(&page[slot..slot + 8]).unwrap(), payload.to_vec());
        }
    }

    #[test]
    fn serialize_breaks_batches_at_block_size() {
        let h = handler();
        let big = [1u8; 600];
        let payloads: Vec<&[u8]> = vec![&big, &big, &big];
        let mut page = make_page(&h, &payloads);

        let mut pos = 0;
        let mut stream = Vec::new();
        let mut patches = PatchList::new();
        // Block fits one 608-byte entry but not two.
        h.serialize(&mut page, &mut pos, &mut stream, 1000, &mut patches)
            .unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(pos, h.layout().record_size);

        let mut stream2 = Vec::new();
        let mut patches2 = PatchList::new();
        h.serialize(&mut page, &mut pos, &mut stream2, 1000, &mut patches2)
            .unwrap();
        assert_eq!(patches2.len(), 1);
    }

    #[test]
    fn object_info_covers_patched_records() {
        let h = handler();
        let payloads: Vec<&[u8]> = vec![b"aaaa", b"bbbbbbbb"];
        let mut page = make_page(&h, &payloads);

        let mut pos = 0;
        let mut stream = Vec::new();
        let mut patches = PatchList::new();
        h.serialize(&mut page, &mut pos, &mut stream, 1 << 20, &mut patches)
            .unwrap();

        let mut scan = 0;
        let range = h.object_info(&page, &mut scan, 1 << 20).unwrap().unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.len as usize, stream.len());
        assert_eq!(scan, page.len());

        assert!(h.object_info(&page, &mut scan, 1 << 20).unwrap().is_none());
    }

    #[test]
    fn clear_page_releases_handles() {
        let h = handler();
        let payloads: Vec<&[u8]> = vec![b"one", b"two"];
        let mut page = make_page(&h, &payloads);
        assert_eq!(h.live_objects(), 2);

        h.clear_page(&mut page);
        assert_eq!(h.live_objects(), 0);
    }

    #[test]
    fn null_records_are_skipped() {
        let h = handler();
        let rs = h.layout().record_size;
        let mut page = vec![0u8; rs * 3];
        // Only the middle record exists.
        let off = rs;
        RecordInfo::new(0, false).write_to(&mut page[off..]);
        let slot = off + h.layout().value_offset();
        h.set_payload(&mut page[slot..slot + 8], b"mid");

        let mut pos = 0;
        let mut stream = Vec::new();
        let mut patches = PatchList::new();
        h.serialize(&mut page, &mut pos, &mut stream, 1 << 20, &mut patches)
            .unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(stream.len(), 8 + 3);
    }

    #[test]
    fn wrong_value_width_is_rejected() {
        let cfg = LogConfig {
            key_len: 16,
            value_len: 16,
            ..LogConfig::default()
        };
        assert!(ByteObjectHandler::new(RecordLayout::from_config(&cfg)).is_err());
    }
}
