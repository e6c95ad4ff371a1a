//! # Object Payload Tests
//!
//! Records whose value is an out-of-line byte string: write a grid of
//! payload sizes, flush through the object log, verify the on-disk
//! back-references, then read the page back and check payload equality.
//! A second group shrinks the object block size so one page flush spans
//! several object-log writes.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use pagelog::handler::RecordLayout;
use pagelog::record::AddressInfo;
use pagelog::{ByteObjectHandler, ImmediateEpoch, LogAllocator, LogConfig, MemDevice, RecordInfo};

const PAGE_BITS: u32 = 16;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const SECTOR: usize = 512;

fn config(object_block_size: usize) -> LogConfig {
    LogConfig {
        page_size_bits: PAGE_BITS,
        buffer_size: 8,
        sector_size: SECTOR,
        key_len: 16,
        value_len: 8,
        mutable_pages: 8,
        object_block_size,
        ..LogConfig::default()
    }
}

struct Fixture {
    log: LogAllocator,
    handler: Arc<ByteObjectHandler>,
    device: Arc<MemDevice>,
    object_device: Arc<MemDevice>,
}

fn fixture(object_block_size: usize) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = config(object_block_size);
    let handler = Arc::new(ByteObjectHandler::new(RecordLayout::from_config(&cfg)).unwrap());
    let device = Arc::new(MemDevice::new(SECTOR));
    let object_device = Arc::new(MemDevice::new(SECTOR));
    let object_log: Arc<dyn pagelog::StorageDevice> = object_device.clone();
    let log = LogAllocator::new(
        cfg,
        handler.clone(),
        Arc::new(ImmediateEpoch),
        device.clone(),
        Some(object_log),
    )
    .unwrap();
    Fixture {
        log,
        handler,
        device,
        object_device,
    }
}

/// Writes one record with `payload` attached; returns its address.
fn write_record(fx: &Fixture, payload: &[u8]) -> u64 {
    let layout = fx.log.record_layout();
    let addr = fx.log.allocate(layout.record_size).unwrap();
    // SAFETY: freshly allocated, single-threaded test.
    let record = unsafe { fx.log.record_bytes_mut(addr) };
    for (i, byte) in record[layout.key_offset()..layout.key_offset() + layout.key_len]
        .iter_mut()
        .enumerate()
    {
        *byte = (addr as u8) ^ (i as u8);
    }
    let slot = layout.value_offset();
    fx.handler.set_payload(&mut record[slot..slot + 8], payload);
    RecordInfo::new(1, false).write_to(record);
    addr
}

/// Crosses the tail into page one, flushes page zero, and waits for
/// durability.
fn flush_page_zero(fx: &Fixture) {
    let layout = fx.log.record_layout();
    while fx.log.tail_address() < PAGE_SIZE {
        fx.log.allocate(layout.record_size).unwrap();
    }
    fx.log.shift_read_only(PAGE_SIZE);
    fx.log
        .wait_for_flush(PAGE_SIZE, Duration::from_secs(30))
        .unwrap();
}

fn read_page_zero_back(fx: &Fixture) {
    fx.log.shift_head(PAGE_SIZE);
    assert_eq!(fx.log.head_address(), PAGE_SIZE);

    let (tx, rx) = mpsc::channel();
    fx.log
        .read_page_async(
            0,
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(30)).unwrap(), 0);
}

fn payload_of(fx: &Fixture, addr: u64) -> Option<Vec<u8>> {
    let layout = fx.log.record_layout();
    // SAFETY: the page is resident and quiescent.
    let record = unsafe { fx.log.record_bytes(addr) };
    let slot = layout.value_offset();
    fx.handler.payload(&record[slot..slot + 8])
}

/// The payload length grid from the write/read scenario; exercises empty
/// payloads, sector-straddling lengths, and a 1 MiB extreme.
fn payload_lengths() -> Vec<usize> {
    let grid = [0usize, 1, 63, 64, 65, 1024, 1 << 20];
    (0..1000).map(|i| grid[i % grid.len()]).collect()
}

#[test]
fn thousand_payloads_roundtrip_through_the_object_log() {
    let fx = fixture(8 * 1024 * 1024);
    let lengths = payload_lengths();

    let mut addrs = Vec::with_capacity(lengths.len());
    let mut payloads = Vec::with_capacity(lengths.len());
    for (i, &len) in lengths.iter().enumerate() {
        let payload: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();
        addrs.push(write_record(&fx, &payload));
        payloads.push(payload);
    }
    assert_eq!(fx.handler.live_objects(), lengths.len());

    flush_page_zero(&fx);

    // Object-log writes are append-only, sector-aligned, and consecutive;
    // the segment offset is exactly their aligned sum.
    let writes = fx.object_device.writes();
    assert!(!writes.is_empty());
    let mut expected_offset = 0u64;
    for write in &writes {
        assert_eq!(write.segment, 0);
        assert_eq!(write.offset % SECTOR as u64, 0);
        assert_eq!(write.len % SECTOR, 0);
        assert_eq!(write.offset, expected_offset);
        expected_offset += write.len as u64;
    }
    assert_eq!(fx.log.segment_offset(0), expected_offset);

    // On-disk back-references point at the serialized bytes (length prefix
    // plus payload) in the object log.
    let layout = fx.log.record_layout();
    let page_image = fx.device.segment_bytes(0);
    let object_image = fx.object_device.segment_bytes(0);
    for (i, &addr) in addrs.iter().enumerate().step_by(97) {
        let record = &page_image[addr as usize..addr as usize + layout.record_size];
        let slot = layout.value_offset();
        let info = AddressInfo::from_bytes(&record[slot..slot + 8]);
        assert!(!info.is_null());
        assert_eq!(info.size() as usize, 8 + payloads[i].len());

        let at = info.offset() as usize;
        let len = u64::from_le_bytes(object_image[at..at + 8].try_into().unwrap()) as usize;
        assert_eq!(len, payloads[i].len());
        assert_eq!(&object_image[at + 8..at + 8 + len], &payloads[i][..]);
    }

    read_page_zero_back(&fx);
    assert_eq!(fx.handler.live_objects(), lengths.len());

    for (i, &addr) in addrs.iter().enumerate() {
        let restored = payload_of(&fx, addr).expect("payload lost in roundtrip");
        assert_eq!(restored, payloads[i], "payload {} diverged", i);

        // Non-object fields survive byte-identical.
        let record = unsafe { fx.log.record_bytes(addr) };
        for (j, byte) in record
            [layout.key_offset()..layout.key_offset() + layout.key_len]
            .iter()
            .enumerate()
        {
            assert_eq!(*byte, (addr as u8) ^ (j as u8));
        }
    }
}

#[test]
fn flush_spanning_multiple_object_blocks() {
    // 4 KiB blocks force many object-log writes for one page.
    let fx = fixture(4096);

    let mut addrs = Vec::new();
    let mut payloads = Vec::new();
    for i in 0..50usize {
        let payload: Vec<u8> = (0..1500).map(|j| (i * 31 + j) as u8).collect();
        addrs.push(write_record(&fx, &payload));
        payloads.push(payload);
    }

    flush_page_zero(&fx);

    let writes = fx.object_device.writes();
    assert!(
        writes.len() >= 10,
        "a 4 KiB block holds two 1508-byte entries; 50 records need many writes, got {}",
        writes.len()
    );
    for write in &writes {
        assert_eq!(write.offset % SECTOR as u64, 0);
        assert_eq!(write.len % SECTOR, 0);
    }

    read_page_zero_back(&fx);

    for (i, &addr) in addrs.iter().enumerate() {
        let restored = payload_of(&fx, addr).expect("payload lost across blocks");
        assert_eq!(restored, payloads[i]);
    }
}

#[test]
fn snapshot_flush_is_dense_and_self_contained() {
    use std::sync::atomic::AtomicU64;

    let fx = fixture(1 << 20);
    let layout = fx.log.record_layout();

    // Page 0 is filler; the snapshot covers page 1 only.
    while fx.log.tail_address() < PAGE_SIZE {
        fx.log.allocate(layout.record_size).unwrap();
    }
    let mut addrs = Vec::new();
    let mut payloads = Vec::new();
    for i in 0..20usize {
        let payload: Vec<u8> = (0..900).map(|j| (i * 7 + j) as u8).collect();
        addrs.push(write_record(&fx, &payload));
        payloads.push(payload);
    }
    while fx.log.tail_address() < 2 * PAGE_SIZE {
        fx.log.allocate(layout.record_size).unwrap();
    }
    fx.log.shift_read_only(2 * PAGE_SIZE);

    let snap_device = Arc::new(MemDevice::new(SECTOR));
    let snap_objects = Arc::new(MemDevice::new(SECTOR));
    let offsets: Arc<Vec<AtomicU64>> = Arc::new((0..16).map(|_| AtomicU64::new(0)).collect());

    let (tx, rx) = mpsc::channel();
    let snap_device_dyn: Arc<dyn pagelog::StorageDevice> = snap_device.clone();
    let snap_objects_dyn: Arc<dyn pagelog::StorageDevice> = snap_objects.clone();
    fx.log
        .flush_pages_to(
            1,
            2,
            snap_device_dyn,
            Some(snap_objects_dyn),
            Arc::clone(&offsets),
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(30)).unwrap(), 0);

    // Dense placement: page 1 lands at snapshot offset zero.
    let page_writes = snap_device.writes();
    assert_eq!(page_writes.len(), 1);
    assert_eq!(page_writes[0].offset, 0);
    assert_eq!(page_writes[0].len as u64, PAGE_SIZE);

    // The caller-supplied offset table took the reservations, not the
    // live one; the live table only carries what ring flushes consumed.
    let segment = 1 >> 3; // page 1's object-log segment
    assert!(offsets[segment as usize].load(std::sync::atomic::Ordering::Acquire) > 0);

    // The snapshot is self-contained: records resolve against the
    // snapshot object device alone.
    let page_image = snap_device.segment_bytes(0);
    let object_image = snap_objects.segment_bytes(0);
    for (i, &addr) in addrs.iter().enumerate() {
        let at = (addr - PAGE_SIZE) as usize;
        let record = &page_image[at..at + layout.record_size];
        let slot = layout.value_offset();
        let info = AddressInfo::from_bytes(&record[slot..slot + 8]);
        assert!(!info.is_null());

        let pos = info.offset() as usize;
        let len = u64::from_le_bytes(object_image[pos..pos + 8].try_into().unwrap()) as usize;
        assert_eq!(len, payloads[i].len());
        assert_eq!(&object_image[pos + 8..pos + 8 + len], &payloads[i][..]);
    }
}

#[test]
fn segment_offsets_grow_until_segment_close() {
    let fx = fixture(1 << 20);

    for i in 0..10usize {
        write_record(&fx, &vec![i as u8; 2000]);
    }
    assert_eq!(fx.log.segment_offset(0), 0);

    flush_page_zero(&fx);
    let after_first = fx.log.segment_offset(0);
    assert!(after_first > 0);

    // More records, flushed later, only append.
    for i in 0..10usize {
        write_record(&fx, &vec![i as u8; 2000]);
    }
    fx.log.shift_read_only_to_tail();
    assert!(fx.log.segment_offset(0) >= after_first);

    fx.log.segment_closed(0);
    assert_eq!(fx.log.segment_offset(0), 0);
}
