//! # Device Error Propagation Tests
//!
//! A failing object-log write must surface its error code to the flush
//! observer unchanged, and the page's slot must still be released so the
//! ring keeps turning.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;

use pagelog::handler::RecordLayout;
use pagelog::{
    ByteObjectHandler, ImmediateEpoch, LogAllocator, LogConfig, MemDevice, RecordInfo,
    StorageDevice,
};

const PAGE_BITS: u32 = 14;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;

struct Fixture {
    log: LogAllocator,
    handler: Arc<ByteObjectHandler>,
    object_device: Arc<MemDevice>,
}

fn fixture() -> Fixture {
    let cfg = LogConfig {
        page_size_bits: PAGE_BITS,
        buffer_size: 8,
        sector_size: 512,
        key_len: 16,
        value_len: 8,
        mutable_pages: 8,
        ..LogConfig::default()
    };
    let handler = Arc::new(ByteObjectHandler::new(RecordLayout::from_config(&cfg)).unwrap());
    let object_device = Arc::new(MemDevice::new(512));
    let object_log: Arc<dyn StorageDevice> = object_device.clone();
    let log = LogAllocator::new(
        cfg,
        handler.clone(),
        Arc::new(ImmediateEpoch),
        Arc::new(MemDevice::new(512)),
        Some(object_log),
    )
    .unwrap();
    Fixture {
        log,
        handler,
        object_device,
    }
}

fn populate_page_zero(fx: &Fixture) {
    let layout = fx.log.record_layout();
    for i in 0..8usize {
        let addr = fx.log.allocate(layout.record_size).unwrap();
        // SAFETY: freshly allocated, single-threaded test.
        let record = unsafe { fx.log.record_bytes_mut(addr) };
        let slot = layout.value_offset();
        fx.handler
            .set_payload(&mut record[slot..slot + 8], &vec![i as u8; 700]);
        RecordInfo::new(0, false).write_to(record);
    }
    while fx.log.tail_address() < PAGE_SIZE {
        fx.log.allocate(layout.record_size).unwrap();
    }
}

#[test]
fn object_log_error_reaches_the_flush_observer_unchanged() {
    let fx = fixture();
    populate_page_zero(&fx);

    let events: Arc<Mutex<Vec<(u64, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        fx.log.set_flush_callback(Arc::new(move |page, code| {
            events.lock().push((page, code));
        }));
    }

    fx.object_device.fail_next_write(5);
    fx.log.shift_read_only(PAGE_SIZE);

    let observed = events.lock().clone();
    assert_eq!(observed, vec![(0, 5)], "error code must surface unchanged");
}

#[test]
fn slot_is_released_despite_the_error() {
    let fx = fixture();
    populate_page_zero(&fx);

    fx.object_device.fail_next_write(5);
    fx.log.shift_read_only(PAGE_SIZE);

    // The status machine still advanced: durability bookkeeping moved past
    // the page and the slot can retire and be reclaimed.
    assert!(fx.log.flushed_until_address() >= PAGE_SIZE);
    fx.log.shift_head(PAGE_SIZE);
    assert_eq!(fx.log.head_address(), PAGE_SIZE);

    // Claiming the slot for a read-in proves it reads (Flushed, Closed);
    // the read itself reports a failure because the object bytes never
    // landed, which is the surfaced-not-retried contract.
    let (tx, rx) = mpsc::channel();
    fx.log
        .read_page_async(
            0,
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .expect("slot must be reclaimable after a failed flush");
    let code = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_ne!(code, 0, "missing object bytes cannot reinflate silently");
}

#[test]
fn later_flushes_recover_after_an_error() {
    let fx = fixture();
    populate_page_zero(&fx);

    let events: Arc<Mutex<Vec<(u64, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        fx.log.set_flush_callback(Arc::new(move |page, code| {
            events.lock().push((page, code));
        }));
    }

    fx.object_device.fail_next_write(5);
    fx.log.shift_read_only(PAGE_SIZE);

    // Page one gets records and flushes cleanly afterwards.
    let layout = fx.log.record_layout();
    for i in 0..4usize {
        let addr = fx.log.allocate(layout.record_size).unwrap();
        let record = unsafe { fx.log.record_bytes_mut(addr) };
        let slot = layout.value_offset();
        fx.handler
            .set_payload(&mut record[slot..slot + 8], &vec![i as u8; 300]);
        RecordInfo::new(0, false).write_to(record);
    }
    fx.log.shift_read_only_to_tail();

    let observed = events.lock().clone();
    assert_eq!(observed[0], (0, 5));
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[1].0, 1);
    assert_eq!(observed[1].1, 0, "the failure must not poison later flushes");
}
