//! File-backed segmented device with a worker-thread pool.
//!
//! The flat offset space is split into fixed-size segments, one file per
//! segment (`<base>.<segment>`), created on first write. A small pool of
//! worker threads drains a job queue and performs positioned I/O with
//! `read_at`/`write_at`, invoking each job's completion from the worker.
//!
//! Files can optionally be opened with `O_DIRECT` to bypass the OS page
//! cache; every transfer this crate issues is sector-aligned at both ends,
//! which is exactly what direct I/O requires.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use super::{IoCompletion, IoSource, IoTarget, StorageDevice, ERR_IO, ERR_OK};
use crate::config::{DEFAULT_IO_WORKERS, DEFAULT_SECTOR_SIZE};

#[derive(Debug, Clone)]
pub struct FileDeviceOptions {
    /// Sector size reported to callers and required of all transfers.
    pub sector_size: usize,
    /// Segment size as a power of two (default 1 GiB).
    pub segment_size_bits: u32,
    /// Worker threads servicing the job queue.
    pub io_workers: usize,
    /// Open segment files with `O_DIRECT` (unix only).
    pub direct_io: bool,
}

impl Default for FileDeviceOptions {
    fn default() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
            segment_size_bits: 30,
            io_workers: DEFAULT_IO_WORKERS,
            direct_io: false,
        }
    }
}

enum Job {
    Write {
        segment: u64,
        offset: u64,
        source: IoSource,
        completion: IoCompletion,
    },
    Read {
        segment: u64,
        offset: u64,
        target: IoTarget,
        completion: IoCompletion,
    },
    Shutdown,
}

struct DeviceState {
    dir: PathBuf,
    base: String,
    direct_io: bool,
    files: RwLock<HashMap<u64, Arc<File>>>,
}

impl DeviceState {
    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base, segment))
    }

    fn segment_file(&self, segment: u64) -> Result<Arc<File>> {
        if let Some(file) = self.files.read().get(&segment) {
            return Ok(Arc::clone(file));
        }

        let mut files = self.files.write();
        if let Some(file) = files.get(&segment) {
            return Ok(Arc::clone(file));
        }

        let path = self.segment_path(segment);
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);

        #[cfg(unix)]
        if self.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }

        let file = Arc::new(
            options
                .open(&path)
                .wrap_err_with(|| format!("failed to open log segment at {:?}", path))?,
        );
        files.insert(segment, Arc::clone(&file));
        Ok(file)
    }

    fn run_job(&self, job: Job) -> bool {
        match job {
            Job::Shutdown => return false,
            Job::Write {
                segment,
                offset,
                source,
                completion,
            } => {
                let (code, bytes) = self.do_write(segment, offset, source);
                completion(code, bytes);
            }
            Job::Read {
                segment,
                offset,
                target,
                completion,
            } => {
                let (code, bytes) = self.do_read(segment, offset, target);
                completion(code, bytes);
            }
        }
        true
    }

    fn do_write(&self, segment: u64, offset: u64, source: IoSource) -> (u32, usize) {
        use std::os::unix::fs::FileExt;

        let file = match self.segment_file(segment) {
            Ok(file) => file,
            Err(err) => {
                log::error!("segment {} open failed: {err:#}", segment);
                return (ERR_IO, 0);
            }
        };

        // SAFETY: the IoSource contract guarantees the region is valid and
        // unmutated until this job's completion fires.
        let data = unsafe { source.as_slice() };
        match file.write_all_at(data, offset) {
            Ok(()) => (ERR_OK, data.len()),
            Err(err) => {
                log::error!(
                    "write of {} bytes to segment {} @ {} failed: {}",
                    data.len(),
                    segment,
                    offset,
                    err
                );
                (err.raw_os_error().map(|e| e as u32).unwrap_or(ERR_IO), 0)
            }
        }
    }

    fn do_read(&self, segment: u64, offset: u64, target: IoTarget) -> (u32, usize) {
        use std::os::unix::fs::FileExt;

        let file = match self.segment_file(segment) {
            Ok(file) => file,
            Err(err) => {
                log::error!("segment {} open failed: {err:#}", segment);
                return (ERR_IO, 0);
            }
        };

        // SAFETY: the IoTarget contract guarantees exclusive, valid access
        // to the region until this job's completion fires.
        let buf = unsafe { target.as_mut_slice() };
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!(
                        "read of {} bytes from segment {} @ {} failed: {}",
                        buf.len(),
                        segment,
                        offset,
                        err
                    );
                    return (err.raw_os_error().map(|e| e as u32).unwrap_or(ERR_IO), filled);
                }
            }
        }
        (ERR_OK, filled)
    }
}

/// Segmented file device; see the module docs.
pub struct FileDevice {
    state: Arc<DeviceState>,
    sector_size: usize,
    segment_size_bits: u32,
    sender: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FileDevice {
    /// Opens (creating if needed) a device rooted at `dir`, with segment
    /// files named `<base>.<segment>`.
    pub fn open<P: AsRef<Path>>(dir: P, base: &str, options: FileDeviceOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create device directory at {:?}", dir))?;

        let state = Arc::new(DeviceState {
            dir,
            base: base.to_string(),
            direct_io: options.direct_io,
            files: RwLock::new(HashMap::new()),
        });

        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let worker_count = options.io_workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let state = Arc::clone(&state);
            let receiver: Arc<Mutex<Receiver<Job>>> = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("pagelog-io-{i}"))
                .spawn(move || loop {
                    let job = {
                        let guard = receiver.lock();
                        guard.recv()
                    };
                    match job {
                        Ok(job) => {
                            if !state.run_job(job) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                })
                .wrap_err("failed to spawn device worker thread")?;
            workers.push(handle);
        }

        Ok(Self {
            state,
            sector_size: options.sector_size,
            segment_size_bits: options.segment_size_bits,
            sender,
            workers: Mutex::new(workers),
        })
    }

    fn submit(&self, job: Job) {
        // The queue only disconnects during Drop, after which no operations
        // are submitted.
        let _ = self.sender.send(job);
    }

    #[inline]
    fn split(&self, offset: u64) -> (u64, u64) {
        (
            offset >> self.segment_size_bits,
            offset & ((1u64 << self.segment_size_bits) - 1),
        )
    }
}

impl StorageDevice for FileDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn segment_size(&self) -> u64 {
        1u64 << self.segment_size_bits
    }

    fn write_async(&self, source: IoSource, offset: u64, completion: IoCompletion) {
        let (segment, intra) = self.split(offset);
        debug_assert!(
            intra + source.len() as u64 <= self.segment_size(),
            "write straddles a segment boundary"
        );
        self.write_segment_async(segment, intra, source, completion);
    }

    fn read_async(&self, offset: u64, target: IoTarget, completion: IoCompletion) {
        let (segment, intra) = self.split(offset);
        debug_assert!(
            intra + target.len() as u64 <= self.segment_size(),
            "read straddles a segment boundary"
        );
        self.read_segment_async(segment, intra, target, completion);
    }

    fn write_segment_async(
        &self,
        segment: u64,
        offset: u64,
        source: IoSource,
        completion: IoCompletion,
    ) {
        self.submit(Job::Write {
            segment,
            offset,
            source,
            completion,
        });
    }

    fn read_segment_async(
        &self,
        segment: u64,
        offset: u64,
        target: IoTarget,
        completion: IoCompletion,
    ) {
        self.submit(Job::Read {
            segment,
            offset,
            target,
            completion,
        });
    }

    fn delete_segment_range(&self, from: u64, to: u64) -> Result<()> {
        let mut files = self.state.files.write();
        for segment in from..to {
            files.remove(&segment);
            let path = self.state.segment_path(segment);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .wrap_err_with(|| format!("failed to delete segment at {:?}", path));
                }
            }
        }
        Ok(())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(Job::Shutdown);
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}
