//! Asynchronous file reads on a small worker pool.
//!
//! Requests name a file, an offset, a byte count (optionally split into
//! segments, one per mip) and a destination buffer; workers pull them off a
//! mutex+condvar queue, read segment by segment, and park the result in a
//! completion map. Completion callbacks do not run on the worker — they
//! fire on whichever thread calls `drain_completed`, so callers control the
//! thread their logic runs on.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use fxhash::FxHashMap;

/// Raw destination for a read, typically pointing into the texture pool.
///
/// The caller guarantees the region stays valid and unaliased until the
/// request completes or is cancelled.
pub struct DestBuffer {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for DestBuffer {}

impl DestBuffer {
    /// Safety: `ptr` must be valid for writes of `len` bytes for the
    /// lifetime of the request.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> DestBuffer {
        DestBuffer { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

pub type CompletionFn = Box<dyn FnOnce(bool, usize) + Send>;

/// One read request.
pub struct ReadRequest {
    pub path: PathBuf,
    pub offset: u64,
    pub size: usize,
    /// Segment lengths within the span (one per mip for streaming reads).
    /// The worker copies segment by segment and observes cancellation
    /// between copies. Empty means one segment of `size`; when present the
    /// lengths must sum to `size`.
    pub segments: Vec<usize>,
    pub dest: DestBuffer,
    /// Invoked with `(success, bytes_read)` during `drain_completed`.
    pub on_complete: CompletionFn,
}

/// Cancellation handle for a submitted request.
#[derive(Clone)]
pub struct RequestHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests cancellation; workers observe the flag before starting,
    /// between segment copies, and after the read, and short-circuit.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct QueuedRequest {
    id: u64,
    request: ReadRequest,
    cancelled: Arc<AtomicBool>,
}

enum Outcome {
    Done { success: bool, bytes_read: usize },
    Cancelled,
}

struct CompletedRequest {
    outcome: Outcome,
    callback: Option<CompletionFn>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IoStats {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub pending_requests: u64,
    pub total_bytes_read: u64,
}

struct IoShared {
    queue: Mutex<VecDeque<QueuedRequest>>,
    queue_cv: Condvar,
    completed: Mutex<FxHashMap<u64, CompletedRequest>>,
    completed_cv: Condvar,
    shutting_down: AtomicBool,
    in_flight: AtomicU64,
    total_requests: AtomicU64,
    completed_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_bytes_read: AtomicU64,
}

impl IoShared {
    fn finish(&self, id: u64, outcome: Outcome, callback: CompletionFn) {
        if let Outcome::Done {
            success,
            bytes_read,
        } = outcome
        {
            if success {
                self.completed_requests.fetch_add(1, Ordering::Relaxed);
                self.total_bytes_read
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            } else {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.completed.lock().unwrap().insert(
            id,
            CompletedRequest {
                outcome,
                callback: Some(callback),
            },
        );
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.completed_cv.notify_all();
    }
}

pub struct AsyncFileIo {
    shared: Arc<IoShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

fn worker_loop(shared: Arc<IoShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if shared.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.queue_cv.wait(queue).unwrap();
            }
        };

        let QueuedRequest {
            id,
            mut request,
            cancelled,
        } = job;

        if cancelled.load(Ordering::Acquire) {
            shared.finish(id, Outcome::Cancelled, request.on_complete);
            continue;
        }

        let result = read_into(
            &request.path,
            request.offset,
            request.size,
            &request.segments,
            &mut request.dest,
            &cancelled,
        );

        let outcome = match result {
            Ok(ReadStatus::Cancelled) => Outcome::Cancelled,
            Ok(ReadStatus::Complete(bytes_read)) => {
                // Cancellation raced the read: report cancelled, not the
                // payload.
                if cancelled.load(Ordering::Acquire) {
                    Outcome::Cancelled
                } else {
                    Outcome::Done {
                        success: true,
                        bytes_read,
                    }
                }
            }
            Err(err) => {
                log::warn!(
                    target: "gfx-io",
                    "read of {:?} at {} failed: {err}",
                    request.path,
                    request.offset
                );
                if cancelled.load(Ordering::Acquire) {
                    Outcome::Cancelled
                } else {
                    Outcome::Done {
                        success: false,
                        bytes_read: 0,
                    }
                }
            }
        };
        shared.finish(id, outcome, request.on_complete);
    }
}

enum ReadStatus {
    Complete(usize),
    Cancelled,
}

fn read_into(
    path: &PathBuf,
    offset: u64,
    size: usize,
    segments: &[usize],
    dest: &mut DestBuffer,
    cancelled: &AtomicBool,
) -> std::io::Result<ReadStatus> {
    if size > dest.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "destination buffer smaller than request",
        ));
    }
    if !segments.is_empty() && segments.iter().sum::<usize>() != size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "segment lengths do not sum to request size",
        ));
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let buffer = &mut dest.as_mut_slice()[..size];

    if segments.is_empty() {
        // A short read is a failure; streaming depends on whole mip ranges.
        file.read_exact(buffer)?;
        return Ok(ReadStatus::Complete(size));
    }

    let mut cursor = 0usize;
    for (i, &len) in segments.iter().enumerate() {
        if i > 0 && cancelled.load(Ordering::Acquire) {
            return Ok(ReadStatus::Cancelled);
        }
        file.read_exact(&mut buffer[cursor..cursor + len])?;
        cursor += len;
    }
    Ok(ReadStatus::Complete(size))
}

impl AsyncFileIo {
    /// Spawns `workers` reader threads.
    pub fn new(workers: u32) -> Arc<AsyncFileIo> {
        let workers = workers.max(1);
        let shared = Arc::new(IoShared {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            completed: Mutex::new(FxHashMap::default()),
            completed_cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            completed_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_bytes_read: AtomicU64::new(0),
        });
        let handles = (0..workers)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name("gfx-io".to_owned())
                    .spawn(move || worker_loop(shared))
                    .expect("spawning io worker")
            })
            .collect();
        log::info!(target: "gfx-io", "async file io initialized with {workers} workers");
        Arc::new(AsyncFileIo {
            shared,
            workers: Mutex::new(handles),
            next_id: AtomicU64::new(1),
        })
    }

    /// Submits a read; the request id on the returned handle orders with
    /// submission.
    pub fn read_async(&self, request: ReadRequest) -> RequestHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.shared.total_requests.fetch_add(1, Ordering::Relaxed);
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(QueuedRequest {
                id,
                request,
                cancelled: Arc::clone(&cancelled),
            });
        }
        self.shared.queue_cv.notify_one();
        RequestHandle { id, cancelled }
    }

    /// True once the worker has finished (or cancelled) the request. The
    /// callback may still be waiting for a drain.
    pub fn is_complete(&self, id: u64) -> bool {
        self.shared.completed.lock().unwrap().contains_key(&id)
    }

    /// Blocks until the request has been processed by a worker.
    pub fn wait_for_request(&self, id: u64) -> bool {
        let mut completed = self.shared.completed.lock().unwrap();
        while !completed.contains_key(&id) {
            completed = self.shared.completed_cv.wait(completed).unwrap();
        }
        matches!(
            completed[&id].outcome,
            Outcome::Done { success: true, .. }
        )
    }

    /// Blocks until every submitted request has been processed.
    pub fn wait_for_all(&self) {
        let mut completed = self.shared.completed.lock().unwrap();
        while self.shared.in_flight.load(Ordering::Acquire) > 0 {
            completed = self.shared.completed_cv.wait(completed).unwrap();
        }
        drop(completed);
    }

    /// Invokes pending completion callbacks on the calling thread and
    /// returns how many ran. Completed records stay behind (minus their
    /// callback) so `is_complete` keeps answering.
    pub fn drain_completed(&self) -> usize {
        let ready: Vec<(CompletionFn, bool, usize)> = {
            let mut completed = self.shared.completed.lock().unwrap();
            completed
                .values_mut()
                .filter_map(|record| {
                    let callback = record.callback.take()?;
                    match record.outcome {
                        Outcome::Done {
                            success,
                            bytes_read,
                        } => Some((callback, success, bytes_read)),
                        Outcome::Cancelled => Some((callback, false, 0)),
                    }
                })
                .collect()
        };
        let count = ready.len();
        for (callback, success, bytes_read) in ready {
            callback(success, bytes_read);
        }
        count
    }

    pub fn stats(&self) -> IoStats {
        IoStats {
            total_requests: self.shared.total_requests.load(Ordering::Relaxed),
            completed_requests: self.shared.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.shared.failed_requests.load(Ordering::Relaxed),
            pending_requests: self.shared.in_flight.load(Ordering::Acquire),
            total_bytes_read: self.shared.total_bytes_read.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AsyncFileIo {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}
