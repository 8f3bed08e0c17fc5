//! Bounded byte queue between the audio callback and the application.
//!
//! Each queue is a single-producer single-consumer `rtrb` ring sized to
//! `max_queue` blocks. One end lives inside the real-time callback and never
//! blocks; the other end is used by the application and blocks with bounded
//! polls. Closing and discarding are flags shared by both ends.
//!
//! Pushes may carry a capture time. Those marks ride in a second, small ring
//! keyed by byte position, so a pop can say when its first byte was captured.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use rtrb::{Consumer, Producer, RingBuffer};
use thiserror::Error;

/// Longest a blocked side sleeps before re-checking the ring.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Errors from the blocking side of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("frame queue closed")]
    Closed,
}

/// Why a non-blocking push did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPushError {
    /// Not enough room for the whole block.
    Full,

    /// The queue no longer accepts data.
    Closed,
}

/// Outcome of a blocking pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop<T = Bytes> {
    /// Up to the requested number of bytes, in order.
    Data(T),

    /// Closed and fully drained.
    EndOfStream,

    /// Nothing arrived before the deadline.
    Timeout,
}

/// Time marks kept per block of capacity.
const MARKS_PER_BLOCK: usize = 2;

/// Capture time of the byte at `position` (counted from the first push).
#[derive(Debug, Clone, Copy)]
struct Mark {
    position: u64,
    at: Duration,
}

/// When the first byte of a pop was captured: the time of the mark it falls
/// under and how many bytes past that mark it sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub at: Duration,
    pub offset: u64,
}

struct QueueShared {
    capacity: usize,
    queued: AtomicUsize,
    closed: AtomicBool,
    discarded: AtomicBool,
    waiters: AtomicUsize,
    lock: Mutex<()>,
    signal: Condvar,
}

impl QueueShared {
    fn park(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.signal.wait_for(&mut guard, timeout.min(POLL_INTERVAL));
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.signal.notify_all();
        }
    }
}

/// Control handle shared by the engine; does not own either end.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
}

impl QueueHandle {
    /// Stop accepting data. Queued bytes stay readable. Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify();
    }

    /// Close and drop everything queued.
    pub fn discard(&self) {
        self.shared.discarded.store(true, Ordering::SeqCst);
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Bytes currently queued.
    pub fn queued(&self) -> usize {
        if self.shared.discarded.load(Ordering::SeqCst) {
            0
        } else {
            self.shared.queued.load(Ordering::SeqCst)
        }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Blocks until the queue is empty or `cancel` returns true. Returns
    /// whether the queue emptied.
    pub fn wait_empty(&self, cancel: impl Fn() -> bool) -> bool {
        loop {
            if cancel() {
                return false;
            }
            if self.queued() == 0 {
                return true;
            }
            self.shared.park(POLL_INTERVAL);
        }
    }
}

/// Producer end.
pub struct QueueWriter {
    producer: Producer<u8>,
    marks: Producer<Mark>,
    written: u64,
    shared: Arc<QueueShared>,
}

/// Consumer end.
pub struct QueueReader {
    consumer: Consumer<u8>,
    marks: Consumer<Mark>,
    consumed: u64,
    current: Option<Mark>,
    shared: Arc<QueueShared>,
}

/// Creates a queue holding at most `max_queue` blocks of `block_bytes` each.
pub fn frame_queue(max_queue: usize, block_bytes: usize) -> (QueueWriter, QueueReader) {
    stamped_queue(max_queue, block_bytes, 1)
}

/// Like [`frame_queue`], with room for `pieces` stamped pushes per block.
pub fn stamped_queue(
    max_queue: usize,
    block_bytes: usize,
    pieces: usize,
) -> (QueueWriter, QueueReader) {
    let blocks = max_queue.max(1);
    let capacity = blocks * block_bytes.max(1);
    let (producer, consumer) = RingBuffer::<u8>::new(capacity);
    let (mark_producer, mark_consumer) =
        RingBuffer::<Mark>::new(blocks * pieces.max(1) * MARKS_PER_BLOCK);
    let shared = Arc::new(QueueShared {
        capacity,
        queued: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        discarded: AtomicBool::new(false),
        waiters: AtomicUsize::new(0),
        lock: Mutex::new(()),
        signal: Condvar::new(),
    });

    (
        QueueWriter {
            producer,
            marks: mark_producer,
            written: 0,
            shared: Arc::clone(&shared),
        },
        QueueReader {
            consumer,
            marks: mark_consumer,
            consumed: 0,
            current: None,
            shared,
        },
    )
}

impl QueueWriter {
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Pushes the whole block or nothing. Never blocks.
    pub fn try_push(&mut self, block: &[u8]) -> Result<(), TryPushError> {
        self.push_block(block, None)
    }

    /// Like [`try_push`](Self::try_push), recording when the block's first
    /// byte was captured. Never allocates.
    pub fn try_push_stamped(&mut self, block: &[u8], at: Duration) -> Result<(), TryPushError> {
        self.push_block(block, Some(at))
    }

    fn push_block(&mut self, block: &[u8], at: Option<Duration>) -> Result<(), TryPushError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TryPushError::Closed);
        }
        if self.producer.slots() < block.len() {
            return Err(TryPushError::Full);
        }
        if let Some(at) = at {
            // No room: the reader extrapolates from the previous mark.
            let _ = self.marks.push(Mark {
                position: self.written,
                at,
            });
        }
        self.write(block);
        Ok(())
    }

    /// Pushes all of `data`, waiting for space as needed.
    pub fn push(&mut self, mut data: &[u8]) -> Result<(), QueueError> {
        while !data.is_empty() {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            let n = self.producer.slots().min(data.len());
            if n == 0 {
                self.shared.park(POLL_INTERVAL);
                continue;
            }
            self.write(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    /// Caller has checked that `data` fits.
    fn write(&mut self, data: &[u8]) {
        if let Ok(mut chunk) = self.producer.write_chunk(data.len()) {
            let (first, second) = chunk.as_mut_slices();
            let split = first.len();
            first.copy_from_slice(&data[..split]);
            second.copy_from_slice(&data[split..]);
            chunk.commit_all();
            self.written += data.len() as u64;
            self.shared.queued.fetch_add(data.len(), Ordering::SeqCst);
            self.shared.notify();
        }
    }
}

impl QueueReader {
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Waits for up to `max` bytes; `max == 0` takes whatever is queued.
    /// `None` waits without a deadline.
    pub fn pop(&mut self, max: usize, timeout: Option<Duration>) -> Pop {
        self.pop_stamped(max, timeout).0
    }

    /// Like [`pop`](Self::pop), also returning when the first byte was
    /// captured if the writer stamped its pushes.
    pub fn pop_stamped(&mut self, max: usize, timeout: Option<Duration>) -> (Pop, Option<Stamp>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.drop_if_discarded() {
                return (Pop::EndOfStream, None);
            }

            // Read the flag before the ring so a close racing with a final
            // push is not mistaken for end of stream.
            let closed = self.shared.closed.load(Ordering::Acquire);
            let available = self.consumer.slots();
            if available > 0 {
                let n = if max == 0 { available } else { available.min(max) };
                let stamp = self.stamp();
                let mut out = vec![0u8; n];
                self.read_into(&mut out);
                return (Pop::Data(Bytes::from(out)), stamp);
            }
            if closed {
                return (Pop::EndOfStream, None);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (Pop::Timeout, None);
                    }
                    deadline - now
                }
                None => POLL_INTERVAL,
            };
            self.shared.park(wait);
        }
    }

    /// Copies as many queued bytes as fit into `out`. Never blocks or allocates.
    pub fn try_pop_into(&mut self, out: &mut [u8]) -> usize {
        if self.drop_if_discarded() {
            return 0;
        }
        let n = self.consumer.slots().min(out.len());
        if n == 0 {
            return 0;
        }
        self.read_into(&mut out[..n]);
        n
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stamp of the next unread byte.
    fn stamp(&mut self) -> Option<Stamp> {
        loop {
            let next = match self.marks.peek() {
                Ok(mark) if mark.position <= self.consumed => *mark,
                _ => break,
            };
            self.current = Some(next);
            let _ = self.marks.pop();
        }
        self.current.map(|mark| Stamp {
            at: mark.at,
            offset: self.consumed - mark.position,
        })
    }

    fn read_into(&mut self, out: &mut [u8]) {
        if let Ok(chunk) = self.consumer.read_chunk(out.len()) {
            let (first, second) = chunk.as_slices();
            out[..first.len()].copy_from_slice(first);
            out[first.len()..].copy_from_slice(second);
            chunk.commit_all();
            self.consumed += out.len() as u64;
            self.shared.queued.fetch_sub(out.len(), Ordering::SeqCst);
            self.shared.notify();
        }
    }

    fn drop_if_discarded(&mut self) -> bool {
        if !self.shared.discarded.load(Ordering::Acquire) {
            return false;
        }
        let n = self.consumer.slots();
        if n > 0 {
            if let Ok(chunk) = self.consumer.read_chunk(n) {
                chunk.commit_all();
                self.consumed += n as u64;
                self.shared.queued.fetch_sub(n, Ordering::SeqCst);
            }
        }
        while self.marks.pop().is_ok() {}
        self.current = None;
        self.shared.notify();
        true
    }
}
