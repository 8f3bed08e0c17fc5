//! Stream counters.

use std::sync::atomic::{AtomicU64, Ordering};

use audioio_types::StreamStats;

/// Counters shared between the callback, the supervisor and the
/// application threads. Every update is a relaxed atomic add.
#[derive(Default)]
pub struct StreamCounters {
    callbacks: AtomicU64,
    bytes_captured: AtomicU64,
    bytes_played: AtomicU64,
    overruns: AtomicU64,
    underruns: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    unreported_overruns: AtomicU64,
    unreported_underruns: AtomicU64,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one callback period.
    pub fn record_callback(&self) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes copied from the device into the capture queue.
    pub fn record_captured(&self, bytes: usize) {
        self.bytes_captured.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record bytes handed to the device from the playback queue.
    pub fn record_played(&self, bytes: usize) {
        self.bytes_played.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a dropped capture block. Returns true if this is the first
    /// overrun since the last report.
    pub fn record_overrun(&self) -> bool {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        self.unreported_overruns.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Record a silence-padded playback period. Returns true if this is the
    /// first underrun since the last report.
    pub fn record_underrun(&self) -> bool {
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.unreported_underruns.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Record bytes returned to the application.
    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record bytes accepted from the application.
    pub fn record_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Overruns since the last call.
    pub fn take_unreported_overruns(&self) -> u64 {
        self.unreported_overruns.swap(0, Ordering::AcqRel)
    }

    /// Underruns since the last call.
    pub fn take_unreported_underruns(&self) -> u64 {
        self.unreported_underruns.swap(0, Ordering::AcqRel)
    }

    /// Get current counters snapshot.
    pub fn snapshot(&self, capture_queued: usize, playback_queued: usize) -> StreamStats {
        StreamStats {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            bytes_played: self.bytes_played.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            capture_queued: capture_queued as u64,
            playback_queued: playback_queued as u64,
        }
    }
}
