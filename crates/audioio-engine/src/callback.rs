//! Real-time handlers handed to the platform.
//!
//! Handlers only touch the ring buffers, atomics and a bounded notice
//! channel. Logging, events and state changes happen on the supervisor
//! thread that drains the notices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use audioio_host::{ErrorHandler, HostError, InputHandler, OutputHandler};
use audioio_types::Direction;

use crate::counters::StreamCounters;
use crate::queue::{QueueHandle, QueueReader, QueueWriter, TryPushError};

/// Capacity of the notice channel. Overrun and underrun notices are
/// coalesced, so this only needs to hold a few faults.
pub(crate) const NOTICE_CHANNEL_CAPACITY: usize = 64;

/// Messages from the audio side to the supervisor.
#[derive(Debug)]
pub(crate) enum Notice {
    Overrun,
    Underrun,
    Fault { direction: Direction, message: String },
}

/// Flags read by the callbacks.
#[derive(Default)]
pub(crate) struct RtFlags {
    /// Set once `start` has been called.
    pub started: AtomicBool,

    /// Set once the application has written playback data.
    pub primed: AtomicBool,

    /// A fatal error closed the stream.
    pub failed: AtomicBool,

    /// An abort was requested.
    pub aborting: AtomicBool,
}

/// Time covered by `bytes` of audio.
pub(crate) fn bytes_to_duration(bytes: u64, bytes_per_second: f64) -> Duration {
    if bytes_per_second > 0.0 {
        Duration::from_secs_f64(bytes as f64 / bytes_per_second)
    } else {
        Duration::ZERO
    }
}

pub(crate) struct CaptureContext {
    pub counters: Arc<StreamCounters>,
    pub notices: Sender<Notice>,
    pub counts_callbacks: bool,
    /// Blocks larger than this are pushed in pieces of this size.
    pub piece_bytes: usize,
    pub bytes_per_second: f64,
}

pub(crate) fn capture_handler(mut writer: QueueWriter, ctx: CaptureContext) -> InputHandler {
    Box::new(move |data: &[u8], at: Duration| {
        if ctx.counts_callbacks {
            ctx.counters.record_callback();
        }
        let mut offset = 0u64;
        for piece in data.chunks(ctx.piece_bytes.max(1)) {
            let piece_at = at + bytes_to_duration(offset, ctx.bytes_per_second);
            offset += piece.len() as u64;
            match writer.try_push_stamped(piece, piece_at) {
                Ok(()) => ctx.counters.record_captured(piece.len()),
                Err(TryPushError::Full) => {
                    if ctx.counters.record_overrun() {
                        let _ = ctx.notices.try_send(Notice::Overrun);
                    }
                }
                // Drained or aborted; the device keeps running until stopped.
                Err(TryPushError::Closed) => return,
            }
        }
    })
}

pub(crate) struct PlaybackContext {
    pub counters: Arc<StreamCounters>,
    pub flags: Arc<RtFlags>,
    pub notices: Sender<Notice>,
    pub close_on_error: bool,
    /// Queues closed when an underrun is fatal.
    pub queues: Vec<QueueHandle>,
}

pub(crate) fn playback_handler(mut reader: QueueReader, ctx: PlaybackContext) -> OutputHandler {
    Box::new(move |out: &mut [u8]| {
        ctx.counters.record_callback();

        let n = reader.try_pop_into(out);
        // Zero is silence for every supported format.
        out[n..].fill(0);
        ctx.counters.record_played(n);

        if n == out.len()
            || !ctx.flags.started.load(Ordering::Acquire)
            || !ctx.flags.primed.load(Ordering::Acquire)
            || reader.is_closed()
        {
            return;
        }

        let first = ctx.counters.record_underrun();
        if ctx.close_on_error && !ctx.flags.failed.swap(true, Ordering::AcqRel) {
            for queue in &ctx.queues {
                queue.close();
            }
            let _ = ctx.notices.try_send(Notice::Underrun);
        } else if first {
            let _ = ctx.notices.try_send(Notice::Underrun);
        }
    })
}

pub(crate) fn error_handler(notices: Sender<Notice>) -> ErrorHandler {
    Arc::new(move |direction: Direction, err: HostError| {
        let _ = notices.try_send(Notice::Fault {
            direction,
            message: err.to_string(),
        });
    })
}
