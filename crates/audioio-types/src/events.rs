//! Events published by a stream to its observers.

use serde::{Deserialize, Serialize};

use crate::state::StreamState;
use crate::types::Direction;

/// Events that a stream sends to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Lifecycle state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<StreamState>,

        /// Current state.
        current: Box<StreamState>,
    },

    /// Capture blocks were dropped because the application did not read fast enough.
    Overrun {
        /// Blocks dropped since the last report.
        blocks: u64,
    },

    /// Playback was padded with silence because the application did not write fast enough.
    Underrun {
        /// Periods padded since the last report.
        periods: u64,
    },

    /// Audio error occurred.
    Error {
        /// Direction the error was reported on, if known.
        direction: Option<Direction>,

        /// Whether the stream was closed because of it.
        fatal: bool,

        /// Error message.
        message: String,
    },

    /// A graceful quit finished playing out all queued audio.
    Finished,

    /// The platform stream has been released; no further events follow.
    Closed,
}
