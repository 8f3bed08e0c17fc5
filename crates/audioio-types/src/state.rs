//! Stream lifecycle types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The lifecycle state of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Platform stream opened, callback not yet running.
    #[default]
    Created,

    /// Callback running.
    Started,

    /// No new writes accepted; queued playback is finishing.
    Draining,

    /// Drained and released.
    Stopped,

    /// Queued frames discarded and released.
    Aborted,

    /// A fatal audio error was observed.
    Errored {
        /// Error message.
        message: String,
    },
}

impl StreamState {
    /// Returns true once the stream can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted | Self::Errored { .. })
    }

    /// Returns true while the callback is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Started | Self::Draining)
    }

    /// Returns true if the stream is in the Errored state.
    pub fn is_errored(&self) -> bool {
        matches!(self, Self::Errored { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Started => "Started",
            Self::Draining => "Draining",
            Self::Stopped => "Stopped",
            Self::Aborted => "Aborted",
            Self::Errored { .. } => "Errored",
        }
    }
}

/// How a stream should be shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuitMode {
    /// Play out queued audio, then stop.
    #[serde(rename = "WAIT")]
    Wait,

    /// Throw away queued audio and stop immediately.
    #[serde(rename = "ABORT")]
    Abort,
}

impl QuitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wait => "WAIT",
            Self::Abort => "ABORT",
        }
    }
}

impl FromStr for QuitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAIT" => Ok(Self::Wait),
            "ABORT" => Ok(Self::Abort),
            other => Err(format!("expected 'WAIT' or 'ABORT', got '{other}'")),
        }
    }
}

impl fmt::Display for QuitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
