//! Error types for the stream engine.

use thiserror::Error;

use audioio_host::HostError;
use audioio_types::ConfigError;

use crate::queue::QueueError;

/// Errors that can occur while creating or driving a stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioIoError {
    /// Options rejected before the device was opened.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The device exists but could not be opened.
    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    /// The platform audio layer could not be initialized.
    #[error("Audio engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The stream no longer accepts or produces data.
    #[error("Stream queue closed")]
    QueueClosed,

    /// `start` called on a running stream.
    #[error("Stream already started")]
    AlreadyStarted,

    /// Operation not valid in the current state or for this stream's directions.
    #[error("Invalid stream state: {0}")]
    InvalidState(String),

    /// A fatal audio error closed the stream.
    #[error("Audio stream error: {0}")]
    StreamError(String),
}

impl From<ConfigError> for AudioIoError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfiguration(err.to_string())
    }
}

impl From<HostError> for AudioIoError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Unavailable(message) => Self::EngineUnavailable(message),
            HostError::DeviceNotFound(id) => {
                Self::InvalidConfiguration(format!("unknown device {id}"))
            }
            HostError::FormatNotSupported(message) => Self::InvalidConfiguration(message),
            HostError::DeviceBusy(message) => Self::DeviceBusy(message),
            HostError::Closed => Self::InvalidState("stream already released".to_string()),
            HostError::StreamFault(message) | HostError::Backend(message) => {
                Self::StreamError(message)
            }
        }
    }
}

impl From<QueueError> for AudioIoError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Closed => Self::QueueClosed,
        }
    }
}

/// Converts an engine error for `std::io` callers.
pub(crate) fn to_io_error(err: AudioIoError) -> std::io::Error {
    use std::io::ErrorKind;

    let kind = match err {
        AudioIoError::QueueClosed => ErrorKind::BrokenPipe,
        AudioIoError::InvalidState(_) | AudioIoError::AlreadyStarted => ErrorKind::Unsupported,
        _ => ErrorKind::Other,
    };
    std::io::Error::new(kind, err)
}
