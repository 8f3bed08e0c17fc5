//! Error types for the platform audio layer.

use thiserror::Error;

/// Errors that can occur in the platform audio layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    /// The platform audio layer could not be initialized.
    #[error("Audio host unavailable: {0}")]
    Unavailable(String),

    /// Audio device not found.
    #[error("Audio device not found: {0}")]
    DeviceNotFound(u32),

    /// Channel count, sample rate or sample format not supported by the device.
    #[error("Audio format not supported: {0}")]
    FormatNotSupported(String),

    /// The device exists but could not be opened.
    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    /// Runtime fault reported while the stream was running.
    #[error("Audio stream fault: {0}")]
    StreamFault(String),

    /// Operation on a stream that has already been released.
    #[error("Audio stream already closed")]
    Closed,

    /// Any other backend failure.
    #[error("Audio backend error: {0}")]
    Backend(String),
}
