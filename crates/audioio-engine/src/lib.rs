//! Duplex audio streaming engine.
//!
//! This crate moves PCM between a platform audio callback and application
//! threads through bounded frame queues, tracks the stream lifecycle, and
//! exposes streams as `std::io` readers and writers.

mod callback;
mod catalog;
mod completion;
mod counters;
mod engine;
mod error;
mod io;
mod queue;

pub use catalog::{list_devices, list_host_apis, loopback_host};
#[cfg(feature = "cpal")]
pub use catalog::default_host;
pub use completion::{Completion, CompletionCallback};
pub use counters::StreamCounters;
pub use engine::{CapturedChunk, StreamEngine};
pub use error::AudioIoError;
pub use io::{audio_io, AudioDuplex, AudioIo, AudioReader, AudioWriter};
pub use queue::{
    frame_queue, stamped_queue, Pop, QueueError, QueueHandle, QueueReader, QueueWriter, Stamp,
    TryPushError,
};

pub use audioio_host::{AudioHost, ClockMode, LoopbackDevice, LoopbackHost};
pub use audioio_types::{
    AudioIoOptions, AudioOptions, DeviceInfo, Direction, HostApiList, HostApiType, HostInfo,
    QuitMode, SampleFormat, StreamEvent, StreamState, StreamStats,
};

/// Result type for engine operations.
pub type AudioIoResult<T> = Result<T, AudioIoError>;
