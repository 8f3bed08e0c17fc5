//! Shared data types for duplex audio streaming.
//!
//! This crate defines the records returned by device queries, the per-direction
//! stream options, and the lifecycle states and events published by a stream.

mod events;
mod options;
mod state;
mod types;

pub use events::StreamEvent;
pub use options::{AudioIoOptions, AudioOptions, ConfigError};
pub use state::{QuitMode, StreamState};
pub use types::{
    DeviceInfo, Direction, HostApiList, HostApiType, HostInfo, SampleFormat, StreamStats,
    UnknownSampleFormat,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for stream events (engine → observers).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Sentinel used for "no device" and "default device" indices.
pub const NO_DEVICE: i32 = -1;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<StreamEvent>, Receiver<StreamEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
