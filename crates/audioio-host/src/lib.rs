//! Platform audio layer.
//!
//! An [`AudioHost`] enumerates devices and opens callback-driven
//! [`PlatformStream`]s. The engine only talks to these traits; the
//! [`loopback`] host is a synthetic device for tests and headless runs, and
//! the `cpal` feature adds real hardware.

mod error;
#[cfg(feature = "cpal")]
mod hardware;
pub mod loopback;

use std::sync::Arc;
use std::time::Duration;

use audioio_types::{DeviceInfo, Direction, HostApiList, SampleFormat};

pub use error::HostError;
#[cfg(feature = "cpal")]
pub use hardware::{CpalHost, CpalStream};
pub use loopback::{ClockMode, LoopbackDevice, LoopbackHost};

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Frames per block when the caller leaves the choice to the engine.
pub const DEFAULT_FRAMES_PER_BUFFER: u32 = 1024;

/// Real-time capture handler; receives one block of interleaved bytes and
/// the capture time of its first frame, measured from the first frame the
/// stream captured.
pub type InputHandler = Box<dyn FnMut(&[u8], Duration) + Send + 'static>;

/// Real-time playback handler; must fill the whole block.
pub type OutputHandler = Box<dyn FnMut(&mut [u8]) + Send + 'static>;

/// Handler for faults reported by the platform while a stream runs.
pub type ErrorHandler = Arc<dyn Fn(Direction, HostError) + Send + Sync + 'static>;

/// Resolved parameters for one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    /// Device index.
    pub device: u32,

    /// Interleaved channels.
    pub channels: u16,

    /// Sample format.
    pub format: SampleFormat,
}

impl ChannelParams {
    /// Bytes per interleaved frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }
}

/// A request to open a platform stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Sample rate shared by both directions.
    pub sample_rate: u32,

    /// Frames per callback; 0 lets the host choose.
    pub frames_per_buffer: u32,

    /// Capture side.
    pub input: Option<ChannelParams>,

    /// Playback side.
    pub output: Option<ChannelParams>,
}

impl StreamRequest {
    /// Frames per block, with the default applied.
    pub fn block_frames(&self) -> u32 {
        if self.frames_per_buffer == 0 {
            DEFAULT_FRAMES_PER_BUFFER
        } else {
            self.frames_per_buffer
        }
    }

    /// Parameters for one direction.
    pub fn params(&self, direction: Direction) -> Option<&ChannelParams> {
        match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        }
    }

    /// Bytes per frame for one direction, or 0 if the direction is inactive.
    pub fn frame_bytes(&self, direction: Direction) -> usize {
        self.params(direction)
            .map(ChannelParams::bytes_per_frame)
            .unwrap_or(0)
    }

    /// Bytes per block for one direction, or 0 if the direction is inactive.
    pub fn block_bytes(&self, direction: Direction) -> usize {
        self.frame_bytes(direction) * self.block_frames() as usize
    }
}

/// Callbacks handed to the platform when a stream is opened.
pub struct StreamHandlers {
    /// Called on the audio thread with captured bytes.
    pub input: Option<InputHandler>,

    /// Called on the audio thread to fill the playback buffer.
    pub output: Option<OutputHandler>,

    /// Called when the platform reports a fault.
    pub error: ErrorHandler,
}

/// An opened platform stream.
///
/// `close` releases the underlying device handle and drops the handlers. It
/// must be idempotent; every other call after `close` fails with
/// [`HostError::Closed`].
pub trait PlatformStream: Send {
    /// Begin invoking the handlers.
    fn start(&mut self) -> HostResult<()>;

    /// Stop after buffers already handed to the device have played.
    fn stop(&mut self) -> HostResult<()>;

    /// Stop as fast as the platform allows.
    fn abort(&mut self) -> HostResult<()>;

    /// Release the device handle.
    fn close(&mut self) -> HostResult<()>;

    /// Whether handlers are currently being invoked.
    fn is_active(&self) -> bool;
}

/// A platform audio layer.
pub trait AudioHost: Send + Sync {
    /// All devices, indexed by their stable id.
    fn devices(&self) -> HostResult<Vec<DeviceInfo>>;

    /// All host APIs and the default one.
    fn host_apis(&self) -> HostResult<HostApiList>;

    /// Default device for a direction, if there is one.
    fn default_device(&self, direction: Direction) -> HostResult<Option<u32>>;

    /// Checks channels, rate and format against the device without opening it.
    fn check_support(&self, request: &StreamRequest) -> HostResult<()>;

    /// Largest number of frames one callback may carry for `request`. Hosts
    /// that pick their own period report it here so queues can hold it.
    fn callback_frames(&self, request: &StreamRequest) -> HostResult<u32> {
        Ok(request.block_frames())
    }

    /// Opens a stream. Handlers are not invoked until `start`.
    fn open_stream(
        &self,
        request: &StreamRequest,
        handlers: StreamHandlers,
    ) -> HostResult<Box<dyn PlatformStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_bytes_uses_default_frames() {
        let request = StreamRequest {
            sample_rate: 48000,
            frames_per_buffer: 0,
            input: Some(ChannelParams {
                device: 0,
                channels: 2,
                format: SampleFormat::Int16,
            }),
            output: None,
        };

        assert_eq!(request.block_frames(), DEFAULT_FRAMES_PER_BUFFER);
        assert_eq!(
            request.block_bytes(Direction::Input),
            DEFAULT_FRAMES_PER_BUFFER as usize * 4
        );
        assert_eq!(request.block_bytes(Direction::Output), 0);
    }
}
