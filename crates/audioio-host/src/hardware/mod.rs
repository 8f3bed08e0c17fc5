//! Real audio devices through cpal.

mod device;
mod stream;

use tracing::instrument;

use audioio_types::{DeviceInfo, Direction, HostApiList};

use crate::{AudioHost, HostResult, PlatformStream, StreamHandlers, StreamRequest};

pub use stream::CpalStream;

/// Host backed by every cpal host available on this machine.
///
/// Device ids are assigned in enumeration order across all hosts and are
/// stable for as long as the set of attached devices does not change.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

impl AudioHost for CpalHost {
    fn devices(&self) -> HostResult<Vec<DeviceInfo>> {
        Ok(device::enumerate()?
            .iter()
            .enumerate()
            .map(|(index, entry)| device::describe(index as u32, entry))
            .collect())
    }

    fn host_apis(&self) -> HostResult<HostApiList> {
        device::host_apis()
    }

    fn default_device(&self, direction: Direction) -> HostResult<Option<u32>> {
        device::default_device(direction)
    }

    fn check_support(&self, request: &StreamRequest) -> HostResult<()> {
        let devices = device::enumerate()?;
        if let Some(params) = &request.input {
            device::check_direction(&devices, Direction::Input, params, request.sample_rate)?;
        }
        if let Some(params) = &request.output {
            device::check_direction(&devices, Direction::Output, params, request.sample_rate)?;
        }
        Ok(())
    }

    fn callback_frames(&self, request: &StreamRequest) -> HostResult<u32> {
        let devices = device::enumerate()?;
        Ok(device::buffer_plan(&devices, request)?.1)
    }

    #[instrument(name = "cpal_open_stream", skip(self, handlers))]
    fn open_stream(
        &self,
        request: &StreamRequest,
        handlers: StreamHandlers,
    ) -> HostResult<Box<dyn PlatformStream>> {
        Ok(Box::new(CpalStream::open(request.clone(), handlers)?))
    }
}
