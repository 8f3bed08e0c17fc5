//! cpal streams run on a dedicated owner thread.
//!
//! `cpal::Stream` is not `Send`, so the streams are built, driven and dropped
//! on one thread. [`CpalStream`] only holds a control channel to it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, BuildStreamError, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info};

use audioio_types::Direction;

use super::device::{self, Entry};
use crate::error::HostError;
use crate::{ErrorHandler, HostResult, PlatformStream, StreamHandlers, StreamRequest};

enum Control {
    Play(Sender<HostResult<()>>),
    Pause(Sender<HostResult<()>>),
    Close,
}

/// A stream opened through cpal.
pub struct CpalStream {
    control: Sender<Control>,
    thread: Option<JoinHandle<()>>,
    active: bool,
    closed: bool,
}

impl CpalStream {
    pub(crate) fn open(request: StreamRequest, handlers: StreamHandlers) -> HostResult<Self> {
        let (control, control_rx) = bounded(4);
        let (ready_tx, ready_rx) = bounded(1);

        let thread = thread::Builder::new()
            .name("audioio-cpal".to_string())
            .spawn(move || owner_loop(request, handlers, ready_tx, control_rx))
            .map_err(|e| HostError::Backend(format!("failed to spawn stream thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                control,
                thread: Some(thread),
                active: false,
                closed: false,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(HostError::Backend("stream thread exited during open".to_string()))
            }
        }
    }

    fn request(&self, make: fn(Sender<HostResult<()>>) -> Control) -> HostResult<()> {
        if self.closed {
            return Err(HostError::Closed);
        }
        let (reply, reply_rx) = bounded(1);
        self.control.send(make(reply)).map_err(|_| HostError::Closed)?;
        reply_rx.recv().map_err(|_| HostError::Closed)?
    }
}

impl PlatformStream for CpalStream {
    fn start(&mut self) -> HostResult<()> {
        self.request(Control::Play)?;
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) -> HostResult<()> {
        self.request(Control::Pause)?;
        self.active = false;
        Ok(())
    }

    fn abort(&mut self) -> HostResult<()> {
        self.stop()
    }

    fn close(&mut self) -> HostResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.active = false;
        let _ = self.control.send(Control::Close);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!("cpal stream released");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn map_build_error(e: BuildStreamError) -> HostError {
    match e {
        BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
            HostError::FormatNotSupported(e.to_string())
        }
        other => HostError::DeviceBusy(other.to_string()),
    }
}

fn stream_config(request: &StreamRequest, channels: u16, buffer_size: BufferSize) -> StreamConfig {
    StreamConfig {
        channels,
        sample_rate: SampleRate(request.sample_rate),
        buffer_size,
    }
}

fn fault_handler(
    errors: &ErrorHandler,
    direction: Direction,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    let errors = Arc::clone(errors);
    move |e| errors(direction, HostError::StreamFault(e.to_string()))
}

fn build_streams(
    request: &StreamRequest,
    handlers: StreamHandlers,
) -> HostResult<Vec<cpal::Stream>> {
    let entries: Vec<Entry> = device::enumerate()?;
    let (buffer_size, frames) = device::buffer_plan(&entries, request)?;
    debug!(?buffer_size, frames, "cpal buffer size chosen");
    let locate = |id: u32| {
        entries
            .get(id as usize)
            .map(|e| &e.device)
            .ok_or(HostError::DeviceNotFound(id))
    };

    let StreamHandlers {
        input,
        output,
        error,
    } = handlers;
    let mut streams = Vec::with_capacity(2);

    if let (Some(params), Some(mut input)) = (request.input, input) {
        let device = locate(params.device)?;
        let mut origin: Option<cpal::StreamInstant> = None;
        let stream = device
            .build_input_stream_raw(
                &stream_config(request, params.channels, buffer_size.clone()),
                device::sample_format(params.format)?,
                move |data: &cpal::Data, info: &cpal::InputCallbackInfo| {
                    let captured = info.timestamp().capture;
                    let first = *origin.get_or_insert(captured);
                    let at = captured.duration_since(&first).unwrap_or(Duration::ZERO);
                    input(data.bytes(), at)
                },
                fault_handler(&error, Direction::Input),
                None,
            )
            .map_err(map_build_error)?;
        streams.push(stream);
    }

    if let (Some(params), Some(mut output)) = (request.output, output) {
        let device = locate(params.device)?;
        let stream = device
            .build_output_stream_raw(
                &stream_config(request, params.channels, buffer_size.clone()),
                device::sample_format(params.format)?,
                move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
                    output(data.bytes_mut())
                },
                fault_handler(&error, Direction::Output),
                None,
            )
            .map_err(map_build_error)?;
        streams.push(stream);
    }

    Ok(streams)
}

fn owner_loop(
    request: StreamRequest,
    handlers: StreamHandlers,
    ready: Sender<HostResult<()>>,
    control: Receiver<Control>,
) {
    let streams = match build_streams(&request, handlers) {
        Ok(streams) => streams,
        Err(e) => {
            error!(error = %e, "Failed to build cpal stream");
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!(streams = streams.len(), "cpal streams built");

    while let Ok(message) = control.recv() {
        match message {
            Control::Play(reply) => {
                let result = streams
                    .iter()
                    .try_for_each(|s| s.play())
                    .map_err(|e| HostError::Backend(e.to_string()));
                let _ = reply.send(result);
            }
            Control::Pause(reply) => {
                let result = streams
                    .iter()
                    .try_for_each(|s| s.pause())
                    .map_err(|e| HostError::Backend(e.to_string()));
                let _ = reply.send(result);
            }
            Control::Close => break,
        }
    }

    drop(streams);
}
