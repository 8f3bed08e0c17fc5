//! Synthetic loopback host.
//!
//! Devices exist only in memory. A duplex stream feeds every block it plays
//! straight back into its own capture handler; capture-only streams receive a
//! byte ramp (0, 1, 2, … wrapping) so ordering can be checked. All played
//! bytes are recorded on the host. Capture times come from the number of
//! frames captured so far.
//!
//! With [`ClockMode::Manual`] nothing happens until [`LoopbackHost::pump`] is
//! called, which makes tests deterministic. [`ClockMode::Realtime`] runs one
//! clock thread per started stream at the nominal block period.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use audioio_types::{
    DeviceInfo, Direction, HostApiList, HostApiType, HostInfo, SampleFormat, NO_DEVICE,
};

use crate::error::HostError;
use crate::{
    AudioHost, ChannelParams, ErrorHandler, HostResult, InputHandler, OutputHandler,
    PlatformStream, StreamHandlers, StreamRequest,
};

const HOST_API_NAME: &str = "Loopback";

/// How loopback streams are clocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Blocks are processed only by [`LoopbackHost::pump`].
    Manual,

    /// Each started stream gets a thread that processes one block per period.
    Realtime,
}

/// A virtual device.
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub default_sample_rate: u32,
    pub sample_rates: Vec<u32>,
    pub formats: Vec<SampleFormat>,

    /// Frames per callback regardless of what the stream asks for.
    pub block_frames: Option<u32>,
}

impl LoopbackDevice {
    fn new(name: &str, inputs: u16, outputs: u16) -> Self {
        Self {
            name: name.to_string(),
            max_input_channels: inputs,
            max_output_channels: outputs,
            default_sample_rate: 48000,
            sample_rates: vec![22050, 44100, 48000, 96000],
            formats: vec![
                SampleFormat::Float32,
                SampleFormat::Int8,
                SampleFormat::Int16,
                SampleFormat::Int24,
                SampleFormat::Int32,
            ],
            block_frames: None,
        }
    }

    /// Runs every callback with `frames` frames.
    pub fn with_block_frames(mut self, frames: u32) -> Self {
        self.block_frames = Some(frames);
        self
    }

    /// Stereo in, stereo out.
    pub fn duplex(name: &str) -> Self {
        Self::new(name, 2, 2)
    }

    /// Stereo out only.
    pub fn output_only(name: &str) -> Self {
        Self::new(name, 0, 2)
    }

    /// Stereo in only.
    pub fn input_only(name: &str) -> Self {
        Self::new(name, 2, 0)
    }

    fn info(&self, id: u32) -> DeviceInfo {
        let rate = self.default_sample_rate as f64;
        let low = 256.0 / rate;
        let high = 2048.0 / rate;
        let input_latency = |l: f64| if self.max_input_channels > 0 { l } else { 0.0 };
        let output_latency = |l: f64| if self.max_output_channels > 0 { l } else { 0.0 };

        DeviceInfo {
            id,
            name: self.name.clone(),
            max_input_channels: self.max_input_channels,
            max_output_channels: self.max_output_channels,
            default_sample_rate: rate,
            default_low_input_latency: input_latency(low),
            default_low_output_latency: output_latency(low),
            default_high_input_latency: input_latency(high),
            default_high_output_latency: output_latency(high),
            host_api_name: HOST_API_NAME.to_string(),
        }
    }

    fn max_channels(&self, direction: Direction) -> u16 {
        match direction {
            Direction::Input => self.max_input_channels,
            Direction::Output => self.max_output_channels,
        }
    }
}

/// In-memory host with virtual devices.
#[derive(Clone)]
pub struct LoopbackHost {
    shared: Arc<HostShared>,
}

struct HostShared {
    devices: Vec<LoopbackDevice>,
    clock: ClockMode,
    available: AtomicBool,
    busy: Mutex<HashSet<u32>>,
    streams: Mutex<Vec<Weak<StreamCore>>>,
    opened: AtomicU64,
    released: AtomicU64,
    callbacks: AtomicU64,
    played: Mutex<Vec<u8>>,
}

impl LoopbackHost {
    /// Host with a duplex, an output-only and an input-only device, manually clocked.
    pub fn new() -> Self {
        Self::with_config(Self::default_devices(), ClockMode::Manual)
    }

    /// Default devices, clocked in real time.
    pub fn realtime() -> Self {
        Self::with_config(Self::default_devices(), ClockMode::Realtime)
    }

    /// Host with the given devices and clock.
    pub fn with_config(devices: Vec<LoopbackDevice>, clock: ClockMode) -> Self {
        Self {
            shared: Arc::new(HostShared {
                devices,
                clock,
                available: AtomicBool::new(true),
                busy: Mutex::new(HashSet::new()),
                streams: Mutex::new(Vec::new()),
                opened: AtomicU64::new(0),
                released: AtomicU64::new(0),
                callbacks: AtomicU64::new(0),
                played: Mutex::new(Vec::new()),
            }),
        }
    }

    fn default_devices() -> Vec<LoopbackDevice> {
        vec![
            LoopbackDevice::duplex("Loopback Duplex"),
            LoopbackDevice::output_only("Loopback Output"),
            LoopbackDevice::input_only("Loopback Input"),
        ]
    }

    /// Process `periods` blocks on every started stream. Returns the number of
    /// callbacks run.
    pub fn pump(&self, periods: usize) -> usize {
        let mut ran = 0;
        for _ in 0..periods {
            for core in self.live_streams() {
                if core.tick() {
                    ran += 1;
                }
            }
        }
        ran
    }

    /// Report a runtime fault on every open stream that has `direction` active.
    pub fn inject_fault(&self, direction: Direction, message: &str) {
        for core in self.live_streams() {
            if core.request.params(direction).is_some() && !core.closed.load(Ordering::Acquire) {
                warn!(direction = direction.name(), message, "Injecting loopback fault");
                (core.error)(direction, HostError::StreamFault(message.to_string()));
            }
        }
    }

    /// Make every query and open fail as if the platform could not initialize.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Make opens of `device` fail as busy.
    pub fn set_busy(&self, device: u32, busy: bool) {
        let mut set = self.shared.busy.lock();
        if busy {
            set.insert(device);
        } else {
            set.remove(&device);
        }
    }

    /// Streams opened so far.
    pub fn opened_count(&self) -> u64 {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Streams released so far.
    pub fn released_count(&self) -> u64 {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Callbacks run so far, across all streams.
    pub fn callback_count(&self) -> u64 {
        self.shared.callbacks.load(Ordering::SeqCst)
    }

    /// Every byte played so far, in order.
    pub fn played(&self) -> Vec<u8> {
        self.shared.played.lock().clone()
    }

    fn live_streams(&self) -> Vec<Arc<StreamCore>> {
        let mut streams = self.shared.streams.lock();
        streams.retain(|weak| weak.strong_count() > 0);
        streams.iter().filter_map(Weak::upgrade).collect()
    }

    fn ensure_available(&self) -> HostResult<()> {
        if self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HostError::Unavailable("loopback host disabled".to_string()))
        }
    }

    fn check_direction(
        &self,
        direction: Direction,
        params: &ChannelParams,
        sample_rate: u32,
    ) -> HostResult<()> {
        let device = self
            .shared
            .devices
            .get(params.device as usize)
            .ok_or(HostError::DeviceNotFound(params.device))?;

        let max = device.max_channels(direction);
        if params.channels == 0 || params.channels > max {
            return Err(HostError::FormatNotSupported(format!(
                "{} supports at most {} {} channels, requested {}",
                device.name,
                max,
                direction.name(),
                params.channels
            )));
        }
        if !device.sample_rates.contains(&sample_rate) {
            return Err(HostError::FormatNotSupported(format!(
                "{} does not support {} Hz",
                device.name, sample_rate
            )));
        }
        if !device.formats.contains(&params.format) {
            return Err(HostError::FormatNotSupported(format!(
                "{} does not support sample format {}",
                device.name, params.format
            )));
        }
        Ok(())
    }
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for LoopbackHost {
    fn devices(&self) -> HostResult<Vec<DeviceInfo>> {
        self.ensure_available()?;
        Ok(self
            .shared
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| d.info(i as u32))
            .collect())
    }

    fn host_apis(&self) -> HostResult<HostApiList> {
        self.ensure_available()?;
        let default_index = |direction| {
            self.shared
                .devices
                .iter()
                .position(|d| d.max_channels(direction) > 0)
                .map(|i| i as i32)
                .unwrap_or(NO_DEVICE)
        };

        Ok(HostApiList {
            default_host_api: 0,
            host_apis: vec![HostInfo {
                id: 0,
                name: HOST_API_NAME.to_string(),
                host_type: HostApiType::InDevelopment,
                device_count: self.shared.devices.len() as u32,
                default_input: default_index(Direction::Input),
                default_output: default_index(Direction::Output),
            }],
        })
    }

    fn default_device(&self, direction: Direction) -> HostResult<Option<u32>> {
        self.ensure_available()?;
        Ok(self
            .shared
            .devices
            .iter()
            .position(|d| d.max_channels(direction) > 0)
            .map(|i| i as u32))
    }

    fn check_support(&self, request: &StreamRequest) -> HostResult<()> {
        if let Some(params) = &request.input {
            self.check_direction(Direction::Input, params, request.sample_rate)?;
        }
        if let Some(params) = &request.output {
            self.check_direction(Direction::Output, params, request.sample_rate)?;
        }
        Ok(())
    }

    fn callback_frames(&self, request: &StreamRequest) -> HostResult<u32> {
        let forced = [&request.input, &request.output]
            .into_iter()
            .flatten()
            .filter_map(|params| self.shared.devices.get(params.device as usize)?.block_frames)
            .max();
        Ok(forced.unwrap_or_else(|| request.block_frames()))
    }

    #[instrument(name = "loopback_open_stream", skip(self, handlers))]
    fn open_stream(
        &self,
        request: &StreamRequest,
        handlers: StreamHandlers,
    ) -> HostResult<Box<dyn PlatformStream>> {
        self.ensure_available()?;
        {
            let busy = self.shared.busy.lock();
            for params in [&request.input, &request.output].into_iter().flatten() {
                if busy.contains(&params.device) {
                    return Err(HostError::DeviceBusy(format!(
                        "loopback device {} is in use",
                        params.device
                    )));
                }
            }
        }
        self.check_support(request)?;

        let frames = self.callback_frames(request)?;
        let period = Duration::from_secs_f64(frames as f64 / request.sample_rate as f64);
        let StreamHandlers {
            input,
            output,
            error,
        } = handlers;

        let core = Arc::new(StreamCore {
            request: request.clone(),
            period,
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            slot: Mutex::new(Some(Callbacks {
                input,
                output,
                in_buf: vec![0; request.frame_bytes(Direction::Input) * frames as usize],
                out_buf: vec![0; request.frame_bytes(Direction::Output) * frames as usize],
                ramp: 0,
                in_frame_bytes: request.frame_bytes(Direction::Input),
                sample_rate: u64::from(request.sample_rate),
                frames_captured: 0,
            })),
            error,
            host: Arc::clone(&self.shared),
        });

        self.shared.streams.lock().push(Arc::downgrade(&core));
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        debug!(frames, ?period, "Loopback stream opened");

        Ok(Box::new(LoopbackStream {
            core,
            clock: None,
        }))
    }
}

struct Callbacks {
    input: Option<InputHandler>,
    output: Option<OutputHandler>,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    ramp: u8,
    in_frame_bytes: usize,
    sample_rate: u64,
    frames_captured: u64,
}

impl Callbacks {
    fn run(&mut self, host: &HostShared) {
        let looped = self.input.is_some() && self.output.is_some();

        if let Some(output) = self.output.as_mut() {
            output(&mut self.out_buf);
            host.played.lock().extend_from_slice(&self.out_buf);
        }

        if let Some(input) = self.input.as_mut() {
            if looped {
                let n = self.in_buf.len().min(self.out_buf.len());
                self.in_buf[..n].copy_from_slice(&self.out_buf[..n]);
                self.in_buf[n..].fill(0);
            } else {
                for byte in self.in_buf.iter_mut() {
                    *byte = self.ramp;
                    self.ramp = self.ramp.wrapping_add(1);
                }
            }
            let at = Duration::from_nanos(
                self.frames_captured * 1_000_000_000 / self.sample_rate.max(1),
            );
            input(&self.in_buf, at);
            self.frames_captured += (self.in_buf.len() / self.in_frame_bytes.max(1)) as u64;
        }

        host.callbacks.fetch_add(1, Ordering::SeqCst);
    }
}

struct StreamCore {
    request: StreamRequest,
    period: Duration,
    active: AtomicBool,
    closed: AtomicBool,
    slot: Mutex<Option<Callbacks>>,
    error: ErrorHandler,
    host: Arc<HostShared>,
}

impl StreamCore {
    /// Runs one period. Returns false if the stream is not running.
    fn tick(&self) -> bool {
        if !self.active.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some(callbacks) => {
                callbacks.run(&self.host);
                true
            }
            None => false,
        }
    }
}

/// A stream opened on a [`LoopbackHost`].
pub struct LoopbackStream {
    core: Arc<StreamCore>,
    clock: Option<JoinHandle<()>>,
}

impl LoopbackStream {
    fn ensure_open(&self) -> HostResult<()> {
        if self.core.closed.load(Ordering::Acquire) {
            Err(HostError::Closed)
        } else {
            Ok(())
        }
    }

    fn halt(&mut self) {
        self.core.active.store(false, Ordering::Release);
        if let Some(handle) = self.clock.take() {
            let _ = handle.join();
        }
    }
}

impl PlatformStream for LoopbackStream {
    fn start(&mut self) -> HostResult<()> {
        self.ensure_open()?;
        if self.core.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.core.host.clock == ClockMode::Realtime {
            let core = Arc::clone(&self.core);
            let handle = thread::Builder::new()
                .name("audioio-loopback-clock".to_string())
                .spawn(move || {
                    while core.tick() {
                        thread::sleep(core.period);
                    }
                })
                .map_err(|e| HostError::Backend(format!("failed to spawn clock: {e}")))?;
            self.clock = Some(handle);
        }
        Ok(())
    }

    fn stop(&mut self) -> HostResult<()> {
        self.ensure_open()?;
        self.halt();
        Ok(())
    }

    fn abort(&mut self) -> HostResult<()> {
        self.ensure_open()?;
        self.halt();
        Ok(())
    }

    fn close(&mut self) -> HostResult<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.halt();
        self.core.slot.lock().take();
        self.core.host.released.fetch_add(1, Ordering::SeqCst);
        info!("Loopback stream released");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.core.active.load(Ordering::Acquire)
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn request(input: Option<u32>, output: Option<u32>) -> StreamRequest {
        let params = |device| ChannelParams {
            device,
            channels: 2,
            format: SampleFormat::Int16,
        };
        StreamRequest {
            sample_rate: 48000,
            frames_per_buffer: 4,
            input: input.map(params),
            output: output.map(params),
        }
    }

    fn no_errors() -> ErrorHandler {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_pump_only_runs_started_streams() {
        let host = LoopbackHost::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut stream = host
            .open_stream(
                &request(None, Some(1)),
                StreamHandlers {
                    input: None,
                    output: Some(Box::new(move |buf: &mut [u8]| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        buf.fill(7);
                    })),
                    error: no_errors(),
                },
            )
            .unwrap();

        assert_eq!(host.pump(3), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        stream.start().unwrap();
        assert_eq!(host.pump(3), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(host.played(), vec![7; 3 * 16]);

        stream.stop().unwrap();
        assert_eq!(host.pump(1), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let host = LoopbackHost::new();
        let mut stream = host
            .open_stream(
                &request(Some(0), None),
                StreamHandlers {
                    input: Some(Box::new(|_: &[u8], _: Duration| {})),
                    output: None,
                    error: no_errors(),
                },
            )
            .unwrap();

        stream.close().unwrap();
        stream.close().unwrap();
        drop(stream);

        assert_eq!(host.opened_count(), 1);
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_calls_after_close_fail() {
        let host = LoopbackHost::new();
        let mut stream = host
            .open_stream(
                &request(None, Some(0)),
                StreamHandlers {
                    input: None,
                    output: Some(Box::new(|buf: &mut [u8]| buf.fill(0))),
                    error: no_errors(),
                },
            )
            .unwrap();

        stream.close().unwrap();
        assert_eq!(stream.start(), Err(HostError::Closed));
        assert!(!stream.is_active());
    }

    #[test]
    fn test_duplex_loops_output_into_input() {
        let host = LoopbackHost::new();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let mut next = 0u8;

        let mut stream = host
            .open_stream(
                &request(Some(0), Some(0)),
                StreamHandlers {
                    input: Some(Box::new(move |buf: &[u8], _: Duration| {
                        sink.lock().extend_from_slice(buf)
                    })),
                    output: Some(Box::new(move |buf: &mut [u8]| {
                        for b in buf.iter_mut() {
                            *b = next;
                            next = next.wrapping_add(3);
                        }
                    })),
                    error: no_errors(),
                },
            )
            .unwrap();

        stream.start().unwrap();
        host.pump(2);

        assert_eq!(*captured.lock(), host.played());
        assert_eq!(host.played().len(), 32);
    }

    #[test]
    fn test_capture_only_receives_ramp() {
        let host = LoopbackHost::new();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);

        let mut stream = host
            .open_stream(
                &request(Some(2), None),
                StreamHandlers {
                    input: Some(Box::new(move |buf: &[u8], _: Duration| {
                        sink.lock().extend_from_slice(buf)
                    })),
                    output: None,
                    error: no_errors(),
                },
            )
            .unwrap();

        stream.start().unwrap();
        host.pump(2);

        let expected: Vec<u8> = (0..32u8).collect();
        assert_eq!(*captured.lock(), expected);
    }

    #[test]
    fn test_forced_block_frames_and_capture_times() {
        let host = LoopbackHost::with_config(
            vec![LoopbackDevice::input_only("Wide").with_block_frames(16)],
            ClockMode::Manual,
        );
        let request = request(Some(0), None);
        assert_eq!(host.callback_frames(&request), Ok(16));

        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&blocks);
        let mut stream = host
            .open_stream(
                &request,
                StreamHandlers {
                    input: Some(Box::new(move |buf: &[u8], at: Duration| {
                        sink.lock().push((buf.len(), at))
                    })),
                    output: None,
                    error: no_errors(),
                },
            )
            .unwrap();

        stream.start().unwrap();
        host.pump(3);

        // 16 stereo 16-bit frames per block at 48 kHz.
        let per_block = Duration::from_nanos(16 * 1_000_000_000 / 48000);
        assert_eq!(
            *blocks.lock(),
            vec![(64, Duration::ZERO), (64, per_block), (64, per_block * 2)]
        );
    }

    #[test]
    fn test_open_rejects_busy_and_unsupported() {
        let host = LoopbackHost::new();
        host.set_busy(1, true);

        let busy = host.open_stream(
            &request(None, Some(1)),
            StreamHandlers {
                input: None,
                output: None,
                error: no_errors(),
            },
        );
        assert!(matches!(busy, Err(HostError::DeviceBusy(_))));

        // Device 1 has no inputs.
        assert!(matches!(
            host.check_support(&request(Some(1), None)),
            Err(HostError::FormatNotSupported(_))
        ));
        assert!(matches!(
            host.check_support(&request(Some(9), None)),
            Err(HostError::DeviceNotFound(9))
        ));
        assert_eq!(host.opened_count(), 0);
    }

    #[test]
    fn test_catalog_queries() {
        let host = LoopbackHost::new();

        let devices = host.devices().unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[1].id, 1);
        assert_eq!(devices[1].max_input_channels, 0);
        assert_eq!(devices[1].default_low_input_latency, 0.0);
        assert!(devices[1].default_low_output_latency > 0.0);

        let apis = host.host_apis().unwrap();
        assert_eq!(apis.default_host_api, 0);
        assert_eq!(apis.host_apis[0].device_count, 3);
        assert_eq!(apis.host_apis[0].default_input, 0);
        assert_eq!(apis.host_apis[0].default_output, 0);

        host.set_available(false);
        assert!(matches!(host.devices(), Err(HostError::Unavailable(_))));
        assert!(matches!(host.host_apis(), Err(HostError::Unavailable(_))));
    }

    #[test]
    fn test_realtime_clock_runs_until_stopped() {
        let host = LoopbackHost::realtime();
        let mut stream = host
            .open_stream(
                &request(None, Some(1)),
                StreamHandlers {
                    input: None,
                    output: Some(Box::new(|buf: &mut [u8]| buf.fill(1))),
                    error: no_errors(),
                },
            )
            .unwrap();

        stream.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while host.callback_count() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        stream.stop().unwrap();
        let after_stop = host.callback_count();
        thread::sleep(Duration::from_millis(5));

        assert!(after_stop >= 3);
        assert_eq!(host.callback_count(), after_stop);
    }
}
