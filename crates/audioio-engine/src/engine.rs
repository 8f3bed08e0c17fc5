//! Stream engine.
//!
//! A [`StreamEngine`] owns one platform stream and a frame queue per active
//! direction. The platform calls the handlers from [`crate::callback`] on its
//! audio thread; everything that logs, publishes events or changes state runs
//! on the supervisor thread, the caller's thread, or a quit worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use audioio_host::{AudioHost, ChannelParams, HostError, PlatformStream, StreamHandlers, StreamRequest};
use audioio_types::{
    event_channel, AudioIoOptions, AudioOptions, DeviceInfo, Direction, QuitMode, StreamEvent,
    StreamState, StreamStats,
};

use crate::callback::{
    bytes_to_duration, capture_handler, error_handler, playback_handler, CaptureContext, Notice,
    PlaybackContext, RtFlags, NOTICE_CHANNEL_CAPACITY,
};
use crate::completion::{Completion, CompletionCallback, Settlement};
use crate::counters::StreamCounters;
use crate::error::AudioIoError;
use crate::queue::{stamped_queue, Pop, QueueError, QueueHandle, QueueReader, QueueWriter};
use crate::AudioIoResult;

/// How often the supervisor checks whether its engine is gone.
const SUPERVISOR_TICK: Duration = Duration::from_millis(100);

/// Message used when a fatal error left no platform message behind.
const UNDERFLOW_MESSAGE: &str = "output underflow";

/// Captured bytes and the capture time of their first frame, measured from
/// the first frame the stream captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk {
    pub data: Bytes,
    pub timestamp: Duration,
}

/// One duplex, capture-only or playback-only stream.
pub struct StreamEngine {
    inner: Arc<EngineInner>,
    supervisor: Option<JoinHandle<()>>,
}

struct EngineInner {
    input: Option<AudioOptions>,
    output: Option<AudioOptions>,
    state: RwLock<StreamState>,
    platform: Mutex<Option<Box<dyn PlatformStream>>>,
    capture: Option<Mutex<QueueReader>>,
    playback: Option<Mutex<QueueWriter>>,
    capture_queue: Option<QueueHandle>,
    playback_queue: Option<QueueHandle>,
    capture_bytes_per_second: f64,
    counters: Arc<StreamCounters>,
    flags: Arc<RtFlags>,
    last_error: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<StreamEvent>>>,
    settlement: Settlement,
    quitting: AtomicBool,
}

impl StreamEngine {
    /// Validates `options`, opens the platform stream and allocates the queues.
    ///
    /// Nothing is left open on failure.
    #[instrument(name = "stream_create", skip(host, options))]
    pub fn create(host: Arc<dyn AudioHost>, options: AudioIoOptions) -> AudioIoResult<Self> {
        options.validate()?;
        let AudioIoOptions {
            in_options: input,
            out_options: output,
        } = options;

        if let Some(o) = &input {
            info!("Input: {}", o.describe());
        }
        if let Some(o) = &output {
            info!("Output: {}", o.describe());
        }

        let devices = host.devices()?;
        let in_params = input
            .as_ref()
            .map(|o| resolve_params(host.as_ref(), &devices, Direction::Input, o))
            .transpose()?;
        let out_params = output
            .as_ref()
            .map(|o| resolve_params(host.as_ref(), &devices, Direction::Output, o))
            .transpose()?;

        let primary = output
            .as_ref()
            .or(input.as_ref())
            .ok_or_else(|| AudioIoError::InvalidConfiguration("no directions".to_string()))?;
        let frames_per_buffer = [&output, &input]
            .into_iter()
            .flatten()
            .map(|o| o.frames_per_buffer)
            .find(|&frames| frames != 0)
            .unwrap_or(0);

        let request = StreamRequest {
            sample_rate: primary.sample_rate,
            frames_per_buffer,
            input: in_params,
            output: out_params,
        };
        host.check_support(&request)?;

        // The platform may hand over more than one requested block per callback.
        let block_frames = request.block_frames();
        let callback_frames = host.callback_frames(&request)?;
        let queue_frames = block_frames.max(callback_frames);
        if queue_frames != block_frames {
            debug!(block_frames, callback_frames, "Sizing queues for larger callbacks");
        }
        let pieces = queue_frames.div_ceil(block_frames) as usize;
        let queue_bytes = |direction| request.frame_bytes(direction) * queue_frames as usize;
        let capture_bytes_per_second =
            request.frame_bytes(Direction::Input) as f64 * f64::from(request.sample_rate);

        let counters = Arc::new(StreamCounters::new());
        let flags = Arc::new(RtFlags::default());
        let (notice_tx, notice_rx) = bounded(NOTICE_CHANNEL_CAPACITY);

        let (capture_writer, capture_reader) = input
            .as_ref()
            .map(|o| stamped_queue(o.max_queue, queue_bytes(Direction::Input), pieces))
            .unzip();
        let (playback_writer, playback_reader) = output
            .as_ref()
            .map(|o| stamped_queue(o.max_queue, queue_bytes(Direction::Output), 1))
            .unzip();
        let capture_queue = capture_reader.as_ref().map(QueueReader::handle);
        let playback_queue = playback_writer.as_ref().map(QueueWriter::handle);

        let capture_counts_callbacks = playback_reader.is_none();
        let playback_close_on_error = output.as_ref().is_some_and(|o| o.close_on_error);
        let handlers = StreamHandlers {
            input: capture_writer.map(|writer| {
                capture_handler(
                    writer,
                    CaptureContext {
                        counters: Arc::clone(&counters),
                        notices: notice_tx.clone(),
                        counts_callbacks: capture_counts_callbacks,
                        piece_bytes: request.block_bytes(Direction::Input),
                        bytes_per_second: capture_bytes_per_second,
                    },
                )
            }),
            output: playback_reader.map(|reader| {
                playback_handler(
                    reader,
                    PlaybackContext {
                        counters: Arc::clone(&counters),
                        flags: Arc::clone(&flags),
                        notices: notice_tx.clone(),
                        close_on_error: playback_close_on_error,
                        queues: [capture_queue.clone(), playback_queue.clone()]
                            .into_iter()
                            .flatten()
                            .collect(),
                    },
                )
            }),
            error: error_handler(notice_tx),
        };

        let platform = host.open_stream(&request, handlers).map_err(|e| {
            warn!(error = %e, "Failed to open platform stream");
            AudioIoError::from(e)
        })?;

        let inner = Arc::new(EngineInner {
            input,
            output,
            state: RwLock::new(StreamState::Created),
            platform: Mutex::new(Some(platform)),
            capture: capture_reader.map(Mutex::new),
            playback: playback_writer.map(Mutex::new),
            capture_queue,
            playback_queue,
            capture_bytes_per_second,
            counters,
            flags,
            last_error: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            settlement: Settlement::default(),
            quitting: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let supervisor = thread::Builder::new()
            .name("audioio-supervisor".to_string())
            .spawn(move || supervise(weak, notice_rx))
            .map_err(|e| AudioIoError::StreamError(format!("failed to spawn supervisor: {e}")))?;

        info!(
            block_frames,
            callback_frames,
            sample_rate = request.sample_rate,
            "Stream created"
        );

        Ok(Self {
            inner,
            supervisor: Some(supervisor),
        })
    }

    /// Starts the platform callback.
    #[instrument(name = "stream_start", skip(self))]
    pub fn start(&self) -> AudioIoResult<()> {
        {
            let state = self.inner.state.read();
            match &*state {
                StreamState::Created => {}
                StreamState::Started | StreamState::Draining => {
                    return Err(AudioIoError::AlreadyStarted)
                }
                other => {
                    return Err(AudioIoError::InvalidState(format!(
                        "cannot start a stream that is {}",
                        other.name()
                    )))
                }
            }
        }
        if self.inner.quitting.load(Ordering::SeqCst) {
            return Err(AudioIoError::InvalidState("stream is quitting".to_string()));
        }

        self.inner.flags.started.store(true, Ordering::SeqCst);
        let result = match self.inner.platform.lock().as_mut() {
            Some(platform) => platform.start(),
            None => Err(HostError::Closed),
        };
        if let Err(e) = result {
            self.inner.flags.started.store(false, Ordering::SeqCst);
            let err = AudioIoError::from(e);
            error!(error = %err, "Failed to start platform stream");
            return Err(err);
        }

        if !self
            .inner
            .transition_if(|s| matches!(s, StreamState::Created), StreamState::Started)
        {
            let state = self.inner.state();
            return match state {
                StreamState::Started | StreamState::Draining => Err(AudioIoError::AlreadyStarted),
                other => Err(AudioIoError::InvalidState(format!(
                    "stream became {} while starting",
                    other.name()
                ))),
            };
        }

        info!("Stream started");
        Ok(())
    }

    /// Reads up to `size` captured bytes; `size == 0` takes whatever is
    /// queued. Blocks until data arrives. `None` means the stream has finished.
    pub fn read(&self, size: usize) -> AudioIoResult<Option<CapturedChunk>> {
        match self.pop(size, None)? {
            Pop::Data(chunk) => Ok(Some(chunk)),
            Pop::EndOfStream | Pop::Timeout => Ok(None),
        }
    }

    /// Like [`read`](Self::read) but gives up after `timeout`.
    pub fn read_timeout(
        &self,
        size: usize,
        timeout: Duration,
    ) -> AudioIoResult<Pop<CapturedChunk>> {
        self.pop(size, Some(timeout))
    }

    fn pop(&self, size: usize, timeout: Option<Duration>) -> AudioIoResult<Pop<CapturedChunk>> {
        let reader = self
            .inner
            .capture
            .as_ref()
            .ok_or_else(|| AudioIoError::InvalidState("stream has no input".to_string()))?;
        self.inner.check_failed()?;

        let (popped, stamp) = reader.lock().pop_stamped(size, timeout);
        match popped {
            Pop::Data(data) => {
                self.inner.counters.record_read(data.len());
                let timestamp = stamp.map_or(Duration::ZERO, |stamp| {
                    stamp.at + bytes_to_duration(stamp.offset, self.inner.capture_bytes_per_second)
                });
                Ok(Pop::Data(CapturedChunk { data, timestamp }))
            }
            Pop::EndOfStream => {
                self.inner.check_failed()?;
                Ok(Pop::EndOfStream)
            }
            Pop::Timeout => Ok(Pop::Timeout),
        }
    }

    /// Queues `data` for playback, blocking while the queue is full.
    pub fn write(&self, data: &[u8]) -> AudioIoResult<()> {
        let writer = self
            .inner
            .playback
            .as_ref()
            .ok_or_else(|| AudioIoError::InvalidState("stream has no output".to_string()))?;
        self.inner.check_failed()?;
        {
            let state = self.inner.state.read();
            if state.is_terminal() || matches!(*state, StreamState::Draining) {
                return Err(AudioIoError::QueueClosed);
            }
        }

        let result = writer.lock().push(data);
        match result {
            Ok(()) => {
                self.inner.flags.primed.store(true, Ordering::Release);
                self.inner.counters.record_written(data.len());
                Ok(())
            }
            Err(QueueError::Closed) => {
                self.inner.check_failed()?;
                Err(AudioIoError::QueueClosed)
            }
        }
    }

    /// Blocks until everything queued for playback has been handed to the
    /// device. Returns at once if the stream is not running.
    pub fn flush(&self) -> AudioIoResult<()> {
        let Some(queue) = &self.inner.playback_queue else {
            return Ok(());
        };
        queue.wait_empty(|| {
            self.inner.flags.failed.load(Ordering::Acquire)
                || !matches!(
                    *self.inner.state.read(),
                    StreamState::Started | StreamState::Draining
                )
        });
        self.inner.check_failed()
    }

    /// Shuts the stream down. Returns immediately; the work happens on a
    /// worker thread.
    pub fn quit(&self, mode: QuitMode) -> Completion {
        self.quit_with(mode, None)
    }

    /// Like [`quit`](Self::quit), running `on_complete` with the final state.
    #[instrument(name = "stream_quit", skip(self, on_complete))]
    pub fn quit_with(&self, mode: QuitMode, on_complete: Option<CompletionCallback>) -> Completion {
        let completion = self.inner.settlement.register(on_complete);
        match mode {
            QuitMode::Abort => {
                self.inner.flags.aborting.store(true, Ordering::SeqCst);
                self.spawn_worker("audioio-abort", EngineInner::abort_now);
            }
            QuitMode::Wait => {
                if self.inner.quitting.swap(true, Ordering::SeqCst) {
                    debug!("Quit already in progress");
                } else {
                    self.spawn_worker("audioio-drain", EngineInner::finish);
                }
            }
        }
        completion
    }

    fn spawn_worker(&self, name: &str, job: fn(&EngineInner)) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || job(&inner));
        if let Err(e) = spawned {
            warn!(error = %e, worker = name, "Failed to spawn worker, running inline");
            job(&self.inner);
        }
    }

    /// Subscribes to stream events.
    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        let (tx, rx) = event_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StreamStats {
        self.inner.counters.snapshot(
            self.inner.capture_queue.as_ref().map_or(0, QueueHandle::queued),
            self.inner.playback_queue.as_ref().map_or(0, QueueHandle::queued),
        )
    }

    /// Most recent platform error message, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn input_options(&self) -> Option<&AudioOptions> {
        self.inner.input.as_ref()
    }

    pub fn output_options(&self) -> Option<&AudioOptions> {
        self.inner.output.as_ref()
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        // A quit in progress keeps the inner state alive and finishes on its own.
        if self.inner.quitting.load(Ordering::SeqCst) && !self.inner.state().is_terminal() {
            return;
        }
        self.inner.abort_now();
        self.inner.release(true);

        if let Some(handle) = self.supervisor.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl EngineInner {
    fn state(&self) -> StreamState {
        self.state.read().clone()
    }

    /// Moves to `next` if `allowed` accepts the current state.
    fn transition_if(&self, allowed: impl FnOnce(&StreamState) -> bool, next: StreamState) -> bool {
        let mut state = self.state.write();
        if !allowed(&*state) {
            return false;
        }
        let previous = std::mem::replace(&mut *state, next.clone());

        debug!(
            previous = %previous.name(),
            current = %next.name(),
            "State transition"
        );

        // Sent under the lock so observers see transitions in order.
        self.send_event(StreamEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(next),
        });
        true
    }

    fn send_event(&self, event: StreamEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn failure_message(&self) -> String {
        self.last_error
            .lock()
            .clone()
            .unwrap_or_else(|| UNDERFLOW_MESSAGE.to_string())
    }

    fn check_failed(&self) -> AudioIoResult<()> {
        if self.flags.failed.load(Ordering::Acquire) {
            Err(AudioIoError::StreamError(self.failure_message()))
        } else {
            Ok(())
        }
    }

    fn close_on_error(&self, direction: Direction) -> bool {
        let options = match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        };
        options.is_some_and(|o| o.close_on_error)
    }

    fn queues(&self) -> impl Iterator<Item = &QueueHandle> {
        self.capture_queue.iter().chain(self.playback_queue.iter())
    }

    /// Stops and releases the platform stream. Only the first call does anything.
    fn release(&self, abort: bool) {
        let Some(mut platform) = self.platform.lock().take() else {
            return;
        };
        let stopped = if abort {
            platform.abort()
        } else {
            platform.stop()
        };
        if let Err(e) = stopped {
            warn!(error = %e, "Failed to stop platform stream");
        }
        if let Err(e) = platform.close() {
            warn!(error = %e, "Failed to close platform stream");
        }
        info!("Platform stream released");
    }

    fn handle_notice(&self, notice: Notice) {
        match notice {
            Notice::Overrun => {
                let blocks = self.counters.take_unreported_overruns();
                if blocks > 0 {
                    warn!(blocks, "Input overflow, capture blocks dropped");
                    self.send_event(StreamEvent::Overrun { blocks });
                }
            }
            Notice::Underrun => {
                let periods = self.counters.take_unreported_underruns();
                if periods > 0 {
                    warn!(periods, "Output underflow, padded with silence");
                    self.send_event(StreamEvent::Underrun { periods });
                }
                if self.flags.failed.load(Ordering::Acquire) && !self.state().is_terminal() {
                    self.fail(Some(Direction::Output), UNDERFLOW_MESSAGE.to_string());
                }
            }
            Notice::Fault { direction, message } => {
                *self.last_error.lock() = Some(message.clone());
                if self.close_on_error(direction) {
                    self.fail(Some(direction), message);
                } else {
                    warn!(direction = direction.name(), %message, "Audio error, continuing");
                    self.send_event(StreamEvent::Error {
                        direction: Some(direction),
                        fatal: false,
                        message,
                    });
                }
            }
        }
    }

    /// Catches a fatal underrun whose notice was lost to a full channel.
    fn reconcile(&self) {
        if self.flags.failed.load(Ordering::Acquire) && !self.state().is_terminal() {
            warn!("Fatal underrun found without a notice");
            self.handle_notice(Notice::Underrun);
        }
    }

    /// Moves to Errored, unblocks readers and writers, and releases the stream.
    fn fail(&self, direction: Option<Direction>, message: String) {
        let errored = StreamState::Errored {
            message: message.clone(),
        };
        if !self.transition_if(|s| !s.is_terminal(), errored.clone()) {
            return;
        }
        *self.last_error.lock() = Some(message.clone());
        self.flags.failed.store(true, Ordering::Release);
        for queue in self.queues() {
            queue.close();
        }

        error!(direction = ?direction.map(Direction::name), %message, "Audio stream failed");
        self.send_event(StreamEvent::Error {
            direction,
            fatal: true,
            message,
        });

        self.release(true);
        self.send_event(StreamEvent::Closed);
        self.settlement.settle(errored);
    }

    /// Discards queued audio and releases the stream as fast as possible.
    fn abort_now(&self) {
        self.flags.aborting.store(true, Ordering::SeqCst);
        if !self.transition_if(|s| !s.is_terminal(), StreamState::Aborted) {
            return;
        }
        info!("Aborting stream");
        for queue in self.queues() {
            queue.discard();
        }
        self.release(true);
        self.send_event(StreamEvent::Closed);
        self.settlement.settle(StreamState::Aborted);
    }

    /// Graceful quit.
    fn finish(&self) {
        match self.state() {
            StreamState::Created => self.stop_unstarted(),
            StreamState::Started => self.drain(),
            state => debug!(state = state.name(), "Nothing to finish"),
        }
    }

    fn stop_unstarted(&self) {
        if !self.transition_if(|s| matches!(s, StreamState::Created), StreamState::Stopped) {
            // Started concurrently.
            self.drain();
            return;
        }
        // Never played, so there is nothing to drain.
        if let Some(queue) = &self.playback_queue {
            queue.discard();
        }
        if let Some(queue) = &self.capture_queue {
            queue.close();
        }
        self.release(false);
        info!("Stream stopped before start");
        self.send_event(StreamEvent::Closed);
        self.settlement.settle(StreamState::Stopped);
    }

    fn drain(&self) {
        if !matches!(self.state(), StreamState::Started) {
            return;
        }
        // Closed before the state change so the callback never counts the
        // tail of the queue as an underrun once Draining is visible.
        if let Some(queue) = &self.playback_queue {
            queue.close();
        }
        if !self.transition_if(|s| matches!(s, StreamState::Started), StreamState::Draining) {
            return;
        }
        info!("Draining stream");

        if let Some(queue) = &self.playback_queue {
            let emptied = queue.wait_empty(|| {
                self.flags.aborting.load(Ordering::SeqCst)
                    || self.flags.failed.load(Ordering::Acquire)
                    || self.state.read().is_terminal()
            });
            if !emptied {
                debug!("Drain interrupted");
                return;
            }
        }

        self.release(false);
        if let Some(queue) = &self.capture_queue {
            queue.close();
        }

        if self.transition_if(|s| matches!(s, StreamState::Draining), StreamState::Stopped) {
            info!("Stream drained and stopped");
            self.send_event(StreamEvent::Finished);
            self.send_event(StreamEvent::Closed);
            self.settlement.settle(StreamState::Stopped);
        }
    }
}

fn resolve_params(
    host: &dyn AudioHost,
    devices: &[DeviceInfo],
    direction: Direction,
    options: &AudioOptions,
) -> AudioIoResult<ChannelParams> {
    let device = match options.device() {
        Some(id) => id,
        None => host.default_device(direction)?.ok_or_else(|| {
            AudioIoError::InvalidConfiguration(format!("no default {} device", direction.name()))
        })?,
    };

    let info = devices
        .iter()
        .find(|d| d.id == device)
        .ok_or_else(|| AudioIoError::InvalidConfiguration(format!("unknown device {device}")))?;

    let max = info.max_channels(direction);
    if options.channel_count > max {
        return Err(AudioIoError::InvalidConfiguration(format!(
            "{} has {} {} channels, requested {}",
            info.name,
            max,
            direction.name(),
            options.channel_count
        )));
    }

    Ok(ChannelParams {
        device,
        channels: options.channel_count,
        format: options.sample_format,
    })
}

/// Turns notices from the audio side into logs, events and state changes.
fn supervise(engine: Weak<EngineInner>, notices: Receiver<Notice>) {
    debug!("Supervisor starting");

    loop {
        match notices.recv_timeout(SUPERVISOR_TICK) {
            Ok(notice) => {
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                inner.handle_notice(notice);
            }
            Err(RecvTimeoutError::Timeout) => {
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                inner.reconcile();
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use audioio_host::{ClockMode, LoopbackDevice, LoopbackHost};
    use audioio_types::SampleFormat;

    const BLOCK: usize = 16;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// Stereo 16-bit, 4 frames per block: 16 bytes per block.
    fn options(device_id: i32, close_on_error: bool) -> AudioOptions {
        AudioOptions {
            device_id,
            sample_rate: 48000,
            channel_count: 2,
            sample_format: SampleFormat::Int16,
            frames_per_buffer: 4,
            max_queue: 2,
            close_on_error,
            ..AudioOptions::default()
        }
    }

    fn output_engine(host: &LoopbackHost, close_on_error: bool) -> StreamEngine {
        StreamEngine::create(
            Arc::new(host.clone()),
            AudioIoOptions::output(options(1, close_on_error)),
        )
        .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn pump_until_complete(host: &LoopbackHost, completion: &Completion) -> StreamState {
        wait_for(|| {
            host.pump(1);
            completion.is_complete()
        });
        completion.wait()
    }

    fn next_event(
        events: &Receiver<StreamEvent>,
        mut wanted: impl FnMut(&StreamEvent) -> bool,
    ) -> StreamEvent {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("expected event not received: {e}"),
            }
        }
    }

    #[test]
    fn test_abort_before_start_never_calls_back() {
        init_tracing();
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);

        assert_eq!(engine.quit(QuitMode::Abort).wait(), StreamState::Aborted);
        assert_eq!(host.pump(3), 0);
        assert_eq!(host.callback_count(), 0);
        assert_eq!(host.opened_count(), 1);
        assert_eq!(host.released_count(), 1);

        drop(engine);
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_quit_before_start_stops() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);

        assert_eq!(engine.quit(QuitMode::Wait).wait(), StreamState::Stopped);
        assert_eq!(host.callback_count(), 0);
        assert_eq!(host.released_count(), 1);
        assert_eq!(engine.write(&[0; 4]), Err(AudioIoError::QueueClosed));
    }

    #[test]
    fn test_drain_plays_every_byte() {
        init_tracing();
        let host = LoopbackHost::new();
        let engine = Arc::new(output_engine(&host, true));
        let data = pattern(BLOCK * 10);
        engine.start().unwrap();

        let writer = {
            let engine = Arc::clone(&engine);
            let data = data.clone();
            thread::spawn(move || {
                for chunk in data.chunks(24) {
                    engine.write(chunk)?;
                }
                Ok::<_, AudioIoError>(())
            })
        };

        // Only consume full blocks while the writer is still producing.
        while !writer.is_finished() {
            if engine.stats().playback_queued >= BLOCK as u64 {
                host.pump(1);
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        writer.join().unwrap().unwrap();

        let completion = engine.quit(QuitMode::Wait);
        assert_eq!(pump_until_complete(&host, &completion), StreamState::Stopped);

        let played = host.played();
        assert!(played.len() >= data.len());
        assert_eq!(&played[..data.len()], &data[..]);
        assert_eq!(engine.stats().underruns, 0);
        assert_eq!(engine.stats().bytes_written, data.len() as u64);
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_abort_discards_queued_audio() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        let events = engine.subscribe();

        engine.write(&pattern(BLOCK * 2)).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.quit(QuitMode::Abort).wait(), StreamState::Aborted);

        assert_eq!(host.pump(2), 0);
        assert!(host.played().is_empty());
        assert_eq!(engine.stats().playback_queued, 0);
        assert_eq!(engine.write(&[1; 4]), Err(AudioIoError::QueueClosed));
        assert_eq!(
            next_event(&events, |e| matches!(e, StreamEvent::Closed)),
            StreamEvent::Closed
        );
    }

    #[test]
    fn test_underrun_without_close_on_error_continues() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, false);
        let events = engine.subscribe();

        engine.write(&pattern(BLOCK)).unwrap();
        engine.start().unwrap();
        host.pump(3);

        assert_eq!(engine.stats().underruns, 2);
        assert_eq!(&host.played()[BLOCK..], &[0u8; BLOCK * 2][..]);
        next_event(&events, |e| matches!(e, StreamEvent::Underrun { .. }));
        assert_eq!(engine.state(), StreamState::Started);
        engine.write(&pattern(BLOCK)).unwrap();
    }

    #[test]
    fn test_underrun_with_close_on_error_fails_stream() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        let events = engine.subscribe();

        engine.write(&pattern(BLOCK)).unwrap();
        engine.start().unwrap();
        host.pump(2);

        assert!(matches!(
            engine.write(&[1; 4]),
            Err(AudioIoError::StreamError(_))
        ));
        wait_for(|| engine.state().is_errored());
        assert_eq!(
            engine.state(),
            StreamState::Errored {
                message: UNDERFLOW_MESSAGE.to_string()
            }
        );
        next_event(&events, |e| matches!(e, StreamEvent::Error { fatal: true, .. }));
        next_event(&events, |e| matches!(e, StreamEvent::Closed));
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_duplex_rate_mismatch_opens_nothing() {
        let host = LoopbackHost::new();
        let mut input = options(0, true);
        input.sample_rate = 44100;

        let result = StreamEngine::create(
            Arc::new(host.clone()),
            AudioIoOptions::duplex(input, options(0, true)),
        );

        assert!(matches!(result, Err(AudioIoError::InvalidConfiguration(_))));
        assert_eq!(host.opened_count(), 0);
    }

    #[test]
    fn test_duplex_round_trip() {
        init_tracing();
        let host = LoopbackHost::new();
        let mut input = options(0, true);
        input.max_queue = 4;
        let engine = StreamEngine::create(
            Arc::new(host.clone()),
            AudioIoOptions::duplex(input, options(0, true)),
        )
        .unwrap();

        let data = pattern(BLOCK * 2);
        engine.write(&data).unwrap();
        engine.start().unwrap();
        host.pump(2);

        let mut captured = Vec::new();
        while captured.len() < data.len() {
            match engine.read(data.len() - captured.len()).unwrap() {
                Some(chunk) => captured.extend_from_slice(&chunk.data),
                None => panic!("capture ended early"),
            }
        }
        assert_eq!(captured, data);
        assert_eq!(engine.stats().callbacks, 2);

        assert_eq!(engine.quit(QuitMode::Wait).wait(), StreamState::Stopped);
        assert_eq!(engine.read(BLOCK).unwrap(), None);
    }

    #[test]
    fn test_start_twice_and_after_stop() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);

        engine.start().unwrap();
        assert_eq!(engine.start(), Err(AudioIoError::AlreadyStarted));
        assert_eq!(engine.quit(QuitMode::Wait).wait(), StreamState::Stopped);
        assert!(matches!(engine.start(), Err(AudioIoError::InvalidState(_))));
    }

    #[test]
    fn test_overrun_counts_dropped_blocks() {
        let host = LoopbackHost::new();
        let engine = StreamEngine::create(
            Arc::new(host.clone()),
            AudioIoOptions::input(options(2, true)),
        )
        .unwrap();
        let events = engine.subscribe();

        engine.start().unwrap();
        host.pump(5);

        assert_eq!(engine.stats().overruns, 3);
        assert_eq!(engine.stats().callbacks, 5);
        assert_eq!(engine.state(), StreamState::Started);

        let mut reported = 0;
        while reported < 3 {
            if let StreamEvent::Overrun { blocks } =
                next_event(&events, |e| matches!(e, StreamEvent::Overrun { .. }))
            {
                reported += blocks;
            }
        }
        assert_eq!(reported, 3);

        // The oldest blocks survive; the ramp restarts at zero.
        let first = engine.read(BLOCK * 2).unwrap().unwrap().data;
        let expected: Vec<u8> = (0..first.len() as u8).collect();
        assert_eq!(&first[..], &expected[..]);
    }

    #[test]
    fn test_fault_without_close_on_error_continues() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, false);
        let events = engine.subscribe();
        engine.start().unwrap();

        host.inject_fault(Direction::Output, "glitch");

        let event = next_event(&events, |e| matches!(e, StreamEvent::Error { .. }));
        assert!(matches!(event, StreamEvent::Error { fatal: false, .. }));
        assert_eq!(engine.state(), StreamState::Started);
        assert!(engine.last_error().unwrap().contains("glitch"));
        engine.write(&[0; 4]).unwrap();
    }

    #[test]
    fn test_fault_with_close_on_error_errors() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        engine.start().unwrap();

        host.inject_fault(Direction::Output, "device unplugged");

        wait_for(|| engine.state().is_errored());
        match engine.write(&[0; 4]) {
            Err(AudioIoError::StreamError(message)) => assert!(message.contains("device unplugged")),
            other => panic!("unexpected write result: {other:?}"),
        }
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_fault_during_drain_errors() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        engine.write(&pattern(BLOCK)).unwrap();
        engine.start().unwrap();

        let completion = engine.quit(QuitMode::Wait);
        wait_for(|| engine.state() == StreamState::Draining);
        host.inject_fault(Direction::Output, "lost sync");

        let state = completion.wait_timeout(TIMEOUT).unwrap();
        assert!(state.is_errored());
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_abort_preempts_drain() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        engine.write(&pattern(BLOCK * 2)).unwrap();
        engine.start().unwrap();

        let drain = engine.quit(QuitMode::Wait);
        wait_for(|| engine.state() == StreamState::Draining);
        let abort = engine.quit(QuitMode::Abort);

        assert_eq!(abort.wait_timeout(TIMEOUT), Some(StreamState::Aborted));
        assert_eq!(drain.wait_timeout(TIMEOUT), Some(StreamState::Aborted));
        assert!(host.played().is_empty());
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_quit_callback_receives_final_state() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        let (tx, rx) = bounded(1);

        engine.quit_with(
            QuitMode::Abort,
            Some(Box::new(move |state: &StreamState| {
                let _ = tx.send(state.clone());
            })),
        );

        assert_eq!(rx.recv_timeout(TIMEOUT), Ok(StreamState::Aborted));
    }

    #[test]
    fn test_event_sequence_for_graceful_quit() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        let events = engine.subscribe();

        engine.start().unwrap();
        assert_eq!(engine.quit(QuitMode::Wait).wait(), StreamState::Stopped);

        let changed = |previous: StreamState, current: StreamState| StreamEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(current),
        };
        let received: Vec<StreamEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                changed(StreamState::Created, StreamState::Started),
                changed(StreamState::Started, StreamState::Draining),
                changed(StreamState::Draining, StreamState::Stopped),
                StreamEvent::Finished,
                StreamEvent::Closed,
            ]
        );
    }

    #[test]
    fn test_create_errors() {
        let host = LoopbackHost::new();
        let create = |options: AudioIoOptions| StreamEngine::create(Arc::new(host.clone()), options);

        host.set_busy(1, true);
        assert!(matches!(
            create(AudioIoOptions::output(options(1, true))),
            Err(AudioIoError::DeviceBusy(_))
        ));
        host.set_busy(1, false);

        let mut wide = options(1, true);
        wide.channel_count = 8;
        assert!(matches!(
            create(AudioIoOptions::output(wide)),
            Err(AudioIoError::InvalidConfiguration(_))
        ));

        assert!(matches!(
            create(AudioIoOptions::output(options(9, true))),
            Err(AudioIoError::InvalidConfiguration(_))
        ));

        let mut odd_rate = options(1, true);
        odd_rate.sample_rate = 12345;
        assert!(matches!(
            create(AudioIoOptions::output(odd_rate)),
            Err(AudioIoError::InvalidConfiguration(_))
        ));

        assert!(matches!(
            create(AudioIoOptions::default()),
            Err(AudioIoError::InvalidConfiguration(_))
        ));

        host.set_available(false);
        assert!(matches!(
            create(AudioIoOptions::output(options(1, true))),
            Err(AudioIoError::EngineUnavailable(_))
        ));

        assert_eq!(host.opened_count(), 0);
    }

    #[test]
    fn test_default_device_and_wrong_direction() {
        let host = LoopbackHost::new();
        let engine = StreamEngine::create(
            Arc::new(host.clone()),
            AudioIoOptions::input(options(-1, true)),
        )
        .unwrap();

        assert_eq!(host.opened_count(), 1);
        assert!(matches!(
            engine.write(&[0; 4]),
            Err(AudioIoError::InvalidState(_))
        ));
        assert_eq!(
            engine.read_timeout(4, Duration::from_millis(5)),
            Ok(Pop::Timeout)
        );
    }

    #[test]
    fn test_drop_releases_handle() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        engine.start().unwrap();
        drop(engine);

        assert_eq!(host.released_count(), 1);
        assert_eq!(host.pump(1), 0);
    }

    #[test]
    fn test_device_blocks_larger_than_requested() {
        // Requested 4 frames per block; the devices run 16.
        let host = LoopbackHost::with_config(
            vec![
                LoopbackDevice::output_only("Wide Output").with_block_frames(16),
                LoopbackDevice::input_only("Wide Input").with_block_frames(16),
            ],
            ClockMode::Manual,
        );
        let playback = StreamEngine::create(
            Arc::new(host.clone()),
            AudioIoOptions::output(options(0, true)),
        )
        .unwrap();
        let capture = StreamEngine::create(
            Arc::new(host.clone()),
            AudioIoOptions::input(options(1, true)),
        )
        .unwrap();

        let data = pattern(BLOCK * 8);
        playback.write(&data).unwrap();
        playback.start().unwrap();
        capture.start().unwrap();
        host.pump(2);

        assert_eq!(host.played(), data);
        assert_eq!(playback.stats().underruns, 0);
        assert_eq!(playback.state(), StreamState::Started);

        assert_eq!(capture.stats().overruns, 0);
        assert_eq!(capture.stats().bytes_captured, (BLOCK * 8) as u64);
        let chunk = capture.read(0).unwrap().unwrap();
        let expected: Vec<u8> = (0..(BLOCK * 8) as u8).collect();
        assert_eq!(&chunk.data[..], &expected[..]);
        assert_eq!(chunk.timestamp, Duration::ZERO);
    }

    #[test]
    fn test_read_reports_capture_time() {
        let host = LoopbackHost::new();
        let mut input = options(2, true);
        input.max_queue = 4;
        let engine =
            StreamEngine::create(Arc::new(host.clone()), AudioIoOptions::input(input)).unwrap();
        engine.start().unwrap();
        host.pump(3);

        let assert_frames = |chunk: CapturedChunk, frames: f64| {
            let expected = frames / 48000.0;
            let actual = chunk.timestamp.as_secs_f64();
            assert!((actual - expected).abs() < 1e-6, "{actual} != {expected}");
        };
        // Four frames per block; a half block is two frames.
        assert_frames(engine.read(BLOCK).unwrap().unwrap(), 0.0);
        assert_frames(engine.read(BLOCK / 2).unwrap().unwrap(), 4.0);
        assert_frames(engine.read(BLOCK / 2).unwrap().unwrap(), 6.0);
        assert_frames(engine.read(0).unwrap().unwrap(), 8.0);
    }

    #[test]
    fn test_fault_unblocks_pending_read() {
        let host = LoopbackHost::new();
        let engine = Arc::new(
            StreamEngine::create(
                Arc::new(host.clone()),
                AudioIoOptions::input(options(2, true)),
            )
            .unwrap(),
        );
        engine.start().unwrap();

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.read(BLOCK))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        host.inject_fault(Direction::Input, "boom");

        match reader.join().unwrap() {
            Err(AudioIoError::StreamError(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected read result: {other:?}"),
        }
        assert!(engine.state().is_errored());
    }

    #[test]
    fn test_fault_unblocks_pending_write() {
        let host = LoopbackHost::new();
        let engine = Arc::new(output_engine(&host, true));
        // Fills the queue.
        engine.write(&pattern(BLOCK * 2)).unwrap();

        let writer = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.write(&pattern(BLOCK)))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());
        host.inject_fault(Direction::Output, "boom");

        match writer.join().unwrap() {
            Err(AudioIoError::StreamError(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected write result: {other:?}"),
        }
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_fatal_underrun_without_notice_errors() {
        let host = LoopbackHost::new();
        let engine = output_engine(&host, true);
        let events = engine.subscribe();
        engine.start().unwrap();

        // What the playback callback does when the notice channel is full.
        engine.inner.flags.failed.store(true, Ordering::Release);
        for queue in engine.inner.queues() {
            queue.close();
        }

        wait_for(|| engine.state().is_errored());
        next_event(&events, |e| matches!(e, StreamEvent::Error { fatal: true, .. }));
        assert!(matches!(
            engine.write(&[0; 4]),
            Err(AudioIoError::StreamError(_))
        ));
        assert_eq!(host.released_count(), 1);
    }

    #[test]
    fn test_flush_waits_for_playback() {
        let host = LoopbackHost::new();
        let engine = Arc::new(output_engine(&host, true));
        let data = pattern(BLOCK * 2);
        engine.write(&data).unwrap();

        // Nothing drains the queue before start.
        engine.flush().unwrap();
        assert_eq!(engine.stats().playback_queued, data.len() as u64);

        engine.start().unwrap();
        let flusher = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.flush())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!flusher.is_finished());

        host.pump(2);
        flusher.join().unwrap().unwrap();
        assert_eq!(engine.stats().playback_queued, 0);
        assert_eq!(host.played(), data);
    }

    #[test]
    fn test_realtime_clock_drains() {
        let host = LoopbackHost::realtime();
        let engine = output_engine(&host, false);
        engine.start().unwrap();
        engine.write(&pattern(BLOCK * 8)).unwrap();

        let completion = engine.quit(QuitMode::Wait);
        assert_eq!(completion.wait_timeout(TIMEOUT), Some(StreamState::Stopped));
        assert_eq!(engine.stats().bytes_written, (BLOCK * 8) as u64);
        assert_eq!(host.released_count(), 1);
    }
}
