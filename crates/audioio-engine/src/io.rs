//! Byte-stream adapters over a [`StreamEngine`].
//!
//! [`AudioReader`] implements [`std::io::Read`], [`AudioWriter`] implements
//! [`std::io::Write`], and [`AudioDuplex`] implements both and splits into
//! halves that can move to different threads. Errors are logged with an
//! `AudioIO:` prefix before being returned.

use std::io;
use std::sync::Arc;

use tracing::{error, info, instrument};

use audioio_host::AudioHost;
use audioio_types::{AudioIoOptions, QuitMode, StreamEvent, StreamState};

use crate::completion::{Completion, CompletionCallback};
use crate::engine::{CapturedChunk, StreamEngine};
use crate::error::{to_io_error, AudioIoError};
use crate::AudioIoResult;

/// The stream flavour selected by the options.
pub enum AudioIo {
    Reader(AudioReader),
    Writer(AudioWriter),
    Duplex(AudioDuplex),
}

/// Creates a reader, writer or duplex stream depending on which of
/// `in_options` / `out_options` are present.
#[instrument(name = "audio_io", skip(host, options))]
pub fn audio_io(host: Arc<dyn AudioHost>, options: AudioIoOptions) -> AudioIoResult<AudioIo> {
    let has_input = options.in_options.is_some();
    let has_output = options.out_options.is_some();

    let engine = StreamEngine::create(host, options).map_err(log_error)?;
    let engine = Arc::new(engine);

    let io = match (has_input, has_output) {
        (true, true) => AudioIo::Duplex(AudioDuplex::new(engine)),
        (true, false) => AudioIo::Reader(AudioReader::new(engine)),
        (false, true) => AudioIo::Writer(AudioWriter::new(engine)),
        (false, false) => {
            return Err(log_error(AudioIoError::InvalidConfiguration(
                "expected inOptions and/or outOptions".to_string(),
            )))
        }
    };
    Ok(io)
}

fn log_error(err: AudioIoError) -> AudioIoError {
    error!("AudioIO: {}", err);
    err
}

/// Control surface shared by all adapters.
#[derive(Clone)]
struct Control {
    engine: Arc<StreamEngine>,
}

impl Control {
    fn start(&self) -> AudioIoResult<()> {
        self.engine.start().map_err(log_error)
    }

    fn quit(&self, mode: QuitMode, on_complete: Option<CompletionCallback>) -> Completion {
        self.engine.quit_with(mode, on_complete)
    }
}

/// Readable audio stream.
pub struct AudioReader {
    control: Control,
    chunk_size: usize,
}

impl AudioReader {
    fn new(engine: Arc<StreamEngine>) -> Self {
        let chunk_size = engine
            .input_options()
            .map(|o| o.high_water_mark)
            .unwrap_or_default();
        Self {
            control: Control { engine },
            chunk_size,
        }
    }

    /// Next chunk of at most `highWaterMark` bytes with its capture time, or
    /// `None` once finished.
    pub fn read_chunk(&mut self) -> AudioIoResult<Option<CapturedChunk>> {
        self.control.engine.read(self.chunk_size).map_err(log_error)
    }

    pub fn start(&self) -> AudioIoResult<()> {
        self.control.start()
    }

    /// Stops capture; already captured audio stays readable.
    pub fn quit(&self, on_complete: Option<CompletionCallback>) -> Completion {
        self.control.quit(QuitMode::Wait, on_complete)
    }

    /// Stops immediately and discards captured audio.
    pub fn abort(&self, on_complete: Option<CompletionCallback>) -> Completion {
        self.control.quit(QuitMode::Abort, on_complete)
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.control.engine
    }
}

impl io::Read for AudioReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.control.engine.read(buf.len()) {
            Ok(Some(chunk)) => {
                buf[..chunk.data.len()].copy_from_slice(&chunk.data);
                Ok(chunk.data.len())
            }
            Ok(None) => Ok(0),
            Err(e) => Err(to_io_error(log_error(e))),
        }
    }
}

/// Writable audio stream.
///
/// `io::Write::write` takes at most `highWaterMark` bytes per call (all of
/// them when it is 0); backpressure comes from the `maxQueue` capacity of the
/// playback queue.
pub struct AudioWriter {
    control: Control,
    write_limit: usize,
}

impl AudioWriter {
    fn new(engine: Arc<StreamEngine>) -> Self {
        let write_limit = engine
            .output_options()
            .map(|o| o.high_water_mark)
            .unwrap_or_default();
        Self {
            control: Control { engine },
            write_limit,
        }
    }

    /// Queues `data`, blocking while the playback queue is full.
    pub fn write_chunk(&mut self, data: &[u8]) -> AudioIoResult<()> {
        self.control.engine.write(data).map_err(log_error)
    }

    /// Plays out everything queued, then stops and releases the device.
    ///
    /// Returns once the stream is closed.
    pub fn finish(&mut self) -> AudioIoResult<()> {
        let state = self.control.quit(QuitMode::Wait, None).wait();
        match state {
            StreamState::Stopped => {
                info!("AudioIO: finished");
                Ok(())
            }
            StreamState::Errored { message } => Err(log_error(AudioIoError::StreamError(message))),
            other => Err(log_error(AudioIoError::InvalidState(format!(
                "stream ended {}",
                other.name()
            )))),
        }
    }

    pub fn start(&self) -> AudioIoResult<()> {
        self.control.start()
    }

    /// Plays out queued audio, then stops.
    pub fn quit(&self, on_complete: Option<CompletionCallback>) -> Completion {
        self.control.quit(QuitMode::Wait, on_complete)
    }

    /// Stops immediately and discards queued audio.
    pub fn abort(&self, on_complete: Option<CompletionCallback>) -> Completion {
        self.control.quit(QuitMode::Abort, on_complete)
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.control.engine
    }
}

impl io::Write for AudioWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.write_limit {
            0 => buf.len(),
            limit => buf.len().min(limit),
        };
        self.write_chunk(&buf[..n]).map_err(to_io_error)?;
        Ok(n)
    }

    /// Waits until queued audio has reached the device. Only `finish` also
    /// stops the stream.
    fn flush(&mut self) -> io::Result<()> {
        self.control
            .engine
            .flush()
            .map_err(|e| to_io_error(log_error(e)))
    }
}

/// Readable and writable audio stream.
pub struct AudioDuplex {
    reader: AudioReader,
    writer: AudioWriter,
}

impl AudioDuplex {
    fn new(engine: Arc<StreamEngine>) -> Self {
        Self {
            reader: AudioReader::new(Arc::clone(&engine)),
            writer: AudioWriter::new(engine),
        }
    }

    /// Separates the two directions so they can be driven from different threads.
    pub fn split(self) -> (AudioReader, AudioWriter) {
        (self.reader, self.writer)
    }

    pub fn read_chunk(&mut self) -> AudioIoResult<Option<CapturedChunk>> {
        self.reader.read_chunk()
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> AudioIoResult<()> {
        self.writer.write_chunk(data)
    }

    pub fn finish(&mut self) -> AudioIoResult<()> {
        self.writer.finish()
    }

    pub fn start(&self) -> AudioIoResult<()> {
        self.writer.start()
    }

    pub fn quit(&self, on_complete: Option<CompletionCallback>) -> Completion {
        self.writer.quit(on_complete)
    }

    pub fn abort(&self, on_complete: Option<CompletionCallback>) -> Completion {
        self.writer.abort(on_complete)
    }

    pub fn subscribe(&self) -> crossbeam_channel::Receiver<StreamEvent> {
        self.writer.engine().subscribe()
    }

    pub fn engine(&self) -> &StreamEngine {
        self.writer.engine()
    }
}

impl io::Read for AudioDuplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.reader, buf)
    }
}

impl io::Write for AudioDuplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.writer, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.writer)
    }
}
