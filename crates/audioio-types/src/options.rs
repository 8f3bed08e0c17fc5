//! Stream configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Direction, SampleFormat};

/// Default number of bytes buffered by the stream adapter.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16384;

/// Errors produced while parsing or validating options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither direction was configured.
    #[error("expected inOptions and/or outOptions")]
    NoDirections,

    /// Sample rate of zero.
    #[error("{direction} sample rate must be greater than zero")]
    InvalidSampleRate { direction: &'static str },

    /// Channel count of zero.
    #[error("{direction} channel count must be at least 1")]
    InvalidChannelCount { direction: &'static str },

    /// Queue depth of zero.
    #[error("{direction} maxQueue must be at least 1")]
    InvalidMaxQueue { direction: &'static str },

    /// Duplex directions disagree on the sample rate.
    #[error("duplex streams need one sample rate, got input {input} Hz and output {output} Hz")]
    SampleRateMismatch { input: u32, output: u32 },

    /// Malformed JSON.
    #[error("invalid options: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Options for one direction of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioOptions {
    /// Device index; negative selects the host's default device.
    pub device_id: i32,

    /// Sample rate in Hz. Must match the other direction in duplex mode.
    pub sample_rate: u32,

    /// Interleaved channels delivered per frame.
    pub channel_count: u16,

    /// PCM sample format.
    pub sample_format: SampleFormat,

    /// Frames per callback block; 0 lets the engine choose.
    pub frames_per_buffer: u32,

    /// Maximum number of blocks buffered between the device and the application.
    pub max_queue: usize,

    /// Bytes buffered by the stream adapter before applying backpressure.
    #[serde(alias = "highwaterMark")]
    pub high_water_mark: usize,

    /// Close the stream when an audio error is detected instead of only logging it.
    pub close_on_error: bool,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            device_id: -1,
            sample_rate: 44100,
            channel_count: 2,
            sample_format: SampleFormat::Int8,
            frames_per_buffer: 0,
            max_queue: 2,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            close_on_error: true,
        }
    }
}

impl AudioOptions {
    /// The requested device, or `None` for the default device.
    pub fn device(&self) -> Option<u32> {
        u32::try_from(self.device_id).ok()
    }

    /// Bytes per interleaved frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.channel_count as usize * self.sample_format.bytes_per_sample()
    }

    /// Checks the values that do not depend on the device.
    pub fn validate(&self, direction: Direction) -> Result<(), ConfigError> {
        let direction = direction.name();
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate { direction });
        }
        if self.channel_count == 0 {
            return Err(ConfigError::InvalidChannelCount { direction });
        }
        if self.max_queue == 0 {
            return Err(ConfigError::InvalidMaxQueue { direction });
        }
        Ok(())
    }

    /// One-line description for logs.
    pub fn describe(&self) -> String {
        let device = match self.device() {
            Some(id) => format!("device {id}"),
            None => "default device".to_string(),
        };
        format!(
            "{device}, sample rate {}, channels {}, format {}, max queue {}, frames per buffer {}, close on error {}",
            self.sample_rate,
            self.channel_count,
            self.sample_format,
            self.max_queue,
            self.frames_per_buffer,
            self.close_on_error
        )
    }
}

/// Options for creating a stream: input only, output only, or duplex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioIoOptions {
    /// Capture options; present for readable and duplex streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_options: Option<AudioOptions>,

    /// Playback options; present for writable and duplex streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_options: Option<AudioOptions>,
}

impl AudioIoOptions {
    /// Capture-only options.
    pub fn input(options: AudioOptions) -> Self {
        Self {
            in_options: Some(options),
            out_options: None,
        }
    }

    /// Playback-only options.
    pub fn output(options: AudioOptions) -> Self {
        Self {
            in_options: None,
            out_options: Some(options),
        }
    }

    /// Duplex options.
    pub fn duplex(input: AudioOptions, output: AudioOptions) -> Self {
        Self {
            in_options: Some(input),
            out_options: Some(output),
        }
    }

    /// Parses options from JSON using the camelCase option names.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)?;
        Ok(options)
    }

    /// Whether both directions are configured.
    pub fn is_duplex(&self) -> bool {
        self.in_options.is_some() && self.out_options.is_some()
    }

    /// Checks both directions and the duplex constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.in_options, &self.out_options) {
            (None, None) => Err(ConfigError::NoDirections),
            (Some(input), Some(output)) => {
                input.validate(Direction::Input)?;
                output.validate(Direction::Output)?;
                if input.sample_rate != output.sample_rate {
                    return Err(ConfigError::SampleRateMismatch {
                        input: input.sample_rate,
                        output: output.sample_rate,
                    });
                }
                Ok(())
            }
            (Some(input), None) => input.validate(Direction::Input),
            (None, Some(output)) => output.validate(Direction::Output),
        }
    }
}
