//! Common types shared by the host layer and the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Capture from the device.
    Input,

    /// Playback to the device.
    Output,
}

impl Direction {
    /// Returns the lowercase name used in log fields.
    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// PCM sample format.
///
/// Serialized as its stable numeric tag: `1` for 32-bit float, otherwise the
/// bit depth of the signed integer format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub enum SampleFormat {
    /// 32-bit float in [-1.0, +1.0].
    Float32,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 24-bit integer, packed in 3 bytes.
    Int24,
    /// Signed 32-bit integer.
    Int32,
}

/// Error for a numeric tag that is not a known sample format.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown sample format tag {0} (expected 1, 8, 16, 24 or 32)")]
pub struct UnknownSampleFormat(pub u32);

impl SampleFormat {
    /// Stable wire tag.
    pub fn tag(self) -> u32 {
        match self {
            Self::Float32 => 1,
            Self::Int8 => 8,
            Self::Int16 => 16,
            Self::Int24 => 24,
            Self::Int32 => 32,
        }
    }

    /// Bits per sample.
    pub fn bits(self) -> u32 {
        match self {
            Self::Float32 => 32,
            other => other.tag(),
        }
    }

    /// Bytes per sample.
    pub fn bytes_per_sample(self) -> usize {
        (self.bits() / 8) as usize
    }
}

impl TryFrom<u32> for SampleFormat {
    type Error = UnknownSampleFormat;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Float32),
            8 => Ok(Self::Int8),
            16 => Ok(Self::Int16),
            24 => Ok(Self::Int24),
            32 => Ok(Self::Int32),
            other => Err(UnknownSampleFormat(other)),
        }
    }
}

impl From<SampleFormat> for u32 {
    fn from(format: SampleFormat) -> Self {
        format.tag()
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => write!(f, "f32"),
            other => write!(f, "i{}", other.bits()),
        }
    }
}

/// Kind of host audio API.
///
/// The set is closed; APIs that are not recognized map to `Unknown`, and
/// pre-release APIs report `InDevelopment`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HostApiType {
    InDevelopment,
    DirectSound,
    #[serde(rename = "MME")]
    Mme,
    #[serde(rename = "ASIO")]
    Asio,
    SoundManager,
    CoreAudio,
    #[serde(rename = "OSS")]
    Oss,
    #[serde(rename = "ALSA")]
    Alsa,
    #[serde(rename = "AL")]
    Al,
    #[serde(rename = "BeOS")]
    BeOs,
    #[serde(rename = "WDMKS")]
    Wdmks,
    #[serde(rename = "JACK")]
    Jack,
    #[serde(rename = "WASAPI")]
    Wasapi,
    #[serde(rename = "AudioScienceHPI")]
    AudioScienceHpi,
    Unknown,
}

impl HostApiType {
    /// Every tag, in wire order.
    pub const ALL: [HostApiType; 15] = [
        Self::InDevelopment,
        Self::DirectSound,
        Self::Mme,
        Self::Asio,
        Self::SoundManager,
        Self::CoreAudio,
        Self::Oss,
        Self::Alsa,
        Self::Al,
        Self::BeOs,
        Self::Wdmks,
        Self::Jack,
        Self::Wasapi,
        Self::AudioScienceHpi,
        Self::Unknown,
    ];

    /// Stable string tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InDevelopment => "InDevelopment",
            Self::DirectSound => "DirectSound",
            Self::Mme => "MME",
            Self::Asio => "ASIO",
            Self::SoundManager => "SoundManager",
            Self::CoreAudio => "CoreAudio",
            Self::Oss => "OSS",
            Self::Alsa => "ALSA",
            Self::Al => "AL",
            Self::BeOs => "BeOS",
            Self::Wdmks => "WDMKS",
            Self::Jack => "JACK",
            Self::Wasapi => "WASAPI",
            Self::AudioScienceHpi => "AudioScienceHPI",
            Self::Unknown => "Unknown",
        }
    }
}

impl FromStr for HostApiType {
    type Err = std::convert::Infallible;

    /// Parses a tag; anything unrecognized is `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .unwrap_or(Self::Unknown))
    }
}

impl fmt::Display for HostApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audio device as reported by a catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Stable index of this device within the catalog.
    pub id: u32,

    /// Display name.
    pub name: String,

    /// Maximum capture channels (0 for output-only devices).
    pub max_input_channels: u16,

    /// Maximum playback channels (0 for input-only devices).
    pub max_output_channels: u16,

    /// Default sample rate in Hz.
    pub default_sample_rate: f64,

    /// Default latencies for interactive use, in seconds.
    pub default_low_input_latency: f64,
    pub default_low_output_latency: f64,

    /// Default latencies for robust non-interactive use, in seconds.
    pub default_high_input_latency: f64,
    pub default_high_output_latency: f64,

    /// Name of the host API this device belongs to.
    #[serde(rename = "hostAPIName")]
    pub host_api_name: String,
}

impl DeviceInfo {
    /// Maximum channels for the given direction.
    pub fn max_channels(&self, direction: Direction) -> u16 {
        match direction {
            Direction::Input => self.max_input_channels,
            Direction::Output => self.max_output_channels,
        }
    }
}

/// A host audio API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    /// Index of this host API.
    pub id: u32,

    /// Display name.
    pub name: String,

    /// API kind.
    #[serde(rename = "type")]
    pub host_type: HostApiType,

    /// Number of devices belonging to this host API.
    pub device_count: u32,

    /// Default input device, in `[0, device_count)`, or negative if none.
    pub default_input: i32,

    /// Default output device, in `[0, device_count)`, or negative if none.
    pub default_output: i32,
}

/// Result of a host API query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostApiList {
    /// Index of the default host API, or negative on error.
    #[serde(rename = "defaultHostAPI")]
    pub default_host_api: i32,

    /// All host APIs.
    #[serde(rename = "HostAPIs")]
    pub host_apis: Vec<HostInfo>,
}

/// Point-in-time stream counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Real-time callback invocations.
    pub callbacks: u64,

    /// Bytes delivered by the device into the capture queue.
    pub bytes_captured: u64,

    /// Bytes taken from the playback queue by the device.
    pub bytes_played: u64,

    /// Capture blocks dropped because the queue was full.
    pub overruns: u64,

    /// Playback periods that had to be padded with silence.
    pub underruns: u64,

    /// Bytes handed to the application by `read`.
    pub bytes_read: u64,

    /// Bytes accepted from the application by `write`.
    pub bytes_written: u64,

    /// Bytes currently waiting in the capture queue.
    pub capture_queued: u64,

    /// Bytes currently waiting in the playback queue.
    pub playback_queued: u64,
}
