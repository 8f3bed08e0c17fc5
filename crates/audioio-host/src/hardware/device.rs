//! Device enumeration across cpal hosts.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{BufferSize, HostId, SupportedBufferSize, SupportedStreamConfigRange};
use tracing::{debug, warn};

use audioio_types::{DeviceInfo, Direction, HostApiList, HostApiType, HostInfo, SampleFormat, NO_DEVICE};

use crate::error::HostError;
use crate::{ChannelParams, HostResult, StreamRequest, DEFAULT_FRAMES_PER_BUFFER};

/// Latencies reported above this are treated as bogus and clamped.
const MAX_REPORTED_LATENCY: f64 = 1.0;

/// Assumed largest callback when a backend reports no buffer range.
const UNKNOWN_BUFFER_FRAMES: u32 = 8192;

pub(crate) struct Entry {
    pub host_id: HostId,
    pub device: cpal::Device,
}

/// Every device of every available host, in id order.
pub(crate) fn enumerate() -> HostResult<Vec<Entry>> {
    let hosts = cpal::available_hosts();
    if hosts.is_empty() {
        return Err(HostError::Unavailable("no audio hosts available".to_string()));
    }

    let mut entries = Vec::new();
    for host_id in hosts {
        let host = match cpal::host_from_id(host_id) {
            Ok(host) => host,
            Err(e) => {
                warn!(host = host_id.name(), error = %e, "Skipping unavailable audio host");
                continue;
            }
        };
        match host.devices() {
            Ok(devices) => entries.extend(devices.map(|device| Entry { host_id, device })),
            Err(e) => warn!(host = host_id.name(), error = %e, "Failed to list devices"),
        }
    }

    debug!(count = entries.len(), "Enumerated audio devices");
    Ok(entries)
}

fn configs(device: &cpal::Device, direction: Direction) -> Vec<SupportedStreamConfigRange> {
    let result = match direction {
        Direction::Input => device.supported_input_configs().map(|c| c.collect::<Vec<_>>()),
        Direction::Output => device.supported_output_configs().map(|c| c.collect::<Vec<_>>()),
    };
    result.unwrap_or_default()
}

fn latency(buffer: &SupportedBufferSize, rate: f64) -> (f64, f64) {
    match buffer {
        SupportedBufferSize::Range { min, max } if rate > 0.0 => (
            (*min as f64 / rate).min(MAX_REPORTED_LATENCY),
            (*max as f64 / rate).min(MAX_REPORTED_LATENCY),
        ),
        _ => (0.0, 0.0),
    }
}

pub(crate) fn describe(id: u32, entry: &Entry) -> DeviceInfo {
    let device = &entry.device;
    let max_channels = |direction| {
        configs(device, direction)
            .iter()
            .map(|c| c.channels())
            .max()
            .unwrap_or(0)
    };

    let default_in = device.default_input_config().ok();
    let default_out = device.default_output_config().ok();
    let default_sample_rate = default_out
        .as_ref()
        .or(default_in.as_ref())
        .map(|c| c.sample_rate().0 as f64)
        .unwrap_or(0.0);

    let (low_in, high_in) = default_in
        .as_ref()
        .map(|c| latency(c.buffer_size(), c.sample_rate().0 as f64))
        .unwrap_or((0.0, 0.0));
    let (low_out, high_out) = default_out
        .as_ref()
        .map(|c| latency(c.buffer_size(), c.sample_rate().0 as f64))
        .unwrap_or((0.0, 0.0));

    DeviceInfo {
        id,
        name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
        max_input_channels: max_channels(Direction::Input),
        max_output_channels: max_channels(Direction::Output),
        default_sample_rate,
        default_low_input_latency: low_in,
        default_low_output_latency: low_out,
        default_high_input_latency: high_in,
        default_high_output_latency: high_out,
        host_api_name: entry.host_id.name().to_string(),
    }
}

/// Global id of the device on `host_id` whose name is `name`.
fn find_index(entries: &[Entry], host_id: HostId, name: &str) -> Option<usize> {
    entries.iter().position(|e| {
        e.host_id == host_id && e.device.name().map(|n| n == name).unwrap_or(false)
    })
}

fn default_name(host: &cpal::Host, direction: Direction) -> Option<String> {
    let device = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    device.and_then(|d| d.name().ok())
}

pub(crate) fn host_apis() -> HostResult<HostApiList> {
    let entries = enumerate()?;
    let default_host = cpal::default_host().id();
    let mut list = HostApiList {
        default_host_api: NO_DEVICE,
        host_apis: Vec::new(),
    };

    for (index, host_id) in cpal::available_hosts().into_iter().enumerate() {
        let Ok(host) = cpal::host_from_id(host_id) else {
            continue;
        };
        if host_id == default_host {
            list.default_host_api = index as i32;
        }

        let default_index = |direction| {
            default_name(&host, direction)
                .and_then(|name| find_index(&entries, host_id, &name))
                .map(|i| i as i32)
                .unwrap_or(NO_DEVICE)
        };

        list.host_apis.push(HostInfo {
            id: index as u32,
            name: host_id.name().to_string(),
            host_type: host_id.name().parse().unwrap_or(HostApiType::Unknown),
            device_count: entries.iter().filter(|e| e.host_id == host_id).count() as u32,
            default_input: default_index(Direction::Input),
            default_output: default_index(Direction::Output),
        });
    }

    Ok(list)
}

pub(crate) fn default_device(direction: Direction) -> HostResult<Option<u32>> {
    let entries = enumerate()?;
    let host = cpal::default_host();
    Ok(default_name(&host, direction)
        .and_then(|name| find_index(&entries, host.id(), &name))
        .map(|i| i as u32))
}

pub(crate) fn sample_format(format: SampleFormat) -> HostResult<cpal::SampleFormat> {
    match format {
        SampleFormat::Float32 => Ok(cpal::SampleFormat::F32),
        SampleFormat::Int8 => Ok(cpal::SampleFormat::I8),
        SampleFormat::Int16 => Ok(cpal::SampleFormat::I16),
        SampleFormat::Int32 => Ok(cpal::SampleFormat::I32),
        SampleFormat::Int24 => Err(HostError::FormatNotSupported(
            "packed 24-bit samples are not supported by this backend".to_string(),
        )),
    }
}

fn matching_config(
    entries: &[Entry],
    direction: Direction,
    params: &ChannelParams,
    sample_rate: u32,
) -> HostResult<SupportedStreamConfigRange> {
    let entry = entries
        .get(params.device as usize)
        .ok_or(HostError::DeviceNotFound(params.device))?;
    let format = sample_format(params.format)?;

    configs(&entry.device, direction)
        .into_iter()
        .find(|c| {
            c.channels() == params.channels
                && c.min_sample_rate().0 <= sample_rate
                && sample_rate <= c.max_sample_rate().0
                && c.sample_format() == format
        })
        .ok_or_else(|| {
            HostError::FormatNotSupported(format!(
                "{} {}ch {} Hz {} on device {}",
                direction.name(),
                params.channels,
                sample_rate,
                params.format,
                params.device
            ))
        })
}

pub(crate) fn check_direction(
    entries: &[Entry],
    direction: Direction,
    params: &ChannelParams,
    sample_rate: u32,
) -> HostResult<()> {
    matching_config(entries, direction, params, sample_rate).map(|_| ())
}

/// Buffer size to open `request` with, and the most frames one callback can
/// then carry.
pub(crate) fn buffer_plan(
    entries: &[Entry],
    request: &StreamRequest,
) -> HostResult<(BufferSize, u32)> {
    if request.frames_per_buffer != 0 {
        return Ok((
            BufferSize::Fixed(request.frames_per_buffer),
            request.frames_per_buffer,
        ));
    }

    // Both directions of a duplex stream share one period.
    let mut range: Option<(u32, u32)> = None;
    for direction in [Direction::Input, Direction::Output] {
        let Some(params) = request.params(direction) else {
            continue;
        };
        let config = matching_config(entries, direction, params, request.sample_rate)?;
        let (min, max) = match config.buffer_size() {
            SupportedBufferSize::Range { min, max } => (*min, *max),
            SupportedBufferSize::Unknown => {
                debug!(direction = direction.name(), "Backend reports no buffer range");
                return Ok((BufferSize::Default, UNKNOWN_BUFFER_FRAMES));
            }
        };
        range = Some(match range {
            Some((lo, hi)) => (lo.max(min), hi.min(max)),
            None => (min, max),
        });
    }

    match range {
        Some((min, max)) if min <= max => {
            let frames = DEFAULT_FRAMES_PER_BUFFER.clamp(min, max);
            Ok((BufferSize::Fixed(frames), frames))
        }
        _ => {
            warn!("No common buffer size, using the backend default");
            Ok((BufferSize::Default, UNKNOWN_BUFFER_FRAMES))
        }
    }
}
