//! Output device discovery, selection, and the playback seam.
//!
//! The session layer talks to the audio hardware through three small traits:
//! - [`OutputBackend`]: opens one output stream per connection
//! - [`OutputSink`]: the `Send` writer half handed to the pipeline consumer
//! - [`OutputHandle`]: the device half kept by the owning session
//!
//! The cpal implementation bridges the consumer's blocking block writes into
//! the real-time callback through a bounded [`SharedBytes`] queue: the
//! callback drains it without blocking and fills underruns with silence.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::queue::SharedBytes;
use crate::wire::SampleFormat;

/// Parameters for opening one output stream. `channels` is already capped at
/// the device capacity; blocks arriving at the sink carry exactly this layout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutputSpec {
    pub(crate) format: SampleFormat,
    pub(crate) sample_rate: u32,
    pub(crate) channels: u16,
    pub(crate) frames_per_block: u32,
}

/// Blocking writer half, owned by the pipeline consumer thread.
pub(crate) trait OutputSink: Send {
    /// Write one audio block, blocking until the device side has room.
    fn write(&self, block: &[u8]) -> Result<()>;
}

/// Device half kept by the owning session; closing releases the stream.
///
/// Must be closed only after the consumer thread using the matching sink has
/// been joined, so no write can land on a released stream.
pub(crate) trait OutputHandle {
    fn close(&mut self);
}

pub(crate) struct OpenOutput {
    pub(crate) sink: Box<dyn OutputSink>,
    pub(crate) handle: Box<dyn OutputHandle>,
}

/// Factory for per-connection output streams.
pub(crate) trait OutputBackend {
    /// Most channels the chosen device can play; streams with more get their
    /// extra channels chopped before submission.
    fn channel_capacity(&self) -> u16;

    fn open(&self, spec: &OutputSpec) -> Result<OpenOutput>;
}

/// Pick a CPAL output device.
///
/// - If `needle` is `Some`, chooses the first output device whose name
///   contains the substring (case-insensitive).
/// - Otherwise, returns the host default output device.
pub(crate) fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        let needle_lc = needle.to_lowercase();
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| n.name().to_lowercase().contains(&needle_lc))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Print available output devices to stdout (`--list-devices` UX).
pub(crate) fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

/// Most output channels the device supports across its configs.
pub(crate) fn output_channel_capacity(device: &cpal::Device) -> Result<u16> {
    let default_channels = device
        .default_output_config()
        .context("default output config")?
        .channels();

    let max = device
        .supported_output_configs()
        .map(|configs| configs.map(|c| c.channels()).max())
        .ok()
        .flatten();

    Ok(max.unwrap_or(default_channels).max(default_channels))
}

/// Opens one cpal stream per connection on a fixed device.
pub(crate) struct CpalBackend {
    device: cpal::Device,
    capacity: u16,
}

impl CpalBackend {
    pub(crate) fn new(device: cpal::Device, capacity: u16) -> Self {
        Self { device, capacity }
    }
}

impl OutputBackend for CpalBackend {
    fn channel_capacity(&self) -> u16 {
        self.capacity
    }

    fn open(&self, spec: &OutputSpec) -> Result<OpenOutput> {
        let sample_size = spec.format.sample_size();
        let block_bytes = spec.frames_per_block as usize * spec.channels as usize * sample_size;
        // Room for a handful of blocks between consumer and callback.
        let queue = Arc::new(SharedBytes::new((block_bytes * 4).max(4096)));

        let config = cpal::StreamConfig {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let device_format = self
            .device
            .default_output_config()
            .context("default output config")?
            .sample_format();

        let stream = match device_format {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&self.device, &config, spec.format, queue.clone())
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&self.device, &config, spec.format, queue.clone())
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&self.device, &config, spec.format, queue.clone())
            }
            other => Err(anyhow!("Unsupported device sample format: {other:?}")),
        }?;
        stream.play().context("start output stream")?;

        Ok(OpenOutput {
            sink: Box::new(QueueSink {
                queue: queue.clone(),
            }),
            handle: Box::new(CpalHandle {
                queue,
                stream: Some(stream),
            }),
        })
    }
}

/// Type-specialized stream builder for the device sample format.
///
/// The callback pops whole samples from the byte queue, decodes them from the
/// wire format to `f32`, and converts to the device format. Underruns are
/// filled with silence.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    wire_format: SampleFormat,
    queue: Arc<SharedBytes>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let decode = sample_decoder(wire_format);
    let sample_size = wire_format.sample_size();

    // A dead stream stops draining the queue; closing it unblocks any writer.
    let err_queue = queue.clone();
    let err_fn = move |err| {
        eprintln!("Stream error: {err}");
        err_queue.close();
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let bytes = queue
                .pop_chunk(data.len() * sample_size, sample_size)
                .unwrap_or_default();
            let mut samples = bytes.chunks_exact(sample_size);
            for slot in data.iter_mut() {
                *slot = match samples.next() {
                    Some(raw) => T::from_sample(decode(raw)),
                    None => T::EQUILIBRIUM,
                };
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Decoder from one wire sample (little-endian, `sample_size` bytes) to `f32`
/// in [-1, 1].
fn sample_decoder(format: SampleFormat) -> fn(&[u8]) -> f32 {
    match format {
        SampleFormat::F32 => |b: &[u8]| f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        SampleFormat::I32 => {
            |b: &[u8]| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::I24 => |b: &[u8]| {
            let raw = ((b[2] as i8 as i32) << 16) | ((b[1] as i32) << 8) | b[0] as i32;
            raw as f32 / 8_388_608.0
        },
        SampleFormat::I16 => |b: &[u8]| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0,
        SampleFormat::I8 => |b: &[u8]| (b[0] as i8) as f32 / 128.0,
        SampleFormat::U8 => |b: &[u8]| (b[0] as f32 - 128.0) / 128.0,
    }
}

/// `Send` half: writes are blocking pushes into the shared byte queue.
struct QueueSink {
    queue: Arc<SharedBytes>,
}

impl OutputSink for QueueSink {
    fn write(&self, block: &[u8]) -> Result<()> {
        if self.queue.push_blocking(block) {
            Ok(())
        } else {
            Err(anyhow!("output stream closed"))
        }
    }
}

/// Keeps the cpal stream alive; owned by the session on the scheduler thread
/// (`cpal::Stream` is not `Send`).
struct CpalHandle {
    queue: Arc<SharedBytes>,
    stream: Option<cpal::Stream>,
}

impl OutputHandle for CpalHandle {
    fn close(&mut self) {
        self.queue.close();
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Appends every written block to a shared log.
    pub(crate) struct MockSink {
        pub(crate) writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl OutputSink for MockSink {
        fn write(&self, block: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(block.to_vec());
            Ok(())
        }
    }

    pub(crate) struct MockHandle;

    impl OutputHandle for MockHandle {
        fn close(&mut self) {}
    }

    /// Backend whose opened sinks all record into one shared write log.
    pub(crate) struct MockBackend {
        capacity: u16,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl MockBackend {
        pub(crate) fn with_log(capacity: u16, writes: Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
            Self { capacity, writes }
        }
    }

    impl OutputBackend for MockBackend {
        fn channel_capacity(&self) -> u16 {
            self.capacity
        }

        fn open(&self, _spec: &OutputSpec) -> Result<OpenOutput> {
            Ok(OpenOutput {
                sink: Box::new(MockSink {
                    writes: self.writes.clone(),
                }),
                handle: Box::new(MockHandle),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_i16_extremes() {
        let decode = sample_decoder(SampleFormat::I16);
        assert_eq!(decode(&[0x00, 0x80]), -1.0);
        assert_eq!(decode(&[0x00, 0x00]), 0.0);
        assert!((decode(&[0xFF, 0x7F]) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn decodes_u8_midpoint_as_silence() {
        let decode = sample_decoder(SampleFormat::U8);
        assert_eq!(decode(&[128]), 0.0);
        assert_eq!(decode(&[0]), -1.0);
    }

    #[test]
    fn decodes_i24_sign_extension() {
        let decode = sample_decoder(SampleFormat::I24);
        assert_eq!(decode(&[0x00, 0x00, 0x80]), -1.0);
        assert_eq!(decode(&[0x00, 0x00, 0x00]), 0.0);
        assert!(decode(&[0xFF, 0xFF, 0xFF]) < 0.0); // -1 in two's complement
    }

    #[test]
    fn decodes_f32_passthrough() {
        let decode = sample_decoder(SampleFormat::F32);
        assert_eq!(decode(&0.25f32.to_le_bytes()), 0.25);
    }
}
