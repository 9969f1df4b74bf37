//! Cross-platform loopback device built on cpal
//!
//! Opens the default output device as an input stream (loopback) and
//! buffers the downmixed samples until the capture loop polls them.

use super::capture::{downmix_to_mono, CaptureError, DeviceOpener, LoopbackDevice, StreamFormat};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use parking_lot::Mutex;
use std::sync::Arc;

/// Samples received by the stream callback but not yet polled
struct PendingSamples {
    samples: Vec<f32>,

    /// Oldest samples are dropped beyond this many (~2s of audio)
    capacity: usize,

    /// Last stream error reported by the backend
    error: Option<String>,
}

impl PendingSamples {
    fn push(&mut self, mono: &[f32]) {
        self.samples.extend_from_slice(mono);
        if self.samples.len() > self.capacity {
            let excess = self.samples.len() - self.capacity;
            self.samples.drain(..excess);
        }
    }
}

/// Loopback capture of an output device via cpal.
///
/// The `cpal::Stream` is not `Send` on every backend, so this device is only
/// ever created and dropped on the capture thread.
pub struct CpalLoopback {
    _stream: cpal::Stream,
    pending: Arc<Mutex<PendingSamples>>,
    scratch: Vec<f32>,
    format: StreamFormat,
}

impl CpalLoopback {
    /// Open the host's default output device for loopback capture
    pub fn open_default() -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(CaptureError::NoOutputDevice)?;

        if let Ok(name) = device.name() {
            log::info!("Using default output device for loopback: {}", name);
        }

        Self::open(&device)
    }

    /// Open a specific output device for loopback capture
    pub fn open(device: &Device) -> Result<Self, CaptureError> {
        // Loopback streams run in the device's output (mix) format
        let config = device
            .default_output_config()
            .map_err(|e| CaptureError::ConfigError(format!("Loopback config: {}", e)))?;

        let format = StreamFormat {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        };
        let channels = format.channels as usize;

        let pending = Arc::new(Mutex::new(PendingSamples {
            samples: Vec::with_capacity(format.sample_rate as usize),
            capacity: format.sample_rate as usize * 2,
            error: None,
        }));

        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                build_stream::<f32>(device, &config.into(), pending.clone(), channels)
            }
            SampleFormat::I16 => {
                build_stream::<i16>(device, &config.into(), pending.clone(), channels)
            }
            SampleFormat::U16 => {
                build_stream::<u16>(device, &config.into(), pending.clone(), channels)
            }
            other => return Err(CaptureError::UnsupportedFormat(format!("{:?}", other))),
        }
        .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::PlayError(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            pending,
            scratch: Vec::new(),
            format,
        })
    }

    /// Opener for the default output device
    pub fn default_opener() -> DeviceOpener {
        Arc::new(|| Ok(Box::new(Self::open_default()?) as Box<dyn LoopbackDevice>))
    }
}

impl LoopbackDevice for CpalLoopback {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn read_packets(&mut self, sink: &mut dyn FnMut(&[f32])) -> Result<(), CaptureError> {
        let error = {
            let mut pending = self.pending.lock();
            std::mem::swap(&mut pending.samples, &mut self.scratch);
            pending.error.take()
        };

        if !self.scratch.is_empty() {
            sink(&self.scratch);
            self.scratch.clear();
        }

        match error {
            Some(e) => Err(CaptureError::DeviceError(e)),
            None => Ok(()),
        }
    }
}

/// Build audio stream for given sample type
fn build_stream<T: cpal::Sample + cpal::SizedSample>(
    device: &Device,
    config: &StreamConfig,
    pending: Arc<Mutex<PendingSamples>>,
    channels: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    let error_slot = pending.clone();

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono = downmix_to_mono(data, channels);
            pending.lock().push(&mono);
        },
        move |err| {
            log::error!("Audio stream error: {}", err);
            error_slot.lock().error = Some(err.to_string());
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::PendingSamples;

    #[test]
    fn pending_samples_drop_oldest_beyond_capacity() {
        let mut pending = PendingSamples {
            samples: Vec::new(),
            capacity: 4,
            error: None,
        };

        pending.push(&[1.0, 2.0, 3.0]);
        pending.push(&[4.0, 5.0, 6.0]);

        assert_eq!(pending.samples, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn pending_samples_keep_everything_under_capacity() {
        let mut pending = PendingSamples {
            samples: Vec::new(),
            capacity: 8,
            error: None,
        };

        pending.push(&[0.5; 3]);
        pending.push(&[0.25; 2]);

        assert_eq!(pending.samples.len(), 5);
    }
}
