//! Windows WASAPI loopback capture
//!
//! Activates an `IAudioClient` on the default render endpoint in shared
//! loopback mode and drains its packets each time the capture loop polls.
//! All COM objects are created, used and released on the capture thread.

use crate::audio::capture::{
    downmix_to_mono, CaptureError, DeviceOpener, LoopbackDevice, StreamFormat,
};
use std::sync::Arc;

use windows::core::GUID;
use windows::Win32::Media::Audio::{
    eConsole, eRender, IAudioCaptureClient, IAudioClient, IMMDevice, IMMDeviceEnumerator,
    MMDeviceEnumerator, AUDCLNT_BUFFERFLAGS_SILENT, AUDCLNT_SHAREMODE_SHARED,
    AUDCLNT_STREAMFLAGS_LOOPBACK, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED,
};

/// Shared-mode buffer duration: 100ms in 100-nanosecond units
const BUFFER_DURATION_HNS: i64 = 1_000_000;

const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// KSDATAFORMAT_SUBTYPE_IEEE_FLOAT
const SUBTYPE_IEEE_FLOAT: GUID = GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);

/// Sample encoding of the mix format
#[derive(Debug, Clone, Copy, PartialEq)]
enum PacketSample {
    F32,
    I16,
}

/// Balances a successful `CoInitializeEx` on drop
struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    unsafe fn init() -> Self {
        // S_FALSE (already initialised on this thread) still needs balancing
        let initialized = CoInitializeEx(None, COINIT_MULTITHREADED).is_ok();
        Self { initialized }
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { CoUninitialize() };
        }
    }
}

/// Native WASAPI loopback device
pub struct WasapiLoopback {
    capture_client: IAudioCaptureClient,
    audio_client: IAudioClient,
    _device: IMMDevice,
    format: StreamFormat,
    sample: PacketSample,

    // Declared last: interfaces above are released before COM is torn down
    _com: ComGuard,
}

impl WasapiLoopback {
    /// Open the default render endpoint for loopback capture
    pub fn open_default() -> Result<Self, CaptureError> {
        unsafe { Self::open_default_impl() }
    }

    /// Opener for the default render endpoint
    pub fn default_opener() -> DeviceOpener {
        Arc::new(|| Ok(Box::new(Self::open_default()?) as Box<dyn LoopbackDevice>))
    }

    unsafe fn open_default_impl() -> Result<Self, CaptureError> {
        let com = ComGuard::init();

        let enumerator: IMMDeviceEnumerator =
            CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .map_err(|e| device_error("create device enumerator", e))?;

        let device = enumerator
            .GetDefaultAudioEndpoint(eRender, eConsole)
            .map_err(|_| CaptureError::NoOutputDevice)?;

        let audio_client: IAudioClient = device
            .Activate::<IAudioClient>(CLSCTX_ALL, None)
            .map_err(|e| device_error("activate audio client", e))?;

        let format_ptr = audio_client
            .GetMixFormat()
            .map_err(|e| CaptureError::ConfigError(format!("GetMixFormat: {}", e)))?;

        let parsed = parse_mix_format(format_ptr);
        let initialized = audio_client.Initialize(
            AUDCLNT_SHAREMODE_SHARED,
            AUDCLNT_STREAMFLAGS_LOOPBACK,
            BUFFER_DURATION_HNS,
            0,
            format_ptr,
            None,
        );
        CoTaskMemFree(Some(format_ptr as *const _));

        let (format, sample) = parsed?;
        initialized.map_err(|e| device_error("initialize loopback client", e))?;

        let capture_client: IAudioCaptureClient = audio_client
            .GetService()
            .map_err(|e| device_error("get capture client", e))?;

        audio_client
            .Start()
            .map_err(|e| CaptureError::PlayError(e.to_string()))?;

        log::info!(
            "WASAPI loopback: {} Hz, {} channels, {:?} samples",
            format.sample_rate,
            format.channels,
            sample
        );

        Ok(Self {
            capture_client,
            audio_client,
            _device: device,
            format,
            sample,
            _com: com,
        })
    }

    /// Copy one packet out of the WASAPI buffer as mono samples
    unsafe fn read_packet(&mut self) -> Result<Option<Vec<f32>>, CaptureError> {
        let mut data: *mut u8 = std::ptr::null_mut();
        let mut frames = 0u32;
        let mut flags = 0u32;

        self.capture_client
            .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
            .map_err(|e| device_error("GetBuffer", e))?;

        let silent = flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0;
        let channels = self.format.channels as usize;

        let mono = if silent || frames == 0 || data.is_null() {
            None
        } else {
            let count = frames as usize * channels;
            Some(match self.sample {
                PacketSample::F32 => {
                    downmix_to_mono(std::slice::from_raw_parts(data as *const f32, count), channels)
                }
                PacketSample::I16 => {
                    downmix_to_mono(std::slice::from_raw_parts(data as *const i16, count), channels)
                }
            })
        };

        // Release before the samples reach the (synchronous) analysis path
        self.capture_client
            .ReleaseBuffer(frames)
            .map_err(|e| device_error("ReleaseBuffer", e))?;

        Ok(mono)
    }
}

impl LoopbackDevice for WasapiLoopback {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn read_packets(&mut self, sink: &mut dyn FnMut(&[f32])) -> Result<(), CaptureError> {
        unsafe {
            let mut packet_size = self
                .capture_client
                .GetNextPacketSize()
                .map_err(|e| device_error("GetNextPacketSize", e))?;

            while packet_size > 0 {
                if let Some(mono) = self.read_packet()? {
                    sink(&mono);
                }

                packet_size = self
                    .capture_client
                    .GetNextPacketSize()
                    .map_err(|e| device_error("GetNextPacketSize", e))?;
            }
        }

        Ok(())
    }
}

impl Drop for WasapiLoopback {
    fn drop(&mut self) {
        unsafe {
            let _ = self.audio_client.Stop();
        }
    }
}

/// Read sample rate, channel count and sample encoding from a mix format
unsafe fn parse_mix_format(
    format_ptr: *const WAVEFORMATEX,
) -> Result<(StreamFormat, PacketSample), CaptureError> {
    if format_ptr.is_null() {
        return Err(CaptureError::ConfigError("null mix format".to_string()));
    }

    let format = format_ptr.read_unaligned();
    let tag = format.wFormatTag;
    let bits = format.wBitsPerSample;

    let is_float = if tag == WAVE_FORMAT_EXTENSIBLE {
        let ext = (format_ptr as *const WAVEFORMATEXTENSIBLE).read_unaligned();
        let sub_format = ext.SubFormat;
        sub_format == SUBTYPE_IEEE_FLOAT
    } else {
        tag == WAVE_FORMAT_IEEE_FLOAT
    };

    let sample = match (is_float, bits) {
        (true, 32) => PacketSample::F32,
        (false, 16) => PacketSample::I16,
        _ => {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} bit {}",
                bits,
                if is_float { "float" } else { "integer" }
            )))
        }
    };

    let stream_format = StreamFormat {
        sample_rate: format.nSamplesPerSec,
        channels: format.nChannels,
    };

    Ok((stream_format, sample))
}

fn device_error(step: &str, e: windows::core::Error) -> CaptureError {
    CaptureError::DeviceError(format!("Failed to {}: {}", step, e))
}
