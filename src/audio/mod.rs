//! Audio capture and spectrum analysis

mod capture;
mod fft;
mod platform;
mod sources;

pub use capture::{
    downmix_to_mono, BlockAccumulator, BlockCallback, CaptureError, CaptureSource, DeviceOpener,
    LoopbackCapture, LoopbackDevice, SampleBlock, StreamFormat, DEFAULT_INIT_TIMEOUT,
    DEFAULT_JOIN_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
pub use fft::{rms, SpectrumAnalyzer, SpectrumError};
pub use platform::system_loopback_opener;
pub use sources::CpalLoopback;

#[cfg(target_os = "windows")]
pub use platform::windows::WasapiLoopback;

#[cfg(test)]
pub(crate) use capture::tests as capture_tests;
