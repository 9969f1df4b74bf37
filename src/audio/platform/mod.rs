//! Platform-specific loopback devices
//!
//! Windows gets a native WASAPI loopback client polled directly by the
//! capture loop. Every other platform uses the cpal loopback device.

#[cfg(target_os = "windows")]
pub mod windows;

use super::capture::DeviceOpener;

/// Opener for the system's default audio output on this platform
pub fn system_loopback_opener() -> DeviceOpener {
    #[cfg(target_os = "windows")]
    {
        windows::WasapiLoopback::default_opener()
    }

    #[cfg(not(target_os = "windows"))]
    {
        super::sources::CpalLoopback::default_opener()
    }
}
