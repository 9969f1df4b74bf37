//! External tempo / onset tracking
//!
//! Beat detection can use a native tempo tracker when one is available.
//! Availability is decided once per capture session by a
//! [`TempoTrackerProvider`] probe, which returns either a ready tracker or
//! the reason none could be created.

use std::sync::Arc;
use thiserror::Error;

/// Analysis window handed to the native tracker
pub const TRACKER_WINDOW_SIZE: usize = 1024;

/// Samples consumed per native tracker step
pub const TRACKER_HOP_SIZE: usize = 512;

/// Frames quieter than this (dB) are ignored by the native tracker
pub const TRACKER_SILENCE_DB: f32 = -70.0;

/// Tempo tracker errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Tempo tracker initialisation failed: {0}")]
    InitFailed(String),

    #[error("Tempo tracker processing failed: {0}")]
    ProcessFailed(String),
}

/// Result of feeding one block to a tracker
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TempoEstimate {
    /// A beat fell within the block
    pub is_beat: bool,

    /// Running tempo estimate in beats per minute
    pub bpm: f32,

    /// Tracker confidence in the current tempo (0-1 nominal)
    pub confidence: f32,
}

/// A running beat/tempo estimator fed with raw mono samples
pub trait TempoTracker: Send {
    fn process(&mut self, samples: &[f32]) -> Result<TempoEstimate, TrackerError>;
}

/// Outcome of probing for a native tracker
pub enum TrackerAvailability {
    Ready(Box<dyn TempoTracker>),
    Unavailable(String),
}

impl std::fmt::Debug for TrackerAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerAvailability::Ready(_) => f.write_str("Ready"),
            TrackerAvailability::Unavailable(reason) => {
                f.debug_tuple("Unavailable").field(reason).finish()
            }
        }
    }
}

/// Creates tempo trackers for a given sample rate
pub trait TempoTrackerProvider: Send + Sync {
    fn probe(&self, sample_rate: u32) -> TrackerAvailability;
}

/// Provider used when no native tracker is compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTempoTracker;

impl TempoTrackerProvider for NoTempoTracker {
    fn probe(&self, _sample_rate: u32) -> TrackerAvailability {
        TrackerAvailability::Unavailable("no native tempo tracker in this build".to_string())
    }
}

/// The best provider this build offers
pub fn default_provider() -> Arc<dyn TempoTrackerProvider> {
    #[cfg(feature = "aubio")]
    {
        Arc::new(aubio::AubioProvider)
    }

    #[cfg(not(feature = "aubio"))]
    {
        Arc::new(NoTempoTracker)
    }
}

#[cfg(feature = "aubio")]
pub use aubio::{AubioProvider, AubioTempo};

#[cfg(feature = "aubio")]
mod aubio {
    //! Binding to libaubio's `aubio_tempo_t`

    use super::*;
    use std::ffi::CString;
    use std::os::raw::{c_char, c_uint};

    #[repr(C)]
    struct FVec {
        length: c_uint,
        data: *mut f32,
    }

    #[repr(C)]
    struct RawTempo {
        _private: [u8; 0],
    }

    #[link(name = "aubio")]
    extern "C" {
        fn new_aubio_tempo(
            method: *const c_char,
            buf_size: c_uint,
            hop_size: c_uint,
            samplerate: c_uint,
        ) -> *mut RawTempo;
        fn del_aubio_tempo(tempo: *mut RawTempo);
        fn aubio_tempo_do(tempo: *mut RawTempo, input: *const FVec, output: *mut FVec);
        fn aubio_tempo_get_bpm(tempo: *mut RawTempo) -> f32;
        fn aubio_tempo_get_confidence(tempo: *mut RawTempo) -> f32;
        fn aubio_tempo_set_silence(tempo: *mut RawTempo, silence: f32) -> c_uint;

        fn new_fvec(length: c_uint) -> *mut FVec;
        fn del_fvec(vec: *mut FVec);
    }

    /// Probes libaubio's default tempo method
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AubioProvider;

    impl TempoTrackerProvider for AubioProvider {
        fn probe(&self, sample_rate: u32) -> TrackerAvailability {
            match AubioTempo::new(sample_rate) {
                Ok(tracker) => TrackerAvailability::Ready(Box::new(tracker)),
                Err(e) => TrackerAvailability::Unavailable(e.to_string()),
            }
        }
    }

    /// Owned aubio tempo object plus its hop-sized input/output vectors
    pub struct AubioTempo {
        tempo: *mut RawTempo,
        input: *mut FVec,
        output: *mut FVec,
    }

    // The handles are only ever touched through `&mut self`
    unsafe impl Send for AubioTempo {}

    impl AubioTempo {
        pub fn new(sample_rate: u32) -> Result<Self, TrackerError> {
            if sample_rate == 0 {
                return Err(TrackerError::InitFailed("sample rate is 0".to_string()));
            }

            let method = CString::new("default")
                .map_err(|e| TrackerError::InitFailed(e.to_string()))?;

            unsafe {
                let tempo = new_aubio_tempo(
                    method.as_ptr(),
                    TRACKER_WINDOW_SIZE as c_uint,
                    TRACKER_HOP_SIZE as c_uint,
                    sample_rate,
                );
                if tempo.is_null() {
                    return Err(TrackerError::InitFailed(
                        "new_aubio_tempo returned null".to_string(),
                    ));
                }

                let input = new_fvec(TRACKER_HOP_SIZE as c_uint);
                let output = new_fvec(1);

                // Drop releases whatever was allocated
                let tracker = Self {
                    tempo,
                    input,
                    output,
                };
                if input.is_null() || output.is_null() {
                    return Err(TrackerError::InitFailed(
                        "new_fvec returned null".to_string(),
                    ));
                }

                aubio_tempo_set_silence(tempo, TRACKER_SILENCE_DB);
                Ok(tracker)
            }
        }

        unsafe fn step(&mut self, hop: &[f32]) -> bool {
            let input = std::slice::from_raw_parts_mut((*self.input).data, TRACKER_HOP_SIZE);
            input.fill(0.0);
            input[..hop.len()].copy_from_slice(hop);

            aubio_tempo_do(self.tempo, self.input, self.output);
            *(*self.output).data > 0.0
        }
    }

    impl TempoTracker for AubioTempo {
        fn process(&mut self, samples: &[f32]) -> Result<TempoEstimate, TrackerError> {
            let mut is_beat = false;

            unsafe {
                for hop in samples.chunks(TRACKER_HOP_SIZE) {
                    is_beat |= self.step(hop);
                }

                let bpm = aubio_tempo_get_bpm(self.tempo);
                let confidence = aubio_tempo_get_confidence(self.tempo);

                if !bpm.is_finite() || !confidence.is_finite() {
                    return Err(TrackerError::ProcessFailed(format!(
                        "non-finite estimate (bpm {}, confidence {})",
                        bpm, confidence
                    )));
                }

                Ok(TempoEstimate {
                    is_beat,
                    bpm,
                    confidence,
                })
            }
        }
    }

    impl Drop for AubioTempo {
        fn drop(&mut self) {
            unsafe {
                if !self.output.is_null() {
                    del_fvec(self.output);
                }
                if !self.input.is_null() {
                    del_fvec(self.input);
                }
                if !self.tempo.is_null() {
                    del_aubio_tempo(self.tempo);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_provider_reports_unavailable_with_reason() {
        match NoTempoTracker.probe(44_100) {
            TrackerAvailability::Unavailable(reason) => assert!(!reason.is_empty()),
            TrackerAvailability::Ready(_) => panic!("null provider produced a tracker"),
        }
    }

    #[test]
    fn availability_debug_hides_tracker() {
        let unavailable = TrackerAvailability::Unavailable("missing".to_string());
        assert_eq!(format!("{:?}", unavailable), "Unavailable(\"missing\")");
    }

    #[cfg(not(feature = "aubio"))]
    #[test]
    fn default_provider_without_native_support_is_unavailable() {
        assert!(matches!(
            default_provider().probe(48_000),
            TrackerAvailability::Unavailable(_)
        ));
    }
}
