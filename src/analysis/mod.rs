//! Analysis strategies that turn a spectrum into trigger decisions
//!
//! Every strategy is stateful: smoothing and history carry over from one
//! block to the next for the same instance. The [`StrategyCache`] keeps one
//! instance per mode for the controller's lifetime, so switching away from a
//! mode and back resumes with its accumulated state.

mod amplitude;
mod bass;
mod beat;
mod multi_band;
pub mod tempo;

pub use amplitude::AmplitudeStrategy;
pub use bass::BassStrategy;
pub use beat::BeatDetectionStrategy;
pub use multi_band::MultiBandStrategy;
pub use tempo::{
    default_provider, NoTempoTracker, TempoEstimate, TempoTracker, TempoTrackerProvider,
    TrackerAvailability, TrackerError,
};

#[cfg(test)]
pub(crate) use beat::tests as beat_tests;

use crate::audio::SpectrumAnalyzer;
use crate::haptics::WaveformType;
use crate::settings::AnalysisMode;
use std::sync::Arc;

/// A decision to fire one waveform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerResult {
    pub waveform: WaveformType,

    /// Intensity in [0, 1]
    pub intensity: f32,
}

impl TriggerResult {
    /// Build a result, clamping intensity into [0, 1]
    pub fn new(waveform: WaveformType, intensity: f32) -> Self {
        let intensity = if intensity.is_nan() {
            0.0
        } else {
            intensity.clamp(0.0, 1.0)
        };
        Self {
            waveform,
            intensity,
        }
    }
}

/// Per-block inputs shared by all strategies
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub analyzer: &'a SpectrumAnalyzer,
    pub sample_rate: u32,

    /// Minimum (sensitivity-scaled) energy to trigger
    pub threshold: f32,

    /// Multiplier applied to every energy before thresholding
    pub sensitivity: f32,
}

impl AnalysisContext<'_> {
    /// Sensitivity-scaled band energy over `[min_freq, max_freq]`
    pub fn band_energy(&self, spectrum: &[f32], min_freq: f32, max_freq: f32) -> f32 {
        self.analyzer
            .band_energy(spectrum, self.sample_rate, min_freq, max_freq)
            * self.sensitivity
    }

    /// Sensitivity-scaled RMS over the whole spectrum
    pub fn total_energy(&self, spectrum: &[f32]) -> f32 {
        crate::audio::rms(spectrum) * self.sensitivity
    }
}

/// One interchangeable trigger algorithm
pub trait AnalysisStrategy: Send {
    /// Decide whether this block triggers; `None` means stay quiet
    fn analyze(&mut self, spectrum: &[f32], ctx: &AnalysisContext<'_>) -> Option<TriggerResult>;
}

/// Lazily created strategy instances, one per mode
pub struct StrategyCache {
    bass: Option<BassStrategy>,
    multi_band: Option<MultiBandStrategy>,
    beat: Option<BeatDetectionStrategy>,
    amplitude: Option<AmplitudeStrategy>,
    tempo_provider: Arc<dyn TempoTrackerProvider>,
}

impl StrategyCache {
    pub fn new(tempo_provider: Arc<dyn TempoTrackerProvider>) -> Self {
        Self {
            bass: None,
            multi_band: None,
            beat: None,
            amplitude: None,
            tempo_provider,
        }
    }

    /// Strategy for `mode`, created on first use
    pub fn get(&mut self, mode: AnalysisMode) -> &mut dyn AnalysisStrategy {
        match mode {
            AnalysisMode::Bass => self.bass.get_or_insert_with(BassStrategy::new),
            AnalysisMode::MultiBand => self.multi_band.get_or_insert_with(MultiBandStrategy::new),
            AnalysisMode::BeatDetection => self.beat_detection(),
            AnalysisMode::Amplitude => self.amplitude.get_or_insert_with(AmplitudeStrategy::new),
        }
    }

    /// The beat detection strategy, created on first use
    pub fn beat_detection(&mut self) -> &mut BeatDetectionStrategy {
        let provider = &self.tempo_provider;
        self.beat
            .get_or_insert_with(|| BeatDetectionStrategy::new(provider.clone()))
    }

    /// The beat detection strategy if it has been created
    pub fn existing_beat_detection(&self) -> Option<&BeatDetectionStrategy> {
        self.beat.as_ref()
    }

    pub fn existing_beat_detection_mut(&mut self) -> Option<&mut BeatDetectionStrategy> {
        self.beat.as_mut()
    }

    /// Whether `mode` already has an instance
    pub fn contains(&self, mode: AnalysisMode) -> bool {
        match mode {
            AnalysisMode::Bass => self.bass.is_some(),
            AnalysisMode::MultiBand => self.multi_band.is_some(),
            AnalysisMode::BeatDetection => self.beat.is_some(),
            AnalysisMode::Amplitude => self.amplitude.is_some(),
        }
    }

    /// Drop every instance, releasing any native tracker
    pub fn dispose(&mut self) {
        self.bass = None;
        self.multi_band = None;
        self.beat = None;
        self.amplitude = None;
    }
}
