//! Smoothed loudness following

use super::{AnalysisContext, AnalysisStrategy, TriggerResult};
use crate::haptics::WaveformType;

/// Weight of the newest block in the exponential moving average
const SMOOTHING_FACTOR: f32 = 0.3;

/// Triggers on smoothed whole-spectrum RMS, tiered by multiples of the threshold
#[derive(Debug, Clone, Default)]
pub struct AmplitudeStrategy {
    smoothed: f32,
}

impl AmplitudeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn smoothed(&self) -> f32 {
        self.smoothed
    }
}

impl AnalysisStrategy for AmplitudeStrategy {
    fn analyze(&mut self, spectrum: &[f32], ctx: &AnalysisContext<'_>) -> Option<TriggerResult> {
        let raw = ctx.total_energy(spectrum);
        self.smoothed = self.smoothed * (1.0 - SMOOTHING_FACTOR) + raw * SMOOTHING_FACTOR;

        if self.smoothed < ctx.threshold {
            return None;
        }

        let waveform = if self.smoothed > ctx.threshold * 3.0 {
            WaveformType::SharpCollision
        } else if self.smoothed > ctx.threshold * 2.0 {
            WaveformType::SubtleCollision
        } else {
            WaveformType::DampStateChange
        };

        Some(TriggerResult::new(waveform, self.smoothed.min(1.0)))
    }
}
