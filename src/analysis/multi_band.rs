//! Dominant-band waveform selection

use super::{AnalysisContext, AnalysisStrategy, TriggerResult};
use crate::haptics::WaveformType;

/// Frequency bands in precedence order (lower bands win ties)
const BANDS: [(f32, f32, WaveformType); 3] = [
    (20.0, 150.0, WaveformType::SharpCollision),
    (150.0, 2000.0, WaveformType::SubtleCollision),
    (2000.0, 8000.0, WaveformType::SharpStateChange),
];

/// Picks a waveform by whichever of bass, mid and high carries the most energy
#[derive(Debug, Clone, Default)]
pub struct MultiBandStrategy;

impl MultiBandStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl AnalysisStrategy for MultiBandStrategy {
    fn analyze(&mut self, spectrum: &[f32], ctx: &AnalysisContext<'_>) -> Option<TriggerResult> {
        let mut dominant: Option<(f32, WaveformType)> = None;

        for (min_freq, max_freq, waveform) in BANDS {
            let energy = ctx.band_energy(spectrum, min_freq, max_freq);
            // Strictly greater keeps the earlier (lower) band on ties
            if dominant.map_or(true, |(best, _)| energy > best) {
                dominant = Some((energy, waveform));
            }
        }

        let (max_energy, waveform) = dominant?;
        if max_energy < ctx.threshold {
            return None;
        }

        Some(TriggerResult::new(waveform, max_energy.min(1.0)))
    }
}
