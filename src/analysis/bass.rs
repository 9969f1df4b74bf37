//! Low-frequency spike detection

use super::{AnalysisContext, AnalysisStrategy, TriggerResult};
use crate::haptics::WaveformType;

const BASS_MIN_HZ: f32 = 20.0;
const BASS_MAX_HZ: f32 = 150.0;

/// Energy must exceed the previous block's by this factor to count as a spike
const SPIKE_RATIO: f32 = 1.5;

/// Triggers on sudden rises in 20-150 Hz energy
#[derive(Debug, Clone, Default)]
pub struct BassStrategy {
    previous_energy: f32,
}

impl BassStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_energy(&self) -> f32 {
        self.previous_energy
    }
}

impl AnalysisStrategy for BassStrategy {
    fn analyze(&mut self, spectrum: &[f32], ctx: &AnalysisContext<'_>) -> Option<TriggerResult> {
        let energy = ctx.band_energy(spectrum, BASS_MIN_HZ, BASS_MAX_HZ);
        let is_spike = energy > self.previous_energy * SPIKE_RATIO;
        self.previous_energy = energy;

        if energy <= ctx.threshold || !is_spike {
            return None;
        }

        let waveform = if energy > ctx.threshold * 2.0 {
            WaveformType::SharpCollision
        } else {
            WaveformType::SubtleCollision
        };

        Some(TriggerResult::new(waveform, energy.min(1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn equal_energy_frames_trigger_at_most_once() {
        let analyzer = analyzer();
        let ctx = context(&analyzer, 0.1, 1.0);
        let spectrum = band_spectrum(20.0, 150.0, 0.5);
        let mut bass = BassStrategy::new();

        assert!(bass.analyze(&spectrum, &ctx).is_some());
        assert!(bass.analyze(&spectrum, &ctx).is_none());
        assert!(bass.analyze(&spectrum, &ctx).is_none());
    }

    #[test]
    fn spike_far_above_threshold_is_sharp() {
        let analyzer = analyzer();
        let ctx = context(&analyzer, 0.1, 1.0);
        let mut bass = BassStrategy::new();

        bass.analyze(&band_spectrum(20.0, 150.0, 0.1), &ctx);
        let result = bass
            .analyze(&band_spectrum(20.0, 150.0, 0.4), &ctx)
            .unwrap();

        assert_eq!(result.waveform, WaveformType::SharpCollision);
        assert!(result.intensity > 0.0 && result.intensity <= 1.0);
    }

    #[test]
    fn spike_just_above_threshold_is_subtle() {
        let analyzer = analyzer();
        let ctx = context(&analyzer, 0.1, 1.0);
        let mut bass = BassStrategy::new();

        bass.analyze(&band_spectrum(20.0, 150.0, 0.05), &ctx);
        let result = bass
            .analyze(&band_spectrum(20.0, 150.0, 0.15), &ctx)
            .unwrap();

        assert_eq!(result.waveform, WaveformType::SubtleCollision);
    }

    #[test]
    fn previous_energy_updates_without_trigger() {
        let analyzer = analyzer();
        let ctx = context(&analyzer, 0.5, 1.0);
        let mut bass = BassStrategy::new();

        // Below threshold: no trigger, but the baseline still moves
        assert!(bass.analyze(&band_spectrum(20.0, 150.0, 0.2), &ctx).is_none());
        assert!((bass.previous_energy() - 0.2).abs() < 1e-5);
    }

    #[test]
    fn sensitivity_scales_before_thresholding() {
        let analyzer = analyzer();
        let spectrum = band_spectrum(20.0, 150.0, 0.08);

        let mut quiet = BassStrategy::new();
        assert!(quiet
            .analyze(&spectrum, &context(&analyzer, 0.1, 1.0))
            .is_none());

        let mut boosted = BassStrategy::new();
        assert!(boosted
            .analyze(&spectrum, &context(&analyzer, 0.1, 2.0))
            .is_some());
    }

    #[test]
    fn energy_outside_bass_band_is_ignored() {
        let analyzer = analyzer();
        let ctx = context(&analyzer, 0.1, 1.0);
        let mut bass = BassStrategy::new();

        assert!(bass
            .analyze(&band_spectrum(1000.0, 4000.0, 1.0), &ctx)
            .is_none());
    }
}
