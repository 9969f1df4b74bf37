//! Beat detection
//!
//! Two paths share one strategy instance. When a native tempo tracker is
//! available it is fed the raw block first; the energy-history fallback
//! runs on the spectrum whenever the native path is absent or reports no
//! beat, so its history stays current either way.

use super::tempo::{TempoTracker, TempoTrackerProvider, TrackerAvailability};
use super::{AnalysisContext, AnalysisStrategy, TriggerResult};
use crate::haptics::WaveformType;
use std::collections::VecDeque;
use std::sync::Arc;

/// About one second of blocks at 1024 samples / 44.1 kHz
pub const HISTORY_SIZE: usize = 43;

/// Minimum history before the fallback may trigger
pub const MIN_HISTORY: usize = 10;

/// Native beats faster than this are sharp
const FAST_TEMPO_BPM: f32 = 140.0;

enum NativeTracker {
    /// Not probed yet this session
    Unprobed,
    Active(Box<dyn TempoTracker>),
    /// Probe failed or processing failed; stays off until the session ends
    Disabled,
}

/// Beat detection via native tempo tracking with an energy-history fallback
pub struct BeatDetectionStrategy {
    history: VecDeque<f32>,
    provider: Arc<dyn TempoTrackerProvider>,
    native: NativeTracker,
    current_bpm: f32,
}

impl BeatDetectionStrategy {
    pub fn new(provider: Arc<dyn TempoTrackerProvider>) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_SIZE + 1),
            provider,
            native: NativeTracker::Unprobed,
            current_bpm: 0.0,
        }
    }

    /// Probe for a native tracker at `sample_rate`.
    ///
    /// Runs at most once per session; later calls are no-ops.
    pub fn initialize_tracker(&mut self, sample_rate: u32) {
        if !matches!(self.native, NativeTracker::Unprobed) {
            return;
        }

        self.native = match self.provider.probe(sample_rate) {
            TrackerAvailability::Ready(tracker) => {
                log::info!("Native tempo tracker active at {} Hz", sample_rate);
                NativeTracker::Active(tracker)
            }
            TrackerAvailability::Unavailable(reason) => {
                log::warn!(
                    "Native tempo tracker unavailable ({}), using energy fallback",
                    reason
                );
                NativeTracker::Disabled
            }
        };
    }

    pub fn is_native_active(&self) -> bool {
        matches!(self.native, NativeTracker::Active(_))
    }

    /// Last tempo reported by the native tracker (0 when it never ran)
    pub fn current_bpm(&self) -> f32 {
        self.current_bpm
    }

    /// Entries currently in the fallback energy history
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Feed raw samples to the native tracker.
    ///
    /// A processing failure disables the native path for the rest of the
    /// session and yields no trigger.
    pub fn process_native(&mut self, samples: &[f32], sensitivity: f32) -> Option<TriggerResult> {
        if samples.is_empty() {
            return None;
        }

        let NativeTracker::Active(tracker) = &mut self.native else {
            return None;
        };

        match tracker.process(samples) {
            Ok(estimate) => {
                self.current_bpm = estimate.bpm;
                if !estimate.is_beat {
                    return None;
                }

                let waveform = if estimate.bpm > FAST_TEMPO_BPM {
                    WaveformType::SharpCollision
                } else {
                    WaveformType::Knock
                };
                Some(TriggerResult::new(waveform, estimate.confidence * sensitivity))
            }
            Err(e) => {
                log::warn!("{}; switching to energy fallback", e);
                self.native = NativeTracker::Disabled;
                None
            }
        }
    }

    /// Release the native tracker and allow a fresh probe next session.
    ///
    /// The fallback history is kept.
    pub fn end_session(&mut self) {
        self.native = NativeTracker::Unprobed;
        self.current_bpm = 0.0;
    }
}

impl AnalysisStrategy for BeatDetectionStrategy {
    fn analyze(&mut self, spectrum: &[f32], ctx: &AnalysisContext<'_>) -> Option<TriggerResult> {
        self.initialize_tracker(ctx.sample_rate);

        let energy = ctx.total_energy(spectrum);

        self.history.push_back(energy);
        while self.history.len() > HISTORY_SIZE {
            self.history.pop_front();
        }

        if self.history.len() < MIN_HISTORY {
            return None;
        }

        let average = self.history.iter().sum::<f32>() / self.history.len() as f32;
        let beat_threshold = average * (1.5 + ctx.threshold);
        if energy <= beat_threshold {
            return None;
        }

        let waveform = if energy > beat_threshold * 1.5 {
            WaveformType::SharpCollision
        } else {
            WaveformType::Knock
        };

        Some(TriggerResult::new(waveform, energy / beat_threshold))
    }
}
