//! Haptic waveforms and their event identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Waveforms understood by the haptic output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformType {
    SharpCollision,
    #[default]
    SubtleCollision,
    SharpStateChange,
    DampStateChange,
    Ringing,
    Knock,
    Mad,
}

impl WaveformType {
    pub const ALL: [WaveformType; 7] = [
        WaveformType::SharpCollision,
        WaveformType::SubtleCollision,
        WaveformType::SharpStateChange,
        WaveformType::DampStateChange,
        WaveformType::Ringing,
        WaveformType::Knock,
        WaveformType::Mad,
    ];

    /// Event identifier sent to the haptic output collaborator
    pub fn event_name(self) -> &'static str {
        match self {
            WaveformType::SharpCollision => "sharp_collision",
            WaveformType::SubtleCollision => "subtle_collision",
            WaveformType::SharpStateChange => "sharp_state_change",
            WaveformType::DampStateChange => "damp_state_change",
            WaveformType::Ringing => "ringing",
            WaveformType::Knock => "knock",
            WaveformType::Mad => "mad",
        }
    }

    /// Look up a waveform by event identifier
    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.event_name() == name)
    }
}

impl fmt::Display for WaveformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}
