//! Humming configuration and its persistence
//!
//! Settings are stored as four text values keyed by name. Loading is
//! forgiving: every missing or unparseable value falls back to its default.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const SETTING_ENABLED: &str = "humming_enabled";
pub const SETTING_MODE: &str = "humming_mode";
pub const SETTING_THRESHOLD: &str = "humming_threshold";
pub const SETTING_SENSITIVITY: &str = "humming_sensitivity";

pub const DEFAULT_THRESHOLD: f32 = 0.1;
pub const DEFAULT_SENSITIVITY: f32 = 1.0;
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

pub const MIN_SENSITIVITY: f32 = 0.1;
pub const MAX_SENSITIVITY: f32 = 5.0;

/// Threshold change per adjustment tick
pub const THRESHOLD_STEP: f32 = 0.05;

/// Sensitivity change per adjustment tick
pub const SENSITIVITY_STEP: f32 = 0.1;

/// Settings persistence errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Audio analysis strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AnalysisMode {
    /// Trigger on low-frequency energy spikes
    Bass,

    /// Pick a waveform by the dominant of three frequency bands
    MultiBand,

    /// Trigger on beats (native tempo tracker or energy history)
    #[default]
    BeatDetection,

    /// Follow overall loudness
    Amplitude,
}

impl AnalysisMode {
    /// Persisted order
    pub const ALL: [AnalysisMode; 4] = [
        AnalysisMode::Bass,
        AnalysisMode::MultiBand,
        AnalysisMode::BeatDetection,
        AnalysisMode::Amplitude,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|m| *m == self).unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Next mode in cycle order, wrapping around
    pub fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisMode::Bass => "Bass",
            AnalysisMode::MultiBand => "MultiBand",
            AnalysisMode::BeatDetection => "BeatDetection",
            AnalysisMode::Amplitude => "Amplitude",
        };
        f.write_str(name)
    }
}

/// Humming mode configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HummingSettings {
    /// Whether Humming mode may run at all
    pub enabled: bool,

    /// Active analysis strategy
    pub analysis_mode: AnalysisMode,

    /// Minimum energy to trigger (0-1)
    pub threshold: f32,

    /// Multiplier applied to every energy before thresholding (0.1-5.0)
    pub sensitivity: f32,

    /// Samples per analysis block (power of two, fixed once capture starts)
    pub block_size: usize,
}

impl Default for HummingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            analysis_mode: AnalysisMode::default(),
            threshold: DEFAULT_THRESHOLD,
            sensitivity: DEFAULT_SENSITIVITY,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Settings shared between the controller and the capture thread
pub type SharedSettings = Arc<RwLock<HummingSettings>>;

impl HummingSettings {
    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    /// Set the threshold, clamped to [0, 1]
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = clamp_or(threshold, 0.0, 1.0, DEFAULT_THRESHOLD);
    }

    /// Set the sensitivity, clamped to [0.1, 5.0]
    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        self.sensitivity = clamp_or(
            sensitivity,
            MIN_SENSITIVITY,
            MAX_SENSITIVITY,
            DEFAULT_SENSITIVITY,
        );
    }

    pub fn adjust_threshold(&mut self, ticks: i32) {
        self.set_threshold(self.threshold + ticks as f32 * THRESHOLD_STEP);
    }

    pub fn adjust_sensitivity(&mut self, ticks: i32) {
        self.set_sensitivity(self.sensitivity + ticks as f32 * SENSITIVITY_STEP);
    }

    pub fn reset_threshold(&mut self) {
        self.threshold = DEFAULT_THRESHOLD;
    }

    pub fn reset_sensitivity(&mut self) {
        self.sensitivity = DEFAULT_SENSITIVITY;
    }

    /// Load from a store, falling back per field to the defaults
    pub fn load(store: &dyn SettingsStore) -> Self {
        let defaults = Self::default();

        let enabled = store
            .get(SETTING_ENABLED)
            .and_then(|v| v.trim().to_ascii_lowercase().parse::<bool>().ok())
            .unwrap_or(defaults.enabled);

        let analysis_mode = store
            .get(SETTING_MODE)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .and_then(AnalysisMode::from_index)
            .unwrap_or(defaults.analysis_mode);

        let threshold = store
            .get(SETTING_THRESHOLD)
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(defaults.threshold);

        let sensitivity = store
            .get(SETTING_SENSITIVITY)
            .and_then(|v| v.trim().parse::<f32>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(defaults.sensitivity);

        let mut settings = Self {
            enabled,
            analysis_mode,
            ..defaults
        };
        // Hand-edited stores may hold out-of-range values
        settings.set_threshold(threshold);
        settings.set_sensitivity(sensitivity);
        settings
    }

    /// Write the four persisted fields to a store
    pub fn save(&self, store: &mut dyn SettingsStore) {
        store.set(SETTING_ENABLED, self.enabled.to_string());
        store.set(SETTING_MODE, self.analysis_mode.index().to_string());
        store.set(SETTING_THRESHOLD, format!("{:.2}", self.threshold));
        store.set(SETTING_SENSITIVITY, format!("{:.2}", self.sensitivity));
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}

/// Key/value text store backing the persisted settings
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: String);
}

/// In-memory settings store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }
}

/// Settings store persisted as a flat JSON object of strings
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl JsonFileStore {
    /// Open a store; a missing file is an empty store
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => HashMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, values })
    }

    /// An empty store that will write to `path` on flush
    pub fn empty(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            values: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all values to disk
    pub fn flush(&self) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = HummingSettings::default();

        assert!(!settings.enabled);
        assert_eq!(settings.analysis_mode, AnalysisMode::BeatDetection);
        assert_eq!(settings.threshold, 0.1);
        assert_eq!(settings.sensitivity, 1.0);
        assert_eq!(settings.block_size, 1024);
    }

    #[test]
    fn load_from_empty_store_uses_defaults() {
        let settings = HummingSettings::load(&MemoryStore::new());
        assert_eq!(settings, HummingSettings::default());
    }

    #[test]
    fn load_falls_back_per_field_on_garbage() {
        let mut store = MemoryStore::new();
        store.set(SETTING_ENABLED, "yes please".to_string());
        store.set(SETTING_MODE, "7".to_string());
        store.set(SETTING_THRESHOLD, "0.35".to_string());
        store.set(SETTING_SENSITIVITY, "loud".to_string());

        let settings = HummingSettings::load(&store);

        assert!(!settings.enabled);
        assert_eq!(settings.analysis_mode, AnalysisMode::BeatDetection);
        assert!((settings.threshold - 0.35).abs() < 1e-6);
        assert_eq!(settings.sensitivity, 1.0);
    }

    #[test]
    fn load_clamps_out_of_range_values() {
        let mut store = MemoryStore::new();
        store.set(SETTING_THRESHOLD, "7".to_string());
        store.set(SETTING_SENSITIVITY, "0.01".to_string());

        let settings = HummingSettings::load(&store);
        assert_eq!(settings.threshold, 1.0);
        assert_eq!(settings.sensitivity, MIN_SENSITIVITY);

        store.set(SETTING_THRESHOLD, "-3".to_string());
        store.set(SETTING_SENSITIVITY, "12.5".to_string());

        let settings = HummingSettings::load(&store);
        assert_eq!(settings.threshold, 0.0);
        assert_eq!(settings.sensitivity, MAX_SENSITIVITY);
    }

    #[test]
    fn settings_snapshot_is_plain_json() {
        let mut settings = HummingSettings::default();
        settings.enabled = true;
        settings.analysis_mode = AnalysisMode::MultiBand;

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["enabled"], true);
        assert_eq!(json["analysis_mode"], "MultiBand");
        assert_eq!(json["block_size"], 1024);

        let parsed: HummingSettings = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn load_accepts_capitalised_booleans() {
        let mut store = MemoryStore::new();
        store.set(SETTING_ENABLED, "True".to_string());
        store.set(SETTING_MODE, "0".to_string());

        let settings = HummingSettings::load(&store);
        assert!(settings.enabled);
        assert_eq!(settings.analysis_mode, AnalysisMode::Bass);
    }

    #[test]
    fn save_then_load_preserves_persisted_fields() {
        let mut saved = HummingSettings::default();
        saved.enabled = true;
        saved.analysis_mode = AnalysisMode::Amplitude;
        saved.threshold = 0.25;
        saved.sensitivity = 2.5;

        let mut store = MemoryStore::new();
        saved.save(&mut store);

        assert_eq!(store.get(SETTING_MODE).as_deref(), Some("3"));
        assert_eq!(store.get(SETTING_THRESHOLD).as_deref(), Some("0.25"));
        assert_eq!(HummingSettings::load(&store), saved);
    }

    #[test]
    fn threshold_and_sensitivity_are_clamped() {
        let mut settings = HummingSettings::default();

        settings.set_threshold(1.7);
        assert_eq!(settings.threshold, 1.0);
        settings.set_threshold(-0.2);
        assert_eq!(settings.threshold, 0.0);

        settings.set_sensitivity(0.0);
        assert_eq!(settings.sensitivity, MIN_SENSITIVITY);
        settings.set_sensitivity(9.0);
        assert_eq!(settings.sensitivity, MAX_SENSITIVITY);

        settings.set_sensitivity(f32::NAN);
        assert_eq!(settings.sensitivity, DEFAULT_SENSITIVITY);
    }

    #[test]
    fn adjustments_step_by_ticks() {
        let mut settings = HummingSettings::default();

        settings.adjust_threshold(2);
        assert!((settings.threshold - 0.2).abs() < 1e-6);

        settings.adjust_sensitivity(-3);
        assert!((settings.sensitivity - 0.7).abs() < 1e-6);

        settings.adjust_sensitivity(-100);
        assert_eq!(settings.sensitivity, MIN_SENSITIVITY);
    }

    #[test]
    fn mode_cycle_wraps_around() {
        assert_eq!(AnalysisMode::Bass.next(), AnalysisMode::MultiBand);
        assert_eq!(AnalysisMode::MultiBand.next(), AnalysisMode::BeatDetection);
        assert_eq!(AnalysisMode::BeatDetection.next(), AnalysisMode::Amplitude);
        assert_eq!(AnalysisMode::Amplitude.next(), AnalysisMode::Bass);
    }

    #[test]
    fn json_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("humming.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        assert!(store.get(SETTING_MODE).is_none());

        let mut settings = HummingSettings::default();
        settings.analysis_mode = AnalysisMode::MultiBand;
        settings.save(&mut store);
        store.flush().unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            HummingSettings::load(&reopened).analysis_mode,
            AnalysisMode::MultiBand
        );
    }

    #[test]
    fn json_store_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(SettingsError::Json(_))
        ));
    }
}
