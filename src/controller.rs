//! Humming mode controller
//!
//! Wires capture, spectrum analysis, the active strategy and a global
//! trigger-rate gate together. All per-block work runs on the capture
//! thread inside the block callback; failures there are logged and the
//! block is dropped.

use crate::analysis::{
    default_provider, AnalysisContext, StrategyCache, TempoTrackerProvider, TriggerResult,
};
use crate::audio::{
    BlockCallback, CaptureError, CaptureSource, LoopbackCapture, SampleBlock, SpectrumAnalyzer,
    SpectrumError,
};
use crate::settings::{AnalysisMode, SharedSettings};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Minimum time between two emitted triggers
pub const MIN_TRIGGER_INTERVAL: Duration = Duration::from_millis(50);

/// Controller errors; only raised from `start()`
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Receives one waveform event identifier per accepted trigger
pub type EmitFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional free-form diagnostics sink
pub type DebugLogFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Builds the capture source for a given block size
pub type CaptureFactory = Box<dyn Fn(usize) -> Box<dyn CaptureSource> + Send + Sync>;

/// Drops triggers that arrive sooner than `min_interval` after the last
/// accepted one
#[derive(Debug, Clone)]
pub struct TriggerGate {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl TriggerGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// Accept a trigger at `now` if the interval has elapsed
    pub fn admit(&mut self, now: Instant) -> bool {
        let open = match self.last_emit {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
            None => true,
        };
        if open {
            self.last_emit = Some(now);
        }
        open
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

/// Analysis state touched by the capture thread
struct Pipeline {
    /// Present only while running
    analyzer: Option<SpectrumAnalyzer>,
    strategies: StrategyCache,
    mode: AnalysisMode,
    gate: TriggerGate,
}

impl Pipeline {
    fn new(mode: AnalysisMode, tempo_provider: Arc<dyn TempoTrackerProvider>) -> Self {
        Self {
            analyzer: None,
            strategies: StrategyCache::new(tempo_provider),
            mode,
            gate: TriggerGate::new(MIN_TRIGGER_INTERVAL),
        }
    }

    /// Run one block through the active strategy and the gate
    fn process_block(
        &mut self,
        block: SampleBlock<'_>,
        threshold: f32,
        sensitivity: f32,
        now: Instant,
    ) -> Result<Option<TriggerResult>, SpectrumError> {
        let Some(analyzer) = self.analyzer.as_ref() else {
            return Ok(None);
        };

        let mut trigger = None;

        if self.mode == AnalysisMode::BeatDetection {
            let beat = self.strategies.beat_detection();
            beat.initialize_tracker(block.sample_rate);
            if beat.is_native_active() {
                trigger = beat.process_native(block.samples, sensitivity);
            }
        }

        if trigger.is_none() {
            let spectrum = analyzer.compute_spectrum(block.samples)?;
            let ctx = AnalysisContext {
                analyzer,
                sample_rate: block.sample_rate,
                threshold,
                sensitivity,
            };
            trigger = self.strategies.get(self.mode).analyze(&spectrum, &ctx);
        }

        Ok(trigger.filter(|_| self.gate.admit(now)))
    }
}

/// Humming mode controller.
///
/// Owns its capture source, analyzer and strategy cache exclusively.
pub struct HummingController {
    settings: SharedSettings,
    emit: EmitFn,
    debug_log: Option<DebugLogFn>,
    capture_factory: CaptureFactory,
    capture: Option<Box<dyn CaptureSource>>,
    pipeline: Arc<Mutex<Pipeline>>,
    state: ControllerState,
}

impl HummingController {
    pub fn new(settings: SharedSettings, emit: impl Fn(&str) + Send + Sync + 'static) -> Self {
        let mode = settings.read().analysis_mode;
        Self {
            settings,
            emit: Arc::new(emit),
            debug_log: None,
            capture_factory: Box::new(|block_size| {
                Box::new(LoopbackCapture::system(block_size)) as Box<dyn CaptureSource>
            }),
            capture: None,
            pipeline: Arc::new(Mutex::new(Pipeline::new(mode, default_provider()))),
            state: ControllerState::Stopped,
        }
    }

    pub fn with_debug_log(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.debug_log = Some(Arc::new(sink));
        self
    }

    pub fn with_capture_factory(
        mut self,
        factory: impl Fn(usize) -> Box<dyn CaptureSource> + Send + Sync + 'static,
    ) -> Self {
        self.capture_factory = Box::new(factory);
        self
    }

    /// Replace the tempo tracker provider; discards any cached strategies
    pub fn with_tempo_provider(self, provider: Arc<dyn TempoTrackerProvider>) -> Self {
        {
            let mut pipeline = self.pipeline.lock();
            pipeline.strategies = StrategyCache::new(provider);
        }
        self
    }

    /// Start capturing and analysing.
    ///
    /// A no-op when already running or when Humming mode is disabled. On
    /// failure everything is torn down again and the error is returned.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.state == ControllerState::Running {
            return Ok(());
        }

        let (enabled, block_size, mode) = {
            let settings = self.settings.read();
            (settings.enabled, settings.block_size, settings.analysis_mode)
        };

        if !enabled {
            log::debug!("Humming mode is disabled, not starting");
            return Ok(());
        }

        self.state = ControllerState::Starting;

        match self.start_pipeline(block_size, mode) {
            Ok(sample_rate) => {
                self.state = ControllerState::Running;
                self.debug(&format!(
                    "Humming started: {} mode, {} Hz, {} samples per block",
                    mode, sample_rate, block_size
                ));
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start Humming mode: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    fn start_pipeline(
        &mut self,
        block_size: usize,
        mode: AnalysisMode,
    ) -> Result<u32, ControllerError> {
        let analyzer = SpectrumAnalyzer::new(block_size)?;

        {
            let mut pipeline = self.pipeline.lock();
            pipeline.analyzer = Some(analyzer);
            pipeline.mode = mode;
            pipeline.gate.reset();
            pipeline.strategies.get(mode);
        }

        let mut capture = (self.capture_factory)(block_size);
        let started = capture.start(self.block_callback());
        let sample_rate = capture.sample_rate();
        self.capture = Some(capture);
        started?;

        if mode == AnalysisMode::BeatDetection {
            self.pipeline
                .lock()
                .strategies
                .beat_detection()
                .initialize_tracker(sample_rate);
        }

        Ok(sample_rate)
    }

    fn block_callback(&self) -> BlockCallback {
        let pipeline = self.pipeline.clone();
        let settings = self.settings.clone();
        let emit = self.emit.clone();
        let debug_log = self.debug_log.clone();

        Box::new(move |block: SampleBlock<'_>| {
            let (threshold, sensitivity) = {
                let settings = settings.read();
                (settings.threshold, settings.sensitivity)
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                pipeline
                    .lock()
                    .process_block(block, threshold, sensitivity, Instant::now())
            }));

            match outcome {
                Ok(Ok(Some(trigger))) => {
                    let event = trigger.waveform.event_name();
                    write_debug(
                        &debug_log,
                        &format!("Trigger {} at intensity {:.2}", event, trigger.intensity),
                    );
                    emit(event);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => log::error!("Humming analysis failed: {}", e),
                Err(_) => log::error!("Humming analysis panicked, block dropped"),
            }
        })
    }

    /// Stop capturing. Safe to call at any time, any number of times.
    pub fn stop(&mut self) {
        if self.state == ControllerState::Stopped && self.capture.is_none() {
            return;
        }

        self.state = ControllerState::Stopping;

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }

        {
            let mut pipeline = self.pipeline.lock();
            pipeline.analyzer = None;
            if let Some(beat) = pipeline.strategies.existing_beat_detection_mut() {
                beat.end_session();
            }
        }

        self.state = ControllerState::Stopped;
        self.debug("Humming stopped");
    }

    /// Switch analysis mode, swapping the live strategy when running
    pub fn set_mode(&mut self, mode: AnalysisMode) {
        self.settings.write().analysis_mode = mode;

        {
            let mut pipeline = self.pipeline.lock();
            pipeline.mode = mode;

            if self.state == ControllerState::Running {
                pipeline.strategies.get(mode);

                if mode == AnalysisMode::BeatDetection {
                    if let Some(capture) = self.capture.as_ref().filter(|c| c.is_capturing()) {
                        pipeline
                            .strategies
                            .beat_detection()
                            .initialize_tracker(capture.sample_rate());
                    }
                }
            }
        }

        self.debug(&format!("Humming analysis mode: {}", mode));
    }

    /// Advance to the next mode in cycle order
    pub fn cycle_mode(&mut self) -> AnalysisMode {
        let next = self.mode().next();
        self.set_mode(next);
        next
    }

    /// Enable or disable Humming mode, starting or stopping it to match.
    ///
    /// If enabling fails to start, the flag is turned back off.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), ControllerError> {
        self.settings.write().enabled = enabled;

        if !enabled {
            self.stop();
            return Ok(());
        }

        if let Err(e) = self.start() {
            self.settings.write().enabled = false;
            return Err(e);
        }
        Ok(())
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.settings.write().set_threshold(threshold);
    }

    pub fn set_sensitivity(&self, sensitivity: f32) {
        self.settings.write().set_sensitivity(sensitivity);
    }

    pub fn adjust_threshold(&self, ticks: i32) -> f32 {
        let mut settings = self.settings.write();
        settings.adjust_threshold(ticks);
        settings.threshold
    }

    pub fn adjust_sensitivity(&self, ticks: i32) -> f32 {
        let mut settings = self.settings.write();
        settings.adjust_sensitivity(ticks);
        settings.sensitivity
    }

    pub fn reset_threshold(&self) {
        self.settings.write().reset_threshold();
    }

    pub fn reset_sensitivity(&self) {
        self.settings.write().reset_sensitivity();
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ControllerState::Running
    }

    pub fn mode(&self) -> AnalysisMode {
        self.settings.read().analysis_mode
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Sample rate of the running capture (0 when stopped)
    pub fn sample_rate(&self) -> u32 {
        self.capture.as_ref().map_or(0, |c| c.sample_rate())
    }

    /// Last tempo reported by the native tracker (0 when unavailable)
    pub fn current_bpm(&self) -> f32 {
        self.pipeline
            .lock()
            .strategies
            .existing_beat_detection()
            .map_or(0.0, |beat| beat.current_bpm())
    }

    pub fn is_native_tempo_active(&self) -> bool {
        self.pipeline
            .lock()
            .strategies
            .existing_beat_detection()
            .is_some_and(|beat| beat.is_native_active())
    }

    fn debug(&self, message: &str) {
        log::info!("{}", message);
        if let Some(sink) = &self.debug_log {
            sink(message);
        }
    }
}

impl Drop for HummingController {
    fn drop(&mut self) {
        self.stop();
        self.pipeline.lock().strategies.dispose();
    }
}

fn write_debug(sink: &Option<DebugLogFn>, message: &str) {
    log::debug!("{}", message);
    if let Some(sink) = sink {
        sink(message);
    }
}
