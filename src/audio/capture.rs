//! Audio capture on a dedicated thread
//!
//! A [`LoopbackCapture`] owns one background thread that opens a
//! [`LoopbackDevice`], polls it for packets, downmixes them to mono and
//! accumulates fixed-size blocks. Each completed block is handed to the
//! registered callback synchronously on the capture thread, so a slow
//! callback delays the next poll. There is no queue between the two.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// How often the capture loop polls the device
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on device initialisation during `start()`
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on joining the capture thread during `stop()`
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Audio capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No output device found")]
    NoOutputDevice,

    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to build audio stream: {0}")]
    StreamError(String),

    #[error("Failed to start stream: {0}")]
    PlayError(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Capture initialisation timed out after {0:?}")]
    InitTimeout(Duration),

    #[error("Thread error: {0}")]
    ThreadError(String),
}

/// Native format reported by an opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Interleaved channel count before downmixing
    pub channels: u16,
}

/// One completed block of mono samples
#[derive(Debug, Clone, Copy)]
pub struct SampleBlock<'a> {
    pub samples: &'a [f32],
    pub sample_rate: u32,
}

/// Per-block callback, invoked on the capture thread
pub type BlockCallback = Box<dyn FnMut(SampleBlock<'_>) + Send>;

/// A producer of fixed-size mono sample blocks.
///
/// `start()` blocks until the source is either producing or has failed;
/// `stop()` is idempotent.
pub trait CaptureSource: Send {
    fn start(&mut self, on_block: BlockCallback) -> Result<(), CaptureError>;

    fn stop(&mut self);

    fn is_capturing(&self) -> bool;

    /// Sample rate of the running capture (0 before the first start)
    fn sample_rate(&self) -> u32;

    fn block_size(&self) -> usize;
}

/// A native audio endpoint opened on the capture thread.
///
/// Implementations need not be `Send`: they are created, polled and
/// dropped on the same thread.
pub trait LoopbackDevice {
    fn format(&self) -> StreamFormat;

    /// Drain every packet currently available, passing each one to `sink`
    /// as mono samples.
    fn read_packets(&mut self, sink: &mut dyn FnMut(&[f32])) -> Result<(), CaptureError>;
}

/// Opens a device; called once per `start()` on the capture thread
pub type DeviceOpener =
    Arc<dyn Fn() -> Result<Box<dyn LoopbackDevice>, CaptureError> + Send + Sync>;

/// Downmix interleaved samples to mono by averaging each frame.
///
/// Integer formats are normalised to `[-1, 1]` on the way (i16 / 32768).
pub fn downmix_to_mono<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame
                .iter()
                .map(|s| <f32 as cpal::Sample>::from_sample(*s))
                .sum();
            sum / channels as f32
        })
        .collect()
}

/// Block accumulator.
///
/// Samples are appended at the write index; once the buffer is full a copy
/// is taken and the index wraps back to zero.
pub struct BlockAccumulator {
    samples: Vec<f32>,
    write_pos: usize,
}

impl BlockAccumulator {
    pub fn new(block_size: usize) -> Self {
        Self {
            samples: vec![0.0; block_size],
            write_pos: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.samples.len()
    }

    /// Number of samples waiting for the current block to fill
    pub fn pending(&self) -> usize {
        self.write_pos
    }

    /// Append samples, returning every block completed along the way
    pub fn push_samples(&mut self, data: &[f32]) -> Vec<Vec<f32>> {
        let mut ready = Vec::new();
        if self.samples.is_empty() {
            return ready;
        }

        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos += 1;

            if self.write_pos == self.samples.len() {
                ready.push(self.samples.clone());
                self.write_pos = 0;
            }
        }

        ready
    }

    /// Discard any partially filled block
    pub fn reset(&mut self) {
        self.write_pos = 0;
    }
}

/// Signals the waiting `stop()` when the capture thread exits, however it exits
struct ExitSignal(mpsc::Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Polling loopback capture service.
///
/// Owns a dedicated thread per capture session. The device is opened on that
/// thread, which lets `start()` wait (bounded) for the outcome and report an
/// initialisation failure to the caller.
pub struct LoopbackCapture {
    block_size: usize,
    opener: DeviceOpener,

    /// Accumulator of the current session
    accumulator: Arc<Mutex<BlockAccumulator>>,

    /// Stop flag of the current session; a detached thread keeps its own
    stop_requested: Arc<AtomicBool>,
    sample_rate: Arc<AtomicU32>,
    capturing: bool,

    thread_handle: Option<JoinHandle<()>>,
    exit_rx: Option<mpsc::Receiver<()>>,

    poll_interval: Duration,
    init_timeout: Duration,
    join_timeout: Duration,
}

impl LoopbackCapture {
    /// Create a capture service producing blocks of `block_size` samples
    pub fn new(block_size: usize, opener: DeviceOpener) -> Self {
        Self {
            block_size,
            opener,
            accumulator: Arc::new(Mutex::new(BlockAccumulator::new(block_size))),
            stop_requested: Arc::new(AtomicBool::new(false)),
            sample_rate: Arc::new(AtomicU32::new(0)),
            capturing: false,
            thread_handle: None,
            exit_rx: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Capture the system's default audio output
    pub fn system(block_size: usize) -> Self {
        Self::new(block_size, super::platform::system_loopback_opener())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeouts(mut self, init: Duration, join: Duration) -> Self {
        self.init_timeout = init;
        self.join_timeout = join;
        self
    }

    fn spawn_thread(
        &mut self,
        on_block: BlockCallback,
    ) -> Result<mpsc::Receiver<Result<StreamFormat, CaptureError>>, CaptureError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();

        // Fresh per session, so restarting never revives a detached thread
        self.stop_requested = Arc::new(AtomicBool::new(false));
        self.accumulator = Arc::new(Mutex::new(BlockAccumulator::new(self.block_size)));

        let opener = self.opener.clone();
        let accumulator = self.accumulator.clone();
        let stop_requested = self.stop_requested.clone();
        let sample_rate = self.sample_rate.clone();
        let poll_interval = self.poll_interval;

        let handle = thread::Builder::new()
            .name("loopback-capture".to_string())
            .spawn(move || {
                let _exit = ExitSignal(exit_tx);

                let device = match opener() {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let format = device.format();
                sample_rate.store(format.sample_rate, Ordering::Release);

                // Starter gave up waiting; do not capture behind its back
                if ready_tx.send(Ok(format)).is_err() {
                    return;
                }
                drop(ready_tx);

                run_capture_loop(
                    device,
                    format.sample_rate,
                    accumulator,
                    stop_requested,
                    poll_interval,
                    on_block,
                );
            })
            .map_err(|e| CaptureError::ThreadError(e.to_string()))?;

        self.thread_handle = Some(handle);
        self.exit_rx = Some(exit_rx);
        Ok(ready_rx)
    }

    /// Wait (bounded) for the capture thread to exit, then reap it
    fn join_thread(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        let exit_rx = self.exit_rx.take();

        // Stop requested from inside the block callback: never self-join
        if handle.thread().id() == thread::current().id() {
            return;
        }

        let exited = match exit_rx {
            Some(rx) => !matches!(
                rx.recv_timeout(self.join_timeout),
                Err(RecvTimeoutError::Timeout)
            ),
            None => true,
        };

        if exited {
            if handle.join().is_err() {
                log::error!("Audio capture thread panicked");
            }
        } else {
            log::warn!(
                "Audio capture thread did not stop within {:?}, detaching",
                self.join_timeout
            );
        }
    }
}

impl CaptureSource for LoopbackCapture {
    fn start(&mut self, on_block: BlockCallback) -> Result<(), CaptureError> {
        if self.capturing {
            return Ok(());
        }

        if !self.block_size.is_power_of_two() {
            return Err(CaptureError::ConfigError(format!(
                "block size must be a power of two, got {}",
                self.block_size
            )));
        }

        // Reap a thread left over from an earlier failed start
        self.join_thread();

        let ready_rx = self.spawn_thread(on_block)?;

        match ready_rx.recv_timeout(self.init_timeout) {
            Ok(Ok(format)) => {
                log::info!(
                    "Audio capture: {} Hz, {} channels, {} samples per block",
                    format.sample_rate,
                    format.channels,
                    self.block_size
                );
                self.capturing = true;
                Ok(())
            }
            Ok(Err(e)) => {
                self.join_thread();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stop_requested.store(true, Ordering::Release);
                self.thread_handle = None;
                self.exit_rx = None;
                Err(CaptureError::InitTimeout(self.init_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.join_thread();
                Err(CaptureError::ThreadError(
                    "capture thread exited during initialisation".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);

        if !self.capturing && self.thread_handle.is_none() {
            return;
        }

        self.join_thread();
        self.capturing = false;
        log::info!("Audio capture stopped");
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll the device until a stop is requested.
///
/// Read failures are transient by contract: they are logged and the next
/// poll proceeds as normal.
fn run_capture_loop(
    mut device: Box<dyn LoopbackDevice>,
    sample_rate: u32,
    accumulator: Arc<Mutex<BlockAccumulator>>,
    stop_requested: Arc<AtomicBool>,
    poll_interval: Duration,
    mut on_block: BlockCallback,
) {
    log::info!("Audio capture started");

    while !stop_requested.load(Ordering::Acquire) {
        thread::sleep(poll_interval);

        let result = device.read_packets(&mut |mono: &[f32]| {
            // Lock only long enough to append and copy out full blocks
            let ready = accumulator.lock().push_samples(mono);

            for block in ready {
                on_block(SampleBlock {
                    samples: &block,
                    sample_rate,
                });
            }
        });

        if let Err(e) = result {
            log::debug!("Audio capture read failed: {}", e);
        }
    }

    // Native resources are released here, on the thread that created them
    drop(device);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Device that replays scripted packets, one per poll
    pub(crate) struct ScriptedDevice {
        format: StreamFormat,
        packets: Arc<Mutex<VecDeque<Result<Vec<f32>, String>>>>,
    }

    impl LoopbackDevice for ScriptedDevice {
        fn format(&self) -> StreamFormat {
            self.format
        }

        fn read_packets(&mut self, sink: &mut dyn FnMut(&[f32])) -> Result<(), CaptureError> {
            match self.packets.lock().pop_front() {
                Some(Ok(packet)) => {
                    sink(&packet);
                    Ok(())
                }
                Some(Err(e)) => Err(CaptureError::DeviceError(e)),
                None => Ok(()),
            }
        }
    }

    /// Shared packet script plus an opener that replays it
    pub(crate) fn scripted_opener(
        sample_rate: u32,
        packets: Vec<Result<Vec<f32>, String>>,
    ) -> (DeviceOpener, Arc<Mutex<VecDeque<Result<Vec<f32>, String>>>>) {
        let queue = Arc::new(Mutex::new(VecDeque::from(packets)));
        let shared = queue.clone();
        let opener: DeviceOpener = Arc::new(move || {
            Ok(Box::new(ScriptedDevice {
                format: StreamFormat {
                    sample_rate,
                    channels: 2,
                },
                packets: shared.clone(),
            }) as Box<dyn LoopbackDevice>)
        });
        (opener, queue)
    }

    pub(crate) fn failing_opener() -> DeviceOpener {
        Arc::new(|| Err(CaptureError::DeviceError("endpoint cannot be activated".to_string())))
    }

    pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn collecting_callback() -> (BlockCallback, Arc<Mutex<Vec<(Vec<f32>, u32, String)>>>) {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let sink = blocks.clone();
        let callback: BlockCallback = Box::new(move |block: SampleBlock<'_>| {
            let name = thread::current().name().unwrap_or_default().to_string();
            sink.lock()
                .push((block.samples.to_vec(), block.sample_rate, name));
        });
        (callback, blocks)
    }

    #[test]
    fn accumulator_emits_full_blocks_and_keeps_remainder() {
        let mut acc = BlockAccumulator::new(4);

        assert!(acc.push_samples(&[1.0, 2.0, 3.0]).is_empty());
        assert_eq!(acc.pending(), 3);

        let ready = acc.push_samples(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(ready, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn accumulator_reset_discards_partial_block() {
        let mut acc = BlockAccumulator::new(2);
        acc.push_samples(&[1.0]);
        acc.reset();

        let ready = acc.push_samples(&[2.0, 3.0]);
        assert_eq!(ready, vec![vec![2.0, 3.0]]);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [1.0_f32, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(downmix_to_mono(&stereo, 0), stereo.to_vec());
    }

    #[test]
    fn downmix_normalises_16_bit_samples() {
        let stereo = [16_384_i16, 16_384, i16::MIN, i16::MIN];
        let mono = downmix_to_mono(&stereo, 2);
        assert!((mono[0] - 0.5).abs() < 1e-4, "got {}", mono[0]);
        assert!((mono[1] + 1.0).abs() < 1e-4, "got {}", mono[1]);
    }

    #[test]
    fn start_reports_device_failure_and_stays_stopped() {
        let mut capture = LoopbackCapture::new(8, failing_opener());
        let (callback, _) = collecting_callback();

        let err = capture.start(callback).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceError(_)));
        assert!(!capture.is_capturing());

        capture.stop();
        capture.stop();
    }

    #[test]
    fn start_times_out_when_device_hangs() {
        let opener: DeviceOpener = Arc::new(|| {
            thread::sleep(Duration::from_millis(300));
            Err(CaptureError::NoOutputDevice)
        });
        let mut capture = LoopbackCapture::new(8, opener)
            .with_timeouts(Duration::from_millis(30), Duration::from_millis(30));
        let (callback, _) = collecting_callback();

        let started = Instant::now();
        let err = capture.start(callback).unwrap_err();
        assert!(matches!(err, CaptureError::InitTimeout(_)));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!capture.is_capturing());
        capture.stop();
    }

    #[test]
    fn start_rejects_non_power_of_two_block_size() {
        let (opener, _) = scripted_opener(48_000, Vec::new());
        let mut capture = LoopbackCapture::new(100, opener);
        let (callback, _) = collecting_callback();

        assert!(matches!(
            capture.start(callback),
            Err(CaptureError::ConfigError(_))
        ));
    }

    #[test]
    fn blocks_are_delivered_on_the_capture_thread() {
        let (opener, _) = scripted_opener(
            44_100,
            vec![Ok(vec![0.1, 0.2, 0.3]), Ok(vec![0.4, 0.5, 0.6, 0.7, 0.8])],
        );
        let mut capture =
            LoopbackCapture::new(4, opener).with_poll_interval(Duration::from_millis(1));
        let (callback, blocks) = collecting_callback();

        capture.start(callback).unwrap();
        assert!(capture.is_capturing());
        assert_eq!(capture.sample_rate(), 44_100);

        assert!(wait_until(Duration::from_secs(2), || blocks.lock().len() == 2));
        capture.stop();

        let blocks = blocks.lock();
        assert_eq!(blocks[0].0, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(blocks[1].0, vec![0.5, 0.6, 0.7, 0.8]);
        assert!(blocks.iter().all(|(_, rate, _)| *rate == 44_100));
        assert!(blocks.iter().all(|(_, _, name)| name == "loopback-capture"));
    }

    #[test]
    fn read_errors_do_not_stop_the_loop() {
        let (opener, queue) = scripted_opener(
            48_000,
            vec![
                Err("packet read failed".to_string()),
                Err("device busy".to_string()),
                Ok(vec![1.0, 1.0]),
            ],
        );
        let mut capture =
            LoopbackCapture::new(2, opener).with_poll_interval(Duration::from_millis(1));
        let (callback, blocks) = collecting_callback();

        capture.start(callback).unwrap();
        assert!(wait_until(Duration::from_secs(2), || blocks.lock().len() == 1));
        assert!(queue.lock().is_empty());
        capture.stop();
    }

    #[test]
    fn stop_is_idempotent_and_restart_works() {
        let (opener, queue) = scripted_opener(48_000, Vec::new());
        let mut capture =
            LoopbackCapture::new(2, opener).with_poll_interval(Duration::from_millis(1));

        let (callback, _) = collecting_callback();
        capture.start(callback).unwrap();
        capture.stop();
        capture.stop();
        assert!(!capture.is_capturing());

        queue.lock().push_back(Ok(vec![0.25, 0.75]));
        let (callback, blocks) = collecting_callback();
        capture.start(callback).unwrap();
        assert!(wait_until(Duration::from_secs(2), || blocks.lock().len() == 1));
        capture.stop();
    }

    #[test]
    fn stop_from_the_block_callback_does_not_self_join() {
        let packets = (0..50).map(|_| Ok(vec![0.5, 0.5])).collect();
        let (opener, queue) = scripted_opener(48_000, packets);
        let capture = Arc::new(Mutex::new(
            LoopbackCapture::new(2, opener).with_poll_interval(Duration::from_millis(1)),
        ));
        let calls = Arc::new(AtomicU32::new(0));

        let shared = capture.clone();
        let counter = calls.clone();
        let callback: BlockCallback = Box::new(move |_block: SampleBlock<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            shared.lock().stop();
        });

        capture.lock().start(callback).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            calls.load(Ordering::SeqCst) >= 1
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            !capture.lock().is_capturing()
        }));

        // The loop ends after the stopping block, the rest stays unread
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.lock().len(), 49);
    }

    #[test]
    fn slow_callback_is_detached_and_stays_stopped_after_restart() {
        let packets = (0..2_000).map(|_| Ok(vec![0.5])).collect();
        let (opener, _) = scripted_opener(48_000, packets);
        let mut capture = LoopbackCapture::new(1, opener)
            .with_poll_interval(Duration::from_millis(1))
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(20));

        let slow_calls = Arc::new(AtomicU32::new(0));
        let counter = slow_calls.clone();
        let slow: BlockCallback = Box::new(move |_block: SampleBlock<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
        });

        capture.start(slow).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            slow_calls.load(Ordering::SeqCst) >= 1
        }));

        // Returns on the join timeout while the callback is still sleeping
        let stopping = Instant::now();
        capture.stop();
        assert!(stopping.elapsed() < Duration::from_millis(90));
        assert!(!capture.is_capturing());
        let calls_at_stop = slow_calls.load(Ordering::SeqCst);

        let (fresh, blocks) = collecting_callback();
        capture.start(fresh).unwrap();
        thread::sleep(Duration::from_millis(600));
        capture.stop();

        assert_eq!(slow_calls.load(Ordering::SeqCst), calls_at_stop);
        assert!(!blocks.lock().is_empty());
    }
}
