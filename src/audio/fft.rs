//! Windowed FFT spectrum analysis
//!
//! Turns a fixed-size block of mono samples into a magnitude spectrum and
//! answers banded-energy queries over it. The transform is an in-place
//! iterative radix-2 Cooley-Tukey FFT on a Hann-windowed copy of the block.

use rustfft::num_complex::Complex;
use std::f64::consts::PI;
use thiserror::Error;

/// Spectrum analysis errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectrumError {
    #[error("Block size must be a power of two, got {0}")]
    InvalidBlockSize(usize),

    #[error("Expected {expected} samples, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// FFT analyzer for a fixed block size
#[derive(Debug, Clone)]
pub struct SpectrumAnalyzer {
    block_size: usize,

    /// Precomputed Hann window coefficients (length = block size)
    window: Vec<f32>,
}

impl SpectrumAnalyzer {
    /// Create an analyzer for blocks of `block_size` samples.
    ///
    /// Fails unless `block_size` is a non-zero power of two.
    pub fn new(block_size: usize) -> Result<Self, SpectrumError> {
        if !block_size.is_power_of_two() {
            return Err(SpectrumError::InvalidBlockSize(block_size));
        }

        Ok(Self {
            block_size,
            window: hann_window(block_size),
        })
    }

    /// Get the configured block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Compute the magnitude spectrum of one block.
    ///
    /// Returns `block_size / 2` magnitudes; bin `i` covers frequency
    /// `i * sample_rate / block_size`. The mirrored upper half of the
    /// transform is discarded.
    pub fn compute_spectrum(&self, samples: &[f32]) -> Result<Vec<f32>, SpectrumError> {
        if samples.len() != self.block_size {
            return Err(SpectrumError::LengthMismatch {
                expected: self.block_size,
                actual: samples.len(),
            });
        }

        let mut buffer: Vec<Complex<f64>> = samples
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new((s * w) as f64, 0.0))
            .collect();

        fft_in_place(&mut buffer);

        Ok(buffer
            .iter()
            .take(self.block_size / 2)
            .map(|c| c.norm() as f32)
            .collect())
    }

    /// Centre frequency of a bin, in Hz
    pub fn frequency(&self, bin: usize, sample_rate: u32) -> f32 {
        bin as f32 * sample_rate as f32 / self.block_size as f32
    }

    /// RMS magnitude over the bins covering `[min_freq, max_freq]`.
    ///
    /// Both bounds map to `floor(freq * N / sample_rate)` and are clamped to
    /// the spectrum. A degenerate range (`min >= max`) yields 0.
    pub fn band_energy(
        &self,
        spectrum: &[f32],
        sample_rate: u32,
        min_freq: f32,
        max_freq: f32,
    ) -> f32 {
        if spectrum.is_empty() || sample_rate == 0 {
            return 0.0;
        }

        let last = spectrum.len() - 1;
        let min_bin = self.freq_to_bin(min_freq, sample_rate).min(last);
        let max_bin = self.freq_to_bin(max_freq, sample_rate).min(last);

        if min_bin >= max_bin {
            return 0.0;
        }

        rms(&spectrum[min_bin..=max_bin])
    }

    fn freq_to_bin(&self, freq: f32, sample_rate: u32) -> usize {
        let bin = (freq * self.block_size as f32 / sample_rate as f32).floor();
        // Negative frequencies clamp to bin 0
        if bin.is_finite() && bin > 0.0 {
            bin as usize
        } else {
            0
        }
    }
}

/// Root-mean-square of a slice of magnitudes (0 for an empty slice)
pub fn rms(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f32 = values.iter().map(|v| v * v).sum();
    (sum / values.len() as f32).sqrt()
}

/// Hann window `0.5 * (1 - cos(2*pi*i / (N-1)))`.
///
/// A single-sample window is all-pass, so N = 1 never divides by zero.
fn hann_window(size: usize) -> Vec<f32> {
    if size == 1 {
        return vec![1.0];
    }

    let denom = (size - 1) as f64;
    (0..size)
        .map(|i| (0.5 * (1.0 - (2.0 * PI * i as f64 / denom).cos())) as f32)
        .collect()
}

/// In-place iterative radix-2 Cooley-Tukey FFT.
///
/// `data.len()` must be a power of two.
fn fft_in_place(data: &mut [Complex<f64>]) {
    let n = data.len();
    if n <= 1 {
        return;
    }

    // Bit-reversal permutation
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;

        if i < j {
            data.swap(i, j);
        }
    }

    // log2(n) butterfly passes
    let mut len = 2;
    while len <= n {
        let angle = -2.0 * PI / len as f64;
        let wlen = Complex::new(angle.cos(), angle.sin());
        let half = len / 2;

        for start in (0..n).step_by(len) {
            let mut w = Complex::new(1.0, 0.0);
            for k in 0..half {
                let u = data[start + k];
                let v = data[start + k + half] * w;
                data[start + k] = u + v;
                data[start + k + half] = u - v;
                w *= wlen;
            }
        }

        len <<= 1;
    }
}
