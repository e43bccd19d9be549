//! Integer Decimator for Correlation Front End
//!
//! Lowpass-filters and downsamples the receive window by an integer factor so
//! the PSS search can run at a reduced rate. The windowed-sinc filter has
//! `8 * factor + 1` taps and a fixed group delay of `4 * factor` input samples.

use crate::LayerError;
use num_complex::Complex32;
use std::f32::consts::PI;
use tracing::debug;

/// Filter taps per unit of decimation factor
const TAPS_PER_FACTOR: usize = 8;

/// FIR decimator
#[derive(Debug, Clone)]
pub struct Decimator {
    /// Decimation factor (D)
    factor: usize,
    /// Lowpass filter coefficients
    taps: Vec<f32>,
}

impl Decimator {
    /// Create a decimator for `factor` (1 disables filtering)
    pub fn new(factor: usize) -> Result<Self, LayerError> {
        if factor == 0 {
            return Err(LayerError::InvalidConfiguration(
                "decimation factor must be at least 1".to_string(),
            ));
        }

        let taps = if factor == 1 {
            vec![1.0]
        } else {
            // Cutoff at the decimated Nyquist frequency
            design_lowpass_filter(TAPS_PER_FACTOR * factor + 1, 0.5 / factor as f64, 1.0)
        };

        debug!("Decimator: D={}, {} taps, group delay {}", factor, taps.len(), (taps.len() - 1) / 2);

        Ok(Self { factor, taps })
    }

    /// Decimation factor
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Filter delay in input samples
    pub fn group_delay(&self) -> usize {
        (self.taps.len() - 1) / 2
    }

    /// Number of output samples produced from `input_len` input samples
    pub fn output_len(&self, input_len: usize) -> usize {
        input_len / self.factor
    }

    /// Filter and downsample `input` into `output`.
    ///
    /// Samples before the start of `input` are treated as zero.
    pub fn process(&self, input: &[Complex32], output: &mut [Complex32]) {
        if self.factor == 1 {
            let n = output.len().min(input.len());
            output[..n].copy_from_slice(&input[..n]);
            return;
        }

        for (m, out) in output.iter_mut().enumerate().take(self.output_len(input.len())) {
            let center = m * self.factor;
            let mut acc = Complex32::new(0.0, 0.0);
            for (k, &tap) in self.taps.iter().enumerate().take(center + 1) {
                acc += input[center - k] * tap;
            }
            *out = acc;
        }
    }
}

/// Design lowpass FIR filter using windowed sinc method
fn design_lowpass_filter(num_taps: usize, cutoff_hz: f64, sample_rate: f64) -> Vec<f32> {
    let mut taps = vec![0.0f32; num_taps];
    let center = (num_taps - 1) as f32 / 2.0;
    let omega_c = 2.0 * PI * (cutoff_hz / sample_rate) as f32;

    for (i, tap) in taps.iter_mut().enumerate() {
        let n = i as f32 - center;

        // Sinc function
        let sinc = if n.abs() < 1e-10 {
            omega_c / PI
        } else {
            (omega_c * n).sin() / (PI * n)
        };

        // Hamming window
        let window = 0.54 - 0.46 * (2.0 * PI * i as f32 / (num_taps - 1) as f32).cos();

        *tap = sinc * window;
    }

    // Normalize to unit DC gain
    let sum: f32 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= sum;
    }

    taps
}
