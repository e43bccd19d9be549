//! OFDM Modulation and Demodulation for LTE
//!
//! Symbol-level IFFT/FFT with cyclic prefix handling, plus the carrier
//! frequency shift used both to inject and to compensate CFO.
//! Using rustfft with plans and scratch buffers allocated at construction.

use crate::LayerError;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::debug;

use super::frame_structure::Numerology;

/// OFDM modulator for the downlink generator
pub struct OfdmModulator {
    /// Subframe geometry
    numerology: Numerology,
    /// IFFT plan (pre-computed for performance)
    ifft: Arc<dyn Fft<f32>>,
    /// Pre-allocated IFFT work buffer
    buffer: Vec<Complex32>,
    /// Pre-allocated IFFT scratch
    scratch: Vec<Complex32>,
    /// Output scaling (1/sqrt(N) keeps the transform unitary)
    scale: f32,
}

impl OfdmModulator {
    /// Create a new OFDM modulator
    pub fn new(numerology: Numerology) -> Self {
        let fft_size = numerology.fft_size();
        let mut planner = FftPlanner::<f32>::new();
        let ifft = planner.plan_fft_inverse(fft_size);
        let scratch = vec![Complex32::new(0.0, 0.0); ifft.get_inplace_scratch_len()];

        debug!("Configured OFDM modulator: fft_size={}, cp={}", fft_size, numerology.cp());

        Self {
            numerology,
            ifft,
            buffer: vec![Complex32::new(0.0, 0.0); fft_size],
            scratch,
            scale: 1.0 / (fft_size as f32).sqrt(),
        }
    }

    /// Subframe geometry
    pub fn numerology(&self) -> &Numerology {
        &self.numerology
    }

    /// Transform one frequency-domain symbol to the time domain (no CP)
    pub fn transform(&mut self, grid: &[Complex32], out: &mut [Complex32]) -> Result<(), LayerError> {
        let fft_size = self.numerology.fft_size();
        if grid.len() != fft_size || out.len() != fft_size {
            return Err(LayerError::InvalidConfiguration(format!(
                "Expected {} subcarriers, got grid={} out={}",
                fft_size,
                grid.len(),
                out.len()
            )));
        }

        self.buffer.copy_from_slice(grid);
        self.ifft.process_with_scratch(&mut self.buffer, &mut self.scratch);
        for (o, &s) in out.iter_mut().zip(self.buffer.iter()) {
            *o = s * self.scale;
        }
        Ok(())
    }

    /// Modulate one OFDM symbol and append it, CP first, to `output`.
    ///
    /// `symbol` is the slot-relative index and selects the CP length.
    pub fn modulate(
        &mut self,
        grid: &[Complex32],
        symbol: usize,
        output: &mut Vec<Complex32>,
    ) -> Result<(), LayerError> {
        let fft_size = self.numerology.fft_size();
        let cp_len = self.numerology.cp_len(symbol);

        let start = output.len();
        output.resize(start + cp_len + fft_size, Complex32::new(0.0, 0.0));
        self.transform(grid, &mut output[start + cp_len..])?;

        // Copy last cp_len samples as CP
        output.copy_within(start + fft_size..start + fft_size + cp_len, start);
        Ok(())
    }
}

/// OFDM demodulator used to inspect synchronization symbols
pub struct OfdmDemodulator {
    /// FFT size
    fft_size: usize,
    /// FFT plan (pre-computed for performance)
    fft: Arc<dyn Fft<f32>>,
    /// Pre-allocated FFT scratch
    scratch: Vec<Complex32>,
    /// Output scaling
    scale: f32,
}

impl OfdmDemodulator {
    /// Create a new OFDM demodulator
    pub fn new(fft_size: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            fft_size,
            fft,
            scratch,
            scale: 1.0 / (fft_size as f32).sqrt(),
        }
    }

    /// Demodulate the useful part of one symbol (CP already removed)
    pub fn demodulate_symbol(
        &mut self,
        time_samples: &[Complex32],
        freq_samples: &mut [Complex32],
    ) -> Result<(), LayerError> {
        if time_samples.len() != self.fft_size || freq_samples.len() != self.fft_size {
            return Err(LayerError::InvalidWindow(format!(
                "Expected {} samples, got {}",
                self.fft_size,
                time_samples.len()
            )));
        }

        freq_samples.copy_from_slice(time_samples);
        self.fft.process_with_scratch(freq_samples, &mut self.scratch);
        for s in freq_samples.iter_mut() {
            *s *= self.scale;
        }
        Ok(())
    }
}

/// Rotate `samples` by a carrier offset of `cfo` subcarrier spacings.
///
/// `start_sample` is the stream index of `samples[0]`, so consecutive calls
/// keep a continuous phase. A negative `cfo` compensates an offset.
pub fn apply_frequency_shift(samples: &mut [Complex32], cfo: f32, fft_size: usize, start_sample: u64) {
    if cfo == 0.0 {
        return;
    }

    let cycles_per_sample = cfo as f64 / fft_size as f64;
    let phase_increment = 2.0 * PI * cycles_per_sample;
    let mut phase = 2.0 * PI * (cycles_per_sample * start_sample as f64).fract();

    for sample in samples {
        let rotation = Complex32::new(phase.cos() as f32, phase.sin() as f32);
        *sample *= rotation;
        phase += phase_increment;

        // Wrap phase to [-π, π]
        if phase > PI {
            phase -= 2.0 * PI;
        } else if phase < -PI {
            phase += 2.0 * PI;
        }
    }
}
