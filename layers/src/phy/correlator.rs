//! Synchronization Signal Correlator
//!
//! Cross-correlates a receive window against a time-domain reference and
//! reports the peak position and its peak-to-sidelobe ratio (PSR).
//!
//! Two equivalent methods are available: FFT fast convolution (transform the
//! window, multiply by the precomputed spectrum of the conjugated, reversed
//! reference, inverse-transform) and direct time-domain convolution. Both
//! produce `|y[i]|^2` over the `input_len + ref_len - 1` linear convolution
//! outputs, so the wrap-around sample of the circular FFT output is never
//! searched.
//!
//! Peak positions follow the convention used across the receiver: the index
//! one past the last sample of the matched reference.

use crate::LayerError;
use num_complex::Complex32;
use num_traits::Zero;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use super::resampler::Decimator;

/// Floor applied to the side-lobe level when computing the PSR
pub const PSR_EPSILON: f32 = 1e-12;

/// How the correlation is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMethod {
    /// FFT when the window is at least as long as the reference, direct otherwise
    #[default]
    Auto,
    /// Always FFT fast convolution
    Fft,
    /// Always direct time-domain convolution
    Direct,
}

/// Outcome of one correlation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationResult {
    /// Index (full rate, relative to the correlated input) one past the end of the matched reference
    pub peak_position: usize,
    /// Squared correlation magnitude at the peak
    pub peak_value: f32,
    /// Peak value over the strongest side lobe
    pub peak_to_sidelobe_ratio: f32,
}

/// Correlator settings
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorConfig {
    /// Integer decimation applied to the input before correlating
    pub decimation: usize,
    /// Correlation method
    pub method: CorrelationMethod,
    /// EMA weight of the newest magnitude vector (1.0 disables averaging)
    pub ema_alpha: f32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            decimation: 1,
            method: CorrelationMethod::Auto,
            ema_alpha: 1.0,
        }
    }
}

/// Reference prepared for one correlator geometry
#[derive(Debug, Clone, Default)]
pub struct CorrelationReference {
    /// Conjugated, time-reversed reference (direct method taps)
    taps: Vec<Complex32>,
    /// FFT of the zero-padded taps (empty for the direct method)
    spectrum: Vec<Complex32>,
}

/// Sliding correlator with pre-allocated buffers
pub struct Correlator {
    /// Full-rate samples per call
    input_len: usize,
    /// Samples per call after decimation
    decimated_len: usize,
    /// Reference length (at the decimated rate)
    ref_len: usize,
    /// Forward and inverse plans when using the FFT method
    plans: Option<(Arc<dyn Fft<f32>>, Arc<dyn Fft<f32>>)>,
    /// FFT work buffer
    work: Vec<Complex32>,
    /// FFT scratch
    scratch: Vec<Complex32>,
    /// Input decimator
    decimator: Decimator,
    /// Decimated input
    decimated: Vec<Complex32>,
    /// Primary reference
    reference: CorrelationReference,
    /// Latest magnitude vector
    magnitude: Vec<f32>,
    /// Averaged magnitude vector
    average: Vec<f32>,
    /// Whether `average` holds data
    averaged: bool,
    /// EMA weight of the newest magnitude vector
    ema_alpha: f32,
}

impl Correlator {
    /// Create a correlator for `input_len` full-rate samples against
    /// `reference`, given at the decimated rate
    pub fn new(
        reference: &[Complex32],
        input_len: usize,
        config: CorrelatorConfig,
    ) -> Result<Self, LayerError> {
        let decimator = Decimator::new(config.decimation)?;
        let decimated_len = decimator.output_len(input_len);
        let ref_len = reference.len();

        if ref_len == 0 || decimated_len == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "correlator needs a non-empty reference and input (ref={}, input={}, D={})",
                ref_len, input_len, config.decimation
            )));
        }
        if !(config.ema_alpha > 0.0 && config.ema_alpha <= 1.0) {
            return Err(LayerError::InvalidConfiguration(format!(
                "correlation EMA alpha {} outside (0, 1]",
                config.ema_alpha
            )));
        }

        let use_fft = match config.method {
            CorrelationMethod::Fft => true,
            CorrelationMethod::Direct => false,
            CorrelationMethod::Auto => decimated_len >= ref_len,
        };

        let conv_len = decimated_len + ref_len - 1;
        let fft_len = decimated_len + ref_len;
        let (plans, work, scratch) = if use_fft {
            let mut planner = FftPlanner::<f32>::new();
            let fft = planner.plan_fft_forward(fft_len);
            let ifft = planner.plan_fft_inverse(fft_len);
            let scratch_len = fft.get_inplace_scratch_len().max(ifft.get_inplace_scratch_len());
            (
                Some((fft, ifft)),
                vec![Complex32::zero(); fft_len],
                vec![Complex32::zero(); scratch_len],
            )
        } else {
            (None, Vec::new(), Vec::new())
        };

        trace!(
            "Correlator: input={}, D={}, ref={}, method={}",
            input_len,
            config.decimation,
            ref_len,
            if use_fft { "fft" } else { "direct" }
        );

        let mut correlator = Self {
            input_len,
            decimated_len,
            ref_len,
            plans,
            work,
            scratch,
            decimator,
            decimated: vec![Complex32::zero(); decimated_len],
            reference: CorrelationReference::default(),
            magnitude: vec![0.0; conv_len],
            average: vec![0.0; conv_len],
            averaged: false,
            ema_alpha: config.ema_alpha,
        };
        correlator.reference = correlator.prepare_reference(reference)?;
        Ok(correlator)
    }

    /// Full-rate samples expected per call
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// True when the FFT method is in use
    pub fn uses_fft(&self) -> bool {
        self.plans.is_some()
    }

    /// Prepare an alternative reference of the same length
    pub fn prepare_reference(&mut self, reference: &[Complex32]) -> Result<CorrelationReference, LayerError> {
        if reference.len() != self.ref_len {
            return Err(LayerError::InvalidConfiguration(format!(
                "reference length {} does not match {}",
                reference.len(),
                self.ref_len
            )));
        }

        let taps: Vec<Complex32> = reference.iter().rev().map(|r| r.conj()).collect();
        let spectrum = match &self.plans {
            Some((fft, _)) => {
                let mut spectrum = vec![Complex32::zero(); self.work.len()];
                spectrum[..taps.len()].copy_from_slice(&taps);
                fft.process_with_scratch(&mut spectrum, &mut self.scratch);
                spectrum
            }
            None => Vec::new(),
        };

        Ok(CorrelationReference { taps, spectrum })
    }

    /// Correlate against the primary reference, updating the magnitude EMA
    pub fn correlate(&mut self, input: &[Complex32]) -> Result<CorrelationResult, LayerError> {
        let reference = std::mem::take(&mut self.reference);
        let outcome = self.convolve(input, &reference);
        self.reference = reference;
        outcome?;

        if !self.averaged || self.ema_alpha >= 1.0 {
            self.average.copy_from_slice(&self.magnitude);
            self.averaged = true;
        } else {
            let alpha = self.ema_alpha;
            for (avg, &mag) in self.average.iter_mut().zip(self.magnitude.iter()) {
                *avg = alpha * mag + (1.0 - alpha) * *avg;
            }
        }

        Ok(self.locate_peak(&self.average))
    }

    /// Correlate against `reference` without touching the EMA
    pub fn correlate_with(
        &mut self,
        input: &[Complex32],
        reference: &CorrelationReference,
    ) -> Result<CorrelationResult, LayerError> {
        self.convolve(input, reference)?;
        Ok(self.locate_peak(&self.magnitude))
    }

    /// Averaged magnitude vector from the last [`Correlator::correlate`] call
    pub fn output(&self) -> &[f32] {
        &self.average
    }

    /// Forget the magnitude EMA
    pub fn reset(&mut self) {
        self.averaged = false;
    }

    fn convolve(&mut self, input: &[Complex32], reference: &CorrelationReference) -> Result<(), LayerError> {
        if input.len() != self.input_len {
            return Err(LayerError::InvalidWindow(format!(
                "correlator expects {} samples, got {}",
                self.input_len,
                input.len()
            )));
        }

        self.decimator.process(input, &mut self.decimated);

        match &self.plans {
            Some((fft, ifft)) => {
                let dl = self.decimated_len;
                self.work[..dl].copy_from_slice(&self.decimated);
                self.work[dl..].fill(Complex32::zero());

                fft.process_with_scratch(&mut self.work, &mut self.scratch);
                for (w, &h) in self.work.iter_mut().zip(reference.spectrum.iter()) {
                    *w *= h;
                }
                ifft.process_with_scratch(&mut self.work, &mut self.scratch);

                let scale = 1.0 / self.work.len() as f32;
                for (m, &w) in self.magnitude.iter_mut().zip(self.work.iter()) {
                    *m = (w * scale).norm_sqr();
                }
            }
            None => {
                let x = &self.decimated;
                let h = &reference.taps;
                for (i, m) in self.magnitude.iter_mut().enumerate() {
                    let j_min = (i + 1).saturating_sub(h.len());
                    let j_max = i.min(x.len() - 1);
                    let mut acc = Complex32::zero();
                    for j in j_min..=j_max {
                        acc += x[j] * h[i - j];
                    }
                    *m = acc.norm_sqr();
                }
            }
        }

        Ok(())
    }

    fn locate_peak(&self, values: &[f32]) -> CorrelationResult {
        let (index, peak_value) = argmax(values);
        let factor = self.decimator.factor();
        CorrelationResult {
            peak_position: ((index + 1) * factor).saturating_sub(self.decimator.group_delay()),
            peak_value,
            peak_to_sidelobe_ratio: peak_to_sidelobe(values, index),
        }
    }
}

/// One-shot direct correlation of `received` against `reference`
pub fn correlate(received: &[Complex32], reference: &[Complex32]) -> Result<CorrelationResult, LayerError> {
    let config = CorrelatorConfig {
        method: CorrelationMethod::Direct,
        ..CorrelatorConfig::default()
    };
    Correlator::new(reference, received.len(), config)?.correlate(received)
}

fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::MIN);
    for (i, &v) in values.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

/// Peak over the strongest value outside the main lobe.
///
/// The main lobe extends from the peak while the magnitude keeps decreasing
/// on each side.
fn peak_to_sidelobe(values: &[f32], peak: usize) -> f32 {
    let peak_value = values[peak];

    let mut left = peak;
    while left > 0 && values[left - 1] < values[left] {
        left -= 1;
    }
    let mut right = peak;
    while right + 1 < values.len() && values[right + 1] < values[right] {
        right += 1;
    }

    let side_left = values[..left].iter().copied().fold(0.0f32, f32::max);
    let side_right = values[right + 1..].iter().copied().fold(0.0f32, f32::max);
    peak_value / side_left.max(side_right).max(PSR_EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_sequence(len: usize, seed: u64) -> Vec<Complex32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len)
            .map(|_| Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    fn embed(reference: &[Complex32], len: usize, start: usize, seed: u64) -> Vec<Complex32> {
        let mut signal: Vec<Complex32> = random_sequence(len, seed).iter().map(|s| s * 0.05).collect();
        for (i, r) in reference.iter().enumerate() {
            signal[start + i] += r;
        }
        signal
    }

    #[test]
    fn test_direct_peak_position() {
        let reference = random_sequence(64, 1);
        let signal = embed(&reference, 500, 123, 2);

        let result = correlate(&signal, &reference).unwrap();
        assert_eq!(result.peak_position, 123 + 64);
        assert!(result.peak_to_sidelobe_ratio > 3.0);
    }

    #[test]
    fn test_fft_matches_direct() {
        let reference = random_sequence(128, 3);
        let signal = embed(&reference, 1000, 700, 4);

        let fft_config = CorrelatorConfig { method: CorrelationMethod::Fft, ..Default::default() };
        let direct_config = CorrelatorConfig { method: CorrelationMethod::Direct, ..Default::default() };
        let mut fft = Correlator::new(&reference, 1000, fft_config).unwrap();
        let mut direct = Correlator::new(&reference, 1000, direct_config).unwrap();
        assert!(fft.uses_fft());
        assert!(!direct.uses_fft());

        let a = fft.correlate(&signal).unwrap();
        let b = direct.correlate(&signal).unwrap();
        assert_eq!(a.peak_position, b.peak_position);
        assert!((a.peak_value - b.peak_value).abs() / b.peak_value < 1e-3);
        for (x, y) in fft.output().iter().zip(direct.output().iter()) {
            assert!((x - y).abs() <= 1e-3 * b.peak_value);
        }
    }

    #[test]
    fn test_auto_method_selection() {
        let reference = random_sequence(128, 5);
        let long = Correlator::new(&reference, 256, CorrelatorConfig::default()).unwrap();
        assert!(long.uses_fft());
        let short = Correlator::new(&reference, 100, CorrelatorConfig::default()).unwrap();
        assert!(!short.uses_fft());
    }

    #[test]
    fn test_wrong_input_length() {
        let reference = random_sequence(16, 6);
        let mut correlator = Correlator::new(&reference, 64, CorrelatorConfig::default()).unwrap();
        assert!(matches!(
            correlator.correlate(&[Complex32::zero(); 63]),
            Err(LayerError::InvalidWindow(_))
        ));
    }

    #[test]
    fn test_zero_input_has_zero_psr() {
        let reference = random_sequence(32, 7);
        let result = correlate(&vec![Complex32::zero(); 256], &reference).unwrap();
        assert_eq!(result.peak_value, 0.0);
        assert_eq!(result.peak_to_sidelobe_ratio, 0.0);
    }

    #[test]
    fn test_ema_smooths_magnitude() {
        let reference = random_sequence(32, 8);
        let signal = embed(&reference, 256, 50, 9);
        let config = CorrelatorConfig { ema_alpha: 0.5, ..Default::default() };
        let mut correlator = Correlator::new(&reference, 256, config).unwrap();

        let first = correlator.correlate(&signal).unwrap();
        let zeros = vec![Complex32::zero(); 256];
        let second = correlator.correlate(&zeros).unwrap();
        assert_eq!(second.peak_position, first.peak_position);
        assert!((second.peak_value - 0.5 * first.peak_value).abs() < 1e-3 * first.peak_value);

        correlator.reset();
        let third = correlator.correlate(&zeros).unwrap();
        assert_eq!(third.peak_value, 0.0);
    }

    #[test]
    fn test_alternate_reference() {
        let reference = random_sequence(32, 10);
        let other = random_sequence(32, 11);
        let signal = embed(&other, 300, 100, 12);

        let mut correlator = Correlator::new(&reference, 300, CorrelatorConfig::default()).unwrap();
        let prepared = correlator.prepare_reference(&other).unwrap();
        let result = correlator.correlate_with(&signal, &prepared).unwrap();
        assert_eq!(result.peak_position, 132);
        assert!(correlator.prepare_reference(&other[..16]).is_err());
    }

    #[test]
    fn test_psr_main_lobe_walk() {
        let values = [0.0, 1.0, 0.5, 2.0, 10.0, 6.0, 3.0, 4.0, 0.0];
        // Main lobe spans indices 2..=6; strongest side lobe is 4.0
        assert!((peak_to_sidelobe(&values, 4) - 2.5).abs() < 1e-6);
    }
}
