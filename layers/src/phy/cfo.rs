//! Carrier Frequency Offset Estimation
//!
//! CFO is tracked in units of the subcarrier spacing (15 kHz). Three stages
//! run in a fixed order, each one working on samples already corrected by the
//! stages before it:
//!
//! 1. Integer bin: the strongest of three PSS correlations against references
//!    shifted by -1, 0 and +1 subcarrier.
//! 2. Cyclic prefix: phase of the CP/symbol-tail conjugate product.
//! 3. PSS phase: phase difference between the two halves of the PSS correlation.
//!
//! The fractional stages feed exponential moving averages that are seeded by
//! their first accepted estimate. The reported CFO is the sum of the integer
//! bin and both averages.

use crate::LayerError;
use num_complex::{Complex32, Complex64};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use tracing::{debug, warn};

use super::frame_structure::cp_len_normal;
use super::ofdm::apply_frequency_shift;

/// Default bound on accepted PSS-phase estimates
pub const DEFAULT_PSS_CFO_MAX_HZ: f32 = 7000.0;

/// Estimation stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfoStage {
    /// Integer subcarrier offset from shifted PSS references
    IntegerBin,
    /// Fractional offset from cyclic prefix correlation
    CyclicPrefix,
    /// Fractional offset from the PSS half-symbol phase
    PssPhase,
}

/// Smoothed CFO estimate
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CfoState {
    /// Integer subcarrier offset (-1, 0 or +1)
    pub integer_bin: i32,
    /// CP-stage average, in subcarrier spacings
    pub cp_based_hz_norm: f32,
    /// PSS-stage average, in subcarrier spacings
    pub pss_based_hz_norm: f32,
    /// CP-stage EMA has been seeded
    pub is_cp_stage_primed: bool,
    /// PSS-stage EMA has been seeded
    pub is_pss_stage_primed: bool,
}

impl CfoState {
    /// Total offset in subcarrier spacings
    pub fn combined_hz_norm(&self) -> f32 {
        self.integer_bin as f32 + self.cp_based_hz_norm + self.pss_based_hz_norm
    }

    /// Total offset in Hz
    pub fn combined_hz(&self) -> f32 {
        self.combined_hz_norm() * common::SUBCARRIER_SPACING_HZ
    }
}

/// CFO estimator settings
#[derive(Debug, Clone, Copy)]
pub struct CfoConfig {
    /// FFT size
    pub fft_size: usize,
    /// Largest window the estimator will be given
    pub frame_size: usize,
    /// Run the integer-bin stage
    pub integer_enable: bool,
    /// Run the CP stage
    pub cp_enable: bool,
    /// Symbols integrated by the CP stage
    pub cp_nsymbols: usize,
    /// Run the PSS-phase stage
    pub pss_enable: bool,
    /// EMA weight of new fractional estimates
    pub ema_alpha: f32,
    /// PSS-phase estimates at or above this magnitude are rejected
    pub pss_max_hz: f32,
}

/// Multi-stage CFO estimator
#[derive(Debug, Clone)]
pub struct CfoEstimator {
    /// FFT size
    fft_size: usize,
    /// Enabled stages in execution order
    stages: [Option<CfoStage>; 3],
    /// Symbols integrated by the CP stage
    cp_nsymbols: usize,
    /// EMA weight of new estimates
    ema_alpha: f32,
    /// PSS sanity bound in subcarrier spacings
    pss_max_norm: f32,
    /// Current estimate
    state: CfoState,
    /// Prefix sums of `x[n] * conj(x[n + N])`
    cp_products: Vec<Complex64>,
    /// Correction for bin -1 and bin +1 over one symbol period
    bin_rotation: [Vec<Complex32>; 2],
}

impl CfoEstimator {
    /// Create an estimator
    pub fn new(config: CfoConfig) -> Result<Self, LayerError> {
        if !(config.ema_alpha > 0.0 && config.ema_alpha <= 1.0) {
            return Err(LayerError::InvalidConfiguration(format!(
                "CFO EMA alpha {} outside (0, 1]",
                config.ema_alpha
            )));
        }
        if config.cp_enable && config.cp_nsymbols == 0 {
            return Err(LayerError::InvalidConfiguration(
                "CP-based CFO needs at least one symbol".to_string(),
            ));
        }
        if config.pss_max_hz <= 0.0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "PSS CFO bound {} Hz must be positive",
                config.pss_max_hz
            )));
        }

        let n = config.fft_size;
        let rotation = |bin: f32| -> Vec<Complex32> {
            (0..n)
                .map(|k| {
                    let phase = -2.0 * PI * bin * k as f32 / n as f32;
                    Complex32::new(phase.cos(), phase.sin())
                })
                .collect()
        };

        let stages = [
            config.integer_enable.then_some(CfoStage::IntegerBin),
            config.cp_enable.then_some(CfoStage::CyclicPrefix),
            config.pss_enable.then_some(CfoStage::PssPhase),
        ];

        Ok(Self {
            fft_size: n,
            stages,
            cp_nsymbols: config.cp_nsymbols,
            ema_alpha: config.ema_alpha,
            pss_max_norm: config.pss_max_hz / common::SUBCARRIER_SPACING_HZ,
            state: CfoState::default(),
            cp_products: Vec::with_capacity(config.frame_size + 1),
            bin_rotation: [rotation(-1.0), rotation(1.0)],
        })
    }

    /// Enabled stages in execution order
    pub fn stages(&self) -> &[Option<CfoStage>; 3] {
        &self.stages
    }

    /// True if `stage` runs
    pub fn is_enabled(&self, stage: CfoStage) -> bool {
        self.stages.contains(&Some(stage))
    }

    /// Current estimate
    pub fn state(&self) -> &CfoState {
        &self.state
    }

    /// Clear the estimate so the next one seeds the averages
    pub fn reset(&mut self) {
        self.state = CfoState::default();
    }

    /// Seed the estimate from another estimator
    pub fn copy_from(&mut self, other: &CfoState) {
        self.state = *other;
    }

    /// Pick the integer bin from the peak values for shifts -1, 0, +1
    pub fn select_integer_bin(&mut self, peak_values: [f32; 3]) -> i32 {
        let mut best = 1;
        for (i, &value) in peak_values.iter().enumerate() {
            if value > peak_values[best] {
                best = i;
            }
        }
        self.state.integer_bin = best as i32 - 1;
        self.state.integer_bin
    }

    /// Remove the integer-bin offset from `samples`
    pub fn apply_integer_correction(&self, samples: &mut [Complex32]) {
        let table = match self.state.integer_bin {
            -1 => &self.bin_rotation[0],
            1 => &self.bin_rotation[1],
            _ => return,
        };
        for (k, sample) in samples.iter_mut().enumerate() {
            *sample *= table[k % self.fft_size];
        }
    }

    /// Raw CP-based estimate over the first `search_len` offsets of `window`
    pub fn estimate_cp(&mut self, window: &[Complex32], search_len: usize) -> Option<f32> {
        let n = self.fft_size;
        let cp = cp_len_normal(n);
        let symbol = n + cp;
        let span = (self.cp_nsymbols - 1) * symbol + cp + n;
        if cp == 0 || window.len() < span {
            return None;
        }
        let offsets = search_len.min(window.len() - span + 1);

        self.cp_products.clear();
        self.cp_products.push(Complex64::zero());
        let mut acc = Complex64::zero();
        for k in 0..window.len() - n {
            let p = window[k] * window[k + n].conj();
            acc += Complex64::new(p.re as f64, p.im as f64);
            self.cp_products.push(acc);
        }

        let sums = &self.cp_products;
        let mut best = Complex64::zero();
        for i in 0..offsets {
            let corr: Complex64 = (0..self.cp_nsymbols)
                .map(|s| {
                    let start = i + s * symbol;
                    sums[start + cp] - sums[start]
                })
                .sum();
            if corr.norm_sqr() > best.norm_sqr() {
                best = corr;
            }
        }

        if best.is_zero() {
            return None;
        }
        Some((-best.arg() / (2.0 * std::f64::consts::PI)) as f32)
    }

    /// Fold a CP-based estimate into its average
    pub fn update_cp(&mut self, estimate: f32) {
        common::ema_seeded(
            estimate,
            &mut self.state.cp_based_hz_norm,
            &mut self.state.is_cp_stage_primed,
            self.ema_alpha,
        );
        debug!("CFO CP stage: estimate={:.4}, mean={:.4}", estimate, self.state.cp_based_hz_norm);
    }

    /// Remove the CP-stage average from `samples`
    pub fn apply_cp_correction(&self, samples: &mut [Complex32]) {
        if self.state.is_cp_stage_primed {
            apply_frequency_shift(samples, -self.state.cp_based_hz_norm, self.fft_size, 0);
        }
    }

    /// Raw PSS-phase estimate for a PSS whose last useful sample is at `peak - 1`
    pub fn estimate_pss(&self, window: &[Complex32], peak: usize, reference: &[Complex32]) -> Option<f32> {
        let n = self.fft_size;
        if peak < n || peak > window.len() || reference.len() != n {
            return None;
        }

        let symbol = &window[peak - n..peak];
        let half = n / 2;
        let partial = |range: std::ops::Range<usize>| -> Complex32 {
            range.map(|k| reference[k].conj() * symbol[k]).sum()
        };
        let y0 = partial(0..half);
        let y1 = partial(half..n);
        if y0.is_zero() || y1.is_zero() {
            return None;
        }

        Some((y0.conj() * y1).arg() / PI)
    }

    /// Fold a PSS-phase estimate into its average, unless it exceeds the
    /// sanity bound. Returns whether the estimate was accepted.
    pub fn update_pss(&mut self, estimate: f32) -> bool {
        if estimate.abs() >= self.pss_max_norm {
            warn!(
                "Rejecting PSS CFO estimate {:.1} Hz (bound {:.1} Hz)",
                estimate * common::SUBCARRIER_SPACING_HZ,
                self.pss_max_norm * common::SUBCARRIER_SPACING_HZ
            );
            return false;
        }

        common::ema_seeded(
            estimate,
            &mut self.state.pss_based_hz_norm,
            &mut self.state.is_pss_stage_primed,
            self.ema_alpha,
        );
        debug!("CFO PSS stage: estimate={:.4}, mean={:.4}", estimate, self.state.pss_based_hz_norm);
        true
    }

    /// Remove the PSS-stage average from `samples`
    pub fn apply_pss_correction(&self, samples: &mut [Complex32]) {
        if self.state.is_pss_stage_primed {
            apply_frequency_shift(samples, -self.state.pss_based_hz_norm, self.fft_size, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::frame_structure::Numerology;
    use crate::phy::ofdm::OfdmModulator;
    use crate::phy::pss_sss::{generate_pss, map_to_subcarriers};
    use common::CyclicPrefixKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config(fft_size: usize) -> CfoConfig {
        CfoConfig {
            fft_size,
            frame_size: 4096,
            integer_enable: true,
            cp_enable: true,
            cp_nsymbols: 2,
            pss_enable: true,
            ema_alpha: 0.5,
            pss_max_hz: DEFAULT_PSS_CFO_MAX_HZ,
        }
    }

    /// Symbols of random data, each with a normal CP
    fn cp_signal(fft_size: usize, nsymbols: usize) -> Vec<Complex32> {
        let mut rng = StdRng::seed_from_u64(17);
        let cp = cp_len_normal(fft_size);
        let mut out = Vec::new();
        for _ in 0..nsymbols {
            let useful: Vec<Complex32> = (0..fft_size)
                .map(|_| Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
                .collect();
            out.extend_from_slice(&useful[fft_size - cp..]);
            out.extend_from_slice(&useful);
        }
        out
    }

    fn pss_symbol(fft_size: usize) -> Vec<Complex32> {
        let numerology = Numerology::new(fft_size, CyclicPrefixKind::Normal).unwrap();
        let mut modulator = OfdmModulator::new(numerology);
        let mut grid = vec![Complex32::zero(); fft_size];
        map_to_subcarriers(&generate_pss(0).unwrap(), &mut grid);
        let mut time = vec![Complex32::zero(); fft_size];
        modulator.transform(&grid, &mut time).unwrap();
        time
    }

    #[test]
    fn test_stage_order() {
        let mut cfg = config(128);
        cfg.cp_enable = false;
        let estimator = CfoEstimator::new(cfg).unwrap();
        assert_eq!(
            estimator.stages(),
            &[Some(CfoStage::IntegerBin), None, Some(CfoStage::PssPhase)]
        );
        assert!(!estimator.is_enabled(CfoStage::CyclicPrefix));
    }

    #[test]
    fn test_invalid_config() {
        let mut cfg = config(128);
        cfg.ema_alpha = 0.0;
        assert!(CfoEstimator::new(cfg).is_err());
        let mut cfg = config(128);
        cfg.cp_nsymbols = 0;
        assert!(CfoEstimator::new(cfg).is_err());
    }

    #[test]
    fn test_cp_estimate() {
        let mut signal = cp_signal(128, 6);
        apply_frequency_shift(&mut signal, 0.2, 128, 0);

        let mut estimator = CfoEstimator::new(config(128)).unwrap();
        let estimate = estimator.estimate_cp(&signal, signal.len()).unwrap();
        assert!((estimate - 0.2).abs() < 1e-3, "estimate {}", estimate);

        estimator.update_cp(estimate);
        assert!(estimator.state().is_cp_stage_primed);
        assert_eq!(estimator.state().cp_based_hz_norm, estimate);
    }

    #[test]
    fn test_cp_estimate_needs_samples() {
        let mut estimator = CfoEstimator::new(config(128)).unwrap();
        let short = vec![Complex32::new(1.0, 0.0); 200];
        assert_eq!(estimator.estimate_cp(&short, 200), None);
    }

    #[test]
    fn test_pss_estimate() {
        let mut window = vec![Complex32::zero(); 40];
        let reference = pss_symbol(128);
        window.extend_from_slice(&reference);
        apply_frequency_shift(&mut window, -0.15, 128, 0);

        let estimator = CfoEstimator::new(config(128)).unwrap();
        let estimate = estimator.estimate_pss(&window, 168, &reference).unwrap();
        assert!((estimate + 0.15).abs() < 0.02, "estimate {}", estimate);
        assert_eq!(estimator.estimate_pss(&window, 100, &reference), None);
    }

    #[test]
    fn test_pss_sanity_bound() {
        let mut estimator = CfoEstimator::new(config(128)).unwrap();
        // 0.5 subcarriers = 7.5 kHz
        assert!(!estimator.update_pss(0.5));
        assert!(!estimator.state().is_pss_stage_primed);

        assert!(estimator.update_pss(0.2));
        assert!(estimator.update_pss(0.1));
        assert!((estimator.state().pss_based_hz_norm - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_integer_bin_selection_and_correction() {
        let mut estimator = CfoEstimator::new(config(64)).unwrap();
        assert_eq!(estimator.select_integer_bin([1.0, 2.0, 3.0]), 1);
        assert_eq!(estimator.select_integer_bin([5.0, 5.0, 1.0]), 0);
        assert_eq!(estimator.select_integer_bin([9.0, 2.0, 3.0]), -1);

        let mut shifted = vec![Complex32::new(1.0, 0.0); 200];
        apply_frequency_shift(&mut shifted, -1.0, 64, 0);
        estimator.apply_integer_correction(&mut shifted);
        for s in &shifted {
            assert!((s - Complex32::new(1.0, 0.0)).norm() < 1e-4);
        }
    }

    #[test]
    fn test_combined_reset_and_copy() {
        let mut a = CfoEstimator::new(config(128)).unwrap();
        a.select_integer_bin([0.0, 0.0, 1.0]);
        a.update_cp(0.1);
        a.update_pss(0.05);
        assert!((a.state().combined_hz_norm() - 1.15).abs() < 1e-6);
        assert!((a.state().combined_hz() - 17250.0).abs() < 0.1);

        let mut b = CfoEstimator::new(config(128)).unwrap();
        b.copy_from(a.state());
        assert_eq!(b.state(), a.state());

        a.reset();
        assert!(!a.state().is_cp_stage_primed);
        assert!(!a.state().is_pss_stage_primed);
        assert_eq!(a.state().combined_hz_norm(), 0.0);
    }
}
