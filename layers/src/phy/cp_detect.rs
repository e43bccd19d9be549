//! Cyclic Prefix Length Detection
//!
//! Decides between normal and extended CP by correlating the CP of the
//! symbols ending at the PSS peak with the tail of the same symbols under
//! both length hypotheses.

use crate::LayerError;
use common::CyclicPrefixKind;
use num_complex::Complex32;
use tracing::trace;

use super::frame_structure::{cp_len_extended, cp_len_normal};

/// Default EMA weight of the per-call CP metrics
pub const DEFAULT_CP_EMA_ALPHA: f32 = 0.2;

/// Symbols inspected before the peak
const MAX_CP_SYMBOLS: usize = 3;

/// Normal/extended CP detector with smoothed decision metrics
#[derive(Debug, Clone)]
pub struct CpDetector {
    /// FFT size
    fft_size: usize,
    /// EMA weight of new metrics
    ema_alpha: f32,
    /// Smoothed metric for the normal hypothesis
    normal_avg: f32,
    /// Smoothed metric for the extended hypothesis
    extended_avg: f32,
    /// Averages hold data
    primed: bool,
}

/// Per-hypothesis correlation sums
struct CpMetric {
    /// Real part of the tail/CP correlation
    r: f32,
    /// CP energy
    c: f32,
}

impl CpDetector {
    /// Create a detector
    pub fn new(fft_size: usize, ema_alpha: f32) -> Result<Self, LayerError> {
        if !(ema_alpha > 0.0 && ema_alpha <= 1.0) {
            return Err(LayerError::InvalidConfiguration(format!(
                "CP detection EMA alpha {} outside (0, 1]",
                ema_alpha
            )));
        }
        Ok(Self {
            fft_size,
            ema_alpha,
            normal_avg: 0.0,
            extended_avg: 0.0,
            primed: false,
        })
    }

    /// Smoothed `(normal, extended)` metrics
    pub fn averages(&self) -> (f32, f32) {
        (self.normal_avg, self.extended_avg)
    }

    /// Forget the smoothed metrics
    pub fn reset(&mut self) {
        self.normal_avg = 0.0;
        self.extended_avg = 0.0;
        self.primed = false;
    }

    /// Decide the CP length for a PSS ending at `peak`
    pub fn detect(&mut self, window: &[Complex32], peak: usize) -> CyclicPrefixKind {
        let n = self.fft_size;
        let peak = peak.min(window.len());
        let nof_symbols = (peak / (n + cp_len_extended(n))).min(MAX_CP_SYMBOLS);
        if nof_symbols == 0 {
            return CyclicPrefixKind::Normal;
        }

        let normal = self.metric(window, peak, cp_len_normal(n), nof_symbols);
        let extended = self.metric(window, peak, cp_len_extended(n), nof_symbols);

        let ratio = |m: &CpMetric| if m.c > 0.0 { m.r / m.c } else { 0.0 };
        let normal_ratio = ratio(&normal);
        let extended_ratio = ratio(&extended);

        if self.primed {
            self.normal_avg = common::ema(normal_ratio, self.normal_avg, self.ema_alpha);
            self.extended_avg = common::ema(extended_ratio, self.extended_avg, self.ema_alpha);
        } else {
            self.normal_avg = normal_ratio;
            self.extended_avg = extended_ratio;
            self.primed = true;
        }

        trace!(
            "CP metrics over {} symbols: normal={:.3} (avg {:.3}), extended={:.3} (avg {:.3})",
            nof_symbols,
            normal_ratio,
            self.normal_avg,
            extended_ratio,
            self.extended_avg
        );

        if self.normal_avg > self.extended_avg {
            CyclicPrefixKind::Normal
        } else if self.normal_avg < self.extended_avg {
            CyclicPrefixKind::Extended
        } else if normal.r >= extended.r {
            CyclicPrefixKind::Normal
        } else {
            CyclicPrefixKind::Extended
        }
    }

    fn metric(&self, window: &[Complex32], peak: usize, cp_len: usize, nof_symbols: usize) -> CpMetric {
        let n = self.fft_size;
        let mut metric = CpMetric { r: 0.0, c: 0.0 };
        let mut start = peak - nof_symbols * (n + cp_len);
        for _ in 0..nof_symbols {
            let cp = &window[start..start + cp_len];
            let tail = &window[start + n..start + n + cp_len];
            let dot: Complex32 = tail.iter().zip(cp).map(|(t, c)| *t * c.conj()).sum();
            metric.r += dot.re;
            metric.c += cp.iter().map(|c| c.norm_sqr()).sum::<f32>();
            start += n + cp_len;
        }
        metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::frame_structure::Numerology;
    use crate::phy::ofdm::OfdmModulator;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// One slot of random QPSK symbols on all subcarriers
    fn random_slot(fft_size: usize, cp: CyclicPrefixKind, seed: u64) -> Vec<Complex32> {
        let numerology = Numerology::new(fft_size, cp).unwrap();
        let mut modulator = OfdmModulator::new(numerology);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut slot = Vec::new();
        for symbol in 0..numerology.symbols_per_slot() {
            let grid: Vec<Complex32> = (0..fft_size)
                .map(|_| {
                    let re = if rng.gen::<bool>() { 1.0 } else { -1.0 };
                    let im = if rng.gen::<bool>() { 1.0 } else { -1.0 };
                    Complex32::new(re, im)
                })
                .collect();
            modulator.modulate(&grid, symbol, &mut slot).unwrap();
        }
        slot
    }

    #[test]
    fn test_detect_normal() {
        let slot = random_slot(128, CyclicPrefixKind::Normal, 1);
        let mut detector = CpDetector::new(128, DEFAULT_CP_EMA_ALPHA).unwrap();
        assert_eq!(detector.detect(&slot, slot.len()), CyclicPrefixKind::Normal);
        let (normal, extended) = detector.averages();
        assert!(normal > 0.9);
        assert!(extended < normal);
    }

    #[test]
    fn test_detect_extended() {
        let slot = random_slot(256, CyclicPrefixKind::Extended, 2);
        let mut detector = CpDetector::new(256, DEFAULT_CP_EMA_ALPHA).unwrap();
        assert_eq!(detector.detect(&slot, slot.len()), CyclicPrefixKind::Extended);
    }

    #[test]
    fn test_no_history_defaults_to_normal() {
        let slot = random_slot(128, CyclicPrefixKind::Extended, 3);
        let mut detector = CpDetector::new(128, DEFAULT_CP_EMA_ALPHA).unwrap();
        assert_eq!(detector.detect(&slot, 150), CyclicPrefixKind::Normal);
        assert_eq!(detector.averages(), (0.0, 0.0));
    }

    #[test]
    fn test_average_survives_one_bad_window() {
        let normal = random_slot(128, CyclicPrefixKind::Normal, 4);
        let extended = random_slot(128, CyclicPrefixKind::Extended, 5);
        let mut detector = CpDetector::new(128, DEFAULT_CP_EMA_ALPHA).unwrap();
        for _ in 0..5 {
            detector.detect(&normal, normal.len());
        }
        assert_eq!(detector.detect(&extended, extended.len()), CyclicPrefixKind::Normal);

        detector.reset();
        assert_eq!(detector.detect(&extended, extended.len()), CyclicPrefixKind::Extended);
    }

    #[test]
    fn test_silence_defaults_to_normal() {
        let silence = vec![Complex32::new(0.0, 0.0); 2000];
        let mut detector = CpDetector::new(128, DEFAULT_CP_EMA_ALPHA).unwrap();
        assert_eq!(detector.detect(&silence, 1500), CyclicPrefixKind::Normal);
        assert_eq!(detector.detect(&silence, 1500), CyclicPrefixKind::Normal);
    }

    #[test]
    fn test_invalid_alpha() {
        assert!(CpDetector::new(128, 0.0).is_err());
        assert!(CpDetector::new(128, 1.5).is_err());
    }
}
