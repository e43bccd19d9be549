//! PSS/SSS Synchronizer
//!
//! One detection pass over a receive window for a given N_id_2 hypothesis:
//! CFO pre-correction, PSS correlation, threshold test, PSS-phase CFO update,
//! CP length decision and SSS detection. The caller's window is never
//! modified; all corrections are applied to an internal copy, and every
//! reported position is an index into the caller's window.

use crate::LayerError;
use common::{CellIdentity, CyclicPrefixKind, DuplexMode};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cfo::{CfoConfig, CfoEstimator, CfoStage, CfoState, DEFAULT_PSS_CFO_MAX_HZ};
use super::correlator::{CorrelationMethod, CorrelationReference, Correlator, CorrelatorConfig};
use super::cp_detect::{CpDetector, DEFAULT_CP_EMA_ALPHA};
use super::frame_structure::{validate_fft_size, Numerology};
use super::ofdm::apply_frequency_shift;
use super::pss_sss::pss_time_domain;
use super::sss_detect::{SssDetection, SssDetector, DEFAULT_SSS_RATIO_THRESHOLD};

/// Duplex modes tried for the SSS, in preference order on equal strength
const DUPLEX_HYPOTHESES: [DuplexMode; 2] = [DuplexMode::Fdd, DuplexMode::Tdd];

/// Synchronizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// FFT size (64..=2048, multiple of 64)
    pub fft_size: usize,
    /// Largest window accepted by [`Synchronizer::find`]
    pub frame_size: usize,
    /// Samples searched for the PSS, starting at the search offset
    pub max_timing_search_window: usize,
    /// Decimation applied before the PSS correlation
    pub decimation_factor: usize,
    /// Correlation method
    pub correlation_method: CorrelationMethod,
    /// EMA weight of the correlation magnitude (1.0 disables averaging)
    pub correlation_ema_alpha: f32,
    /// Minimum PSR; 0 accepts any non-zero peak
    pub peak_threshold: f32,
    /// Integer-bin CFO stage
    pub cfo_integer_enable: bool,
    /// CP-based CFO stage
    pub cfo_cp_enable: bool,
    /// Symbols integrated by the CP-based CFO stage
    pub cfo_cp_nsymbols: usize,
    /// PSS-phase CFO stage
    pub cfo_pss_enable: bool,
    /// EMA weight of fractional CFO estimates
    pub cfo_ema_alpha: f32,
    /// PSS-phase estimates at or above this offset are rejected
    pub cfo_pss_max_hz: f32,
    /// Detect the CP length on every detection
    pub detect_cp: bool,
    /// EMA weight of the CP decision metrics
    pub cp_detect_ema_alpha: f32,
    /// CP length used when not detecting
    pub cp: CyclicPrefixKind,
    /// Try both duplex hypotheses for the SSS
    pub detect_duplex_mode: bool,
    /// Duplex mode used when not detecting
    pub duplex_mode: DuplexMode,
    /// Slot-sequence ratio needed to accept the SSS
    pub sss_ratio_threshold: f32,
    /// Non-coherent segments in the SSS m-sequence search
    pub sss_partial_segments: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fft_size: 128,
            frame_size: 9600,
            max_timing_search_window: 9600,
            decimation_factor: 1,
            correlation_method: CorrelationMethod::Auto,
            correlation_ema_alpha: 1.0,
            peak_threshold: 2.0,
            cfo_integer_enable: false,
            cfo_cp_enable: true,
            cfo_cp_nsymbols: 2,
            cfo_pss_enable: true,
            cfo_ema_alpha: 0.1,
            cfo_pss_max_hz: DEFAULT_PSS_CFO_MAX_HZ,
            detect_cp: true,
            cp_detect_ema_alpha: DEFAULT_CP_EMA_ALPHA,
            cp: CyclicPrefixKind::Normal,
            detect_duplex_mode: true,
            duplex_mode: DuplexMode::Fdd,
            sss_ratio_threshold: DEFAULT_SSS_RATIO_THRESHOLD,
            sss_partial_segments: 1,
        }
    }
}

impl SyncConfig {
    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<(), LayerError> {
        validate_fft_size(self.fft_size)?;

        let d = self.decimation_factor;
        if d == 0 || self.fft_size % d != 0 || validate_fft_size(self.fft_size / d).is_err() {
            return Err(LayerError::InvalidConfiguration(format!(
                "decimation factor {} must divide FFT size {} and leave a supported FFT size",
                d, self.fft_size
            )));
        }
        if self.max_timing_search_window == 0 || self.max_timing_search_window < d {
            return Err(LayerError::InvalidConfiguration(format!(
                "timing search window {} too small for decimation {}",
                self.max_timing_search_window, d
            )));
        }
        if self.frame_size < self.max_timing_search_window {
            return Err(LayerError::InvalidConfiguration(format!(
                "frame size {} smaller than timing search window {}",
                self.frame_size, self.max_timing_search_window
            )));
        }
        for (name, alpha) in [
            ("correlation", self.correlation_ema_alpha),
            ("CFO", self.cfo_ema_alpha),
            ("CP detection", self.cp_detect_ema_alpha),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(LayerError::InvalidConfiguration(format!(
                    "{} EMA alpha {} outside (0, 1]",
                    name, alpha
                )));
            }
        }
        if self.peak_threshold < 0.0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "peak threshold {} is negative",
                self.peak_threshold
            )));
        }
        Ok(())
    }
}

/// Detection details of a [`SyncFindOutcome::Found`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncFound {
    /// One past the last useful PSS sample, in window coordinates
    pub peak_position: usize,
    /// Correlation magnitude at the peak
    pub peak_value: f32,
    /// Peak-to-sidelobe ratio
    pub psr: f32,
    /// Subframe carrying this PSS (0/5 FDD, 1/6 TDD); 0 when the SSS was not detected
    pub subframe_index: u32,
    /// Detected N_id_1, or [`CellIdentity::UNRESOLVED`]
    pub n_id_1: u16,
    /// CP length in effect
    pub cp: CyclicPrefixKind,
    /// Duplex mode in effect
    pub duplex_mode: DuplexMode,
    /// An SSS symbol was inspected
    pub sss_available: bool,
    /// The SSS was confirmed
    pub sss_detected: bool,
}

/// Outcome of one [`Synchronizer::find`] pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncFindOutcome {
    /// PSS above threshold with room for the SSS
    Found(SyncFound),
    /// PSS above threshold but too close to a window edge for the SSS
    FoundButNoSpace { peak_position: usize },
    /// No PSS above threshold
    NotFound,
}

impl SyncFindOutcome {
    /// PSS peak position for either found variant
    pub fn peak_position(&self) -> Option<usize> {
        match self {
            SyncFindOutcome::Found(found) => Some(found.peak_position),
            SyncFindOutcome::FoundButNoSpace { peak_position } => Some(*peak_position),
            SyncFindOutcome::NotFound => None,
        }
    }
}

/// PSS correlator for one N_id_2 with its integer-bin references
struct PssSearch {
    /// Correlator holding the unshifted reference and its magnitude EMA
    correlator: Correlator,
    /// References shifted by -1, 0 and +1 subcarrier
    shifted: [CorrelationReference; 3],
}

/// Per-window PSS/SSS detector
pub struct Synchronizer {
    /// Settings
    config: SyncConfig,
    /// Normal-CP numerology
    normal: Numerology,
    /// Extended-CP numerology
    extended: Numerology,
    /// One PSS search per N_id_2
    searches: Vec<PssSearch>,
    /// Full-rate PSS useful part per N_id_2
    pss_time: Vec<Vec<Complex32>>,
    /// CFO estimator
    cfo: CfoEstimator,
    /// CP length detector
    cp_detector: CpDetector,
    /// SSS detector
    sss: SssDetector,
    /// Corrected copy of the caller's window
    work: Vec<Complex32>,
    /// Current CP length
    cp: CyclicPrefixKind,
    /// Current duplex mode
    duplex_mode: DuplexMode,
    /// PSR of the last correlation
    last_psr: f32,
    /// Peak value of the last correlation
    last_peak_value: f32,
    /// Last detection inspected an SSS
    sss_available: bool,
    /// Last detection confirmed an SSS
    sss_detected: bool,
}

impl Synchronizer {
    /// Create a synchronizer, allocating all buffers
    pub fn new(config: SyncConfig) -> Result<Self, LayerError> {
        config.validate()?;

        let n = config.fft_size;
        let decimated_fft = n / config.decimation_factor;
        let correlator_config = CorrelatorConfig {
            decimation: config.decimation_factor,
            method: config.correlation_method,
            ema_alpha: config.correlation_ema_alpha,
        };

        let mut searches = Vec::with_capacity(3);
        let mut pss_time = Vec::with_capacity(3);
        for n_id_2 in 0..=CellIdentity::MAX_NID_2 {
            let reference = pss_time_domain(n_id_2, decimated_fft)?;
            let mut correlator = Correlator::new(&reference, config.max_timing_search_window, correlator_config)?;

            let mut shifted = [
                CorrelationReference::default(),
                CorrelationReference::default(),
                CorrelationReference::default(),
            ];
            for (slot, bin) in shifted.iter_mut().zip([-1.0f32, 0.0, 1.0]) {
                let mut copy = reference.clone();
                apply_frequency_shift(&mut copy, bin, decimated_fft, 0);
                *slot = correlator.prepare_reference(&copy)?;
            }

            searches.push(PssSearch { correlator, shifted });
            pss_time.push(pss_time_domain(n_id_2, n)?);
        }

        let cfo = CfoEstimator::new(CfoConfig {
            fft_size: n,
            frame_size: config.frame_size,
            integer_enable: config.cfo_integer_enable,
            cp_enable: config.cfo_cp_enable,
            cp_nsymbols: config.cfo_cp_nsymbols,
            pss_enable: config.cfo_pss_enable,
            ema_alpha: config.cfo_ema_alpha,
            pss_max_hz: config.cfo_pss_max_hz,
        })?;

        debug!(
            "Synchronizer: N={}, frame={}, search={}, D={}, threshold={}, CFO stages {:?}",
            n,
            config.frame_size,
            config.max_timing_search_window,
            config.decimation_factor,
            config.peak_threshold,
            cfo.stages()
        );

        Ok(Self {
            normal: Numerology::new(n, CyclicPrefixKind::Normal)?,
            extended: Numerology::new(n, CyclicPrefixKind::Extended)?,
            searches,
            pss_time,
            cp_detector: CpDetector::new(n, config.cp_detect_ema_alpha)?,
            sss: SssDetector::new(n, config.sss_partial_segments, config.sss_ratio_threshold)?,
            work: Vec::with_capacity(config.frame_size),
            cp: config.cp,
            duplex_mode: config.duplex_mode,
            last_psr: 0.0,
            last_peak_value: 0.0,
            sss_available: false,
            sss_detected: false,
            cfo,
            config,
        })
    }

    /// Search `window[search_offset..search_offset + max_timing_search_window]`
    /// for the PSS of `n_id_2` and, if found, resolve the SSS.
    pub fn find(
        &mut self,
        window: &[Complex32],
        n_id_2: u8,
        search_offset: usize,
    ) -> Result<SyncFindOutcome, LayerError> {
        if n_id_2 > CellIdentity::MAX_NID_2 {
            return Err(LayerError::InvalidNid2(n_id_2));
        }
        let span = self.config.max_timing_search_window;
        if window.len() > self.config.frame_size || search_offset + span > window.len() {
            return Err(LayerError::InvalidWindow(format!(
                "window of {} samples (max {}) cannot hold search region {}..{}",
                window.len(),
                self.config.frame_size,
                search_offset,
                search_offset + span
            )));
        }

        self.sss_available = false;
        self.sss_detected = false;
        self.work.clear();
        self.work.extend_from_slice(window);
        let region = search_offset..search_offset + span;
        let index = n_id_2 as usize;

        // Integer-bin stage, then its correction
        if self.cfo.is_enabled(CfoStage::IntegerBin) {
            let search = &mut self.searches[index];
            let mut peaks = [0.0f32; 3];
            for (peak, reference) in peaks.iter_mut().zip(search.shifted.iter()) {
                *peak = search
                    .correlator
                    .correlate_with(&self.work[region.clone()], reference)?
                    .peak_value;
            }
            self.cfo.select_integer_bin(peaks);
        }
        self.cfo.apply_integer_correction(&mut self.work);

        // CP stage, then its correction
        if self.cfo.is_enabled(CfoStage::CyclicPrefix) {
            if let Some(estimate) = self.cfo.estimate_cp(&self.work[search_offset..], span) {
                self.cfo.update_cp(estimate);
            }
        }
        self.cfo.apply_cp_correction(&mut self.work);

        let result = self.searches[index].correlator.correlate(&self.work[region])?;
        let peak_position = search_offset + result.peak_position;
        self.last_psr = result.peak_to_sidelobe_ratio;
        self.last_peak_value = result.peak_value;

        let passed = if self.config.peak_threshold == 0.0 {
            result.peak_value > 0.0
        } else {
            result.peak_to_sidelobe_ratio >= self.config.peak_threshold
        };
        if !passed {
            debug!(
                "N_id_2={}: PSR {:.2} below threshold {:.2}",
                n_id_2, result.peak_to_sidelobe_ratio, self.config.peak_threshold
            );
            return Ok(SyncFindOutcome::NotFound);
        }

        // PSS stage, then its correction
        if self.cfo.is_enabled(CfoStage::PssPhase) {
            if let Some(estimate) = self.cfo.estimate_pss(&self.work, peak_position, &self.pss_time[index]) {
                self.cfo.update_pss(estimate);
            }
        }
        self.cfo.apply_pss_correction(&mut self.work);

        let usable = DUPLEX_HYPOTHESES.map(|d| {
            (self.config.detect_duplex_mode || d == self.duplex_mode)
                && peak_position >= self.normal.sss_required_space(d)
                && peak_position <= self.work.len()
        });
        if !usable.contains(&true) {
            debug!(
                "N_id_2={}: PSS at {} (PSR {:.2}) leaves no room for the SSS",
                n_id_2, peak_position, result.peak_to_sidelobe_ratio
            );
            return Ok(SyncFindOutcome::FoundButNoSpace { peak_position });
        }

        if self.config.detect_cp {
            self.cp = self.cp_detector.detect(&self.work, peak_position);
        }

        let numerology = match self.cp {
            CyclicPrefixKind::Normal => self.normal,
            CyclicPrefixKind::Extended => self.extended,
        };
        let pss_start = peak_position - self.config.fft_size;
        let mut best: Option<(DuplexMode, SssDetection)> = None;
        for (duplex, _) in DUPLEX_HYPOTHESES.into_iter().zip(usable).filter(|&(_, ok)| ok) {
            let Some(sss_start) = numerology.sss_start_from_peak(duplex, peak_position) else {
                continue;
            };
            let detection = self.sss.detect(&self.work, pss_start, sss_start, n_id_2)?;
            if best.map_or(true, |(_, b)| detection.strength > b.strength) {
                best = Some((duplex, detection));
            }
        }

        self.sss_available = best.is_some();
        let (subframe_index, n_id_1) = match best {
            Some((duplex, detection)) if detection.detected => {
                self.sss_detected = true;
                if self.config.detect_duplex_mode {
                    self.duplex_mode = duplex;
                }
                let offset = if duplex == DuplexMode::Tdd { 1 } else { 0 };
                (detection.subframe_index + offset, detection.n_id_1)
            }
            _ => (0, CellIdentity::UNRESOLVED),
        };

        let found = SyncFound {
            peak_position,
            peak_value: result.peak_value,
            psr: result.peak_to_sidelobe_ratio,
            subframe_index,
            n_id_1,
            cp: self.cp,
            duplex_mode: self.duplex_mode,
            sss_available: self.sss_available,
            sss_detected: self.sss_detected,
        };
        debug!(
            "N_id_2={}: PSS at {} PSR {:.2}, sf={}, N_id_1={}, CP {}, {}, CFO {:.1} Hz",
            n_id_2,
            peak_position,
            found.psr,
            subframe_index,
            n_id_1,
            self.cp,
            self.duplex_mode,
            self.cfo_hz()
        );
        Ok(SyncFindOutcome::Found(found))
    }

    /// Settings
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Numerology for the current CP length
    pub fn numerology(&self) -> &Numerology {
        match self.cp {
            CyclicPrefixKind::Normal => &self.normal,
            CyclicPrefixKind::Extended => &self.extended,
        }
    }

    /// PSR of the last correlation
    pub fn last_psr(&self) -> f32 {
        self.last_psr
    }

    /// Peak value of the last correlation
    pub fn last_peak_value(&self) -> f32 {
        self.last_peak_value
    }

    /// Last detection inspected an SSS
    pub fn sss_available(&self) -> bool {
        self.sss_available
    }

    /// Last detection confirmed an SSS
    pub fn sss_detected(&self) -> bool {
        self.sss_detected
    }

    /// Current CFO estimate
    pub fn cfo_state(&self) -> &CfoState {
        self.cfo.state()
    }

    /// Current CFO estimate in Hz
    pub fn cfo_hz(&self) -> f32 {
        self.cfo.state().combined_hz()
    }

    /// Clear the CFO estimate
    pub fn cfo_reset(&mut self) {
        self.cfo.reset();
    }

    /// Seed the CFO estimate from another synchronizer's state
    pub fn copy_cfo_from(&mut self, state: &CfoState) {
        self.cfo.copy_from(state);
    }

    /// Current CP length
    pub fn cp(&self) -> CyclicPrefixKind {
        self.cp
    }

    /// Force the CP length
    pub fn set_cp(&mut self, cp: CyclicPrefixKind) {
        self.cp = cp;
    }

    /// Current duplex mode
    pub fn duplex_mode(&self) -> DuplexMode {
        self.duplex_mode
    }

    /// Force the duplex mode
    pub fn set_duplex_mode(&mut self, duplex_mode: DuplexMode) {
        self.duplex_mode = duplex_mode;
    }

    /// Forget all smoothed state
    pub fn reset(&mut self) {
        self.cfo.reset();
        self.cp_detector.reset();
        for search in &mut self.searches {
            search.correlator.reset();
        }
        self.cp = self.config.cp;
        self.duplex_mode = self.config.duplex_mode;
        self.last_psr = 0.0;
        self.last_peak_value = 0.0;
        self.sss_available = false;
        self.sss_detected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::downlink::{DownlinkConfig, DownlinkGenerator};

    fn downlink(cell: CellIdentity, cp: CyclicPrefixKind, duplex_mode: DuplexMode) -> DownlinkConfig {
        DownlinkConfig {
            fft_size: 128,
            cell,
            cp,
            duplex_mode,
            ..DownlinkConfig::default()
        }
    }

    fn quiet_config() -> SyncConfig {
        SyncConfig {
            frame_size: 1920,
            max_timing_search_window: 1920,
            cfo_cp_enable: false,
            cfo_pss_enable: false,
            detect_duplex_mode: false,
            ..SyncConfig::default()
        }
    }

    /// First subframe of the generated stream
    fn first_subframe(config: DownlinkConfig) -> Vec<Complex32> {
        let mut generator = DownlinkGenerator::new(config).unwrap();
        generator.generate_subframes(1).unwrap()
    }

    fn expect_found(outcome: SyncFindOutcome) -> SyncFound {
        match outcome {
            SyncFindOutcome::Found(found) => found,
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::default().validate().is_ok());
        let bad = [
            SyncConfig { fft_size: 100, ..SyncConfig::default() },
            SyncConfig { decimation_factor: 3, ..SyncConfig::default() },
            SyncConfig { decimation_factor: 4, ..SyncConfig::default() },
            SyncConfig { max_timing_search_window: 0, ..SyncConfig::default() },
            SyncConfig { frame_size: 100, ..SyncConfig::default() },
            SyncConfig { cfo_ema_alpha: 0.0, ..SyncConfig::default() },
            SyncConfig { correlation_ema_alpha: 1.5, ..SyncConfig::default() },
        ];
        for config in bad {
            assert!(Synchronizer::new(config).is_err());
        }
    }

    #[test]
    fn test_find_fdd_subframe_0() {
        let cell = CellIdentity::new(33, 1).unwrap();
        let window = first_subframe(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd));

        let mut sync = Synchronizer::new(quiet_config()).unwrap();
        let found = expect_found(sync.find(&window, 1, 0).unwrap());
        assert_eq!(found.peak_position, 960);
        assert_eq!(found.n_id_1, 33);
        assert_eq!(found.subframe_index, 0);
        assert_eq!(found.cp, CyclicPrefixKind::Normal);
        assert!(found.sss_available && found.sss_detected);
        assert!(sync.sss_detected());
        assert_eq!(sync.last_psr(), found.psr);
    }

    #[test]
    fn test_wrong_nid2_is_not_found() {
        let cell = CellIdentity::new(10, 0).unwrap();
        let window = first_subframe(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd));
        let mut sync = Synchronizer::new(SyncConfig { peak_threshold: 3.0, ..quiet_config() }).unwrap();
        assert_eq!(sync.find(&window, 2, 0).unwrap(), SyncFindOutcome::NotFound);
    }

    #[test]
    fn test_invalid_arguments() {
        let mut sync = Synchronizer::new(quiet_config()).unwrap();
        let window = vec![Complex32::new(0.0, 0.0); 1920];
        assert!(matches!(sync.find(&window, 3, 0), Err(LayerError::InvalidNid2(3))));
        assert!(matches!(sync.find(&window, 0, 1), Err(LayerError::InvalidWindow(_))));
        assert!(matches!(sync.find(&window[..1000], 0, 0), Err(LayerError::InvalidWindow(_))));
    }

    #[test]
    fn test_find_is_idempotent() {
        let cell = CellIdentity::new(120, 2).unwrap();
        let window = first_subframe(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd));
        let mut sync = Synchronizer::new(quiet_config()).unwrap();

        let first = sync.find(&window, 2, 0).unwrap();
        for _ in 0..3 {
            assert_eq!(sync.find(&window, 2, 0).unwrap(), first);
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let cell = CellIdentity::new(5, 0).unwrap();
        let window = first_subframe(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd));

        let mut probe = Synchronizer::new(SyncConfig { peak_threshold: 0.0, ..quiet_config() }).unwrap();
        let psr = expect_found(probe.find(&window, 0, 0).unwrap()).psr;

        let mut at = Synchronizer::new(SyncConfig { peak_threshold: psr, ..quiet_config() }).unwrap();
        assert!(matches!(at.find(&window, 0, 0).unwrap(), SyncFindOutcome::Found(_)));

        let above = f32::from_bits(psr.to_bits() + 1);
        let mut over = Synchronizer::new(SyncConfig { peak_threshold: above, ..quiet_config() }).unwrap();
        assert_eq!(over.find(&window, 0, 0).unwrap(), SyncFindOutcome::NotFound);
    }

    #[test]
    fn test_zero_threshold_needs_energy() {
        let mut sync = Synchronizer::new(SyncConfig { peak_threshold: 0.0, ..quiet_config() }).unwrap();
        let zeros = vec![Complex32::new(0.0, 0.0); 1920];
        assert_eq!(sync.find(&zeros, 0, 0).unwrap(), SyncFindOutcome::NotFound);
    }

    #[test]
    fn test_found_but_no_space() {
        let cell = CellIdentity::new(7, 1).unwrap();
        let subframe = first_subframe(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd));
        // Keep only the PSS symbol and what follows
        let window: Vec<Complex32> = subframe[960 - 137..].to_vec();
        let config = SyncConfig {
            frame_size: window.len(),
            max_timing_search_window: window.len(),
            ..quiet_config()
        };
        let mut sync = Synchronizer::new(config).unwrap();
        assert_eq!(
            sync.find(&window, 1, 0).unwrap(),
            SyncFindOutcome::FoundButNoSpace { peak_position: 137 }
        );
        assert!(!sync.sss_available());
    }

    #[test]
    fn test_search_offset_reports_window_coordinates() {
        let cell = CellIdentity::new(90, 0).unwrap();
        let window = first_subframe(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd));
        let config = SyncConfig {
            max_timing_search_window: 128 + 64,
            ..quiet_config()
        };
        let mut sync = Synchronizer::new(config).unwrap();
        let found = expect_found(sync.find(&window, 0, 960 - 128 - 32).unwrap());
        assert_eq!(found.peak_position, 960);
        assert_eq!(found.n_id_1, 90);
    }

    #[test]
    fn test_extended_cp_detection() {
        let cell = CellIdentity::new(77, 2).unwrap();
        let config = DownlinkConfig {
            data_fill: true,
            ..downlink(cell, CyclicPrefixKind::Extended, DuplexMode::Fdd)
        };
        let window = first_subframe(config);

        let mut sync = Synchronizer::new(quiet_config()).unwrap();
        let found = expect_found(sync.find(&window, 2, 0).unwrap());
        assert_eq!(found.cp, CyclicPrefixKind::Extended);
        assert_eq!(found.peak_position, 960);
        assert_eq!(found.n_id_1, 77);
        assert_eq!(sync.numerology().cp(), CyclicPrefixKind::Extended);
    }

    #[test]
    fn test_tdd_detection() {
        let cell = CellIdentity::new(150, 1).unwrap();
        let mut generator = DownlinkGenerator::new(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Tdd)).unwrap();
        // Subframes 5, 6 and 7: PSS of subframe 6 with the SSS of subframe 5 before it
        generator.generate_subframes(5).unwrap();
        let window = generator.generate_subframes(3).unwrap();

        let config = SyncConfig {
            frame_size: window.len(),
            max_timing_search_window: window.len(),
            detect_duplex_mode: true,
            ..quiet_config()
        };
        let mut sync = Synchronizer::new(config).unwrap();
        let found = expect_found(sync.find(&window, 1, 0).unwrap());
        assert_eq!(found.peak_position, 1920 + 412);
        assert_eq!(found.duplex_mode, DuplexMode::Tdd);
        assert_eq!(found.subframe_index, 6);
        assert_eq!(found.n_id_1, 150);
        assert_eq!(sync.duplex_mode(), DuplexMode::Tdd);
    }

    #[test]
    fn test_fixed_duplex_mode_is_kept() {
        let cell = CellIdentity::new(150, 1).unwrap();
        let mut generator = DownlinkGenerator::new(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Tdd)).unwrap();
        generator.generate_subframes(5).unwrap();
        let window = generator.generate_subframes(3).unwrap();

        let config = SyncConfig {
            frame_size: window.len(),
            max_timing_search_window: window.len(),
            duplex_mode: DuplexMode::Tdd,
            ..quiet_config()
        };
        let mut sync = Synchronizer::new(config).unwrap();
        for _ in 0..2 {
            let found = expect_found(sync.find(&window, 1, 0).unwrap());
            assert_eq!(found.duplex_mode, DuplexMode::Tdd);
            assert_eq!(found.subframe_index, 6);
            assert_eq!(found.n_id_1, 150);
        }

        // Too close to the start for the TDD SSS
        let short = &window[1920..];
        let mut sync = Synchronizer::new(SyncConfig {
            frame_size: short.len(),
            max_timing_search_window: short.len(),
            duplex_mode: DuplexMode::Tdd,
            ..quiet_config()
        })
        .unwrap();
        assert_eq!(
            sync.find(short, 1, 0).unwrap(),
            SyncFindOutcome::FoundButNoSpace { peak_position: 412 }
        );
    }

    #[test]
    fn test_decimated_search() {
        let cell = CellIdentity::new(44, 1).unwrap();
        let window = first_subframe(downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd));
        let config = SyncConfig { decimation_factor: 2, ..quiet_config() };
        let mut sync = Synchronizer::new(config).unwrap();
        let found = expect_found(sync.find(&window, 1, 0).unwrap());
        assert!((found.peak_position as i64 - 960).abs() <= 2, "peak {}", found.peak_position);
        assert_eq!(found.n_id_1, 44);
    }

    #[test]
    fn test_fractional_cfo_estimate() {
        let cell = CellIdentity::new(12, 0).unwrap();
        let config = DownlinkConfig {
            data_fill: true,
            cfo_hz: 1500.0,
            ..downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd)
        };
        let window = first_subframe(config);

        let mut sync = Synchronizer::new(SyncConfig {
            cfo_cp_enable: true,
            cfo_pss_enable: true,
            ..quiet_config()
        })
        .unwrap();
        let found = expect_found(sync.find(&window, 0, 0).unwrap());
        assert_eq!(found.n_id_1, 12);
        assert!(sync.cfo_state().is_cp_stage_primed);
        assert!(sync.cfo_state().is_pss_stage_primed);
        let estimate = sync.cfo_state().combined_hz_norm();
        assert!((estimate - 0.1).abs() < 0.01, "estimate {}", estimate);
        assert!((sync.cfo_hz() - 1500.0).abs() < 150.0);
    }

    #[test]
    fn test_pss_only_cfo_estimate() {
        let cell = CellIdentity::new(3, 2).unwrap();
        let config = DownlinkConfig {
            cfo_hz: -1200.0,
            ..downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd)
        };
        let window = first_subframe(config);

        let mut sync = Synchronizer::new(SyncConfig { cfo_pss_enable: true, ..quiet_config() }).unwrap();
        expect_found(sync.find(&window, 2, 0).unwrap());
        assert!(!sync.cfo_state().is_cp_stage_primed);
        assert!((sync.cfo_state().combined_hz_norm() + 0.08).abs() < 0.02);
    }

    #[test]
    fn test_integer_cfo_estimate() {
        let cell = CellIdentity::new(60, 1).unwrap();
        let config = DownlinkConfig {
            data_fill: true,
            cfo_hz: 1.05 * 15000.0,
            ..downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd)
        };
        let window = first_subframe(config);

        let mut sync = Synchronizer::new(SyncConfig {
            cfo_integer_enable: true,
            cfo_cp_enable: true,
            cfo_pss_enable: true,
            ..quiet_config()
        })
        .unwrap();
        let found = expect_found(sync.find(&window, 1, 0).unwrap());
        assert_eq!(found.n_id_1, 60);
        assert_eq!(sync.cfo_state().integer_bin, 1);
        assert!((sync.cfo_state().combined_hz_norm() - 1.05).abs() < 0.01);
    }

    #[test]
    fn test_copy_and_reset_cfo() {
        let cell = CellIdentity::new(12, 0).unwrap();
        let config = DownlinkConfig {
            cfo_hz: 900.0,
            ..downlink(cell, CyclicPrefixKind::Normal, DuplexMode::Fdd)
        };
        let window = first_subframe(config);

        let mut find = Synchronizer::new(SyncConfig { cfo_pss_enable: true, ..quiet_config() }).unwrap();
        expect_found(find.find(&window, 0, 0).unwrap());

        let mut track = Synchronizer::new(quiet_config()).unwrap();
        track.copy_cfo_from(find.cfo_state());
        assert_eq!(track.cfo_hz(), find.cfo_hz());

        find.cfo_reset();
        assert_eq!(find.cfo_hz(), 0.0);
        assert!(!find.cfo_state().is_pss_stage_primed);
    }
}
