//! Secondary Synchronization Signal Detection
//!
//! Resolves N_id_1 and the half-frame from one SSS symbol. The PSS symbol
//! found by the correlator provides a channel estimate that equalizes the SSS
//! before the m-sequence shifts are searched:
//!
//! - even subcarriers, descrambled by `c0`, give the first shift
//! - odd subcarriers, descrambled by `c1` and `z1`, give the second shift
//!
//! Whichever shift is smaller is `m0`; the order tells subframe 0 from 5.

use crate::LayerError;
use common::CellIdentity;
use num_complex::Complex32;
use num_traits::Zero;
use tracing::debug;

use super::ofdm::OfdmDemodulator;
use super::pss_sss::{
    extract_from_subcarriers, generate_pss, generate_sss, n_id_1_from_m, sss_sequences, M_SEQUENCE_LENGTH,
    PSS_LENGTH, SSS_LENGTH,
};

/// Default slot-sequence correlation ratio needed to accept an SSS
pub const DEFAULT_SSS_RATIO_THRESHOLD: f32 = 1.2;

/// Floor applied to the losing correlation when computing the ratio
const RATIO_EPSILON: f32 = 1e-9;

/// Result of one SSS detection attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SssDetection {
    /// Resolved N_id_1 ([`CellIdentity::UNRESOLVED`] if the shifts map to no cell)
    pub n_id_1: u16,
    /// Subframe carrying the SSS (0 or 5)
    pub subframe_index: u32,
    /// Detected m-sequence shifts
    pub m0: usize,
    pub m1: usize,
    /// Winning over losing slot-sequence correlation
    pub ratio: f32,
    /// Winning correlation normalized by the equalized symbol magnitude (0..=1)
    pub strength: f32,
    /// Ratio reached the threshold and N_id_1 resolved
    pub detected: bool,
}

/// SSS detector with pre-allocated demodulation buffers
pub struct SssDetector {
    /// FFT size
    fft_size: usize,
    /// Non-coherent correlation segments per m-sequence search
    partial_segments: usize,
    /// Acceptance threshold for the slot-sequence ratio
    ratio_threshold: f32,
    /// Symbol demodulator
    demodulator: OfdmDemodulator,
    /// PSS reference per N_id_2
    pss: [[Complex32; PSS_LENGTH]; 3],
    /// Demodulated symbol
    grid: Vec<Complex32>,
    /// Channel estimate from the PSS
    channel: [Complex32; PSS_LENGTH],
    /// Equalized SSS
    equalized: [Complex32; SSS_LENGTH],
}

impl SssDetector {
    /// Create a detector
    pub fn new(fft_size: usize, partial_segments: usize, ratio_threshold: f32) -> Result<Self, LayerError> {
        if partial_segments == 0 || partial_segments > M_SEQUENCE_LENGTH {
            return Err(LayerError::InvalidConfiguration(format!(
                "SSS partial segments {} outside 1..={}",
                partial_segments, M_SEQUENCE_LENGTH
            )));
        }
        if ratio_threshold <= 0.0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "SSS ratio threshold {} must be positive",
                ratio_threshold
            )));
        }

        Ok(Self {
            fft_size,
            partial_segments,
            ratio_threshold,
            demodulator: OfdmDemodulator::new(fft_size),
            pss: [generate_pss(0)?, generate_pss(1)?, generate_pss(2)?],
            grid: vec![Complex32::zero(); fft_size],
            channel: [Complex32::zero(); PSS_LENGTH],
            equalized: [Complex32::zero(); SSS_LENGTH],
        })
    }

    /// Detect the SSS whose useful part starts at `sss_start`, using the PSS
    /// useful part starting at `pss_start` as channel reference
    pub fn detect(
        &mut self,
        window: &[Complex32],
        pss_start: usize,
        sss_start: usize,
        n_id_2: u8,
    ) -> Result<SssDetection, LayerError> {
        let n = self.fft_size;
        if n_id_2 > CellIdentity::MAX_NID_2 {
            return Err(LayerError::InvalidNid2(n_id_2));
        }
        if pss_start + n > window.len() || sss_start + n > window.len() {
            return Err(LayerError::InvalidWindow(format!(
                "SSS/PSS symbols at {}/{} exceed window of {}",
                sss_start,
                pss_start,
                window.len()
            )));
        }

        self.demodulator
            .demodulate_symbol(&window[pss_start..pss_start + n], &mut self.grid)?;
        extract_from_subcarriers(&self.grid, &mut self.channel);
        for (h, p) in self.channel.iter_mut().zip(self.pss[n_id_2 as usize].iter()) {
            *h *= p.conj();
        }

        self.demodulator
            .demodulate_symbol(&window[sss_start..sss_start + n], &mut self.grid)?;
        extract_from_subcarriers(&self.grid, &mut self.equalized);
        for (z, h) in self.equalized.iter_mut().zip(self.channel.iter()) {
            *z *= h.conj();
        }

        let seq = sss_sequences();
        let mut half = [Complex32::zero(); M_SEQUENCE_LENGTH];

        for (k, value) in half.iter_mut().enumerate() {
            *value = self.equalized[2 * k] * seq.c0(n_id_2, k);
        }
        let m_a = self.search_shift(&half);

        for (k, value) in half.iter_mut().enumerate() {
            *value = self.equalized[2 * k + 1] * seq.c1(n_id_2, k) * seq.z1(m_a, k);
        }
        let m_b = self.search_shift(&half);

        let (m0, m1, subframe_index) = if m_a < m_b { (m_a, m_b, 0) } else { (m_b, m_a, 5) };
        let n_id_1 = n_id_1_from_m(m0, m1);

        let (ratio, strength) = match n_id_1 {
            Some(n_id_1) => {
                let cell = CellIdentity::new(n_id_1, n_id_2)?;
                let pci = cell.physical_cell_id().ok_or(LayerError::InvalidNid1(n_id_1))?;
                let (sf0, sf5) = generate_sss(pci)?;
                let (win, lose) = if subframe_index == 0 { (sf0, sf5) } else { (sf5, sf0) };
                let c_win = self.sequence_correlation(&win);
                let c_lose = self.sequence_correlation(&lose);
                let magnitude: f32 = self.equalized.iter().map(|z| z.norm()).sum();
                let strength = if magnitude > 0.0 { c_win / magnitude } else { 0.0 };
                (c_win / c_lose.max(RATIO_EPSILON), strength)
            }
            None => (0.0, 0.0),
        };

        let detected = n_id_1.is_some() && ratio >= self.ratio_threshold;
        debug!(
            "SSS: m0={}, m1={}, sf={}, N_id_1={:?}, ratio={:.2}, detected={}",
            m0, m1, subframe_index, n_id_1, ratio, detected
        );

        Ok(SssDetection {
            n_id_1: n_id_1.unwrap_or(CellIdentity::UNRESOLVED),
            subframe_index,
            m0,
            m1,
            ratio,
            strength,
            detected,
        })
    }

    /// Cyclic shift of `s~` best matching `half`
    fn search_shift(&self, half: &[Complex32; M_SEQUENCE_LENGTH]) -> usize {
        let s = &sss_sequences().s;
        let segment = M_SEQUENCE_LENGTH.div_ceil(self.partial_segments);
        let mut best = (0, f32::MIN);
        for m in 0..M_SEQUENCE_LENGTH {
            let mut metric = 0.0;
            for chunk_start in (0..M_SEQUENCE_LENGTH).step_by(segment) {
                let chunk_end = (chunk_start + segment).min(M_SEQUENCE_LENGTH);
                let acc: Complex32 = (chunk_start..chunk_end)
                    .map(|k| half[k] * s[(k + m) % M_SEQUENCE_LENGTH])
                    .sum();
                metric += if self.partial_segments == 1 { acc.re } else { acc.norm() };
            }
            if metric > best.1 {
                best = (m, metric);
            }
        }
        best.0
    }

    /// Coherent correlation magnitude of the equalized SSS against `sequence`
    fn sequence_correlation(&self, sequence: &[f32; SSS_LENGTH]) -> f32 {
        self.equalized
            .iter()
            .zip(sequence.iter())
            .map(|(z, &d)| *z * d)
            .sum::<Complex32>()
            .norm()
    }
}
