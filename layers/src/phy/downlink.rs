//! Synthetic LTE Downlink Generator
//!
//! Produces a continuous baseband stream with PSS/SSS on the positions
//! defined for the configured duplex mode and CP length, optional QPSK
//! payload, and the impairments the receiver has to cope with: carrier
//! offset, white noise and sample-clock drift.

use crate::LayerError;
use common::{CellIdentity, CyclicPrefixKind, DuplexMode};
use interfaces::{InterfaceError, SampleSource};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f32::consts::FRAC_1_SQRT_2;
use tracing::{debug, trace};

use super::frame_structure::Numerology;
use super::ofdm::{apply_frequency_shift, OfdmModulator};
use super::pss_sss::{map_to_subcarriers, PssGenerator, SssGenerator};

/// Highest subcarrier index (either side of DC) carrying payload
const DATA_SUBCARRIERS: usize = 36;

/// Generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownlinkConfig {
    /// FFT size
    pub fft_size: usize,
    /// Transmitted cell
    pub cell: CellIdentity,
    /// CP length
    pub cp: CyclicPrefixKind,
    /// Duplex mode
    pub duplex_mode: DuplexMode,
    /// Fill non-sync symbols with random QPSK
    pub data_fill: bool,
    /// Carrier offset in Hz
    pub cfo_hz: f32,
    /// Per-resource-element SNR in dB; `None` disables noise
    pub snr_db: Option<f32>,
    /// RNG seed for payload and noise
    pub seed: u64,
    /// Insert one sample before subframes 0/5 every this many half-frames (0 disables)
    pub drift_period_half_frames: u32,
    /// Zero samples emitted before the first subframe
    pub initial_delay: usize,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            fft_size: 128,
            cell: CellIdentity { n_id_1: 0, n_id_2: 0 },
            cp: CyclicPrefixKind::Normal,
            duplex_mode: DuplexMode::Fdd,
            data_fill: false,
            cfo_hz: 0.0,
            snr_db: None,
            seed: 0,
            drift_period_half_frames: 0,
            initial_delay: 0,
        }
    }
}

/// Subframe-by-subframe downlink signal source
pub struct DownlinkGenerator {
    /// Settings
    config: DownlinkConfig,
    /// Subframe geometry
    numerology: Numerology,
    /// OFDM modulator
    modulator: OfdmModulator,
    /// PSS sequence
    pss: Vec<Complex32>,
    /// SSS sequences
    sss: SssGenerator,
    /// Payload and noise RNG
    rng: StdRng,
    /// Noise distribution per I/Q component
    noise: Option<Normal<f32>>,
    /// Frequency-domain symbol under construction
    grid: Vec<Complex32>,
    /// Subframe under construction
    subframe: Vec<Complex32>,
    /// Samples generated but not yet handed out
    queue: VecDeque<Complex32>,
    /// Next subframe index (0-9)
    subframe_index: u32,
    /// PSS half-frames started so far
    half_frames: u64,
    /// Stream samples generated so far
    samples_generated: u64,
}

impl DownlinkGenerator {
    /// Create a generator
    pub fn new(config: DownlinkConfig) -> Result<Self, LayerError> {
        let numerology = Numerology::new(config.fft_size, config.cp)?;
        let pss = PssGenerator::new(config.cell.n_id_2)?.generate();
        let sss = SssGenerator::new(config.cell)?;

        let noise = match config.snr_db {
            Some(snr_db) => {
                let sigma = (10.0_f32.powf(-snr_db / 10.0) / 2.0).sqrt();
                Some(Normal::new(0.0, sigma).map_err(|e| {
                    LayerError::InvalidConfiguration(format!("noise for SNR {} dB: {}", snr_db, e))
                })?)
            }
            None => None,
        };

        debug!(
            "Downlink generator: {}, N={}, CP {}, {}, CFO {} Hz, SNR {:?} dB",
            config.cell, config.fft_size, config.cp, config.duplex_mode, config.cfo_hz, config.snr_db
        );

        Ok(Self {
            modulator: OfdmModulator::new(numerology),
            numerology,
            pss,
            sss,
            rng: StdRng::seed_from_u64(config.seed),
            noise,
            grid: vec![Complex32::new(0.0, 0.0); config.fft_size],
            subframe: Vec::with_capacity(numerology.subframe_len() + 1),
            queue: std::iter::repeat(Complex32::new(0.0, 0.0))
                .take(config.initial_delay)
                .collect(),
            subframe_index: 0,
            half_frames: 0,
            samples_generated: config.initial_delay as u64,
            config,
        })
    }

    /// Settings
    pub fn config(&self) -> &DownlinkConfig {
        &self.config
    }

    /// Subframe geometry
    pub fn numerology(&self) -> &Numerology {
        &self.numerology
    }

    /// Index of the next subframe to be generated
    pub fn next_subframe_index(&self) -> u32 {
        self.subframe_index
    }

    /// Stream samples generated so far
    pub fn samples_generated(&self) -> u64 {
        self.samples_generated
    }

    /// Generate `count` subframes, preceded by any samples still queued
    pub fn generate_subframes(&mut self, count: usize) -> Result<Vec<Complex32>, LayerError> {
        let mut out: Vec<Complex32> = self.queue.drain(..).collect();
        for _ in 0..count {
            self.build_subframe()?;
            out.extend_from_slice(&self.subframe);
        }
        Ok(out)
    }

    fn build_subframe(&mut self) -> Result<(), LayerError> {
        let sf = self.subframe_index;
        let duplex = self.config.duplex_mode;
        let nsym = self.numerology.symbols_per_slot();
        let pss_symbol = self.numerology.pss_symbol(duplex);
        let sss_position = match duplex {
            DuplexMode::Fdd => (0, nsym - 2),
            DuplexMode::Tdd => (1, nsym - 1),
        };
        let sss_subframe = sf == 0 || sf == 5;

        self.subframe.clear();
        if sss_subframe {
            self.half_frames += 1;
            let period = self.config.drift_period_half_frames as u64;
            if period > 0 && self.half_frames % period == 0 {
                self.subframe.push(Complex32::new(0.0, 0.0));
            }
        }

        for slot in 0..2 {
            for symbol in 0..nsym {
                self.grid.fill(Complex32::new(0.0, 0.0));
                if slot == 0 && symbol == pss_symbol && duplex.is_pss_subframe(sf) {
                    map_to_subcarriers(&self.pss, &mut self.grid);
                } else if sss_subframe && (slot, symbol) == sss_position {
                    map_to_subcarriers(&self.sss.generate(sf), &mut self.grid);
                } else if self.config.data_fill {
                    self.fill_payload();
                }
                self.modulator.modulate(&self.grid, symbol, &mut self.subframe)?;
            }
        }

        let cfo = self.config.cfo_hz / common::SUBCARRIER_SPACING_HZ;
        apply_frequency_shift(&mut self.subframe, cfo, self.config.fft_size, self.samples_generated);

        if let Some(noise) = &self.noise {
            for sample in self.subframe.iter_mut() {
                *sample += Complex32::new(noise.sample(&mut self.rng), noise.sample(&mut self.rng));
            }
        }

        trace!("Generated subframe {} ({} samples)", sf, self.subframe.len());
        self.samples_generated += self.subframe.len() as u64;
        self.subframe_index = (sf + 1) % common::time::SUBFRAMES_PER_FRAME;
        Ok(())
    }

    /// Random unit-power QPSK on the payload subcarriers
    fn fill_payload(&mut self) {
        let n = self.config.fft_size;
        let width = DATA_SUBCARRIERS.min(n / 2 - 1);
        for k in 1..=width {
            for bin in [k, n - k] {
                let re = if self.rng.gen::<bool>() { FRAC_1_SQRT_2 } else { -FRAC_1_SQRT_2 };
                let im = if self.rng.gen::<bool>() { FRAC_1_SQRT_2 } else { -FRAC_1_SQRT_2 };
                self.grid[bin] = Complex32::new(re, im);
            }
        }
    }
}

/// Wrap a generator failure for the sample source interface
fn generator_error(error: LayerError) -> InterfaceError {
    InterfaceError::Generator(Box::new(error))
}

impl SampleSource for DownlinkGenerator {
    fn receive(&mut self, buffer: &mut [Complex32], _blocking: bool) -> Result<usize, InterfaceError> {
        let len = buffer.len();
        while self.queue.len() < len {
            self.build_subframe().map_err(generator_error)?;
            self.queue.extend(self.subframe.iter().copied());
        }
        for (dst, src) in buffer.iter_mut().zip(self.queue.drain(..len)) {
            *dst = src;
        }
        Ok(len)
    }
}
