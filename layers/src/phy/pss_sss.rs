//! Primary and Secondary Synchronization Signal Generation
//!
//! Implements LTE PSS and SSS generation according to 3GPP TS 36.211 section 6.11

use crate::LayerError;
use common::{CellIdentity, CyclicPrefixKind};
use num_complex::Complex32;
use std::f64::consts::PI;
use std::sync::OnceLock;
use tracing::{debug, trace};

use super::frame_structure::Numerology;
use super::ofdm::OfdmModulator;

/// PSS sequence length (63-point Zadoff-Chu with the DC element punctured)
pub const PSS_LENGTH: usize = 62;

/// SSS sequence length
pub const SSS_LENGTH: usize = 62;

/// Length of the SSS component m-sequences
pub const M_SEQUENCE_LENGTH: usize = 31;

/// Zadoff-Chu root index for each N_id_2
const PSS_ROOTS: [u32; 3] = [25, 29, 34];

/// Generate the PSS for `n_id_2`
pub fn generate_pss(n_id_2: u8) -> Result<[Complex32; PSS_LENGTH], LayerError> {
    let root = *PSS_ROOTS
        .get(n_id_2 as usize)
        .ok_or(LayerError::InvalidNid2(n_id_2))?;

    let mut sequence = [Complex32::new(0.0, 0.0); PSS_LENGTH];
    for (n, value) in sequence.iter_mut().enumerate() {
        // Skip the punctured element at n = 31 of the length-63 sequence
        let k = if n < 31 { n as u32 } else { n as u32 + 1 };
        // Reduce the exponent modulo 126 so the phase stays exact
        let exponent = (root * k * (k + 1)) % 126;
        let phase = -PI * exponent as f64 / 63.0;
        *value = Complex32::new(phase.cos() as f32, phase.sin() as f32);
    }

    Ok(sequence)
}

/// Generate the two SSS variants for a physical cell ID.
///
/// Returns `(subframe_0, subframe_5)`.
pub fn generate_sss(cell_id: u16) -> Result<([f32; SSS_LENGTH], [f32; SSS_LENGTH]), LayerError> {
    let cell = CellIdentity::from_physical_cell_id(cell_id)?;
    let (m0, m1) = sss_m_indices(cell.n_id_1)?;
    let seq = sss_sequences();

    let mut sf0 = [0.0f32; SSS_LENGTH];
    let mut sf5 = [0.0f32; SSS_LENGTH];
    for n in 0..M_SEQUENCE_LENGTH {
        let s0 = seq.s[(n + m0) % M_SEQUENCE_LENGTH];
        let s1 = seq.s[(n + m1) % M_SEQUENCE_LENGTH];
        let c0 = seq.c0(cell.n_id_2, n);
        let c1 = seq.c1(cell.n_id_2, n);
        let z1_m0 = seq.z1(m0, n);
        let z1_m1 = seq.z1(m1, n);

        sf0[2 * n] = s0 * c0;
        sf0[2 * n + 1] = s1 * c1 * z1_m0;
        sf5[2 * n] = s1 * c0;
        sf5[2 * n + 1] = s0 * c1 * z1_m1;
    }

    Ok((sf0, sf5))
}

/// Cyclic shifts `(m0, m1)` of the SSS m-sequences for `n_id_1`
pub fn sss_m_indices(n_id_1: u16) -> Result<(usize, usize), LayerError> {
    if n_id_1 > CellIdentity::MAX_NID_1 {
        return Err(LayerError::InvalidNid1(n_id_1));
    }

    let n = n_id_1 as usize;
    let q_prime = n / 30;
    let q = (n + q_prime * (q_prime + 1) / 2) / 30;
    let m_prime = n + q * (q + 1) / 2;
    let m0 = m_prime % 31;
    let m1 = (m0 + m_prime / 31 + 1) % 31;

    Ok((m0, m1))
}

/// Resolve N_id_1 from the detected m-sequence shifts (`m0 < m1`)
pub fn n_id_1_from_m(m0: usize, m1: usize) -> Option<u16> {
    if m0 >= 30 || m1 == 0 || m1 > 30 {
        return None;
    }
    sss_sequences().n_id_1_table[m0][m1 - 1]
}

/// Base sequences of the SSS, built once per process
#[derive(Debug)]
pub struct SssSequences {
    /// s~ sequence (x^5 + x^2 + 1), mapped to +/-1
    pub s: [f32; M_SEQUENCE_LENGTH],
    /// c~ sequence (x^5 + x^3 + 1), mapped to +/-1
    pub c: [f32; M_SEQUENCE_LENGTH],
    /// z~ sequence (x^5 + x^4 + x^2 + x + 1), mapped to +/-1
    pub z: [f32; M_SEQUENCE_LENGTH],
    /// N_id_1 indexed by `[m0][m1 - 1]`
    n_id_1_table: [[Option<u16>; 30]; 30],
}

impl SssSequences {
    fn build() -> Self {
        let s = m_sequence(|x, i| x[i + 2] ^ x[i]);
        let c = m_sequence(|x, i| x[i + 3] ^ x[i]);
        let z = m_sequence(|x, i| x[i + 4] ^ x[i + 2] ^ x[i + 1] ^ x[i]);

        let mut n_id_1_table = [[None; 30]; 30];
        for n_id_1 in 0..=CellIdentity::MAX_NID_1 {
            // n_id_1 is always in range here
            if let Ok((m0, m1)) = sss_m_indices(n_id_1) {
                if m0 < 30 && (1..=30).contains(&m1) {
                    n_id_1_table[m0][m1 - 1] = Some(n_id_1);
                }
            }
        }
        trace!("SSS sequence tables built");

        Self { s, c, z, n_id_1_table }
    }

    /// Scrambling sequence c0(n), shifted by N_id_2
    pub fn c0(&self, n_id_2: u8, n: usize) -> f32 {
        self.c[(n + n_id_2 as usize) % M_SEQUENCE_LENGTH]
    }

    /// Scrambling sequence c1(n), shifted by N_id_2 + 3
    pub fn c1(&self, n_id_2: u8, n: usize) -> f32 {
        self.c[(n + n_id_2 as usize + 3) % M_SEQUENCE_LENGTH]
    }

    /// Scrambling sequence z1^(m)(n)
    pub fn z1(&self, m: usize, n: usize) -> f32 {
        self.z[(n + m % 8) % M_SEQUENCE_LENGTH]
    }
}

/// Shared SSS base sequences and N_id_1 lookup table
pub fn sss_sequences() -> &'static SssSequences {
    static TABLES: OnceLock<SssSequences> = OnceLock::new();
    TABLES.get_or_init(SssSequences::build)
}

/// Length-31 m-sequence with initial state 00001, mapped `x -> 1 - 2x`
fn m_sequence(feedback: impl Fn(&[u8], usize) -> u8) -> [f32; M_SEQUENCE_LENGTH] {
    let mut x = [0u8; M_SEQUENCE_LENGTH + 5];
    x[4] = 1;
    for i in 0..M_SEQUENCE_LENGTH {
        x[i + 5] = feedback(&x[..], i);
    }

    let mut out = [0.0f32; M_SEQUENCE_LENGTH];
    for (o, &bit) in out.iter_mut().zip(x.iter()) {
        *o = 1.0 - 2.0 * bit as f32;
    }
    out
}

/// FFT bin of sequence element `n` when a 62-element sequence is mapped
/// around DC (subcarriers -31..-1 and +1..+31)
pub fn subcarrier_bin(n: usize, fft_size: usize) -> usize {
    if n < 31 {
        fft_size - 31 + n
    } else {
        n - 30
    }
}

/// Map a 62-element sequence onto the centre subcarriers of `grid`
pub fn map_to_subcarriers(sequence: &[Complex32], grid: &mut [Complex32]) {
    let fft_size = grid.len();
    for (n, &value) in sequence.iter().enumerate().take(PSS_LENGTH) {
        grid[subcarrier_bin(n, fft_size)] = value;
    }
}

/// Read the 62 centre subcarriers of `grid` into `out`
pub fn extract_from_subcarriers(grid: &[Complex32], out: &mut [Complex32]) {
    let fft_size = grid.len();
    for (n, value) in out.iter_mut().enumerate().take(PSS_LENGTH) {
        *value = grid[subcarrier_bin(n, fft_size)];
    }
}

/// Useful part of the PSS OFDM symbol for `n_id_2` at `fft_size` samples
pub fn pss_time_domain(n_id_2: u8, fft_size: usize) -> Result<Vec<Complex32>, LayerError> {
    let mut modulator = OfdmModulator::new(Numerology::new(fft_size, CyclicPrefixKind::Normal)?);
    let mut grid = vec![Complex32::new(0.0, 0.0); fft_size];
    map_to_subcarriers(&generate_pss(n_id_2)?, &mut grid);

    let mut time = vec![Complex32::new(0.0, 0.0); fft_size];
    modulator.transform(&grid, &mut time)?;
    Ok(time)
}

/// PSS generator
#[derive(Debug, Clone)]
pub struct PssGenerator {
    /// PSS sequence ID (0-2)
    n_id_2: u8,
    /// Pre-generated PSS sequence
    sequence: [Complex32; PSS_LENGTH],
    /// PSS amplitude (linear scale)
    amplitude: f32,
}

impl PssGenerator {
    /// Create a new PSS generator with unit amplitude
    pub fn new(n_id_2: u8) -> Result<Self, LayerError> {
        Self::new_with_amplitude_db(n_id_2, 0.0)
    }

    /// Create a new PSS generator with specific amplitude in dB
    pub fn new_with_amplitude_db(n_id_2: u8, amplitude_db: f32) -> Result<Self, LayerError> {
        let sequence = generate_pss(n_id_2)?;
        let amplitude = common::db_to_amplitude(amplitude_db);
        debug!("PSS generator: N_id_2={}, amplitude={:.3}", n_id_2, amplitude);

        Ok(Self {
            n_id_2,
            sequence,
            amplitude,
        })
    }

    /// Generate scaled PSS symbols
    pub fn generate(&self) -> Vec<Complex32> {
        self.sequence.iter().map(|&s| s * self.amplitude).collect()
    }

    /// Get PSS sequence ID
    pub fn n_id_2(&self) -> u8 {
        self.n_id_2
    }
}

/// SSS generator
#[derive(Debug, Clone)]
pub struct SssGenerator {
    /// Cell the sequences belong to
    cell: CellIdentity,
    /// Sequence transmitted in subframe 0
    subframe0: [f32; SSS_LENGTH],
    /// Sequence transmitted in subframe 5
    subframe5: [f32; SSS_LENGTH],
    /// SSS amplitude (linear scale)
    amplitude: f32,
}

impl SssGenerator {
    /// Create a new SSS generator with unit amplitude
    pub fn new(cell: CellIdentity) -> Result<Self, LayerError> {
        Self::new_with_amplitude_db(cell, 0.0)
    }

    /// Create a new SSS generator with specific amplitude in dB
    pub fn new_with_amplitude_db(cell: CellIdentity, amplitude_db: f32) -> Result<Self, LayerError> {
        let pci = cell
            .physical_cell_id()
            .ok_or(LayerError::InvalidNid1(cell.n_id_1))?;
        let (subframe0, subframe5) = generate_sss(pci)?;

        Ok(Self {
            cell,
            subframe0,
            subframe5,
            amplitude: common::db_to_amplitude(amplitude_db),
        })
    }

    /// Generate scaled SSS symbols for the half-frame containing `subframe`
    pub fn generate(&self, subframe: u32) -> Vec<Complex32> {
        let sequence = if subframe % 10 < 5 { &self.subframe0 } else { &self.subframe5 };
        sequence
            .iter()
            .map(|&d| Complex32::new(d * self.amplitude, 0.0))
            .collect()
    }

    /// Get the cell identity
    pub fn cell(&self) -> CellIdentity {
        self.cell
    }
}
