//! LTE Frame Structure
//! 
//! Sample-level layout of a 1 ms subframe for a given FFT size and cyclic
//! prefix, and the position of the synchronization signals inside it
//! (3GPP TS 36.211 sections 4 and 6.11).

use crate::LayerError;
use common::{CyclicPrefixKind, DuplexMode};

/// Smallest supported FFT size
pub const MIN_FFT_SIZE: usize = 64;
/// Largest supported FFT size
pub const MAX_FFT_SIZE: usize = 2048;

/// Check that `fft_size` is a supported LTE FFT size
pub fn validate_fft_size(fft_size: usize) -> Result<(), LayerError> {
    if !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) || fft_size % MIN_FFT_SIZE != 0 {
        return Err(LayerError::InvalidConfiguration(format!(
            "FFT size {} must be a multiple of {} in {}..={}",
            fft_size, MIN_FFT_SIZE, MIN_FFT_SIZE, MAX_FFT_SIZE
        )));
    }
    Ok(())
}

/// Normal CP length of the first symbol in a slot
pub fn cp_len_normal_first(fft_size: usize) -> usize {
    160 * fft_size / 2048
}

/// Normal CP length of symbols 1..6 in a slot
pub fn cp_len_normal(fft_size: usize) -> usize {
    144 * fft_size / 2048
}

/// Extended CP length (all symbols)
pub fn cp_len_extended(fft_size: usize) -> usize {
    512 * fft_size / 2048
}

/// Subframe geometry for one FFT size and cyclic prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Numerology {
    /// FFT size (samples per useful symbol)
    fft_size: usize,
    /// Cyclic prefix type
    cp: CyclicPrefixKind,
}

impl Numerology {
    /// Create a numerology, validating the FFT size
    pub fn new(fft_size: usize, cp: CyclicPrefixKind) -> Result<Self, LayerError> {
        validate_fft_size(fft_size)?;
        Ok(Self { fft_size, cp })
    }

    /// FFT size
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Cyclic prefix type
    pub fn cp(&self) -> CyclicPrefixKind {
        self.cp
    }

    /// OFDM symbols per slot
    pub fn symbols_per_slot(&self) -> usize {
        self.cp.symbols_per_slot()
    }

    /// CP length of `symbol` (index within its slot)
    pub fn cp_len(&self, symbol: usize) -> usize {
        match self.cp {
            CyclicPrefixKind::Normal if symbol == 0 => cp_len_normal_first(self.fft_size),
            CyclicPrefixKind::Normal => cp_len_normal(self.fft_size),
            CyclicPrefixKind::Extended => cp_len_extended(self.fft_size),
        }
    }

    /// Length of `symbol` including its CP
    pub fn symbol_len(&self, symbol: usize) -> usize {
        self.fft_size + self.cp_len(symbol)
    }

    /// Offset of the first CP sample of `symbol` from the slot start
    pub fn symbol_start(&self, symbol: usize) -> usize {
        (0..symbol).map(|l| self.symbol_len(l)).sum()
    }

    /// Samples per 0.5 ms slot
    pub fn slot_len(&self) -> usize {
        self.symbol_start(self.symbols_per_slot())
    }

    /// Samples per 1 ms subframe
    pub fn subframe_len(&self) -> usize {
        2 * self.slot_len()
    }

    /// Nominal sample rate in Hz
    pub fn sample_rate_hz(&self) -> f64 {
        common::sample_rate_hz(self.fft_size)
    }

    /// Slot-relative symbol index carrying the PSS (always in the first slot
    /// of a PSS subframe)
    pub fn pss_symbol(&self, duplex: DuplexMode) -> usize {
        match duplex {
            DuplexMode::Fdd => self.symbols_per_slot() - 1,
            DuplexMode::Tdd => 2,
        }
    }

    /// Offset, from the start of the PSS subframe, of the sample one past the
    /// last useful PSS sample. This is the nominal correlation peak position.
    pub fn pss_end_in_subframe(&self, duplex: DuplexMode) -> usize {
        let symbol = self.pss_symbol(duplex);
        self.symbol_start(symbol) + self.symbol_len(symbol)
    }

    /// First useful SSS sample given a PSS peak position, if it lies inside
    /// the window.
    ///
    /// FDD carries the SSS in the symbol right before the PSS; TDD carries it
    /// in the last symbol of the preceding subframe, three symbols earlier.
    pub fn sss_start_from_peak(&self, duplex: DuplexMode, peak: usize) -> Option<usize> {
        let n = self.fft_size;
        let back = match duplex {
            DuplexMode::Fdd => 2 * n + self.cp_len(self.pss_symbol(duplex)),
            DuplexMode::Tdd => 4 * n + self.cp_len(0) + self.cp_len(1) + self.cp_len(2),
        };
        peak.checked_sub(back)
    }

    /// Samples needed before the peak to hold the SSS under either CP length
    pub fn sss_required_space(&self, duplex: DuplexMode) -> usize {
        let symbol = self.fft_size + cp_len_extended(self.fft_size);
        match duplex {
            DuplexMode::Fdd => 2 * symbol,
            DuplexMode::Tdd => 4 * symbol,
        }
    }
}
