//! Common Types for the LTE Cell Search Receiver
//! 
//! Defines the cell identity and frame-type values shared by every layer

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised when building identity values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid N_id_1: {0} (valid range 0-167)")]
    InvalidNid1(u16),

    #[error("Invalid N_id_2: {0} (valid range 0-2)")]
    InvalidNid2(u8),

    #[error("Invalid physical cell ID: {0} (valid range 0-503)")]
    InvalidPci(u16),
}

/// Physical layer cell identity split into its PSS and SSS components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellIdentity {
    /// Cell identity group carried by the SSS (0-167)
    pub n_id_1: u16,
    /// Identity within the group carried by the PSS (0-2)
    pub n_id_2: u8,
}

impl CellIdentity {
    /// Maximum valid N_id_1 value
    pub const MAX_NID_1: u16 = 167;
    /// Maximum valid N_id_2 value
    pub const MAX_NID_2: u8 = 2;
    /// Maximum valid physical cell ID
    pub const MAX_PCI: u16 = 503;
    /// Sentinel marking an identity component that has not been resolved yet
    pub const UNRESOLVED: u16 = 1000;

    /// Create a fully resolved identity
    pub fn new(n_id_1: u16, n_id_2: u8) -> Result<Self, TypeError> {
        if n_id_1 > Self::MAX_NID_1 {
            return Err(TypeError::InvalidNid1(n_id_1));
        }
        if n_id_2 > Self::MAX_NID_2 {
            return Err(TypeError::InvalidNid2(n_id_2));
        }
        Ok(Self { n_id_1, n_id_2 })
    }

    /// Identity with nothing known about the cell
    pub const fn unknown() -> Self {
        Self {
            n_id_1: Self::UNRESOLVED,
            n_id_2: Self::UNRESOLVED as u8,
        }
    }

    /// Identity where only the PSS component is known
    pub fn with_n_id_2(n_id_2: u8) -> Result<Self, TypeError> {
        if n_id_2 > Self::MAX_NID_2 {
            return Err(TypeError::InvalidNid2(n_id_2));
        }
        Ok(Self {
            n_id_1: Self::UNRESOLVED,
            n_id_2,
        })
    }

    /// Split a physical cell ID into its components
    pub fn from_physical_cell_id(pci: u16) -> Result<Self, TypeError> {
        if pci > Self::MAX_PCI {
            return Err(TypeError::InvalidPci(pci));
        }
        Ok(Self {
            n_id_1: pci / 3,
            n_id_2: (pci % 3) as u8,
        })
    }

    /// True when both components hold valid values
    pub fn is_resolved(&self) -> bool {
        self.n_id_1 <= Self::MAX_NID_1 && self.n_id_2 <= Self::MAX_NID_2
    }

    /// True when the PSS component is known
    pub fn has_n_id_2(&self) -> bool {
        self.n_id_2 <= Self::MAX_NID_2
    }

    /// Physical cell ID (`3 * n_id_1 + n_id_2`), if resolved
    pub fn physical_cell_id(&self) -> Option<u16> {
        self.is_resolved()
            .then(|| self.n_id_1 * 3 + self.n_id_2 as u16)
    }
}

impl Default for CellIdentity {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for CellIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.physical_cell_id() {
            Some(pci) => write!(f, "PCI {} (N_id_1={}, N_id_2={})", pci, self.n_id_1, self.n_id_2),
            None if self.has_n_id_2() => write!(f, "unresolved (N_id_2={})", self.n_id_2),
            None => write!(f, "unresolved"),
        }
    }
}

/// Cyclic prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclicPrefixKind {
    /// Normal CP, 7 symbols per slot
    #[default]
    Normal,
    /// Extended CP, 6 symbols per slot
    Extended,
}

impl CyclicPrefixKind {
    /// Number of OFDM symbols in one 0.5 ms slot
    pub fn symbols_per_slot(&self) -> usize {
        match self {
            CyclicPrefixKind::Normal => 7,
            CyclicPrefixKind::Extended => 6,
        }
    }
}

impl fmt::Display for CyclicPrefixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclicPrefixKind::Normal => write!(f, "normal"),
            CyclicPrefixKind::Extended => write!(f, "extended"),
        }
    }
}

/// Duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplexMode {
    /// Frequency Division Duplex
    #[default]
    Fdd,
    /// Time Division Duplex
    Tdd,
}

impl DuplexMode {
    /// Subframes carrying the PSS within a radio frame
    pub fn pss_subframes(&self) -> [u32; 2] {
        match self {
            DuplexMode::Fdd => [0, 5],
            DuplexMode::Tdd => [1, 6],
        }
    }

    /// True if `sf_idx` carries a PSS under this duplex mode
    pub fn is_pss_subframe(&self, sf_idx: u32) -> bool {
        self.pss_subframes().contains(&(sf_idx % 10))
    }
}

impl fmt::Display for DuplexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplexMode::Fdd => write!(f, "FDD"),
            DuplexMode::Tdd => write!(f, "TDD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_cell_identity_validation() {
        assert!(CellIdentity::new(0, 0).is_ok());
        assert!(CellIdentity::new(167, 2).is_ok());
        assert_eq!(CellIdentity::new(168, 0), Err(TypeError::InvalidNid1(168)));
        assert_eq!(CellIdentity::new(0, 3), Err(TypeError::InvalidNid2(3)));
    }

    #[test]
    fn test_physical_cell_id() {
        let cell = CellIdentity::from_physical_cell_id(301).unwrap();
        assert_eq!(cell.n_id_1, 100);
        assert_eq!(cell.n_id_2, 1);
        assert_eq!(cell.physical_cell_id(), Some(301));
        assert!(CellIdentity::from_physical_cell_id(504).is_err());
    }

    #[test]
    fn test_unresolved_identity() {
        let cell = CellIdentity::with_n_id_2(2).unwrap();
        assert!(!cell.is_resolved());
        assert!(cell.has_n_id_2());
        assert_eq!(cell.n_id_1, CellIdentity::UNRESOLVED);
        assert_eq!(cell.physical_cell_id(), None);

        let unknown = CellIdentity::default();
        assert!(!unknown.has_n_id_2());
    }

    #[test]
    fn test_pss_subframes() {
        assert!(DuplexMode::Fdd.is_pss_subframe(0));
        assert!(DuplexMode::Fdd.is_pss_subframe(5));
        assert!(!DuplexMode::Fdd.is_pss_subframe(1));
        assert!(DuplexMode::Tdd.is_pss_subframe(6));
        assert!(!DuplexMode::Tdd.is_pss_subframe(5));
        assert_eq!(CyclicPrefixKind::Extended.symbols_per_slot(), 6);
    }
}
