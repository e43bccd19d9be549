//! Physical Layer (PHY) Submodules
//!
//! LTE downlink cell search and time/frequency synchronization according to
//! 3GPP TS 36.211: PSS/SSS generation and detection, CP length and duplex mode
//! detection, carrier frequency offset estimation, and the streaming UE sync
//! driver that acquires and tracks a cell from a sample source.

pub mod frame_structure;
pub mod ofdm;
pub mod pss_sss;
pub mod resampler;
pub mod correlator;
pub mod cfo;
pub mod cp_detect;
pub mod sss_detect;
pub mod sync;
pub mod ue_sync;
pub mod agc;
pub mod downlink;

// Re-export commonly used types
pub use agc::{AgcConfig, RxAgc};
pub use cfo::{CfoConfig, CfoEstimator, CfoStage, CfoState};
pub use correlator::{CorrelationMethod, CorrelationResult, Correlator, CorrelatorConfig};
pub use cp_detect::CpDetector;
pub use downlink::{DownlinkConfig, DownlinkGenerator};
pub use frame_structure::Numerology;
pub use ofdm::{OfdmDemodulator, OfdmModulator};
pub use pss_sss::{PssGenerator, SssGenerator};
pub use sss_detect::{SssDetection, SssDetector};
pub use sync::{SyncConfig, SyncFindOutcome, SyncFound, Synchronizer};
pub use ue_sync::{
    CfoStageSelection, DriverState, SampleOffsetTracker, UeSync, UeSyncConfig, UeSyncEvent, UeSyncStats,
};
