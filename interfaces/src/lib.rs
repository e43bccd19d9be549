//! Sample Source and Gain Control Interfaces
//! 
//! This crate defines the collaborators the synchronization engine pulls samples
//! from and drives gain through, plus file and in-memory implementations of them.

pub mod sample_source;
pub mod file_source;
pub mod agc;

pub use agc::{AgcControl, GainStage, SharedGain};
pub use file_source::{FileSampleSource, SampleFormat};
pub use sample_source::{BufferedSampleSource, SampleSource};

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    
    #[error("Invalid sample format: {0}")]
    InvalidFormat(String),
    
    #[error("End of sample stream")]
    EndOfStream,
    
    #[error("Interface not initialized")]
    NotInitialized,
    
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    
    #[error("Gain control unavailable: {0}")]
    GainControl(String),
    
    #[error("Sample generator failed: {0}")]
    Generator(#[source] Box<dyn std::error::Error + Send + Sync>),
}
