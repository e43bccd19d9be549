//! Receiver Physical Layer Library
//! 
//! This crate implements LTE downlink cell search and time/frequency
//! synchronization: PSS/SSS detection, CFO and sample-offset tracking, and the
//! streaming UE sync driver built on top of them.

pub mod phy;

use common::TypeError;
use interfaces::InterfaceError;
use thiserror::Error;

/// Errors raised by the physical layer
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    
    #[error("Invalid N_id_2: {0}")]
    InvalidNid2(u8),
    
    #[error("Invalid N_id_1: {0}")]
    InvalidNid1(u16),
    
    #[error("Invalid sample window: {0}")]
    InvalidWindow(String),
    
    #[error("Short read from sample source: requested {requested}, received {received}")]
    ShortRead { requested: usize, received: usize },
    
    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),
    
    #[error("Invalid cell identity: {0}")]
    Identity(#[from] TypeError),
}
