//! Receive Gain Control
//! 
//! [`AgcControl`] is the gain knob the sync driver turns. [`SharedGain`] and
//! [`GainStage`] provide a software gain stage for sources without hardware gain.

use crate::{InterfaceError, SampleSource};
use num_complex::Complex32;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Receive gain collaborator
pub trait AgcControl: Send {
    /// Apply a new receive gain in dB
    fn set_gain(&mut self, gain_db: f32) -> Result<(), InterfaceError>;

    /// Current receive gain in dB
    fn gain(&self) -> Result<f32, InterfaceError>;

    /// Minimum and maximum settable gain in dB
    fn gain_range(&self) -> (f32, f32);
}

/// Gain value shared between a controller and a [`GainStage`]
#[derive(Debug, Clone)]
pub struct SharedGain {
    /// Gain in dB
    gain_db: Arc<Mutex<f32>>,
    /// Lowest accepted gain in dB
    min_db: f32,
    /// Highest accepted gain in dB
    max_db: f32,
}

impl SharedGain {
    /// Create a shared gain starting at `initial_db`
    pub fn new(initial_db: f32, min_db: f32, max_db: f32) -> Result<Self, InterfaceError> {
        if min_db > max_db {
            return Err(InterfaceError::InvalidConfig(format!(
                "gain range [{}, {}] dB is empty",
                min_db, max_db
            )));
        }
        Ok(Self {
            gain_db: Arc::new(Mutex::new(initial_db.clamp(min_db, max_db))),
            min_db,
            max_db,
        })
    }

    fn linear(&self) -> Result<f32, InterfaceError> {
        Ok(10.0_f32.powf(self.gain()? / 20.0))
    }
}

impl AgcControl for SharedGain {
    fn set_gain(&mut self, gain_db: f32) -> Result<(), InterfaceError> {
        let clamped = gain_db.clamp(self.min_db, self.max_db);
        let mut gain = self
            .gain_db
            .lock()
            .map_err(|_| InterfaceError::GainControl("gain lock poisoned".to_string()))?;
        *gain = clamped;
        debug!("Software RX gain set to {:.1} dB", clamped);
        Ok(())
    }

    fn gain(&self) -> Result<f32, InterfaceError> {
        self.gain_db
            .lock()
            .map(|g| *g)
            .map_err(|_| InterfaceError::GainControl("gain lock poisoned".to_string()))
    }

    fn gain_range(&self) -> (f32, f32) {
        (self.min_db, self.max_db)
    }
}

/// Source wrapper scaling every received sample by a [`SharedGain`]
pub struct GainStage<S> {
    /// Wrapped source
    inner: S,
    /// Gain applied to received samples
    gain: SharedGain,
}

impl<S: SampleSource> GainStage<S> {
    /// Wrap `inner`, scaling its output by `gain`
    pub fn new(inner: S, gain: SharedGain) -> Self {
        Self { inner, gain }
    }
}

impl<S: SampleSource> SampleSource for GainStage<S> {
    fn receive(&mut self, buffer: &mut [Complex32], blocking: bool) -> Result<usize, InterfaceError> {
        let n = self.inner.receive(buffer, blocking)?;
        let scale = self.gain.linear()?;
        for sample in &mut buffer[..n] {
            *sample *= scale;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferedSampleSource;
    
    #[test]
    fn test_shared_gain_clamping() {
        let mut gain = SharedGain::new(0.0, -10.0, 30.0).unwrap();
        gain.set_gain(45.0).unwrap();
        assert_eq!(gain.gain().unwrap(), 30.0);
        gain.set_gain(-20.0).unwrap();
        assert_eq!(gain.gain().unwrap(), -10.0);
        assert!(SharedGain::new(0.0, 5.0, 1.0).is_err());
    }

    #[test]
    fn test_gain_stage_scaling() {
        let gain = SharedGain::new(20.0, 0.0, 40.0).unwrap();
        let source = BufferedSampleSource::from_samples(vec![Complex32::new(0.1, -0.1); 4]);
        let mut stage = GainStage::new(source, gain.clone());
        
        let mut buffer = vec![Complex32::new(0.0, 0.0); 4];
        stage.receive(&mut buffer, true).unwrap();
        assert!((buffer[0].re - 1.0).abs() < 1e-5);
        assert!((buffer[0].im + 1.0).abs() < 1e-5);
    }
}
