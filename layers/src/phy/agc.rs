//! Receive Automatic Gain Control
//!
//! Steps the receive gain so the smoothed window power approaches a target
//! level. The gain itself is applied by the [`AgcControl`] collaborator.

use crate::LayerError;
use interfaces::AgcControl;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// AGC loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcConfig {
    /// Desired mean sample power in dB
    pub target_power_db: f32,
    /// EMA weight of new power measurements
    pub ema_alpha: f32,
    /// Gain is updated once every this many measurements
    pub period: u32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            target_power_db: -20.0,
            ema_alpha: 0.25,
            period: 1,
        }
    }
}

/// Receive AGC loop
#[derive(Debug, Clone)]
pub struct RxAgc {
    /// Settings
    config: AgcConfig,
    /// Gain last requested, in dB
    gain_db: f32,
    /// Smoothed window power in dB
    power_db: f32,
    /// `power_db` holds data
    primed: bool,
    /// Measurements since the last gain update
    count: u32,
}

impl RxAgc {
    /// Create a loop starting from the collaborator's current gain
    pub fn new(config: AgcConfig, control: &dyn AgcControl) -> Result<Self, LayerError> {
        if !(config.ema_alpha > 0.0 && config.ema_alpha <= 1.0) {
            return Err(LayerError::InvalidConfiguration(format!(
                "AGC EMA alpha {} outside (0, 1]",
                config.ema_alpha
            )));
        }
        if config.period == 0 {
            return Err(LayerError::InvalidConfiguration("AGC period must be at least 1".to_string()));
        }

        let gain_db = control.gain()?;
        debug!(
            "RX AGC: target {:.1} dB, start gain {:.1} dB, range {:?}",
            config.target_power_db,
            gain_db,
            control.gain_range()
        );

        Ok(Self {
            config,
            gain_db,
            power_db: 0.0,
            primed: false,
            count: 0,
        })
    }

    /// Gain last requested, in dB
    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Smoothed window power in dB
    pub fn power_db(&self) -> f32 {
        self.power_db
    }

    /// Measure `samples` and, once per period, push a new gain to `control`.
    ///
    /// Returns the new gain when one was applied.
    pub fn process(
        &mut self,
        samples: &[Complex32],
        control: &mut dyn AgcControl,
    ) -> Result<Option<f32>, LayerError> {
        if samples.is_empty() {
            return Ok(None);
        }

        let power = samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len() as f32;
        let power_db = common::power_to_db(power);
        common::ema_seeded(power_db, &mut self.power_db, &mut self.primed, self.config.ema_alpha);
        trace!("AGC window power {:.1} dB (avg {:.1} dB)", power_db, self.power_db);

        self.count += 1;
        if self.count < self.config.period {
            return Ok(None);
        }
        self.count = 0;

        let (min_db, max_db) = control.gain_range();
        let gain = (self.gain_db + self.config.target_power_db - self.power_db).clamp(min_db, max_db);
        if gain != self.gain_db {
            control.set_gain(gain)?;
            debug!("AGC gain {:.1} -> {:.1} dB", self.gain_db, gain);
            self.gain_db = gain;
        }
        Ok(Some(gain))
    }

    /// Forget the power average
    pub fn reset(&mut self) {
        self.primed = false;
        self.count = 0;
    }
}
