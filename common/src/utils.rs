//! Common Utilities
//! 
//! Provides numeric helpers used across the receiver

use tracing::trace;

/// LTE subcarrier spacing in Hz
pub const SUBCARRIER_SPACING_HZ: f32 = 15_000.0;

/// Exponential moving average step
///
/// `alpha` weights the newest sample; `alpha = 1.0` returns `new` unchanged.
pub fn ema(new: f32, average: f32, alpha: f32) -> f32 {
    if alpha >= 1.0 {
        new
    } else {
        alpha * new + (1.0 - alpha) * average
    }
}

/// EMA step that seeds the average with the first value
pub fn ema_seeded(new: f32, average: &mut f32, primed: &mut bool, alpha: f32) {
    if *primed {
        *average = ema(new, *average, alpha);
    } else {
        *average = new;
        *primed = true;
    }
}

/// Convert a linear power ratio to dB
pub fn power_to_db(power: f32) -> f32 {
    10.0 * power.max(f32::MIN_POSITIVE).log10()
}

/// Convert a dB value to a linear amplitude factor
pub fn db_to_amplitude(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Sample rate for an LTE FFT size
pub fn sample_rate_hz(fft_size: usize) -> f64 {
    let rate = fft_size as f64 * SUBCARRIER_SPACING_HZ as f64;
    trace!("Sample rate for FFT size {}: {} Hz", fft_size, rate);
    rate
}

/// Time utilities for subframe/frame calculations
pub mod time {
    /// Subframe duration in seconds
    pub const SUBFRAME_DURATION_S: f32 = 1e-3;
    /// Interval between PSS transmissions in seconds
    pub const PSS_PERIOD_S: f32 = 5e-3;
    /// Subframes per radio frame
    pub const SUBFRAMES_PER_FRAME: u32 = 10;
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_ema() {
        assert_eq!(ema(4.0, 2.0, 1.0), 4.0);
        assert!((ema(4.0, 2.0, 0.5) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_ema_seeded() {
        let mut avg = 0.0;
        let mut primed = false;
        ema_seeded(10.0, &mut avg, &mut primed, 0.1);
        assert_eq!(avg, 10.0);
        assert!(primed);
        ema_seeded(0.0, &mut avg, &mut primed, 0.1);
        assert!((avg - 9.0).abs() < 1e-5);
    }

    #[test]
    fn test_db_conversions() {
        assert!((power_to_db(100.0) - 20.0).abs() < 1e-5);
        assert!((db_to_amplitude(20.0) - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_sample_rate() {
        assert_eq!(sample_rate_hz(2048), 30_720_000.0);
        assert_eq!(sample_rate_hz(128), 1_920_000.0);
    }
}
