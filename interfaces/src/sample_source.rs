//! Sample Source Abstraction
//! 
//! The receive side of the RF front end as seen by the synchronization engine.
//! Backends (hardware, file, loopback) implement [`SampleSource`] and are injected
//! into the driver; the engine never refers to a concrete backend.

use crate::InterfaceError;
use num_complex::Complex32;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Single-antenna complex baseband sample source
pub trait SampleSource: Send {
    /// Fill `buffer` with the next samples of the stream.
    ///
    /// Returns the number of samples written. A value smaller than
    /// `buffer.len()` means the stream could not deliver a full buffer.
    /// With `blocking == false` the source may return early with whatever
    /// is immediately available.
    fn receive(&mut self, buffer: &mut [Complex32], blocking: bool) -> Result<usize, InterfaceError>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn receive(&mut self, buffer: &mut [Complex32], blocking: bool) -> Result<usize, InterfaceError> {
        (**self).receive(buffer, blocking)
    }
}

/// Source statistics
#[derive(Debug, Default, Clone)]
pub struct SourceStats {
    /// Samples handed to the caller
    pub rx_samples: u64,
    /// Receive calls that delivered fewer samples than requested
    pub short_reads: u64,
}

/// In-memory FIFO source used for loopback and tests
#[derive(Debug, Default)]
pub struct BufferedSampleSource {
    /// Pending samples
    queue: VecDeque<Complex32>,
    /// Statistics
    stats: SourceStats,
}

impl BufferedSampleSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source pre-loaded with `samples`
    pub fn from_samples(samples: Vec<Complex32>) -> Self {
        debug!("Buffered source created with {} samples", samples.len());
        Self {
            queue: samples.into(),
            stats: SourceStats::default(),
        }
    }

    /// Append samples to the end of the stream
    pub fn push_samples(&mut self, samples: &[Complex32]) {
        self.queue.extend(samples.iter().copied());
    }

    /// Samples waiting to be read
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Get statistics
    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }
}

impl SampleSource for BufferedSampleSource {
    fn receive(&mut self, buffer: &mut [Complex32], _blocking: bool) -> Result<usize, InterfaceError> {
        let n = buffer.len().min(self.queue.len());
        for (dst, src) in buffer.iter_mut().zip(self.queue.drain(..n)) {
            *dst = src;
        }
        
        self.stats.rx_samples += n as u64;
        if n < buffer.len() {
            self.stats.short_reads += 1;
            trace!("Buffered source short read: {} of {}", n, buffer.len());
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_buffered_source_fifo_order() {
        let samples: Vec<Complex32> = (0..10).map(|i| Complex32::new(i as f32, 0.0)).collect();
        let mut source = BufferedSampleSource::from_samples(samples);
        
        let mut buffer = vec![Complex32::new(0.0, 0.0); 4];
        assert_eq!(source.receive(&mut buffer, true).unwrap(), 4);
        assert_eq!(buffer[0].re, 0.0);
        assert_eq!(buffer[3].re, 3.0);
        assert_eq!(source.pending(), 6);
    }

    #[test]
    fn test_buffered_source_short_read() {
        let mut source = BufferedSampleSource::new();
        source.push_samples(&[Complex32::new(1.0, -1.0); 3]);
        
        let mut buffer = vec![Complex32::new(0.0, 0.0); 8];
        assert_eq!(source.receive(&mut buffer, false).unwrap(), 3);
        assert_eq!(source.stats().short_reads, 1);
        assert_eq!(source.receive(&mut buffer, false).unwrap(), 0);
    }

    #[test]
    fn test_boxed_source() {
        let mut source: Box<dyn SampleSource> =
            Box::new(BufferedSampleSource::from_samples(vec![Complex32::new(2.0, 0.0); 5]));
        let mut buffer = vec![Complex32::new(0.0, 0.0); 5];
        assert_eq!(source.receive(&mut buffer, true).unwrap(), 5);
        assert_eq!(buffer[4].re, 2.0);
    }
}
