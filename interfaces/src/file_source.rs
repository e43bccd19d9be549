//! File-Backed Sample Source
//! 
//! Replays interleaved little-endian IQ captures (`cf32` or `ci16`) through the
//! [`SampleSource`] interface.

use crate::{InterfaceError, SampleSource};
use crate::sample_source::SourceStats;
use bytes::{Buf, BufMut, BytesMut};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Full-scale value used when converting 16-bit samples
const CI16_SCALE: f32 = 32768.0;

/// On-disk IQ sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 32-bit float I and Q
    #[default]
    Cf32,
    /// 16-bit signed integer I and Q
    Ci16,
}

impl SampleFormat {
    /// Bytes used by one complex sample
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::Cf32 => 8,
            SampleFormat::Ci16 => 4,
        }
    }
}

impl std::str::FromStr for SampleFormat {
    type Err = InterfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cf32" | "fc32" => Ok(SampleFormat::Cf32),
            "ci16" | "sc16" => Ok(SampleFormat::Ci16),
            other => Err(InterfaceError::InvalidFormat(other.to_string())),
        }
    }
}

/// Decode raw bytes into complex samples, returning the number decoded
pub fn decode_samples(
    mut bytes: &[u8],
    format: SampleFormat,
    out: &mut [Complex32],
) -> Result<usize, InterfaceError> {
    let bps = format.bytes_per_sample();
    if bytes.len() % bps != 0 {
        return Err(InterfaceError::InvalidFormat(format!(
            "{} bytes is not a whole number of {:?} samples",
            bytes.len(),
            format
        )));
    }
    
    let count = (bytes.len() / bps).min(out.len());
    for sample in out.iter_mut().take(count) {
        *sample = match format {
            SampleFormat::Cf32 => Complex32::new(bytes.get_f32_le(), bytes.get_f32_le()),
            SampleFormat::Ci16 => Complex32::new(
                bytes.get_i16_le() as f32 / CI16_SCALE,
                bytes.get_i16_le() as f32 / CI16_SCALE,
            ),
        };
    }
    
    Ok(count)
}

/// Encode complex samples into raw bytes
pub fn encode_samples(samples: &[Complex32], format: SampleFormat) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(samples.len() * format.bytes_per_sample());
    for sample in samples {
        match format {
            SampleFormat::Cf32 => {
                bytes.put_f32_le(sample.re);
                bytes.put_f32_le(sample.im);
            }
            SampleFormat::Ci16 => {
                bytes.put_i16_le(to_i16(sample.re));
                bytes.put_i16_le(to_i16(sample.im));
            }
        }
    }
    bytes
}

fn to_i16(value: f32) -> i16 {
    (value * CI16_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Sample source reading an IQ capture file
#[derive(Debug)]
pub struct FileSampleSource {
    /// Path of the capture
    path: PathBuf,
    /// Buffered file reader
    reader: BufReader<File>,
    /// Sample format
    format: SampleFormat,
    /// Restart from the beginning at end of file
    looping: bool,
    /// Scratch buffer for raw bytes
    raw: Vec<u8>,
    /// Statistics
    stats: SourceStats,
}

impl FileSampleSource {
    /// Open a capture file
    pub fn open(path: impl AsRef<Path>, format: SampleFormat, looping: bool) -> Result<Self, InterfaceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if looping && len < format.bytes_per_sample() as u64 {
            return Err(InterfaceError::InvalidConfig(format!(
                "cannot loop over {} ({} bytes)",
                path.display(),
                len
            )));
        }
        
        info!("Opened IQ file {} ({} bytes, {:?}, looping={})",
              path.display(), len, format, looping);
        
        Ok(Self {
            path,
            reader: BufReader::new(file),
            format,
            looping,
            raw: Vec::new(),
            stats: SourceStats::default(),
        })
    }

    /// Get statistics
    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Read up to `want` bytes into the scratch buffer, rewinding when looping
    fn fill_raw(&mut self, want: usize) -> Result<usize, InterfaceError> {
        self.raw.resize(want, 0);
        let mut filled = 0;
        
        while filled < want {
            let n = self.reader.read(&mut self.raw[filled..])?;
            if n == 0 {
                if !self.looping {
                    break;
                }
                debug!("Rewinding {}", self.path.display());
                self.reader.seek(SeekFrom::Start(0))?;
                continue;
            }
            filled += n;
        }
        
        Ok(filled)
    }
}

impl SampleSource for FileSampleSource {
    fn receive(&mut self, buffer: &mut [Complex32], _blocking: bool) -> Result<usize, InterfaceError> {
        let bps = self.format.bytes_per_sample();
        let filled = self.fill_raw(buffer.len() * bps)?;
        let whole = filled - filled % bps;
        if whole == 0 && !buffer.is_empty() {
            return Err(InterfaceError::EndOfStream);
        }
        
        let count = decode_samples(&self.raw[..whole], self.format, buffer)?;
        self.stats.rx_samples += count as u64;
        if count < buffer.len() {
            self.stats.short_reads += 1;
            warn!("Short read from {}: {} of {} samples", self.path.display(), count, buffer.len());
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    
    fn temp_capture(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("albor_{}_{}.iq", name, std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_cf32_decoding() {
        let samples = vec![Complex32::new(0.5, -0.25), Complex32::new(-1.0, 1.0)];
        let bytes = encode_samples(&samples, SampleFormat::Cf32);
        assert_eq!(bytes.len(), 16);
        
        let mut out = vec![Complex32::new(0.0, 0.0); 2];
        assert_eq!(decode_samples(&bytes, SampleFormat::Cf32, &mut out).unwrap(), 2);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_ci16_scaling() {
        let bytes = [0x00, 0x40, 0x00, 0xC0]; // 16384, -16384
        let mut out = vec![Complex32::new(0.0, 0.0); 1];
        decode_samples(&bytes, SampleFormat::Ci16, &mut out).unwrap();
        assert!((out[0].re - 0.5).abs() < 1e-6);
        assert!((out[0].im + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_partial_sample_rejected() {
        let mut out = vec![Complex32::new(0.0, 0.0); 1];
        assert!(decode_samples(&[0u8; 5], SampleFormat::Cf32, &mut out).is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("cf32".parse::<SampleFormat>().unwrap(), SampleFormat::Cf32);
        assert_eq!("SC16".parse::<SampleFormat>().unwrap(), SampleFormat::Ci16);
        assert!("u8".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_file_source_looping() {
        let samples: Vec<Complex32> = (0..3).map(|i| Complex32::new(i as f32, 0.0)).collect();
        let path = temp_capture("loop", &encode_samples(&samples, SampleFormat::Cf32));
        
        let mut source = FileSampleSource::open(&path, SampleFormat::Cf32, true).unwrap();
        let mut buffer = vec![Complex32::new(0.0, 0.0); 7];
        assert_eq!(source.receive(&mut buffer, true).unwrap(), 7);
        assert_eq!(buffer[3].re, 0.0);
        assert_eq!(buffer[6].re, 0.0);
        assert_eq!(buffer[5].re, 2.0);
        
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_file_source_end_of_stream() {
        let samples = vec![Complex32::new(1.0, 1.0); 2];
        let path = temp_capture("eos", &encode_samples(&samples, SampleFormat::Cf32));
        
        let mut source = FileSampleSource::open(&path, SampleFormat::Cf32, false).unwrap();
        let mut buffer = vec![Complex32::new(0.0, 0.0); 4];
        assert_eq!(source.receive(&mut buffer, true).unwrap(), 2);
        assert!(matches!(source.receive(&mut buffer, true), Err(InterfaceError::EndOfStream)));
        
        std::fs::remove_file(path).ok();
    }
}
