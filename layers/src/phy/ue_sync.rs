//! UE Sync Driver
//!
//! Streaming front end of the cell search. While searching, it pulls
//! multi-subframe windows from the sample source and runs one find
//! [`Synchronizer`] per N_id_2 hypothesis. Once the same cell has been seen in
//! enough consecutive windows it aligns the stream to a subframe boundary and
//! switches to tracking, where every call delivers exactly one subframe and the
//! PSS position in PSS-bearing subframes keeps timing and frequency locked.
//!
//! Sample-clock drift is compensated without resampling: the measured PSS
//! offsets are averaged and folded into the next read as extra or reused
//! samples.

use crate::LayerError;
use common::{CellIdentity, CyclicPrefixKind, DuplexMode};
use interfaces::{AgcControl, SampleSource};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::agc::{AgcConfig, RxAgc};
use super::frame_structure::{validate_fft_size, Numerology};
use super::ofdm::apply_frequency_shift;
use super::sync::{SyncConfig, SyncFindOutcome, Synchronizer};

/// CFO stages enabled on one synchronizer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CfoStageSelection {
    /// Integer-bin stage
    pub integer: bool,
    /// CP-based stage
    pub cyclic_prefix: bool,
    /// PSS-phase stage
    pub pss: bool,
}

impl Default for CfoStageSelection {
    fn default() -> Self {
        Self {
            integer: false,
            cyclic_prefix: true,
            pss: true,
        }
    }
}

/// Driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UeSyncConfig {
    /// FFT size
    pub fft_size: usize,
    /// Subframes per search window
    pub nof_recv_sf: usize,
    /// Known N_id_2; `None` searches all three
    pub n_id_2: Option<u8>,
    /// Consecutive windows that must agree on the cell before tracking
    pub nof_avg_find_frames: u32,
    /// PSR threshold while searching
    pub find_threshold: f32,
    /// PSR threshold while tracking
    pub track_threshold: f32,
    /// Samples searched around the expected PSS while tracking
    pub track_window: usize,
    /// Consecutive tracking misses before the cell is declared lost
    pub max_lost: u32,
    /// PSS measurements per sample-offset correction (0 disables)
    pub sample_offset_correct_period: u32,
    /// EMA weight of the per-period mean offset
    pub sfo_ema_alpha: f32,
    /// Remove the tracked CFO from delivered subframes
    pub cfo_correct_track: bool,
    /// Check the SSS while tracking and resync the subframe counter
    pub decode_sss_on_track: bool,
    /// Decimation of the search correlation
    pub find_decimation: usize,
    /// CFO stages while searching
    pub find_cfo: CfoStageSelection,
    /// CFO stages while tracking
    pub track_cfo: CfoStageSelection,
    /// EMA weight of fractional CFO estimates
    pub cfo_ema_alpha: f32,
    /// Detect the CP length while searching
    pub detect_cp: bool,
    /// CP length when not detecting
    pub cp: CyclicPrefixKind,
    /// Detect the duplex mode while searching
    pub detect_duplex_mode: bool,
    /// Duplex mode when not detecting
    pub duplex_mode: DuplexMode,
    /// Receive AGC loop, used when a gain control is attached
    pub agc: Option<AgcConfig>,
}

impl Default for UeSyncConfig {
    fn default() -> Self {
        Self {
            fft_size: 128,
            nof_recv_sf: 5,
            n_id_2: None,
            nof_avg_find_frames: 2,
            find_threshold: 2.0,
            track_threshold: 1.2,
            track_window: 64,
            max_lost: 4,
            sample_offset_correct_period: 5,
            sfo_ema_alpha: 0.1,
            cfo_correct_track: true,
            decode_sss_on_track: true,
            find_decimation: 1,
            find_cfo: CfoStageSelection::default(),
            track_cfo: CfoStageSelection {
                integer: false,
                cyclic_prefix: false,
                pss: true,
            },
            cfo_ema_alpha: 0.1,
            detect_cp: true,
            cp: CyclicPrefixKind::Normal,
            detect_duplex_mode: true,
            duplex_mode: DuplexMode::Fdd,
            agc: None,
        }
    }
}

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// No cell acquired
    Searching,
    /// Cell acquired; one aligned subframe per call
    Tracking,
}

/// What one [`UeSync::next_subframe`] call produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeSyncEvent {
    /// A search window was processed without acquiring a cell
    Searching,
    /// A cell was acquired; tracking starts with the next call
    CellFound(CellIdentity),
    /// An aligned subframe is available in [`UeSync::aligned_window`]
    Subframe(u32),
    /// Tracking lost the cell; searching starts with the next call
    CellLost,
}

/// Running PSS timing offset and its correction
#[derive(Debug, Clone, Default)]
pub struct SampleOffsetTracker {
    /// Mean offset over the last completed period, in samples
    pub mean_offset: f32,
    /// Smoothed mean offset, in samples per PSS interval
    pub sfo_ema: f32,
    /// Measurements per correction
    pub correction_period_subframes: u32,
    /// Measurements since the last correction
    pub subframes_since_correction: u32,
    /// Offset sum of the current period, pre-divided by the period
    accumulated: f32,
    /// `sfo_ema` holds data
    sfo_primed: bool,
    /// EMA weight of the mean offset
    ema_alpha: f32,
}

impl SampleOffsetTracker {
    /// Create a tracker correcting every `period` measurements
    pub fn new(period: u32, ema_alpha: f32) -> Self {
        Self {
            correction_period_subframes: period,
            ema_alpha,
            ..Self::default()
        }
    }

    /// Record one measured offset. Returns the correction to apply to the next
    /// read when a period completes.
    pub fn update(&mut self, offset: i64) -> Option<i64> {
        let period = self.correction_period_subframes;
        if period == 0 {
            return None;
        }

        self.accumulated += offset as f32 / period as f32;
        self.subframes_since_correction += 1;
        if self.subframes_since_correction < period {
            return None;
        }

        self.mean_offset = self.accumulated;
        common::ema_seeded(self.mean_offset, &mut self.sfo_ema, &mut self.sfo_primed, self.ema_alpha);
        self.accumulated = 0.0;
        self.subframes_since_correction = 0;
        Some(self.mean_offset.round() as i64)
    }

    /// Sample-clock offset in samples per second
    pub fn sfo_hz(&self) -> f32 {
        self.sfo_ema / common::time::PSS_PERIOD_S
    }

    /// Forget all measurements
    pub fn reset(&mut self) {
        *self = Self::new(self.correction_period_subframes, self.ema_alpha);
    }
}

/// Driver statistics
#[derive(Debug, Default, Clone)]
pub struct UeSyncStats {
    /// Search windows processed
    pub windows_searched: u64,
    /// Search windows with a confirmed cell
    pub find_hits: u64,
    /// Search windows dropped by half to move the PSS away from the edge
    pub realignments: u64,
    /// PSS found while tracking
    pub track_ok: u64,
    /// PSS missed while tracking
    pub track_lost: u64,
    /// Cells lost after acquisition
    pub cells_lost: u64,
    /// Subframes delivered while tracking
    pub subframes_delivered: u64,
    /// Sample-offset corrections applied
    pub offset_corrections: u64,
    /// Latest PSR
    pub last_psr: f32,
}

/// Streaming cell search and tracking driver
pub struct UeSync {
    /// Settings
    config: UeSyncConfig,
    /// Sample source
    source: Box<dyn SampleSource>,
    /// AGC loop and its gain control
    agc: Option<(RxAgc, Box<dyn AgcControl>)>,
    /// Find synchronizer per candidate N_id_2
    find: Vec<(u8, Synchronizer)>,
    /// Tracking synchronizer
    track: Synchronizer,
    /// Samples per subframe
    sf_len: usize,
    /// Search window
    find_buffer: Vec<Complex32>,
    /// Raw subframe while tracking
    raw: Vec<Complex32>,
    /// Aligned, corrected subframe
    output: Vec<Complex32>,
    /// Current state
    state: DriverState,
    /// Acquired cell
    cell: CellIdentity,
    /// Acquired CP length
    cp: CyclicPrefixKind,
    /// Acquired duplex mode
    duplex_mode: DuplexMode,
    /// Cell seen in the last search windows and how many times in a row
    candidate: Option<(CellIdentity, u32)>,
    /// Index of the next subframe to read
    next_subframe: u32,
    /// Index of the subframe in `output`
    current_subframe: u32,
    /// Samples to skip (positive) or reuse (negative) on the next read
    pending_offset: i64,
    /// PSS timing tracker
    offset_tracker: SampleOffsetTracker,
    /// Consecutive tracking misses
    lost_count: u32,
    /// Samples received so far
    rx_samples: u64,
    /// Statistics
    stats: UeSyncStats,
}

impl UeSync {
    /// Create a driver reading from `source`
    pub fn new(config: UeSyncConfig, source: Box<dyn SampleSource>) -> Result<Self, LayerError> {
        validate_fft_size(config.fft_size)?;
        let n = config.fft_size;
        let sf_len = Numerology::new(n, CyclicPrefixKind::Normal)?
            .subframe_len()
            .max(Numerology::new(n, CyclicPrefixKind::Extended)?.subframe_len());

        if config.nof_recv_sf == 0 || config.nof_avg_find_frames == 0 || config.max_lost == 0 {
            return Err(LayerError::InvalidConfiguration(
                "nof_recv_sf, nof_avg_find_frames and max_lost must be at least 1".to_string(),
            ));
        }
        if config.track_window < 2 || n + config.track_window > sf_len {
            return Err(LayerError::InvalidConfiguration(format!(
                "track window {} outside 2..={}",
                config.track_window,
                sf_len - n
            )));
        }
        if !(config.sfo_ema_alpha > 0.0 && config.sfo_ema_alpha <= 1.0) {
            return Err(LayerError::InvalidConfiguration(format!(
                "SFO EMA alpha {} outside (0, 1]",
                config.sfo_ema_alpha
            )));
        }

        let candidates: Vec<u8> = match config.n_id_2 {
            Some(n_id_2) if n_id_2 > CellIdentity::MAX_NID_2 => return Err(LayerError::InvalidNid2(n_id_2)),
            Some(n_id_2) => vec![n_id_2],
            None => (0..=CellIdentity::MAX_NID_2).collect(),
        };

        let window = config.nof_recv_sf * sf_len;
        let find_config = SyncConfig {
            fft_size: n,
            frame_size: window,
            max_timing_search_window: window,
            decimation_factor: config.find_decimation,
            peak_threshold: config.find_threshold,
            cfo_integer_enable: config.find_cfo.integer,
            cfo_cp_enable: config.find_cfo.cyclic_prefix,
            cfo_pss_enable: config.find_cfo.pss,
            cfo_ema_alpha: config.cfo_ema_alpha,
            detect_cp: config.detect_cp,
            cp: config.cp,
            detect_duplex_mode: config.detect_duplex_mode,
            duplex_mode: config.duplex_mode,
            ..SyncConfig::default()
        };
        let find = candidates
            .into_iter()
            .map(|n_id_2| Ok((n_id_2, Synchronizer::new(find_config.clone())?)))
            .collect::<Result<Vec<_>, LayerError>>()?;

        let track = Synchronizer::new(SyncConfig {
            fft_size: n,
            frame_size: sf_len,
            max_timing_search_window: n + config.track_window,
            peak_threshold: config.track_threshold,
            cfo_integer_enable: config.track_cfo.integer,
            cfo_cp_enable: config.track_cfo.cyclic_prefix,
            cfo_pss_enable: config.track_cfo.pss,
            cfo_ema_alpha: config.cfo_ema_alpha,
            detect_cp: false,
            cp: config.cp,
            detect_duplex_mode: false,
            duplex_mode: config.duplex_mode,
            ..SyncConfig::default()
        })?;

        info!(
            "UE sync: N={}, window {} subframes, {} N_id_2 hypotheses, K={}",
            n,
            config.nof_recv_sf,
            find.len(),
            config.nof_avg_find_frames
        );

        Ok(Self {
            source,
            agc: None,
            find,
            track,
            sf_len,
            find_buffer: vec![Complex32::new(0.0, 0.0); window],
            raw: vec![Complex32::new(0.0, 0.0); sf_len],
            output: vec![Complex32::new(0.0, 0.0); sf_len],
            state: DriverState::Searching,
            cell: CellIdentity::unknown(),
            cp: config.cp,
            duplex_mode: config.duplex_mode,
            candidate: None,
            next_subframe: 0,
            current_subframe: 0,
            pending_offset: 0,
            offset_tracker: SampleOffsetTracker::new(config.sample_offset_correct_period, config.sfo_ema_alpha),
            lost_count: 0,
            rx_samples: 0,
            stats: UeSyncStats::default(),
            config,
        })
    }

    /// Attach a gain control driven by the receive AGC loop
    pub fn set_agc(&mut self, control: Box<dyn AgcControl>) -> Result<(), LayerError> {
        let agc = RxAgc::new(self.config.agc.clone().unwrap_or_default(), control.as_ref())?;
        self.agc = Some((agc, control));
        Ok(())
    }

    /// Process the next window (searching) or subframe (tracking).
    ///
    /// Any error resets the driver to searching.
    pub fn next_subframe(&mut self) -> Result<UeSyncEvent, LayerError> {
        let result = match self.state {
            DriverState::Searching => self.search(),
            DriverState::Tracking => self.track(),
        };
        if let Err(e) = &result {
            warn!("UE sync error in {:?}: {}", self.state, e);
            self.reset();
        }
        result
    }

    fn search(&mut self) -> Result<UeSyncEvent, LayerError> {
        receive_exact(self.source.as_mut(), &mut self.find_buffer, &mut self.rx_samples)?;
        if let Some((agc, control)) = &mut self.agc {
            agc.process(&self.find_buffer, control.as_mut())?;
        }
        self.stats.windows_searched += 1;

        let mut best: Option<(usize, SyncFindOutcome)> = None;
        let mut best_psr = f32::MIN;
        for (i, (n_id_2, sync)) in self.find.iter_mut().enumerate() {
            let outcome = sync.find(&self.find_buffer, *n_id_2, 0)?;
            if outcome != SyncFindOutcome::NotFound && sync.last_psr() > best_psr {
                best_psr = sync.last_psr();
                best = Some((i, outcome));
            }
        }

        let Some((index, outcome)) = best else {
            self.candidate = None;
            return Ok(UeSyncEvent::Searching);
        };
        self.stats.last_psr = best_psr;

        let found = match outcome {
            SyncFindOutcome::Found(found) if found.sss_detected => found,
            SyncFindOutcome::FoundButNoSpace { peak_position } => {
                debug!("PSS at {} too close to the window start, dropping half a window", peak_position);
                self.discard(self.find_buffer.len() / 2)?;
                self.find[index].1.reset();
                self.stats.realignments += 1;
                self.candidate = None;
                return Ok(UeSyncEvent::Searching);
            }
            _ => {
                self.candidate = None;
                return Ok(UeSyncEvent::Searching);
            }
        };

        let n_id_2 = self.find[index].0;
        let cell = CellIdentity::new(found.n_id_1, n_id_2)?;
        let count = match self.candidate {
            Some((previous, count)) if previous == cell => count + 1,
            _ => 1,
        };
        self.candidate = Some((cell, count));
        self.stats.find_hits += 1;
        debug!(
            "Search window: {} at {} (PSR {:.2}), {}/{} consecutive",
            cell, found.peak_position, found.psr, count, self.config.nof_avg_find_frames
        );
        if count < self.config.nof_avg_find_frames {
            return Ok(UeSyncEvent::Searching);
        }

        // Skip to the next subframe boundary
        let numerology = Numerology::new(self.config.fft_size, found.cp)?;
        let sf_len = numerology.subframe_len() as i64;
        let window = self.find_buffer.len() as i64;
        let subframe_start = found.peak_position as i64 - numerology.pss_end_in_subframe(found.duplex_mode) as i64;
        let skip = (subframe_start - window).rem_euclid(sf_len);
        let elapsed = ((window + skip - subframe_start) / sf_len) as u32;

        self.next_subframe = (found.subframe_index + elapsed) % common::time::SUBFRAMES_PER_FRAME;
        self.pending_offset = skip;
        self.cell = cell;
        self.cp = found.cp;
        self.duplex_mode = found.duplex_mode;
        let cfo = *self.find[index].1.cfo_state();
        self.track.reset();
        self.track.copy_cfo_from(&cfo);
        self.track.set_cp(found.cp);
        self.track.set_duplex_mode(found.duplex_mode);
        self.offset_tracker.reset();
        self.lost_count = 0;
        self.candidate = None;
        self.state = DriverState::Tracking;

        info!(
            "Cell found: {}, CP {}, {}, CFO {:.1} Hz, next subframe {} after skipping {} samples",
            cell,
            self.cp,
            self.duplex_mode,
            cfo.combined_hz(),
            self.next_subframe,
            skip
        );
        Ok(UeSyncEvent::CellFound(cell))
    }

    fn track(&mut self) -> Result<UeSyncEvent, LayerError> {
        let sf_len = self.sf_len;
        let offset = std::mem::take(&mut self.pending_offset);
        if offset > 0 {
            self.discard(offset as usize)?;
            receive_exact(self.source.as_mut(), &mut self.raw, &mut self.rx_samples)?;
        } else if offset < 0 {
            let reuse = (offset.unsigned_abs() as usize).min(sf_len);
            self.raw.copy_within(sf_len - reuse.., 0);
            receive_exact(self.source.as_mut(), &mut self.raw[reuse..], &mut self.rx_samples)?;
        } else {
            receive_exact(self.source.as_mut(), &mut self.raw, &mut self.rx_samples)?;
        }

        let mut sf_idx = self.next_subframe;
        if self.duplex_mode.is_pss_subframe(sf_idx) {
            if let Some((agc, control)) = &mut self.agc {
                agc.process(&self.raw, control.as_mut())?;
            }

            let pss_end = self.track.numerology().pss_end_in_subframe(self.duplex_mode);
            let search_offset = pss_end.saturating_sub(self.config.fft_size + self.config.track_window / 2);
            let outcome = self.track.find(&self.raw, self.cell.n_id_2, search_offset)?;
            self.stats.last_psr = self.track.last_psr();

            if let SyncFindOutcome::Found(found) = outcome {
                if self.config.decode_sss_on_track && found.sss_detected && found.subframe_index != sf_idx {
                    warn!(
                        "SSS reports subframe {} while tracking subframe {}, resyncing",
                        found.subframe_index, sf_idx
                    );
                    sf_idx = found.subframe_index;
                }
            }

            match outcome.peak_position() {
                Some(peak) => {
                    self.lost_count = 0;
                    self.stats.track_ok += 1;
                    let measured = peak as i64 - pss_end as i64;
                    if let Some(correction) = self.offset_tracker.update(measured) {
                        self.pending_offset = correction;
                        if correction != 0 {
                            self.stats.offset_corrections += 1;
                            info!(
                                "Sample offset correction {} (mean {:.2}, SFO {:.1} samples/s)",
                                correction,
                                self.offset_tracker.mean_offset,
                                self.offset_tracker.sfo_hz()
                            );
                        }
                    }
                }
                None => {
                    self.lost_count += 1;
                    self.stats.track_lost += 1;
                    debug!(
                        "PSS missed in subframe {} ({}/{})",
                        sf_idx, self.lost_count, self.config.max_lost
                    );
                    if self.lost_count >= self.config.max_lost {
                        info!("Cell {} lost after {} missed PSS", self.cell, self.lost_count);
                        self.stats.cells_lost += 1;
                        self.reset();
                        return Ok(UeSyncEvent::CellLost);
                    }
                }
            }
        }

        self.output.copy_from_slice(&self.raw);
        if self.config.cfo_correct_track {
            let cfo = self.track.cfo_state().combined_hz_norm();
            let start = self.rx_samples - sf_len as u64;
            apply_frequency_shift(&mut self.output, -cfo, self.config.fft_size, start);
        }

        self.current_subframe = sf_idx;
        self.next_subframe = (sf_idx + 1) % common::time::SUBFRAMES_PER_FRAME;
        self.stats.subframes_delivered += 1;
        Ok(UeSyncEvent::Subframe(sf_idx))
    }

    /// Read and drop `count` samples
    fn discard(&mut self, mut count: usize) -> Result<(), LayerError> {
        while count > 0 {
            let chunk = count.min(self.raw.len());
            receive_exact(self.source.as_mut(), &mut self.raw[..chunk], &mut self.rx_samples)?;
            count -= chunk;
        }
        Ok(())
    }

    /// Return to searching and forget all acquisition state
    pub fn reset(&mut self) {
        for (_, sync) in &mut self.find {
            sync.reset();
        }
        self.track.reset();
        if let Some((agc, _)) = &mut self.agc {
            agc.reset();
        }
        self.state = DriverState::Searching;
        self.cell = CellIdentity::unknown();
        self.cp = self.config.cp;
        self.duplex_mode = self.config.duplex_mode;
        self.candidate = None;
        self.next_subframe = 0;
        self.current_subframe = 0;
        self.pending_offset = 0;
        self.offset_tracker.reset();
        self.lost_count = 0;
    }

    /// Last delivered subframe (valid after [`UeSyncEvent::Subframe`])
    pub fn aligned_window(&self) -> &[Complex32] {
        &self.output
    }

    /// Acquired cell, unresolved while searching
    pub fn cell(&self) -> CellIdentity {
        self.cell
    }

    /// CP length in use
    pub fn cp(&self) -> CyclicPrefixKind {
        self.cp
    }

    /// Duplex mode in use
    pub fn duplex_mode(&self) -> DuplexMode {
        self.duplex_mode
    }

    /// Current CFO estimate in Hz
    pub fn cfo_hz(&self) -> f32 {
        self.track.cfo_hz()
    }

    /// Index of the last delivered subframe
    pub fn subframe_index(&self) -> u32 {
        self.current_subframe
    }

    /// Current state
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Sample-clock offset in samples per second
    pub fn sfo_hz(&self) -> f32 {
        self.offset_tracker.sfo_hz()
    }

    /// PSS timing tracker
    pub fn offset_tracker(&self) -> &SampleOffsetTracker {
        &self.offset_tracker
    }

    /// Statistics
    pub fn stats(&self) -> &UeSyncStats {
        &self.stats
    }

    /// Settings
    pub fn config(&self) -> &UeSyncConfig {
        &self.config
    }
}

/// Fill `buffer` from `source`, failing on a short read
fn receive_exact(
    source: &mut dyn SampleSource,
    buffer: &mut [Complex32],
    rx_samples: &mut u64,
) -> Result<(), LayerError> {
    let received = source.receive(buffer, true)?;
    *rx_samples += received as u64;
    if received < buffer.len() {
        return Err(LayerError::ShortRead {
            requested: buffer.len(),
            received,
        });
    }
    Ok(())
}
