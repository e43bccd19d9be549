//! Albor LTE UE Sync Receiver
//!
//! Runs cell search and tracking on an IQ capture or on a synthetic downlink
//! and logs acquisition, tracking and loss events.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::{CellIdentity, CyclicPrefixKind, DuplexMode};
use interfaces::{FileSampleSource, InterfaceError, SampleFormat, SampleSource};
use layers::phy::{DownlinkGenerator, UeSync, UeSyncEvent, UeSyncStats};
use layers::LayerError;

use config::UeAppConfig;

/// Albor LTE UE cell search and synchronization receiver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// IQ capture to process
    #[arg(short, long)]
    input: Option<String>,

    /// Capture sample format (cf32, ci16)
    #[arg(long)]
    format: Option<String>,

    /// Use the synthetic downlink even if a capture is configured
    #[arg(long)]
    synthetic: bool,

    /// Physical cell ID of the synthetic downlink (0-503)
    #[arg(long)]
    cell_id: Option<u16>,

    /// Carrier offset of the synthetic downlink in Hz
    #[arg(long)]
    cfo_hz: Option<f32>,

    /// SNR of the synthetic downlink in dB
    #[arg(long)]
    snr_db: Option<f32>,

    /// Synthetic downlink uses TDD
    #[arg(long)]
    tdd: bool,

    /// Synthetic downlink uses extended CP
    #[arg(long)]
    extended_cp: bool,

    /// Stop after this many subframes
    #[arg(long)]
    subframes: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => UeAppConfig::load(path)?,
        None => UeAppConfig::default(),
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor LTE UE sync receiver");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path);
    }

    apply_overrides(&mut config, &args)?;
    let source = open_source(&config)?;

    info!("Sync configuration:");
    info!("  FFT size: {}", config.sync.fft_size);
    info!("  Search window: {} subframes", config.sync.nof_recv_sf);
    info!("  Thresholds: find {:.2}, track {:.2}", config.sync.find_threshold, config.sync.track_threshold);
    match config.sync.n_id_2 {
        Some(n_id_2) => info!("  N_id_2: {}", n_id_2),
        None => info!("  N_id_2: search all"),
    }

    let ue = UeSync::new(config.sync.clone(), source).context("creating UE sync driver")?;

    let running = Arc::new(AtomicBool::new(true));
    let mut handle = {
        let running = running.clone();
        let run = config.run.clone();
        tokio::task::spawn_blocking(move || run_receiver(ue, run.max_subframes, run.stats_interval, &running))
    };

    // Wait for shutdown signal or end of stream
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            running.store(false, Ordering::Relaxed);
            tokio::time::timeout(tokio::time::Duration::from_secs(5), &mut handle)
                .await
                .context("receiver did not stop")?
        }
        result = &mut handle => result,
    };

    let stats = result.context("receiver task failed")??;
    info!("Receiver statistics:");
    info!("  Windows searched: {}, find hits: {}", stats.windows_searched, stats.find_hits);
    info!("  Subframes delivered: {}", stats.subframes_delivered);
    info!("  PSS tracked: {}, missed: {}", stats.track_ok, stats.track_lost);
    info!("  Cells lost: {}, offset corrections: {}", stats.cells_lost, stats.offset_corrections);

    info!("UE sync receiver shutdown complete");
    Ok(())
}

/// Fold command line flags into the loaded configuration
fn apply_overrides(config: &mut UeAppConfig, args: &Args) -> Result<()> {
    if let Some(input) = &args.input {
        config.source.input = Some(input.clone());
    }
    if let Some(format) = &args.format {
        config.source.format = format.clone();
    }
    if args.synthetic {
        config.source.input = None;
    }
    if let Some(pci) = args.cell_id {
        config.synthetic.cell = CellIdentity::from_physical_cell_id(pci)
            .map_err(|e| anyhow::anyhow!("Invalid cell ID {}: {}", pci, e))?;
    }
    if let Some(cfo_hz) = args.cfo_hz {
        config.synthetic.cfo_hz = cfo_hz;
    }
    if let Some(snr_db) = args.snr_db {
        config.synthetic.snr_db = Some(snr_db);
    }
    if args.tdd {
        config.synthetic.duplex_mode = DuplexMode::Tdd;
    }
    if args.extended_cp {
        config.synthetic.cp = CyclicPrefixKind::Extended;
    }
    if args.subframes.is_some() {
        config.run.max_subframes = args.subframes;
    }
    config.synthetic.fft_size = config.sync.fft_size;
    Ok(())
}

fn open_source(config: &UeAppConfig) -> Result<Box<dyn SampleSource>> {
    match &config.source.input {
        Some(path) => {
            let format: SampleFormat = config.source.format.parse()?;
            let source = FileSampleSource::open(path, format, config.source.looping)
                .with_context(|| format!("opening capture {}", path))?;
            Ok(Box::new(source))
        }
        None => {
            let synthetic = &config.synthetic;
            info!("Synthetic downlink:");
            info!("  Cell: {}", synthetic.cell);
            info!("  CP: {}, {}", synthetic.cp, synthetic.duplex_mode);
            info!("  CFO: {} Hz, SNR: {:?} dB", synthetic.cfo_hz, synthetic.snr_db);
            Ok(Box::new(DownlinkGenerator::new(synthetic.clone())?))
        }
    }
}

/// Drive the receiver until the stream ends, the limit is reached or shutdown is requested
fn run_receiver(
    mut ue: UeSync,
    max_subframes: Option<u64>,
    stats_interval: u64,
    running: &AtomicBool,
) -> Result<UeSyncStats> {
    let window_subframes = ue.config().nof_recv_sf as u64;
    let mut processed = 0u64;

    while running.load(Ordering::Relaxed) && max_subframes.map_or(true, |max| processed < max) {
        match ue.next_subframe() {
            Ok(UeSyncEvent::Searching) => {
                processed += window_subframes;
                debug!("Searching (last PSR {:.2})", ue.stats().last_psr);
            }
            Ok(UeSyncEvent::CellFound(cell)) => {
                processed += window_subframes;
                info!(
                    "Tracking {}: CP {}, {}, CFO {:.1} Hz",
                    cell,
                    ue.cp(),
                    ue.duplex_mode(),
                    ue.cfo_hz()
                );
            }
            Ok(UeSyncEvent::Subframe(sf_idx)) => {
                processed += 1;
                let delivered = ue.stats().subframes_delivered;
                if stats_interval > 0 && delivered % stats_interval == 0 {
                    info!(
                        "Subframe {}: {} delivered, CFO {:.1} Hz, SFO {:.2} samples/s, PSR {:.2}",
                        sf_idx,
                        delivered,
                        ue.cfo_hz(),
                        ue.sfo_hz(),
                        ue.stats().last_psr
                    );
                }
            }
            Ok(UeSyncEvent::CellLost) => {
                processed += 1;
                warn!("Cell lost, searching again");
            }
            Err(LayerError::ShortRead { .. }) | Err(LayerError::Interface(InterfaceError::EndOfStream)) => {
                info!("End of sample stream");
                break;
            }
            Err(e) => {
                error!("UE sync failed: {}", e);
                return Err(e.into());
            }
        }
    }

    Ok(ue.stats().clone())
}
