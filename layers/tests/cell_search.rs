//! Cell search over the full physical cell ID range

use common::{CellIdentity, CyclicPrefixKind, DuplexMode};
use layers::phy::{DownlinkConfig, DownlinkGenerator, SyncConfig, SyncFindOutcome, Synchronizer};

const SF_LEN: usize = 1920;

fn two_subframe_config() -> SyncConfig {
    SyncConfig {
        frame_size: 2 * SF_LEN,
        max_timing_search_window: 2 * SF_LEN,
        cfo_cp_enable: false,
        cfo_pss_enable: false,
        ..SyncConfig::default()
    }
}

#[test]
fn test_all_cell_ids_fdd() {
    let mut sync = Synchronizer::new(two_subframe_config()).unwrap();

    for pci in 0..=CellIdentity::MAX_PCI {
        let cell = CellIdentity::from_physical_cell_id(pci).unwrap();
        let mut generator = DownlinkGenerator::new(DownlinkConfig { cell, ..DownlinkConfig::default() }).unwrap();
        let frame = generator.generate_subframes(10).unwrap();

        for (start_sf, expected_sf) in [(0usize, 0u32), (5, 5)] {
            let window = &frame[start_sf * SF_LEN..(start_sf + 2) * SF_LEN];
            sync.reset();
            match sync.find(window, cell.n_id_2, 0).unwrap() {
                SyncFindOutcome::Found(found) => {
                    assert_eq!(found.peak_position, 960, "PCI {}", pci);
                    assert!(found.sss_detected, "PCI {}: SSS not detected", pci);
                    assert_eq!(found.n_id_1, cell.n_id_1, "PCI {}", pci);
                    assert_eq!(found.subframe_index, expected_sf, "PCI {}", pci);
                    assert_eq!(found.cp, CyclicPrefixKind::Normal, "PCI {}", pci);
                    assert_eq!(found.duplex_mode, DuplexMode::Fdd, "PCI {}", pci);
                }
                other => panic!("PCI {}: expected Found, got {:?}", pci, other),
            }
        }
    }
}

#[test]
fn test_noisy_cell_with_payload() {
    let cell = CellIdentity::new(77, 2).unwrap();
    let mut generator = DownlinkGenerator::new(DownlinkConfig {
        cell,
        data_fill: true,
        snr_db: Some(10.0),
        seed: 42,
        ..DownlinkConfig::default()
    })
    .unwrap();
    let frame = generator.generate_subframes(2).unwrap();

    let mut sync = Synchronizer::new(two_subframe_config()).unwrap();
    match sync.find(&frame, 2, 0).unwrap() {
        SyncFindOutcome::Found(found) => {
            assert!((found.peak_position as i64 - 960).abs() <= 1);
            assert!(found.sss_detected);
            assert_eq!(found.n_id_1, 77);
            assert_eq!(found.subframe_index, 0);
        }
        other => panic!("expected Found, got {:?}", other),
    }
}
