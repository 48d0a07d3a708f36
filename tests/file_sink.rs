//! File sink integration tests: declared sample counts and disk admission

use acqstream::config::SaveMode;
use acqstream::core::calibration::CalibrationSnapshot;
use acqstream::core::stats::SessionStats;
use acqstream::core::types::{ChannelMask, Resolution, SampleWindow, StopReason};
use acqstream::storage::sink::SinkStatus;
use acqstream::storage::{
    ContainerFormat, ContainerLayout, FileSink, FileSinkConfig, container_summary,
};
use acqstream::streaming::wire::WireOptions;

use crossbeam_channel::bounded;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WINDOW: usize = 128;

fn sink_config(dir: &Path, format: ContainerFormat, save_mode: SaveMode) -> FileSinkConfig {
    FileSinkConfig {
        dir: dir.to_path_buf(),
        prefix: "capture".to_string(),
        session: "test".to_string(),
        format,
        layout: ContainerLayout {
            options: WireOptions {
                resolution: Resolution::Bits16,
                calibrated: false,
                mask: ChannelMask::BOTH,
                adc_bits: 14,
            },
            sample_rate_hz: 1_000_000,
        },
        save_mode,
        rotate_windows: 3,
        rotate_bytes: 0,
        min_reserve_bytes: 0,
        space_check_interval: Duration::from_secs(1),
        queue_depth: 64,
        sample_limit: None,
    }
}

fn window(index: u64) -> SampleWindow {
    let ch1 = (0..WINDOW).map(|i| i as i16).collect();
    let ch2 = (0..WINDOW).map(|i| -(i as i16)).collect();
    SampleWindow::new(index, ChannelMask::BOTH, ch1, ch2)
}

fn declared_samples(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| container_summary(&entry.unwrap().path()).unwrap().samples_per_channel)
        .sum()
}

fn write_windows(format: ContainerFormat, save_mode: SaveMode, count: u64) -> (TempDir, usize) {
    let dir = TempDir::new().unwrap();
    let (events_tx, events_rx) = bounded(8);
    let sink = FileSink::start(
        sink_config(dir.path(), format, save_mode),
        Arc::new(SessionStats::new()),
        events_tx,
    )
    .unwrap();

    for index in 0..count {
        assert_eq!(
            sink.try_submit(window(index), CalibrationSnapshot::default()),
            SinkStatus::Queued
        );
    }
    let report = sink.finish().unwrap();
    assert!(events_rx.try_recv().is_err());
    assert_eq!(report.windows, count);
    assert_eq!(report.samples_per_channel, count * WINDOW as u64);
    (dir, report.files.len())
}

#[test]
fn test_declared_samples_independent_of_save_mode() {
    for format in [ContainerFormat::Simple, ContainerFormat::Structured] {
        let (single, single_files) = write_windows(format, SaveMode::Single, 10);
        let (rotating, rotating_files) = write_windows(format, SaveMode::Rotating, 10);

        assert_eq!(single_files, 1);
        assert_eq!(rotating_files, 4);
        assert_eq!(declared_samples(single.path()), 10 * WINDOW as u64);
        assert_eq!(declared_samples(rotating.path()), 10 * WINDOW as u64);
    }
}

#[test]
fn test_disk_exhausted_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let mut config = sink_config(dir.path(), ContainerFormat::Structured, SaveMode::Single);
    config.min_reserve_bytes = u64::MAX;

    let stats = Arc::new(SessionStats::new());
    let (events_tx, events_rx) = bounded(8);
    let sink = FileSink::start(config, Arc::clone(&stats), events_tx).unwrap();
    assert_eq!(
        sink.try_submit(window(0), CalibrationSnapshot::default()),
        SinkStatus::Queued
    );

    let reason = events_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(reason, StopReason::DiskExhausted(_)));
    assert!(reason.is_failure());

    let report = sink.finish().unwrap();
    assert!(report.files.is_empty());
    assert_eq!(report.windows, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(stats.snapshot().bytes_out, 0);
}
