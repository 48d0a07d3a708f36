//! File sink: the `file-writer` thread
//!
//! Windows arrive over a bounded channel; a full channel is back-pressure
//! and the window is dropped by the caller. The writer thread owns the
//! container and the disk admission state, so neither is shared.
//!
//! Per window:
//! 1. admit the append against the free-space reserve (`DiskExhausted` stops)
//! 2. open the container lazily (first window, or after a rotation)
//! 3. append (`WriteFailed` stops, partial file is kept)
//! 4. stop with `SampleLimitReached` once `samples` per channel are written
//! 5. rotate when the window or byte threshold is reached
//!
//! A terminal condition is sent once on the event channel; the caller turns
//! it into a session stop.

use super::disk::DiskAdmission;
use super::{ContainerFormat, ContainerInfo, ContainerLayout, ContainerWriter, open_container};
use crate::config::SaveMode;
use crate::core::calibration::CalibrationSnapshot;
use crate::core::stats::SessionStats;
use crate::core::types::{SampleWindow, StopReason};
use crate::error::{Error, Result};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const QUEUE_POLL: Duration = Duration::from_millis(100);

/// File sink settings
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    pub dir: PathBuf,
    pub prefix: String,
    /// Session tag in file names
    pub session: String,
    pub format: ContainerFormat,
    pub layout: ContainerLayout,
    pub save_mode: SaveMode,
    /// Rotate after this many windows (0 = off)
    pub rotate_windows: u64,
    /// Rotate after this many bytes (0 = off)
    pub rotate_bytes: u64,
    pub min_reserve_bytes: u64,
    pub space_check_interval: Duration,
    pub queue_depth: usize,
    /// Stop after this many samples per channel
    pub sample_limit: Option<u64>,
}

impl FileSinkConfig {
    /// `{prefix}_{session}_{seq:04}.{ext}`
    pub fn file_path(&self, seq: u32) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{:04}.{}",
            self.prefix,
            self.session,
            seq,
            self.format.extension()
        ))
    }
}

/// Outcome of a file sink
#[derive(Debug, Clone, Default)]
pub struct FileSinkReport {
    pub files: Vec<ContainerInfo>,
    pub windows: u64,
    pub samples_per_channel: u64,
    /// Terminal condition raised by the writer, if any
    pub stop: Option<StopReason>,
}

/// Immediate outcome of [`FileSink::try_submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Queued,
    /// Writer behind; window not taken
    Backpressure,
    /// Writer finished; window not taken
    Closed,
}

struct Job {
    window: SampleWindow,
    calibration: CalibrationSnapshot,
}

/// Handle to a running file-writer thread
pub struct FileSink {
    tx: Option<Sender<Job>>,
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<FileSinkReport>>,
}

impl FileSink {
    /// Create the output directory and start the writer thread
    pub fn start(
        config: FileSinkConfig,
        stats: Arc<SessionStats>,
        events: Sender<StopReason>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.dir).map_err(|e| {
            Error::Config(format!(
                "cannot create output directory {}: {}",
                config.dir.display(),
                e
            ))
        })?;

        let (tx, rx) = bounded(config.queue_depth.max(1));
        let abort = Arc::new(AtomicBool::new(false));
        let abort_flag = Arc::clone(&abort);
        log::info!(
            "File sink writing {:?} files to {}",
            config.format,
            config.dir.display()
        );

        let handle = thread::Builder::new()
            .name("file-writer".to_string())
            .spawn(move || {
                let mut writer = Writer::new(config, stats);
                let stop = writer.run(&rx, &abort_flag);
                if let Some(reason) = &stop {
                    log::info!("File sink stopping: {}", reason);
                    let _ = events.try_send(reason.clone());
                }
                writer.finish(stop)
            })
            .map_err(|e| Error::Other(format!("Failed to spawn file-writer thread: {}", e)))?;

        Ok(Self {
            tx: Some(tx),
            abort,
            handle: Some(handle),
        })
    }

    /// Hand a window to the writer without blocking
    pub fn try_submit(&self, window: SampleWindow, calibration: CalibrationSnapshot) -> SinkStatus {
        let Some(tx) = &self.tx else {
            return SinkStatus::Closed;
        };
        match tx.try_send(Job {
            window,
            calibration,
        }) {
            Ok(()) => SinkStatus::Queued,
            Err(TrySendError::Full(_)) => SinkStatus::Backpressure,
            Err(TrySendError::Disconnected(_)) => SinkStatus::Closed,
        }
    }

    /// Write everything queued, close the current file, and join
    pub fn finish(mut self) -> Result<FileSinkReport> {
        self.join()
    }

    /// Finish the current write only, then close and join
    pub fn abort(mut self) -> Result<FileSinkReport> {
        self.abort.store(true, Ordering::Release);
        self.join()
    }

    fn join(&mut self) -> Result<FileSinkReport> {
        self.tx = None;
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::ThreadPanic("file-writer")),
            None => Ok(FileSinkReport::default()),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
        let _ = self.join();
    }
}

/// State owned by the writer thread
struct Writer {
    config: FileSinkConfig,
    stats: Arc<SessionStats>,
    admission: DiskAdmission,
    current: Option<Box<dyn ContainerWriter>>,
    seq: u32,
    report: FileSinkReport,
}

impl Writer {
    fn new(config: FileSinkConfig, stats: Arc<SessionStats>) -> Self {
        let admission = DiskAdmission::new(
            config.dir.clone(),
            config.min_reserve_bytes,
            config.space_check_interval,
        );
        Self {
            config,
            stats,
            admission,
            current: None,
            seq: 0,
            report: FileSinkReport::default(),
        }
    }

    fn run(&mut self, rx: &Receiver<Job>, abort: &AtomicBool) -> Option<StopReason> {
        loop {
            if abort.load(Ordering::Acquire) {
                let pending = rx.len();
                if pending > 0 {
                    log::debug!("Abort: {} queued windows not written", pending);
                }
                return None;
            }
            let job = match rx.recv_timeout(QUEUE_POLL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            };
            if let Some(reason) = self.write(job) {
                return Some(reason);
            }
        }
    }

    /// Write one window; returns a terminal condition
    fn write(&mut self, job: Job) -> Option<StopReason> {
        let len = job.window.len();

        if self.current.is_none() {
            // Fresh reading before every new file
            if let Err(e) = self.admission.refresh() {
                return Some(StopReason::WriteFailed(format!("free-space probe failed: {}", e)));
            }
        }
        let size = match &self.current {
            Some(container) => container.append_size(len),
            None => self.config.layout.payload_bytes(len),
        };
        match self.admission.admit(size) {
            Ok(_) => {}
            Err(e @ Error::DiskExhausted { .. }) => {
                log::error!("{}", e);
                return Some(StopReason::DiskExhausted(e.to_string()));
            }
            Err(e) => return Some(StopReason::WriteFailed(e.to_string())),
        }

        if self.current.is_none() {
            let path = self.config.file_path(self.seq);
            match open_container(self.config.format, &path, self.config.layout) {
                Ok(container) => self.current = Some(container),
                Err(e) => {
                    return Some(StopReason::WriteFailed(format!(
                        "cannot open {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        let container = self.current.as_mut()?;

        match container.append(&job.window, &job.calibration) {
            Ok(bytes) => {
                self.admission.record_written(bytes);
                self.stats.record_delivered(bytes);
                self.report.windows += 1;
                self.report.samples_per_channel += len as u64;
            }
            Err(e) => {
                log::error!("Write to {} failed: {}", container.path().display(), e);
                self.stats.record_dropped_window(len as u64);
                return Some(StopReason::WriteFailed(e.to_string()));
            }
        }

        if let Some(limit) = self.config.sample_limit {
            if self.report.samples_per_channel >= limit {
                return Some(StopReason::SampleLimitReached);
            }
        }
        if self.should_rotate() {
            self.close_current();
            self.seq += 1;
        }
        None
    }

    fn should_rotate(&self) -> bool {
        if self.config.save_mode != SaveMode::Rotating {
            return false;
        }
        let Some(container) = &self.current else {
            return false;
        };
        (self.config.rotate_windows > 0 && container.windows_written() >= self.config.rotate_windows)
            || (self.config.rotate_bytes > 0 && container.bytes_written() >= self.config.rotate_bytes)
    }

    fn close_current(&mut self) {
        if let Some(container) = self.current.take() {
            let path = container.path().to_path_buf();
            match container.close() {
                Ok(info) => self.report.files.push(info),
                Err(e) => log::error!("Failed to close {}: {}", path.display(), e),
            }
        }
    }

    fn finish(mut self, stop: Option<StopReason>) -> FileSinkReport {
        self.close_current();
        self.report.stop = stop;
        log::info!(
            "File sink finished: {} windows in {} files",
            self.report.windows,
            self.report.files.len()
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChannelMask, Resolution};
    use crate::storage::container_summary;
    use crate::streaming::wire::WireOptions;
    use crossbeam_channel::unbounded;
    use tempfile::TempDir;

    fn sink_config(dir: &TempDir, save_mode: SaveMode) -> FileSinkConfig {
        FileSinkConfig {
            dir: dir.path().join("out"),
            prefix: "data_file".into(),
            session: "test".into(),
            format: ContainerFormat::Structured,
            layout: ContainerLayout {
                options: WireOptions {
                    resolution: Resolution::Bits16,
                    calibrated: false,
                    mask: ChannelMask::BOTH,
                    adc_bits: 14,
                },
                sample_rate_hz: 1000,
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
        SampleWindow::new(index, ChannelMask::BOTH, vec![1; 32], vec![2; 32])
    }

    #[test]
    fn test_file_names() {
        let dir = TempDir::new().unwrap();
        let config = sink_config(&dir, SaveMode::Single);
        assert!(config.file_path(7).ends_with("data_file_test_0007.acq"));
    }

    #[test]
    fn test_rotation_every_n_windows() {
        let dir = TempDir::new().unwrap();
        let (events_tx, events_rx) = unbounded();
        let sink = FileSink::start(
            sink_config(&dir, SaveMode::Rotating),
            Arc::new(SessionStats::new()),
            events_tx,
        )
        .unwrap();
        for i in 0..7 {
            assert_eq!(sink.try_submit(window(i), CalibrationSnapshot::default()), SinkStatus::Queued);
        }
        let report = sink.finish().unwrap();
        assert_eq!(report.windows, 7);
        assert_eq!(report.files.len(), 3);
        assert!(report.stop.is_none());
        assert!(events_rx.try_recv().is_err());

        let total: u64 = report
            .files
            .iter()
            .map(|f| container_summary(&f.path).unwrap().samples_per_channel)
            .sum();
        assert_eq!(total, 7 * 32);
    }

    #[test]
    fn test_sample_limit_stops_after_whole_windows() {
        let dir = TempDir::new().unwrap();
        let (events_tx, events_rx) = unbounded();
        let mut config = sink_config(&dir, SaveMode::Single);
        config.sample_limit = Some(70);
        let sink = FileSink::start(config, Arc::new(SessionStats::new()), events_tx).unwrap();
        for i in 0..5 {
            sink.try_submit(window(i), CalibrationSnapshot::default());
        }
        let report = sink.finish().unwrap();
        assert_eq!(report.windows, 3);
        assert_eq!(report.samples_per_channel, 96);
        assert_eq!(report.stop, Some(StopReason::SampleLimitReached));
        assert_eq!(events_rx.try_recv().unwrap(), StopReason::SampleLimitReached);
    }

    #[test]
    fn test_submit_after_finish_is_closed() {
        let dir = TempDir::new().unwrap();
        let (events_tx, _events_rx) = unbounded();
        let mut config = sink_config(&dir, SaveMode::Single);
        config.sample_limit = Some(1);
        let sink = FileSink::start(config, Arc::new(SessionStats::new()), events_tx).unwrap();
        sink.try_submit(window(0), CalibrationSnapshot::default());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut status = SinkStatus::Queued;
        while std::time::Instant::now() < deadline {
            status = sink.try_submit(window(1), CalibrationSnapshot::default());
            if status == SinkStatus::Closed {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(status, SinkStatus::Closed);
    }
}
