//! Session orchestration
//!
//! ```text
//! Configured ──run──▶ Running ──stop / sink stop / fault──▶ Stopped
//! ```
//!
//! `run` owns the delivery loop: it polls the producer, hands each window to
//! the streaming manager, and watches three stop sources (the [`StopHandle`],
//! the sink's event channel, and the producer's fault slot). Whatever ends
//! the loop first becomes the session's [`StopReason`].

use crate::config::StreamConfig;
use crate::core::calibration::{
    CalibrationSnapshot, CalibrationSource, InputRange, SettingsCalibration, UnityCalibration,
};
use crate::core::driver::AcquisitionBackend;
use crate::core::stats::{SessionStats, StatsSnapshot};
use crate::core::types::{SampleWindow, StopReason};
use crate::devices::{SampleProducer, create_backend};
use crate::error::{Error, Result};
use crate::storage::{ContainerLayout, FileSinkConfig, FileSinkReport};
use crate::streaming::wire::WireOptions;
use crate::streaming::{StreamingManager, SubmitOutcome, TransportConfig, create_transport};

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Application lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Configured,
    Running,
    Stopped,
}

#[derive(Debug)]
struct StopFlags {
    requested: AtomicBool,
    graceful: AtomicBool,
}

/// Cloneable stop request, safe to use from any thread
///
/// Only sets flags; the stop itself runs on the thread inside `run`.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flags: Arc<StopFlags>,
}

impl StopHandle {
    fn new() -> Self {
        Self {
            flags: Arc::new(StopFlags {
                requested: AtomicBool::new(false),
                graceful: AtomicBool::new(true),
            }),
        }
    }

    /// Ask the session to stop; a non-graceful request wins over a graceful one
    pub fn request_stop(&self, graceful: bool) {
        if !graceful {
            self.flags.graceful.store(false, Ordering::Release);
        }
        self.flags.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.flags.requested.load(Ordering::Acquire)
    }

    fn is_graceful(&self) -> bool {
        self.flags.graceful.load(Ordering::Acquire)
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub reason: StopReason,
    pub stats: StatsSnapshot,
    /// File sink results (file sessions only)
    pub files: Option<FileSinkReport>,
    pub elapsed: Duration,
}

impl SessionReport {
    /// True if the session ended on an error rather than a stop request or limit
    pub fn is_failure(&self) -> bool {
        self.reason.is_failure()
    }
}

/// Owns the producer and the streaming manager for one session
pub struct StreamingApplication {
    config: StreamConfig,
    state: AppState,
    producer: SampleProducer,
    manager: StreamingManager,
    stats: Arc<SessionStats>,
    calibration_source: Box<dyn CalibrationSource>,
    calibration: Arc<RwLock<CalibrationSnapshot>>,
    stop: StopHandle,
}

impl StreamingApplication {
    /// Build a session from configuration, creating the configured backend
    pub fn new(config: StreamConfig) -> Result<Self> {
        let backend = create_backend(&config.device)?;
        Self::with_backend(config, backend)
    }

    /// Build a session around an existing backend
    pub fn with_backend(config: StreamConfig, backend: Box<dyn AcquisitionBackend>) -> Result<Self> {
        config.validate()?;
        let mask = config.channel_mask()?;
        let range = config.input_range();
        let calibration_source: Box<dyn CalibrationSource> =
            match (config.use_calib, &config.calibration_file) {
                (true, Some(path)) => {
                    log::info!("Loading {:?} calibration from {}", range, path.display());
                    Box::new(SettingsCalibration::from_file(path, range)?)
                }
                (true, None) => {
                    log::warn!("use_calib set without calibration_file; using nominal gains");
                    Box::new(UnityCalibration::new(range))
                }
                (false, _) => Box::new(UnityCalibration::new(range)),
            };
        let snapshot = calibration_source.get()?;

        let stats = Arc::new(SessionStats::new());
        let producer =
            SampleProducer::new(backend, config.window_samples, mask, Arc::clone(&stats))?;
        producer.set_calibration(snapshot);
        let manager = StreamingManager::new(Arc::clone(&stats));

        Ok(Self {
            config,
            state: AppState::Configured,
            producer,
            manager,
            stats,
            calibration_source,
            calibration: Arc::new(RwLock::new(snapshot)),
            stop: StopHandle::new(),
        })
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request a stop; same as `stop_handle().request_stop(graceful)`
    pub fn stop(&self, graceful: bool) {
        self.stop.request_stop(graceful);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Local address of the network sink while running
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.manager.local_addr()
    }

    /// Publish a new calibration snapshot to the producer and the delivery loop
    pub fn set_calibration(&self, snapshot: CalibrationSnapshot) {
        *self.calibration.write() = snapshot;
        self.producer.set_calibration(snapshot);
    }

    /// Switch input range and reload calibration for it
    pub fn set_input_range(&mut self, range: InputRange) -> Result<()> {
        self.calibration_source.set_range(range);
        let snapshot = self.calibration_source.get()?;
        self.set_calibration(snapshot);
        log::info!("Input range set to {:?}", range);
        Ok(())
    }

    /// Run the session until a stop request, sink stop, or hardware fault
    ///
    /// If this fails while the application is still `Configured`, no
    /// session was started.
    pub fn run(&mut self) -> Result<SessionReport> {
        if self.state != AppState::Configured {
            return Err(Error::InvalidState("session already ran"));
        }
        self.stats.reset();
        let started = Instant::now();

        self.attach_sink()?;
        if let Err(e) = self.producer.start(self.config.rate) {
            let _ = self.manager.stop(false);
            return Err(e);
        }
        self.state = AppState::Running;
        log::info!("✓ Session running");

        let outcome = self.deliver();
        let graceful = match &outcome {
            Ok(StopReason::Requested) => self.stop.is_graceful(),
            Ok(StopReason::SampleLimitReached) => true,
            _ => false,
        };
        let files = self.teardown(graceful);
        self.state = AppState::Stopped;

        let report = SessionReport {
            reason: outcome?,
            stats: self.stats.snapshot(),
            files: files?,
            elapsed: started.elapsed(),
        };
        log_report(&report);
        Ok(report)
    }

    fn attach_sink(&mut self) -> Result<()> {
        let options = WireOptions {
            resolution: self.config.resolution,
            calibrated: self.config.use_calib,
            mask: self.config.channel_mask()?,
            adc_bits: self.producer.adc_bits(),
        };

        if self.config.use_file {
            let file = &self.config.file;
            let sink = FileSinkConfig {
                dir: file.dir.clone(),
                prefix: file.prefix.clone(),
                session: chrono::Local::now().format("%Y%m%d_%H%M%S").to_string(),
                format: self.config.format,
                layout: ContainerLayout {
                    options: WireOptions {
                        calibrated: file.calibrated,
                        ..options
                    },
                    sample_rate_hz: self.producer.base_rate_hz() / self.config.rate,
                },
                save_mode: self.config.save_mode,
                rotate_windows: file.rotate_windows,
                rotate_bytes: file.rotate_bytes,
                min_reserve_bytes: file.min_reserve_bytes,
                space_check_interval: Duration::from_millis(file.space_check_interval_ms),
                queue_depth: file.queue_depth,
                sample_limit: self.config.sample_limit(),
            };
            self.manager.attach_file(sink)
        } else {
            let transport_config = TransportConfig::from_stream_config(&self.config);
            log::info!(
                "Network sink: {:?} {:?} on {}",
                transport_config.protocol,
                transport_config.role,
                transport_config.addr
            );
            let transport = create_transport(transport_config, Arc::clone(&self.stats));
            self.manager
                .attach_network(transport, options, self.config.rate)
        }
    }

    /// Delivery loop; returns the first stop condition observed
    fn deliver(&mut self) -> Result<StopReason> {
        let mut last_stats = Instant::now();
        let mut last_index: Option<u64> = None;

        loop {
            if self.stop.is_requested() {
                return Ok(StopReason::Requested);
            }
            if let Some(reason) = self.manager.poll_status() {
                return Ok(reason);
            }
            if let Some(fault) = self.producer.fault() {
                return Ok(StopReason::HardwareFault(fault));
            }

            match self.producer.poll() {
                Some(window) => {
                    if let Some(last) = last_index
                        && window.index() <= last
                    {
                        log::warn!("Window {} arrived after {}", window.index(), last);
                    }
                    last_index = Some(window.index());
                    if let Some(reason) = self.submit(window)? {
                        return Ok(reason);
                    }
                }
                None => std::thread::sleep(IDLE_SLEEP),
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.log_statistics();
                last_stats = Instant::now();
            }
        }
    }

    /// Submit one window; a transport failure on send ends the session
    fn submit(&mut self, window: SampleWindow) -> Result<Option<StopReason>> {
        let calibration = *self.calibration.read();
        let index = window.index();
        match self.manager.submit(window, &calibration) {
            Ok(SubmitOutcome::Dropped) => {
                log::trace!("Window {} dropped by sink back-pressure", index);
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(Error::Encode(e)) => {
                log::warn!("Window {} not encoded: {}", index, e);
                Ok(None)
            }
            Err(Error::Transport(e)) => Ok(Some(StopReason::TransportFailed(e.to_string()))),
            Err(e) => Err(e),
        }
    }

    /// Stop the producer, drain one window if graceful, then close the sink
    fn teardown(&mut self, graceful: bool) -> Result<Option<FileSinkReport>> {
        log::info!("Stopping session (graceful: {})", graceful);
        let producer = self.producer.stop();

        if graceful && let Some(window) = self.producer.poll() {
            log::debug!("Draining final window {}", window.index());
            if let Err(e) = self.submit(window) {
                log::warn!("Final window not delivered: {}", e);
            }
        }

        let files = self.manager.stop(graceful);
        producer?;
        files
    }

    fn log_statistics(&self) {
        let s = self.stats.snapshot();
        log::info!(
            "Delivered {} windows ({} bytes), dropped {}, lost {} samples",
            s.windows_delivered,
            s.bytes_out,
            s.windows_dropped,
            s.lost_samples
        );
    }
}

fn log_report(report: &SessionReport) {
    let level = if report.is_failure() {
        log::Level::Error
    } else {
        log::Level::Info
    };
    log::log!(
        level,
        "Session ended after {:.1}s: {} ({} windows delivered, {} samples lost)",
        report.elapsed.as_secs_f64(),
        report.reason,
        report.stats.windows_delivered,
        report.stats.lost_samples
    );
    if let Some(files) = &report.files {
        for info in &files.files {
            log::info!(
                "  {}: {} windows, {} samples/channel, {} bytes",
                info.path.display(),
                info.windows,
                info.samples_per_channel,
                info.bytes
            );
        }
    }
}
