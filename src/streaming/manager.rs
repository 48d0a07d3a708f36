//! Single-sink delivery manager
//!
//! ```text
//! Idle ──attach_network / attach_file──▶ Streaming ──stop──▶ Stopping ──▶ Idle
//! ```
//!
//! `submit` is the only entry point for windows. It encodes for the active
//! sink and hands the result over without blocking; when the sink pushes
//! back the window is dropped and counted as lost. Asynchronous sink
//! failures (transport errors, disk exhaustion, sample limit) arrive on an
//! internal event channel and are surfaced by `poll_status`.

use crate::core::calibration::CalibrationSnapshot;
use crate::core::stats::SessionStats;
use crate::core::types::{SampleWindow, StopReason};
use crate::error::{Error, Result};
use crate::storage::sink::SinkStatus;
use crate::storage::{FileSink, FileSinkConfig, FileSinkReport};
use crate::streaming::transport::{OutboundPacket, SendStatus, Transport};
use crate::streaming::wire::{self, WireOptions};

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;

/// Manager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Streaming,
    Stopping,
}

/// What `submit` did with a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the sink
    Delivered,
    /// Sink pushed back; samples counted as lost
    Dropped,
    /// No peer yet, or the sink already finished; not counted
    Skipped,
}

struct NetworkSink {
    transport: Box<dyn Transport>,
    options: WireOptions,
    sample_rate_code: u32,
    /// Loss counter value carried by the last sent packet
    reported_loss: u64,
    waiting_logged: bool,
}

enum Sink {
    Network(NetworkSink),
    File(FileSink),
}

/// Owns exactly one active sink per session
pub struct StreamingManager {
    state: ManagerState,
    sink: Option<Sink>,
    stats: Arc<SessionStats>,
    events_tx: Sender<StopReason>,
    events_rx: Receiver<StopReason>,
}

impl StreamingManager {
    pub fn new(stats: Arc<SessionStats>) -> Self {
        let (events_tx, events_rx) = bounded(8);
        Self {
            state: ManagerState::Idle,
            sink: None,
            stats,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    fn check_idle(&self) -> Result<()> {
        if self.state != ManagerState::Idle || self.sink.is_some() {
            return Err(Error::InvalidState("a sink is already attached"));
        }
        Ok(())
    }

    /// Start streaming through a network transport
    pub fn attach_network(
        &mut self,
        mut transport: Box<dyn Transport>,
        options: WireOptions,
        sample_rate_code: u32,
    ) -> Result<()> {
        self.check_idle()?;
        while self.events_rx.try_recv().is_ok() {}

        let events = self.events_tx.clone();
        transport.on_error(Box::new(move |e| {
            let _ = events.try_send(StopReason::TransportFailed(e.to_string()));
        }));
        transport.on_connect(Box::new(|peer| {
            log::info!("Streaming to {}", peer);
        }));
        transport.start()?;

        self.sink = Some(Sink::Network(NetworkSink {
            transport,
            options,
            sample_rate_code,
            reported_loss: self.stats.lost_samples(),
            waiting_logged: false,
        }));
        self.state = ManagerState::Streaming;
        Ok(())
    }

    /// Start writing to files
    pub fn attach_file(&mut self, config: FileSinkConfig) -> Result<()> {
        self.check_idle()?;
        while self.events_rx.try_recv().is_ok() {}

        let sink = FileSink::start(config, Arc::clone(&self.stats), self.events_tx.clone())?;
        self.sink = Some(Sink::File(sink));
        self.state = ManagerState::Streaming;
        Ok(())
    }

    /// Encode and forward one window without blocking
    pub fn submit(
        &mut self,
        window: SampleWindow,
        calibration: &CalibrationSnapshot,
    ) -> Result<SubmitOutcome> {
        if self.state != ManagerState::Streaming {
            return Err(Error::InvalidState("manager is not streaming"));
        }
        let samples = window.len() as u64;
        match self.sink.as_mut() {
            Some(Sink::Network(net)) => submit_network(net, &self.stats, &window, calibration),
            Some(Sink::File(file)) => match file.try_submit(window, *calibration) {
                SinkStatus::Queued => Ok(SubmitOutcome::Delivered),
                SinkStatus::Backpressure => {
                    self.stats.record_dropped_window(samples);
                    Ok(SubmitOutcome::Dropped)
                }
                SinkStatus::Closed => Ok(SubmitOutcome::Skipped),
            },
            None => Err(Error::InvalidState("no sink attached")),
        }
    }

    /// First terminal condition reported by the sink, if any
    pub fn poll_status(&self) -> Option<StopReason> {
        self.events_rx.try_recv().ok()
    }

    /// Network sink has a peer (always true for the file sink)
    pub fn is_ready(&self) -> bool {
        match &self.sink {
            Some(Sink::Network(net)) => net.transport.is_connected(),
            Some(Sink::File(_)) => true,
            None => false,
        }
    }

    /// Local address of the network sink
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.sink {
            Some(Sink::Network(net)) => net.transport.local_addr(),
            _ => None,
        }
    }

    /// Tear the sink down; a graceful stop writes everything already queued
    pub fn stop(&mut self, graceful: bool) -> Result<Option<FileSinkReport>> {
        let Some(sink) = self.sink.take() else {
            self.state = ManagerState::Idle;
            return Ok(None);
        };
        self.state = ManagerState::Stopping;
        let report = match sink {
            Sink::Network(mut net) => {
                if graceful {
                    net.transport.stop();
                } else {
                    net.transport.abort();
                }
                None
            }
            Sink::File(file) => {
                let report = if graceful { file.finish() } else { file.abort() };
                Some(report?)
            }
        };
        self.state = ManagerState::Idle;
        log::info!("Streaming manager stopped (graceful: {})", graceful);
        Ok(report)
    }
}

fn submit_network(
    net: &mut NetworkSink,
    stats: &SessionStats,
    window: &SampleWindow,
    calibration: &CalibrationSnapshot,
) -> Result<SubmitOutcome> {
    let samples = window.len() as u64;
    if !net.transport.is_connected() {
        if !net.waiting_logged {
            log::info!("No peer connected; windows are discarded until one arrives");
            net.waiting_logged = true;
        }
        log::trace!("Window {} skipped: no peer", window.index());
        return Ok(SubmitOutcome::Skipped);
    }
    net.waiting_logged = false;

    let loss = stats.lost_samples();
    let lost_count = loss.saturating_sub(net.reported_loss);
    let bytes = match wire::encode(
        window,
        calibration,
        &net.options,
        net.sample_rate_code,
        window.index(),
        lost_count,
    ) {
        Ok(bytes) => bytes,
        Err(e) => {
            stats.record_dropped_window(samples);
            return Err(e);
        }
    };

    match net.transport.send(OutboundPacket { bytes, samples })? {
        SendStatus::Queued => {
            net.reported_loss = loss;
            Ok(SubmitOutcome::Delivered)
        }
        SendStatus::Backpressure => {
            stats.record_dropped_window(samples);
            Ok(SubmitOutcome::Dropped)
        }
        SendStatus::NotConnected => Ok(SubmitOutcome::Skipped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaveMode;
    use crate::core::types::{ChannelMask, Resolution};
    use crate::error::TransportError;
    use crate::storage::{ContainerFormat, ContainerLayout};
    use crate::streaming::transport::{ConnectCallback, ErrorCallback, ReceiveCallback};
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-memory transport with a fixed queue capacity
    struct LoopbackTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        capacity: usize,
        connected: bool,
        error: Option<ErrorCallback>,
        /// How the manager shut us down
        ended: Arc<Mutex<Option<&'static str>>>,
    }

    impl Transport for LoopbackTransport {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn send(&self, packet: OutboundPacket) -> std::result::Result<SendStatus, TransportError> {
            if !self.connected {
                return Ok(SendStatus::NotConnected);
            }
            let mut sent = self.sent.lock();
            if sent.len() >= self.capacity {
                return Ok(SendStatus::Backpressure);
            }
            sent.push(packet.bytes);
            Ok(SendStatus::Queued)
        }

        fn on_receive(&mut self, _callback: ReceiveCallback) {}

        fn on_error(&mut self, callback: ErrorCallback) {
            self.error = Some(callback);
        }

        fn on_connect(&mut self, _callback: ConnectCallback) {}

        fn stop(&mut self) {
            if let Some(cb) = self.error.as_mut() {
                cb(TransportError::ConnectionLost("stopped".into()));
            }
            self.error = None;
            self.ended.lock().get_or_insert("stop");
        }

        fn abort(&mut self) {
            *self.ended.lock() = Some("abort");
            self.stop();
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn options() -> WireOptions {
        WireOptions {
            resolution: Resolution::Bits16,
            calibrated: false,
            mask: ChannelMask::BOTH,
            adc_bits: 14,
        }
    }

    fn window(index: u64) -> SampleWindow {
        SampleWindow::new(index, ChannelMask::BOTH, vec![3; 16], vec![4; 16])
    }

    fn loopback(capacity: usize, connected: bool) -> (Box<dyn Transport>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = LoopbackTransport {
            sent: Arc::clone(&sent),
            capacity,
            connected,
            error: None,
            ended: Arc::new(Mutex::new(None)),
        };
        (Box::new(transport), sent)
    }

    #[test]
    fn test_backpressure_counts_loss_and_reports_delta() {
        let stats = Arc::new(SessionStats::new());
        let mut manager = StreamingManager::new(Arc::clone(&stats));
        let (transport, sent) = loopback(2, true);
        manager.attach_network(transport, options(), 8).unwrap();
        let calib = CalibrationSnapshot::default();

        assert_eq!(manager.submit(window(0), &calib).unwrap(), SubmitOutcome::Delivered);
        stats.record_loss(100);
        assert_eq!(manager.submit(window(1), &calib).unwrap(), SubmitOutcome::Delivered);
        assert_eq!(manager.submit(window(2), &calib).unwrap(), SubmitOutcome::Dropped);
        assert_eq!(stats.lost_samples(), 116);

        let packets = sent.lock().clone();
        let first = wire::decode(&packets[0]).unwrap();
        let second = wire::decode(&packets[1]).unwrap();
        assert_eq!((first.header.id, first.header.lost_count), (0, 0));
        assert_eq!((second.header.id, second.header.lost_count), (1, 100));
        assert_eq!(second.header.sample_rate_code, 8);

        // The dropped window's loss rides on the next packet
        sent.lock().clear();
        manager.submit(window(3), &calib).unwrap();
        let third = wire::decode(&sent.lock()[0]).unwrap().header;
        assert_eq!((third.id, third.lost_count), (3, 16));
    }

    #[test]
    fn test_no_peer_skips_without_loss() {
        let stats = Arc::new(SessionStats::new());
        let mut manager = StreamingManager::new(Arc::clone(&stats));
        let (transport, _sent) = loopback(4, false);
        manager.attach_network(transport, options(), 1).unwrap();
        assert!(!manager.is_ready());
        let outcome = manager.submit(window(0), &CalibrationSnapshot::default()).unwrap();
        assert_eq!(outcome, SubmitOutcome::Skipped);
        assert_eq!(stats.lost_samples(), 0);
    }

    #[test]
    fn test_single_active_sink() {
        let dir = TempDir::new().unwrap();
        let mut manager = StreamingManager::new(Arc::new(SessionStats::new()));
        let (transport, _sent) = loopback(4, true);
        manager.attach_network(transport, options(), 1).unwrap();

        let file_config = FileSinkConfig {
            dir: dir.path().to_path_buf(),
            prefix: "x".into(),
            session: "s".into(),
            format: ContainerFormat::Simple,
            layout: ContainerLayout {
                options: options(),
                sample_rate_hz: 1000,
            },
            save_mode: SaveMode::Single,
            rotate_windows: 0,
            rotate_bytes: 0,
            min_reserve_bytes: 0,
            space_check_interval: Duration::from_secs(1),
            queue_depth: 4,
            sample_limit: None,
        };
        assert!(matches!(
            manager.attach_file(file_config),
            Err(Error::InvalidState(_))
        ));
        manager.stop(true).unwrap();
        assert_eq!(manager.state(), ManagerState::Idle);
        assert!(matches!(
            manager.submit(window(0), &CalibrationSnapshot::default()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_transport_error_surfaces_as_stop_reason() {
        let mut manager = StreamingManager::new(Arc::new(SessionStats::new()));
        let (transport, _sent) = loopback(4, true);
        manager.attach_network(transport, options(), 1).unwrap();
        assert!(manager.poll_status().is_none());
        manager.stop(false).unwrap();
        assert!(matches!(
            manager.poll_status(),
            Some(StopReason::TransportFailed(_))
        ));
    }

    #[test]
    fn test_stop_mode_selects_drain_or_abort() {
        for (graceful, expected) in [(true, "stop"), (false, "abort")] {
            let ended = Arc::new(Mutex::new(None));
            let transport = LoopbackTransport {
                sent: Arc::new(Mutex::new(Vec::new())),
                capacity: 4,
                connected: true,
                error: None,
                ended: Arc::clone(&ended),
            };
            let mut manager = StreamingManager::new(Arc::new(SessionStats::new()));
            manager.attach_network(Box::new(transport), options(), 1).unwrap();
            manager.stop(graceful).unwrap();
            assert_eq!(*ended.lock(), Some(expected));
        }
    }
}
