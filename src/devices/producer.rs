//! Sample producer: the hardware-paced capture thread
//!
//! The capture thread owns the backend and writes each window into a
//! private buffer, then publishes it into a small lock-free ring with
//! `force_push`. It never waits for the consumer: when the ring is full the
//! oldest unconsumed window is displaced, its samples are added to the loss
//! counter, and its allocation is reused for the next capture.
//!
//! ```text
//! acq-capture thread                     delivery loop
//! ┌──────────────────┐  force_push   ┌─────────────┐  pop   ┌──────────┐
//! │ backend.capture  │──────────────▶│ ring (2)    │───────▶│ poll()   │
//! │ compute_stats    │◀── displaced ─└─────────────┘        └──────────┘
//! └──────────────────┘    (loss)
//! ```

use crate::core::calibration::CalibrationSnapshot;
use crate::core::driver::AcquisitionBackend;
use crate::core::stats::SessionStats;
use crate::core::types::{ChannelMask, SampleWindow, WINDOW_CAPACITY};
use crate::error::{Error, Result};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Published windows held for the consumer
pub const DEFAULT_RING_DEPTH: usize = 2;

/// State shared with the capture thread
struct Shared {
    ring: ArrayQueue<SampleWindow>,
    calibration: RwLock<CalibrationSnapshot>,
    fault: Mutex<Option<String>>,
    shutdown: AtomicBool,
    stats: Arc<SessionStats>,
}

/// Drives an [`AcquisitionBackend`] on a dedicated thread
pub struct SampleProducer {
    shared: Arc<Shared>,
    backend: Option<Box<dyn AcquisitionBackend>>,
    handle: Option<JoinHandle<Box<dyn AcquisitionBackend>>>,
    window_samples: usize,
    channels: ChannelMask,
    adc_bits: u8,
    base_rate_hz: u32,
}

impl SampleProducer {
    pub fn new(
        backend: Box<dyn AcquisitionBackend>,
        window_samples: usize,
        channels: ChannelMask,
        stats: Arc<SessionStats>,
    ) -> Result<Self> {
        Self::with_ring_depth(backend, window_samples, channels, stats, DEFAULT_RING_DEPTH)
    }

    pub fn with_ring_depth(
        backend: Box<dyn AcquisitionBackend>,
        window_samples: usize,
        channels: ChannelMask,
        stats: Arc<SessionStats>,
        depth: usize,
    ) -> Result<Self> {
        if window_samples == 0 || window_samples > WINDOW_CAPACITY {
            return Err(Error::Config(format!(
                "window of {} samples outside 1..={}",
                window_samples, WINDOW_CAPACITY
            )));
        }
        if depth == 0 {
            return Err(Error::Config("producer ring depth must be at least 1".into()));
        }
        let adc_bits = backend.adc_bits();
        let base_rate_hz = backend.base_rate_hz();
        Ok(Self {
            shared: Arc::new(Shared {
                ring: ArrayQueue::new(depth),
                calibration: RwLock::new(CalibrationSnapshot::default()),
                fault: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                stats,
            }),
            backend: Some(backend),
            handle: None,
            window_samples,
            channels,
            adc_bits,
            base_rate_hz,
        })
    }

    /// Configure the backend and start the capture thread
    pub fn start(&mut self, decimation: u32) -> Result<()> {
        let mut backend = self
            .backend
            .take()
            .ok_or(Error::InvalidState("producer already running"))?;

        if let Err(e) = backend.configure(decimation, self.channels) {
            self.backend = Some(backend);
            return Err(e);
        }

        // Stale windows from a previous run are not part of this session
        while self.shared.ring.pop().is_some() {}
        *self.shared.fault.lock() = None;
        self.shared.shutdown.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let (len, mask, adc_bits) = (self.window_samples, self.channels, self.adc_bits);
        let handle = thread::Builder::new()
            .name("acq-capture".to_string())
            .spawn(move || capture_loop(backend, shared, len, mask, adc_bits))
            .map_err(|e| Error::Other(format!("Failed to spawn capture thread: {}", e)))?;

        self.handle = Some(handle);
        log::info!(
            "Producer started: decimation {}, {} samples/window, channels mask {}",
            decimation,
            self.window_samples,
            self.channels.code()
        );
        Ok(())
    }

    /// Signal the capture thread and join it
    pub fn stop(&mut self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let backend = handle
                .join()
                .map_err(|_| Error::ThreadPanic("acq-capture"))?;
            self.backend = Some(backend);
            log::info!("Producer stopped");
        }
        Ok(())
    }

    /// Oldest unconsumed window, or `None` if nothing new has been published
    #[inline]
    pub fn poll(&self) -> Option<SampleWindow> {
        self.shared.ring.pop()
    }

    /// Hardware fault that ended capture, if any
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Replace the snapshot used for per-window voltage statistics
    pub fn set_calibration(&self, calibration: CalibrationSnapshot) {
        *self.shared.calibration.write() = calibration;
    }

    pub fn adc_bits(&self) -> u8 {
        self.adc_bits
    }

    pub fn base_rate_hz(&self) -> u32 {
        self.base_rate_hz
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }
}

impl Drop for SampleProducer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn capture_loop(
    mut backend: Box<dyn AcquisitionBackend>,
    shared: Arc<Shared>,
    len: usize,
    mask: ChannelMask,
    adc_bits: u8,
) -> Box<dyn AcquisitionBackend> {
    let mut index = 0u64;
    let mut scratch = SampleWindow::zeroed(mask, len);
    let mut overwrites = 0u64;

    while !shared.shutdown.load(Ordering::Acquire) {
        let (ch1, ch2) = scratch.recycle(index);
        if let Err(e) = backend.capture(ch1, ch2) {
            log::error!("Capture failed at window {}: {}", index, e);
            *shared.fault.lock() = Some(e.to_string());
            break;
        }

        let calibration = *shared.calibration.read();
        scratch.compute_stats(&calibration, adc_bits);

        scratch = match shared.ring.force_push(scratch) {
            Some(displaced) => {
                shared.stats.record_loss(displaced.len() as u64);
                overwrites += 1;
                if overwrites % 100 == 1 {
                    log::debug!(
                        "Window {} overwritten before consumption ({} total)",
                        displaced.index(),
                        overwrites
                    );
                }
                displaced
            }
            None => SampleWindow::zeroed(mask, len),
        };
        index += 1;
    }

    backend.release();
    log::debug!(
        "Capture thread exiting after {} windows ({} overwritten)",
        index,
        overwrites
    );
    backend
}
