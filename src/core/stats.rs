//! Per-session counters shared between the capture, delivery, and I/O threads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Session context counters
///
/// `lost_samples` is the only value written from more than one thread
/// (producer overwrites, sink back-pressure, failed datagram sends), so
/// every field is atomic and updated with relaxed increments.
#[derive(Debug, Default)]
pub struct SessionStats {
    lost_samples: AtomicU64,
    windows_delivered: AtomicU64,
    windows_dropped: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub lost_samples: u64,
    pub windows_delivered: u64,
    pub windows_dropped: u64,
    pub bytes_out: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count samples that never reached the sink
    #[inline]
    pub fn record_loss(&self, samples: u64) {
        self.lost_samples.fetch_add(samples, Ordering::Relaxed);
    }

    /// Count a window dropped before encoding or sending
    #[inline]
    pub fn record_dropped_window(&self, samples: u64) {
        self.windows_dropped.fetch_add(1, Ordering::Relaxed);
        self.record_loss(samples);
    }

    #[inline]
    pub fn record_delivered(&self, bytes: u64) {
        self.windows_delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn lost_samples(&self) -> u64 {
        self.lost_samples.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            windows_delivered: self.windows_delivered.load(Ordering::Relaxed),
            windows_dropped: self.windows_dropped.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters; only called at session start
    pub fn reset(&self) {
        self.lost_samples.store(0, Ordering::Relaxed);
        self.windows_delivered.store(0, Ordering::Relaxed);
        self.windows_dropped.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_loss_increments() {
        let stats = Arc::new(SessionStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        s.record_loss(3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.lost_samples(), 12_000);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let stats = SessionStats::new();
        stats.record_delivered(100);
        stats.record_dropped_window(16);
        let snap = stats.snapshot();
        assert_eq!(snap.windows_delivered, 1);
        assert_eq!(snap.windows_dropped, 1);
        assert_eq!(snap.bytes_out, 100);
        assert_eq!(snap.lost_samples, 16);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
