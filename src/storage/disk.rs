//! Disk admission control
//!
//! Advisory: the destination volume is probed at most once per interval
//! (and before every file rotation); between probes the bytes this session
//! wrote are subtracted from the last reading. A write is admitted only if
//! it leaves at least `min_reserve_bytes` free.

use crate::error::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Free-space source for a directory
pub trait SpaceProbe: Send {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by `statvfs` / `GetDiskFreeSpaceEx`
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2Probe;

impl SpaceProbe for Fs2Probe {
    fn available(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Free space against the configured reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskBudget {
    pub free_bytes: u64,
    pub min_reserve_bytes: u64,
}

impl DiskBudget {
    /// True if writing `bytes` keeps the reserve intact
    pub fn admits(&self, bytes: u64) -> bool {
        self.free_bytes >= self.min_reserve_bytes.saturating_add(bytes)
    }
}

/// Admission control for one destination directory
pub struct DiskAdmission {
    dir: PathBuf,
    min_reserve_bytes: u64,
    interval: Duration,
    probe: Box<dyn SpaceProbe>,
    /// Last probe time and reading
    last: Option<(Instant, u64)>,
    written_since_probe: u64,
}

impl DiskAdmission {
    pub fn new(dir: impl Into<PathBuf>, min_reserve_bytes: u64, interval: Duration) -> Self {
        Self::with_probe(dir, min_reserve_bytes, interval, Box::new(Fs2Probe))
    }

    pub fn with_probe(
        dir: impl Into<PathBuf>,
        min_reserve_bytes: u64,
        interval: Duration,
        probe: Box<dyn SpaceProbe>,
    ) -> Self {
        Self {
            dir: dir.into(),
            min_reserve_bytes,
            interval,
            probe,
            last: None,
            written_since_probe: 0,
        }
    }

    /// Probe the volume now
    pub fn refresh(&mut self) -> Result<DiskBudget> {
        let free = self.probe.available(&self.dir)?;
        self.last = Some((Instant::now(), free));
        self.written_since_probe = 0;
        log::debug!("{}: {} bytes free", self.dir.display(), free);
        Ok(DiskBudget {
            free_bytes: free,
            min_reserve_bytes: self.min_reserve_bytes,
        })
    }

    /// Current estimate, probing if the interval has elapsed
    pub fn budget(&mut self) -> Result<DiskBudget> {
        match self.last {
            Some((at, free)) if at.elapsed() < self.interval => Ok(DiskBudget {
                free_bytes: free.saturating_sub(self.written_since_probe),
                min_reserve_bytes: self.min_reserve_bytes,
            }),
            _ => self.refresh(),
        }
    }

    /// Admit a write of `bytes` or fail with `DiskExhausted`
    pub fn admit(&mut self, bytes: u64) -> Result<DiskBudget> {
        let budget = self.budget()?;
        if budget.admits(bytes) {
            Ok(budget)
        } else {
            Err(Error::DiskExhausted {
                free_bytes: budget.free_bytes,
                min_reserve_bytes: budget.min_reserve_bytes,
            })
        }
    }

    pub fn record_written(&mut self, bytes: u64) {
        self.written_since_probe += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeProbe {
        free: Arc<AtomicU64>,
        probes: Arc<AtomicU64>,
    }

    impl SpaceProbe for FakeProbe {
        fn available(&self, _path: &Path) -> io::Result<u64> {
            self.probes.fetch_add(1, Ordering::Relaxed);
            Ok(self.free.load(Ordering::Relaxed))
        }
    }

    fn admission(free: u64, reserve: u64, interval: Duration) -> (DiskAdmission, Arc<AtomicU64>) {
        let probes = Arc::new(AtomicU64::new(0));
        let probe = FakeProbe {
            free: Arc::new(AtomicU64::new(free)),
            probes: Arc::clone(&probes),
        };
        (
            DiskAdmission::with_probe("/data", reserve, interval, Box::new(probe)),
            probes,
        )
    }

    #[test]
    fn test_budget_admits() {
        let budget = DiskBudget {
            free_bytes: 1000,
            min_reserve_bytes: 600,
        };
        assert!(budget.admits(400));
        assert!(!budget.admits(401));
        let full = DiskBudget {
            free_bytes: u64::MAX - 1,
            min_reserve_bytes: u64::MAX,
        };
        assert!(!full.admits(0));
    }

    #[test]
    fn test_written_bytes_reduce_estimate_between_probes() {
        let (mut disk, probes) = admission(10_000, 1_000, Duration::from_secs(60));
        disk.admit(5_000).unwrap();
        disk.record_written(5_000);
        assert!(matches!(
            disk.admit(5_000),
            Err(Error::DiskExhausted { free_bytes: 5_000, min_reserve_bytes: 1_000 })
        ));
        assert_eq!(probes.load(Ordering::Relaxed), 1);

        disk.refresh().unwrap();
        assert_eq!(probes.load(Ordering::Relaxed), 2);
        disk.admit(5_000).unwrap();
    }

    #[test]
    fn test_zero_interval_probes_every_time() {
        let (mut disk, probes) = admission(10_000, 0, Duration::ZERO);
        for _ in 0..3 {
            disk.admit(10).unwrap();
        }
        assert_eq!(probes.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_real_probe_on_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut disk = DiskAdmission::new(dir.path(), 0, Duration::from_secs(1));
        assert!(disk.refresh().unwrap().free_bytes > 0);
        assert!(disk.admit(u64::MAX).is_err());
    }
}
