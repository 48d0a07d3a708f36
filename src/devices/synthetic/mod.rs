//! Hardware-free acquisition backend
//!
//! Generates one sine wave per channel plus Gaussian noise at
//! `base_rate_hz / decimation`. Windows are paced against the wall clock:
//!
//! | speed_factor | Window cadence |
//! |--------------|----------------|
//! | 1.0 | real time |
//! | 4.0 | four times faster |
//! | 0.0 | unpaced (as fast as the consumer of `capture` calls) |

use crate::config::DeviceConfig;
use crate::core::driver::AcquisitionBackend;
use crate::core::types::{Channel, ChannelMask};
use crate::error::{Error, Result};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::f64::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

/// Sine + noise signal source standing in for the ADC
pub struct SyntheticBackend {
    config: DeviceConfig,
    /// Seeded from `random_seed`; 0 draws from entropy
    rng: SmallRng,
    noise: Normal<f32>,
    decimation: u32,
    channels: ChannelMask,
    /// Samples generated so far (per channel)
    sample_clock: u64,
    phase: [f64; 2],
    next_deadline: Option<Instant>,
}

impl SyntheticBackend {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        if config.base_rate_hz == 0 {
            return Err(Error::Config("device.base_rate_hz must be positive".into()));
        }
        if !(8..=16).contains(&config.adc_bits) {
            return Err(Error::Config(format!("unsupported adc_bits {}", config.adc_bits)));
        }
        if config.speed_factor < 0.0 {
            return Err(Error::Config("device.speed_factor must not be negative".into()));
        }
        let noise = Normal::new(0.0, config.noise_stddev).map_err(|e| {
            Error::Config(format!("device.noise_stddev {}: {}", config.noise_stddev, e))
        })?;
        let mut rng = match config.random_seed {
            0 => SmallRng::from_entropy(),
            seed => SmallRng::seed_from_u64(seed),
        };
        let phase = [rng.gen_range(0.0..TAU), rng.gen_range(0.0..TAU)];
        Ok(Self {
            config,
            rng,
            noise,
            decimation: 1,
            channels: ChannelMask::BOTH,
            sample_clock: 0,
            phase,
            next_deadline: None,
        })
    }

    fn sample_rate(&self) -> f64 {
        self.config.base_rate_hz as f64 / self.decimation as f64
    }

    /// Sleep until the current window would be complete on real hardware
    fn pace(&mut self, samples: usize) {
        if self.config.speed_factor == 0.0 {
            return;
        }
        let period =
            Duration::from_secs_f64(samples as f64 / self.sample_rate() / self.config.speed_factor as f64);
        let now = Instant::now();
        let deadline = match self.next_deadline {
            Some(d) if d + period >= now => d + period,
            // Fell behind by more than a window: resynchronise
            _ => now + period,
        };
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline);
    }

    fn fill(&mut self, channel: Channel, buf: &mut [i16]) {
        let full_scale = (1i32 << (self.config.adc_bits - 1)) as f32;
        let (lo, hi) = (-full_scale, full_scale - 1.0);
        let amplitude = self.config.amplitude * full_scale;
        let omega = TAU * self.config.signal_hz[channel.index()] as f64 / self.sample_rate();
        let phase = self.phase[channel.index()];

        for (i, slot) in buf.iter_mut().enumerate() {
            let t = (self.sample_clock + i as u64) as f64;
            let clean = amplitude * (omega * t + phase).sin() as f32;
            let value = clean + self.noise.sample(&mut self.rng);
            *slot = value.round().clamp(lo, hi) as i16;
        }
    }
}

impl AcquisitionBackend for SyntheticBackend {
    fn configure(&mut self, decimation: u32, channels: ChannelMask) -> Result<()> {
        if decimation == 0 {
            return Err(Error::Config("decimation must be at least 1".into()));
        }
        self.decimation = decimation;
        self.channels = channels;
        self.sample_clock = 0;
        self.next_deadline = None;
        log::info!(
            "Synthetic backend: {:.1} Hz, channels mask {}, speed x{}",
            self.sample_rate(),
            channels.code(),
            self.config.speed_factor
        );
        Ok(())
    }

    fn capture(&mut self, ch1: &mut [i16], ch2: &mut [i16]) -> Result<()> {
        let len = ch1.len().max(ch2.len());
        self.pace(len);
        if self.channels.contains(Channel::Ch1) {
            self.fill(Channel::Ch1, ch1);
        }
        if self.channels.contains(Channel::Ch2) {
            self.fill(Channel::Ch2, ch2);
        }
        self.sample_clock += len as u64;
        Ok(())
    }

    fn base_rate_hz(&self) -> u32 {
        self.config.base_rate_hz
    }

    fn adc_bits(&self) -> u8 {
        self.config.adc_bits
    }

    fn release(&mut self) {
        log::debug!("Synthetic backend released after {} samples", self.sample_clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced(seed: u64) -> DeviceConfig {
        DeviceConfig {
            speed_factor: 0.0,
            random_seed: seed,
            base_rate_hz: 1_000_000,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_samples_within_adc_range() {
        let mut backend = SyntheticBackend::new(DeviceConfig {
            amplitude: 2.0,
            ..unpaced(3)
        })
        .unwrap();
        backend.configure(1, ChannelMask::BOTH).unwrap();
        let (mut a, mut b) = (vec![0i16; 4096], vec![0i16; 4096]);
        backend.capture(&mut a, &mut b).unwrap();
        assert!(a.iter().chain(b.iter()).all(|&s| (-8192..8192).contains(&s)));
        assert!(a.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_seeded_output_is_reproducible() {
        let mut x = SyntheticBackend::new(unpaced(11)).unwrap();
        let mut y = SyntheticBackend::new(unpaced(11)).unwrap();
        x.configure(8, ChannelMask::CH1).unwrap();
        y.configure(8, ChannelMask::CH1).unwrap();
        let (mut a1, mut a2) = (vec![0i16; 256], Vec::new());
        let (mut b1, mut b2) = (vec![0i16; 256], Vec::new());
        x.capture(&mut a1, &mut a2).unwrap();
        y.capture(&mut b1, &mut b2).unwrap();
        assert_eq!(a1, b1);
    }

    #[test]
    fn test_pacing_follows_sample_rate() {
        // 1000 samples at 100 kHz = 10 ms per window
        let mut backend = SyntheticBackend::new(DeviceConfig {
            base_rate_hz: 100_000,
            speed_factor: 1.0,
            ..unpaced(5)
        })
        .unwrap();
        backend.configure(1, ChannelMask::BOTH).unwrap();
        let (mut a, mut b) = (vec![0i16; 1000], vec![0i16; 1000]);
        let start = Instant::now();
        for _ in 0..5 {
            backend.capture(&mut a, &mut b).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_noise_only_spread_tracks_stddev() {
        let mut backend = SyntheticBackend::new(DeviceConfig {
            amplitude: 0.0,
            noise_stddev: 20.0,
            ..unpaced(17)
        })
        .unwrap();
        backend.configure(1, ChannelMask::CH1).unwrap();
        let (mut a, mut b) = (vec![0i16; 8192], Vec::new());
        backend.capture(&mut a, &mut b).unwrap();

        let n = a.len() as f64;
        let mean = a.iter().map(|&s| s as f64).sum::<f64>() / n;
        let var = a.iter().map(|&s| (s as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 2.0, "mean {}", mean);
        assert!((15.0..25.0).contains(&var.sqrt()), "stddev {}", var.sqrt());
    }

    #[test]
    fn test_silent_without_noise_or_signal() {
        let mut backend = SyntheticBackend::new(DeviceConfig {
            amplitude: 0.0,
            noise_stddev: 0.0,
            ..unpaced(2)
        })
        .unwrap();
        backend.configure(1, ChannelMask::BOTH).unwrap();
        let (mut a, mut b) = (vec![7i16; 512], vec![7i16; 512]);
        backend.capture(&mut a, &mut b).unwrap();
        assert!(a.iter().chain(b.iter()).all(|&s| s == 0));
    }

    #[test]
    fn test_negative_noise_rejected() {
        let config = DeviceConfig {
            noise_stddev: -1.0,
            ..unpaced(1)
        };
        assert!(matches!(SyntheticBackend::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_decimation_rejected() {
        let mut backend = SyntheticBackend::new(unpaced(1)).unwrap();
        assert!(backend.configure(0, ChannelMask::BOTH).is_err());
    }
}
