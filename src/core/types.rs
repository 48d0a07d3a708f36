//! Core data types shared by the producer, codecs, and sinks.
//!
//! Key types:
//! - [`SampleWindow`]: one decimation-period capture, handed between stages by value
//! - [`Resolution`] / [`ChannelMask`]: per-session encoding parameters
//! - [`StopReason`]: terminal cause of a session

use crate::core::calibration::CalibrationSnapshot;
use std::fmt;

/// Maximum samples per channel in one window (hardware buffer size)
pub const WINDOW_CAPACITY: usize = 16384;

/// Acquisition channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ch1,
    Ch2,
}

impl Channel {
    /// Both channels in index order
    pub const ALL: [Channel; 2] = [Channel::Ch1, Channel::Ch2];

    /// Zero-based channel index
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Channel::Ch1 => 0,
            Channel::Ch2 => 1,
        }
    }
}

/// Bit depth of transmitted/stored samples, fixed for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// One byte per sample (top 8 bits of the ADC code)
    Bits8,
    /// Raw 16-bit codes
    #[default]
    Bits16,
}

impl Resolution {
    /// Wire value of the resolution field
    pub fn bits(self) -> u32 {
        match self {
            Resolution::Bits8 => 8,
            Resolution::Bits16 => 16,
        }
    }

    /// Parse the wire value
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Resolution::Bits8),
            16 => Some(Resolution::Bits16),
            _ => None,
        }
    }

    /// Encoded bytes per sample
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Resolution::Bits8 => 1,
            Resolution::Bits16 => 2,
        }
    }

    /// Compress an ADC code to an 8-bit value (keeps the most significant bits)
    #[inline]
    pub fn compress(code: i16, adc_bits: u8) -> i8 {
        let shift = adc_bits.saturating_sub(8).min(8);
        (code >> shift).clamp(i8::MIN as i16, i8::MAX as i16) as i8
    }

    /// Expand an 8-bit value back to ADC code scale
    #[inline]
    pub fn expand(value: i8, adc_bits: u8) -> i16 {
        let shift = adc_bits.saturating_sub(8).min(8);
        (value as i16) << shift
    }
}

/// Enabled-channel mask: 1 = CH1, 2 = CH2, 3 = both
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMask(u8);

impl ChannelMask {
    pub const CH1: ChannelMask = ChannelMask(0b01);
    pub const CH2: ChannelMask = ChannelMask(0b10);
    pub const BOTH: ChannelMask = ChannelMask(0b11);

    /// Build from the configuration code (1, 2 or 3)
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1..=3 => Some(ChannelMask(code)),
            _ => None,
        }
    }

    /// Configuration code (1, 2 or 3)
    pub fn code(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn contains(self, channel: Channel) -> bool {
        self.0 & (1 << channel.index()) != 0
    }

    /// Enabled channels in index order
    pub fn channels(self) -> impl Iterator<Item = Channel> {
        Channel::ALL.into_iter().filter(move |&c| self.contains(c))
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }
}

impl Default for ChannelMask {
    fn default() -> Self {
        ChannelMask::BOTH
    }
}

/// Per-window statistics for one channel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelStats {
    pub min_raw: i32,
    pub max_raw: i32,
    pub avg_raw: i32,
    pub min_volts: f32,
    pub max_volts: f32,
    pub avg_volts: f32,
}

impl ChannelStats {
    /// Compute raw and calibrated min/max/average over a channel buffer
    pub fn compute(
        samples: &[i16],
        channel: Channel,
        calibration: &CalibrationSnapshot,
        adc_bits: u8,
    ) -> Option<Self> {
        let first = *samples.first()? as i32;
        let (mut min, mut max, mut sum) = (first, first, 0i64);
        for &s in samples {
            let s = s as i32;
            min = min.min(s);
            max = max.max(s);
            sum += s as i64;
        }
        let avg = (sum / samples.len() as i64) as i32;

        Some(Self {
            min_raw: min,
            max_raw: max,
            avg_raw: avg,
            min_volts: calibration.to_volts(channel, min, adc_bits),
            max_volts: calibration.to_volts(channel, max, adc_bits),
            avg_volts: calibration.to_volts(channel, avg, adc_bits),
        })
    }
}

/// One decimation-period capture across the enabled channels
///
/// Owned by exactly one stage at a time; moved, never shared.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    index: u64,
    mask: ChannelMask,
    samples: [Vec<i16>; 2],
    stats: [Option<ChannelStats>; 2],
}

impl SampleWindow {
    /// Build a window from per-channel sample buffers
    ///
    /// Buffers of disabled channels are dropped.
    pub fn new(index: u64, mask: ChannelMask, ch1: Vec<i16>, ch2: Vec<i16>) -> Self {
        let ch1 = if mask.contains(Channel::Ch1) { ch1 } else { Vec::new() };
        let ch2 = if mask.contains(Channel::Ch2) { ch2 } else { Vec::new() };
        Self {
            index,
            mask,
            samples: [ch1, ch2],
            stats: [None, None],
        }
    }

    /// Zero-filled window with `len` samples per enabled channel
    pub fn zeroed(mask: ChannelMask, len: usize) -> Self {
        let len = len.min(WINDOW_CAPACITY);
        Self::new(0, mask, vec![0; len], vec![0; len])
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn mask(&self) -> ChannelMask {
        self.mask
    }

    /// Samples of one channel, `None` when it is disabled
    pub fn channel(&self, channel: Channel) -> Option<&[i16]> {
        if self.mask.contains(channel) {
            Some(&self.samples[channel.index()])
        } else {
            None
        }
    }

    pub fn stats(&self, channel: Channel) -> Option<&ChannelStats> {
        self.stats[channel.index()].as_ref()
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.mask
            .channels()
            .map(|c| self.samples[c.index()].len())
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute statistics for every enabled channel
    pub fn compute_stats(&mut self, calibration: &CalibrationSnapshot, adc_bits: u8) {
        for channel in Channel::ALL {
            self.stats[channel.index()] = if self.mask.contains(channel) {
                ChannelStats::compute(&self.samples[channel.index()], channel, calibration, adc_bits)
            } else {
                None
            };
        }
    }

    /// Reuse this window's allocation for the next capture
    pub(crate) fn recycle(&mut self, index: u64) -> (&mut [i16], &mut [i16]) {
        self.index = index;
        self.stats = [None, None];
        let [ch1, ch2] = &mut self.samples;
        (ch1.as_mut_slice(), ch2.as_mut_slice())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stop requested by the operator or a signal
    Requested,
    /// File sink wrote the configured number of samples
    SampleLimitReached,
    /// Acquisition hardware failed
    HardwareFault(String),
    /// Network peer lost or unreachable
    TransportFailed(String),
    /// Destination volume ran below its reserve
    DiskExhausted(String),
    /// File write failed
    WriteFailed(String),
}

impl StopReason {
    /// True when the session ended because something went wrong
    pub fn is_failure(&self) -> bool {
        !matches!(self, StopReason::Requested | StopReason::SampleLimitReached)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::SampleLimitReached => write!(f, "sample limit reached"),
            StopReason::HardwareFault(r) => write!(f, "hardware fault: {}", r),
            StopReason::TransportFailed(r) => write!(f, "transport failed: {}", r),
            StopReason::DiskExhausted(r) => write!(f, "disk exhausted: {}", r),
            StopReason::WriteFailed(r) => write!(f, "write failed: {}", r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mask() {
        assert!(ChannelMask::from_code(0).is_none());
        assert!(ChannelMask::from_code(4).is_none());

        let both = ChannelMask::from_code(3).unwrap();
        assert_eq!(both.count(), 2);
        assert_eq!(both.channels().collect::<Vec<_>>(), vec![Channel::Ch1, Channel::Ch2]);

        let ch2 = ChannelMask::CH2;
        assert!(!ch2.contains(Channel::Ch1));
        assert_eq!(ch2.channels().collect::<Vec<_>>(), vec![Channel::Ch2]);
    }

    #[test]
    fn test_compress_expand_14bit() {
        assert_eq!(Resolution::compress(8191, 14), 127);
        assert_eq!(Resolution::compress(-8192, 14), -128);
        assert_eq!(Resolution::expand(127, 14), 127 << 6);
        let byte = Resolution::compress(-300, 14);
        assert_eq!(Resolution::compress(Resolution::expand(byte, 14), 14), byte);
    }

    #[test]
    fn test_window_disabled_channel_dropped() {
        let w = SampleWindow::new(7, ChannelMask::CH1, vec![1, 2, 3], vec![4, 5, 6]);
        assert_eq!(w.index(), 7);
        assert_eq!(w.len(), 3);
        assert!(w.channel(Channel::Ch2).is_none());
    }

    #[test]
    fn test_window_stats() {
        let calib = CalibrationSnapshot::default();
        let mut w = SampleWindow::new(0, ChannelMask::BOTH, vec![-10, 0, 10, 20], vec![5; 4]);
        w.compute_stats(&calib, 14);

        let s1 = w.stats(Channel::Ch1).unwrap();
        assert_eq!(s1.min_raw, -10);
        assert_eq!(s1.max_raw, 20);
        assert_eq!(s1.avg_raw, 5);
        assert!(s1.max_volts > s1.min_volts);

        let s2 = w.stats(Channel::Ch2).unwrap();
        assert_eq!((s2.min_raw, s2.max_raw, s2.avg_raw), (5, 5, 5));
    }

    #[test]
    fn test_stop_reason_failure() {
        assert!(!StopReason::Requested.is_failure());
        assert!(!StopReason::SampleLimitReached.is_failure());
        assert!(StopReason::HardwareFault("x".into()).is_failure());
        assert_eq!(
            StopReason::DiskExhausted("0 free".into()).to_string(),
            "disk exhausted: 0 free"
        );
    }
}
