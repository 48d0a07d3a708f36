//! Calibration snapshots and their sources.
//!
//! A [`CalibrationSnapshot`] holds per-channel gain and offset for the active
//! input range. It is taken once at session start and replaced only on an
//! explicit range change; between changes it is read-only.

use crate::config::parse_key_values;
use crate::core::types::Channel;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Front-end input range (attenuator setting)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputRange {
    /// 1:1, about ±1 V full scale
    #[default]
    Lv,
    /// 1:20, about ±20 V full scale
    Hv,
}

impl InputRange {
    /// Map the `attenuator` configuration value (0 = 1:1, otherwise 1:20)
    pub fn from_attenuator(attenuator: u8) -> Self {
        if attenuator == 0 {
            InputRange::Lv
        } else {
            InputRange::Hv
        }
    }

    /// Nominal full-scale voltage
    pub fn nominal_full_scale(self) -> f32 {
        match self {
            InputRange::Lv => 1.0,
            InputRange::Hv => 20.0,
        }
    }
}

/// Convert a stored full-scale gain code to volts.
///
/// Codes are fixed point with 100 V spanning the full `u32` range;
/// zero means "no scale".
pub fn full_scale_to_volts(code: u32) -> f32 {
    if code == 0 {
        return 1.0;
    }
    (code as f64 * 100.0 / (1u64 << 32) as f64) as f32
}

/// Gain and offset for one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibration {
    /// Full-scale voltage of this channel
    pub gain: f32,
    /// ADC code offset at 0 V
    pub offset: i32,
}

/// Per-channel calibration valid for the selected range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSnapshot {
    pub channels: [ChannelCalibration; 2],
    pub range: InputRange,
}

impl CalibrationSnapshot {
    /// Nominal gain, zero offset
    pub fn unity(range: InputRange) -> Self {
        let ch = ChannelCalibration {
            gain: range.nominal_full_scale(),
            offset: 0,
        };
        Self {
            channels: [ch; 2],
            range,
        }
    }

    #[inline]
    pub fn channel(&self, channel: Channel) -> &ChannelCalibration {
        &self.channels[channel.index()]
    }

    /// Raw ADC code to volts
    #[inline]
    pub fn to_volts(&self, channel: Channel, code: i32, adc_bits: u8) -> f32 {
        let cal = self.channel(channel);
        let span = (1i64 << adc_bits.saturating_sub(1)) as f32;
        (code - cal.offset) as f32 * cal.gain / span
    }

    /// Raw ADC code to a calibrated code on the nominal scale
    #[inline]
    pub fn calibrated_code(&self, channel: Channel, code: i16) -> i16 {
        let cal = self.channel(channel);
        let ratio = cal.gain / self.range.nominal_full_scale();
        let value = ((code as i32 - cal.offset) as f32 * ratio).round();
        value.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
}

impl Default for CalibrationSnapshot {
    fn default() -> Self {
        Self::unity(InputRange::Lv)
    }
}

/// Read-only provider of calibration snapshots
pub trait CalibrationSource: Send {
    /// Snapshot for the currently selected range
    fn get(&self) -> Result<CalibrationSnapshot>;

    /// Select another input range; the next `get` reflects it
    fn set_range(&mut self, range: InputRange);
}

/// Nominal calibration, used when `use_calib` is off
#[derive(Debug, Clone, Default)]
pub struct UnityCalibration {
    range: InputRange,
}

impl UnityCalibration {
    pub fn new(range: InputRange) -> Self {
        Self { range }
    }
}

impl CalibrationSource for UnityCalibration {
    fn get(&self) -> Result<CalibrationSnapshot> {
        Ok(CalibrationSnapshot::unity(self.range))
    }

    fn set_range(&mut self, range: InputRange) {
        self.range = range;
    }
}

/// Calibration backed by the device's key-value settings store
///
/// Keys per channel `N` (1 or 2):
/// - `fe_chN_fs_g_hi`, `fe_chN_hi_offs`: 1:1 range
/// - `fe_chN_fs_g_lo`, `fe_chN_lo_offs`: 1:20 range
#[derive(Debug, Clone)]
pub struct SettingsCalibration {
    settings: HashMap<String, i64>,
    range: InputRange,
}

impl SettingsCalibration {
    /// Load settings from a `key value` file
    pub fn from_file<P: AsRef<Path>>(path: P, range: InputRange) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str_with_range(&contents, range)
    }

    /// Parse settings text
    pub fn from_str_with_range(text: &str, range: InputRange) -> Result<Self> {
        let mut settings = HashMap::new();
        for (key, value) in parse_key_values(text) {
            let parsed = value.parse::<i64>().map_err(|_| {
                Error::Config(format!("calibration value for {} is not an integer: {}", key, value))
            })?;
            settings.insert(key, parsed);
        }
        Ok(Self { settings, range })
    }

    fn lookup(&self, key: &str) -> Result<i64> {
        self.settings
            .get(key)
            .copied()
            .ok_or_else(|| Error::Config(format!("calibration key missing: {}", key)))
    }

    fn channel(&self, n: u8) -> Result<ChannelCalibration> {
        let (gain_key, offset_key) = match self.range {
            InputRange::Lv => (format!("fe_ch{}_fs_g_hi", n), format!("fe_ch{}_hi_offs", n)),
            InputRange::Hv => (format!("fe_ch{}_fs_g_lo", n), format!("fe_ch{}_lo_offs", n)),
        };
        let gain_code = u32::try_from(self.lookup(&gain_key)?)
            .map_err(|_| Error::Config(format!("{} out of range", gain_key)))?;
        let offset = i32::try_from(self.lookup(&offset_key)?)
            .map_err(|_| Error::Config(format!("{} out of range", offset_key)))?;
        Ok(ChannelCalibration {
            gain: full_scale_to_volts(gain_code),
            offset,
        })
    }
}

impl CalibrationSource for SettingsCalibration {
    fn get(&self) -> Result<CalibrationSnapshot> {
        Ok(CalibrationSnapshot {
            channels: [self.channel(1)?, self.channel(2)?],
            range: self.range,
        })
    }

    fn set_range(&mut self, range: InputRange) {
        self.range = range;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = "
fe_ch1_fs_g_hi 42949673
fe_ch2_fs_g_hi 0
fe_ch1_hi_offs 12
fe_ch2_hi_offs -7
fe_ch1_fs_g_lo 858993459
fe_ch2_fs_g_lo 858993459
fe_ch1_lo_offs 3
fe_ch2_lo_offs 4
";

    #[test]
    fn test_full_scale_conversion() {
        assert_eq!(full_scale_to_volts(0), 1.0);
        assert!((full_scale_to_volts(42949673) - 1.0).abs() < 1e-4);
        assert!((full_scale_to_volts(858993459) - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_settings_range_selection() {
        let mut source = SettingsCalibration::from_str_with_range(SETTINGS, InputRange::Lv).unwrap();
        let lv = source.get().unwrap();
        assert_eq!(lv.channels[0].offset, 12);
        assert_eq!(lv.channels[1].offset, -7);
        assert_eq!(lv.channels[1].gain, 1.0);

        source.set_range(InputRange::Hv);
        let hv = source.get().unwrap();
        assert_eq!(hv.range, InputRange::Hv);
        assert_eq!(hv.channels[0].offset, 3);
        assert!((hv.channels[0].gain - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let source =
            SettingsCalibration::from_str_with_range("fe_ch1_fs_g_hi 1", InputRange::Lv).unwrap();
        assert!(matches!(source.get(), Err(Error::Config(_))));
    }

    #[test]
    fn test_to_volts_and_calibrated_code() {
        let mut snap = CalibrationSnapshot::unity(InputRange::Lv);
        assert!((snap.to_volts(Channel::Ch1, 8192, 14) - 1.0).abs() < 1e-6);

        snap.channels[0] = ChannelCalibration {
            gain: 2.0,
            offset: 10,
        };
        assert_eq!(snap.calibrated_code(Channel::Ch1, 110), 200);
        assert_eq!(snap.calibrated_code(Channel::Ch1, i16::MAX), i16::MAX);
        assert_eq!(snap.calibrated_code(Channel::Ch2, 110), 110);
    }
}
