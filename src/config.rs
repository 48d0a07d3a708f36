//! Configuration for the acqstream daemon and client
//!
//! Two on-disk forms map onto the same [`StreamConfig`]:
//!
//! - TOML (`*.toml`): flat session keys at top level plus optional
//!   `[device]`, `[file]`, `[network]` and `[logging]` tables
//! - legacy `key value` lines, one pair per line, `#` comments; dotted keys
//!   (`file.dir /data`) address the nested tables
//!
//! Enumerated keys accept names or the legacy numeric codes, so an old
//! `protocol 2` / `resolution 1` / `format 1` file keeps working.

use crate::core::calibration::InputRange;
use crate::core::types::{ChannelMask, Resolution, WINDOW_CAPACITY};
use crate::error::{Error, Result};
use crate::storage::ContainerFormat;
use crate::streaming::wire::{MAX_DATAGRAM, encoded_len};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Reliable, ordered stream
    #[default]
    Tcp,
    /// Unreliable datagrams
    Udp,
}

/// Network role of this endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Listen and stream to the first client that connects
    #[default]
    Server,
    /// Connect to a server
    Client,
}

/// File output layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Everything in one file until stop
    #[default]
    Single,
    /// New file every N windows or M bytes
    Rotating,
}

/// Top-level session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Peer host (client role) or bind address (server role)
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "de_code")]
    pub protocol: Protocol,
    /// Decimation factor
    pub rate: u32,
    #[serde(deserialize_with = "de_code")]
    pub resolution: Resolution,
    #[serde(deserialize_with = "de_flag")]
    pub use_file: bool,
    #[serde(deserialize_with = "de_code")]
    pub format: ContainerFormat,
    /// Samples per channel to record; -1 = unbounded
    pub samples: i64,
    /// Channel mask code: 1, 2 or 3 (both)
    pub channels: u8,
    #[serde(deserialize_with = "de_code")]
    pub save_mode: SaveMode,
    /// 0 = 1:1 input range, otherwise 1:20
    pub attenuator: u8,
    /// Legacy files use `1` = off, `2` = on
    #[serde(deserialize_with = "de_calib_flag")]
    pub use_calib: bool,
    /// Key-value calibration settings store
    pub calibration_file: Option<PathBuf>,
    /// Samples per channel in one window
    pub window_samples: usize,
    pub device: DeviceConfig,
    pub file: FileConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

/// Acquisition backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Backend kind; only "synthetic" is built in
    pub kind: String,
    /// Undecimated ADC rate in Hz
    pub base_rate_hz: u32,
    pub adc_bits: u8,
    /// Synthetic sine frequency per channel in Hz
    pub signal_hz: [f32; 2],
    /// Sine amplitude as a fraction of full scale
    pub amplitude: f32,
    /// Gaussian noise standard deviation in ADC codes
    pub noise_stddev: f32,
    /// Pacing factor: 1.0 = real time, 2.0 = twice as fast, 0 = unpaced
    pub speed_factor: f32,
    /// Noise seed; 0 = random each run
    pub random_seed: u64,
}

/// File sink configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub dir: PathBuf,
    pub prefix: String,
    /// Stop before free space drops below this many bytes
    pub min_reserve_bytes: u64,
    /// Rotate after this many windows (0 = off)
    pub rotate_windows: u64,
    /// Rotate after this many bytes (0 = off)
    pub rotate_bytes: u64,
    /// Windows buffered between the delivery loop and the writer thread
    pub queue_depth: usize,
    /// Free-space probe interval
    pub space_check_interval_ms: u64,
    /// Store calibrated codes instead of raw codes
    #[serde(deserialize_with = "de_flag")]
    pub calibrated: bool,
}

/// Network transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(deserialize_with = "de_code")]
    pub role: Role,
    /// Packets buffered ahead of the socket before back-pressure
    pub queue_depth: usize,
    pub connect_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8900,
            protocol: Protocol::Tcp,
            rate: 1,
            resolution: Resolution::Bits16,
            use_file: false,
            format: ContainerFormat::Simple,
            samples: -1,
            channels: 3,
            save_mode: SaveMode::Single,
            attenuator: 0,
            use_calib: false,
            calibration_file: None,
            window_samples: 8192,
            device: DeviceConfig::default(),
            file: FileConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: "synthetic".to_string(),
            base_rate_hz: 125_000_000,
            adc_bits: 14,
            signal_hz: [1000.0, 2500.0],
            amplitude: 0.5,
            noise_stddev: 4.0,
            speed_factor: 1.0,
            random_seed: 0,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/stream_files"),
            prefix: "data_file".to_string(),
            min_reserve_bytes: 64 * 1024 * 1024,
            rotate_windows: 0,
            rotate_bytes: 256 * 1024 * 1024,
            queue_depth: 16,
            space_check_interval_ms: 1000,
            calibrated: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            queue_depth: 16,
            connect_timeout_ms: 3000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl StreamConfig {
    /// Load and validate configuration from a TOML or legacy `key value` file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        let config = if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&contents)?
        } else {
            Self::from_key_values(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text (not validated)
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Parse legacy `key value` text (not validated)
    pub fn from_key_values(text: &str) -> Result<Self> {
        let mut root = toml::Table::new();
        for (key, value) in parse_key_values(text) {
            let mut table = &mut root;
            let mut parts: Vec<&str> = key.split('.').collect();
            let leaf = parts.pop().unwrap_or_default();
            for part in parts {
                let entry = table
                    .entry(part.to_string())
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                table = match entry {
                    toml::Value::Table(t) => t,
                    _ => return Err(Error::Config(format!("key {} is not a table", part))),
                };
            }
            table.insert(leaf.to_string(), scalar_value(&value));
        }
        toml::Value::Table(root)
            .try_into()
            .map_err(|e: toml::de::Error| Error::Config(e.to_string()))
    }

    /// Reject settings that cannot form a valid session
    pub fn validate(&self) -> Result<()> {
        let mask = self.channel_mask()?;

        if self.rate == 0 {
            return Err(Error::Config("rate (decimation) must be at least 1".into()));
        }
        if self.window_samples == 0 || self.window_samples > WINDOW_CAPACITY {
            return Err(Error::Config(format!(
                "window_samples must be in 1..={}, got {}",
                WINDOW_CAPACITY, self.window_samples
            )));
        }
        if self.samples == 0 || self.samples < -1 {
            return Err(Error::Config(format!(
                "samples must be -1 (unbounded) or positive, got {}",
                self.samples
            )));
        }
        if self.device.adc_bits < 8 || self.device.adc_bits > 16 {
            return Err(Error::Config(format!(
                "device.adc_bits must be in 8..=16, got {}",
                self.device.adc_bits
            )));
        }

        if self.use_file {
            if self.save_mode == SaveMode::Rotating
                && self.file.rotate_windows == 0
                && self.file.rotate_bytes == 0
            {
                return Err(Error::Config(
                    "rotating save_mode needs file.rotate_windows or file.rotate_bytes".into(),
                ));
            }
            if self.file.queue_depth == 0 {
                return Err(Error::Config("file.queue_depth must be at least 1".into()));
            }
        } else {
            if self.network.role == Role::Client && self.host.trim().is_empty() {
                return Err(Error::Config("client role requires a host".into()));
            }
            if self.network.queue_depth == 0 {
                return Err(Error::Config("network.queue_depth must be at least 1".into()));
            }
            let packet = encoded_len(self.window_samples, mask, self.resolution);
            if self.protocol == Protocol::Udp && packet > MAX_DATAGRAM {
                return Err(Error::Config(format!(
                    "UDP packet of {} bytes exceeds datagram limit {}; reduce window_samples",
                    packet, MAX_DATAGRAM
                )));
            }
        }
        Ok(())
    }

    pub fn channel_mask(&self) -> Result<ChannelMask> {
        ChannelMask::from_code(self.channels)
            .ok_or_else(|| Error::Config(format!("channels must be 1, 2 or 3, got {}", self.channels)))
    }

    pub fn input_range(&self) -> InputRange {
        InputRange::from_attenuator(self.attenuator)
    }

    /// Per-channel sample limit for file output
    pub fn sample_limit(&self) -> Option<u64> {
        u64::try_from(self.samples).ok()
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }
}

/// Split `key value` / `key = value` lines, skipping blanks and `#` comments
pub fn parse_key_values(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k, v),
                None => line.split_once(char::is_whitespace)?,
            };
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn scalar_value(text: &str) -> toml::Value {
    if let Ok(i) = text.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return toml::Value::Float(f);
    }
    match text {
        "true" => toml::Value::Boolean(true),
        "false" => toml::Value::Boolean(false),
        _ => toml::Value::String(text.trim_matches('"').to_string()),
    }
}

/// A configuration value given as a number, flag, or name
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCode {
    Int(i64),
    Flag(bool),
    Text(String),
}

fn de_code<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<RawCode, Error = String>,
{
    let raw = RawCode::deserialize(deserializer)?;
    T::try_from(raw).map_err(serde::de::Error::custom)
}

fn de_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match RawCode::deserialize(deserializer)? {
        RawCode::Flag(b) => Ok(b),
        RawCode::Int(0) => Ok(false),
        RawCode::Int(1) => Ok(true),
        RawCode::Text(t) if t.eq_ignore_ascii_case("true") => Ok(true),
        RawCode::Text(t) if t.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(serde::de::Error::custom(format!("expected a flag, got {:?}", other))),
    }
}

/// `use_calib` kept the hardware's 1/2 encoding; `0` also reads as off
fn de_calib_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match RawCode::deserialize(deserializer)? {
        RawCode::Flag(b) => Ok(b),
        RawCode::Int(0) | RawCode::Int(1) => Ok(false),
        RawCode::Int(2) => Ok(true),
        RawCode::Text(t) if t.eq_ignore_ascii_case("true") => Ok(true),
        RawCode::Text(t) if t.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "use_calib must be a flag or 1 (off) / 2 (on), got {:?}",
            other
        ))),
    }
}

impl TryFrom<RawCode> for Protocol {
    type Error = String;

    fn try_from(raw: RawCode) -> std::result::Result<Self, String> {
        match raw {
            RawCode::Int(1) => Ok(Protocol::Tcp),
            RawCode::Int(2) => Ok(Protocol::Udp),
            RawCode::Text(t) if t.eq_ignore_ascii_case("tcp") => Ok(Protocol::Tcp),
            RawCode::Text(t) if t.eq_ignore_ascii_case("udp") => Ok(Protocol::Udp),
            other => Err(format!("protocol must be TCP or UDP, got {:?}", other)),
        }
    }
}

impl TryFrom<RawCode> for Role {
    type Error = String;

    fn try_from(raw: RawCode) -> std::result::Result<Self, String> {
        match raw {
            RawCode::Text(t) if t.eq_ignore_ascii_case("server") => Ok(Role::Server),
            RawCode::Text(t) if t.eq_ignore_ascii_case("client") => Ok(Role::Client),
            other => Err(format!("role must be server or client, got {:?}", other)),
        }
    }
}

impl TryFrom<RawCode> for Resolution {
    type Error = String;

    fn try_from(raw: RawCode) -> std::result::Result<Self, String> {
        match raw {
            RawCode::Int(1) | RawCode::Int(8) => Ok(Resolution::Bits8),
            RawCode::Int(2) | RawCode::Int(16) => Ok(Resolution::Bits16),
            other => Err(format!("resolution must be 8 or 16, got {:?}", other)),
        }
    }
}

impl TryFrom<RawCode> for ContainerFormat {
    type Error = String;

    fn try_from(raw: RawCode) -> std::result::Result<Self, String> {
        match raw {
            RawCode::Int(0) => Ok(ContainerFormat::Simple),
            RawCode::Int(1) => Ok(ContainerFormat::Structured),
            RawCode::Text(t) => match t.to_ascii_lowercase().as_str() {
                "simple" | "wav" => Ok(ContainerFormat::Simple),
                "structured" | "tdms" => Ok(ContainerFormat::Structured),
                _ => Err(format!("format must be simple or structured, got {}", t)),
            },
            other => Err(format!("format must be simple or structured, got {:?}", other)),
        }
    }
}

impl TryFrom<RawCode> for SaveMode {
    type Error = String;

    fn try_from(raw: RawCode) -> std::result::Result<Self, String> {
        match raw {
            RawCode::Int(1) => Ok(SaveMode::Single),
            RawCode::Int(2) => Ok(SaveMode::Rotating),
            RawCode::Text(t) if t.eq_ignore_ascii_case("single") => Ok(SaveMode::Single),
            RawCode::Text(t) if t.eq_ignore_ascii_case("rotating") => Ok(SaveMode::Rotating),
            other => Err(format!("save_mode must be single or rotating, got {:?}", other)),
        }
    }
}
