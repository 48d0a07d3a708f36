//! File output: containers, disk admission, and the file-writer sink
//!
//! Two container formats share one writer capability:
//!
//! | Format | Extension | Layout |
//! |--------|-----------|--------|
//! | simple | `.wav` | RIFF/WAVE header + interleaved PCM frames (8 or 16 bit) |
//! | structured | `.acq` | self-describing segments: lead-in, channel metadata, raw blocks |
//!
//! Writers are driven from the `file-writer` thread only and take windows
//! in index order.

pub mod disk;
pub mod sink;
pub mod structured;
pub mod wav;

use crate::core::calibration::CalibrationSnapshot;
use crate::core::types::{Resolution, SampleWindow};
use crate::error::{Error, Result};
use crate::streaming::wire::WireOptions;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

pub use disk::{DiskAdmission, DiskBudget, Fs2Probe, SpaceProbe};
pub use sink::{FileSink, FileSinkConfig, FileSinkReport};

/// Container format selected at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerFormat {
    /// Waveform-audio container
    #[default]
    Simple,
    /// Segmented lab-data container with resumable append
    Structured,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Simple => "wav",
            ContainerFormat::Structured => "acq",
        }
    }
}

/// Fixed per-session parameters of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {
    /// Sample encoding and channel selection
    pub options: WireOptions,
    /// Effective sample rate in Hz
    pub sample_rate_hz: u32,
}

impl ContainerLayout {
    pub fn resolution(&self) -> Resolution {
        self.options.resolution
    }

    /// Payload bytes one window occupies, without framing
    pub fn payload_bytes(&self, samples: usize) -> u64 {
        (samples * self.options.mask.count() * self.options.resolution.bytes_per_sample()) as u64
    }
}

/// Result of closing a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub path: PathBuf,
    pub windows: u64,
    pub samples_per_channel: u64,
    pub bytes: u64,
}

/// Open container that accepts windows in index order
pub trait ContainerWriter: Send {
    /// Bytes `append` would add for a window of `samples` per channel
    fn append_size(&self, samples: usize) -> u64;

    /// Write one window; returns the bytes written
    fn append(&mut self, window: &SampleWindow, calibration: &CalibrationSnapshot) -> Result<u64>;

    /// File size so far, header included
    fn bytes_written(&self) -> u64;

    fn windows_written(&self) -> u64;

    fn path(&self) -> &Path;

    /// Flush, finalise headers, and close
    fn close(self: Box<Self>) -> Result<ContainerInfo>;
}

/// Create (or for the structured format, resume) a container at `path`
pub fn open_container(
    format: ContainerFormat,
    path: &Path,
    layout: ContainerLayout,
) -> Result<Box<dyn ContainerWriter>> {
    log::info!("Opening {:?} container {}", format, path.display());
    match format {
        ContainerFormat::Simple => Ok(Box::new(wav::WavContainer::create(path, layout)?)),
        ContainerFormat::Structured => Ok(Box::new(structured::StructuredContainer::open(
            path, layout,
        )?)),
    }
}

/// What a finished container declares about its contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub format: ContainerFormat,
    pub channels: u16,
    pub resolution: Resolution,
    pub sample_rate_hz: u32,
    /// Declared samples per channel
    pub samples_per_channel: u64,
    /// Segments (structured) or 1 (simple)
    pub records: u64,
}

/// Read back the declared contents of either container format
pub fn container_summary(path: &Path) -> Result<ContainerSummary> {
    let mut magic = [0u8; 4];
    File::open(path)?.read_exact(&mut magic)?;
    match &magic {
        b"RIFF" => wav::summary(path),
        m if m == &structured::SEGMENT_MAGIC => structured::summary(path),
        _ => Err(Error::Other(format!(
            "{} is not a recognised container",
            path.display()
        ))),
    }
}
