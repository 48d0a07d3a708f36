//! Structured lab-data container
//!
//! # Layout
//!
//! A file is a sequence of self-describing segments, one per window. All
//! integers little-endian.
//!
//! ```text
//! Lead-in (24 bytes)
//!   magic "ACQS" | version u16 | flags u16 | payload length u64 | window index u64
//! Group metadata (12 bytes)
//!   sample rate u32 | resolution u8 | adc bits u8 | channel mask u8 | calibrated u8 | samples u32
//! Channel metadata (12 bytes per enabled channel)
//!   channel u8 | reserved [u8; 3] | gain f32 | offset i32
//! Raw blocks (per enabled channel, in channel order)
//!   samples x (1 | 2) bytes
//! ```
//!
//! A segment is valid only when its full declared payload is present.
//! Reopening a file scans the segments, truncates an incomplete trailing
//! segment, and appends after the last valid one.

use super::{ContainerFormat, ContainerInfo, ContainerLayout, ContainerSummary, ContainerWriter};
use crate::core::calibration::CalibrationSnapshot;
use crate::core::types::{ChannelMask, Resolution, SampleWindow};
use crate::error::{Error, Result};
use crate::streaming::wire::encode_channel;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of every segment
pub const SEGMENT_MAGIC: [u8; 4] = *b"ACQS";

/// Current segment format version
pub const SEGMENT_VERSION: u16 = 1;

/// Size of the segment lead-in
pub const LEAD_IN_SIZE: u64 = 24;

const GROUP_META_SIZE: u64 = 12;
const CHANNEL_META_SIZE: u64 = 12;

/// Segmented container writer with resumable append
pub struct StructuredContainer {
    writer: BufWriter<File>,
    layout: ContainerLayout,
    path: PathBuf,
    buf: Vec<u8>,
    windows: u64,
    samples_per_channel: u64,
    bytes: u64,
}

impl StructuredContainer {
    /// Create the file, or resume after its last complete segment
    pub fn open(path: &Path, layout: ContainerLayout) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let mut valid_len = 0;
        if file_len > 0 {
            let scan = scan_segments(&mut BufReader::new(&mut file), file_len)?;
            if scan.valid_len < file_len {
                log::warn!(
                    "{}: truncating incomplete trailing segment ({} of {} bytes valid)",
                    path.display(),
                    scan.valid_len,
                    file_len
                );
                file.set_len(scan.valid_len)?;
            }
            log::info!(
                "Resuming {} after {} segments ({} samples/channel)",
                path.display(),
                scan.segments,
                scan.samples_per_channel
            );
            valid_len = scan.valid_len;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            writer: BufWriter::new(file),
            layout,
            path: path.to_path_buf(),
            buf: Vec::new(),
            windows: 0,
            samples_per_channel: 0,
            bytes: valid_len,
        })
    }

    fn payload_len(&self, samples: usize) -> u64 {
        GROUP_META_SIZE
            + CHANNEL_META_SIZE * self.layout.options.mask.count() as u64
            + self.layout.payload_bytes(samples)
    }
}

impl ContainerWriter for StructuredContainer {
    fn append_size(&self, samples: usize) -> u64 {
        LEAD_IN_SIZE + self.payload_len(samples)
    }

    fn append(&mut self, window: &SampleWindow, calibration: &CalibrationSnapshot) -> Result<u64> {
        let options = self.layout.options;
        let len = window.len();
        let samples = u32::try_from(len)
            .map_err(|_| Error::Encode(format!("window of {} samples too large", len)))?;

        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        buf.extend_from_slice(&SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.payload_len(len).to_le_bytes());
        buf.extend_from_slice(&window.index().to_le_bytes());

        buf.extend_from_slice(&self.layout.sample_rate_hz.to_le_bytes());
        buf.push(options.resolution.bits() as u8);
        buf.push(options.adc_bits);
        buf.push(options.mask.code());
        buf.push(u8::from(options.calibrated));
        buf.extend_from_slice(&samples.to_le_bytes());

        for channel in options.mask.channels() {
            let cal = calibration.channel(channel);
            buf.push(channel.index() as u8 + 1);
            buf.extend_from_slice(&[0u8; 3]);
            buf.extend_from_slice(&cal.gain.to_le_bytes());
            buf.extend_from_slice(&cal.offset.to_le_bytes());
        }
        for channel in options.mask.channels() {
            let Some(data) = window.channel(channel) else {
                self.buf = buf;
                return Err(Error::Encode(format!(
                    "window {} has no data for {:?}",
                    window.index(),
                    channel
                )));
            };
            encode_channel(&mut buf, data, channel, calibration, &options);
        }

        let result = self.writer.write_all(&buf);
        let written = buf.len() as u64;
        self.buf = buf;
        result?;

        self.windows += 1;
        self.samples_per_channel += len as u64;
        self.bytes += written;
        Ok(written)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }

    fn windows_written(&self) -> u64 {
        self.windows
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(self: Box<Self>) -> Result<ContainerInfo> {
        let mut this = *self;
        this.writer.flush()?;
        this.writer.get_ref().sync_data()?;
        log::info!(
            "Closed {} ({} segments appended, {} bytes)",
            this.path.display(),
            this.windows,
            this.bytes
        );
        Ok(ContainerInfo {
            path: this.path,
            windows: this.windows,
            samples_per_channel: this.samples_per_channel,
            bytes: this.bytes,
        })
    }
}

/// Result of walking a file's segments
#[derive(Debug, Default)]
struct Scan {
    valid_len: u64,
    segments: u64,
    samples_per_channel: u64,
    channels: u16,
    resolution: Option<Resolution>,
    sample_rate_hz: u32,
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> std::io::Result<[u8; N]> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Walk complete segments; stops at the first incomplete or foreign one
fn scan_segments<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Scan> {
    let mut scan = Scan::default();
    reader.seek(SeekFrom::Start(0))?;

    while file_len - scan.valid_len >= LEAD_IN_SIZE + GROUP_META_SIZE {
        let lead_in: [u8; 24] = read_array(reader)?;
        if lead_in[0..4] != SEGMENT_MAGIC {
            if scan.segments == 0 {
                return Err(Error::Other("not a structured container".into()));
            }
            log::warn!("Foreign bytes after segment {}", scan.segments);
            break;
        }
        let payload_len = u64::from_le_bytes(read8(&lead_in[8..16]));
        let end = LEAD_IN_SIZE
            .checked_add(payload_len)
            .and_then(|segment| scan.valid_len.checked_add(segment));
        let end = match end {
            Some(end) if payload_len >= GROUP_META_SIZE && end <= file_len => end,
            _ => break,
        };

        let meta: [u8; 12] = read_array(reader)?;
        let sample_rate = u32::from_le_bytes([meta[0], meta[1], meta[2], meta[3]]);
        let resolution = Resolution::from_bits(meta[4] as u32);
        let mask = ChannelMask::from_code(meta[6]);
        let samples = u32::from_le_bytes([meta[8], meta[9], meta[10], meta[11]]) as u64;
        let (Some(resolution), Some(mask)) = (resolution, mask) else {
            log::warn!("Malformed metadata in segment {}", scan.segments);
            break;
        };
        let expected = GROUP_META_SIZE
            + CHANNEL_META_SIZE * mask.count() as u64
            + samples * mask.count() as u64 * resolution.bytes_per_sample() as u64;
        if expected != payload_len {
            log::warn!("Inconsistent payload length in segment {}", scan.segments);
            break;
        }

        scan.segments += 1;
        scan.samples_per_channel += samples;
        scan.channels = scan.channels.max(mask.count() as u16);
        scan.resolution = Some(resolution);
        scan.sample_rate_hz = sample_rate;
        scan.valid_len = end;
        reader.seek(SeekFrom::Start(end))?;
    }
    Ok(scan)
}

fn read8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

pub(super) fn summary(path: &Path) -> Result<ContainerSummary> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let scan = scan_segments(&mut BufReader::new(file), file_len)?;
    Ok(ContainerSummary {
        format: ContainerFormat::Structured,
        channels: scan.channels,
        resolution: scan.resolution.unwrap_or_default(),
        sample_rate_hz: scan.sample_rate_hz,
        samples_per_channel: scan.samples_per_channel,
        records: scan.segments,
    })
}
