//! Simple waveform container (RIFF/WAVE)
//!
//! One WAV channel per enabled acquisition channel, interleaved frames,
//! integer PCM at the session resolution. The RIFF sizes are patched on
//! close; a file cut short by a crash keeps whatever frames reached disk.

use super::{ContainerFormat, ContainerInfo, ContainerLayout, ContainerSummary, ContainerWriter};
use crate::core::calibration::CalibrationSnapshot;
use crate::core::types::{Channel, Resolution, SampleWindow};
use crate::error::{Error, Result};
use crate::streaming::wire::output_code;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Canonical header size written by hound for integer PCM
const HEADER_BYTES: u64 = 44;

pub struct WavContainer {
    writer: WavWriter<BufWriter<File>>,
    layout: ContainerLayout,
    path: PathBuf,
    windows: u64,
    samples_per_channel: u64,
    bytes: u64,
}

impl WavContainer {
    pub fn create(path: &Path, layout: ContainerLayout) -> Result<Self> {
        let spec = WavSpec {
            channels: layout.options.mask.count() as u16,
            sample_rate: layout.sample_rate_hz.max(1),
            bits_per_sample: layout.resolution().bits() as u16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)?;
        Ok(Self {
            writer,
            layout,
            path: path.to_path_buf(),
            windows: 0,
            samples_per_channel: 0,
            bytes: HEADER_BYTES,
        })
    }
}

impl ContainerWriter for WavContainer {
    fn append_size(&self, samples: usize) -> u64 {
        self.layout.payload_bytes(samples)
    }

    fn append(&mut self, window: &SampleWindow, calibration: &CalibrationSnapshot) -> Result<u64> {
        let options = &self.layout.options;
        let channels: Vec<(Channel, &[i16])> = options
            .mask
            .channels()
            .map(|c| {
                window.channel(c).map(|s| (c, s)).ok_or_else(|| {
                    Error::Encode(format!("window {} has no data for {:?}", window.index(), c))
                })
            })
            .collect::<Result<_>>()?;
        let len = window.len();

        for i in 0..len {
            for &(channel, samples) in &channels {
                let raw = samples.get(i).copied().unwrap_or(0);
                let code = output_code(raw, channel, calibration, options);
                match options.resolution {
                    Resolution::Bits16 => self.writer.write_sample(code)?,
                    Resolution::Bits8 => self
                        .writer
                        .write_sample(Resolution::compress(code, options.adc_bits))?,
                }
            }
        }

        let written = self.append_size(len);
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
        let this = *self;
        this.writer.finalize()?;
        log::info!(
            "Closed {} ({} windows, {} samples/channel)",
            this.path.display(),
            this.windows,
            this.samples_per_channel
        );
        Ok(ContainerInfo {
            path: this.path,
            windows: this.windows,
            samples_per_channel: this.samples_per_channel,
            bytes: this.bytes,
        })
    }
}

pub(super) fn summary(path: &Path) -> Result<ContainerSummary> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let resolution = Resolution::from_bits(spec.bits_per_sample as u32).ok_or_else(|| {
        Error::Other(format!("unsupported WAV bit depth {}", spec.bits_per_sample))
    })?;
    Ok(ContainerSummary {
        format: ContainerFormat::Simple,
        channels: spec.channels,
        resolution,
        sample_rate_hz: spec.sample_rate,
        samples_per_channel: reader.duration() as u64,
        records: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChannelMask;
    use crate::streaming::wire::WireOptions;
    use tempfile::TempDir;

    fn layout(resolution: Resolution, mask: ChannelMask) -> ContainerLayout {
        ContainerLayout {
            options: WireOptions {
                resolution,
                calibrated: false,
                mask,
                adc_bits: 14,
            },
            sample_rate_hz: 125_000,
        }
    }

    #[test]
    fn test_wav_two_channels_16bit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("two.wav");
        let mut wav = Box::new(WavContainer::create(&path, layout(Resolution::Bits16, ChannelMask::BOTH)).unwrap());
        let calib = CalibrationSnapshot::default();
        for i in 0..3 {
            let w = SampleWindow::new(i, ChannelMask::BOTH, vec![100; 50], vec![-100; 50]);
            assert_eq!(wav.append(&w, &calib).unwrap(), 200);
        }
        let info = wav.close().unwrap();
        assert_eq!(info.samples_per_channel, 150);

        let summary = summary(&path).unwrap();
        assert_eq!(summary.channels, 2);
        assert_eq!(summary.samples_per_channel, 150);
        assert_eq!(summary.sample_rate_hz, 125_000);

        let mut reader = WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(&samples[..4], &[100, -100, 100, -100]);
    }

    #[test]
    fn test_wav_single_channel_8bit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("one.wav");
        let mut wav = Box::new(WavContainer::create(&path, layout(Resolution::Bits8, ChannelMask::CH2)).unwrap());
        let calib = CalibrationSnapshot::default();
        let w = SampleWindow::new(0, ChannelMask::CH2, Vec::new(), vec![8191; 10]);
        wav.append(&w, &calib).unwrap();
        wav.close().unwrap();

        let summary = summary(&path).unwrap();
        assert_eq!(summary.channels, 1);
        assert_eq!(summary.resolution, Resolution::Bits8);
        assert_eq!(summary.samples_per_channel, 10);

        let mut reader = WavReader::open(&path).unwrap();
        let first = reader.samples::<i8>().next().unwrap().unwrap();
        assert_eq!(first, 127);
    }
}
