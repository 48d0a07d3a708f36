//! Stream packet codec
//!
//! # Packet layout
//!
//! All integers little-endian:
//!
//! ```text
//! ┌──────────┬────────────────┬──────────────────────┬─────────────────┐
//! │ id (u64) │ lost_count(u64)│ sample_rate_code(u32)│ resolution (u32)│  24-byte header
//! ├──────────┴──────┬─────────┴──────────────────────┴─────────────────┤
//! │ ch1 length (u32)│ ch1 bytes                                        │
//! ├─────────────────┼──────────────────────────────────────────────────┤
//! │ ch2 length (u32)│ ch2 bytes                                        │
//! └─────────────────┴──────────────────────────────────────────────────┘
//! ```
//!
//! - Both channel blocks are always present, in channel order; a disabled
//!   channel has length 0, so the receiver never guesses which channel a
//!   block belongs to.
//! - `resolution = 16`: each sample is an `i16` ADC code (2 bytes)
//! - `resolution = 8`: each sample is the top 8 bits of the code (1 byte)
//! - `sample_rate_code` is the decimation factor of the session
//! - `lost_count` is the number of samples per channel lost since the
//!   previous packet was sent; the `id` sequence is the authoritative gap
//!   detector.
//!
//! Over TCP every packet is preceded by a u32 LE frame length. Over UDP one
//! datagram carries exactly one packet.
//!
//! Decoding borrows the channel blocks from the input buffer and validates
//! every declared length before slicing.

use crate::core::calibration::CalibrationSnapshot;
use crate::core::types::{Channel, ChannelMask, Resolution, SampleWindow};
use crate::error::{DecodeError, Error, Result};

/// Fixed header size
pub const HEADER_LEN: usize = 24;

/// Size of a channel block length prefix
pub const BLOCK_PREFIX_LEN: usize = 4;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest accepted TCP frame
pub const MAX_FRAME: usize = 1024 * 1024;

/// Encoded size of one packet
pub fn encoded_len(samples: usize, mask: ChannelMask, resolution: Resolution) -> usize {
    HEADER_LEN + 2 * BLOCK_PREFIX_LEN + mask.count() * samples * resolution.bytes_per_sample()
}

/// Packet header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: u64,
    pub lost_count: u64,
    pub sample_rate_code: u32,
    pub resolution: Resolution,
}

/// Per-session encoding choices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireOptions {
    pub resolution: Resolution,
    /// Apply the calibration snapshot instead of sending raw codes
    pub calibrated: bool,
    /// Channels to include; must be enabled in every window
    pub mask: ChannelMask,
    pub adc_bits: u8,
}

/// A decoded packet borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket<'a> {
    pub header: PacketHeader,
    pub ch1: &'a [u8],
    pub ch2: &'a [u8],
}

impl<'a> DecodedPacket<'a> {
    pub fn block(&self, channel: Channel) -> &'a [u8] {
        match channel {
            Channel::Ch1 => self.ch1,
            Channel::Ch2 => self.ch2,
        }
    }

    /// Channels carrying data
    pub fn mask(&self) -> Option<ChannelMask> {
        let code = u8::from(!self.ch1.is_empty()) | (u8::from(!self.ch2.is_empty()) << 1);
        ChannelMask::from_code(code)
    }

    /// Samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.ch1.len().max(self.ch2.len()) / self.header.resolution.bytes_per_sample()
    }

    /// Channel payload bytes (both blocks, without length prefixes)
    pub fn payload_len(&self) -> usize {
        self.ch1.len() + self.ch2.len()
    }

    /// Expand one channel block back to ADC code scale
    pub fn samples(&self, channel: Channel, adc_bits: u8) -> Vec<i16> {
        let block = self.block(channel);
        match self.header.resolution {
            Resolution::Bits16 => block
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
            Resolution::Bits8 => block
                .iter()
                .map(|&b| Resolution::expand(b as i8, adc_bits))
                .collect(),
        }
    }
}

/// Raw or calibrated 16-bit code for one sample
#[inline]
pub fn output_code(
    raw: i16,
    channel: Channel,
    calibration: &CalibrationSnapshot,
    options: &WireOptions,
) -> i16 {
    if options.calibrated {
        calibration.calibrated_code(channel, raw)
    } else {
        raw
    }
}

/// Append one channel's samples in the session encoding
pub fn encode_channel(
    out: &mut Vec<u8>,
    samples: &[i16],
    channel: Channel,
    calibration: &CalibrationSnapshot,
    options: &WireOptions,
) {
    out.reserve(samples.len() * options.resolution.bytes_per_sample());
    for &raw in samples {
        let code = output_code(raw, channel, calibration, options);
        match options.resolution {
            Resolution::Bits16 => out.extend_from_slice(&code.to_le_bytes()),
            Resolution::Bits8 => out.push(Resolution::compress(code, options.adc_bits) as u8),
        }
    }
}

/// Encode a window into `out` (cleared first)
pub fn encode_into(
    out: &mut Vec<u8>,
    window: &SampleWindow,
    calibration: &CalibrationSnapshot,
    options: &WireOptions,
    sample_rate_code: u32,
    id: u64,
    lost_count: u64,
) -> Result<()> {
    out.clear();
    out.reserve(encoded_len(window.len(), options.mask, options.resolution));
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&lost_count.to_le_bytes());
    out.extend_from_slice(&sample_rate_code.to_le_bytes());
    out.extend_from_slice(&options.resolution.bits().to_le_bytes());

    for channel in Channel::ALL {
        let samples = if options.mask.contains(channel) {
            window.channel(channel).ok_or_else(|| {
                Error::Encode(format!(
                    "window {} has no data for {:?}",
                    window.index(),
                    channel
                ))
            })?
        } else {
            &[]
        };
        let len = samples.len() * options.resolution.bytes_per_sample();
        let len = u32::try_from(len)
            .map_err(|_| Error::Encode(format!("channel block of {} bytes too large", len)))?;
        out.extend_from_slice(&len.to_le_bytes());
        encode_channel(out, samples, channel, calibration, options);
    }
    Ok(())
}

/// Encode a window into a new packet buffer
pub fn encode(
    window: &SampleWindow,
    calibration: &CalibrationSnapshot,
    options: &WireOptions,
    sample_rate_code: u32,
    id: u64,
    lost_count: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_into(&mut out, window, calibration, options, sample_rate_code, id, lost_count)?;
    Ok(out)
}

fn read_u32(buf: &[u8], at: usize) -> std::result::Result<u32, DecodeError> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(DecodeError::Truncated {
            needed: at + 4,
            available: buf.len(),
        })
}

fn read_u64(buf: &[u8], at: usize) -> std::result::Result<u64, DecodeError> {
    buf.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(DecodeError::Truncated {
            needed: at + 8,
            available: buf.len(),
        })
}

/// Parse a packet, validating every declared length against `buf`
pub fn decode(buf: &[u8]) -> std::result::Result<DecodedPacket<'_>, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }
    let id = read_u64(buf, 0)?;
    let lost_count = read_u64(buf, 8)?;
    let sample_rate_code = read_u32(buf, 16)?;
    let bits = read_u32(buf, 20)?;
    let resolution = Resolution::from_bits(bits)
        .ok_or_else(|| DecodeError::BadHeader(format!("unsupported resolution {}", bits)))?;

    let mut offset = HEADER_LEN;
    let mut blocks: [&[u8]; 2] = [&[], &[]];
    for block in blocks.iter_mut() {
        let len = read_u32(buf, offset)? as usize;
        let start = offset + BLOCK_PREFIX_LEN;
        let end = start.checked_add(len).ok_or_else(|| {
            DecodeError::BadHeader(format!("block length {} overflows", len))
        })?;
        *block = buf.get(start..end).ok_or(DecodeError::Truncated {
            needed: end,
            available: buf.len(),
        })?;
        if len % resolution.bytes_per_sample() != 0 {
            return Err(DecodeError::BadHeader(format!(
                "block length {} not a multiple of the sample size",
                len
            )));
        }
        offset = end;
    }

    if offset != buf.len() {
        return Err(DecodeError::BadHeader(format!(
            "{} trailing bytes after declared blocks",
            buf.len() - offset
        )));
    }
    let [ch1, ch2] = blocks;
    if ch1.is_empty() && ch2.is_empty() {
        return Err(DecodeError::BadHeader("packet carries no channel data".into()));
    }
    if !ch1.is_empty() && !ch2.is_empty() && ch1.len() != ch2.len() {
        return Err(DecodeError::BadHeader(format!(
            "channel blocks differ in length ({} vs {})",
            ch1.len(),
            ch2.len()
        )));
    }

    Ok(DecodedPacket {
        header: PacketHeader {
            id,
            lost_count,
            sample_rate_code,
            resolution,
        },
        ch1,
        ch2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(mask: ChannelMask) -> SampleWindow {
        let ch1: Vec<i16> = (0..64).map(|i| i * 100 - 3200).collect();
        let ch2: Vec<i16> = (0..64).map(|i| 8191 - i * 7).collect();
        SampleWindow::new(5, mask, ch1, ch2)
    }

    fn options(resolution: Resolution, mask: ChannelMask) -> WireOptions {
        WireOptions {
            resolution,
            calibrated: false,
            mask,
            adc_bits: 14,
        }
    }

    #[test]
    fn test_round_trip_16bit() {
        let w = window(ChannelMask::BOTH);
        let calib = CalibrationSnapshot::default();
        let opts = options(Resolution::Bits16, ChannelMask::BOTH);
        let bytes = encode(&w, &calib, &opts, 64, 9, 128).unwrap();
        assert_eq!(bytes.len(), encoded_len(64, ChannelMask::BOTH, Resolution::Bits16));

        let packet = decode(&bytes).unwrap();
        assert_eq!(
            packet.header,
            PacketHeader {
                id: 9,
                lost_count: 128,
                sample_rate_code: 64,
                resolution: Resolution::Bits16,
            }
        );
        assert_eq!(packet.mask(), Some(ChannelMask::BOTH));
        assert_eq!(packet.samples_per_channel(), 64);
        assert_eq!(packet.samples(Channel::Ch1, 14), w.channel(Channel::Ch1).unwrap());
        assert_eq!(packet.samples(Channel::Ch2, 14), w.channel(Channel::Ch2).unwrap());
    }

    #[test]
    fn test_single_channel_8bit() {
        let w = window(ChannelMask::CH2);
        let calib = CalibrationSnapshot::default();
        let opts = options(Resolution::Bits8, ChannelMask::CH2);
        let bytes = encode(&w, &calib, &opts, 1, 0, 0).unwrap();

        let packet = decode(&bytes).unwrap();
        assert!(packet.ch1.is_empty());
        assert_eq!(packet.ch2.len(), 64);
        assert_eq!(packet.mask(), Some(ChannelMask::CH2));
        let expanded = packet.samples(Channel::Ch2, 14);
        let original = w.channel(Channel::Ch2).unwrap();
        for (e, o) in expanded.iter().zip(original) {
            assert!((e - o).abs() < 64);
        }
    }

    #[test]
    fn test_calibrated_output_differs_from_raw() {
        let w = window(ChannelMask::CH1);
        let mut calib = CalibrationSnapshot::default();
        calib.channels[0].offset = 100;
        let raw = encode(&w, &calib, &options(Resolution::Bits16, ChannelMask::CH1), 1, 0, 0).unwrap();
        let cal_opts = WireOptions {
            calibrated: true,
            ..options(Resolution::Bits16, ChannelMask::CH1)
        };
        let cal = encode(&w, &calib, &cal_opts, 1, 0, 0).unwrap();
        let first_raw = decode(&raw).unwrap().samples(Channel::Ch1, 14)[0];
        let first_cal = decode(&cal).unwrap().samples(Channel::Ch1, 14)[0];
        assert_eq!(first_raw - first_cal, 100);
    }

    #[test]
    fn test_missing_channel_is_encode_error() {
        let w = window(ChannelMask::CH1);
        let calib = CalibrationSnapshot::default();
        let result = encode(&w, &calib, &options(Resolution::Bits16, ChannelMask::BOTH), 1, 0, 0);
        assert!(matches!(result, Err(Error::Encode(_))));
    }

    #[test]
    fn test_every_prefix_is_truncated() {
        let w = window(ChannelMask::BOTH);
        let calib = CalibrationSnapshot::default();
        let bytes = encode(&w, &calib, &options(Resolution::Bits16, ChannelMask::BOTH), 1, 1, 0).unwrap();
        for cut in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..cut]), Err(DecodeError::Truncated { .. })),
                "prefix of {} bytes",
                cut
            );
        }
    }

    #[test]
    fn test_oversized_length_field_rejected() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[20..24].copy_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        assert!(matches!(decode(&bytes), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_bad_header_cases() {
        let w = window(ChannelMask::BOTH);
        let calib = CalibrationSnapshot::default();
        let good = encode(&w, &calib, &options(Resolution::Bits16, ChannelMask::BOTH), 1, 1, 0).unwrap();

        let mut bad_res = good.clone();
        bad_res[20..24].copy_from_slice(&12u32.to_le_bytes());
        assert!(matches!(decode(&bad_res), Err(DecodeError::BadHeader(_))));

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(matches!(decode(&trailing), Err(DecodeError::BadHeader(_))));

        let mut empty = vec![0u8; HEADER_LEN + 8];
        empty[20..24].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(decode(&empty), Err(DecodeError::BadHeader(_))));
    }
}
