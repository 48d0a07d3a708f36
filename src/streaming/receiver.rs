//! Receiving side of a stream
//!
//! Loss is tracked two ways and the two are kept apart:
//!
//! - `missing_ids`: gaps in the packet `id` sequence (authoritative)
//! - `hinted_lost_samples`: sum of the senders' `lost_count` fields
//!
//! When a packet's hint disagrees with the gap in front of it (for example a
//! datagram lost in the network, which the sender never sees), the packet
//! is counted in `divergent_packets` and a warning is logged.

use crate::core::types::{Channel, SampleWindow};
use crate::streaming::wire::{self, DecodedPacket};

/// Running totals of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverStats {
    pub packets: u64,
    /// Whole packets, headers included
    pub bytes: u64,
    /// Channel payload bytes only
    pub payload_bytes: u64,
    pub samples: [u64; 2],
    pub missing_ids: u64,
    pub hinted_lost_samples: u64,
    /// Packets whose id was not above the previous one
    pub out_of_order: u64,
    pub decode_failures: u64,
    pub divergent_packets: u64,
}

/// Decodes packets and keeps loss bookkeeping
#[derive(Debug)]
pub struct PacketReceiver {
    adc_bits: u8,
    last_id: Option<u64>,
    stats: ReceiverStats,
}

impl PacketReceiver {
    /// `adc_bits` scales 8-bit samples back to ADC codes when rebuilding windows
    pub fn new(adc_bits: u8) -> Self {
        Self {
            adc_bits,
            last_id: None,
            stats: ReceiverStats::default(),
        }
    }

    /// Decode and account one packet; malformed packets are counted and dropped
    pub fn accept<'a>(&mut self, bytes: &'a [u8]) -> Option<DecodedPacket<'a>> {
        let packet = match wire::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.decode_failures += 1;
                log::warn!("Dropping malformed packet ({} bytes): {}", bytes.len(), e);
                return None;
            }
        };
        let header = packet.header;

        let gap = match self.last_id {
            Some(last) if header.id > last => header.id - last - 1,
            Some(last) => {
                self.stats.out_of_order += 1;
                log::debug!("Packet {} arrived after {}", header.id, last);
                0
            }
            None => 0,
        };
        if self.last_id.is_none_or(|last| header.id > last) {
            self.last_id = Some(header.id);
        }

        let per_channel = packet.samples_per_channel() as u64;
        let implied = gap.saturating_mul(per_channel);
        if implied != header.lost_count {
            self.stats.divergent_packets += 1;
            if self.stats.divergent_packets % 100 == 1 {
                log::warn!(
                    "Loss report diverges at packet {}: {} ids missing ({} samples), sender reports {} samples",
                    header.id,
                    gap,
                    implied,
                    header.lost_count
                );
            }
        }

        self.stats.packets += 1;
        self.stats.bytes += bytes.len() as u64;
        self.stats.payload_bytes += packet.payload_len() as u64;
        self.stats.missing_ids = self.stats.missing_ids.saturating_add(gap);
        self.stats.hinted_lost_samples = self
            .stats
            .hinted_lost_samples
            .saturating_add(header.lost_count);
        for channel in Channel::ALL {
            let block = packet.block(channel).len() / header.resolution.bytes_per_sample();
            self.stats.samples[channel.index()] += block as u64;
        }
        Some(packet)
    }

    /// Rebuild a window from a decoded packet, for file output
    pub fn to_window(&self, packet: &DecodedPacket<'_>) -> Option<SampleWindow> {
        let mask = packet.mask()?;
        Some(SampleWindow::new(
            packet.header.id,
            mask,
            packet.samples(Channel::Ch1, self.adc_bits),
            packet.samples(Channel::Ch2, self.adc_bits),
        ))
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    pub fn last_id(&self) -> Option<u64> {
        self.last_id
    }
}
