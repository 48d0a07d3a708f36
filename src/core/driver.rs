//! AcquisitionBackend trait definition

use crate::core::types::ChannelMask;
use crate::error::Result;

/// Hardware abstraction for a two-channel acquisition device
///
/// Implementations are driven from the capture thread only.
pub trait AcquisitionBackend: Send {
    /// Apply decimation and channel selection before capture starts
    fn configure(&mut self, decimation: u32, channels: ChannelMask) -> Result<()>;

    /// Block until the next window is complete and copy it out
    ///
    /// Enabled channels get a buffer of the window length; the buffer of a
    /// disabled channel is empty. Any error is a hardware fault.
    fn capture(&mut self, ch1: &mut [i16], ch2: &mut [i16]) -> Result<()>;

    /// Undecimated sample rate in Hz
    fn base_rate_hz(&self) -> u32;

    /// ADC resolution in bits
    fn adc_bits(&self) -> u8;

    /// Stop the hardware; called once when capture ends
    fn release(&mut self) {}
}
