//! Error types for acqstream

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Failures while parsing a received packet.
///
/// Decode errors are recoverable: the packet is dropped and counted,
/// the stream keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Buffer ends before a declared field or block
    #[error("packet truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the declared layout
        needed: usize,
        /// Bytes actually supplied
        available: usize,
    },

    /// Header or block lengths are inconsistent
    #[error("bad packet header: {0}")]
    BadHeader(String),
}

/// Network transport failures, reported through the error callback.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Could not reach or bind the endpoint
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed {
        /// Endpoint address
        addr: String,
        /// Underlying cause
        reason: String,
    },

    /// Peer went away
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Packet larger than the transport can carry in one unit
    #[error("packet of {size} bytes exceeds limit of {limit}")]
    Oversized {
        /// Encoded packet size
        size: usize,
        /// Transport limit
        limit: usize,
    },

    /// Socket I/O error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// acqstream error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Acquisition hardware failed; fatal for the session, never retried
    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    /// A window could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// A received packet could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Network transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Free space at the destination fell below the reserve
    #[error("Disk exhausted: {free_bytes} bytes free, {min_reserve_bytes} bytes reserved")]
    DiskExhausted {
        /// Free bytes at the last probe
        free_bytes: u64,
        /// Configured reserve
        min_reserve_bytes: u64,
    },

    /// Invalid configuration, detected before a session starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Waveform container error
    #[error("WAV container error: {0}")]
    Wav(#[from] hound::Error),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// A worker thread panicked
    #[error("Thread panicked: {0}")]
    ThreadPanic(&'static str),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that can only happen before a session is running
    pub fn is_startup(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Toml(_))
    }
}
