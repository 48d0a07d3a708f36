//! acqstream - Real-time streaming of two-channel acquisition data
//!
//! Windows captured by a [`devices::SampleProducer`] are delivered by a
//! [`streaming::StreamingManager`] to exactly one sink per session: a
//! network peer (TCP or UDP, server or client role) or a local file
//! container (waveform or structured).
//!
//! Loss is expected and accounted for rather than prevented: the capture
//! thread never waits for the consumer, and a sink that falls behind has
//! windows dropped and counted.

pub mod app;
pub mod config;
pub mod core;
pub mod devices;
pub mod error;
pub mod storage;
pub mod streaming;

// Re-export commonly used types
pub use app::{AppState, SessionReport, StopHandle, StreamingApplication};
pub use config::StreamConfig;
pub use error::{Error, Result};
