//! Acquisition backends and the sample producer

pub mod producer;
pub mod synthetic;

use crate::config::DeviceConfig;
use crate::core::driver::AcquisitionBackend;
use crate::error::{Error, Result};

pub use producer::SampleProducer;
pub use synthetic::SyntheticBackend;

/// Create an acquisition backend based on configuration
pub fn create_backend(config: &DeviceConfig) -> Result<Box<dyn AcquisitionBackend>> {
    match config.kind.as_str() {
        "synthetic" => {
            log::info!("Creating synthetic acquisition backend");
            Ok(Box::new(SyntheticBackend::new(config.clone())?))
        }
        _ => Err(Error::Config(format!("Unknown device kind: {}", config.kind))),
    }
}
