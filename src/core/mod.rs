//! Core abstractions and types

pub mod calibration;
pub mod driver;
pub mod stats;
pub mod types;
