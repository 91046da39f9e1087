//! Decoding of raw notification payloads into typed sensor readings.

mod decoder;

pub use decoder::{SensorReading, TelemetryDecoder};
