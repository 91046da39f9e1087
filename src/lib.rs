// Root module exports
pub mod bluetooth;
pub mod calibration;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod telemetry;

// Re-export common items for convenience
pub use bluetooth::{BleTransport, PeripheralHandle, RawNotification, Transport};
pub use calibration::{
    Calibration, CalibrationEngine, CalibrationStep, CalibrationStore, FeedOutcome,
    FileCalibrationStore,
};
pub use config::AppConfig;
pub use error::{CalibrationError, SessionError, StoreError, TransportError};
pub use logging::configure_logging;
pub use session::{
    ConnectionState, ConsumptionSink, EventBroker, EventFilter, LevelReading, LevelSource,
    SessionCoordinator, SessionEvent, SubjectId,
};
pub use telemetry::{SensorReading, TelemetryDecoder};
