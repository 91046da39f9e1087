//! Error types for the aquasense core.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the transport adapter (radio layer).
///
/// Variants carry owned message strings rather than the underlying
/// `btleplug::Error` so they stay `Clone` — `ConnectionState::Faulted`
/// snapshots are broadcast to every observer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The radio is powered off or the platform has no usable adapter.
    #[error("Bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),

    /// The OS refused access to the radio.
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    /// A scan ran to its deadline without the caller's device appearing.
    /// Non-fatal; the partial result set is still valid.
    #[error("scan timed out after {0:?}")]
    ScanTimeout(Duration),

    /// The connection attempt did not resolve within its deadline.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A connect was requested while another attempt is still in flight.
    /// The new request is rejected, never queued.
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    /// The peripheral does not expose the expected GATT service.
    #[error("bottle service not found on peripheral")]
    ServiceNotFound,

    /// The service exists but carries no usable characteristic.
    #[error("no usable characteristic found: {0}")]
    CharacteristicNotFound(String),

    /// A write to the control characteristic failed.
    #[error("write to control characteristic failed: {0}")]
    WriteFailed(String),

    /// An operation that requires a link was invoked without one.
    #[error("not connected to a peripheral")]
    NotConnected,

    /// The requested peripheral was not seen in the last scan.
    #[error("peripheral {0} not found")]
    DeviceNotFound(String),

    /// Any other error bubbled up from the platform Bluetooth API.
    #[error("Bluetooth API error: {0}")]
    Api(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => {
                TransportError::PermissionDenied("permission denied by platform".to_string())
            }
            btleplug::Error::NotSupported(msg) => TransportError::RadioUnavailable(msg),
            btleplug::Error::NotConnected => TransportError::NotConnected,
            btleplug::Error::DeviceNotFound => {
                TransportError::DeviceNotFound("unknown peripheral".to_string())
            }
            btleplug::Error::TimedOut(duration) => TransportError::ConnectTimeout(duration),
            other => TransportError::Api(other.to_string()),
        }
    }
}

/// Errors raised by the calibration engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalibrationError {
    /// The empty baseline must exceed the full baseline: distance shrinks
    /// as the bottle fills. Anything else is a physical-setup error and the
    /// ritual has to be redone.
    #[error("invalid calibration: empty baseline {empty_mm}mm must exceed full baseline {full_mm}mm")]
    CalibrationInvalid { empty_mm: f64, full_mm: f64 },

    /// A reading was fed while no collection step was armed.
    #[error("no calibration step is collecting")]
    NotCollecting,

    /// Completion was requested before both baselines were captured.
    #[error("calibration ritual incomplete: missing {0} baseline")]
    MissingBaseline(&'static str),
}

/// Errors raised by the calibration persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("calibration store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("calibration store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no data directory available on this platform")]
    NoDataDir,
}

/// Errors raised while loading or saving the application configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error for session coordinator operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A reading arrived with no subject bound; generic observers still get
    /// it but consumption accounting is skipped.
    #[error("no active subject bound to this session")]
    NoActiveSubject,

    #[error("command serialization failed: {0}")]
    CommandEncoding(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SessionError>;
