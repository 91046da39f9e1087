//! Two-point calibration: the empty-then-full ritual, the derived level
//! computation and persistence of completed calibrations.

mod engine;
mod store;

pub use engine::{Calibration, CalibrationEngine, CalibrationStep, FeedOutcome, SAMPLES_PER_STEP};
pub use store::{CalibrationStore, FileCalibrationStore};

#[cfg(test)]
pub use store::MockCalibrationStore;
