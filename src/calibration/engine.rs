//! The calibration state machine and the pure level computation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// How many readings each calibration step collects before reducing,
/// unless overridden via [`CalibrationEngine::with_sample_count`].
pub const SAMPLES_PER_STEP: usize = 10;

/// A completed two-point calibration for one subject's bottle.
///
/// Invariant: `empty_baseline_mm > full_baseline_mm > 0` whenever
/// `is_complete` is true. Distance shrinks as the bottle fills, so the
/// empty bottle yields the longest echo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub empty_baseline_mm: f64,
    pub full_baseline_mm: f64,
    pub bottle_capacity_ml: u32,
    pub calibrated_at: DateTime<Utc>,
    pub is_complete: bool,
}

impl Calibration {
    /// Fill level for a distance reading, in percent.
    ///
    /// Clamps to 100 at or below the full baseline and to 0 at or above the
    /// empty baseline, interpolating linearly in between. Pure: no state is
    /// read or written beyond the calibration itself, so it is safe to call
    /// concurrently from any number of readers.
    pub fn level_pct(&self, distance_mm: f64) -> f64 {
        if distance_mm <= self.full_baseline_mm {
            return 100.0;
        }
        if distance_mm >= self.empty_baseline_mm {
            return 0.0;
        }
        let span = self.empty_baseline_mm - self.full_baseline_mm;
        (self.empty_baseline_mm - distance_mm) / span * 100.0
    }

    /// Water volume for a distance reading, in milliliters.
    pub fn volume_ml(&self, distance_mm: f64) -> f64 {
        self.level_pct(distance_mm) / 100.0 * f64::from(self.bottle_capacity_ml)
    }
}

/// Which half of the ritual is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    /// Bottle empty: capture the longest echo distance.
    Empty,
    /// Bottle full: capture the shortest echo distance.
    Full,
}

impl CalibrationStep {
    fn label(self) -> &'static str {
        match self {
            CalibrationStep::Empty => "empty",
            CalibrationStep::Full => "full",
        }
    }
}

/// What a single fed reading did to the ritual.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutcome {
    /// The reading was buffered; the step needs more samples.
    Collecting { step: CalibrationStep, collected: usize },
    /// The step's buffer filled and its baseline was captured.
    StepComplete {
        step: CalibrationStep,
        baseline_mm: f64,
    },
    /// The full step finished and validation passed; the calibration is
    /// ready to persist.
    Completed(Calibration),
}

#[derive(Debug)]
enum EngineState {
    Idle,
    Collecting {
        step: CalibrationStep,
        buffer: Vec<f64>,
    },
}

/// Drives the ritual `Idle -> CollectingEmpty -> Idle -> CollectingFull ->
/// Idle`, holding at most one armed step at a time.
///
/// Not internally synchronized; the session coordinator serializes access so
/// each reading is attributed to at most one step.
#[derive(Debug)]
pub struct CalibrationEngine {
    state: EngineState,
    empty_baseline_mm: Option<f64>,
    full_baseline_mm: Option<f64>,
    bottle_capacity_ml: u32,
    samples_per_step: usize,
    calibration: Option<Calibration>,
}

impl CalibrationEngine {
    pub fn new(bottle_capacity_ml: u32) -> Self {
        Self {
            state: EngineState::Idle,
            empty_baseline_mm: None,
            full_baseline_mm: None,
            bottle_capacity_ml,
            samples_per_step: SAMPLES_PER_STEP,
            calibration: None,
        }
    }

    /// Override how many readings each step buffers before reducing.
    pub fn with_sample_count(mut self, samples_per_step: usize) -> Self {
        self.samples_per_step = samples_per_step.max(1);
        self
    }

    /// Arm a collection step. Re-arming a step that is already collecting
    /// restarts it with an empty buffer.
    pub fn begin_step(&mut self, step: CalibrationStep) {
        log::info!("Calibration: collecting {} baseline", step.label());
        self.state = EngineState::Collecting {
            step,
            buffer: Vec::with_capacity(self.samples_per_step),
        };
    }

    /// True while a step is armed and consuming readings.
    pub fn is_collecting(&self) -> bool {
        matches!(self.state, EngineState::Collecting { .. })
    }

    /// Feed one distance reading to the armed step.
    ///
    /// On the step's final sample the buffer is reduced to its extreme
    /// value: the maximum for the empty step and the minimum for the full
    /// step. One-sided occlusion noise (a hand in front of the sensor)
    /// can only shorten the echo, so the extremes are the stable readings.
    /// Finishing the full step also attempts completion.
    pub fn feed(&mut self, distance_mm: f64) -> Result<FeedOutcome, CalibrationError> {
        let EngineState::Collecting { step, buffer } = &mut self.state else {
            return Err(CalibrationError::NotCollecting);
        };
        let step = *step;

        buffer.push(distance_mm);
        if buffer.len() < self.samples_per_step {
            return Ok(FeedOutcome::Collecting {
                step,
                collected: buffer.len(),
            });
        }

        let baseline_mm = match step {
            CalibrationStep::Empty => buffer.iter().copied().fold(f64::MIN, f64::max),
            CalibrationStep::Full => buffer.iter().copied().fold(f64::MAX, f64::min),
        };
        self.state = EngineState::Idle;

        match step {
            CalibrationStep::Empty => {
                self.empty_baseline_mm = Some(baseline_mm);
                log::info!("Calibration: empty baseline captured at {}mm", baseline_mm);
                Ok(FeedOutcome::StepComplete { step, baseline_mm })
            }
            CalibrationStep::Full => {
                self.full_baseline_mm = Some(baseline_mm);
                log::info!("Calibration: full baseline captured at {}mm", baseline_mm);
                self.complete().map(FeedOutcome::Completed)
            }
        }
    }

    /// Validate the captured baselines and produce the calibration.
    ///
    /// On an inverted pair the previously completed calibration (if any) is
    /// left untouched and the caller must redo the ritual.
    pub fn complete(&mut self) -> Result<Calibration, CalibrationError> {
        let empty_mm = self
            .empty_baseline_mm
            .ok_or(CalibrationError::MissingBaseline("empty"))?;
        let full_mm = self
            .full_baseline_mm
            .ok_or(CalibrationError::MissingBaseline("full"))?;

        if empty_mm <= full_mm || full_mm <= 0.0 {
            log::warn!(
                "Calibration rejected: empty {}mm must exceed full {}mm",
                empty_mm,
                full_mm
            );
            return Err(CalibrationError::CalibrationInvalid { empty_mm, full_mm });
        }

        let calibration = Calibration {
            empty_baseline_mm: empty_mm,
            full_baseline_mm: full_mm,
            bottle_capacity_ml: self.bottle_capacity_ml,
            calibrated_at: Utc::now(),
            is_complete: true,
        };
        self.calibration = Some(calibration.clone());
        Ok(calibration)
    }

    /// Abandon any armed step, discarding its buffer. Captured baselines and
    /// any completed calibration survive.
    pub fn cancel(&mut self) {
        if self.is_collecting() {
            log::info!("Calibration: collection cancelled");
        }
        self.state = EngineState::Idle;
    }

    /// Replace the active calibration, e.g. with one loaded from the store.
    /// Incomplete records are ignored.
    pub fn install(&mut self, calibration: Option<Calibration>) {
        self.calibration = calibration.filter(|c| c.is_complete);
        self.empty_baseline_mm = self.calibration.as_ref().map(|c| c.empty_baseline_mm);
        self.full_baseline_mm = self.calibration.as_ref().map(|c| c.full_baseline_mm);
    }

    /// The active completed calibration, if any.
    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    /// Level for a distance reading under the active calibration.
    pub fn compute_level_pct(&self, distance_mm: f64) -> Option<f64> {
        self.calibration.as_ref().map(|c| c.level_pct(distance_mm))
    }

    /// Volume for a distance reading under the active calibration.
    pub fn compute_volume_ml(&self, distance_mm: f64) -> Option<f64> {
        self.calibration.as_ref().map(|c| c.volume_ml(distance_mm))
    }
}
