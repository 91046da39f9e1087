//! JSON control envelopes written to the bottle's control characteristic.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Calibration sub-command understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationAction {
    StartEmpty,
    StartFull,
    Complete,
}

/// A structured command envelope. The firmware dispatches on the `action`
/// tag; every envelope carries a unix timestamp so the peripheral can
/// discard stale retransmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    DeepSleep {
        duration_minutes: u32,
        timestamp: i64,
    },
    Calibration {
        step: CalibrationAction,
        timestamp: i64,
    },
    ConfigUpdate {
        config: serde_json::Value,
        timestamp: i64,
    },
}

impl Command {
    pub fn deep_sleep(duration_minutes: u32) -> Self {
        Self::DeepSleep {
            duration_minutes,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn calibration(step: CalibrationAction) -> Self {
        Self::Calibration {
            step,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn config_update(config: serde_json::Value) -> Self {
        Self::ConfigUpdate {
            config,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Serialize the envelope for the control characteristic.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
