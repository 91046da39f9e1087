//! Payload decoder for bottle telemetry notifications.
//!
//! The bottle firmware has shipped three payload shapes over its revisions:
//!
//! 1. Compact JSON: `{"p": 42.0, "d": 85.5}` (percent + distance in mm)
//! 2. Verbose JSON: `{"distance": 85.5, "level": 42.0, ...}` (extra fields
//!    are ignored; `level` is optional)
//! 3. A bare ASCII number: `"85.5"` (distance only)
//!
//! Shapes are tried in that order and the first match wins. A payload that
//! matches none of them is logged, counted and dropped; it never propagates
//! an error into the notification pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Deserialize;

use crate::bluetooth::RawNotification;

/// One decoded sensor reading. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Echo distance from the sensor to the water surface, in millimeters.
    pub distance_mm: f64,
    /// Fill level as self-reported by the firmware, when the payload shape
    /// carried one. Low confidence: the firmware's empty/full assumptions
    /// may differ from the app-side calibration.
    pub raw_level_pct: Option<f64>,
    /// When the payload was decoded.
    pub timestamp: Instant,
    /// Address of the peripheral that produced the payload.
    pub source_id: String,
}

impl SensorReading {
    pub fn new(distance_mm: f64, raw_level_pct: Option<f64>, source_id: impl Into<String>) -> Self {
        Self {
            distance_mm,
            raw_level_pct,
            timestamp: Instant::now(),
            source_id: source_id.into(),
        }
    }
}

/// Compact shape emitted by firmware v2: single-letter keys to fit more
/// history into one notification.
#[derive(Debug, Deserialize)]
struct CompactFrame {
    /// Self-reported fill percent.
    p: f64,
    /// Distance in millimeters.
    d: f64,
}

/// Verbose shape emitted by firmware v1. Carries assorted diagnostic fields
/// we do not model; only `distance` is required.
#[derive(Debug, Deserialize)]
struct VerboseFrame {
    distance: f64,
    #[serde(default)]
    level: Option<f64>,
}

/// Stateless parse cascade plus a drop counter for diagnostics.
pub struct TelemetryDecoder {
    dropped: AtomicU64,
}

impl TelemetryDecoder {
    pub fn new() -> Self {
        Self {
            dropped: AtomicU64::new(0),
        }
    }

    /// Decode one raw notification into a reading, or `None` when no known
    /// shape matches. Dropped payloads are counted, never raised.
    pub fn decode(&self, notification: &RawNotification) -> Option<SensorReading> {
        let parsed = parse_compact(&notification.value)
            .or_else(|| parse_verbose(&notification.value))
            .or_else(|| parse_bare_number(&notification.value));

        match parsed {
            Some((distance_mm, raw_level_pct)) => Some(SensorReading::new(
                distance_mm,
                raw_level_pct,
                notification.source_id.clone(),
            )),
            None => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!(
                    "Dropping unparseable telemetry payload from {} ({} bytes, {} dropped so far)",
                    notification.source_id,
                    notification.value.len(),
                    total
                );
                None
            }
        }
    }

    /// Number of payloads dropped since construction.
    pub fn dropped_payloads(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_compact(payload: &[u8]) -> Option<(f64, Option<f64>)> {
    let frame: CompactFrame = serde_json::from_slice(payload).ok()?;
    if !frame.d.is_finite() || !frame.p.is_finite() {
        return None;
    }
    Some((frame.d, Some(frame.p)))
}

fn parse_verbose(payload: &[u8]) -> Option<(f64, Option<f64>)> {
    let frame: VerboseFrame = serde_json::from_slice(payload).ok()?;
    if !frame.distance.is_finite() {
        return None;
    }
    let level = frame.level.filter(|pct| pct.is_finite());
    Some((frame.distance, level))
}

fn parse_bare_number(payload: &[u8]) -> Option<(f64, Option<f64>)> {
    let text = std::str::from_utf8(payload).ok()?;
    let value: f64 = text.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some((value, None))
}
