//! Latency Calibrator
//!
//! Watches how long peers take to acknowledge each batch and resizes the
//! turn to match. While a calibration cycle is active every released batch
//! contributes one round-trip sample; once enough samples are in, the ack
//! timeout becomes the (clamped) running average and the turn duration a
//! third of it.
//!
//! ```text
//! sample ──► avg = (avg + sample) / 2 ──► n == samples_per_adjustment?
//!                                              │ yes
//!                                              ▼
//!            ack_timeout   = clamp(avg, ack_timeout_bounds)
//!            turn_duration = clamp(ack_timeout / 3, turn_duration_bounds)
//! ```
//!
//! Calibration runs at session start and again whenever the session stalls
//! `stalls_before_recalibration` times.

use std::time::Duration;

use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use super::session::{millis, ConfigError};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Inclusive duration range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationRange {
    /// Lower bound
    #[serde(with = "millis")]
    pub min: Duration,
    /// Upper bound
    #[serde(with = "millis")]
    pub max: Duration,
}

impl DurationRange {
    /// Range from millisecond bounds.
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Clamp `value` into the range.
    pub fn clamp(&self, value: Duration) -> Duration {
        value.clamp(self.min, self.max)
    }

    /// Whether `value` lies in the range.
    pub fn contains(&self, value: Duration) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Turn timing configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Turn duration before the first calibration completes.
    #[serde(with = "millis")]
    pub initial_turn_duration: Duration,
    /// Ack timeout before the first calibration completes.
    #[serde(with = "millis")]
    pub initial_ack_timeout: Duration,
    /// Bounds for calibrated turn durations.
    pub turn_duration_bounds: DurationRange,
    /// Bounds for calibrated ack timeouts.
    pub ack_timeout_bounds: DurationRange,
    /// Round trips averaged per calibration cycle.
    pub samples_per_adjustment: u32,
    /// Stalls that trigger a new calibration cycle.
    pub stalls_before_recalibration: u32,
    /// Start the session with a calibration cycle.
    pub calibrate_on_start: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            initial_turn_duration: Duration::from_millis(200),
            initial_ack_timeout: Duration::from_millis(400),
            turn_duration_bounds: DurationRange::from_millis(200, 400),
            ack_timeout_bounds: DurationRange::from_millis(600, 800),
            samples_per_adjustment: 10,
            stalls_before_recalibration: 5,
            calibrate_on_start: true,
        }
    }
}

impl CalibrationConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, range) in [
            ("turn_duration_bounds", self.turn_duration_bounds),
            ("ack_timeout_bounds", self.ack_timeout_bounds),
        ] {
            if range.min > range.max {
                return Err(ConfigError::Invalid(format!(
                    "{name}: min {:?} exceeds max {:?}",
                    range.min, range.max
                )));
            }
        }
        if self.turn_duration_bounds.min.is_zero() || self.initial_turn_duration.is_zero() {
            return Err(ConfigError::Invalid("turn durations must be positive".into()));
        }
        if self.samples_per_adjustment == 0 {
            return Err(ConfigError::Invalid(
                "samples_per_adjustment must be at least 1".into(),
            ));
        }
        if self.stalls_before_recalibration == 0 {
            return Err(ConfigError::Invalid(
                "stalls_before_recalibration must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// STATS
// =============================================================================

/// Current timing parameters and calibration progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationStats {
    /// Length of one turn.
    pub current_turn_duration: Duration,
    /// How long to wait for submissions or acks before pausing.
    pub current_ack_timeout: Duration,
    /// Running average of the current (or last) calibration cycle.
    pub rolling_average_round_trip: Duration,
    /// Samples taken in the current cycle.
    pub samples_collected: u32,
    /// Samples needed before the cycle adjusts timing.
    pub samples_required_before_adjustment: u32,
    /// Stalls seen since timing was last adjusted.
    pub stall_count_since_last_adjustment: u32,
}

/// Timing change produced at the end of a calibration cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibrationAdjustment {
    /// Average round trip the cycle measured
    pub average_round_trip: Duration,
    /// New ack timeout
    pub ack_timeout: Duration,
    /// New turn duration
    pub turn_duration: Duration,
}

// =============================================================================
// CALIBRATOR
// =============================================================================

/// Owns [`CalibrationStats`]; the only writer of turn timing.
#[derive(Clone, Debug)]
pub struct LatencyCalibrator {
    config: CalibrationConfig,
    stats: CalibrationStats,
    calibrating: bool,
    adjustments: u32,
}

impl LatencyCalibrator {
    /// Create a calibrator from a validated config.
    pub fn new(config: CalibrationConfig) -> Self {
        let stats = CalibrationStats {
            current_turn_duration: config.initial_turn_duration,
            current_ack_timeout: config.initial_ack_timeout,
            rolling_average_round_trip: Duration::ZERO,
            samples_collected: 0,
            samples_required_before_adjustment: config.samples_per_adjustment,
            stall_count_since_last_adjustment: 0,
        };
        Self {
            calibrating: config.calibrate_on_start,
            config,
            stats,
            adjustments: 0,
        }
    }

    /// Current timing.
    pub fn stats(&self) -> &CalibrationStats {
        &self.stats
    }

    /// Whether a calibration cycle is collecting samples.
    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    /// Completed calibration cycles.
    pub fn adjustments(&self) -> u32 {
        self.adjustments
    }

    /// Record one batch's broadcast-to-ack round trip.
    ///
    /// Returns the new timing when this sample completes a cycle. Samples
    /// outside a cycle are ignored.
    pub fn record_round_trip(&mut self, sample: Duration) -> Option<CalibrationAdjustment> {
        if !self.calibrating {
            return None;
        }

        self.stats.rolling_average_round_trip = if self.stats.samples_collected == 0 {
            sample
        } else {
            (self.stats.rolling_average_round_trip + sample) / 2
        };
        self.stats.samples_collected += 1;

        if self.stats.samples_collected < self.stats.samples_required_before_adjustment {
            return None;
        }

        let average = self.stats.rolling_average_round_trip;
        let ack_timeout = self.config.ack_timeout_bounds.clamp(average);
        let turn_duration = self.config.turn_duration_bounds.clamp(ack_timeout / 3);

        self.stats.current_ack_timeout = ack_timeout;
        self.stats.current_turn_duration = turn_duration;
        self.stats.samples_collected = 0;
        self.stats.stall_count_since_last_adjustment = 0;
        self.calibrating = false;
        self.adjustments += 1;

        info!(
            average_ms = average.as_millis() as u64,
            ack_timeout_ms = ack_timeout.as_millis() as u64,
            turn_duration_ms = turn_duration.as_millis() as u64,
            "Calibration cycle complete"
        );

        Some(CalibrationAdjustment {
            average_round_trip: average,
            ack_timeout,
            turn_duration,
        })
    }

    /// Record that the session had to pause for a straggler.
    ///
    /// Returns true when this stall started a new calibration cycle.
    pub fn record_stall(&mut self) -> bool {
        self.stats.stall_count_since_last_adjustment =
            self.stats.stall_count_since_last_adjustment.saturating_add(1);

        if self.calibrating
            || self.stats.stall_count_since_last_adjustment < self.config.stalls_before_recalibration
        {
            return false;
        }

        warn!(
            stalls = self.stats.stall_count_since_last_adjustment,
            "Repeated stalls, recalibrating turn timing"
        );
        self.calibrating = true;
        self.stats.samples_collected = 0;
        self.stats.stall_count_since_last_adjustment = 0;
        true
    }
}

// =============================================================================
// TESTS
// =============================================================================
