//! Session Context and Configuration
//!
//! A [`SessionContext`] is built once per session and handed to every
//! lockstep component's constructor. There is no global session state.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::fixed::{from_f32, Fixed};
use super::calibrator::CalibrationConfig;
use super::command::PeerId;

/// Unique identifier of one lockstep session.
pub type SessionId = Uuid;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values are out of range or inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),

    /// A session needs at least one peer
    #[error("session roster is empty")]
    EmptyRoster,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Tunables for one lockstep session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Turn timing and adaptive calibration.
    pub calibration: CalibrationConfig,

    /// Evict peers that keep the session paused for longer than this.
    /// `None` waits forever.
    #[serde(with = "optional_millis")]
    pub straggler_eviction_after: Option<Duration>,

    /// Snap entities back to a command's origin when they drifted further
    /// than this many map units. `None` disables snapping.
    pub snap_distance: Option<f32>,

    /// Cap on distinct sources with a pending command on one peer.
    pub max_pending_commands: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            calibration: CalibrationConfig::default(),
            straggler_eviction_after: None,
            snap_distance: Some(5.0),
            max_pending_commands: 256,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.calibration.validate()?;

        if self.max_pending_commands == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_commands must be at least 1".into(),
            ));
        }
        if let Some(distance) = self.snap_distance {
            if !distance.is_finite() || distance < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "snap_distance must be a non-negative number, got {distance}"
                )));
            }
        }
        if self.straggler_eviction_after == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "straggler_eviction_after must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// SESSION CONTEXT
// =============================================================================

/// Everything the lockstep components of one session share.
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// Session identifier
    pub session_id: SessionId,
    /// Peers taking part, in ascending order
    pub roster: BTreeSet<PeerId>,
    /// Validated configuration
    pub config: SessionConfig,
}

impl SessionContext {
    /// Create a context with a fresh session id.
    pub fn new(
        roster: impl IntoIterator<Item = PeerId>,
        config: SessionConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_session_id(Uuid::new_v4(), roster, config)
    }

    /// Create a context for a known session id.
    pub fn with_session_id(
        session_id: SessionId,
        roster: impl IntoIterator<Item = PeerId>,
        config: SessionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let roster: BTreeSet<PeerId> = roster.into_iter().collect();
        if roster.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        Ok(Self {
            session_id,
            roster,
            config,
        })
    }

    /// Snap distance in fixed-point.
    pub fn snap_distance(&self) -> Option<Fixed> {
        self.config.snap_distance.map(from_f32)
    }

    /// Whether `peer_id` belongs to this session.
    pub fn is_member(&self, peer_id: PeerId) -> bool {
        self.roster.contains(&peer_id)
    }
}

// =============================================================================
// DURATION ENCODING
// =============================================================================

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an `Option<Duration>` as whole milliseconds or null.
pub(crate) mod optional_millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.straggler_eviction_after, None);
        assert_eq!(config.snap_distance, Some(5.0));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{ "straggler_eviction_after": 30000, "calibration": { "samples_per_adjustment": 4 } }"#,
        )
        .unwrap();

        assert_eq!(config.straggler_eviction_after, Some(Duration::from_secs(30)));
        assert_eq!(config.calibration.samples_per_adjustment, 4);
        assert_eq!(config.max_pending_commands, 256);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SessionConfig::default();
        let json = config.to_json().unwrap();
        let decoded = SessionConfig::from_json_str(&json).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let json = r#"{ "max_pending_commands": 0 }"#;
        assert!(matches!(
            SessionConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));

        let json = r#"{ "snap_distance": -1.0 }"#;
        assert!(matches!(
            SessionConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let result = SessionConfig::load("/definitely/not/here.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_context_requires_roster() {
        let result = SessionContext::new(Vec::new(), SessionConfig::default());
        assert!(matches!(result, Err(ConfigError::EmptyRoster)));
    }

    #[test]
    fn test_context_roster_sorted() {
        let ctx = SessionContext::new(
            [PeerId(3), PeerId(1), PeerId(2)],
            SessionConfig::default(),
        )
        .unwrap();

        let order: Vec<_> = ctx.roster.iter().copied().collect();
        assert_eq!(order, vec![PeerId(1), PeerId(2), PeerId(3)]);
        assert!(ctx.is_member(PeerId(2)));
        assert!(!ctx.is_member(PeerId(9)));
        assert_eq!(ctx.snap_distance(), Some(5 * crate::core::fixed::FIXED_ONE));
    }
}
