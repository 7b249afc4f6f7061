//! Lockstep synchronization components.
//!
//! ```text
//! Producer ──► Scheduler ──► Barrier ──► Applier
//!                  ▲            │
//!                  └─Calibrator◄┘
//! ```
//!
//! Everything here is synchronous and driven by explicit `advance(delta)`
//! calls, so the same code runs under a tokio driver, the in-process
//! loopback network, or a test.

pub mod applier;
pub mod barrier;
pub mod calibrator;
pub mod command;
pub mod peer;
pub mod producer;
pub mod scheduler;
pub mod session;

pub use applier::{ApplyError, ApplyReport, CommandApplier, EntityWorld, SkipReason, SkippedCommand};
pub use barrier::{AckOutcome, BarrierRelease, BarrierState, BarrierSynchronizer};
pub use calibrator::{CalibrationConfig, CalibrationStats, LatencyCalibrator};
pub use command::{Command, CommandBatch, CommandKind, EntityId, PeerId, TurnNumber};
pub use peer::PeerState;
pub use producer::{CommandProducer, ProducerError};
pub use scheduler::{SchedulerEvent, SchedulerState, TurnScheduler};
pub use session::{ConfigError, SessionConfig, SessionContext, SessionId};
