//! # RTS Lockstep
//!
//! Deterministic lockstep command synchronization for real-time strategy
//! simulations. Peers never exchange world state: they exchange commands,
//! agree on one ordered batch per turn, and apply it to their own copy of
//! the world at the same turn.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RTS LOCKSTEP                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── fixed.rs    - Q16.16 fixed-point arithmetic             │
//! │  ├── vec2.rs     - 2D vector with fixed-point                │
//! │  └── hash.rs     - Batch digests                             │
//! │                                                              │
//! │  lockstep/       - Synchronization (deterministic, sync)     │
//! │  ├── command.rs  - Commands and per-turn batches             │
//! │  ├── producer.rs - Local command queue                       │
//! │  ├── scheduler.rs- Turn clock and batch assembly             │
//! │  ├── barrier.rs  - Acknowledgement barrier                   │
//! │  ├── calibrator.rs- Turn length / timeout calibration        │
//! │  ├── applier.rs  - Ordered batch replay onto a world         │
//! │  └── session.rs  - Roster and configuration                  │
//! │                                                              │
//! │  network/        - Roles and transports                      │
//! │  ├── authority.rs- Authority state machine                   │
//! │  ├── peer_role.rs- Participant state machine                 │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── loopback.rs - In-process simulated network              │
//! │  ├── driver.rs   - Tokio authority task                      │
//! │  ├── server.rs   - WebSocket host                            │
//! │  └── client.rs   - WebSocket participant                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! Given the same batches in the same order, every peer makes the same
//! calls on its world:
//! - Batches are ordered by ascending peer id, then submission order
//! - No floating-point values inside commands
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - Turn N+1 is never applied before turn N
//!
//! Timing (turn length, timeouts) is non-deterministic and only decides
//! *when* a batch is released, never *what* it contains.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod lockstep;
pub mod network;

// Re-export commonly used types
pub use core::fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use core::vec2::FixedVec2;
pub use lockstep::{
    Command, CommandBatch, CommandKind, EntityId, EntityWorld, PeerId, SessionConfig,
    SessionContext, TurnNumber,
};
pub use network::{AuthorityRole, LoopbackNetwork, PeerRole};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable naming a JSON session config file.
pub const CONFIG_ENV: &str = "RTS_LOCKSTEP_CONFIG";
