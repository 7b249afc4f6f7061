//! Core deterministic primitives.
//!
//! Everything a command batch is made of must encode to the same bytes on
//! every peer. These types carry no floats and no platform-dependent layout.

pub mod fixed;
pub mod vec2;
pub mod hash;

// Re-export core types
pub use fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use vec2::FixedVec2;
pub use hash::{BatchDigest, DigestInput, LockstepHasher};
