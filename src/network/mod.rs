//! Network Layer
//!
//! Authority and peer roles plus the transports that carry their messages.
//! The roles are synchronous state machines; the transports here only move
//! messages and clock time into them.

pub mod authority;
pub mod client;
pub mod driver;
pub mod loopback;
pub mod peer_role;
pub mod protocol;
pub mod server;

pub use authority::{AuthorityRole, AuthorityStats, Outbound, Recipient};
pub use client::{run_peer, ClientError, PeerEvent};
pub use driver::{spawn_authority, ConnectionId, DriverConfig, DriverInput};
pub use loopback::LoopbackNetwork;
pub use peer_role::{PeerError, PeerReaction, PeerRole};
pub use protocol::{AuthorityMessage, PauseReason, PeerMessage, RejectReason, SessionStartInfo};
pub use server::{LockstepServer, ServerConfig, ServerError};
