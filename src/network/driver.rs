//! Authority Driver
//!
//! Runs an [`AuthorityRole`] on a tokio task. Transports feed it
//! [`DriverInput`]s over one channel; the task ticks the authority on a
//! fixed interval with real elapsed time and fans its messages out to the
//! per-peer senders registered with [`DriverInput::Connect`].
//!
//! Each transport connection carries its own [`ConnectionId`]. A peer id is
//! owned by the first live connection that claims it; inputs from any other
//! connection for that id are dropped.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::lockstep::command::PeerId;
use crate::lockstep::session::SessionContext;
use super::authority::{AuthorityRole, AuthorityStats, Outbound, Recipient};
use super::protocol::{AuthorityMessage, PeerMessage, RejectReason};

/// Transport-assigned id of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

/// Input to the authority task.
#[derive(Debug)]
pub enum DriverInput {
    /// A transport connection for `peer_id` is open.
    Connect {
        /// Connection making the claim
        connection: ConnectionId,
        /// Peer the connection claims to be
        peer_id: PeerId,
        /// Outbound queue of the connection
        sender: mpsc::Sender<AuthorityMessage>,
    },
    /// A message received on `connection`.
    Message {
        /// Connection the message arrived on
        connection: ConnectionId,
        /// The message
        message: PeerMessage,
    },
    /// `connection` closed.
    Disconnect {
        /// Connection that closed
        connection: ConnectionId,
        /// Peer it claimed to be
        peer_id: PeerId,
    },
}

/// Outbound queue of the connection that owns a peer id.
#[derive(Debug)]
struct PeerLink {
    connection: ConnectionId,
    sender: mpsc::Sender<AuthorityMessage>,
}

type PeerLinks = BTreeMap<PeerId, PeerLink>;

fn owns(links: &PeerLinks, peer_id: PeerId, connection: ConnectionId) -> bool {
    links
        .get(&peer_id)
        .is_some_and(|link| link.connection == connection)
}

/// Authority task settings.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// How often the authority clock is advanced
    pub tick_interval: Duration,
    /// Capacity of the input channel
    pub channel_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            channel_capacity: 256,
        }
    }
}

/// Spawn the authority for `context`.
///
/// The task ends when the session finishes (every peer left after start)
/// or when every input sender is dropped, and yields the final counters.
pub fn spawn_authority(
    context: SessionContext,
    config: DriverConfig,
) -> (mpsc::Sender<DriverInput>, JoinHandle<AuthorityStats>) {
    let (input_tx, input_rx) = mpsc::channel(config.channel_capacity);
    let handle = tokio::spawn(run_authority(
        AuthorityRole::new(context),
        input_rx,
        config.tick_interval,
    ));
    (input_tx, handle)
}

async fn run_authority(
    mut authority: AuthorityRole,
    mut inputs: mpsc::Receiver<DriverInput>,
    tick_interval: Duration,
) -> AuthorityStats {
    let mut senders = PeerLinks::new();
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick = Instant::now();

    info!(session = %authority.context().session_id, "Authority task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let out = authority.advance(now - last_tick);
                last_tick = now;
                deliver(&mut authority, &mut senders, out).await;
            }
            input = inputs.recv() => {
                let Some(input) = input else {
                    debug!("Input channel closed");
                    break;
                };
                let out = match input {
                    DriverInput::Connect { connection, peer_id, sender } => {
                        register(&mut senders, connection, peer_id, sender).await;
                        Vec::new()
                    }
                    DriverInput::Message { connection, message } => {
                        if owns(&senders, message.peer_id(), connection) {
                            authority.handle(message)
                        } else {
                            warn!(
                                peer = %message.peer_id(),
                                ?connection,
                                "Dropping message from a connection that does not own the peer"
                            );
                            Vec::new()
                        }
                    }
                    DriverInput::Disconnect { connection, peer_id } => {
                        if owns(&senders, peer_id, connection) {
                            senders.remove(&peer_id);
                            authority.peer_disconnected(peer_id)
                        } else {
                            Vec::new()
                        }
                    }
                };
                deliver(&mut authority, &mut senders, out).await;
            }
        }

        if authority.is_finished() {
            info!("Every peer left, session finished");
            break;
        }
    }

    authority.stats().clone()
}

/// Give `peer_id` to `connection` unless a live connection already has it.
async fn register(
    senders: &mut PeerLinks,
    connection: ConnectionId,
    peer_id: PeerId,
    sender: mpsc::Sender<AuthorityMessage>,
) {
    if let Some(link) = senders.get(&peer_id) {
        if !link.sender.is_closed() {
            warn!(peer = %peer_id, ?connection, owner = ?link.connection, "Peer id already connected");
            let _ = sender
                .send(AuthorityMessage::Rejected {
                    reason: RejectReason::AlreadyConnected,
                })
                .await;
            return;
        }
    }
    debug!(peer = %peer_id, ?connection, "Connection registered");
    senders.insert(peer_id, PeerLink { connection, sender });
}

/// Send `out` to the registered connections.
///
/// A connection whose queue is gone counts as a disconnect, which may
/// produce more messages.
async fn deliver(
    authority: &mut AuthorityRole,
    senders: &mut PeerLinks,
    out: Vec<Outbound>,
) {
    let mut pending = out;
    while !pending.is_empty() {
        let mut closed = Vec::new();
        for Outbound { recipient, message } in std::mem::take(&mut pending) {
            let targets: Vec<PeerId> = match recipient {
                Recipient::All => senders
                    .keys()
                    .copied()
                    .filter(|&peer_id| authority.scheduler().peer(peer_id).is_some())
                    .collect(),
                Recipient::Peer(peer_id) => vec![peer_id],
            };
            for peer_id in targets {
                let Some(link) = senders.get(&peer_id) else {
                    continue;
                };
                if link.sender.send(message.clone()).await.is_err() {
                    closed.push(peer_id);
                }
            }
        }
        for peer_id in closed {
            if senders.remove(&peer_id).is_some() {
                debug!(peer = %peer_id, "Connection queue closed");
                pending.extend(authority.peer_disconnected(peer_id));
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
