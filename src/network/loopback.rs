//! Loopback Network
//!
//! Runs an authority and every peer in one process on a simulated clock.
//! Each peer has a one-way latency; messages are delivered in
//! (delivery time, send order) order, so a run is fully reproducible. Used
//! for local sessions, the demo binary, tests and benchmarks.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::lockstep::applier::{ApplyReport, EntityWorld};
use crate::lockstep::command::{Command, PeerId};
use crate::lockstep::producer::ProducerError;
use crate::lockstep::session::SessionContext;
use super::authority::{AuthorityRole, Outbound, Recipient};
use super::peer_role::{PeerError, PeerRole};
use super::protocol::{AuthorityMessage, PeerMessage};

/// A message on the simulated wire.
#[derive(Clone, Debug)]
enum Packet {
    ToAuthority(PeerMessage),
    ToPeer(PeerId, AuthorityMessage),
}

/// One simulated participant.
struct LoopbackPeer<W> {
    role: PeerRole,
    world: W,
    latency: Duration,
    connected: bool,
    reports: Vec<ApplyReport>,
    error: Option<PeerError>,
}

/// In-process lockstep session.
pub struct LoopbackNetwork<W: EntityWorld> {
    authority: AuthorityRole,
    peers: BTreeMap<PeerId, LoopbackPeer<W>>,
    wire: BTreeMap<(Duration, u64), Packet>,
    now: Duration,
    sequence: u64,
    delivered: u64,
}

impl<W: EntityWorld> LoopbackNetwork<W> {
    /// Create a session with one world per peer.
    ///
    /// Peers missing from `worlds` are on the roster but never connect.
    pub fn new(context: SessionContext, worlds: impl IntoIterator<Item = (PeerId, W)>) -> Self {
        let peers = worlds
            .into_iter()
            .map(|(peer_id, world)| {
                let peer = LoopbackPeer {
                    role: PeerRole::new(peer_id, &context),
                    world,
                    latency: Duration::ZERO,
                    connected: true,
                    reports: Vec::new(),
                    error: None,
                };
                (peer_id, peer)
            })
            .collect();

        Self {
            authority: AuthorityRole::new(context),
            peers,
            wire: BTreeMap::new(),
            now: Duration::ZERO,
            sequence: 0,
            delivered: 0,
        }
    }

    /// Set a peer's one-way latency. Applies to messages sent afterwards.
    pub fn set_latency(&mut self, peer_id: PeerId, one_way: Duration) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.latency = one_way;
        }
    }

    /// Send every peer's join handshake.
    pub fn join_all(&mut self) {
        let joins: Vec<_> = self
            .peers
            .values()
            .filter(|peer| peer.connected)
            .map(|peer| (peer.latency, peer.role.join_message()))
            .collect();
        for (latency, message) in joins {
            self.send(latency, Packet::ToAuthority(message));
        }
    }

    /// Queue a local command on a peer.
    pub fn submit(&mut self, peer_id: PeerId, command: Command) -> Result<(), ProducerError> {
        match self.peers.get_mut(&peer_id) {
            Some(peer) if peer.connected => peer.role.submit(command),
            _ => Err(ProducerError::NotReady),
        }
    }

    /// Drop a peer's connection.
    pub fn disconnect(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.connected = false;
        }
        let out = self.authority.peer_disconnected(peer_id);
        self.dispatch(out);
    }

    /// Advance simulated time by `delta` and deliver everything due.
    pub fn step(&mut self, delta: Duration) {
        self.now += delta;

        let out = self.authority.advance(delta);
        self.dispatch(out);
        self.deliver_due();

        for peer in self.peers.values_mut().filter(|peer| peer.connected) {
            peer.role.advance(delta);
        }
    }

    /// Step until `done` holds or `limit` of simulated time passes.
    ///
    /// Returns whether `done` was reached.
    pub fn run_until(
        &mut self,
        step: Duration,
        limit: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> bool {
        let deadline = self.now + limit;
        while self.now < deadline {
            if done(&*self) {
                return true;
            }
            self.step(step);
        }
        done(&*self)
    }

    /// Step until every connected peer applied `turn`.
    pub fn run_until_turn(&mut self, turn: u64, step: Duration, limit: Duration) -> bool {
        self.run_until(step, limit, |net| {
            net.peers
                .values()
                .filter(|peer| peer.connected)
                .all(|peer| peer.role.last_applied_turn() >= turn)
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// The authority.
    pub fn authority(&self) -> &AuthorityRole {
        &self.authority
    }

    /// A peer's role.
    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerRole> {
        self.peers.get(&peer_id).map(|peer| &peer.role)
    }

    /// A peer's world.
    pub fn world(&self, peer_id: PeerId) -> Option<&W> {
        self.peers.get(&peer_id).map(|peer| &peer.world)
    }

    /// Reports of every batch a peer applied, in order.
    pub fn reports(&self, peer_id: PeerId) -> &[ApplyReport] {
        self.peers
            .get(&peer_id)
            .map(|peer| peer.reports.as_slice())
            .unwrap_or(&[])
    }

    /// The error that stopped a peer, if any.
    pub fn peer_error(&self, peer_id: PeerId) -> Option<&PeerError> {
        self.peers.get(&peer_id).and_then(|peer| peer.error.as_ref())
    }

    /// Whether the authority still considers the peer connected.
    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.peers.get(&peer_id).is_some_and(|peer| peer.connected)
    }

    // -------------------------------------------------------------------------
    // Wire
    // -------------------------------------------------------------------------

    fn send(&mut self, latency: Duration, packet: Packet) {
        self.sequence += 1;
        self.wire.insert((self.now + latency, self.sequence), packet);
    }

    fn dispatch(&mut self, out: Vec<Outbound>) {
        for Outbound { recipient, message } in out {
            let targets: Vec<(PeerId, Duration)> = match recipient {
                Recipient::All => self
                    .peers
                    .iter()
                    .filter(|(_, peer)| peer.connected)
                    .map(|(&id, peer)| (id, peer.latency))
                    .collect(),
                Recipient::Peer(id) => self
                    .peers
                    .get(&id)
                    .filter(|peer| peer.connected)
                    .map(|peer| vec![(id, peer.latency)])
                    .unwrap_or_default(),
            };
            for (peer_id, latency) in targets {
                self.send(latency, Packet::ToPeer(peer_id, message.clone()));
            }
        }
    }

    fn deliver_due(&mut self) {
        while let Some(entry) = self.wire.first_entry() {
            if entry.key().0 > self.now {
                break;
            }
            let packet = entry.remove();
            self.delivered += 1;
            match packet {
                Packet::ToAuthority(message) => {
                    let out = self.authority.handle(message);
                    self.dispatch(out);
                }
                Packet::ToPeer(peer_id, message) => self.deliver_to_peer(peer_id, message),
            }
        }
    }

    fn deliver_to_peer(&mut self, peer_id: PeerId, message: AuthorityMessage) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.connected {
            debug!(peer = %peer_id, "Dropping message for disconnected peer");
            return;
        }

        match peer.role.handle(message, &mut peer.world) {
            Ok(reaction) => {
                if let Some(report) = reaction.applied {
                    peer.reports.push(report);
                }
                let latency = peer.latency;
                for reply in reaction.replies {
                    self.send(latency, Packet::ToAuthority(reply));
                }
            }
            Err(e) => {
                match &e {
                    PeerError::Desync(_) | PeerError::MissingBatch(_) => {
                        error!(peer = %peer_id, "Peer desynchronized: {}", e)
                    }
                    _ => warn!(peer = %peer_id, "Peer stopped: {}", e),
                }
                peer.error = Some(e);
                peer.connected = false;
                let out = self.authority.peer_disconnected(peer_id);
                self.dispatch(out);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
