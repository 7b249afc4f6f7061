//! WebSocket Peer Client
//!
//! Connects a [`PeerRole`] to a lockstep host. Local commands arrive on a
//! channel; session progress is reported as [`PeerEvent`]s. The client owns
//! the world for the duration of the session and hands it back when the
//! session ends.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::lockstep::applier::{ApplyReport, EntityWorld};
use crate::lockstep::command::{Command, PeerId};
use crate::lockstep::session::SessionContext;
use super::peer_role::{PeerError, PeerRole};
use super::protocol::{AuthorityMessage, PauseReason, PeerMessage, SessionStartInfo};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message could not be encoded
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The lockstep participant stopped
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Session progress seen by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// The authority started the session.
    Started(SessionStartInfo),
    /// A batch was applied to the world.
    Applied(ApplyReport),
    /// The authority paused the simulation.
    Paused(PauseReason),
    /// The session made progress after a pause.
    Resumed,
}

/// Run `peer_id` against the host at `url`.
///
/// Returns the world once the command channel closes (the client sends
/// `leave` first) or the host closes the connection.
pub async fn run_peer<W: EntityWorld>(
    url: &str,
    peer_id: PeerId,
    context: &SessionContext,
    mut world: W,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<PeerEvent>,
) -> Result<W, ClientError> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut role = PeerRole::new(peer_id, context);

    info!(peer = %peer_id, "Connected to {}", url);
    ws_sender
        .send(Message::Text(role.join_message().to_json()?))
        .await?;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(peer = %peer_id, "Host closed the connection");
                        break;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    _ => continue,
                };
                let message = match AuthorityMessage::from_json(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(peer = %peer_id, "Invalid message: {}", e);
                        continue;
                    }
                };

                let was_started = role.session().is_some();
                let was_paused = role.is_paused();
                let reaction = role.handle(message, &mut world)?;

                if !was_started {
                    if let Some(info) = role.session() {
                        let _ = events.send(PeerEvent::Started(info.clone())).await;
                    }
                }
                match (was_paused, role.pause_reason()) {
                    (false, Some(reason)) => {
                        let _ = events.send(PeerEvent::Paused(reason.clone())).await;
                    }
                    (true, None) => {
                        let _ = events.send(PeerEvent::Resumed).await;
                    }
                    _ => {}
                }
                for reply in reaction.replies {
                    ws_sender.send(Message::Text(reply.to_json()?)).await?;
                }
                if let Some(report) = reaction.applied {
                    let _ = events.send(PeerEvent::Applied(report)).await;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    info!(peer = %peer_id, "Leaving session");
                    ws_sender
                        .send(Message::Text(PeerMessage::Leave { peer_id }.to_json()?))
                        .await?;
                    let _ = ws_sender.close().await;
                    break;
                };
                if let Err(e) = role.submit(command) {
                    warn!(peer = %peer_id, "Command dropped: {}", e);
                }
            }
        }
    }

    Ok(world)
}

// =============================================================================
// TESTS
// =============================================================================
