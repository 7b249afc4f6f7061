//! WebSocket Lockstep Host
//!
//! Accepts peer connections over WebSocket and bridges them to the
//! authority task. Each connection must open with a `join` message; after
//! that its frames are forwarded to the authority and the authority's
//! messages are written back as JSON text frames.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::lockstep::command::PeerId;
use crate::lockstep::session::{ConfigError, SessionConfig, SessionContext};
use super::authority::AuthorityStats;
use super::driver::{spawn_authority, ConnectionId, DriverConfig, DriverInput};
use super::protocol::{AuthorityMessage, PeerMessage};

/// Host configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Peers allowed to join
    pub roster: BTreeSet<PeerId>,
    /// Authority tick interval
    #[serde(with = "crate::lockstep::session::millis")]
    pub tick_interval: Duration,
    /// Per-connection outbound queue capacity
    pub channel_capacity: usize,
    /// Lockstep session settings
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9400)),
            roster: BTreeSet::from([PeerId(1), PeerId(2)]),
            tick_interval: Duration::from_millis(10),
            channel_capacity: 64,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse and validate a JSON host config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.session.validate()?;
        if config.roster.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        if config.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be at least 1".into()));
        }
        Ok(config)
    }

    /// Read, parse and validate a JSON host config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

/// Host errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid session configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The authority task panicked or was cancelled
    #[error("Authority task failed: {0}")]
    Authority(#[from] JoinError),

    /// The authority task is gone
    #[error("Authority task closed")]
    AuthorityClosed,
}

/// Hosts one lockstep session.
pub struct LockstepServer {
    config: ServerConfig,
    context: SessionContext,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
}

impl LockstepServer {
    /// Validate the configuration and bind the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let context = SessionContext::new(config.roster.iter().copied(), config.session.clone())?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            context,
            listener,
            shutdown_tx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Session this host runs.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Sender that stops [`LockstepServer::run`] when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until the session finishes or shutdown is signalled.
    #[instrument(skip(self), fields(session = %self.context.session_id))]
    pub async fn run(self) -> Result<AuthorityStats, ServerError> {
        info!("Lockstep host listening on {}", self.listener.local_addr()?);

        let driver_config = DriverConfig {
            tick_interval: self.config.tick_interval,
            channel_capacity: self.config.channel_capacity * self.context.roster.len().max(1),
        };
        let (driver, mut authority) = spawn_authority(self.context.clone(), driver_config);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut next_connection = 0u64;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!("New connection from {}", addr);
                            next_connection += 1;
                            let connection = ConnectionId(next_connection);
                            self.handle_connection(stream, addr, connection, driver.clone());
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                stats = &mut authority => {
                    let stats = stats?;
                    info!(turns = stats.turns_released, "Session finished");
                    return Ok(stats);
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Connections see the same signal and drop their driver handles.
        drop(driver);
        Ok(authority.await?)
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        connection: ConnectionId,
        driver: mpsc::Sender<DriverInput>,
    ) {
        let capacity = self.config.channel_capacity;
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(e) = serve_peer(stream, addr, connection, driver, capacity, shutdown_rx).await {
                warn!("Connection {} ended with error: {}", addr, e);
            }
        });
    }
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    connection: ConnectionId,
    driver: mpsc::Sender<DriverInput>,
    capacity: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Handshake: nothing is forwarded until the peer names itself.
    let peer_id = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match PeerMessage::from_json(&text) {
                Ok(PeerMessage::Join { peer_id }) => break peer_id,
                Ok(other) => debug!("Ignoring {:?} from {} before join", other, addr),
                Err(e) => debug!("Invalid message from {}: {}", addr, e),
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            _ => {}
        }
    };

    let (msg_tx, mut msg_rx) = mpsc::channel::<AuthorityMessage>(capacity);
    driver
        .send(DriverInput::Connect {
            connection,
            peer_id,
            sender: msg_tx,
        })
        .await
        .map_err(|_| ServerError::AuthorityClosed)?;
    driver
        .send(DriverInput::Message {
            connection,
            message: PeerMessage::Join { peer_id },
        })
        .await
        .map_err(|_| ServerError::AuthorityClosed)?;

    // Spawn message sender task
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let message = match PeerMessage::from_json(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                debug!(peer = %peer_id, "Invalid message: {}", e);
                                continue;
                            }
                        };
                        if message.peer_id() != peer_id {
                            warn!(peer = %peer_id, claimed = %message.peer_id(), "Dropping message for another peer");
                            continue;
                        }
                        let leaving = matches!(message, PeerMessage::Leave { .. });
                        if driver.send(DriverInput::Message { connection, message }).await.is_err() {
                            break;
                        }
                        if leaving {
                            debug!(peer = %peer_id, "Peer left");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(peer = %peer_id, "Connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(peer = %peer_id, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    let _ = driver.send(DriverInput::Disconnect { connection, peer_id }).await;
    sender_task.abort();
    Ok(())
}
