//! One peer process: listener, dialers, session tasks, scheduler, shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::{PeerInfo, ShoalConfig};
use crate::storage::PieceStore;
use crate::swarm::{ChokeScheduler, EventLog, EventSink, Swarm, SwarmEvent, SwarmParams};
use crate::wire::{MessageCodec, PeerConnection, PeerError, PeerId};
use crate::{ShoalError, swarm};

/// A peer ready to join the swarm.
///
/// Owns the bound listener, so neighbors can dial in as soon as this exists.
pub struct PeerProcess {
    config: ShoalConfig,
    local_id: PeerId,
    listener: TcpListener,
    store: Arc<dyn PieceStore>,
    sink: Arc<dyn EventSink>,
}

impl PeerProcess {
    /// Binds the port configured for `local_id` on all interfaces.
    ///
    /// # Errors
    /// - `ShoalError::UnknownPeer` - `local_id` is not in the peer list
    /// - `ShoalError::Configuration` - Store does not match the piece layout
    /// - `ShoalError::Io` - Port could not be bound
    pub async fn bind(
        config: ShoalConfig,
        local_id: PeerId,
        store: Arc<dyn PieceStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ShoalError> {
        let port = config
            .peer(local_id)
            .ok_or(ShoalError::UnknownPeer { peer_id: local_id })?
            .port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Self::from_listener(config, local_id, listener, store, sink)
    }

    /// Uses an already bound listener.
    ///
    /// # Errors
    /// - `ShoalError::UnknownPeer` - `local_id` is not in the peer list
    /// - `ShoalError::Configuration` - Store does not match the piece layout
    pub fn from_listener(
        config: ShoalConfig,
        local_id: PeerId,
        listener: TcpListener,
        store: Arc<dyn PieceStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ShoalError> {
        if config.peer(local_id).is_none() {
            return Err(ShoalError::UnknownPeer { peer_id: local_id });
        }
        let piece_count = config.swarm.layout().piece_count();
        if store.piece_count() != piece_count {
            return Err(ShoalError::Configuration {
                reason: format!(
                    "store holds {} pieces, layout has {piece_count}",
                    store.piece_count()
                ),
            });
        }

        Ok(Self {
            config,
            local_id,
            listener,
            store,
            sink,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until every configured peer is known to hold the complete file.
    ///
    /// # Errors
    /// - `ShoalError::LocalFault` - The piece store failed repeatedly
    pub async fn run(self) -> Result<(), ShoalError> {
        let PeerProcess {
            config,
            local_id,
            listener,
            store,
            sink,
        } = self;

        let seed = config.runtime.rng_seed.unwrap_or_else(rand::random);
        let mut master = ChaCha8Rng::seed_from_u64(seed);
        let layout = config.swarm.layout();
        let neighbors = config.neighbors_of(local_id);

        tracing::info!(
            peer = %local_id,
            seed,
            pieces = layout.piece_count(),
            neighbors = neighbors.len(),
            complete = store.is_complete(),
            "Starting peer"
        );

        let events = EventLog::new(local_id, sink);
        let swarm = Arc::new(Swarm::new(SwarmParams {
            local_id,
            neighbors: neighbors.clone(),
            layout,
            store,
            events: events.clone(),
            rng: ChaCha8Rng::from_rng(&mut master),
        }));
        let codec = MessageCodec::new(layout.max_frame_len());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connection_tx, mut connection_rx) = mpsc::unbounded_channel();
        let mut background = JoinSet::new();

        background.spawn(accept_loop(
            listener,
            local_id,
            neighbors,
            connection_tx.clone(),
            events.clone(),
            shutdown_rx.clone(),
        ));
        for target in config.dial_targets(local_id) {
            background.spawn(dial(
                target.clone(),
                local_id,
                DialPolicy {
                    attempts: config.runtime.connect_attempts,
                    backoff: config.runtime.connect_backoff,
                },
                connection_tx.clone(),
                events.clone(),
                shutdown_rx.clone(),
            ));
        }
        drop(connection_tx);

        let scheduler = ChokeScheduler::new(
            Arc::clone(&swarm),
            config.swarm.preferred_neighbors,
            config.swarm.unchoking_interval,
            config.swarm.optimistic_unchoking_interval,
            ChaCha8Rng::from_rng(&mut master),
        );
        background.spawn(scheduler.run(shutdown_rx.clone()));

        let mut sessions = JoinSet::new();
        let mut recheck = tokio::time::interval(config.swarm.unchoking_interval);

        let outcome = loop {
            if swarm.has_local_fault() {
                break Err(ShoalError::LocalFault {
                    faults: swarm::MAX_CONSECUTIVE_STORE_FAULTS,
                });
            }
            if swarm.is_swarm_complete() {
                break Ok(());
            }

            tokio::select! {
                Some(connection) = connection_rx.recv() => {
                    sessions.spawn(run_session(
                        Arc::clone(&swarm),
                        connection,
                        codec,
                        shutdown_rx.clone(),
                    ));
                }
                Some(joined) = sessions.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Session task failed");
                    }
                }
                _ = swarm.changed() => {}
                _ = recheck.tick() => {}
            }
        };

        match &outcome {
            Ok(()) => {
                tracing::info!(peer = %local_id, "Every peer holds the complete file");
                events.emit(SwarmEvent::SwarmComplete);
            }
            Err(e) => tracing::error!(peer = %local_id, error = %e, "Stopping on local fault"),
        }

        let _ = shutdown_tx.send(true);
        drop(connection_rx);
        shutdown(&swarm, sessions, background, config.runtime.shutdown_grace).await;
        outcome
    }
}

/// Lets session tasks drain their write queues, then aborts whatever is left.
async fn shutdown(
    swarm: &Swarm,
    mut sessions: JoinSet<()>,
    mut background: JoinSet<()>,
    grace: Duration,
) {
    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
        while background.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            sessions = sessions.len(),
            background = background.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutdown grace period elapsed, aborting remaining tasks"
        );
        sessions.abort_all();
        background.abort_all();
        swarm.close_all();
    }
    tracing::debug!("Peer stopped");
}

/// Reads and dispatches one neighbor's messages while its writer drains the outbox.
async fn run_session(
    swarm: Arc<Swarm>,
    connection: PeerConnection,
    codec: MessageCodec,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote_id = connection.remote_id();
    let direction = connection.direction();

    let outbox = match swarm.attach(remote_id, direction) {
        Ok((_handle, outbox)) => outbox,
        Err(e) => {
            tracing::warn!(peer = %remote_id, error = %e, "Rejected session");
            swarm.events().emit(SwarmEvent::HandshakeFailed {
                peer: Some(remote_id),
                reason: e.to_string(),
            });
            return;
        }
    };

    let (mut reader, writer) = connection.into_split(codec);

    let read_loop = async {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = reader.next_message() => match received {
                    Ok(Some(message)) => {
                        if let Err(e) = swarm.handle_message(remote_id, message).await {
                            tracing::warn!(peer = %remote_id, error = %e, "Closing session");
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(peer = %remote_id, "Connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %remote_id, error = %e, "Closing session");
                        break;
                    }
                },
            }
        }
        // Dropping the session closes its outbox, which ends the writer
        swarm.detach(remote_id);
    };

    let (_, written) = tokio::join!(read_loop, writer.drain(outbox));
    if let Err(e) = written {
        tracing::debug!(peer = %remote_id, error = %e, "Writer stopped early");
    }
}

/// Accepts inbound connections and handshakes each on its own task.
async fn accept_loop(
    listener: TcpListener,
    local_id: PeerId,
    allowed: Vec<PeerId>,
    connections: mpsc::UnboundedSender<PeerConnection>,
    events: EventLog,
    mut shutdown: watch::Receiver<bool>,
) {
    let allowed: Arc<[PeerId]> = allowed.into();
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, address) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                tracing::debug!(%address, "Inbound connection");
                handshakes.spawn(handshake_inbound(
                    stream,
                    local_id,
                    Arc::clone(&allowed),
                    connections.clone(),
                    events.clone(),
                ));
            }
            Some(_) = handshakes.join_next() => {}
        }
    }
    tracing::debug!("Listener stopped");
}

async fn handshake_inbound(
    stream: TcpStream,
    local_id: PeerId,
    allowed: Arc<[PeerId]>,
    connections: mpsc::UnboundedSender<PeerConnection>,
    events: EventLog,
) {
    match PeerConnection::accept(stream, local_id, &allowed).await {
        Ok(connection) => {
            let _ = connections.send(connection);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Inbound handshake failed");
            events.emit(SwarmEvent::HandshakeFailed {
                peer: None,
                reason: e.to_string(),
            });
        }
    }
}

/// Retry settings for outbound connections.
#[derive(Debug, Clone, Copy)]
struct DialPolicy {
    attempts: u32,
    backoff: Duration,
}

/// Dials one earlier peer, retrying while it is not yet listening.
async fn dial(
    target: PeerInfo,
    local_id: PeerId,
    policy: DialPolicy,
    connections: mpsc::UnboundedSender<PeerConnection>,
    events: EventLog,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote_id = target.peer_id;

    for attempt in 1..=policy.attempts.max(1) {
        match connect_once(&target, local_id).await {
            Ok(connection) => {
                let _ = connections.send(connection);
                return;
            }
            Err(PeerError::HandshakeMismatch { reason }) => {
                tracing::warn!(peer = %remote_id, %reason, "Outbound handshake failed");
                events.emit(SwarmEvent::HandshakeFailed {
                    peer: Some(remote_id),
                    reason,
                });
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %remote_id, attempt, error = %e, "Dial failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(policy.backoff) => {}
        }
    }

    tracing::warn!(
        peer = %remote_id,
        host = %target.host,
        port = target.port,
        "Giving up on neighbor"
    );
}

async fn connect_once(target: &PeerInfo, local_id: PeerId) -> Result<PeerConnection, PeerError> {
    let address = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {}", target.host),
            )
        })?;
    PeerConnection::connect(address, local_id, target.peer_id).await
}
