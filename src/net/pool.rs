//! Connection pool fanning out partial packets to the group.
//!
//! One forwarding task per peer subscribes to an in-process broadcast
//! channel; channels are lazily dialed, so transient failures surface as
//! logged send errors and the next send re-dials under the hood.

use super::protocol::ProtocolClient;
use super::utils::Peer;
use crate::protobuf::randchain::PartialPacket;

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::warn;
use tracing::Span;

pub enum PoolCmd {
    /// Fan the packet out to every registered peer.
    Broadcast(PartialPacket),
    /// Register the peers of a (new) epoch, replacing the previous set.
    AddPeers {
        peers: Vec<Peer>,
        send_timeout: Duration,
    },
    /// Drop all registered peers, e.g. during an epoch transition.
    RemoveAll,
}

pub struct Pool;

impl Pool {
    pub fn start(log: Span) -> PoolSender {
        let (tx_cmd, mut rx_cmd) = mpsc::channel::<PoolCmd>(1);

        debug!(parent: &log, "pool initialized");
        tokio::spawn(async move {
            // Dropping the sender terminates every forwarding task.
            let mut tx_fanout: Option<broadcast::Sender<PartialPacket>> = None;

            while let Some(cmd) = rx_cmd.recv().await {
                match cmd {
                    PoolCmd::Broadcast(packet) => match tx_fanout {
                        Some(ref tx) => {
                            if let Err(err) = tx.send(packet) {
                                error!(parent: &log, "broadcast: no live subscriptions: {err}");
                            }
                        }
                        None => warn!(parent: &log, "broadcast: no peers registered"),
                    },
                    PoolCmd::AddPeers {
                        peers,
                        send_timeout,
                    } => {
                        let (tx, _) = broadcast::channel::<PartialPacket>(8);
                        for peer in peers {
                            subscribe_peer(peer, tx.subscribe(), send_timeout, &log);
                        }
                        tx_fanout = Some(tx);
                    }
                    PoolCmd::RemoveAll => {
                        tx_fanout = None;
                        debug!(parent: &log, "all peers removed from pool");
                    }
                }
            }
        });

        PoolSender { sender: tx_cmd }
    }
}

/// Forwarding task for one peer. Broadcast is best-effort: a failed or
/// timed-out send is logged and the packet is dropped, the connection is
/// re-dialed lazily on the next one.
fn subscribe_peer(
    peer: Peer,
    mut rx: broadcast::Receiver<PartialPacket>,
    send_timeout: Duration,
    log: &Span,
) {
    let log = log.clone();
    tokio::spawn(async move {
        let mut client = match ProtocolClient::new(&peer) {
            Ok(client) => client,
            Err(err) => {
                error!(parent: &log, "pool: unable to create client for {peer}: {err}");
                return;
            }
        };
        debug!(parent: &log, "pool: subscribed {peer}");

        while let Ok(packet) = rx.recv().await {
            let round = packet.round;
            match tokio::time::timeout(send_timeout, client.partial(packet)).await {
                Ok(Ok(())) => {
                    debug!(parent: &log, "sending partial: round {round}, to {peer}");
                }
                Ok(Err(err)) => {
                    error!(parent: &log, "sending partial: round {round}, to {peer}: {err}");
                }
                Err(_) => {
                    error!(parent: &log, "sending partial: round {round}, to {peer}: timed out");
                }
            }
        }
        debug!(parent: &log, "pool: subscription closed for {peer}");
    });
}

#[derive(Clone)]
pub struct PoolSender {
    sender: mpsc::Sender<PoolCmd>,
}

#[derive(thiserror::Error, Debug)]
#[error("connection pool is closed")]
pub struct PoolError;

impl<T> From<mpsc::error::SendError<T>> for PoolError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        PoolError
    }
}

impl PoolSender {
    pub async fn add_peers(
        &self,
        peers: Vec<Peer>,
        send_timeout: Duration,
    ) -> Result<(), PoolError> {
        self.sender
            .send(PoolCmd::AddPeers {
                peers,
                send_timeout,
            })
            .await?;

        Ok(())
    }

    pub async fn remove_all(&self) -> Result<(), PoolError> {
        self.sender.send(PoolCmd::RemoveAll).await?;

        Ok(())
    }

    pub async fn broadcast_partial(&self, packet: PartialPacket) -> Result<(), PoolError> {
        self.sender.send(PoolCmd::Broadcast(packet)).await?;

        Ok(())
    }
}
