//! Catch-up logic: a lagging node pulls missing beacons from its peers.
//!
//! The task only transports packets; chain linkage and BLS verification
//! happen in the handler before anything is stored, so a lying peer is
//! dropped and the next one is tried.

use crate::net::protocol::ProtocolClient;
use crate::net::utils::Address;
use crate::net::utils::Peer;
use crate::net::utils::Seconds;
use crate::protobuf::randchain::BeaconPacket;

use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::Span;

/// Renew resync if no beacons were received for factor*period duration.
const RESYNC_EXPIRY_FACTOR: u32 = 2;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("invalid sync target: from {from} up_to {target}")]
    InvalidTarget { from: u64, target: u64 },
    #[error("sync channel closed unexpectedly")]
    ClosedTx,
    #[error("tried all peers, latest received round {last}")]
    TriedAllPeers { last: u64 },
}

/// Wrapper around the resync task handle including its liveness state.
pub struct HandleResync {
    handle: JoinHandle<Result<(), SyncError>>,
    /// Time of latest beacon received from the resync task.
    latest_received: Instant,
    factor: Duration,
}

impl Drop for HandleResync {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl HandleResync {
    pub fn new(period: Seconds, handle: JoinHandle<Result<(), SyncError>>) -> Self {
        Self {
            latest_received: Instant::now(),
            handle,
            factor: Duration::from_secs((period.get_value() * RESYNC_EXPIRY_FACTOR).into()),
        }
    }

    /// Returns `true` if resync is running and making progress.
    pub fn is_running(&self) -> bool {
        if self.handle.is_finished() {
            false
        } else {
            self.latest_received.elapsed() < self.factor
        }
    }

    /// Updates handle expiry time once a new beacon is received.
    pub fn update_last_received_time(&mut self) {
        self.latest_received = Instant::now();
    }
}

/// Peers that recently delivered valid partials go first; the rest are
/// shuffled behind them.
pub fn order_peers(mut peers: Vec<Peer>, recent: &[Address]) -> Vec<Peer> {
    peers.shuffle(&mut rand::rng());
    peers.sort_by_key(|p| {
        recent
            .iter()
            .position(|a| a == &p.address)
            .unwrap_or(usize::MAX)
    });

    peers
}

/// Pulls beacons `start_from..=up_to` from `peers` in order, forwarding
/// them to the handler via `tx_synced`. Rounds stream strictly ascending;
/// a peer breaking that is skipped.
pub fn resync(
    start_from: u64,
    up_to: u64,
    peers: Vec<Peer>,
    tx_synced: mpsc::Sender<BeaconPacket>,
    log: Span,
) -> JoinHandle<Result<(), SyncError>> {
    task::spawn(async move {
        let mut last_received = start_from.saturating_sub(1);

        'peers: for peer in peers {
            if up_to <= last_received {
                return Err(SyncError::InvalidTarget {
                    from: last_received + 1,
                    target: up_to,
                });
            }
            let mut client = match ProtocolClient::new(&peer) {
                Ok(client) => client,
                Err(err) => {
                    error!(parent: &log, "resync: failed to create client: peer {peer} {err}");
                    continue;
                }
            };
            let mut stream = match client.sync_chain(last_received + 1).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(parent: &log, "resync: failed to get stream: peer {peer} {err}");
                    continue;
                }
            };

            debug!(
                parent: &log,
                "resync started: peer {peer}, from_round {}, up_to {up_to}",
                last_received + 1
            );
            while let Ok(Some(packet)) = stream.message().await {
                // Stored rounds may have gaps, but replay must ascend.
                if packet.round <= last_received {
                    error!(
                        parent: &log,
                        "resync: skipping {peer}: round {} is not ascending from {last_received}",
                        packet.round
                    );
                    continue 'peers;
                }
                let received = packet.round;
                if tx_synced.send(packet).await.is_err() {
                    return Err(SyncError::ClosedTx);
                }
                last_received = received;

                if last_received >= up_to {
                    debug!(parent: &log, "resync finished: peer {peer}, target {up_to}");
                    return Ok(());
                }
            }
        }

        let err = SyncError::TriedAllPeers {
            last: last_received,
        };
        error!(parent: &log, "resync: {err}");

        Err(err)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn peer(port: u16) -> Peer {
        Peer {
            address: Address::precheck(&format!("127.0.0.1:{port}")).unwrap(),
            tls: false,
        }
    }

    #[test]
    fn recent_correspondents_go_first() {
        let peers = vec![peer(1000), peer(1001), peer(1002), peer(1003)];
        let recent = vec![peers[2].address.clone(), peers[0].address.clone()];

        let ordered = order_peers(peers.clone(), &recent);
        assert_eq!(ordered[0].address, peers[2].address);
        assert_eq!(ordered[1].address, peers[0].address);
        assert_eq!(ordered.len(), 4);
    }
}
