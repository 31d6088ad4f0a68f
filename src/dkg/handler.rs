//! The key generation actor: one mailbox, one protocol run at a time.

use super::broadcast::bundle_from_proto;
use super::broadcast::is_deal;
use super::broadcast::Broadcast;
use super::execution;
use super::execution::EntropySource;
use super::execution::DKG_PHASE_TIMEOUT;
use super::state::DkgOutcome;
use super::state::DkgStatus;
use super::state::StateMachine;
use super::DkgError;
use crate::chain::time::Clock;
use crate::chain::ChainCmd;
use crate::key::group::Group;
use crate::key::keys::Pair;
use crate::key::store::FileStore;
use crate::key::Scheme;
use crate::net::protocol::ProtocolClient;
use crate::net::utils::Callback;
use crate::net::utils::Peer;
use crate::protobuf::randchain::DkgPacket;
use crate::protobuf::randchain::ResharePacket;
use crate::protobuf::randchain::SetupPacket;

use energon::kyber::dkg::BundleSender;
use energon::kyber::dkg::Protocol;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing::Span;

/// Operator timeout used when a kick does not carry one.
pub const DEFAULT_DKG_TIMEOUT: Duration = Duration::from_secs(120);

/// Status snapshot for the control side.
#[derive(Debug, Clone)]
pub struct DkgStatusInfo {
    pub status: DkgStatus,
    pub epoch: u32,
}

pub enum DkgCmd {
    /// Operator command: lead an initial key generation.
    InitDkg {
        timeout: Duration,
        entropy: Option<EntropySource>,
        user_entropy_only: bool,
        cb: Callback<(), DkgError>,
    },
    /// Operator command: lead a resharing onto the proposed group file.
    InitReshare {
        timeout: Duration,
        cb: Callback<(), DkgError>,
    },
    /// Leader kick for an initial key generation.
    Setup(SetupPacket, Callback<(), DkgError>),
    /// Leader kick for a resharing.
    Reshare(ResharePacket, Callback<(), DkgError>),
    /// Bundle gossip from another participant.
    Gossip(DkgPacket, Callback<(), DkgError>),
    Status(Callback<DkgStatusInfo, DkgError>),
}

struct DkgHandler<S: Scheme, C: Clock> {
    fs: FileStore,
    clock: C,
    pair: Pair<S>,
    tx_chain: mpsc::Sender<ChainCmd>,
    tracker: TaskTracker,
    machine: StateMachine,
    /// Inbound gossip gate, open only while a protocol instance runs.
    gate: Option<BundleSender<S>>,
    tx_done: mpsc::Sender<DkgOutcome>,
    log: Span,
}

/// Starts the key generation actor and returns its mailbox.
pub fn init_dkg<S: Scheme, C: Clock>(
    fs: FileStore,
    clock: C,
    pair: Pair<S>,
    tx_chain: mpsc::Sender<ChainCmd>,
    log: Span,
    tracker: &TaskTracker,
) -> mpsc::Sender<DkgCmd> {
    let (tx_cmd, mut rx_cmd) = mpsc::channel::<DkgCmd>(4);
    let (tx_done, mut rx_done) = mpsc::channel::<DkgOutcome>(1);

    let tracker_clone = tracker.clone();
    tracker.spawn(async move {
        let mut h = DkgHandler::<S, C> {
            machine: StateMachine::new(!fs.is_fresh_run()),
            fs,
            clock,
            pair,
            tx_chain,
            tracker: tracker_clone,
            gate: None,
            tx_done,
            log,
        };

        loop {
            tokio::select! {
                cmd = rx_cmd.recv() => {
                    let Some(cmd) = cmd else { return };
                    h.handle_cmd(cmd).await;
                }

                outcome = rx_done.recv() => {
                    let Some(outcome) = outcome else { return };
                    h.gate = None;
                    match &outcome {
                        DkgOutcome::Finished { first_round } => {
                            info!(parent: &h.log, "dkg finished, epoch starts at round {first_round}");
                        }
                        DkgOutcome::Left => {
                            info!(parent: &h.log, "dkg finished, this node left the group");
                        }
                        DkgOutcome::Aborted(err) => {
                            error!(parent: &h.log, "dkg aborted: {err}");
                        }
                        DkgOutcome::TimedOut => {
                            warn!(parent: &h.log, "dkg timed out, no share produced");
                        }
                    }
                    h.machine.apply(&outcome);
                }
            }
        }
    });

    tx_cmd
}

impl<S: Scheme, C: Clock> DkgHandler<S, C> {
    async fn handle_cmd(&mut self, cmd: DkgCmd) {
        match cmd {
            DkgCmd::InitDkg {
                timeout,
                entropy,
                user_entropy_only,
                cb,
            } => {
                let seed = execution::mixed_entropy(entropy.as_ref(), user_entropy_only);
                cb.reply(self.lead_initial(seed, timeout));
            }
            DkgCmd::InitReshare { timeout, cb } => cb.reply(self.lead_reshare(timeout)),
            DkgCmd::Setup(packet, cb) => {
                let timeout = kick_timeout(packet.timeout_secs);
                cb.reply(self.start_initial(&packet.session_seed, timeout));
            }
            DkgCmd::Reshare(packet, cb) => {
                let timeout = kick_timeout(packet.timeout_secs);
                cb.reply(self.start_reshare(timeout, Some(&packet.group_hash)));
            }
            DkgCmd::Gossip(packet, cb) => cb.reply(self.gossip(packet).await),
            DkgCmd::Status(cb) => cb.reply(Ok(DkgStatusInfo {
                status: self.machine.status(),
                epoch: self.machine.epoch(),
            })),
        }
    }

    /// Leader path: run the protocol ourselves and kick every follower.
    fn lead_initial(&mut self, seed: [u8; 32], timeout: Duration) -> Result<(), DkgError> {
        let group = self.fs.load_group::<S>()?;
        let our_index = group.find_index(self.pair.public()).ok_or(DkgError::NotInGroup)?;
        let peers = group.peers_except(our_index);

        self.start_initial(&seed, timeout)?;

        let packet = SetupPacket {
            session_seed: seed.to_vec(),
            timeout_secs: timeout.as_secs(),
        };
        kick_followers(peers, Kick::Setup(packet), &self.log);

        Ok(())
    }

    fn lead_reshare(&mut self, timeout: Duration) -> Result<(), DkgError> {
        let proposed = self.fs.load_proposed_group::<S>().map_err(|_| DkgError::MissingProposedGroup)?;
        let group_hash = proposed.hash()?;
        let peers = self.reshare_peers(&proposed)?;

        self.start_reshare(timeout, None)?;

        let packet = ResharePacket {
            group_hash: group_hash.to_vec(),
            session_seed: vec![],
            timeout_secs: timeout.as_secs(),
        };
        kick_followers(peers, Kick::Reshare(packet), &self.log);

        Ok(())
    }

    /// Everyone the resharing involves: union of old and new members.
    fn reshare_peers(&self, proposed: &Group<S>) -> Result<Vec<Peer>, DkgError> {
        let old_group = self.fs.load_group::<S>()?;
        let our_address = self.pair.public().address();

        let mut peers: Vec<Peer> = vec![];
        for node in old_group.nodes.iter().chain(proposed.nodes.iter()) {
            let peer = node.to_peer();
            if &peer.address != our_address && !peers.contains(&peer) {
                peers.push(peer);
            }
        }

        Ok(peers)
    }

    fn build_initial(
        &self,
        session_seed: &[u8],
    ) -> Result<(energon::kyber::dkg::Config<S>, Group<S>, Vec<Peer>), DkgError> {
        let group = self.fs.load_group::<S>()?;
        group.validate()?;
        let nonce = execution::session_nonce(&group.hash()?, session_seed);
        let config = execution::initial_config(&self.pair, &group, nonce, self.log.clone())?;
        let our_index = group
            .find_index(self.pair.public())
            .ok_or(DkgError::NotInGroup)?;
        let peers = group.peers_except(our_index);

        Ok((config, group, peers))
    }

    fn start_initial(&mut self, session_seed: &[u8], timeout: Duration) -> Result<(), DkgError> {
        self.machine.announce()?;

        match self.build_initial(session_seed) {
            Ok((config, group, peers)) => self.run_protocol(config, group, None, peers, timeout),
            Err(err) => {
                self.machine.abort_announce();
                Err(err)
            }
        }
    }

    /// The resharing nonce is derived from the proposed group file only,
    /// so an old-group member's first deal can open the run even before
    /// the leader's kick arrives.
    #[allow(clippy::type_complexity)]
    fn build_reshare(
        &self,
        expected_hash: Option<&[u8]>,
    ) -> Result<(energon::kyber::dkg::Config<S>, Group<S>, Group<S>, Vec<Peer>), DkgError> {
        let old_group = self.fs.load_group::<S>()?;
        if old_group.dist_key.is_empty() {
            return Err(DkgError::ReshareWithoutEpoch);
        }
        let proposed = self
            .fs
            .load_proposed_group::<S>()
            .map_err(|_| DkgError::MissingProposedGroup)?;
        proposed.validate()?;

        let group_hash = proposed.hash()?;
        if let Some(expected) = expected_hash {
            if expected != group_hash.as_slice() {
                return Err(DkgError::GroupHashMismatch);
            }
        }

        let old_share = self.fs.load_share::<S>().ok();
        let nonce = execution::session_nonce(&group_hash, &[]);
        let config = execution::reshare_config(
            &self.pair,
            &old_group,
            old_share,
            &proposed,
            nonce,
            self.log.clone(),
        )?;
        let peers = self.reshare_peers(&proposed)?;

        Ok((config, proposed, old_group, peers))
    }

    fn start_reshare(
        &mut self,
        timeout: Duration,
        expected_hash: Option<&[u8]>,
    ) -> Result<(), DkgError> {
        self.machine.announce()?;

        match self.build_reshare(expected_hash) {
            Ok((config, proposed, old_group, peers)) => {
                self.run_protocol(config, proposed, Some(old_group), peers, timeout)
            }
            Err(err) => {
                self.machine.abort_announce();
                Err(err)
            }
        }
    }

    fn run_protocol(
        &mut self,
        config: energon::kyber::dkg::Config<S>,
        group: Group<S>,
        previous: Option<Group<S>>,
        peers: Vec<Peer>,
        timeout: Duration,
    ) -> Result<(), DkgError> {
        let (protocol, bundles_rx, bundles_tx) =
            Protocol::new_dkg(config, DKG_PHASE_TIMEOUT).map_err(DkgError::Protocol)?;

        self.gate = Some(bundles_tx);
        Broadcast::init(&self.log).register_nodes(&self.tracker, peers, bundles_rx);
        self.machine.executing();

        let fs = self.fs.clone();
        let clock = self.clock.clone();
        let tx_chain = self.tx_chain.clone();
        let tx_done = self.tx_done.clone();
        let log = self.log.clone();

        self.tracker.spawn(async move {
            info!(parent: &log, "dkg execution started, timeout {}s", timeout.as_secs());
            let outcome = match tokio::time::timeout(timeout, protocol.run()).await {
                Ok(Ok(Some(output))) => {
                    match execution::finalize(output, &group, previous.as_ref(), clock.now().as_secs())
                    {
                        Ok((final_group, share)) => match fs.save_distributed(&final_group, &share)
                        {
                            Ok(()) => {
                                let first_round = execution::first_epoch_round(&final_group);
                                if tx_chain
                                    .send(ChainCmd::NewEpoch { first_round })
                                    .await
                                    .is_err()
                                {
                                    DkgOutcome::Aborted(DkgError::HandoffClosed)
                                } else {
                                    DkgOutcome::Finished { first_round }
                                }
                            }
                            Err(err) => DkgOutcome::Aborted(err.into()),
                        },
                        Err(err) => DkgOutcome::Aborted(err),
                    }
                }
                Ok(Ok(None)) => DkgOutcome::Left,
                Ok(Err(err)) => DkgOutcome::Aborted(DkgError::Protocol(err)),
                Err(_elapsed) => DkgOutcome::TimedOut,
            };

            let _ = tx_done.send(outcome).await;
        });

        Ok(())
    }

    /// Bundle gossip. A deal arriving while idle opens a resharing run,
    /// provided a proposed group file and a finished epoch exist.
    async fn gossip(&mut self, packet: DkgPacket) -> Result<(), DkgError> {
        if self.gate.is_none() {
            if is_deal(&packet)
                && !self.machine.is_running()
                && !self.fs.is_fresh_run()
                && self.fs.has_proposed_group()
            {
                info!(parent: &self.log, "first deal received, joining resharing");
                self.start_reshare(DEFAULT_DKG_TIMEOUT, None)?;
            } else {
                return Err(DkgError::NotRunning);
            }
        }

        let bundle = bundle_from_proto::<S>(packet)?;
        match &self.gate {
            Some(tx) => tx
                .send(bundle)
                .await
                .map_err(|_| DkgError::NotRunning),
            None => Err(DkgError::NotRunning),
        }
    }
}

fn kick_timeout(secs: u64) -> Duration {
    if secs == 0 {
        DEFAULT_DKG_TIMEOUT
    } else {
        Duration::from_secs(secs)
    }
}

#[derive(Clone)]
enum Kick {
    Setup(SetupPacket),
    Reshare(ResharePacket),
}

/// Fire-and-forget announcement to every follower.
fn kick_followers(peers: Vec<Peer>, kick: Kick, log: &Span) {
    for peer in peers {
        let kick = kick.clone();
        let log = log.clone();
        tokio::spawn(async move {
            let mut client = match ProtocolClient::new(&peer) {
                Ok(client) => client,
                Err(err) => {
                    error!(parent: &log, "dkg kick: unable to reach {peer}: {err}");
                    return;
                }
            };
            let result = match kick {
                Kick::Setup(p) => client.setup(p).await,
                Kick::Reshare(p) => client.reshare(p).await,
            };
            if let Err(err) = result {
                error!(parent: &log, "dkg kick: sending to {peer}: {err}");
            }
        });
    }
}
