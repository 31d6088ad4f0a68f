// SPDX-License-Identifier: Apache-2.0

//! The aggregator: drives per-round collection of partial signatures,
//! recovery of the group signature, storage and subscriber fan-out.
//!
//! One actor task owns the chain head, the partial cache and the
//! callback registry; every mutation of the head happens inside its
//! `select!` loop, which gives the total store-order the engine promises.
//! Partial verification is CPU-bound and performed before any state is
//! touched.

use super::cache::AddShare;
use super::cache::PartialCache;
use super::callback::CallbackRegistry;
use super::info::ChainInfo;
use super::is_valid_signature;
use super::signer::partial_index;
use super::signer::PartialSigner;
use super::store::ChainStore;
use super::store::StoreError;
use super::store::StoreStreamResponse;
use super::sync;
use super::sync::HandleResync;
use super::ticker;
use super::time;
use super::time::Clock;
use super::Beacon;
use crate::key::store::FileStore;
use crate::key::store::FileStoreError;
use crate::key::Scheme;
use crate::net::pool::PoolSender;
use crate::net::utils::Address;
use crate::net::utils::Callback;
use crate::net::utils::Classify;
use crate::net::utils::ErrorKind;
use crate::net::utils::Seconds;
use crate::protobuf::randchain::BeaconPacket;
use crate::protobuf::randchain::ChainInfoPacket;
use crate::protobuf::randchain::PartialPacket;
use crate::protobuf::randchain::PublicRandResponse;

use energon::kyber::tbls;
use energon::traits::Affine;
use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing::Span;

/// Correspondents remembered for sync peer preference.
const RECENT_PEERS: usize = 5;

/// Margin subtracted from the period for the broadcast deadline.
const BROADCAST_MARGIN: Duration = Duration::from_millis(200);

/// Delay between attempts to observe the last round of a finishing epoch.
const TRANSITION_DELAY: Duration = Duration::from_millis(250);

#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("sender for partial signatures has been closed unexpectedly")]
    PartialClosedTx,
    #[error("sender for chain cmd has been closed unexpectedly")]
    CmdClosedTx,
    #[error("sender for round ticker has been closed unexpectedly")]
    TickerClosedTx,
    #[error("pool receiver has been closed unexpectedly")]
    PoolClosedRx,
    #[error("invalid length of partial: expected {expected}, received {received}")]
    InvalidPartialLength { expected: usize, received: usize },
    #[error("partial from index {0} which is not in the group file")]
    UnknownIndex(u32),
    #[error("received partial with invalid signature")]
    InvalidPartialSignature,
    #[error("partial for round {round} does not extend the local head")]
    HeadMismatch { round: u64 },
    #[error("invalid round: {invalid}, current {current}")]
    InvalidRound { invalid: u64, current: u64 },
    #[error("failed to serialize recovered signature")]
    SerializeRecovered,
    #[error("recovered signature is invalid")]
    InvalidRecovered,
    #[error("recover: scalar is non-invertible")]
    NonInvertibleScalar,
    #[error("beacon is not started yet")]
    NotReady,
    #[error("beacon not found")]
    NotFound,
    #[error("chain store: {0}")]
    Store(#[from] StoreError),
    #[error("t_bls: {0}")]
    TBls(tbls::TBlsError),
    #[error("fs: {0}")]
    FileStore(#[from] FileStoreError),
    #[error("internal error")]
    Internal,
}

impl ChainError {
    /// Storage failures (including conflicts) stop the handler; the rest
    /// affect only the operation that raised them.
    fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Store(_) | ChainError::FileStore(_))
    }
}

impl Classify for ChainError {
    fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            ChainError::Store(StoreError::NotFound) | ChainError::NotFound => ErrorKind::NotFound,
            ChainError::NotReady => ErrorKind::NotReady,
            ChainError::InvalidPartialLength { .. }
            | ChainError::UnknownIndex(_)
            | ChainError::InvalidPartialSignature
            | ChainError::HeadMismatch { .. }
            | ChainError::InvalidRound { .. }
            | ChainError::InvalidRecovered => ErrorKind::Invalid,
            _ => ErrorKind::Transient,
        }
    }
}

/// Observable lifecycle of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconState {
    /// No DKG output yet.
    Idle,
    /// DKG done, genesis is in the future.
    Waiting,
    /// Producing beacons at the pace of the round clock.
    Running,
    /// Head is behind the clock; syncing and re-emitting partials.
    CatchingUp,
    /// Terminated, either gracefully or by a fatal storage error.
    Stopped,
}

impl Display for BeaconState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BeaconState::Idle => "idle",
            BeaconState::Waiting => "waiting",
            BeaconState::Running => "running",
            BeaconState::CatchingUp => "catching_up",
            BeaconState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot served to status and home requests.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    pub state: BeaconState,
    pub current_round: u64,
    pub last_stored: u64,
}

impl Display for StatusInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "state: {}, current round: {}, last stored round: {}",
            self.state, self.current_round, self.last_stored
        )
    }
}

/// Alias for inbound partial packet with its reply callback.
pub type PartialMsg = (PartialPacket, Callback<(), ChainError>);

pub enum ChainCmd {
    Shutdown(Callback<(), ChainError>),
    /// Force an immediate catch-up check, e.g. after a manual restart.
    Catchup(Callback<(), ChainError>),
    /// DKG output received: the chain prepares for an epoch transition
    /// starting at `first_round`.
    NewEpoch { first_round: u64 },
    /// Reload distributed materials and move into the next epoch.
    Reload,
    ChainInfo(Callback<ChainInfoPacket, ChainError>),
    Status(Callback<StatusInfo, ChainError>),
    /// Round 0 means "latest".
    PublicRand {
        round: u64,
        cb: Callback<PublicRandResponse, ChainError>,
    },
    /// Mailbox for every beacon stored from now on.
    Subscribe(Callback<mpsc::Receiver<Beacon>, ChainError>),
    /// Read-only replay for the sync server side.
    Cursor {
        from_round: u64,
        cb: Callback<mpsc::Receiver<StoreStreamResponse>, StoreError>,
    },
}

/// Holder to simplify channel management, see [`init_chain`].
struct Channels {
    rx_partial: mpsc::Receiver<PartialMsg>,
    tx_cmd: mpsc::Sender<ChainCmd>,
    rx_cmd: mpsc::Receiver<ChainCmd>,
    tx_resync: mpsc::Sender<BeaconPacket>,
    rx_resync: mpsc::Receiver<BeaconPacket>,
    tx_catchup: mpsc::Sender<()>,
    rx_catchup: mpsc::Receiver<()>,
}

/// Configuration surviving epoch transitions.
pub struct ChainConfig<C: Clock> {
    chan: Channels,
    pool: PoolSender,
    fs: FileStore,
    store: ChainStore,
    clock: C,
    log: Span,
}

/// Mutable per-round state owned by the handler loop.
struct RoundState<S: Scheme> {
    /// Latest verified and successfully stored beacon.
    head: Beacon,
    /// Current expected chain height, updated from the round ticker.
    current_round: u64,
    state: BeaconState,
    cache: PartialCache<S>,
    callbacks: CallbackRegistry,
    /// `true` while a catch-up signal is pending.
    catchup_enabled: bool,
    tx_catchup: mpsc::Sender<()>,
    tx_resync: mpsc::Sender<BeaconPacket>,
    h_resync: Option<HandleResync>,
    /// Peers that recently delivered valid partials, most recent first.
    recent: VecDeque<Address>,
}

impl<S: Scheme> RoundState<S> {
    fn new(
        head: Beacon,
        current_round: u64,
        threshold: usize,
        state: BeaconState,
        tx_catchup: mpsc::Sender<()>,
        tx_resync: mpsc::Sender<BeaconPacket>,
        log: Span,
    ) -> Self {
        Self {
            cache: PartialCache::new(head.round, current_round, threshold),
            head,
            current_round,
            state,
            callbacks: CallbackRegistry::new(log),
            catchup_enabled: false,
            tx_catchup,
            tx_resync,
            h_resync: None,
            recent: VecDeque::with_capacity(RECENT_PEERS),
        }
    }

    fn new_round(&mut self, round: u64) {
        self.current_round = round;
        self.cache.new_round(round);
        if self.state == BeaconState::Waiting {
            self.state = BeaconState::Running;
        }
    }

    /// Must be called only AFTER the beacon has been persisted.
    fn update_head(&mut self, beacon: Beacon) {
        self.cache.advance_head(beacon.round);
        self.callbacks.notify(&beacon);
        self.head = beacon;
        if self.current_round <= self.head.round && self.state == BeaconState::CatchingUp {
            self.state = BeaconState::Running;
        }
    }

    fn note_correspondent(&mut self, peer: Address) {
        self.recent.retain(|a| a != &peer);
        self.recent.push_front(peer);
        self.recent.truncate(RECENT_PEERS);
    }

    fn recent_peers(&self) -> Vec<Address> {
        self.recent.iter().cloned().collect()
    }

    /// Spawns a task delivering a single delayed catch-up signal. No new
    /// task is spawned until the previous signal has been consumed.
    fn start_catchup(&mut self, catchup_period: Duration) {
        if !self.catchup_enabled {
            self.catchup_enabled = true;

            tokio::task::spawn({
                let tx = self.tx_catchup.clone();
                async move {
                    sleep(catchup_period).await;
                    let _ = tx.send(()).await;
                }
            });
        }
    }

    fn catchup_signal_received(&mut self) {
        self.catchup_enabled = false;
    }

    fn is_resync_active(&self) -> bool {
        self.h_resync.as_ref().is_some_and(HandleResync::is_running)
    }

    fn extend_resync_expiry(&mut self) {
        if let Some(h) = self.h_resync.as_mut() {
            h.update_last_received_time();
        }
    }

    fn stop_resync(&mut self) {
        self.h_resync = None;
    }

    fn status(&self) -> StatusInfo {
        StatusInfo {
            state: self.state,
            current_round: self.current_round,
            last_stored: self.head.round,
        }
    }
}

/// Handler to initiate and react to the tBLS protocol.
struct ChainHandler<S: Scheme, C: Clock> {
    info: ChainInfo<S>,
    period: Seconds,
    catchup_period: Duration,
    threshold: usize,
    store: ChainStore,
    pool: PoolSender,
    signer: PartialSigner<S>,
    clock: C,
    log: Span,
}

impl<S: Scheme, C: Clock> ChainHandler<S, C> {
    /// Loads distributed materials and rebuilds the handler; called at
    /// startup and again after every epoch transition.
    async fn from_config(
        cc: &ChainConfig<C>,
    ) -> Result<(Self, RoundState<S>), ChainError> {
        let group = cc.fs.load_group::<S>()?;
        let share = cc.fs.load_share::<S>()?;

        let Some(public_key) = group.dist_key.public_key().cloned() else {
            return Err(ChainError::NotReady);
        };

        // Mitigates the transition corner case where DKG output is
        // already on disk but the node reloaded before transition time.
        check_transition(&cc.clock, group.period, group.transition_time, &cc.log).await;

        // Genesis beacon should always match the group seed.
        cc.store.check_genesis(&group.genesis_seed, &cc.log).await?;

        let info = ChainInfo {
            public_key,
            period: group.period,
            genesis_time: group.genesis_time,
            genesis_seed: group.genesis_seed.clone(),
        };

        let signer = PartialSigner::new(&group.nodes, share);

        let head = cc.store.last().await?;
        let now = cc.clock.now().as_secs();
        let current_round = time::current_round(now, group.period.get_value(), group.genesis_time);
        let state = if current_round == 0 {
            BeaconState::Waiting
        } else if current_round > head.round + 1 {
            BeaconState::CatchingUp
        } else {
            BeaconState::Running
        };

        let reg = RoundState::new(
            head,
            current_round,
            group.threshold as usize,
            state,
            cc.chan.tx_catchup.clone(),
            cc.chan.tx_resync.clone(),
            cc.log.clone(),
        );

        let handler = Self {
            info,
            period: group.period,
            catchup_period: group.catchup_period.as_duration(),
            threshold: group.threshold as usize,
            store: cc.store.clone(),
            pool: cc.pool.clone(),
            signer,
            clock: cc.clock.clone(),
            log: cc.log.clone(),
        };

        Ok((handler, reg))
    }

    fn broadcast_deadline(&self) -> Duration {
        let period = self.period.as_duration();
        period.checked_sub(BROADCAST_MARGIN).unwrap_or(period)
    }

    /// Signs the current round over the head and fans the partial out.
    /// Also feeds our own share into the cache, which may complete the
    /// threshold right away.
    async fn sign_and_broadcast(&self, reg: &mut RoundState<S>) -> Result<(), ChainError> {
        let round = reg.current_round;
        if round == 0 {
            // Pre-genesis: the aggregator does not sign.
            return Ok(());
        }
        if reg.head.round >= round {
            debug!(parent: &self.log, "skipping signing: round {round} already stored");
            return Ok(());
        }

        let share = self.signer.sign_round(round, &reg.head)?;
        let partial_sig = share.serialize().map_err(ChainError::TBls)?;
        let packet = PartialPacket {
            round,
            previous_round: reg.head.round,
            previous_sig: reg.head.signature.clone(),
            partial_sig,
        };

        if !reg.cache.is_index_present(round, self.signer.our_index()) {
            if let AddShare::Added(count) = reg.cache.add(round, share) {
                if count >= self.threshold() {
                    self.try_recover(round, reg).await?;
                    self.align(reg).await?;
                }
            }
        }

        debug!(
            parent: &self.log,
            "broadcast_partial: round {round}, prev_round {}, prev_sig {}",
            packet.previous_round,
            hex::encode(packet.previous_sig.get(..3).unwrap_or_default())
        );
        if self.pool.broadcast_partial(packet).await.is_err() {
            error!(parent: &self.log, "failed to broadcast partial: round {round}");
            return Err(ChainError::PoolClosedRx);
        }

        Ok(())
    }

    fn threshold(&self) -> usize {
        self.threshold
    }

    /// Validates an inbound partial and feeds it into the cache.
    /// Returns `true` if the packet completed a recovery.
    async fn process_partial(
        &self,
        reg: &mut RoundState<S>,
        packet: PartialPacket,
    ) -> Result<bool, ChainError> {
        let p_round = packet.round;
        let current = reg.current_round;

        // A round-context packet from the leader during resharing
        // carries no partial and must not be verified.
        if packet.partial_sig.is_empty() {
            debug!(parent: &self.log, "ignoring round context packet: round {p_round}");
            return Ok(false);
        }
        if p_round <= reg.head.round {
            debug!(
                parent: &self.log,
                "ignoring partial: round {p_round} already stored, current {current}"
            );
            return Ok(false);
        }

        if packet.previous_round == reg.head.round {
            if packet.previous_sig != reg.head.signature {
                // Valid BLS form or not, the chain context lies.
                return Err(ChainError::HeadMismatch { round: p_round });
            }
        } else if packet.previous_round < reg.head.round {
            // The sender is behind us; its partial can never become valid.
            debug!(
                parent: &self.log,
                "ignoring stale partial: round {p_round}, prev_round {}, head {}",
                packet.previous_round,
                reg.head.round
            );
            return Ok(false);
        } else {
            // The packet references a head we do not have yet: buffer it
            // within the window, resync will tell whether it becomes valid.
            return self.buffer_packet(reg, packet);
        }

        // Head matches. Allow one round ahead of the clock for drift;
        // further out the packet is buffered.
        if p_round > current + 1 {
            return self.buffer_packet(reg, packet);
        }

        let Some(index) = partial_index::<S>(&packet.partial_sig) else {
            return Err(ChainError::InvalidPartialLength {
                expected: <S::Sig as energon::traits::Group>::POINT_SIZE + 2,
                received: packet.partial_sig.len(),
            });
        };
        if reg.cache.is_index_present(p_round, index) {
            debug!(parent: &self.log, "ignoring duplicated partial: round {p_round}, index {index}");
            return Ok(false);
        }

        let (share, peer) = self.signer.verify_partial(&packet)?;
        reg.note_correspondent(peer.address.clone());

        match reg.cache.add(p_round, share) {
            AddShare::Added(count) => {
                debug!(
                    parent: &self.log,
                    "cache: added partial: round {p_round}, index {index}, count {count}"
                );
                if count >= self.threshold() && self.try_recover(p_round, reg).await? {
                    self.align(reg).await?;
                    return Ok(true);
                }
            }
            AddShare::DuplicateIndex | AddShare::Saturated => {
                debug!(parent: &self.log, "cache: discarded partial: round {p_round}, index {index}");
            }
        }

        Ok(false)
    }

    fn buffer_packet(
        &self,
        reg: &mut RoundState<S>,
        packet: PartialPacket,
    ) -> Result<bool, ChainError> {
        let p_round = packet.round;
        match reg.cache.buffer(packet) {
            Some(added) => {
                debug!(
                    parent: &self.log,
                    "cache: buffered future partial: round {p_round}, stored {added}"
                );
                Ok(false)
            }
            None => Err(ChainError::InvalidRound {
                invalid: p_round,
                current: reg.current_round,
            }),
        }
    }

    /// Recovers, verifies and stores the beacon for `round` once the
    /// threshold is reached. Returns `true` when a new beacon landed.
    async fn try_recover(&self, round: u64, reg: &mut RoundState<S>) -> Result<bool, ChainError> {
        if reg.cache.count(round) < self.threshold() {
            return Ok(false);
        }
        let Some(shares) = reg.cache.drain(round) else {
            return Ok(false);
        };

        let Ok(recovered) = tbls::recover_unchecked(&shares) else {
            return Err(ChainError::NonInvertibleScalar);
        };
        if !is_valid_signature::<S>(&self.info.public_key, &reg.head, round, &recovered) {
            error!(parent: &self.log, "round {round}: {}", ChainError::InvalidRecovered);
            return Err(ChainError::InvalidRecovered);
        }
        let signature: Vec<u8> = Affine::serialize(&recovered)
            .map_err(|_| ChainError::SerializeRecovered)?
            .into();

        let beacon = Beacon::next(&reg.head, round, signature);
        self.commit(beacon, reg).await?;

        // Recovery may have been late: if the clock is already further,
        // pace the next partial with the catch-up delay instead of
        // waiting for the next tick.
        if reg.current_round > reg.head.round {
            reg.state = BeaconState::CatchingUp;
            reg.start_catchup(self.catchup_period);
        }

        Ok(true)
    }

    /// Persists a verified beacon and updates every observer. Storage
    /// errors, conflicts included, are fatal to the handler.
    async fn commit(&self, beacon: Beacon, reg: &mut RoundState<S>) -> Result<(), ChainError> {
        let round = beacon.round;
        let expected_ms = u128::from(time::time_of_round(
            self.period.get_value(),
            self.info.genesis_time,
            round,
        )) * 1000;
        self.store.put(beacon.clone()).await?;

        let discrepancy = self.clock.now().as_millis() as i128 - expected_ms as i128;
        info!(
            parent: &self.log,
            "NEW_BEACON_STORED: round {round}, sig {}, prev_round {}, time_discrepancy_ms {discrepancy}",
            beacon.short_sig(),
            beacon.previous_round,
        );
        reg.update_head(beacon);

        Ok(())
    }

    /// Promotes buffered packets that became checkable and keeps
    /// recovering as long as promotions complete further rounds.
    async fn align(&self, reg: &mut RoundState<S>) -> Result<(), ChainError> {
        loop {
            let due = reg.cache.promote(&reg.head);
            if due.is_empty() {
                return Ok(());
            }

            let mut candidates = vec![];
            for packet in due {
                let round = packet.round;
                match self.verify_into_cache(reg, packet) {
                    Ok(true) => candidates.push(round),
                    Ok(false) => {}
                    Err(err) => {
                        debug!(parent: &self.log, "align: dropping promoted packet: round {round}: {err}");
                    }
                }
            }

            let mut progressed = false;
            for round in candidates {
                if self.try_recover(round, reg).await? {
                    progressed = true;
                    // Head changed; re-promote before looking further.
                    break;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Verification part of the promotion path; returns `true` if the
    /// round reached the threshold.
    fn verify_into_cache(
        &self,
        reg: &mut RoundState<S>,
        packet: PartialPacket,
    ) -> Result<bool, ChainError> {
        let round = packet.round;
        let Some(index) = partial_index::<S>(&packet.partial_sig) else {
            return Err(ChainError::InvalidPartialLength {
                expected: <S::Sig as energon::traits::Group>::POINT_SIZE + 2,
                received: packet.partial_sig.len(),
            });
        };
        if reg.cache.is_index_present(round, index) {
            return Ok(false);
        }
        let (share, peer) = self.signer.verify_partial(&packet)?;
        reg.note_correspondent(peer.address.clone());

        Ok(matches!(
            reg.cache.add(round, share),
            AddShare::Added(count) if count >= self.threshold()
        ))
    }

    /// Stores one beacon delivered by the resync task, verifying chain
    /// linkage and the group signature first.
    async fn save_resynced(
        &self,
        packet: BeaconPacket,
        reg: &mut RoundState<S>,
    ) -> Result<(), ChainError> {
        if packet.round <= reg.head.round {
            debug!(
                parent: &self.log,
                "save_resynced: ignoring round {}, head {}",
                packet.round,
                reg.head.round
            );
            reg.stop_resync();
            return Ok(());
        }
        if packet.previous_round != reg.head.round || packet.previous_sig != reg.head.signature {
            warn!(
                parent: &self.log,
                "save_resynced: round {} does not extend head {}, aborting resync",
                packet.round,
                reg.head.round
            );
            reg.stop_resync();
            return Ok(());
        }
        let Ok(signature) = Affine::deserialize(&packet.signature) else {
            error!(
                parent: &self.log,
                "save_resynced: failed to deserialize signature for round {}, aborting resync",
                packet.round
            );
            reg.stop_resync();
            return Ok(());
        };
        if !is_valid_signature::<S>(&self.info.public_key, &reg.head, packet.round, &signature) {
            error!(
                parent: &self.log,
                "save_resynced: invalid signature for round {}, aborting resync", packet.round
            );
            reg.stop_resync();
            return Ok(());
        }

        self.commit(Beacon::from(packet), reg).await?;
        reg.extend_resync_expiry();
        if reg.current_round <= reg.head.round {
            reg.stop_resync();
        }

        self.align(reg).await
    }

    /// Trigger for catchup and resync, starting them if needed and not
    /// already running.
    fn check_resync_catchup(&self, reg: &mut RoundState<S>) {
        if reg.current_round > reg.head.round + 1 {
            reg.state = BeaconState::CatchingUp;
            reg.start_catchup(self.catchup_period);

            if !reg.is_resync_active() {
                let peers = sync::order_peers(self.signer.peers(), &reg.recent_peers());
                let start_from = reg.head.round + 1;
                let up_to = reg.current_round.saturating_sub(1);
                let handle = sync::resync(
                    start_from,
                    up_to,
                    peers,
                    reg.tx_resync.clone(),
                    self.log.clone(),
                );
                reg.h_resync = Some(HandleResync::new(self.period, handle));
            }
        }
    }

    /// Serves a public randomness request; `round == 0` means latest.
    async fn public_rand(
        &self,
        reg: &RoundState<S>,
        round: u64,
    ) -> Result<PublicRandResponse, ChainError> {
        let beacon = if round == 0 {
            if reg.head.round == 0 {
                return Err(ChainError::NotFound);
            }
            reg.head.clone()
        } else {
            match self.store.get(round).await {
                Ok(beacon) => beacon,
                Err(StoreError::NotFound) => return Err(ChainError::NotFound),
                Err(err) => return Err(err.into()),
            }
        };

        Ok(PublicRandResponse {
            round: beacon.round,
            previous_round: beacon.previous_round,
            previous_sig: beacon.previous_sig.clone(),
            randomness: beacon.randomness().to_vec(),
            signature: beacon.signature,
        })
    }
}

/// Pre-DKG chain: every protocol request is answered with `NotReady`
/// until the first DKG hands over an epoch.
async fn run_fresh<C: Clock>(cc: &mut ChainConfig<C>) -> Result<bool, ChainError> {
    info!(parent: &cc.log, "running as fresh install -> expect to run DKG");

    loop {
        tokio::select! {
            new_partial = cc.chan.rx_partial.recv() => {
                match new_partial {
                    Some((_partial, cb)) => cb.reply(Err(ChainError::NotReady)),
                    None => return Err(ChainError::PartialClosedTx),
                }
            }

            cmd = cc.chan.rx_cmd.recv() => {
                match cmd {
                    Some(ChainCmd::NewEpoch { first_round }) => {
                        info!(parent: &cc.log, "first epoch handed over, starts at round {first_round}");
                        return Ok(true);
                    }
                    Some(ChainCmd::Shutdown(cb)) => {
                        cb.reply(Ok(()));
                        return Ok(false);
                    }
                    Some(ChainCmd::Status(cb)) => cb.reply(Ok(StatusInfo {
                        state: BeaconState::Idle,
                        current_round: 0,
                        last_stored: 0,
                    })),
                    Some(ChainCmd::Catchup(cb)) => cb.reply(Err(ChainError::NotReady)),
                    Some(ChainCmd::ChainInfo(cb)) => cb.reply(Err(ChainError::NotReady)),
                    Some(ChainCmd::PublicRand { round: _, cb }) => cb.reply(Err(ChainError::NotReady)),
                    Some(ChainCmd::Subscribe(cb)) => cb.reply(Err(ChainError::NotReady)),
                    // Serving sync from a node without DKG setup is forbidden.
                    Some(ChainCmd::Cursor { from_round: _, cb }) => cb.reply(Err(StoreError::Internal)),
                    Some(ChainCmd::Reload) => {
                        warn!(parent: &cc.log, "reload received on fresh chain, ignoring");
                    }
                    None => return Err(ChainError::CmdClosedTx),
                }
            }
        }
    }
}

async fn run_chain<S: Scheme, C: Clock>(
    cc: &mut ChainConfig<C>,
) -> Result<bool, ChainError> {
    let (h, mut reg) = ChainHandler::<S, C>::from_config(cc).await?;

    // Register epoch peers for the partial fan-out.
    h.pool
        .add_peers(h.signer.peers(), h.broadcast_deadline())
        .await
        .map_err(|_| ChainError::PoolClosedRx)?;

    let mut rx_round = ticker::start_ticker(h.clock.clone(), h.info.genesis_time, h.period);
    info!(
        parent: &h.log,
        "chain initialized: state {}, latest stored {}, current {}",
        reg.state,
        reg.head.round,
        reg.current_round
    );

    loop {
        tokio::select! {
            // New round from round ticker.
            round = rx_round.recv() => {
                let Some(round) = round else {
                    return Err(ChainError::TickerClosedTx);
                };
                reg.new_round(round);
                debug!(parent: &h.log, "beacon_loop: new round {round}, head {}", reg.head.round);

                h.check_resync_catchup(&mut reg);
                if let Err(err) = h.sign_and_broadcast(&mut reg).await {
                    if err.is_fatal() {
                        reg.state = BeaconState::Stopped;
                        return Err(err);
                    }
                    error!(parent: &h.log, "beacon_loop: round {round}: {err}");
                }
                // Early packets for this round may be waiting.
                if let Err(err) = h.align(&mut reg).await {
                    if err.is_fatal() {
                        reg.state = BeaconState::Stopped;
                        return Err(err);
                    }
                    error!(parent: &h.log, "beacon_loop: align: {err}");
                }
            }

            // Partial beacon packet received from other nodes.
            partial = cc.chan.rx_partial.recv() => {
                let Some((packet, cb)) = partial else {
                    return Err(ChainError::PartialClosedTx);
                };
                match h.process_partial(&mut reg, packet).await {
                    Ok(_recovered) => cb.reply(Ok(())),
                    Err(err) if err.is_fatal() => {
                        reg.state = BeaconState::Stopped;
                        cb.reply(Err(ChainError::Internal));
                        return Err(err);
                    }
                    Err(err) => {
                        debug!(parent: &h.log, "process_partial: {err}");
                        cb.reply(Err(err));
                    }
                }
            }

            // Signal arrives if catchup mode is active.
            signal = cc.chan.rx_catchup.recv() => {
                if signal.is_some() {
                    reg.catchup_signal_received();
                    if let Err(err) = h.sign_and_broadcast(&mut reg).await {
                        if err.is_fatal() {
                            reg.state = BeaconState::Stopped;
                            return Err(err);
                        }
                        error!(parent: &h.log, "catchup: {err}");
                    }
                    // Still behind: keep pacing.
                    h.check_resync_catchup(&mut reg);
                }
            }

            // Beacon packet from resync task.
            resynced = cc.chan.rx_resync.recv() => {
                if let Some(packet) = resynced {
                    if let Err(err) = h.save_resynced(packet, &mut reg).await {
                        if err.is_fatal() {
                            reg.state = BeaconState::Stopped;
                            return Err(err);
                        }
                        error!(parent: &h.log, "save_resynced: {err}");
                    }
                }
            }

            cmd = cc.chan.rx_cmd.recv() => {
                match cmd {
                    Some(ChainCmd::NewEpoch { first_round }) => {
                        // The last round before transition must be stored
                        // before the chain module reconfigures.
                        warn!(parent: &h.log, "new epoch will start at round {first_round}");
                        wait_transition(
                            first_round,
                            h.store.clone(),
                            cc.chan.tx_cmd.clone(),
                            h.log.clone(),
                        );
                    }
                    Some(ChainCmd::Reload) => {
                        info!(parent: &h.log, "reconfiguration: moving to new epoch");
                        h.pool.remove_all().await.map_err(|_| ChainError::PoolClosedRx)?;
                        return Ok(true);
                    }
                    Some(ChainCmd::Shutdown(cb)) => {
                        reg.state = BeaconState::Stopped;
                        h.pool.remove_all().await.map_err(|_| ChainError::PoolClosedRx)?;
                        cb.reply(Ok(()));
                        return Ok(false);
                    }
                    Some(ChainCmd::Catchup(cb)) => {
                        h.check_resync_catchup(&mut reg);
                        cb.reply(Ok(()));
                    }
                    Some(ChainCmd::ChainInfo(cb)) => {
                        match h.info.as_packet() {
                            Some(packet) => cb.reply(Ok(packet)),
                            None => cb.reply(Err(ChainError::Internal)),
                        }
                    }
                    Some(ChainCmd::Status(cb)) => cb.reply(Ok(reg.status())),
                    Some(ChainCmd::PublicRand { round, cb }) => {
                        cb.reply(h.public_rand(&reg, round).await);
                    }
                    Some(ChainCmd::Subscribe(cb)) => {
                        let (_, rx) = reg.callbacks.add();
                        cb.reply(Ok(rx));
                    }
                    Some(ChainCmd::Cursor { from_round, cb }) => {
                        h.store.cursor(from_round, cb).await;
                    }
                    None => return Err(ChainError::CmdClosedTx),
                }
            }
        }
    }
}

/// Top-level function of the chain module. The returned senders are the
/// only way in: partial packets from the server side and commands from
/// the daemon/control side.
pub fn init_chain<S: Scheme, C: Clock>(
    fs: FileStore,
    clock: C,
    pool: PoolSender,
    log: Span,
    tracker: &TaskTracker,
) -> (mpsc::Sender<PartialMsg>, mpsc::Sender<ChainCmd>) {
    // Shortcut channel to hand partial beacons to the handler directly.
    let (tx_partial, rx_partial) = mpsc::channel(1);
    // Channel for commands from the daemon / control side.
    let (tx_cmd, rx_cmd) = mpsc::channel::<ChainCmd>(2);
    // Notification channel for signals delayed by the catchup period.
    let (tx_catchup, rx_catchup) = mpsc::channel::<()>(1);
    // Channel for resynced beacons.
    let (tx_resync, rx_resync) = mpsc::channel::<BeaconPacket>(64);

    let chan = Channels {
        rx_partial,
        tx_cmd: tx_cmd.clone(),
        rx_cmd,
        tx_catchup,
        rx_catchup,
        tx_resync,
        rx_resync,
    };

    tracker.spawn({
        let log = log.clone();
        async move {
            let store = match ChainStore::start(fs.chain_store_path(), log.clone()).await {
                Ok(store) => store,
                Err(err) => {
                    error!(parent: &log, "init_chain: failed to start chain store actor: {err}");
                    return;
                }
            };

            let mut cc = ChainConfig {
                chan,
                pool,
                fs,
                store,
                clock,
                log,
            };

            let fresh_result = if cc.fs.is_fresh_run() {
                run_fresh(&mut cc).await
            } else {
                Ok(true)
            };

            let result = match fresh_result {
                Ok(true) => loop {
                    // One iteration per epoch; `Ok(true)` means reload.
                    match run_chain::<S, C>(&mut cc).await {
                        Ok(true) => continue,
                        Ok(false) => break Ok(()),
                        Err(err) => break Err(err),
                    }
                },
                Ok(false) => Ok(()),
                Err(err) => Err(err),
            };

            if let Err(err) = result {
                error!(parent: &cc.log, "chain layer: {err}");
            }
        }
    });

    (tx_partial, tx_cmd)
}

/// Transition is successful only once the last round of the finishing
/// epoch is stored; the chain then reloads with the new epoch's
/// materials, which were saved the moment DKG output arrived.
fn wait_transition(
    first_round: u64,
    store: ChainStore,
    tx: mpsc::Sender<ChainCmd>,
    log: Span,
) {
    let want_round = first_round.saturating_sub(1);
    tokio::task::spawn(async move {
        let mut attempt = 1u32;
        loop {
            match store.last().await {
                Ok(last_stored) => {
                    if last_stored.round >= want_round {
                        warn!(parent: &log, "transition: epoch last round {want_round} stored, reloading chain");
                        if tx.send(ChainCmd::Reload).await.is_err() {
                            error!(parent: &log, "transition: {}", ChainError::CmdClosedTx);
                        }
                        return;
                    }
                    sleep(TRANSITION_DELAY).await;
                    attempt += 1;
                    if attempt % 40 == 0 {
                        warn!(
                            parent: &log,
                            "transition: waiting for round {want_round}, latest stored {}, attempts {attempt}",
                            last_stored.round
                        );
                    }
                }
                Err(err) => {
                    error!(parent: &log, "transition: {err}");
                    return;
                }
            }
        }
    });
}

/// Mitigates the transition corner case, where DKG output is already
/// received but the node reloaded manually before transition time.
async fn check_transition<C: Clock>(
    clock: &C,
    period: Seconds,
    transition_time: u64,
    log: &Span,
) {
    let epoch_last_round = transition_time.saturating_sub(period.get_value().into());
    let now = clock.now().as_secs();
    if now < epoch_last_round {
        // Adding 1 second to skip the last round tick of the finished epoch.
        warn!(
            parent: log,
            "transition is not graceful, now {now}, transition_time {transition_time}, waiting"
        );
        clock
            .sleep_until(Duration::from_secs(epoch_last_round + 1))
            .await;
    }
}
