//! Helpers for engine tests: a trusted dealer replaces the DKG, so the
//! beacon path can run with real threshold-BLS material.

use crate::chain::time::FakeClock;
use crate::chain::ChainCmd;
use crate::chain::ChainError;
use crate::daemon::Daemon;
use crate::key::group::Group;
use crate::key::keys::DistPublic;
use crate::key::keys::Pair;
use crate::key::node::Node;
use crate::key::store::FileStore;
use crate::key::KeyPoint;
use crate::net::utils::Address;
use crate::net::utils::Callback;
use crate::net::utils::Seconds;
use crate::protobuf::randchain::PublicRandResponse;

use energon::drand::schemes::DefaultScheme;
use energon::kyber::dkg::DistKeyShare;
use energon::kyber::poly::PriPoly;

use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const PERIOD: u32 = 2;
pub const GENESIS_SEED: [u8; 32] = [7; 32];

/// Secret-shares a fresh random polynomial among `n` nodes. Returns the
/// shares plus the commitments whose constant term is the group key.
pub fn dealer_shares(
    n: u32,
    threshold: u32,
) -> (Vec<DistKeyShare<DefaultScheme>>, Vec<KeyPoint<DefaultScheme>>) {
    let pri_poly = PriPoly::<DefaultScheme>::new(threshold);
    let commits = pri_poly.commit().commits;

    let shares = (0..n)
        .map(|i| DistKeyShare {
            commits: commits.clone(),
            pri_share: pri_poly.eval(i),
        })
        .collect();

    (shares, commits)
}

/// One provisioned node: keys, group and share on disk, not yet started.
pub struct TestNode {
    pub fs: FileStore,
    pub listener: Option<TcpListener>,
    pub address: Address,
    pub daemon: Option<Daemon>,
    _dir: TempDir,
}

/// A provisioned network sharing one fake clock.
pub struct TestNet {
    pub nodes: Vec<TestNode>,
    pub group: Group<DefaultScheme>,
    pub clock: FakeClock,
}

impl TestNet {
    /// Lays out `n` nodes with dealer shares and a genesis one period
    /// ahead of the fake clock.
    pub async fn provision(n: u32, threshold: u32) -> Self {
        Self::provision_inner(n, threshold, true).await
    }

    /// Same layout, but no dealer: group files carry no distributed key
    /// and no share exists, as before the first DKG.
    pub async fn provision_fresh(n: u32, threshold: u32) -> Self {
        Self::provision_inner(n, threshold, false).await
    }

    async fn provision_inner(n: u32, threshold: u32, with_shares: bool) -> Self {
        let clock = FakeClock::at(1_700_000_000);
        let genesis_time = clock.now().as_secs() + u64::from(PERIOD);

        let mut listeners = vec![];
        let mut pairs = vec![];
        for _ in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address =
                Address::precheck(&listener.local_addr().unwrap().to_string()).unwrap();
            pairs.push(Pair::<DefaultScheme>::generate(address, false).unwrap());
            listeners.push(listener);
        }

        let group_nodes = pairs
            .iter()
            .enumerate()
            .map(|(i, pair)| Node::new(pair.public().clone(), i as u32))
            .collect::<Vec<_>>();

        let (shares, commits) = dealer_shares(n, threshold);
        let group = Group {
            nodes: group_nodes,
            threshold,
            period: Seconds::new(PERIOD),
            catchup_period: Seconds::new(1),
            genesis_time,
            transition_time: genesis_time,
            genesis_seed: GENESIS_SEED.to_vec(),
            dist_key: if with_shares {
                DistPublic::new(commits)
            } else {
                DistPublic::default()
            },
        };

        let mut nodes = vec![];
        for ((pair, share), listener) in pairs.into_iter().zip(shares).zip(listeners) {
            let dir = TempDir::new().unwrap();
            let fs = FileStore::create(dir.path().to_path_buf()).unwrap();
            let address = pair.public().address().clone();
            fs.save_pair(&pair).unwrap();
            fs.save_group(&group).unwrap();
            if with_shares {
                fs.save_share(&share).unwrap();
            }

            nodes.push(TestNode {
                fs,
                listener: Some(listener),
                address,
                daemon: None,
                _dir: dir,
            });
        }

        Self {
            nodes,
            group,
            clock,
        }
    }

    pub async fn start_node(&mut self, i: usize) {
        let listener = self.nodes[i].listener.take().expect("node already started");
        let daemon = Daemon::start::<DefaultScheme, FakeClock>(
            self.nodes[i].fs.clone(),
            self.clock.clone(),
            listener,
        )
        .await
        .unwrap();
        self.nodes[i].daemon = Some(daemon);
    }

    pub async fn start_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.start_node(i).await;
        }
        // Let the handlers reach their select loops.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// Advances the shared fake clock by whole periods.
    pub fn move_periods(&self, periods: u64) {
        self.clock
            .advance(Duration::from_secs(periods * u64::from(PERIOD)));
    }

    pub fn daemon(&self, i: usize) -> &Daemon {
        self.nodes[i].daemon.as_ref().expect("node not started")
    }
}

/// Polls one node for the beacon of `round` until it lands. The budget
/// is wall-clock and generous to absorb slow CI machines.
pub async fn wait_for_beacon(daemon: &Daemon, round: u64) -> PublicRandResponse {
    for _ in 0..300 {
        if let Some(response) = public_rand(daemon, round).await {
            return response;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("beacon for round {round} did not land in time");
}

pub async fn public_rand(daemon: &Daemon, round: u64) -> Option<PublicRandResponse> {
    let (tx, rx) = Callback::new();
    daemon
        .handles
        .tx_cmd
        .send(ChainCmd::PublicRand { round, cb: tx })
        .await
        .ok()?;

    rx.await.ok()?.ok()
}

/// Sends a raw partial as a peer would, returning the handler verdict.
pub async fn inject_partial(
    daemon: &Daemon,
    packet: crate::protobuf::randchain::PartialPacket,
) -> Result<(), ChainError> {
    let (tx, rx) = Callback::new();
    daemon
        .handles
        .tx_partial
        .send((packet, tx))
        .await
        .expect("partial channel closed");

    rx.await.expect("handler dropped the callback")
}
