//! Configuration and finalization of one key generation run.

use super::DkgError;
use super::DkgNode;
use crate::chain::time;
use crate::key::group::Group;
use crate::key::keys::DistPublic;
use crate::key::keys::Pair;
use crate::key::Scheme;

use energon::kyber::dkg::Config;
use energon::kyber::dkg::DistKeyShare;
use energon::kyber::dkg::DkgOutput;

use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;
use tracing::Span;

/// Time of each DKG wire phase. The protocol runs in "fast sync" mode,
/// moving on as soon as every expected bundle arrived.
pub(super) const DKG_PHASE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Opaque external entropy capability, e.g. a hardware RNG wrapper.
pub struct EntropySource(Box<dyn Fn() -> std::io::Result<Vec<u8>> + Send + Sync>);

impl EntropySource {
    pub fn new(f: impl Fn() -> std::io::Result<Vec<u8>> + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }
}

/// Session seed chosen by the leader. User-provided entropy is folded
/// into the OS RNG output; it replaces it only when `user_only` is set,
/// which is meant for reproducible debugging runs.
pub(super) fn mixed_entropy(source: Option<&EntropySource>, user_only: bool) -> [u8; 32] {
    let mut h = Sha256::new();

    if let Some(EntropySource(read)) = source {
        match read() {
            Ok(bytes) => h.update(&bytes),
            Err(_) => h.update([]),
        }
        if user_only {
            return h.finalize().into();
        }
    }

    let mut os = [0u8; 32];
    rand::rng().fill_bytes(&mut os);
    h.update(os);
    h.finalize().into()
}

/// Protocol nonce every participant derives identically from the group
/// file and the leader's announced seed.
pub(super) fn session_nonce(group_hash: &[u8; 32], session_seed: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(group_hash);
    h.update(session_seed);
    h.finalize().into()
}

fn dkg_nodes<S: Scheme>(group: &Group<S>) -> Vec<DkgNode<S>> {
    group
        .nodes
        .iter()
        .map(|n| DkgNode {
            index: n.index(),
            public: n.public().key().clone(),
        })
        .collect()
}

/// Config for the initial key generation: no old nodes, no prior share.
pub(super) fn initial_config<S: Scheme>(
    pair: &Pair<S>,
    group: &Group<S>,
    nonce: [u8; 32],
    log: Span,
) -> Result<Config<S>, DkgError> {
    group.find_index(pair.public()).ok_or(DkgError::NotInGroup)?;

    Ok(Config {
        long_term: pair.private().clone(),
        old_nodes: vec![],
        new_nodes: dkg_nodes(group),
        public_coeffs: vec![],
        share: None,
        threshold: group.threshold,
        old_threshold: 0,
        nonce,
        log,
    })
}

/// Config for a resharing. A node present only in the old group deals
/// but receives nothing; one present only in the new group consumes
/// deals without contributing any (its `share` is `None`).
pub(super) fn reshare_config<S: Scheme>(
    pair: &Pair<S>,
    old_group: &Group<S>,
    old_share: Option<DistKeyShare<S>>,
    new_group: &Group<S>,
    nonce: [u8; 32],
    log: Span,
) -> Result<Config<S>, DkgError> {
    let in_old = old_group.find_index(pair.public()).is_some();
    let in_new = new_group.find_index(pair.public()).is_some();
    if !in_old && !in_new {
        return Err(DkgError::NotInGroup);
    }

    Ok(Config {
        long_term: pair.private().clone(),
        old_nodes: dkg_nodes(old_group),
        new_nodes: dkg_nodes(new_group),
        public_coeffs: old_group.dist_key.commits().to_vec(),
        share: if in_old { old_share } else { None },
        threshold: new_group.threshold,
        old_threshold: old_group.threshold,
        nonce,
        log,
    })
}

/// Maps the protocol output into the persisted epoch materials: the
/// group file augmented with the distributed key and transition time,
/// and this node's new share.
///
/// For a resharing the distributed public key must be byte-identical to
/// the previous epoch's.
pub(super) fn finalize<S: Scheme>(
    output: DkgOutput<S>,
    group: &Group<S>,
    previous: Option<&Group<S>>,
    now: u64,
) -> Result<(Group<S>, DistKeyShare<S>), DkgError> {
    let DkgOutput { qual, key } = output;

    let dist_key = DistPublic::new(key.commits.clone());
    let (transition_time, genesis_time) = match previous {
        None => (group.genesis_time, group.genesis_time),
        Some(old) => {
            if old.dist_key.public_key() != dist_key.public_key() {
                return Err(DkgError::DistKeyChanged);
            }
            let period = old.period.get_value();
            let current = time::current_round(now, period, old.genesis_time);
            let first_round = current + time::ROUNDS_UNTIL_TRANSITION;
            (
                time::time_of_round(period, old.genesis_time, first_round),
                old.genesis_time,
            )
        }
    };

    // Only qualified participants remain in the final group.
    let nodes = group
        .nodes
        .iter()
        .filter(|n| qual.iter().any(|q| q.index == n.index()))
        .cloned()
        .collect();

    let mut final_group = Group {
        nodes,
        threshold: group.threshold,
        period: group.period,
        catchup_period: group.catchup_period,
        genesis_time,
        transition_time,
        genesis_seed: group.genesis_seed.clone(),
        dist_key,
    };

    if final_group.genesis_seed.is_empty() {
        final_group.genesis_seed = final_group.hash()?.to_vec();
    }

    let share = DistKeyShare {
        commits: key.commits,
        pri_share: key.pri_share,
    };

    Ok((final_group, share))
}

/// First beacon round the new epoch signs for.
pub(super) fn first_epoch_round<S: Scheme>(group: &Group<S>) -> u64 {
    if group.transition_time <= group.genesis_time {
        1
    } else {
        time::current_round(
            group.transition_time,
            group.period.get_value(),
            group.genesis_time,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::node::Node;
    use crate::net::utils::Address;
    use crate::net::utils::Seconds;
    use crate::test::helpers::dealer_shares;
    use energon::drand::schemes::DefaultScheme;

    fn make_group(
        dist_key: DistPublic<DefaultScheme>,
        genesis_time: u64,
    ) -> Group<DefaultScheme> {
        let nodes = (0..3u32)
            .map(|i| {
                let address = Address::precheck(&format!("127.0.0.1:{}", 9100 + i)).unwrap();
                let pair = Pair::<DefaultScheme>::generate(address, false).unwrap();
                Node::new(pair.public().clone(), i)
            })
            .collect();

        Group {
            nodes,
            threshold: 2,
            period: Seconds::new(2),
            catchup_period: Seconds::new(1),
            genesis_time,
            transition_time: genesis_time,
            genesis_seed: vec![3; 32],
            dist_key,
        }
    }

    fn output_with(
        share: energon::kyber::dkg::DistKeyShare<DefaultScheme>,
        group: &Group<DefaultScheme>,
        qual_indices: &[u32],
    ) -> DkgOutput<DefaultScheme> {
        let qual = group
            .nodes
            .iter()
            .filter(|n| qual_indices.contains(&n.index()))
            .map(|n| DkgNode {
                index: n.index(),
                public: n.public().key().clone(),
            })
            .collect();

        DkgOutput { key: share, qual }
    }

    #[test]
    fn reshare_preserves_distributed_key() {
        let genesis = 1_000;
        let (mut shares, commits) = dealer_shares(3, 2);
        let old_group = make_group(DistPublic::new(commits), genesis);
        let proposed = make_group(DistPublic::default(), genesis);

        let output = output_with(shares.remove(0), &proposed, &[0, 1, 2]);
        let now = genesis + 100;
        let (final_group, _) = finalize(output, &proposed, Some(&old_group), now).unwrap();

        assert_eq!(
            final_group.dist_key.public_key(),
            old_group.dist_key.public_key()
        );
        // Transition lands a fixed number of rounds after `now`.
        let current = time::current_round(now, 2, genesis);
        let expected =
            time::time_of_round(2, genesis, current + time::ROUNDS_UNTIL_TRANSITION);
        assert_eq!(final_group.transition_time, expected);
    }

    #[test]
    fn reshare_with_different_key_is_rejected() {
        let genesis = 1_000;
        let (_, old_commits) = dealer_shares(3, 2);
        let (mut other_shares, _) = dealer_shares(3, 2);

        let old_group = make_group(DistPublic::new(old_commits), genesis);
        let proposed = make_group(DistPublic::default(), genesis);

        let output = output_with(other_shares.remove(0), &proposed, &[0, 1, 2]);
        assert!(matches!(
            finalize(output, &proposed, Some(&old_group), genesis + 100),
            Err(DkgError::DistKeyChanged)
        ));
    }

    #[test]
    fn unqualified_nodes_leave_the_final_group() {
        let (mut shares, _commits) = dealer_shares(3, 2);
        let group = make_group(DistPublic::default(), 1_000);

        let output = output_with(shares.remove(0), &group, &[0, 2]);
        let (final_group, _) = finalize(output, &group, None, 900).unwrap();

        let indices: Vec<u32> = final_group.nodes.iter().map(Node::index).collect();
        assert_eq!(indices, vec![0, 2]);
        // Initial epoch transitions at genesis and starts at round 1.
        assert_eq!(final_group.transition_time, final_group.genesis_time);
        assert_eq!(first_epoch_round(&final_group), 1);
    }

    #[test]
    fn nonce_is_deterministic_per_session() {
        let hash = [7u8; 32];
        assert_eq!(session_nonce(&hash, b"seed"), session_nonce(&hash, b"seed"));
        assert_ne!(session_nonce(&hash, b"seed"), session_nonce(&hash, b"dees"));
        assert_ne!(
            session_nonce(&[8u8; 32], b"seed"),
            session_nonce(&hash, b"seed")
        );
    }

    #[test]
    fn user_entropy_is_mixed_with_os_rng() {
        let source = EntropySource::new(|| Ok(vec![1, 2, 3]));

        // User-only mode is deterministic for the same input.
        let a = mixed_entropy(Some(&source), true);
        let b = mixed_entropy(Some(&source), true);
        assert_eq!(a, b);

        // Mixed mode never is.
        let c = mixed_entropy(Some(&source), false);
        let d = mixed_entropy(Some(&source), false);
        assert_ne!(c, d);
        assert_ne!(a, c);
    }
}
