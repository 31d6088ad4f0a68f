use super::helpers::*;
use crate::chain;
use crate::chain::store::ChainStore;
use crate::chain::Beacon;
use crate::chain::ChainCmd;
use crate::chain::ChainError;
use crate::chain::StoreError;
use crate::chain::signer::PartialSigner;
use crate::net::utils::Callback;
use crate::protobuf::randchain::PartialPacket;

use energon::drand::schemes::DefaultScheme;
use energon::kyber::tbls;

use sha2::Digest;
use sha2::Sha256;
use std::time::Duration;
use tracing::info_span;

fn signer_for(net: &TestNet, i: usize) -> PartialSigner<DefaultScheme> {
    let share = net.nodes[i].fs.load_share::<DefaultScheme>().unwrap();
    PartialSigner::new(&net.group.nodes, share)
}

fn packet_for(
    signer: &PartialSigner<DefaultScheme>,
    round: u64,
    head: &Beacon,
) -> PartialPacket {
    let share = signer.sign_round(round, head).unwrap();
    PartialPacket {
        round,
        previous_round: head.round,
        previous_sig: head.signature.clone(),
        partial_sig: share.serialize().unwrap(),
    }
}

#[tokio::test]
async fn threshold_signing_roundtrip() {
    let net = TestNet::provision(3, 2).await;
    let genesis = Beacon::genesis(GENESIS_SEED.to_vec());

    // Two distinct signers contribute for round 1.
    let verifier = signer_for(&net, 2);
    let mut shares = vec![];
    for i in 0..2 {
        let packet = packet_for(&signer_for(&net, i), 1, &genesis);
        let (share, _) = verifier.verify_partial(&packet).unwrap();
        shares.push(share);
    }
    shares.sort_by_key(|s| s.index());

    let recovered = tbls::recover_unchecked(&shares).unwrap();
    let public_key = net.group.dist_key.public_key().unwrap();
    assert!(chain::is_valid_signature::<DefaultScheme>(
        public_key, &genesis, 1, &recovered,
    ));

    // A wrong round does not verify under the same signature.
    assert!(!chain::is_valid_signature::<DefaultScheme>(
        public_key, &genesis, 2, &recovered,
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn beacon_chain_happy_path() {
    let mut net = TestNet::provision(3, 2).await;
    net.start_all().await;

    // Before genesis nothing is produced.
    assert!(public_rand(net.daemon(0), 0).await.is_none());

    // Genesis: round 1 on every node, byte-identical.
    net.move_periods(1);
    let first = wait_for_beacon(net.daemon(0), 1).await;
    assert_eq!(first.previous_round, 0);
    assert_eq!(first.previous_sig, GENESIS_SEED.to_vec());
    for i in 1..3 {
        let other = wait_for_beacon(net.daemon(i), 1).await;
        assert_eq!(first.signature, other.signature);
        assert_eq!(first.randomness, other.randomness);
    }

    // Randomness is the hash of the signature.
    let mut h = Sha256::new();
    h.update(&first.signature);
    assert_eq!(first.randomness, h.finalize().to_vec());

    // One more period: round 2 links to round 1.
    net.move_periods(1);
    let second = wait_for_beacon(net.daemon(0), 2).await;
    assert_eq!(second.previous_round, 1);
    assert_eq!(second.previous_sig, first.signature);
    for i in 1..3 {
        let other = wait_for_beacon(net.daemon(i), 2).await;
        assert_eq!(second.signature, other.signature);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_catches_up() {
    let mut net = TestNet::provision(3, 2).await;
    net.start_node(0).await;
    net.start_node(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Two nodes produce the first two rounds on their own.
    net.move_periods(1);
    wait_for_beacon(net.daemon(0), 1).await;
    net.move_periods(1);
    wait_for_beacon(net.daemon(0), 2).await;
    wait_for_beacon(net.daemon(1), 2).await;

    // Third node joins late and syncs the backlog from its peers.
    net.start_node(2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    net.move_periods(1);

    for round in 1..=3 {
        let expected = wait_for_beacon(net.daemon(0), round).await;
        let synced = wait_for_beacon(net.daemon(2), round).await;
        assert_eq!(expected.signature, synced.signature);
        assert_eq!(expected.previous_round, synced.previous_round);
    }

    // Once caught up, it contributes to fresh rounds like the others.
    net.move_periods(1);
    let fresh = wait_for_beacon(net.daemon(2), 4).await;
    assert_eq!(fresh.previous_round, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equivocating_partial_is_rejected() {
    let mut net = TestNet::provision(3, 2).await;
    net.start_node(0).await;
    net.start_node(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    net.move_periods(1);
    let first = wait_for_beacon(net.daemon(0), 1).await;

    // A valid BLS share over a head that is not ours.
    let forged_head = Beacon {
        round: 1,
        previous_round: 0,
        previous_sig: GENESIS_SEED.to_vec(),
        signature: vec![0xde; first.signature.len()],
    };
    let packet = packet_for(&signer_for(&net, 2), 2, &forged_head);
    let verdict = inject_partial(net.daemon(0), packet).await;
    assert!(matches!(verdict, Err(ChainError::HeadMismatch { .. })));

    // The honest majority still produces round 2 over the real head.
    net.move_periods(1);
    let second = wait_for_beacon(net.daemon(0), 2).await;
    assert_eq!(second.previous_sig, first.signature);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_conflict_stops_the_handler() {
    let mut net = TestNet::provision(1, 1).await;

    // Pre-seed the chain with a forged beacon for round 1.
    let genesis = Beacon::genesis(GENESIS_SEED.to_vec());
    let forged = Beacon::next(&genesis, 1, vec![0xbe, 0xef]);
    {
        let store = ChainStore::start(
            net.nodes[0].fs.chain_store_path(),
            info_span!("seed_store"),
        )
        .await
        .unwrap();
        store.put(genesis).await.unwrap();
        store.put(forged.clone()).await.unwrap();
    }

    net.start_all().await;

    // The single node recovers round 1 by itself and hits the conflict;
    // the handler must stop rather than overwrite.
    net.move_periods(1);
    let mut stopped = false;
    for _ in 0..100 {
        let (tx, rx) = Callback::new();
        if net
            .daemon(0)
            .handles
            .tx_cmd
            .send(ChainCmd::Status(tx))
            .await
            .is_err()
            || rx.await.is_err()
        {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stopped, "handler kept running after a store conflict");

    // Nothing was rewritten.
    let store = ChainStore::start(
        net.nodes[0].fs.chain_store_path(),
        info_span!("check_store"),
    )
    .await
    .unwrap();
    assert_eq!(store.get(1).await.unwrap(), forged);
    assert!(matches!(store.get(2).await, Err(StoreError::NotFound)));
}

#[tokio::test]
async fn partial_index_matches_share_index() {
    let net = TestNet::provision(3, 2).await;
    let genesis = Beacon::genesis(GENESIS_SEED.to_vec());

    for i in 0..3 {
        let signer = signer_for(&net, i);
        let packet = packet_for(&signer, 1, &genesis);
        let index = crate::chain::signer::partial_index::<DefaultScheme>(&packet.partial_sig);
        assert_eq!(index, Some(signer.our_index()));
    }

    // Truncated payloads are refused before any crypto runs.
    assert_eq!(
        crate::chain::signer::partial_index::<DefaultScheme>(&[1, 2, 3]),
        None
    );
}
