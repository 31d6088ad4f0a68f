use super::helpers::*;
use crate::dkg::handler::DkgCmd;
use crate::dkg::handler::DkgStatusInfo;
use crate::dkg::state::DkgStatus;
use crate::dkg::DkgError;
use crate::net::utils::Callback;
use crate::protobuf::randchain::DkgPacket;

use energon::drand::schemes::DefaultScheme;
use std::time::Duration;

async fn dkg_status(net: &TestNet, i: usize) -> DkgStatusInfo {
    let (tx, rx) = Callback::new();
    net.daemon(i)
        .handles
        .tx_dkg
        .send(DkgCmd::Status(tx))
        .await
        .unwrap();

    rx.await.unwrap().unwrap()
}

async fn wait_for_status(net: &TestNet, i: usize, expected: DkgStatus) {
    for _ in 0..600 {
        if dkg_status(net, i).await.status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("node {i} never reached dkg status {expected}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_dkg_bootstraps_the_chain() {
    let mut net = TestNet::provision_fresh(3, 2).await;
    net.start_all().await;

    // Pre-DKG the engine serves nothing.
    assert!(public_rand(net.daemon(0), 0).await.is_none());

    // Node 0 leads, the kick reaches the followers over the wire.
    let (tx, rx) = Callback::new();
    net.daemon(0)
        .handles
        .tx_dkg
        .send(DkgCmd::InitDkg {
            timeout: Duration::from_secs(60),
            entropy: None,
            user_entropy_only: false,
            cb: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    for i in 0..3 {
        wait_for_status(&net, i, DkgStatus::Finished).await;
    }

    // Every node persisted the same distributed public key.
    let reference = net.nodes[0]
        .fs
        .load_group::<DefaultScheme>()
        .unwrap()
        .dist_key;
    assert!(!reference.is_empty());
    for node in &net.nodes[1..] {
        let dist_key = node.fs.load_group::<DefaultScheme>().unwrap().dist_key;
        assert_eq!(reference, dist_key);
    }
    for node in &net.nodes {
        assert!(!node.fs.is_fresh_run());
    }

    // The handed-over engine produces verifiable rounds.
    net.move_periods(1);
    let first = wait_for_beacon(net.daemon(0), 1).await;
    for i in 1..3 {
        let other = wait_for_beacon(net.daemon(i), 1).await;
        assert_eq!(first.signature, other.signature);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reshare_requires_an_epoch_and_a_proposal() {
    let mut net = TestNet::provision_fresh(2, 2).await;
    net.start_all().await;

    // No finished epoch and no proposed group file.
    let (tx, rx) = Callback::new();
    net.daemon(0)
        .handles
        .tx_dkg
        .send(DkgCmd::InitReshare {
            timeout: Duration::from_secs(10),
            cb: tx,
        })
        .await
        .unwrap();
    assert!(matches!(
        rx.await.unwrap(),
        Err(DkgError::MissingProposedGroup)
    ));

    // Stray gossip with nothing running is refused, not buffered.
    let (tx, rx) = Callback::new();
    net.daemon(0)
        .handles
        .tx_dkg
        .send(DkgCmd::Gossip(DkgPacket { bundle: None }, tx))
        .await
        .unwrap();
    assert!(matches!(rx.await.unwrap(), Err(DkgError::NotRunning)));
}
