//! Bundle gossip between DKG participants.
//!
//! The protocol instance emits bundles through a receiver; a pump task
//! converts them to wire packets and fans them out to every participant
//! over its own forwarding task. Everything winds down once the protocol
//! closes its side of the channel.

use super::DkgError;
use crate::key::KeyPoint;
use crate::key::Scheme;
use crate::net::protocol::ProtocolClient;
use crate::net::utils::Peer;
use crate::protobuf::randchain as protobuf;
use crate::protobuf::randchain::dkg_packet::Bundle as ProtoBundle;
use crate::protobuf::randchain::DkgPacket;

use energon::kyber::dkg::protocol::Bundle;
use energon::kyber::dkg::structs::Deal;
use energon::kyber::dkg::structs::DealBundle;
use energon::kyber::dkg::structs::Justification;
use energon::kyber::dkg::structs::JustificationBundle;
use energon::kyber::dkg::structs::Response;
use energon::kyber::dkg::structs::ResponseBundle;
use energon::kyber::dkg::BundleReceiver;
use energon::traits::Affine;
use energon::traits::ScalarField;

use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::Span;

pub(super) struct Broadcast {
    sender: broadcast::Sender<DkgPacket>,
    log: Span,
}

impl Broadcast {
    pub(super) fn init(log: &Span) -> Self {
        let (sender, _) = broadcast::channel::<DkgPacket>(4);

        Self {
            sender,
            log: log.clone(),
        }
    }

    /// Spawns one forwarding task per participant plus the pump moving
    /// bundles from the protocol instance into the fan-out.
    pub(super) fn register_nodes<S: Scheme>(
        self,
        t: &TaskTracker,
        peers: Vec<Peer>,
        mut rx: BundleReceiver<S>,
    ) {
        for peer in peers {
            let mut rx_fanout = self.sender.subscribe();
            let log = self.log.clone();

            t.spawn(async move {
                let mut client = match ProtocolClient::new(&peer) {
                    Ok(client) => client,
                    Err(err) => {
                        error!(parent: &log, "dkg broadcast: unable to reach {peer}: {err}");
                        return;
                    }
                };

                while let Ok(packet) = rx_fanout.recv().await {
                    if let Err(err) = client.broadcast_dkg(packet).await {
                        error!(parent: &log, "dkg broadcast: sending to {peer}: {err}");
                    }
                }
            });
        }

        t.spawn(async move {
            while let Some(bundle) = rx.recv().await {
                match bundle_to_proto(bundle) {
                    Ok(packet) => {
                        debug!(parent: &self.log, "dkg broadcast: pushing bundle");
                        if self.sender.send(packet).is_err() {
                            error!(parent: &self.log, "dkg broadcast: no live subscriptions");
                        }
                    }
                    Err(err) => {
                        error!(parent: &self.log, "dkg broadcast: failed to convert bundle: {err}");
                    }
                }
            }
        });
    }
}

pub(super) fn bundle_to_proto<S: Scheme>(bundle: Bundle<S>) -> Result<DkgPacket, DkgError> {
    let bundle = match bundle {
        Bundle::Deal(d) => {
            let mut commits = Vec::with_capacity(d.public.len());
            for c in d.public {
                commits.push(c.serialize().map_err(|_| DkgError::InvalidBundle)?.into());
            }

            ProtoBundle::Deal(protobuf::DealBundle {
                dealer_index: d.dealer_index,
                commits,
                deals: d
                    .deals
                    .into_iter()
                    .map(|deal| protobuf::Deal {
                        share_index: deal.share_index,
                        encrypted_share: deal.encrypted_share,
                    })
                    .collect(),
                session_id: d.session_id,
                signature: d.signature,
            })
        }
        Bundle::Response(r) => ProtoBundle::Response(protobuf::ResponseBundle {
            share_index: r.share_index,
            responses: r
                .responses
                .into_iter()
                .map(|resp| protobuf::Response {
                    dealer_index: resp.dealer_index,
                    status: resp.status,
                })
                .collect(),
            session_id: r.session_id,
            signature: r.signature,
        }),
        Bundle::Justification(j) => {
            let mut justifications = Vec::with_capacity(j.justifications.len());
            for justification in j.justifications {
                justifications.push(protobuf::Justification {
                    share_index: justification.share_index,
                    share: justification
                        .share
                        .to_bytes_be()
                        .map_err(|_| DkgError::InvalidBundle)?
                        .into(),
                });
            }

            ProtoBundle::Justification(protobuf::JustificationBundle {
                dealer_index: j.dealer_index,
                justifications,
                session_id: j.session_id,
                signature: j.signature,
            })
        }
    };

    Ok(DkgPacket {
        bundle: Some(bundle),
    })
}

pub(super) fn bundle_from_proto<S: Scheme>(packet: DkgPacket) -> Result<Bundle<S>, DkgError> {
    let bundle = match packet.bundle.ok_or(DkgError::InvalidBundle)? {
        ProtoBundle::Deal(d) => Bundle::Deal(DealBundle {
            dealer_index: d.dealer_index,
            public: d
                .commits
                .iter()
                .map(|commit| KeyPoint::<S>::deserialize(commit))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| DkgError::InvalidBundle)?,
            deals: d
                .deals
                .into_iter()
                .map(|deal| Deal {
                    share_index: deal.share_index,
                    encrypted_share: deal.encrypted_share,
                })
                .collect(),
            session_id: d.session_id,
            signature: d.signature,
        }),
        ProtoBundle::Response(r) => Bundle::Response(ResponseBundle {
            share_index: r.share_index,
            responses: r
                .responses
                .into_iter()
                .map(|resp| Response {
                    dealer_index: resp.dealer_index,
                    status: resp.status,
                })
                .collect(),
            session_id: r.session_id,
            signature: r.signature,
        }),
        ProtoBundle::Justification(j) => {
            let mut justifications = Vec::with_capacity(j.justifications.len());
            for justification in j.justifications {
                justifications.push(Justification::<S> {
                    share_index: justification.share_index,
                    share: S::Scalar::from_bytes_be(&justification.share)
                        .map_err(|_| DkgError::InvalidBundle)?,
                });
            }

            Bundle::Justification(JustificationBundle {
                dealer_index: j.dealer_index,
                justifications,
                session_id: j.session_id,
                signature: j.signature,
            })
        }
    };

    Ok(bundle)
}

/// `true` for the bundle kind an old-group member opens a resharing with.
pub(super) fn is_deal(packet: &DkgPacket) -> bool {
    matches!(packet.bundle, Some(ProtoBundle::Deal(_)))
}
