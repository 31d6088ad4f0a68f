//! Client-facing randomness service.

use super::protocol::to_status;
use super::protocol::NodeHandles;
use super::utils::Callback;

use crate::chain::ChainCmd;
use crate::protobuf::randchain as protobuf;

use protobuf::public_server::Public;
use protobuf::ChainInfoPacket;
use protobuf::ChainInfoRequest;
use protobuf::PublicRandRequest;
use protobuf::PublicRandResponse;

use std::pin::Pin;
use tokio_stream::Stream;
use tonic::Request;
use tonic::Response;
use tonic::Status;

pub struct PublicHandler {
    handles: NodeHandles,
}

impl PublicHandler {
    pub fn new(handles: NodeHandles) -> Self {
        Self { handles }
    }
}

fn closed() -> Status {
    Status::unavailable("node is shutting down")
}

#[tonic::async_trait]
impl Public for PublicHandler {
    type PublicRandStreamStream =
        Pin<Box<dyn Stream<Item = Result<PublicRandResponse, Status>> + Send>>;

    async fn public_rand(
        &self,
        request: Request<PublicRandRequest>,
    ) -> Result<Response<PublicRandResponse>, Status> {
        let round = request.into_inner().round;

        let (tx, rx) = Callback::new();
        self.handles
            .tx_cmd
            .send(ChainCmd::PublicRand { round, cb: tx })
            .await
            .map_err(|_| closed())?;
        let response = rx
            .await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        Ok(Response::new(response))
    }

    /// Streams every beacon stored from the moment of subscription. The
    /// subscription lives until the client disconnects or falls too far
    /// behind, at which point the registry drops it.
    async fn public_rand_stream(
        &self,
        _request: Request<PublicRandRequest>,
    ) -> Result<Response<Self::PublicRandStreamStream>, Status> {
        let (tx, rx) = Callback::new();
        self.handles
            .tx_cmd
            .send(ChainCmd::Subscribe(tx))
            .await
            .map_err(|_| closed())?;
        let mut beacons = rx
            .await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        let stream = async_stream(move |tx_out: tokio::sync::mpsc::Sender<_>| async move {
            while let Some(beacon) = beacons.recv().await {
                let response = PublicRandResponse {
                    round: beacon.round,
                    previous_round: beacon.previous_round,
                    previous_sig: beacon.previous_sig.clone(),
                    randomness: beacon.randomness().to_vec(),
                    signature: beacon.signature,
                };
                if tx_out.send(Ok(response)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Response::new(Box::pin(stream)))
    }

    async fn chain_info(
        &self,
        _request: Request<ChainInfoRequest>,
    ) -> Result<Response<ChainInfoPacket>, Status> {
        let (tx, rx) = Callback::new();
        self.handles
            .tx_cmd
            .send(ChainCmd::ChainInfo(tx))
            .await
            .map_err(|_| closed())?;
        let packet = rx
            .await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        Ok(Response::new(packet))
    }
}

/// Small adapter turning a producer task into a receiver stream.
fn async_stream<T, F, Fut>(producer: F) -> tokio_stream::wrappers::ReceiverStream<T>
where
    T: Send + 'static,
    F: FnOnce(tokio::sync::mpsc::Sender<T>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(producer(tx));

    tokio_stream::wrappers::ReceiverStream::new(rx)
}
