//! Server and client implementations for the node-to-node protocol.

use super::public::PublicHandler;
use super::utils::Classify;
use super::utils::DialError;
use super::utils::ErrorKind;
use super::utils::Peer;
use super::utils::DEFAULT_DEADLINE;

use crate::chain::handler::PartialMsg;
use crate::chain::ChainCmd;
use crate::dkg::handler::DkgCmd;
use crate::protobuf::randchain as protobuf;

use protobuf::protocol_client::ProtocolClient as TonicProtocolClient;
use protobuf::protocol_server::Protocol;
use protobuf::protocol_server::ProtocolServer;
use protobuf::public_server::PublicServer;
use protobuf::BeaconPacket;
use protobuf::DkgPacket;
use protobuf::Empty;
use protobuf::HomeRequest;
use protobuf::HomeResponse;
use protobuf::PartialPacket;
use protobuf::ResharePacket;
use protobuf::SetupPacket;
use protobuf::SyncRequest;

use crate::net::utils::Callback;
use std::pin::Pin;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Server;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;
use tracing::error;

/// Channel endpoints the RPC surface forwards into.
#[derive(Clone)]
pub struct NodeHandles {
    pub tx_partial: mpsc::Sender<PartialMsg>,
    pub tx_cmd: mpsc::Sender<ChainCmd>,
    pub tx_dkg: mpsc::Sender<DkgCmd>,
}

/// Maps an engine error onto the status a remote caller sees.
pub fn to_status(err: &(impl Classify + std::fmt::Display)) -> Status {
    let msg = err.to_string();
    match err.kind() {
        ErrorKind::Transient => Status::unavailable(msg),
        ErrorKind::Invalid => Status::invalid_argument(msg),
        ErrorKind::Conflict => Status::aborted(msg),
        ErrorKind::Timeout => Status::deadline_exceeded(msg),
        ErrorKind::NotReady => Status::failed_precondition(msg),
        ErrorKind::NotFound => Status::not_found(msg),
    }
}

fn closed() -> Status {
    Status::unavailable("node is shutting down")
}

/// Implementor of the [`Protocol`] service.
pub struct ProtocolHandler {
    handles: NodeHandles,
}

impl ProtocolHandler {
    pub fn new(handles: NodeHandles) -> Self {
        Self { handles }
    }
}

#[tonic::async_trait]
impl Protocol for ProtocolHandler {
    type SyncChainStream = Pin<Box<dyn Stream<Item = Result<BeaconPacket, Status>> + Send>>;

    async fn home(
        &self,
        _request: Request<HomeRequest>,
    ) -> Result<Response<HomeResponse>, Status> {
        let (tx, rx) = Callback::new();
        self.handles
            .tx_cmd
            .send(ChainCmd::Status(tx))
            .await
            .map_err(|_| closed())?;
        let status = rx
            .await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        Ok(Response::new(HomeResponse {
            status: status.to_string(),
        }))
    }

    async fn partial(
        &self,
        request: Request<PartialPacket>,
    ) -> Result<Response<Empty>, Status> {
        let (tx, rx) = Callback::new();
        self.handles
            .tx_partial
            .send((request.into_inner(), tx))
            .await
            .map_err(|_| closed())?;
        rx.await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        Ok(Response::new(Empty {}))
    }

    async fn sync_chain(
        &self,
        request: Request<SyncRequest>,
    ) -> Result<Response<Self::SyncChainStream>, Status> {
        let from_round = request.into_inner().from_round;

        let (tx, rx) = Callback::new();
        self.handles
            .tx_cmd
            .send(ChainCmd::Cursor { from_round, cb: tx })
            .await
            .map_err(|_| closed())?;
        let stream_rx = rx
            .await
            .map_err(|_| closed())?
            .map_err(|err| Status::unavailable(err.to_string()))?;

        Ok(Response::new(Box::pin(ReceiverStream::new(stream_rx))))
    }

    async fn setup(&self, request: Request<SetupPacket>) -> Result<Response<Empty>, Status> {
        let (tx, rx) = Callback::new();
        self.handles
            .tx_dkg
            .send(DkgCmd::Setup(request.into_inner(), tx))
            .await
            .map_err(|_| closed())?;
        rx.await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        Ok(Response::new(Empty {}))
    }

    async fn reshare(&self, request: Request<ResharePacket>) -> Result<Response<Empty>, Status> {
        let (tx, rx) = Callback::new();
        self.handles
            .tx_dkg
            .send(DkgCmd::Reshare(request.into_inner(), tx))
            .await
            .map_err(|_| closed())?;
        rx.await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        Ok(Response::new(Empty {}))
    }

    async fn broadcast_dkg(&self, request: Request<DkgPacket>) -> Result<Response<Empty>, Status> {
        let (tx, rx) = Callback::new();
        self.handles
            .tx_dkg
            .send(DkgCmd::Gossip(request.into_inner(), tx))
            .await
            .map_err(|_| closed())?;
        rx.await
            .map_err(|_| closed())?
            .map_err(|err| to_status(&err))?;

        Ok(Response::new(Empty {}))
    }
}

/// Binds the protocol, public and health services on `listener` and
/// serves until `token` is cancelled.
pub async fn start_server(
    handles: NodeHandles,
    listener: TcpListener,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let (_health_reporter, health_service) = tonic_health::server::health_reporter();

    Server::builder()
        .add_service(ProtocolServer::new(ProtocolHandler::new(handles.clone())))
        .add_service(PublicServer::new(PublicHandler::new(handles)))
        .add_service(health_service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            let () = token.cancelled().await;
        })
        .await
        .inspect_err(|err| error!("node server: {err}"))?;

    Ok(())
}

/// Client half of the node-to-node protocol: one lazily dialed channel
/// per peer, unary calls carrying [`DEFAULT_DEADLINE`].
#[derive(Clone)]
pub struct ProtocolClient {
    client: TonicProtocolClient<Channel>,
}

impl ProtocolClient {
    pub fn new(peer: &Peer) -> Result<Self, DialError> {
        let channel = super::utils::connect_lazy(peer)?;

        Ok(Self {
            client: TonicProtocolClient::new(channel),
        })
    }

    fn with_deadline<T>(message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(DEFAULT_DEADLINE);
        request
    }

    pub async fn home(&mut self) -> anyhow::Result<String> {
        let response = self.client.home(Self::with_deadline(HomeRequest {})).await?;

        Ok(response.into_inner().status)
    }

    pub async fn partial(&mut self, packet: PartialPacket) -> anyhow::Result<()> {
        let _ = self.client.partial(Self::with_deadline(packet)).await?;

        Ok(())
    }

    pub async fn sync_chain(&mut self, from_round: u64) -> anyhow::Result<Streaming<BeaconPacket>> {
        let stream = self
            .client
            .sync_chain(Request::new(SyncRequest { from_round }))
            .await?
            .into_inner();

        Ok(stream)
    }

    pub async fn setup(&mut self, packet: SetupPacket) -> anyhow::Result<()> {
        let _ = self.client.setup(Self::with_deadline(packet)).await?;

        Ok(())
    }

    pub async fn reshare(&mut self, packet: ResharePacket) -> anyhow::Result<()> {
        let _ = self.client.reshare(Self::with_deadline(packet)).await?;

        Ok(())
    }

    pub async fn broadcast_dkg(&mut self, packet: DkgPacket) -> anyhow::Result<()> {
        let _ = self.client.broadcast_dkg(Self::with_deadline(packet)).await?;

        Ok(())
    }
}
