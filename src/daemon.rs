// SPDX-License-Identifier: Apache-2.0

//! Assembly of one node instance: chain engine, key generation actor,
//! connection pool and the RPC surface, all scoped to a [`FileStore`].

use crate::chain::handler::init_chain;
use crate::chain::time::Clock;
use crate::chain::ChainCmd;
use crate::chain::ChainError;
use crate::dkg::handler::init_dkg;
use crate::key::store::FileStore;
use crate::key::Scheme;
use crate::net::pool::Pool;
use crate::net::protocol::start_server;
use crate::net::protocol::NodeHandles;
use crate::net::utils::Callback;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;
use tracing::info;
use tracing::info_span;

/// Handle over a running node. No global state: everything hangs off
/// this value and the file store it was started from.
pub struct Daemon {
    pub handles: NodeHandles,
    pub tracker: TaskTracker,
    pub token: CancellationToken,
}

impl Daemon {
    /// Starts the engine and serves the node RPC surface on `listener`.
    pub async fn start<S: Scheme, C: Clock>(
        fs: FileStore,
        clock: C,
        listener: TcpListener,
    ) -> anyhow::Result<Self> {
        let pair = fs.load_pair::<S>()?;
        let address = pair.public().address().clone();
        let log = info_span!("", node = address.to_string());
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        let pool = Pool::start(log.clone());
        let (tx_partial, tx_cmd) =
            init_chain::<S, C>(fs.clone(), clock.clone(), pool, log.clone(), &tracker);
        let tx_dkg = init_dkg::<S, C>(fs, clock, pair, tx_cmd.clone(), log.clone(), &tracker);

        let handles = NodeHandles {
            tx_partial,
            tx_cmd,
            tx_dkg,
        };

        tracker.spawn({
            let handles = handles.clone();
            let token = token.clone();
            async move {
                if let Err(err) = start_server(handles, listener, token).await {
                    error!("node server terminated: {err}");
                }
            }
        });

        info!(parent: &log, "node started on {address}");

        Ok(Self {
            handles,
            tracker,
            token,
        })
    }

    /// Graceful stop: the chain handler terminates within one round.
    pub async fn shutdown(&self) -> Result<(), ChainError> {
        let (tx, rx) = Callback::new();
        if self
            .handles
            .tx_cmd
            .send(ChainCmd::Shutdown(tx))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.token.cancel();
        self.tracker.close();

        Ok(())
    }
}
