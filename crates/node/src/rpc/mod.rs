//! JSON-RPC namespaces served by the node: `eth`, `dag` and `sonic`.

use std::{fmt::Display, net::SocketAddr, sync::Arc};

use alloy_eips::BlockNumberOrTag;
use jsonrpsee::{
    RpcModule,
    server::{Server, ServerHandle},
    types::{
        ErrorObjectOwned,
        error::{INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE},
    },
};
use parking_lot::RwLock;
use sonic_dag::Dag;
use sonic_evm::StateDb;
use sonic_primitives::BlockNumber;
use tracing::info;

use crate::{ingress::TxIngress, store::ChainStore};

pub mod dag;
pub mod eth;
pub mod sonic;
pub mod types;

pub use dag::{DagApiServer, DagRpc};
pub use eth::{EthApiServer, EthRpc};
pub use sonic::{SonicApiServer, SonicRpc};

/// Certificates returned by one range call.
pub const MAX_CERTIFICATES_PER_CALL: u64 = 128;

/// Read access to the node for the RPC handlers.
#[derive(Clone)]
pub struct RpcContext {
    pub store: Arc<ChainStore>,
    pub state: Arc<RwLock<StateDb>>,
    pub dag: Arc<RwLock<Dag>>,
    pub ingress: TxIngress,
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext").finish_non_exhaustive()
    }
}

impl RpcContext {
    /// Resolves a block tag against the current head. Pending and
    /// safe/finalized all name the head: blocks are final once committed.
    pub fn resolve(&self, tag: BlockNumberOrTag) -> BlockNumber {
        match tag {
            BlockNumberOrTag::Earliest => 0,
            BlockNumberOrTag::Number(number) => number,
            BlockNumberOrTag::Latest
            | BlockNumberOrTag::Pending
            | BlockNumberOrTag::Safe
            | BlockNumberOrTag::Finalized => self.store.head().number,
        }
    }

    /// All namespaces merged into one module.
    pub fn into_module(self) -> eyre::Result<RpcModule<()>> {
        let mut module = RpcModule::new(());
        module.merge(EthRpc::new(self.clone()).into_rpc())?;
        module.merge(DagRpc::new(self.clone()).into_rpc())?;
        module.merge(SonicRpc::new(self).into_rpc())?;
        Ok(module)
    }
}

/// Starts the HTTP and WebSocket server on `listen`.
pub async fn start_server(listen: SocketAddr, context: RpcContext) -> eyre::Result<(SocketAddr, ServerHandle)> {
    use eyre::WrapErr as _;

    let server = Server::builder()
        .build(listen)
        .await
        .wrap_err_with(|| format!("failed binding rpc server to `{listen}`"))?;
    let local = server.local_addr().wrap_err("rpc server has no local address")?;
    let handle = server.start(context.into_module()?);
    info!(%local, "rpc server started");
    Ok((local, handle))
}

pub(crate) fn internal_error(error: impl Display) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(INTERNAL_ERROR_CODE, error.to_string(), None::<()>)
}

pub(crate) fn invalid_params(error: impl Display) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(INVALID_PARAMS_CODE, error.to_string(), None::<()>)
}

#[cfg(test)]
pub(crate) mod testing {
    use sonic_chainspec::{Genesis, Upgrades, genesis::FakeGenesis};
    use sonic_dag::EventProcessor;

    use super::*;
    use crate::{
        launch::{Producers, Storage, open_storage},
        network::NoNetwork,
        txpool::TxPool,
    };

    pub(crate) fn context() -> (RpcContext, Storage, Genesis) {
        let genesis = FakeGenesis::new(3, Upgrades::sonic()).build().unwrap();
        let storage = open_storage(Producers::memory(), Some(&genesis)).unwrap();
        let processor = EventProcessor::new(
            storage.store.epoch_state().context(),
            storage.store.dag().epoch(1).unwrap(),
        );
        let ingress = TxIngress::new(
            Arc::new(RwLock::new(TxPool::default())),
            storage.state().clone(),
            storage.store.clone(),
            Arc::new(NoNetwork),
            false,
        );
        let context = RpcContext {
            store: storage.store.clone(),
            state: storage.state().clone(),
            dag: processor.dag(),
            ingress,
        };
        (context, storage, genesis)
    }
}
