use alloy_primitives::U64;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use sonic_scc::{BlockCertificate, CommitteeCertificate};

use super::{
    MAX_CERTIFICATES_PER_CALL, RpcContext, internal_error,
    types::{NumberOrMax, capped_range},
};

#[rpc(server, namespace = "sonic")]
pub trait SonicApi {
    /// Certificates of blocks `from..=to`, at most
    /// [`MAX_CERTIFICATES_PER_CALL`], ending before the first uncertified
    /// block.
    #[method(name = "getBlockCertificates")]
    fn block_certificates(&self, from: U64, to: NumberOrMax) -> RpcResult<Vec<BlockCertificate>>;

    /// Certificates of the committees of epochs `from..=to`, with the same
    /// limits as block certificates.
    #[method(name = "getCommitteeCertificates")]
    fn committee_certificates(&self, from: U64, to: NumberOrMax) -> RpcResult<Vec<CommitteeCertificate>>;
}

#[derive(Debug)]
pub struct SonicRpc {
    context: RpcContext,
}

impl SonicRpc {
    pub const fn new(context: RpcContext) -> Self {
        Self { context }
    }
}

impl SonicApiServer for SonicRpc {
    fn block_certificates(&self, from: U64, to: NumberOrMax) -> RpcResult<Vec<BlockCertificate>> {
        let store = &self.context.store;
        let to = to.resolve(store.head().number);
        let mut out = Vec::new();
        for number in capped_range(from.to(), to, MAX_CERTIFICATES_PER_CALL) {
            match store.block_certificate(number).map_err(internal_error)? {
                Some(certificate) => out.push(certificate),
                None => break,
            }
        }
        Ok(out)
    }

    fn committee_certificates(&self, from: U64, to: NumberOrMax) -> RpcResult<Vec<CommitteeCertificate>> {
        let store = &self.context.store;
        let to = to.resolve(u64::from(store.epoch_state().epoch));
        let mut out = Vec::new();
        for epoch in capped_range(from.to(), to, MAX_CERTIFICATES_PER_CALL) {
            let Ok(epoch) = u32::try_from(epoch) else {
                break;
            };
            match store.committee_certificate(epoch).map_err(internal_error)? {
                Some(certificate) => out.push(certificate),
                None => break,
            }
        }
        Ok(out)
    }
}
