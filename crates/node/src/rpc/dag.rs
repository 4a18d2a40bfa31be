use alloy_primitives::{B256, U64};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use sonic_primitives::Epoch;

use super::{RpcContext, internal_error, invalid_params, types::RpcEvent};

#[rpc(server, namespace = "dag")]
pub trait DagApi {
    /// Current heads of the running epoch, or the final heads of a sealed one.
    #[method(name = "getHeads")]
    fn heads(&self, epoch: Option<U64>) -> RpcResult<Vec<B256>>;

    #[method(name = "getEvent")]
    fn event(&self, id: B256) -> RpcResult<Option<RpcEvent>>;
}

#[derive(Debug)]
pub struct DagRpc {
    context: RpcContext,
}

impl DagRpc {
    pub const fn new(context: RpcContext) -> Self {
        Self { context }
    }
}

impl DagApiServer for DagRpc {
    fn heads(&self, epoch: Option<U64>) -> RpcResult<Vec<B256>> {
        let current = self.context.dag.read().epoch();
        let epoch = match epoch {
            Some(epoch) => Epoch::try_from(epoch.to::<u64>()).map_err(invalid_params)?,
            None => current,
        };
        if epoch == current {
            return Ok(self.context.dag.read().head_ids());
        }
        let dag = self.context.store.dag();
        if !dag.epochs().map_err(internal_error)?.contains(&epoch) {
            return Err(invalid_params(format!("events of epoch `{epoch}` are not available")));
        }
        dag.epoch(epoch)
            .and_then(|events| events.sealed_heads())
            .map_err(internal_error)?
            .ok_or_else(|| invalid_params(format!("epoch `{epoch}` is not sealed")))
    }

    fn event(&self, id: B256) -> RpcResult<Option<RpcEvent>> {
        if let Some(event) = self.context.dag.read().by_id(&id) {
            return Ok(Some(RpcEvent::from(&*event.event)));
        }
        let dag = self.context.store.dag();
        for epoch in dag.epochs().map_err(internal_error)?.into_iter().rev() {
            let stored = dag
                .epoch(epoch)
                .and_then(|events| events.get(&id))
                .map_err(internal_error)?;
            if let Some(event) = stored {
                return Ok(Some(RpcEvent::from(&event)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use sonic_dag::{EventProcessor, testing::EventFactory};
    use sonic_primitives::{Decode as _, Event};

    use super::*;
    use crate::rpc::testing::context;

    #[test]
    fn serves_heads_and_events() {
        let (mut context, storage, _) = context();
        let state = storage.store.epoch_state();
        let mut processor =
            EventProcessor::new(state.context(), storage.store.dag().epoch(1).unwrap());
        context.dag = processor.dag();
        let rpc = DagRpc::new(context);

        let mut factory = EventFactory::new(state.context());
        let round = factory.round();
        for event in round.clone() {
            processor.process(event).unwrap();
        }
        let mut heads = rpc.heads(None).unwrap();
        heads.sort();
        let mut expected: Vec<_> = round.iter().map(|event| event.id()).collect();
        expected.sort();
        assert_eq!(heads, expected);

        let served = rpc.event(round[1].id()).unwrap().unwrap();
        assert_eq!(served.version, 2);
        assert_eq!(served.creator, U64::from(round[1].creator));
        assert_eq!(Event::decode(&served.raw).unwrap(), round[1]);
        assert!(rpc.event(B256::repeat_byte(7)).unwrap().is_none());
        assert!(rpc.heads(Some(U64::from(9))).is_err());
    }
}
