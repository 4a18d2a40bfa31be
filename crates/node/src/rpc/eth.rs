use alloy_eips::BlockNumberOrTag;
use alloy_primitives::{Address, B256, Bytes, U64, U256};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use sonic_chainspec::Rules;
use sonic_primitives::Block;

use super::{
    RpcContext, internal_error, invalid_params,
    types::{RpcBlock, RpcReceipt, RpcTransaction},
};

#[rpc(server, namespace = "eth")]
pub trait EthApi {
    #[method(name = "blockNumber")]
    fn block_number(&self) -> RpcResult<U64>;

    #[method(name = "chainId")]
    fn chain_id(&self) -> RpcResult<U64>;

    #[method(name = "currentEpoch")]
    fn current_epoch(&self) -> RpcResult<U64>;

    #[method(name = "getBlockByNumber")]
    fn block_by_number(&self, tag: BlockNumberOrTag, full: bool) -> RpcResult<Option<RpcBlock>>;

    #[method(name = "getBlockByHash")]
    fn block_by_hash(&self, hash: B256, full: bool) -> RpcResult<Option<RpcBlock>>;

    /// Rules in force for the block `tag` resolves to.
    #[method(name = "getRules")]
    fn rules(&self, tag: BlockNumberOrTag) -> RpcResult<Option<Rules>>;

    #[method(name = "getTransactionByHash")]
    fn transaction_by_hash(&self, hash: B256) -> RpcResult<Option<RpcTransaction>>;

    #[method(name = "getTransactionReceipt")]
    fn transaction_receipt(&self, hash: B256) -> RpcResult<Option<RpcReceipt>>;

    #[method(name = "getBalance")]
    fn balance(&self, address: Address, tag: Option<BlockNumberOrTag>) -> RpcResult<U256>;

    #[method(name = "getTransactionCount")]
    fn transaction_count(&self, address: Address, tag: Option<BlockNumberOrTag>) -> RpcResult<U64>;

    #[method(name = "sendRawTransaction")]
    fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<B256>;
}

#[derive(Debug)]
pub struct EthRpc {
    context: RpcContext,
}

impl EthRpc {
    pub const fn new(context: RpcContext) -> Self {
        Self { context }
    }

    fn block(&self, tag: BlockNumberOrTag) -> RpcResult<Option<Block>> {
        let number = self.context.resolve(tag);
        self.context.store.block(number).map_err(internal_error)
    }

    fn account(&self, address: Address, tag: Option<BlockNumberOrTag>) -> RpcResult<sonic_evm::Account> {
        let head = self.context.store.head().number;
        let number = tag.map_or(head, |tag| self.context.resolve(tag));
        if number > head {
            return Err(invalid_params(format!("block `{number}` is beyond the head `{head}`")));
        }
        if number == head {
            return Ok(self.context.state.read().account(&address));
        }
        self.context
            .state
            .read()
            .account_at(&address, number)
            .map_err(internal_error)
    }
}

impl EthApiServer for EthRpc {
    fn block_number(&self) -> RpcResult<U64> {
        Ok(U64::from(self.context.store.head().number))
    }

    fn chain_id(&self) -> RpcResult<U64> {
        Ok(U64::from(self.context.store.genesis().rules.network_id))
    }

    fn current_epoch(&self) -> RpcResult<U64> {
        Ok(U64::from(self.context.store.epoch_state().epoch))
    }

    fn block_by_number(&self, tag: BlockNumberOrTag, full: bool) -> RpcResult<Option<RpcBlock>> {
        Ok(self.block(tag)?.map(|block| RpcBlock::new(&block, full)))
    }

    fn block_by_hash(&self, hash: B256, full: bool) -> RpcResult<Option<RpcBlock>> {
        let block = self.context.store.block_by_hash(&hash).map_err(internal_error)?;
        Ok(block.map(|block| RpcBlock::new(&block, full)))
    }

    fn rules(&self, tag: BlockNumberOrTag) -> RpcResult<Option<Rules>> {
        let Some(block) = self.block(tag)? else {
            return Ok(None);
        };
        let state = self
            .context
            .store
            .epoch_state_at(block.epoch())
            .map_err(internal_error)?;
        Ok(state.map(|state| state.rules))
    }

    fn transaction_by_hash(&self, hash: B256) -> RpcResult<Option<RpcTransaction>> {
        if let Some(location) = self.context.store.tx_location(&hash).map_err(internal_error)? {
            let block = self.context.store.block(location.block).map_err(internal_error)?;
            return Ok(block.and_then(|block| {
                let index = location.index as usize;
                let tx = block.transactions().get(index)?.clone();
                Some(RpcTransaction::mined(tx, &block, index))
            }));
        }
        let pooled = self.context.ingress.pool().read().get(&hash);
        Ok(pooled.map(|tx| RpcTransaction::pending(tx.tx().clone(), tx.sender())))
    }

    fn transaction_receipt(&self, hash: B256) -> RpcResult<Option<RpcReceipt>> {
        let store = &self.context.store;
        let Some(location) = store.tx_location(&hash).map_err(internal_error)? else {
            return Ok(None);
        };
        let block = store.block(location.block).map_err(internal_error)?;
        let receipts = store.receipts(location.block).map_err(internal_error)?;
        let (Some(block), Some(receipts)) = (block, receipts) else {
            return Ok(None);
        };
        let index = location.index as usize;
        Ok(block
            .transactions()
            .get(index)
            .zip(receipts.get(index))
            .map(|(tx, receipt)| RpcReceipt::new(&block, index, tx, receipt)))
    }

    fn balance(&self, address: Address, tag: Option<BlockNumberOrTag>) -> RpcResult<U256> {
        Ok(self.account(address, tag)?.balance)
    }

    fn transaction_count(&self, address: Address, tag: Option<BlockNumberOrTag>) -> RpcResult<U64> {
        Ok(U64::from(self.account(address, tag)?.nonce))
    }

    fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<B256> {
        self.context.ingress.submit_raw(&raw, true).map_err(invalid_params)
    }
}

#[cfg(test)]
mod tests {
    use alloy_consensus::TxLegacy;
    use alloy_eips::eip2718::Encodable2718 as _;
    use alloy_primitives::TxKind;
    use sonic_chainspec::genesis::fake::fake_key;
    use sonic_primitives::sign_transaction;

    use super::*;
    use crate::rpc::testing::context;

    #[test]
    fn serves_genesis_and_pending_transactions() {
        let (context, _storage, genesis) = context();
        let rpc = EthRpc::new(context);

        assert_eq!(rpc.block_number().unwrap(), U64::ZERO);
        assert_eq!(rpc.chain_id().unwrap(), U64::from(4003));
        assert_eq!(rpc.current_epoch().unwrap(), U64::from(1));
        let block = rpc.block_by_number(BlockNumberOrTag::Latest, false).unwrap().unwrap();
        assert_eq!(rpc.block_by_hash(block.hash, true).unwrap().unwrap(), RpcBlock {
            transactions: crate::rpc::types::BlockTransactions::Full(Vec::new()),
            ..block.clone()
        });
        assert!(rpc.block_by_number(BlockNumberOrTag::Number(1), false).unwrap().is_none());
        assert_eq!(rpc.rules(BlockNumberOrTag::Earliest).unwrap().unwrap(), genesis.rules);

        let sender = fake_key(5).unwrap();
        assert!(rpc.balance(sender.address(), None).unwrap() > U256::ZERO);
        let tx = sign_transaction(
            TxLegacy {
                chain_id: Some(4003),
                nonce: 0,
                gas_price: 2_000_000_000,
                gas_limit: 21_000,
                to: TxKind::Call(Address::repeat_byte(0x42)),
                value: U256::from(1),
                input: Default::default(),
            },
            &sender,
        )
        .unwrap();
        let hash = rpc.send_raw_transaction(tx.encoded_2718().into()).unwrap();
        let pending = rpc.transaction_by_hash(hash).unwrap().unwrap();
        assert_eq!(pending.from, sender.address());
        assert!(pending.block_number.is_none());
        assert!(rpc.transaction_receipt(hash).unwrap().is_none());
        assert!(rpc.send_raw_transaction(Bytes::from_static(b"\x01")).is_err());
    }
}
