use std::sync::Arc;

use alloy_consensus::{Transaction, TxEnvelope};
use alloy_primitives::{Address, B256, Bytes, Log, TxKind, U256};
use parking_lot::RwLock;
use sonic_chainspec::constants::{DRIVER_AUTH_ADDRESS, MODEXP_ADDRESS, P256_VERIFY_ADDRESS};
use sonic_primitives::{BlockNumber, Receipt, RecoveredTx, check_chain_id, logs_bloom};
use tracing::{debug, instrument, trace};

use crate::{
    Account, BlockContext, ExecutionError, ExecutionOutcome, Executor, GovernanceAction,
    SkipReason, SkippedTx, StateDb, StateDiff,
    driver::{self, DRIVER_CALL_GAS},
    gas,
};

/// Executes value transfers, driver calls and precompile calls over a
/// [`StateDb`].
///
/// Priority fees go to the block coinbase, the base fee is burnt. Contract
/// creation always fails and consumes the whole gas limit.
#[derive(Clone, Debug)]
pub struct TransferExecutor {
    state: Arc<RwLock<StateDb>>,
    driver_owner: Address,
}

impl TransferExecutor {
    pub fn new(state: Arc<RwLock<StateDb>>, driver_owner: Address) -> Self {
        Self {
            state,
            driver_owner,
        }
    }

    pub fn state(&self) -> &Arc<RwLock<StateDb>> {
        &self.state
    }
}

impl Executor for TransferExecutor {
    #[instrument(skip_all, fields(number = ctx.number, txs = transactions.len()), err)]
    fn execute(
        &self,
        parent_state_root: B256,
        ctx: &BlockContext,
        transactions: Vec<TxEnvelope>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut state = self.state.write();
        if state.root() != parent_state_root {
            return Err(ExecutionError::StateRootMismatch {
                expected: parent_state_root,
                actual: state.root(),
            });
        }
        if state.block().map(|head| head + 1) != Some(ctx.number) {
            return Err(ExecutionError::NonContiguous {
                number: ctx.number,
                head: state.block(),
            });
        }

        let mut block = BlockExecution {
            ctx,
            state: &state,
            driver_owner: self.driver_owner,
            diff: StateDiff::new(),
            outcome: ExecutionOutcome::default(),
        };
        for tx in transactions {
            block.apply(tx);
        }
        let BlockExecution {
            diff, mut outcome, ..
        } = block;

        outcome.state_root = state.commit(ctx.number, &diff)?;
        outcome.logs_bloom = logs_bloom(&outcome.receipts);
        debug!(
            gas_used = outcome.gas_used,
            executed = outcome.transactions.len(),
            skipped = outcome.skipped.len(),
            state_root = %outcome.state_root,
            "executed block"
        );
        Ok(outcome)
    }

    fn state_root(&self) -> B256 {
        self.state.read().root()
    }

    fn head(&self) -> Option<BlockNumber> {
        self.state.read().block()
    }

    fn revert_to(&self, number: BlockNumber) -> Result<B256, ExecutionError> {
        Ok(self.state.write().rollback(number)?)
    }
}

/// Result of running the call part of a transaction.
struct CallResult {
    /// Gas used including the intrinsic cost.
    used: u64,
    success: bool,
    revert: Bytes,
    logs: Vec<Log>,
    action: Option<GovernanceAction>,
}

impl CallResult {
    fn success(used: u64) -> Self {
        Self {
            used,
            success: true,
            revert: Bytes::new(),
            logs: Vec::new(),
            action: None,
        }
    }

    fn failure(used: u64, revert: Bytes) -> Self {
        Self {
            used,
            success: false,
            revert,
            logs: Vec::new(),
            action: None,
        }
    }

    /// Fails with all gas consumed when `used` exceeds `gas_limit`.
    fn within(self, gas_limit: u64) -> Self {
        if self.used > gas_limit {
            Self::failure(gas_limit, Bytes::from_static(b"out of gas"))
        } else {
            self
        }
    }
}

struct BlockExecution<'a> {
    ctx: &'a BlockContext,
    state: &'a StateDb,
    driver_owner: Address,
    diff: StateDiff,
    outcome: ExecutionOutcome,
}

impl BlockExecution<'_> {
    fn account(&self, address: &Address) -> Account {
        self.diff
            .get(address)
            .copied()
            .unwrap_or_else(|| self.state.account(address))
    }

    fn skip(&mut self, hash: B256, reason: SkipReason) {
        trace!(%hash, %reason, "skipped transaction");
        self.outcome.skipped.push(SkippedTx { hash, reason });
    }

    fn apply(&mut self, tx: TxEnvelope) {
        let hash = *tx.tx_hash();
        if tx.is_eip4844() {
            return self.skip(hash, SkipReason::Unsupported);
        }
        let Ok(tx) = RecoveredTx::recover(tx) else {
            return self.skip(hash, SkipReason::BadSignature);
        };
        if check_chain_id(tx.tx(), self.ctx.chain_id, true).is_err() {
            return self.skip(hash, SkipReason::WrongChainId);
        }
        let gas_limit = tx.gas_limit();
        if self.outcome.gas_used.saturating_add(gas_limit) > self.ctx.gas_limit {
            return self.skip(hash, SkipReason::BlockGasLimit);
        }
        let max_fee = tx.tx().max_fee_per_gas();
        if max_fee < u128::from(self.ctx.base_fee) {
            return self.skip(hash, SkipReason::FeeTooLow);
        }

        let sender_address = tx.sender();
        let mut sender = self.account(&sender_address);
        if tx.nonce() < sender.nonce {
            return self.skip(hash, SkipReason::NonceTooLow);
        }
        if tx.nonce() > sender.nonce {
            return self.skip(hash, SkipReason::NonceTooHigh);
        }
        let upgrades = self.ctx.upgrades;
        let intrinsic = gas::intrinsic_gas(tx.tx());
        let floor = if upgrades.allegro {
            gas::floor_data_gas(tx.tx().input())
        } else {
            0
        };
        if gas_limit < intrinsic.max(floor) {
            return self.skip(hash, SkipReason::IntrinsicGasTooLow);
        }
        let value = tx.tx().value();
        let max_cost = U256::from(gas_limit) * U256::from(max_fee) + value;
        if sender.balance < max_cost {
            return self.skip(hash, SkipReason::InsufficientFunds);
        }

        let call = self.call(&tx, intrinsic).within(gas_limit);
        let charged = gas::charged_gas(&upgrades, gas_limit, call.used, floor);
        let price = tx.effective_gas_price(self.ctx.base_fee);

        sender.balance -= U256::from(charged) * U256::from(price);
        sender.nonce += 1;
        if call.success {
            sender.balance -= value;
        }
        self.diff.insert(sender_address, sender);

        if call.success
            && let TxKind::Call(to) = tx.tx().kind()
        {
            let mut recipient = self.account(&to);
            recipient.balance += value;
            self.diff.insert(to, recipient);
        }
        let tip = tx.effective_tip(self.ctx.base_fee);
        if self.ctx.coinbase != Address::ZERO && tip > 0 {
            let mut coinbase = self.account(&self.ctx.coinbase);
            coinbase.balance += U256::from(charged) * U256::from(tip);
            self.diff.insert(self.ctx.coinbase, coinbase);
        }

        self.outcome.gas_used += charged;
        if let Some(action) = call.action {
            self.outcome.governance.push(action);
        }
        self.outcome.receipts.push(Receipt {
            status: call.success,
            cumulative_gas_used: self.outcome.gas_used,
            gas_used: charged,
            effective_gas_price: price,
            logs: call.logs,
            revert_data: call.revert,
        });
        self.outcome.transactions.push(tx.into_tx());
    }

    fn call(&self, tx: &RecoveredTx, intrinsic: u64) -> CallResult {
        let upgrades = &self.ctx.upgrades;
        let TxKind::Call(to) = tx.tx().kind() else {
            return CallResult::failure(
                tx.gas_limit(),
                Bytes::from_static(b"contract creation is not supported"),
            );
        };
        if to == DRIVER_AUTH_ADDRESS {
            return self.driver_call(tx, intrinsic);
        }
        if to == MODEXP_ADDRESS {
            return match gas::modexp_gas(upgrades, tx.tx().input()) {
                Ok(cost) => CallResult::success(intrinsic.saturating_add(cost)),
                Err(err) => CallResult::failure(tx.gas_limit(), err.to_string().into_bytes().into()),
            };
        }
        if to == P256_VERIFY_ADDRESS && upgrades.brio {
            return CallResult::success(intrinsic + gas::P256_VERIFY_GAS);
        }
        CallResult::success(intrinsic)
    }

    fn driver_call(&self, tx: &RecoveredTx, intrinsic: u64) -> CallResult {
        let used = intrinsic + DRIVER_CALL_GAS;
        if tx.sender() != self.driver_owner {
            return CallResult::failure(used, driver::DriverError::NotOwner.revert_data());
        }
        match driver::decode_call(tx.tx().input(), &self.ctx.rules) {
            Ok(call) => CallResult {
                used: intrinsic + call.gas,
                success: true,
                revert: Bytes::new(),
                logs: vec![call.log],
                action: Some(call.action),
            },
            Err(err) => {
                debug!(hash = %tx.hash(), %err, "driver call reverted");
                CallResult::failure(used, err.revert_data())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_consensus::{TxEip1559, TxLegacy};
    use alloy_sol_types::SolCall;
    use alloy_signer_local::PrivateKeySigner;
    use sonic_chainspec::{Rules, Upgrades, genesis::fake::fake_key};
    use sonic_kvdb::MemoryProducer;
    use sonic_primitives::{Timestamp, sign_transaction};

    use super::*;
    use crate::driver::INodeDriver;

    const CHAIN_ID: u64 = 4003;
    const GWEI: u128 = 1_000_000_000;

    fn rules(upgrades: Upgrades) -> Arc<Rules> {
        Arc::new(Rules::fakenet(CHAIN_ID, upgrades))
    }

    fn key(n: u32) -> PrivateKeySigner {
        fake_key(n).unwrap()
    }

    fn ether(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18))
    }

    /// Executor whose genesis funds keys 1..=3 with 100 ether; key 1 owns the driver.
    fn executor() -> TransferExecutor {
        let mut state =
            StateDb::open(Arc::new(MemoryProducer::new()), Arc::new(MemoryProducer::new())).unwrap();
        let diff = (1..=3)
            .map(|n| (key(n).address(), Account::with_balance(ether(100))))
            .collect();
        state.commit(0, &diff).unwrap();
        TransferExecutor::new(Arc::new(RwLock::new(state)), key(1).address())
    }

    fn ctx(number: u64, upgrades: Upgrades) -> BlockContext {
        BlockContext::new(
            number,
            Timestamp::from_secs(1_700_000_000 + number),
            B256::repeat_byte(number as u8),
            rules(upgrades),
        )
    }

    fn legacy(from: u32, nonce: u64, to: Address, value: U256, gas_limit: u64, input: Vec<u8>) -> TxEnvelope {
        let tx = TxLegacy {
            chain_id: Some(CHAIN_ID),
            nonce,
            gas_price: 2 * GWEI,
            gas_limit,
            to: TxKind::Call(to),
            value,
            input: input.into(),
        };
        sign_transaction(tx, &key(from)).unwrap()
    }

    fn transfer(from: u32, nonce: u64, to: Address, value: U256) -> TxEnvelope {
        legacy(from, nonce, to, value, 21_000, Vec::new())
    }

    fn run(executor: &TransferExecutor, number: u64, upgrades: Upgrades, txs: Vec<TxEnvelope>) -> ExecutionOutcome {
        executor
            .execute(executor.state_root(), &ctx(number, upgrades), txs)
            .unwrap()
    }

    #[test]
    fn transfers_move_value_and_burn_fees() {
        let executor = executor();
        let to = Address::repeat_byte(0x77);
        let outcome = run(
            &executor,
            1,
            Upgrades::sonic(),
            vec![transfer(2, 0, to, ether(1)), transfer(2, 1, to, ether(2))],
        );
        assert_eq!(outcome.receipts.len(), 2);
        assert!(outcome.receipts.iter().all(|r| r.status && r.gas_used == 21_000));
        assert_eq!(outcome.receipts[1].cumulative_gas_used, 42_000);
        assert_eq!(outcome.gas_used, 42_000);
        assert_eq!(outcome.receipts[0].effective_gas_price, 2 * GWEI);

        let state = executor.state().read();
        assert_eq!(state.account(&to).balance, ether(3));
        let sender = state.account(&key(2).address());
        assert_eq!(sender.nonce, 2);
        assert_eq!(
            sender.balance,
            ether(97) - U256::from(42_000u64) * U256::from(2 * GWEI)
        );
        assert_eq!(state.block(), Some(1));
        assert_eq!(state.root(), outcome.state_root);
    }

    #[test]
    fn unexecutable_transactions_are_skipped() {
        let executor = executor();
        let to = Address::repeat_byte(0x77);
        let poor = legacy(4, 0, to, U256::ZERO, 21_000, Vec::new());
        let short = legacy(2, 0, to, U256::ZERO, 20_000, Vec::new());
        let ahead = transfer(3, 5, to, U256::from(1));
        let ok = transfer(3, 0, to, U256::from(1));
        let replay = transfer(3, 0, to, U256::from(1));
        let hashes = [&poor, &short, &ahead, &replay].map(|tx| *tx.tx_hash());

        let outcome = run(&executor, 1, Upgrades::sonic(), vec![poor, short, ahead, ok, replay]);
        assert_eq!(outcome.transactions.len(), 1);
        assert_eq!(
            outcome.skipped,
            vec![
                SkippedTx { hash: hashes[0], reason: SkipReason::InsufficientFunds },
                SkippedTx { hash: hashes[1], reason: SkipReason::IntrinsicGasTooLow },
                SkippedTx { hash: hashes[2], reason: SkipReason::NonceTooHigh },
                SkippedTx { hash: hashes[3], reason: SkipReason::NonceTooLow },
            ]
        );
    }

    #[test]
    fn block_gas_limit_is_respected() {
        let executor = executor();
        let mut ctx = ctx(1, Upgrades::sonic());
        ctx.gas_limit = 50_000;
        let to = Address::repeat_byte(0x77);
        let txs = (0..3).map(|nonce| transfer(2, nonce, to, U256::from(1))).collect();
        let outcome = executor.execute(executor.state_root(), &ctx, txs).unwrap();
        assert_eq!(outcome.transactions.len(), 2);
        assert_eq!(outcome.skipped[0].reason, SkipReason::BlockGasLimit);
    }

    #[test]
    fn floor_data_cost_applies_from_allegro() {
        let mut data = vec![0xff; 40_000];
        data[0] = 0;
        let to = Address::repeat_byte(0x77);
        let floor = gas::floor_data_gas(&data);

        let executor = executor();
        let allegro = run(
            &executor,
            1,
            Upgrades::allegro(),
            vec![legacy(2, 0, to, U256::ZERO, 2_000_000, data.clone())],
        );
        let sonic = run(
            &executor,
            2,
            Upgrades::sonic(),
            vec![legacy(2, 1, to, U256::ZERO, 2_000_000, data)],
        );
        assert!(allegro.receipts[0].gas_used >= floor);
        assert_eq!(allegro.receipts[0].gas_used, 1_658_873);
        assert_eq!(sonic.receipts[0].gas_used, 794_889);
        assert!(sonic.receipts[0].gas_used < allegro.receipts[0].gas_used);
    }

    #[test]
    fn p256_precompile_is_priced_from_brio() {
        let call = |executor: &TransferExecutor, number, upgrades, nonce| {
            let tx = legacy(2, nonce, P256_VERIFY_ADDRESS, U256::ZERO, 100_000, vec![1; 160]);
            run(executor, number, upgrades, vec![tx]).receipts[0].gas_used
        };
        let executor = executor();
        let intrinsic = 21_000 + 160 * 16;
        let unused = |used: u64| used + (100_000 - used) / 10;
        assert_eq!(call(&executor, 1, Upgrades::sonic(), 0), unused(intrinsic));
        assert_eq!(call(&executor, 2, Upgrades::brio(), 1), unused(intrinsic + 6_900));
    }

    #[test]
    fn modexp_over_the_cap_fails_from_brio() {
        let mut input = Vec::new();
        for len in [2_000u64, 1, 1] {
            input.extend_from_slice(&U256::from(len).to_be_bytes::<32>());
        }
        let executor = executor();
        let tx = legacy(2, 0, MODEXP_ADDRESS, U256::ZERO, 200_000, input.clone());
        let before = run(&executor, 1, Upgrades::allegro(), vec![tx]);
        assert!(before.receipts[0].status);

        let tx = legacy(2, 1, MODEXP_ADDRESS, U256::ZERO, 200_000, input);
        let after = run(&executor, 2, Upgrades::brio(), vec![tx]);
        assert!(!after.receipts[0].status);
        assert_eq!(after.receipts[0].gas_used, 200_000);
    }

    #[test]
    fn creation_fails_but_charges() {
        let executor = executor();
        let tx = TxEip1559 {
            chain_id: CHAIN_ID,
            nonce: 0,
            gas_limit: 100_000,
            max_fee_per_gas: 2 * GWEI,
            max_priority_fee_per_gas: GWEI,
            to: TxKind::Create,
            input: vec![0x60, 0x00].into(),
            ..Default::default()
        };
        let tx = sign_transaction(tx, &key(2)).unwrap();
        let outcome = run(&executor, 1, Upgrades::sonic(), vec![tx]);
        assert!(!outcome.receipts[0].status);
        assert_eq!(outcome.receipts[0].gas_used, 100_000);
        assert_eq!(executor.state().read().account(&key(2).address()).nonce, 1);
    }

    #[test]
    fn driver_calls_need_the_owner() {
        let input = INodeDriver::advanceEpochsCall { num: U256::from(1) }.abi_encode();
        let executor = executor();
        let outcome = run(
            &executor,
            1,
            Upgrades::sonic(),
            vec![
                legacy(2, 0, DRIVER_AUTH_ADDRESS, U256::ZERO, 100_000, input.clone()),
                legacy(1, 0, DRIVER_AUTH_ADDRESS, U256::ZERO, 100_000, input),
            ],
        );
        assert!(!outcome.receipts[0].status);
        assert_eq!(
            outcome.receipts[0].revert_data,
            Bytes::from_static(b"caller is not the driver owner")
        );
        assert!(outcome.receipts[1].status);
        assert_eq!(outcome.receipts[1].logs.len(), 1);
        assert_eq!(outcome.governance, vec![GovernanceAction::AdvanceEpochs(1)]);
        assert_ne!(outcome.logs_bloom, alloy_primitives::Bloom::default());
    }

    #[test]
    fn rejects_foreign_parent_state() {
        let executor = executor();
        let err = executor
            .execute(B256::repeat_byte(9), &ctx(1, Upgrades::sonic()), Vec::new())
            .unwrap_err();
        assert!(matches!(err, ExecutionError::StateRootMismatch { .. }));

        let err = executor
            .execute(executor.state_root(), &ctx(3, Upgrades::sonic()), Vec::new())
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NonContiguous { number: 3, head: Some(0) }));
    }

    #[test]
    fn revert_restores_the_parent_state() {
        let executor = executor();
        let genesis_root = executor.state_root();
        let to = Address::repeat_byte(0x42);
        run(&executor, 1, Upgrades::sonic(), vec![transfer(2, 0, to, ether(1))]);
        assert_eq!(executor.head(), Some(1));

        assert_eq!(executor.revert_to(0).unwrap(), genesis_root);
        assert_eq!(executor.head(), Some(0));
        assert_eq!(executor.state().read().account(&to), Account::default());
    }
}
