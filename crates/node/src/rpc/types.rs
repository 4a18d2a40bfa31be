//! JSON shapes returned by the RPC namespaces.

use alloy_consensus::{Transaction as _, TxEnvelope};
use alloy_primitives::{Address, B64, B256, Bloom, Bytes, Log, U64, U256};
use serde::{Deserialize, Deserializer, Serialize, de};
use sonic_primitives::{Block, BlockNumber, Encode as _, Event, Receipt};

/// Upper end of a range: a block or epoch number, or `"max"` for the latest
/// one available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumberOrMax {
    Number(u64),
    Max,
}

impl NumberOrMax {
    pub fn resolve(self, max: u64) -> u64 {
        match self {
            Self::Number(number) => number.min(max),
            Self::Max => max,
        }
    }
}

impl<'de> Deserialize<'de> for NumberOrMax {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(number) => Ok(Self::Number(number)),
            Raw::Text(text) if text == "max" => Ok(Self::Max),
            Raw::Text(text) => {
                let digits = text
                    .strip_prefix("0x")
                    .ok_or_else(|| de::Error::custom(format!("expected hex number or \"max\", got `{text}`")))?;
                u64::from_str_radix(digits, 16)
                    .map(Self::Number)
                    .map_err(de::Error::custom)
            }
        }
    }
}

impl Serialize for NumberOrMax {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(number) => U64::from(*number).serialize(serializer),
            Self::Max => serializer.serialize_str("max"),
        }
    }
}

/// Either transaction hashes or full transactions of a block.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    Hashes(Vec<B256>),
    Full(Vec<RpcTransaction>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: U64,
    /// Nanoseconds of the block time below `timestamp`.
    pub timestamp_nano: U64,
    pub mix_hash: B256,
    pub state_root: B256,
    pub receipts_root: B256,
    pub transactions_root: B256,
    pub logs_bloom: Bloom,
    pub gas_limit: U64,
    pub gas_used: U64,
    pub base_fee_per_gas: U64,
    pub miner: Address,
    pub difficulty: U256,
    pub nonce: B64,
    pub extra_data: Bytes,
    pub size: U64,
    pub epoch: U64,
    pub proposer: U64,
    pub transactions: BlockTransactions,
}

impl RpcBlock {
    pub fn new(block: &Block, full: bool) -> Self {
        let header = block.header();
        let transactions = if full {
            BlockTransactions::Full(
                block
                    .transactions()
                    .iter()
                    .enumerate()
                    .map(|(index, tx)| RpcTransaction::mined(tx.clone(), block, index))
                    .collect(),
            )
        } else {
            BlockTransactions::Hashes(block.transactions().iter().map(|tx| *tx.tx_hash()).collect())
        };
        Self {
            number: U64::from(block.number()),
            hash: block.hash(),
            parent_hash: block.parent_hash(),
            timestamp: U64::from(block.timestamp().unix_secs()),
            timestamp_nano: U64::from(block.timestamp().as_nanos()),
            mix_hash: block.prev_randao(),
            state_root: block.state_root(),
            receipts_root: header.receipts_root,
            transactions_root: header.transactions_root,
            logs_bloom: header.logs_bloom,
            gas_limit: U64::from(block.gas_limit()),
            gas_used: U64::from(block.gas_used()),
            base_fee_per_gas: U64::from(block.base_fee()),
            miner: header.beneficiary,
            difficulty: header.difficulty,
            nonce: header.nonce,
            extra_data: header.extra_data.clone(),
            size: U64::from(alloy_rlp::Encodable::length(block)),
            epoch: U64::from(block.epoch()),
            proposer: U64::from(block.proposer()),
            transactions,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    #[serde(flatten)]
    pub inner: TxEnvelope,
    pub from: Address,
    pub block_hash: Option<B256>,
    pub block_number: Option<U64>,
    pub transaction_index: Option<U64>,
}

impl RpcTransaction {
    pub fn mined(tx: TxEnvelope, block: &Block, index: usize) -> Self {
        let from = sonic_primitives::RecoveredTx::recover(tx.clone())
            .map(|tx| tx.sender())
            .unwrap_or_default();
        Self {
            inner: tx,
            from,
            block_hash: Some(block.hash()),
            block_number: Some(U64::from(block.number())),
            transaction_index: Some(U64::from(index)),
        }
    }

    pub fn pending(tx: TxEnvelope, from: Address) -> Self {
        Self {
            inner: tx,
            from,
            block_hash: None,
            block_number: None,
            transaction_index: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    pub transaction_index: U64,
    pub block_hash: B256,
    pub block_number: U64,
    pub from: Address,
    pub to: Option<Address>,
    pub gas_used: U64,
    pub cumulative_gas_used: U64,
    pub effective_gas_price: U256,
    pub status: U64,
    pub logs: Vec<Log>,
    pub logs_bloom: Bloom,
    #[serde(rename = "type")]
    pub tx_type: U64,
    #[serde(skip_serializing_if = "bytes::Bytes::is_empty")]
    pub revert_data: Bytes,
}

impl RpcReceipt {
    pub fn new(block: &Block, index: usize, tx: &TxEnvelope, receipt: &Receipt) -> Self {
        let from = sonic_primitives::RecoveredTx::recover(tx.clone())
            .map(|tx| tx.sender())
            .unwrap_or_default();
        Self {
            transaction_hash: *tx.tx_hash(),
            transaction_index: U64::from(index),
            block_hash: block.hash(),
            block_number: U64::from(block.number()),
            from,
            to: tx.to(),
            gas_used: U64::from(receipt.gas_used),
            cumulative_gas_used: U64::from(receipt.cumulative_gas_used),
            effective_gas_price: U256::from(receipt.effective_gas_price),
            status: U64::from(u8::from(receipt.status)),
            logs: receipt.logs.clone(),
            logs_bloom: receipt.bloom(),
            tx_type: U64::from(tx.tx_type() as u8),
            revert_data: receipt.revert_data.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcProposal {
    pub number: U64,
    pub parent_hash: B256,
    pub timestamp: U64,
    pub prev_randao: B256,
    pub turn: U64,
    pub transactions: Vec<B256>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEvent {
    pub id: B256,
    pub version: u8,
    pub epoch: U64,
    pub lamport: U64,
    pub creator: U64,
    pub seq: U64,
    pub creation_time: U64,
    pub parents: Vec<B256>,
    pub gas_power_used: U64,
    pub transactions: Vec<B256>,
    pub proposal: Option<RpcProposal>,
    /// The event in wire encoding.
    pub raw: Bytes,
}

impl From<&Event> for RpcEvent {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id(),
            version: event.version() as u8,
            epoch: U64::from(event.epoch),
            lamport: U64::from(event.lamport),
            creator: U64::from(event.creator),
            seq: U64::from(event.seq),
            creation_time: U64::from(event.creation_time.as_nanos()),
            parents: event.parents.clone(),
            gas_power_used: U64::from(event.gas_power_used),
            transactions: event.payload.transactions().iter().map(|tx| *tx.tx_hash()).collect(),
            proposal: event.payload.proposal().map(|proposal| RpcProposal {
                number: U64::from(proposal.number),
                parent_hash: proposal.parent_hash,
                timestamp: U64::from(proposal.timestamp.as_nanos()),
                prev_randao: proposal.prev_randao,
                turn: U64::from(proposal.turn),
                transactions: proposal.transactions.iter().map(|tx| *tx.tx_hash()).collect(),
            }),
            raw: Bytes::from(event.encode()),
        }
    }
}

/// Block numbers of a certificate range, capped at `limit` entries.
pub fn capped_range(from: BlockNumber, to: BlockNumber, limit: u64) -> std::ops::RangeInclusive<BlockNumber> {
    from..=to.min(from.saturating_add(limit.saturating_sub(1)))
}
