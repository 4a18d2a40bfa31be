//! Blocks as committed by the block former.
//!
//! Blocks use an Ethereum header. The header `timestamp` holds whole seconds; the
//! sub-second part, the proposing validator and the epoch travel in a fixed
//! 12 byte extra-data blob (big endian). `mix_hash` carries prev-randao.

use alloy_consensus::{Header, TxEnvelope, proofs::calculate_transaction_root};
use alloy_eips::eip7685::EMPTY_REQUESTS_HASH;
use alloy_primitives::{Address, B64, B256, Bloom, Bytes, U256, b256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use bytes::BufMut;

use crate::{Epoch, Timestamp, ValidatorId, codec::DecodeError};

pub type BlockNumber = u64;

/// keccak256 of the RLP encoding of an empty list.
pub const EMPTY_OMMER_ROOT_HASH: B256 =
    b256!("0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// Root of an empty Merkle-Patricia trie.
pub const EMPTY_ROOT_HASH: B256 =
    b256!("0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Protocol metadata carried in the header extra-data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtraData {
    pub subsec_nanos: u32,
    pub proposer: ValidatorId,
    pub epoch: Epoch,
}

impl ExtraData {
    pub const LEN: usize = 12;

    pub fn to_bytes(self) -> Bytes {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u32(self.subsec_nanos);
        out.put_u32(self.proposer);
        out.put_u32(self.epoch);
        out.into()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let bytes: &[u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| DecodeError::Invalid("extra-data length"))?;
        let word = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let extra = Self {
            subsec_nanos: word(0),
            proposer: word(4),
            epoch: word(8),
        };
        if extra.subsec_nanos >= 1_000_000_000 {
            return Err(DecodeError::Invalid("sub-second nanos"));
        }
        Ok(extra)
    }
}

/// Header values decided by the block former before the header is sealed.
#[derive(Clone, Debug)]
pub struct BlockFields {
    pub number: BlockNumber,
    pub parent_hash: B256,
    pub timestamp: Timestamp,
    pub prev_randao: B256,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee: u64,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub proposer: ValidatorId,
    pub epoch: Epoch,
}

#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
struct BlockRlp {
    header: Header,
    transactions: Vec<TxEnvelope>,
}

/// A committed block. The hash is computed once on construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    header: Header,
    transactions: Vec<TxEnvelope>,
    extra: ExtraData,
    hash: B256,
}

impl Block {
    /// Seals `fields` and `transactions` into a block.
    pub fn assemble(fields: BlockFields, transactions: Vec<TxEnvelope>) -> Self {
        let extra = ExtraData {
            subsec_nanos: fields.timestamp.subsec_nanos(),
            proposer: fields.proposer,
            epoch: fields.epoch,
        };
        let header = Header {
            parent_hash: fields.parent_hash,
            ommers_hash: EMPTY_OMMER_ROOT_HASH,
            beneficiary: Address::ZERO,
            state_root: fields.state_root,
            transactions_root: calculate_transaction_root(&transactions),
            receipts_root: fields.receipts_root,
            logs_bloom: fields.logs_bloom,
            difficulty: U256::ZERO,
            number: fields.number,
            gas_limit: fields.gas_limit,
            gas_used: fields.gas_used,
            timestamp: fields.timestamp.unix_secs(),
            extra_data: extra.to_bytes(),
            mix_hash: fields.prev_randao,
            nonce: B64::ZERO,
            base_fee_per_gas: Some(fields.base_fee),
            withdrawals_root: Some(EMPTY_ROOT_HASH),
            blob_gas_used: Some(0),
            excess_blob_gas: Some(0),
            parent_beacon_block_root: Some(B256::ZERO),
            requests_hash: Some(EMPTY_REQUESTS_HASH),
        };
        let hash = header.hash_slow();
        Self {
            header,
            transactions,
            extra,
            hash,
        }
    }

    pub const fn hash(&self) -> B256 {
        self.hash
    }

    pub const fn header(&self) -> &Header {
        &self.header
    }

    pub fn transactions(&self) -> &[TxEnvelope] {
        &self.transactions
    }

    pub const fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub const fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub const fn state_root(&self) -> B256 {
        self.header.state_root
    }

    pub const fn prev_randao(&self) -> B256 {
        self.header.mix_hash
    }

    pub const fn gas_used(&self) -> u64 {
        self.header.gas_used
    }

    pub const fn gas_limit(&self) -> u64 {
        self.header.gas_limit
    }

    pub fn base_fee(&self) -> u64 {
        self.header.base_fee_per_gas.unwrap_or_default()
    }

    pub const fn epoch(&self) -> Epoch {
        self.extra.epoch
    }

    pub const fn proposer(&self) -> ValidatorId {
        self.extra.proposer
    }

    /// Full nanosecond timestamp reassembled from header seconds and extra-data.
    pub const fn timestamp(&self) -> Timestamp {
        Timestamp::from_parts(self.header.timestamp, self.extra.subsec_nanos)
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut dyn BufMut) {
        BlockRlp {
            header: self.header.clone(),
            transactions: self.transactions.clone(),
        }
        .encode(out)
    }

    fn length(&self) -> usize {
        let payload = self.header.length() + self.transactions.length();
        payload + alloy_rlp::length_of_length(payload)
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let BlockRlp {
            header,
            transactions,
        } = BlockRlp::decode(buf)?;
        let extra = ExtraData::from_bytes(&header.extra_data)
            .map_err(|_| alloy_rlp::Error::Custom("malformed block extra-data"))?;
        let hash = header.hash_slow();
        Ok(Self {
            header,
            transactions,
            extra,
            hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(number: BlockNumber) -> BlockFields {
        BlockFields {
            number,
            parent_hash: B256::repeat_byte(1),
            timestamp: Timestamp::from_nanos(1_700_000_004_250_000_000),
            prev_randao: B256::repeat_byte(2),
            gas_limit: 1_000_000_000,
            gas_used: 0,
            base_fee: 50_000_000_000,
            state_root: B256::repeat_byte(3),
            receipts_root: EMPTY_ROOT_HASH,
            logs_bloom: Bloom::ZERO,
            proposer: 4,
            epoch: 7,
        }
    }

    #[test]
    fn extra_data_is_big_endian() {
        let extra = ExtraData {
            subsec_nanos: 250_000_000,
            proposer: 4,
            epoch: 7,
        };
        assert_eq!(
            extra.to_bytes().as_ref(),
            &[0x0e, 0xe6, 0xb2, 0x80, 0, 0, 0, 4, 0, 0, 0, 7]
        );
        assert_eq!(ExtraData::from_bytes(&extra.to_bytes()).unwrap(), extra);
        assert!(ExtraData::from_bytes(&[0; 11]).is_err());
    }

    #[test]
    fn block_keeps_nanosecond_time_and_roundtrips() {
        let block = Block::assemble(fields(5), vec![]);
        assert_eq!(block.timestamp().as_nanos(), 1_700_000_004_250_000_000);
        assert_eq!(block.header().timestamp, 1_700_000_004);
        assert_eq!(block.epoch(), 7);
        assert_eq!(block.proposer(), 4);
        assert_eq!(block.header().requests_hash, Some(EMPTY_REQUESTS_HASH));
        assert_eq!(block.prev_randao(), B256::repeat_byte(2));

        let encoded = alloy_rlp::encode(&block);
        assert_eq!(encoded.len(), block.length());
        let decoded = Block::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn hash_depends_on_subsecond_time() {
        let a = Block::assemble(fields(5), vec![]);
        let mut other = fields(5);
        other.timestamp = Timestamp::from_nanos(1_700_000_004_250_000_001);
        assert_ne!(a.hash(), Block::assemble(other, vec![]).hash());
    }
}
