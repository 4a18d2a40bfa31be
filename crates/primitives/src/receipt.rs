use alloy_primitives::{B256, Bloom, Bytes, Log, keccak256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

/// Outcome of a single transaction as reported by the executor.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub status: bool,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub logs: Vec<Log>,
    /// Revert data, empty on success.
    pub revert_data: Bytes,
}

impl Receipt {
    pub fn bloom(&self) -> Bloom {
        let mut bloom = Bloom::ZERO;
        for log in &self.logs {
            bloom.accrue_log(log);
        }
        bloom
    }
}

/// Commitment to an ordered receipt list.
pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    let mut out = Vec::new();
    alloy_rlp::encode_list(receipts, &mut out);
    keccak256(out)
}

/// Union of the blooms of all receipts.
pub fn logs_bloom<'a>(receipts: impl IntoIterator<Item = &'a Receipt>) -> Bloom {
    let mut bloom = Bloom::ZERO;
    for receipt in receipts {
        bloom.accrue_bloom(&receipt.bloom());
    }
    bloom
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, LogData};

    use super::*;

    #[test]
    fn root_commits_to_order() {
        let a = Receipt {
            status: true,
            cumulative_gas_used: 21_000,
            gas_used: 21_000,
            ..Default::default()
        };
        let b = Receipt {
            status: false,
            cumulative_gas_used: 42_000,
            gas_used: 21_000,
            ..Default::default()
        };
        assert_ne!(
            receipts_root(&[a.clone(), b.clone()]),
            receipts_root(&[b, a])
        );
    }

    #[test]
    fn bloom_contains_log_address() {
        let log = Log {
            address: Address::repeat_byte(9),
            data: LogData::new_unchecked(vec![B256::repeat_byte(1)], Bytes::new()),
        };
        let receipt = Receipt {
            logs: vec![log],
            ..Default::default()
        };
        let bloom = logs_bloom([&receipt]);
        assert!(bloom.contains_input(alloy_primitives::BloomInput::Raw(
            Address::repeat_byte(9).as_slice()
        )));
    }
}
