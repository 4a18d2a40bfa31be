//! Gas accounting that changes with protocol upgrades.
//!
//! Every transaction is charged its used gas plus 10% of the gas it reserved
//! but did not use. From Allegro the used gas is first raised to the EIP-7623
//! floor data cost. Brio reprices the modexp precompile (EIP-7883), caps its
//! operand lengths (EIP-7823) and activates P-256 verification.

use alloy_consensus::{Transaction, TxEnvelope};
use alloy_eips::eip2930::AccessList;
use alloy_primitives::U256;
use sonic_chainspec::Upgrades;

pub const TX_BASE_GAS: u64 = 21_000;
pub const TX_CREATE_GAS: u64 = 32_000;
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;
pub const INIT_CODE_WORD_GAS: u64 = 2;
pub const ACCESS_LIST_ADDRESS_GAS: u64 = 2_400;
pub const ACCESS_LIST_STORAGE_KEY_GAS: u64 = 1_900;
pub const AUTHORIZATION_GAS: u64 = 25_000;

/// Gas per calldata token under EIP-7623.
pub const FLOOR_GAS_PER_TOKEN: u64 = 10;

/// Fixed cost of the P-256 verification precompile.
pub const P256_VERIFY_GAS: u64 = 6_900;

/// Largest modexp operand accepted from Brio.
pub const MODEXP_MAX_INPUT_LEN: u64 = 1_024;

/// Share of unused gas that is charged anyway.
const UNUSED_GAS_CHARGE_DIVISOR: u64 = 10;

/// Calldata bytes split into zero and non-zero counts.
fn data_bytes(data: &[u8]) -> (u64, u64) {
    let zeros = data.iter().filter(|b| **b == 0).count() as u64;
    (zeros, data.len() as u64 - zeros)
}

/// Gas charged before a transaction executes a single instruction.
pub fn intrinsic_gas(tx: &TxEnvelope) -> u64 {
    let (zeros, non_zeros) = data_bytes(tx.input());
    let mut gas = TX_BASE_GAS + zeros * TX_DATA_ZERO_GAS + non_zeros * TX_DATA_NON_ZERO_GAS;
    if tx.is_create() {
        gas += TX_CREATE_GAS + INIT_CODE_WORD_GAS * tx.input().len().div_ceil(32) as u64;
    }
    gas += tx.access_list().map_or(0, access_list_gas);
    gas += tx
        .authorization_list()
        .map_or(0, |list| list.len() as u64 * AUTHORIZATION_GAS);
    gas
}

fn access_list_gas(list: &AccessList) -> u64 {
    list.iter()
        .map(|item| {
            ACCESS_LIST_ADDRESS_GAS + item.storage_keys.len() as u64 * ACCESS_LIST_STORAGE_KEY_GAS
        })
        .sum()
}

/// EIP-7623 floor: `21000 + 10 * (zero_bytes + 4 * non_zero_bytes)`.
pub fn floor_data_gas(data: &[u8]) -> u64 {
    let (zeros, non_zeros) = data_bytes(data);
    TX_BASE_GAS + FLOOR_GAS_PER_TOKEN * (zeros + 4 * non_zeros)
}

/// Smallest gas limit a transaction must carry under `upgrades`.
pub fn minimum_gas(upgrades: &Upgrades, tx: &TxEnvelope) -> u64 {
    let intrinsic = intrinsic_gas(tx);
    if upgrades.allegro {
        intrinsic.max(floor_data_gas(tx.input()))
    } else {
        intrinsic
    }
}

/// Gas finally charged for a transaction with limit `gas_limit` that used
/// `used` gas (intrinsic included).
pub fn charged_gas(upgrades: &Upgrades, gas_limit: u64, used: u64, floor: u64) -> u64 {
    let used = if upgrades.allegro { used.max(floor) } else { used };
    let used = used.min(gas_limit);
    used + (gas_limit - used) / UNUSED_GAS_CHARGE_DIVISOR
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PrecompileError {
    #[error("modexp operand of {0} bytes exceeds the 1024 byte cap")]
    ModexpInputTooLong(U256),
}

/// Gas of a call to the modexp precompile with `input`.
pub fn modexp_gas(upgrades: &Upgrades, input: &[u8]) -> Result<u64, PrecompileError> {
    let base_len = word(input, 0);
    let exp_len = word(input, 32);
    let mod_len = word(input, 64);

    if upgrades.brio {
        for len in [base_len, exp_len, mod_len] {
            if len > U256::from(MODEXP_MAX_INPUT_LEN) {
                return Err(PrecompileError::ModexpInputTooLong(len));
            }
        }
    }
    // Lengths past u64 cannot be paid for anyway; saturate and let the limit fail the call.
    let base_len = saturate(base_len);
    let exp_len = saturate(exp_len);
    let mod_len = saturate(mod_len);

    let exp_offset = 96u64.saturating_add(base_len);
    let exp_head_len = exp_len.min(32);
    let exp_head = read_padded(input, exp_offset, exp_head_len);
    let head_bits = exp_head.bit_len() as u64;

    let max_len = base_len.max(mod_len);
    let words = max_len.div_ceil(8);
    let gas = if upgrades.brio {
        // EIP-7883
        let complexity = if max_len <= 32 {
            16
        } else {
            words.saturating_mul(words).saturating_mul(2)
        };
        let iterations = iteration_count(exp_len, head_bits, 16);
        complexity.saturating_mul(iterations).max(500)
    } else {
        // EIP-2565
        let complexity = words.saturating_mul(words);
        let iterations = iteration_count(exp_len, head_bits, 8);
        (complexity.saturating_mul(iterations) / 3).max(200)
    };
    Ok(gas)
}

fn iteration_count(exp_len: u64, head_bits: u64, multiplier: u64) -> u64 {
    let count = if exp_len <= 32 {
        head_bits.saturating_sub(1)
    } else {
        multiplier
            .saturating_mul(exp_len - 32)
            .saturating_add(head_bits.saturating_sub(1))
    };
    count.max(1)
}

fn word(input: &[u8], offset: u64) -> U256 {
    read_padded(input, offset, 32)
}

/// Reads `len <= 32` bytes at `offset` as a big-endian integer, zero-padding
/// past the end of `input`.
fn read_padded(input: &[u8], offset: u64, len: u64) -> U256 {
    let mut buf = [0u8; 32];
    let len = len.min(32) as usize;
    if let Ok(start) = usize::try_from(offset) {
        for (i, slot) in buf[..len].iter_mut().enumerate() {
            if let Some(byte) = start.checked_add(i).and_then(|at| input.get(at)) {
                *slot = *byte;
            }
        }
    }
    U256::from_be_slice(&buf[..len])
}

fn saturate(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use alloy_consensus::{Signed, TxEip1559, TxLegacy};
    use alloy_eips::eip2930::AccessListItem;
    use alloy_primitives::{Address, B256, Bytes, Signature, TxKind};
    use test_case::test_case;

    use super::*;

    fn call_with(input: Vec<u8>) -> TxEnvelope {
        let tx = TxLegacy {
            chain_id: Some(4003),
            gas_limit: 2_000_000,
            to: TxKind::Call(Address::repeat_byte(1)),
            input: input.into(),
            ..Default::default()
        };
        Signed::new_unhashed(tx, Signature::test_signature()).into()
    }

    /// 40,000 bytes of calldata: one zero byte followed by 0xff.
    fn large_calldata() -> Vec<u8> {
        let mut data = vec![0xff; 40_000];
        data[0] = 0;
        data
    }

    #[test]
    fn intrinsic_and_floor_of_large_calldata() {
        let tx = call_with(large_calldata());
        assert_eq!(intrinsic_gas(&tx), 21_000 + 4 + 39_999 * 16);
        assert_eq!(intrinsic_gas(&tx), 660_988);
        assert_eq!(floor_data_gas(tx.input()), 1_620_970);
    }

    #[test]
    fn intrinsic_gas_counts_creation_and_access_list() {
        let tx = TxEip1559 {
            chain_id: 4003,
            gas_limit: 100_000,
            to: TxKind::Create,
            input: Bytes::from(vec![1; 33]),
            access_list: AccessList(vec![AccessListItem {
                address: Address::repeat_byte(2),
                storage_keys: vec![B256::ZERO, B256::repeat_byte(1)],
            }]),
            ..Default::default()
        };
        let tx: TxEnvelope = Signed::new_unhashed(tx, Signature::test_signature()).into();
        assert_eq!(
            intrinsic_gas(&tx),
            21_000 + 33 * 16 + 32_000 + 2 * 2 + 2_400 + 2 * 1_900
        );
    }

    #[test_case(Upgrades::sonic(), 2_000_000, 660_988, 1_620_970 => 794_889; "sonic ignores the floor")]
    #[test_case(Upgrades::allegro(), 2_000_000, 660_988, 1_620_970 => 1_658_873; "allegro charges the floor")]
    #[test_case(Upgrades::allegro(), 2_000_000, 1_700_000, 1_620_970 => 1_730_000; "allegro above the floor")]
    #[test_case(Upgrades::sonic(), 21_000, 21_000, 0 => 21_000; "exact limit")]
    #[test_case(Upgrades::sonic(), 100_000, 21_000, 0 => 28_900; "ten percent of unused")]
    #[test_case(Upgrades::brio(), 100_000, 100_000, 0 => 100_000; "out of gas")]
    fn charged(upgrades: Upgrades, limit: u64, used: u64, floor: u64) -> u64 {
        charged_gas(&upgrades, limit, used, floor)
    }

    #[test]
    fn minimum_gas_includes_the_floor_from_allegro() {
        let tx = call_with(vec![1; 1_000]);
        assert_eq!(minimum_gas(&Upgrades::sonic(), &tx), 21_000 + 16_000);
        assert_eq!(minimum_gas(&Upgrades::allegro(), &tx), 21_000 + 40_000);
    }

    const LOW_BIT_WORD: [u8; 32] = {
        let mut word = [0; 32];
        word[31] = 1;
        word
    };

    fn modexp_input(base_len: u64, exp_len: u64, mod_len: u64, exp_head: &[u8]) -> Vec<u8> {
        let mut input = Vec::new();
        for len in [base_len, exp_len, mod_len] {
            input.extend_from_slice(&U256::from(len).to_be_bytes::<32>());
        }
        input.extend(std::iter::repeat_n(0xff, base_len as usize));
        input.extend_from_slice(exp_head);
        input
    }

    #[test_case(Upgrades::sonic(), 32, 1, 32, &[3] => Ok(200); "berlin minimum")]
    #[test_case(Upgrades::brio(), 32, 1, 32, &[3] => Ok(500); "osaka minimum")]
    #[test_case(Upgrades::sonic(), 64, 32, 64, &[0xff; 32] => Ok(64 * 255 / 3); "berlin full exponent")]
    #[test_case(Upgrades::brio(), 64, 32, 64, &[0xff; 32] => Ok(2 * 64 * 255); "osaka full exponent")]
    #[test_case(Upgrades::brio(), 32, 64, 32, &LOW_BIT_WORD => Ok(16 * 16 * 32); "osaka long exponent")]
    #[test_case(Upgrades::sonic(), 2_048, 1, 1, &[] => Ok(256 * 256 / 3); "berlin has no cap")]
    #[test_case(Upgrades::brio(), 1_025, 1, 1, &[] => Err(PrecompileError::ModexpInputTooLong(U256::from(1_025))); "osaka caps the base")]
    fn modexp(upgrades: Upgrades, base: u64, exp: u64, modulus: u64, head: &[u8]) -> Result<u64, PrecompileError> {
        modexp_gas(&upgrades, &modexp_input(base, exp, modulus, head))
    }

    #[test]
    fn modexp_reads_missing_input_as_zero() {
        assert_eq!(modexp_gas(&Upgrades::sonic(), &[]), Ok(200));
        assert_eq!(modexp_gas(&Upgrades::brio(), &[]), Ok(500));
    }
}
