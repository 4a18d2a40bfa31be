//! Well-known addresses.

use alloy_primitives::{Address, address};

/// Network driver contract. Governance calls that change rules, validator
/// weights or force epoch sealing are addressed here.
pub const DRIVER_AUTH_ADDRESS: Address = address!("0xd100ae0000000000000000000000000000000000");

/// secp256r1 signature verification precompile, active from Brio.
pub const P256_VERIFY_ADDRESS: Address = address!("0x0000000000000000000000000000000000000100");

/// Modular exponentiation precompile.
pub const MODEXP_ADDRESS: Address = address!("0x0000000000000000000000000000000000000005");
