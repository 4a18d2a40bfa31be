use alloy_consensus::{
    SignableTransaction, Signed, Transaction as _, TxEnvelope, transaction::SignerRecoverable,
};
use alloy_primitives::{Address, B256, Signature};
use alloy_signer::SignerSync;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction signature does not recover to a sender")]
    BadSignature,
    #[error("transaction chain id `{got}` does not match the network's `{expected}`")]
    WrongChainId { got: u64, expected: u64 },
    #[error("transaction is not replay protected and unprotected transactions are disabled")]
    Unprotected,
}

/// A transaction together with its recovered sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredTx {
    tx: TxEnvelope,
    sender: Address,
}

impl RecoveredTx {
    pub fn recover(tx: TxEnvelope) -> Result<Self, TxError> {
        let sender = tx.recover_signer().map_err(|_| TxError::BadSignature)?;
        Ok(Self { tx, sender })
    }

    pub const fn sender(&self) -> Address {
        self.sender
    }

    pub fn hash(&self) -> B256 {
        *self.tx.tx_hash()
    }

    pub const fn tx(&self) -> &TxEnvelope {
        &self.tx
    }

    pub fn into_tx(self) -> TxEnvelope {
        self.tx
    }

    pub fn nonce(&self) -> u64 {
        self.tx.nonce()
    }

    pub fn gas_limit(&self) -> u64 {
        self.tx.gas_limit()
    }

    /// Priority fee per gas the sender pays on top of `base_fee`.
    pub fn effective_tip(&self, base_fee: u64) -> u128 {
        self.tx.effective_tip_per_gas(base_fee).unwrap_or_default()
    }

    /// Gas price actually paid per unit of gas under `base_fee`.
    pub fn effective_gas_price(&self, base_fee: u64) -> u128 {
        self.tx.effective_gas_price(Some(base_fee))
    }
}

/// Checks replay protection against the network chain id.
///
/// Legacy transactions signed without a chain id are accepted only when
/// `allow_unprotected` is set.
pub fn check_chain_id(
    tx: &TxEnvelope,
    chain_id: u64,
    allow_unprotected: bool,
) -> Result<(), TxError> {
    match tx.chain_id() {
        Some(got) if got != chain_id => Err(TxError::WrongChainId {
            got,
            expected: chain_id,
        }),
        Some(_) => Ok(()),
        None if allow_unprotected => Ok(()),
        None => Err(TxError::Unprotected),
    }
}

/// Signs `tx` with `signer` and wraps it into an envelope.
pub fn sign_transaction<T>(tx: T, signer: &impl SignerSync) -> alloy_signer::Result<TxEnvelope>
where
    T: SignableTransaction<Signature>,
    TxEnvelope: From<Signed<T>>,
{
    let signature = signer.sign_hash_sync(&tx.signature_hash())?;
    Ok(tx.into_signed(signature).into())
}

#[cfg(test)]
mod tests {
    use alloy_consensus::TxLegacy;
    use alloy_primitives::{TxKind, U256, keccak256};
    use alloy_signer_local::PrivateKeySigner;

    use super::*;

    fn legacy(chain_id: Option<u64>) -> TxLegacy {
        TxLegacy {
            chain_id,
            nonce: 3,
            gas_price: 2_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(Address::repeat_byte(0x42)),
            value: U256::from(1),
            input: Default::default(),
        }
    }

    #[test]
    fn recovers_sender_and_checks_replay_protection() {
        let signer = PrivateKeySigner::from_bytes(&keccak256(b"sender")).unwrap();
        let tx = sign_transaction(legacy(Some(146)), &signer).unwrap();
        let recovered = RecoveredTx::recover(tx.clone()).unwrap();
        assert_eq!(recovered.sender(), signer.address());
        assert_eq!(recovered.nonce(), 3);
        assert_eq!(recovered.effective_tip(1_000_000_000), 1_000_000_000);

        assert_eq!(check_chain_id(&tx, 146, false), Ok(()));
        assert_eq!(
            check_chain_id(&tx, 250, false),
            Err(TxError::WrongChainId {
                got: 146,
                expected: 250
            })
        );

        let unprotected = sign_transaction(legacy(None), &signer).unwrap();
        assert_eq!(
            check_chain_id(&unprotected, 146, false),
            Err(TxError::Unprotected)
        );
        assert_eq!(check_chain_id(&unprotected, 146, true), Ok(()));
    }
}
