//! Account state: a live view of the head and an archive of every version.
//!
//! The live table maps `a || address` to the RLP of an [`Account`] plus the
//! number of the block it reflects. The archive keeps `h || address || number`
//! for every account version a block wrote, and `c || number || address` as an
//! index of what each block changed, so that historic balances can be served
//! and a half-committed block can be rolled back.

use std::{collections::BTreeMap, sync::Arc};

use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use sonic_chainspec::Genesis;
use sonic_kvdb::{Producer, StoreError, Table};
use sonic_primitives::BlockNumber;
use tracing::debug;

const LIVE_TABLE: &str = "live";
const ARCHIVE_TABLE: &str = "archive";

const ACCOUNT_PREFIX: u8 = b'a';
const BLOCK_KEY: &[u8] = b"block";
const HISTORY_PREFIX: u8 = b'h';
const CHANGES_PREFIX: u8 = b'c';

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
}

impl Account {
    pub const fn with_balance(balance: U256) -> Self {
        Self { nonce: 0, balance }
    }

    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero()
    }
}

#[derive(RlpEncodable)]
struct RootEntry {
    address: Address,
    nonce: u64,
    balance: U256,
}

/// Accounts written by one block.
pub type StateDiff = BTreeMap<Address, Account>;

pub struct StateDb {
    live_producer: Arc<dyn Producer>,
    archive_producer: Arc<dyn Producer>,
    live: Arc<dyn Table>,
    archive: Arc<dyn Table>,
    accounts: BTreeMap<Address, Account>,
    block: Option<BlockNumber>,
    root: B256,
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb")
            .field("accounts", &self.accounts.len())
            .field("block", &self.block)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl StateDb {
    /// Opens the state and loads the live accounts into memory.
    pub fn open(
        live_producer: Arc<dyn Producer>,
        archive_producer: Arc<dyn Producer>,
    ) -> Result<Self, StoreError> {
        let live = live_producer.open_table(LIVE_TABLE)?;
        let archive = archive_producer.open_table(ARCHIVE_TABLE)?;

        let mut accounts = BTreeMap::new();
        for (key, value) in live.scan_prefix(&[ACCOUNT_PREFIX])? {
            let address = parse_address(LIVE_TABLE, &key[1..])?;
            accounts.insert(address, decode_account(LIVE_TABLE, &value)?);
        }
        let block = live
            .get(BLOCK_KEY)?
            .map(|raw| parse_number(LIVE_TABLE, &raw))
            .transpose()?;

        let root = compute_root(&accounts);
        debug!(accounts = accounts.len(), ?block, %root, "opened state");
        Ok(Self {
            live_producer,
            archive_producer,
            live,
            archive,
            accounts,
            block,
            root,
        })
    }

    /// Block the live state reflects; `None` before genesis is applied.
    pub const fn block(&self) -> Option<BlockNumber> {
        self.block
    }

    pub const fn root(&self) -> B256 {
        self.root
    }

    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    /// Account as of the end of block `number`.
    pub fn account_at(&self, address: &Address, number: BlockNumber) -> Result<Account, StoreError> {
        let mut prefix = vec![HISTORY_PREFIX];
        prefix.extend_from_slice(address.as_slice());
        let mut found = Account::default();
        for (key, value) in self.archive.scan_prefix(&prefix)? {
            let version = parse_number(ARCHIVE_TABLE, &key[prefix.len()..])?;
            if version > number {
                break;
            }
            found = decode_account(ARCHIVE_TABLE, &value)?;
        }
        Ok(found)
    }

    /// Writes the genesis accounts as block 0. A state that already has a head
    /// is left untouched.
    pub fn init_genesis(&mut self, genesis: &Genesis) -> Result<B256, StoreError> {
        if self.block.is_some() {
            return Ok(self.root);
        }
        let diff = genesis
            .accounts
            .iter()
            .map(|account| {
                (
                    account.address,
                    Account {
                        nonce: account.nonce,
                        balance: account.balance,
                    },
                )
            })
            .collect();
        self.commit(0, &diff)
    }

    /// Writes `diff` as block `number` and returns the new state root.
    pub fn commit(&mut self, number: BlockNumber, diff: &StateDiff) -> Result<B256, StoreError> {
        let mut number_key = vec![CHANGES_PREFIX];
        number_key.extend_from_slice(&number.to_be_bytes());
        for (address, account) in diff {
            let encoded = alloy_rlp::encode(account);
            self.archive.put(&history_key(address, number), &encoded)?;
            self.archive
                .put(&[number_key.as_slice(), address.as_slice()].concat(), &[])?;
        }
        self.archive_producer.sync()?;

        for (address, account) in diff {
            self.live.put(&account_key(address), &alloy_rlp::encode(account))?;
            self.accounts.insert(*address, *account);
        }
        self.live.put(BLOCK_KEY, &number.to_be_bytes())?;
        self.live_producer.sync()?;

        self.block = Some(number);
        self.root = compute_root(&self.accounts);
        Ok(self.root)
    }

    /// Undoes every block after `number`, restoring the archived versions.
    pub fn rollback(&mut self, number: BlockNumber) -> Result<B256, StoreError> {
        let Some(mut head) = self.block else {
            return Ok(self.root);
        };
        while head > number {
            let mut prefix = vec![CHANGES_PREFIX];
            prefix.extend_from_slice(&head.to_be_bytes());
            for (key, _) in self.archive.scan_prefix(&prefix)? {
                let address = parse_address(ARCHIVE_TABLE, &key[prefix.len()..])?;
                let previous = self.account_at(&address, head - 1)?;
                self.live.put(&account_key(&address), &alloy_rlp::encode(previous))?;
                self.accounts.insert(address, previous);
                self.archive.delete(&history_key(&address, head))?;
                self.archive.delete(&key)?;
            }
            head -= 1;
        }
        self.live.put(BLOCK_KEY, &head.to_be_bytes())?;
        self.archive_producer.sync()?;
        self.live_producer.sync()?;

        self.block = Some(head);
        self.root = compute_root(&self.accounts);
        debug!(block = head, root = %self.root, "rolled back state");
        Ok(self.root)
    }
}

fn account_key(address: &Address) -> Vec<u8> {
    [&[ACCOUNT_PREFIX][..], address.as_slice()].concat()
}

fn history_key(address: &Address, number: BlockNumber) -> Vec<u8> {
    [&[HISTORY_PREFIX][..], address.as_slice(), &number.to_be_bytes()].concat()
}

fn compute_root(accounts: &BTreeMap<Address, Account>) -> B256 {
    let entries = accounts
        .iter()
        .filter(|(_, account)| !account.is_empty())
        .map(|(address, account)| RootEntry {
            address: *address,
            nonce: account.nonce,
            balance: account.balance,
        })
        .collect::<Vec<_>>();
    keccak256(alloy_rlp::encode(entries))
}

fn decode_account(table: &str, mut raw: &[u8]) -> Result<Account, StoreError> {
    Account::decode(&mut raw).map_err(|err| StoreError::corrupted(table, err))
}

fn parse_address(table: &str, raw: &[u8]) -> Result<Address, StoreError> {
    Address::try_from(raw).map_err(|_| StoreError::corrupted(table, "malformed account key"))
}

fn parse_number(table: &str, raw: &[u8]) -> Result<BlockNumber, StoreError> {
    raw.try_into()
        .map(BlockNumber::from_be_bytes)
        .map_err(|_| StoreError::corrupted(table, "malformed block number"))
}

#[cfg(test)]
mod tests {
    use sonic_kvdb::{MemoryProducer, SledProducer};

    use super::*;

    fn memory() -> StateDb {
        StateDb::open(Arc::new(MemoryProducer::new()), Arc::new(MemoryProducer::new())).unwrap()
    }

    fn diff(entries: &[(u8, u64)]) -> StateDiff {
        entries
            .iter()
            .map(|(who, balance)| {
                (Address::repeat_byte(*who), Account::with_balance(U256::from(*balance)))
            })
            .collect()
    }

    #[test]
    fn archive_serves_every_version() {
        let mut state = memory();
        assert_eq!(state.block(), None);
        state.commit(0, &diff(&[(1, 100), (2, 50)])).unwrap();
        state.commit(1, &diff(&[(1, 70)])).unwrap();
        state.commit(2, &diff(&[(2, 80)])).unwrap();

        let one = Address::repeat_byte(1);
        assert_eq!(state.account(&one).balance, U256::from(70));
        assert_eq!(state.account_at(&one, 0).unwrap().balance, U256::from(100));
        assert_eq!(state.account_at(&one, 1).unwrap().balance, U256::from(70));
        assert_eq!(state.account_at(&one, 9).unwrap().balance, U256::from(70));
        assert!(state.account_at(&Address::repeat_byte(3), 2).unwrap().is_empty());
    }

    #[test]
    fn root_depends_only_on_accounts() {
        let mut a = memory();
        a.commit(0, &diff(&[(1, 100), (2, 50)])).unwrap();
        let mut b = memory();
        b.commit(0, &diff(&[(2, 50)])).unwrap();
        b.commit(1, &diff(&[(1, 100)])).unwrap();
        assert_eq!(a.root(), b.root());

        b.commit(2, &diff(&[(1, 99)])).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn rollback_restores_previous_block() {
        let mut state = memory();
        let genesis = state.commit(0, &diff(&[(1, 100)])).unwrap();
        state.commit(1, &diff(&[(1, 40), (2, 60)])).unwrap();

        assert_eq!(state.rollback(0).unwrap(), genesis);
        assert_eq!(state.block(), Some(0));
        assert_eq!(state.account(&Address::repeat_byte(1)).balance, U256::from(100));
        assert!(state.account(&Address::repeat_byte(2)).is_empty());
        assert_eq!(
            state.account_at(&Address::repeat_byte(1), 1).unwrap().balance,
            U256::from(100)
        );
    }

    #[test]
    fn reopens_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let open = || {
            StateDb::open(
                Arc::new(SledProducer::open(&dir.path().join("live")).unwrap()),
                Arc::new(SledProducer::open(&dir.path().join("archive")).unwrap()),
            )
            .unwrap()
        };
        let root = {
            let mut state = open();
            state.commit(0, &diff(&[(1, 100), (2, 50)])).unwrap();
            state.commit(1, &diff(&[(2, 10)])).unwrap()
        };
        let state = open();
        assert_eq!(state.block(), Some(1));
        assert_eq!(state.root(), root);
        assert_eq!(state.account_at(&Address::repeat_byte(2), 0).unwrap().balance, U256::from(50));
    }

    #[test]
    fn corrupted_account_is_reported() {
        let live = MemoryProducer::new();
        let mut state = StateDb::open(Arc::new(live.clone()), Arc::new(MemoryProducer::new())).unwrap();
        state.commit(0, &diff(&[(1, 100)])).unwrap();
        live.open_table(LIVE_TABLE)
            .unwrap()
            .put(&account_key(&Address::repeat_byte(1)), b"\xff\xff")
            .unwrap();
        assert!(matches!(
            StateDb::open(Arc::new(live), Arc::new(MemoryProducer::new())),
            Err(StoreError::Corrupted { .. })
        ));
    }
}
