//! Data types shared by every layer of the node.
//!
//! Everything in here is a plain value: events as they travel between peers,
//! blocks as the block former commits them, and the validator set an epoch is
//! run with. Binary encodings live next to the types and are driven by the
//! small [`codec`] traits.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod block;
pub use block::{Block, BlockFields, BlockNumber, ExtraData};

pub mod codec;
pub use codec::{Decode, DecodeError, Encode};

pub mod event;
pub use event::{Event, EventId, EventPayload, EventVersion, Proposal, UnsignedEvent};

pub mod receipt;
pub use receipt::{Receipt, logs_bloom, receipts_root};

pub mod time;
pub use time::Timestamp;

pub mod transaction;
pub use transaction::{RecoveredTx, TxError, check_chain_id, sign_transaction};

pub mod validators;
pub use validators::{BlsPublicKeyBytes, ValidatorProfile, Validators};

/// Epoch counter. The first epoch after genesis is 1.
pub type Epoch = u32;

/// Virtual-clock round of the consensus engine.
pub type Frame = u32;

/// Logical event time, strictly greater than the lamport of every parent.
pub type Lamport = u32;

/// Per-creator event counter, starting at 1 in every epoch.
pub type Seq = u32;

/// Stable identifier of a validator within the network.
pub type ValidatorId = u32;

/// Stake weight of a validator.
pub type Stake = u64;
