//! DAG events and their wire format.
//!
//! An event is length-prefixed on the wire:
//!
//! ```text
//! u32 body length
//! u8  version            2 = distributed proposer, 3 = single proposer
//! u32 epoch
//! u32 lamport
//! u32 creator
//! u32 sequence
//! u64 creation time      unix nanoseconds
//! u16 parent count, then 32 bytes per parent (first = self-parent or zero)
//! u64 gas power used
//! u32 payload length, then the payload
//! 65  secp256k1 signature over the event hash
//! ```
//!
//! The event hash is keccak256 over the body from the version byte up to and
//! including the payload. It doubles as the event id.

use std::ops::Deref;

use alloy_consensus::TxEnvelope;
use alloy_primitives::{Address, B256, Signature, SignatureError, keccak256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use alloy_signer::SignerSync;
use bytes::{Buf, BufMut};

use crate::{
    BlockNumber, Epoch, Lamport, Seq, Timestamp, ValidatorId,
    codec::{
        DecodeError, EncodeSize, Read, Write, read_b256, read_bytes, read_u8, read_u16, read_u32,
        read_u64,
    },
};

/// Event identifier: the keccak256 hash of the unsigned event.
pub type EventId = B256;

/// Hard ceiling on a decoded event, independent of the epoch rules.
pub const MAX_WIRE_EVENT_SIZE: usize = 16 * 1024 * 1024;

const SIGNATURE_LEN: usize = 65;

/// Protocol version tag carried in the first byte of the event body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventVersion {
    /// Blocks are formed from the transactions of all decided events.
    Distributed = 2,
    /// Blocks are formed from proposals of an elected validator.
    SingleProposer = 3,
}

impl TryFrom<u8> for EventVersion {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Distributed),
            3 => Ok(Self::SingleProposer),
            other => Err(DecodeError::UnknownVersion(other)),
        }
    }
}

/// A block candidate built by the elected proposer and carried inside its event.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Proposal {
    pub number: BlockNumber,
    pub parent_hash: B256,
    pub timestamp: Timestamp,
    pub prev_randao: B256,
    /// Election attempt this proposal was built for.
    pub turn: u32,
    pub transactions: Vec<TxEnvelope>,
}

impl Proposal {
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }
}

/// Event payload, tagged by protocol version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    V2 {
        transactions: Vec<TxEnvelope>,
    },
    V3 {
        transactions: Vec<TxEnvelope>,
        proposal: Option<Proposal>,
    },
}

impl EventPayload {
    pub const fn version(&self) -> EventVersion {
        match self {
            Self::V2 { .. } => EventVersion::Distributed,
            Self::V3 { .. } => EventVersion::SingleProposer,
        }
    }

    pub fn transactions(&self) -> &[TxEnvelope] {
        match self {
            Self::V2 { transactions } | Self::V3 { transactions, .. } => transactions,
        }
    }

    pub const fn proposal(&self) -> Option<&Proposal> {
        match self {
            Self::V2 { .. } => None,
            Self::V3 { proposal, .. } => proposal.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions().is_empty() && self.proposal().is_none()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::V2 { transactions } => transactions.length(),
            Self::V3 {
                transactions,
                proposal,
            } => transactions.length() + 1 + proposal.as_ref().map_or(0, Encodable::length),
        }
    }

    fn write(&self, buf: &mut impl BufMut) {
        let mut out = Vec::with_capacity(self.encoded_len());
        match self {
            Self::V2 { transactions } => transactions.encode(&mut out),
            Self::V3 {
                transactions,
                proposal,
            } => {
                transactions.encode(&mut out);
                match proposal {
                    Some(proposal) => {
                        out.push(1);
                        proposal.encode(&mut out);
                    }
                    None => out.push(0),
                }
            }
        }
        buf.put_slice(&out);
    }

    fn read(version: EventVersion, mut buf: &[u8]) -> Result<Self, DecodeError> {
        let transactions = Vec::<TxEnvelope>::decode(&mut buf)?;
        let payload = match version {
            EventVersion::Distributed => Self::V2 { transactions },
            EventVersion::SingleProposer => {
                let proposal = match read_u8(&mut buf)? {
                    0 => None,
                    1 => Some(Proposal::decode(&mut buf)?),
                    _ => return Err(DecodeError::Invalid("proposal flag")),
                };
                Self::V3 {
                    transactions,
                    proposal,
                }
            }
        };
        if !buf.is_empty() {
            return Err(DecodeError::ExtraData(buf.len()));
        }
        Ok(payload)
    }
}

/// All event fields except the signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub epoch: Epoch,
    pub lamport: Lamport,
    pub creator: ValidatorId,
    pub seq: Seq,
    pub creation_time: Timestamp,
    /// Parent ids; the first entry is the self-parent, or zero for the first
    /// event of a creator in the epoch.
    pub parents: Vec<EventId>,
    pub gas_power_used: u64,
    pub payload: EventPayload,
}

impl UnsignedEvent {
    pub const fn version(&self) -> EventVersion {
        self.payload.version()
    }

    pub fn hash(&self) -> EventId {
        let mut body = Vec::with_capacity(self.body_size());
        self.write_body(&mut body);
        keccak256(body)
    }

    pub fn self_parent(&self) -> Option<EventId> {
        if self.seq > 1 {
            self.parents.first().copied()
        } else {
            None
        }
    }

    /// Parents without the self-parent slot.
    pub fn other_parents(&self) -> &[EventId] {
        match self.parents.split_first() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    pub fn sign(self, signer: &impl SignerSync) -> alloy_signer::Result<Event> {
        let signature = signer.sign_hash_sync(&self.hash())?;
        Ok(Event::new(self, signature))
    }

    fn body_size(&self) -> usize {
        1 + 4 * 4 + 8 + 2 + 32 * self.parents.len() + 8 + 4 + self.payload.encoded_len()
    }

    fn write_body(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version() as u8);
        buf.put_u32(self.epoch);
        buf.put_u32(self.lamport);
        buf.put_u32(self.creator);
        buf.put_u32(self.seq);
        buf.put_u64(self.creation_time.as_nanos());
        buf.put_u16(self.parents.len() as u16);
        for parent in &self.parents {
            buf.put_slice(parent.as_slice());
        }
        buf.put_u64(self.gas_power_used);
        buf.put_u32(self.payload.encoded_len() as u32);
        self.payload.write(buf);
    }
}

/// A signed event, with its id computed once on construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    unsigned: UnsignedEvent,
    signature: Signature,
    id: EventId,
}

impl Event {
    pub fn new(unsigned: UnsignedEvent, signature: Signature) -> Self {
        let id = unsigned.hash();
        Self {
            unsigned,
            signature,
            id,
        }
    }

    pub const fn id(&self) -> EventId {
        self.id
    }

    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    pub const fn unsigned(&self) -> &UnsignedEvent {
        &self.unsigned
    }

    /// Size of the full wire record, including the length prefix.
    pub fn size(&self) -> usize {
        self.encode_size()
    }

    /// Recovers the address of the key that signed this event.
    pub fn recover_signer(&self) -> Result<Address, SignatureError> {
        self.signature.recover_address_from_prehash(&self.id)
    }
}

impl Deref for Event {
    type Target = UnsignedEvent;

    fn deref(&self) -> &Self::Target {
        &self.unsigned
    }
}

impl EncodeSize for Event {
    fn encode_size(&self) -> usize {
        4 + self.unsigned.body_size() + SIGNATURE_LEN
    }
}

impl Write for Event {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32((self.unsigned.body_size() + SIGNATURE_LEN) as u32);
        self.unsigned.write_body(buf);
        buf.put_slice(&self.signature.as_bytes());
    }
}

impl Read for Event {
    fn read(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let len = read_u32(buf)? as usize;
        if len > MAX_WIRE_EVENT_SIZE {
            return Err(DecodeError::TooLong {
                declared: len,
                limit: MAX_WIRE_EVENT_SIZE,
            });
        }
        let record = read_bytes(buf, len)?;
        let mut body = &record[..];

        let version = EventVersion::try_from(read_u8(&mut body)?)?;
        let epoch = read_u32(&mut body)?;
        let lamport = read_u32(&mut body)?;
        let creator = read_u32(&mut body)?;
        let seq = read_u32(&mut body)?;
        let creation_time = Timestamp::from_nanos(read_u64(&mut body)?);
        let parent_count = read_u16(&mut body)? as usize;
        let mut parents = Vec::with_capacity(parent_count.min(body.len() / 32));
        for _ in 0..parent_count {
            parents.push(read_b256(&mut body)?);
        }
        let gas_power_used = read_u64(&mut body)?;
        let payload_len = read_u32(&mut body)? as usize;
        let payload = read_bytes(&mut body, payload_len)?;
        let payload = EventPayload::read(version, &payload)?;

        let signature = read_bytes(&mut body, SIGNATURE_LEN)?;
        if !body.is_empty() {
            return Err(DecodeError::ExtraData(body.len()));
        }
        let signature =
            Signature::from_raw(&signature).map_err(|_| DecodeError::Invalid("signature"))?;

        Ok(Self::new(
            UnsignedEvent {
                epoch,
                lamport,
                creator,
                seq,
                creation_time,
                parents,
                gas_power_used,
                payload,
            },
            signature,
        ))
    }
}

#[cfg(test)]
mod tests {
    use alloy_consensus::TxLegacy;
    use alloy_primitives::{TxKind, U256, address};
    use alloy_signer_local::PrivateKeySigner;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        codec::{Decode as _, Encode as _},
        transaction::sign_transaction,
    };

    fn signer() -> PrivateKeySigner {
        PrivateKeySigner::from_bytes(&keccak256(b"event-test")).unwrap()
    }

    fn transfer(nonce: u64) -> TxEnvelope {
        let tx = TxLegacy {
            chain_id: Some(146),
            nonce,
            gas_price: 1_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(address!("0x0000000000000000000000000000000000000042")),
            value: U256::from(1),
            input: Default::default(),
        };
        sign_transaction(tx, &signer()).unwrap()
    }

    fn unsigned(payload: EventPayload) -> UnsignedEvent {
        UnsignedEvent {
            epoch: 3,
            lamport: 12,
            creator: 2,
            seq: 5,
            creation_time: Timestamp::from_nanos(1_700_000_000_000_000_001),
            parents: vec![B256::repeat_byte(1), B256::repeat_byte(2)],
            gas_power_used: 28_000,
            payload,
        }
    }

    #[test]
    fn signed_event_survives_the_wire() {
        let event = unsigned(EventPayload::V3 {
            transactions: vec![transfer(0), transfer(1)],
            proposal: Some(Proposal {
                number: 9,
                parent_hash: B256::repeat_byte(7),
                timestamp: Timestamp::from_secs(10),
                prev_randao: B256::repeat_byte(8),
                turn: 0,
                transactions: vec![transfer(2)],
            }),
        })
        .sign(&signer())
        .unwrap();

        let encoded = event.encode();
        assert_eq!(encoded.len(), event.size());

        let decoded = Event::decode(&encoded).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.id(), event.id());
        assert_eq!(decoded.version(), EventVersion::SingleProposer);
        assert_eq!(decoded.encode(), encoded);
        assert_eq!(decoded.recover_signer().unwrap(), signer().address());
    }

    #[test]
    fn hash_binds_every_field() {
        let base = unsigned(EventPayload::V2 {
            transactions: vec![],
        });
        let mut other = base.clone();
        other.gas_power_used += 1;
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.parents.swap(0, 1);
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.payload = EventPayload::V3 {
            transactions: vec![],
            proposal: None,
        };
        assert_ne!(base.hash(), other.hash());
    }

    #[test]
    fn rejects_unknown_version_and_truncation() {
        let event = unsigned(EventPayload::V2 {
            transactions: vec![transfer(0)],
        })
        .sign(&signer())
        .unwrap();
        let mut encoded = event.encode().to_vec();

        assert_eq!(
            Event::decode(&encoded[..encoded.len() - 1]).err(),
            Some(DecodeError::EndOfBuffer)
        );

        encoded[4] = 9;
        assert_eq!(
            Event::decode(&encoded).err(),
            Some(DecodeError::UnknownVersion(9))
        );
    }

    #[test]
    fn parent_slots() {
        let mut event = unsigned(EventPayload::V2 {
            transactions: vec![],
        });
        assert_eq!(event.self_parent(), Some(B256::repeat_byte(1)));
        assert_eq!(event.other_parents(), &[B256::repeat_byte(2)]);

        event.seq = 1;
        event.parents[0] = B256::ZERO;
        assert_eq!(event.self_parent(), None);
    }

    proptest! {
        #[test]
        fn arbitrary_headers_roundtrip(
            epoch in any::<u32>(),
            lamport in any::<u32>(),
            creator in any::<u32>(),
            seq in any::<u32>(),
            time in any::<u64>(),
            parents in proptest::collection::vec(any::<[u8; 32]>(), 0..8),
            gas in any::<u64>(),
            v3 in any::<bool>(),
        ) {
            let payload = if v3 {
                EventPayload::V3 { transactions: vec![], proposal: None }
            } else {
                EventPayload::V2 { transactions: vec![] }
            };
            let event = UnsignedEvent {
                epoch,
                lamport,
                creator,
                seq,
                creation_time: Timestamp::from_nanos(time),
                parents: parents.into_iter().map(B256::from).collect(),
                gas_power_used: gas,
                payload,
            }
            .sign(&signer())
            .unwrap();

            let decoded = Event::decode(&event.encode()).unwrap();
            prop_assert_eq!(decoded, event);
        }
    }
}
