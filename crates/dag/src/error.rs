use sonic_kvdb::StoreError;
use sonic_primitives::{DecodeError, Epoch, Seq, ValidatorId, event::EventId};

/// Why an event was not admitted.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("malformed event")]
    Decode(#[from] DecodeError),
    #[error("malformed event: {0}")]
    Malformed(&'static str),
    #[error("event of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: u32 },
    #[error("event waits for unknown parent `{0}`")]
    UnknownParent(EventId),
    #[error("event is from epoch `{got}`, the DAG is at epoch `{expected}`")]
    WrongEpoch { got: Epoch, expected: Epoch },
    #[error("creator `{0}` is not a validator of this epoch")]
    UnknownCreator(ValidatorId),
    #[error("event signature does not recover to the creator's key")]
    BadSignature,
    #[error("event uses `{used}` gas power, only `{available}` is available")]
    GasOverrun { used: u64, available: u64 },
    #[error("event `{0}` is already known")]
    Duplicate(EventId),
    #[error("creator `{creator}` produced a second event with sequence `{seq}`")]
    Equivocation { creator: ValidatorId, seq: Seq },
    #[error("failed persisting event")]
    Storage(#[from] StoreError),
}

/// Coarse classification of [`AdmissionError`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectKind {
    Malformed,
    UnknownParent,
    WrongEpoch,
    UnknownCreator,
    BadSignature,
    GasOverrun,
    Duplicate,
    Equivocation,
    Storage,
}

impl AdmissionError {
    pub const fn kind(&self) -> RejectKind {
        match self {
            Self::Decode(_) | Self::Malformed(_) | Self::TooLarge { .. } => RejectKind::Malformed,
            Self::UnknownParent(_) => RejectKind::UnknownParent,
            Self::WrongEpoch { .. } => RejectKind::WrongEpoch,
            Self::UnknownCreator(_) => RejectKind::UnknownCreator,
            Self::BadSignature => RejectKind::BadSignature,
            Self::GasOverrun { .. } => RejectKind::GasOverrun,
            Self::Duplicate(_) => RejectKind::Duplicate,
            Self::Equivocation { .. } => RejectKind::Equivocation,
            Self::Storage(_) => RejectKind::Storage,
        }
    }

    /// Storage failures are permanent; everything else only drops the event.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl std::fmt::Display for RejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Malformed => "malformed",
            Self::UnknownParent => "unknown_parent",
            Self::WrongEpoch => "wrong_epoch",
            Self::UnknownCreator => "unknown_creator",
            Self::BadSignature => "bad_signature",
            Self::GasOverrun => "gas_overrun",
            Self::Duplicate => "duplicate",
            Self::Equivocation => "equivocation",
            Self::Storage => "storage",
        };
        f.write_str(name)
    }
}
