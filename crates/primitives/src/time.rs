use std::{fmt, time::Duration};

use alloy_rlp::{Decodable, Encodable};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Unix time in nanoseconds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * NANOS_PER_SEC)
    }

    pub fn now() -> Self {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self(since_epoch.as_nanos() as u64)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole seconds, as carried by the Ethereum header's `timestamp`.
    pub const fn unix_secs(self) -> u64 {
        self.0 / NANOS_PER_SEC
    }

    /// The part below one second, carried in the block extra-data.
    pub const fn subsec_nanos(self) -> u32 {
        (self.0 % NANOS_PER_SEC) as u32
    }

    pub const fn from_parts(secs: u64, subsec_nanos: u32) -> Self {
        Self(secs * NANOS_PER_SEC + subsec_nanos as u64)
    }

    pub fn saturating_sub(self, other: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.unix_secs(), self.subsec_nanos())
    }
}

impl From<Duration> for Timestamp {
    fn from(value: Duration) -> Self {
        Self(value.as_nanos() as u64)
    }
}

impl Encodable for Timestamp {
    fn encode(&self, out: &mut dyn BufMut) {
        self.as_nanos().encode(out)
    }

    fn length(&self) -> usize {
        self.as_nanos().length()
    }
}

impl Decodable for Timestamp {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        u64::decode(buf).map(Self::from_nanos)
    }
}
