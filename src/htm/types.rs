use serde::{Deserialize, Serialize};
use std::fmt;

pub type Addr = u64;
pub type LineAddr = u64;
pub type CoreId = usize;
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Which transactional set a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    Read,
    Write,
}

impl SetKind {
    pub fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }
}

impl From<AccessKind> for SetKind {
    fn from(kind: AccessKind) -> Self {
        match kind {
            AccessKind::Read => Self::Read,
            AccessKind::Write => Self::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum CacheLevel {
    L0,
    L1,
    L2,
}

impl CacheLevel {
    pub const ALL: [CacheLevel; 3] = [CacheLevel::L0, CacheLevel::L1, CacheLevel::L2];

    pub fn index(self) -> usize {
        match self {
            Self::L0 => 0,
            Self::L1 => 1,
            Self::L2 => 2,
        }
    }

    pub fn capacity_cause(self) -> AbortCause {
        match self {
            Self::L0 => AbortCause::L0Capacity,
            Self::L1 => AbortCause::L1Capacity,
            Self::L2 => AbortCause::L2Capacity,
        }
    }
}

/// Lifecycle of one attempt of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Active,
    Validating,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AbortCause {
    Conflict,
    ConflictStale,
    L0Capacity,
    L1Capacity,
    L2Capacity,
    ReadSetCapacity,
    Explicit,
    FallbackLock,
    SpeculationDisabled,
}

impl AbortCause {
    pub fn is_capacity(self) -> bool {
        matches!(
            self,
            Self::L0Capacity | Self::L1Capacity | Self::L2Capacity | Self::ReadSetCapacity
        )
    }

    pub fn is_conflict(self) -> bool {
        matches!(self, Self::Conflict | Self::ConflictStale | Self::FallbackLock)
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Conflict => "Conflict",
            Self::ConflictStale => "ConflictStale",
            Self::L0Capacity => "L0Capacity",
            Self::L1Capacity => "L1Capacity",
            Self::L2Capacity => "L2Capacity",
            Self::ReadSetCapacity => "ReadSetCapacity",
            Self::Explicit => "Explicit",
            Self::FallbackLock => "FallbackLock",
            Self::SpeculationDisabled => "SpeculationDisabled",
        };
        f.write_str(s)
    }
}
