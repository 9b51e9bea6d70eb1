use std::fmt;

use crate::htm::config::ConflictResolutionPolicy;
use crate::htm::types::{AbortCause, CacheLevel, SetKind};

/// Rejected option combinations. Raised once by `HtmConfig::validate`,
/// before any transaction runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ReloadIfStaleRequiresPreciseTracking,
    ReloadIfStaleWithStallPolicy(ConflictResolutionPolicy),
    CommitterWinsRequiresLazyDetection,
    StallPolicyRequiresEagerDetection(ConflictResolutionPolicy),
    LazyDetectionRequiresLazyVersioning,
    WriteSetEvictionRequiresEagerVersioning(CacheLevel),
    EvictionRequiresShallowerLevel { level: CacheLevel, set: SetKind },
    ZeroMaxRetries,
    BadSignature { bits: usize, hashes: usize },
    UnknownPreset(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReloadIfStaleRequiresPreciseTracking => {
                write!(f, "reload-if-stale requires precise-read-set-tracking")
            }
            Self::ReloadIfStaleWithStallPolicy(policy) => write!(
                f,
                "reload-if-stale cannot be combined with stalling policy '{}'",
                policy.as_str()
            ),
            Self::CommitterWinsRequiresLazyDetection => {
                write!(f, "committer_wins requires lazy conflict detection")
            }
            Self::StallPolicyRequiresEagerDetection(policy) => write!(
                f,
                "policy '{}' requires eager conflict detection",
                policy.as_str()
            ),
            Self::LazyDetectionRequiresLazyVersioning => {
                write!(f, "lazy conflict detection requires lazy version management")
            }
            Self::WriteSetEvictionRequiresEagerVersioning(level) => write!(
                f,
                "write-set {:?} evictions require eager version management",
                level
            ),
            Self::EvictionRequiresShallowerLevel { level, set } => write!(
                f,
                "{:?}-set {:?} evictions require the same permission at every shallower level",
                set, level
            ),
            Self::ZeroMaxRetries => write!(f, "max_retries must be > 0"),
            Self::BadSignature { bits, hashes } => write!(
                f,
                "signature needs a power-of-two bit count and at least one hash (bits={}, hashes={})",
                bits, hashes
            ),
            Self::UnknownPreset(name) => write!(f, "unknown HTM preset '{}'", name),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Unwind signal carried out of a transaction body with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    pub cause: AbortCause,
}

impl Abort {
    pub fn new(cause: AbortCause) -> Self {
        Self { cause }
    }

    pub fn explicit() -> Self {
        Self::new(AbortCause::Explicit)
    }
}

impl From<AbortCause> for Abort {
    fn from(cause: AbortCause) -> Self {
        Self::new(cause)
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction aborted ({})", self.cause)
    }
}

impl std::error::Error for Abort {}
