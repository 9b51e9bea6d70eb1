use crate::htm::cache::{CacheLine, TxTag};
use crate::htm::config::HtmConfig;
use crate::htm::types::{CacheLevel, SetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionVerdict {
    Allow,
    /// The line may go, but its owner loses track of it and must abort.
    AllowButAbort,
    Deny,
}

/// Per-level permissions for evicting transactionally tagged lines.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicyGate {
    allow: [[bool; 3]; 2],
    precise_reads: bool,
}

impl EvictionPolicyGate {
    pub fn new(config: &HtmConfig) -> Self {
        let mut allow = [[false; 3]; 2];
        for set in [SetKind::Read, SetKind::Write] {
            for level in CacheLevel::ALL {
                allow[set.index()][level.index()] = config.allows_eviction(level, set);
            }
        }
        Self {
            allow,
            precise_reads: config.precise_read_set_tracking,
        }
    }

    pub fn may_evict(&self, line: &CacheLine, level: CacheLevel) -> EvictionVerdict {
        let set = match line.tag {
            TxTag::Untouched => return EvictionVerdict::Allow,
            TxTag::ReadTracked => SetKind::Read,
            TxTag::WriteTracked => SetKind::Write,
        };
        if !self.allow[set.index()][level.index()] {
            return EvictionVerdict::Deny;
        }
        // only the signature summarizes reads once the last tagged copy is gone
        if set == SetKind::Read && level == CacheLevel::L2 && !self.precise_reads {
            return EvictionVerdict::AllowButAbort;
        }
        EvictionVerdict::Allow
    }
}
