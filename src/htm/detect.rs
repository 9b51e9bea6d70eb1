use smallvec::SmallVec;

use crate::htm::config::DetectionMode;
use crate::htm::rwset::ReadWriteSet;
use crate::htm::types::{AccessKind, Addr, CoreId, LineAddr, SetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Access,
    Commit,
}

/// A transaction whose footprint overlaps the requester's access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub core: CoreId,
    pub set: SetKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Byte address of the access; the line address for commit conflicts.
    pub addr: Addr,
    pub line: LineAddr,
    pub requester: CoreId,
    pub access: AccessKind,
    pub holders: SmallVec<[Holder; 4]>,
    pub phase: Phase,
}

impl Conflict {
    pub fn holder_cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.holders.iter().map(|h| h.core)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    mode: DetectionMode,
}

impl ConflictDetector {
    pub fn new(mode: DetectionMode) -> Self {
        Self { mode }
    }

    /// Non-transactional accesses are always checked; transactional ones
    /// only under eager detection.
    pub fn checks_access(&self, transactional: bool) -> bool {
        !transactional || self.mode == DetectionMode::Eager
    }

    pub fn checks_commit(&self) -> bool {
        self.mode == DetectionMode::Lazy
    }

    /// Classify an access against every other open transaction. Read-read
    /// overlap is not a conflict.
    pub fn check_access<'a>(
        &self,
        requester: CoreId,
        addr: Addr,
        line: LineAddr,
        access: AccessKind,
        open: impl IntoIterator<Item = (CoreId, &'a ReadWriteSet)>,
    ) -> Option<Conflict> {
        let holders: SmallVec<[Holder; 4]> = open
            .into_iter()
            .filter(|(core, _)| *core != requester)
            .filter_map(|(core, sets)| {
                let set = sets.holds(line)?;
                (access.is_write() || set == SetKind::Write).then_some(Holder { core, set })
            })
            .collect();
        (!holders.is_empty()).then(|| Conflict {
            addr,
            line,
            requester,
            access,
            holders,
            phase: Phase::Access,
        })
    }

    /// Lazy validation: the committer's write-set against every other open
    /// transaction's read- and write-set.
    pub fn check_commit<'a>(
        &self,
        committer: CoreId,
        writes: &ReadWriteSet,
        open: impl IntoIterator<Item = (CoreId, &'a ReadWriteSet)>,
    ) -> Option<Conflict> {
        let mut first_line = None;
        let holders: SmallVec<[Holder; 4]> = open
            .into_iter()
            .filter(|(core, _)| *core != committer)
            .filter_map(|(core, sets)| {
                let (line, set) = writes.write_overlap(sets)?;
                first_line.get_or_insert(line);
                Some(Holder { core, set })
            })
            .collect();
        let line = first_line?;
        Some(Conflict {
            addr: line,
            line,
            requester: committer,
            access: AccessKind::Write,
            holders,
            phase: Phase::Commit,
        })
    }
}
