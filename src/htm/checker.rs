use std::collections::{BTreeMap, BTreeSet};

use log::error;

use crate::htm::memory::SharedMemory;
use crate::htm::types::{AccessKind, Addr, CoreId, LineAddr, SetKind};

#[derive(Debug, Default, Clone)]
struct Footprint {
    read: BTreeSet<LineAddr>,
    write: BTreeSet<LineAddr>,
}

impl Footprint {
    fn holds(&self, line: LineAddr) -> Option<SetKind> {
        if self.write.contains(&line) {
            Some(SetKind::Write)
        } else if self.read.contains(&line) {
            Some(SetKind::Read)
        } else {
            None
        }
    }
}

/// Exact per-core line sets kept beside the tracked read- and write-sets.
/// Signatures play no part here.
#[derive(Debug, Clone)]
pub struct IsolationChecker {
    cores: Vec<Option<Footprint>>,
}

impl IsolationChecker {
    pub fn new(num_cores: usize) -> Self {
        Self {
            cores: vec![None; num_cores],
        }
    }

    pub fn begin(&mut self, core: CoreId) {
        self.cores[core] = Some(Footprint::default());
    }

    pub fn end(&mut self, core: CoreId) {
        self.cores[core] = None;
    }

    pub fn record(&mut self, core: CoreId, line: LineAddr, kind: AccessKind) {
        let Some(fp) = self.cores[core].as_mut() else {
            return;
        };
        fp.read.insert(line);
        if kind.is_write() {
            fp.write.insert(line);
        }
    }

    /// A load that went stale no longer counts as read.
    pub fn forget_read(&mut self, core: CoreId, line: LineAddr) {
        if let Some(fp) = self.cores[core].as_mut() {
            if !fp.write.contains(&line) {
                fp.read.remove(&line);
            }
        }
    }

    fn holders(&self, core: CoreId) -> impl Iterator<Item = (CoreId, &Footprint)> + '_ {
        self.cores
            .iter()
            .enumerate()
            .filter(move |(other, _)| *other != core)
            .filter_map(|(other, fp)| fp.as_ref().map(|fp| (other, fp)))
    }

    /// Panics if another open transaction still holds `line` in a set that
    /// conflicts with `core`'s completed access.
    pub fn check_access(&self, core: CoreId, line: LineAddr, kind: AccessKind) {
        for (other, fp) in self.holders(core) {
            let Some(set) = fp.holds(line) else {
                continue;
            };
            if kind.is_write() || set == SetKind::Write {
                error!(
                    "core {} {:?} of line {:#x} overlaps core {} {:?}-set",
                    core, kind, line, other, set
                );
                panic!(
                    "isolation violation: core {} {:?} line {:#x} held by core {}",
                    core, kind, line, other
                );
            }
        }
    }

    /// Panics if any line `core` is about to publish is still held by
    /// another open transaction.
    pub fn check_commit(&self, core: CoreId) {
        let Some(mine) = self.cores[core].as_ref() else {
            return;
        };
        for line in &mine.write {
            self.check_access(core, *line, AccessKind::Write);
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Observed {
    reads: BTreeMap<Addr, u64>,
    /// Memory contents before the first transactional store.
    writes: BTreeMap<Addr, u64>,
}

/// Remembers the values each transaction consumed and overwrote, then
/// holds memory to them when the transaction ends.
#[derive(Debug, Clone)]
pub struct ValueChecker {
    cores: Vec<Observed>,
}

impl ValueChecker {
    pub fn new(num_cores: usize) -> Self {
        Self {
            cores: vec![Observed::default(); num_cores],
        }
    }

    pub fn begin(&mut self, core: CoreId) {
        self.cores[core] = Observed::default();
    }

    /// Loads of words the transaction already wrote see its own data and
    /// are skipped.
    pub fn record_read(&mut self, core: CoreId, addr: Addr, value: u64) {
        let obs = &mut self.cores[core];
        if !obs.writes.contains_key(&addr) {
            obs.reads.entry(addr).or_insert(value);
        }
    }

    pub fn record_write(&mut self, core: CoreId, addr: Addr, before: u64) {
        self.cores[core].writes.entry(addr).or_insert(before);
    }

    /// Every word the committing transaction read must still hold the
    /// value it saw. Call before the write-set is published.
    pub fn check_publish(&mut self, core: CoreId, memory: &SharedMemory) {
        let obs = std::mem::take(&mut self.cores[core]);
        for (addr, seen) in obs.reads {
            if obs.writes.contains_key(&addr) {
                continue;
            }
            let now = memory.read(addr);
            if now != seen {
                error!("core {} read {:#x}={} but commits against {}", core, addr, seen, now);
                panic!(
                    "value mismatch at commit: core {} addr {:#x} read {} memory {}",
                    core, addr, seen, now
                );
            }
        }
    }

    /// After an undo-log unroll every overwritten word must be back to its
    /// pre-transaction value.
    pub fn check_unroll(&mut self, core: CoreId, memory: &SharedMemory) {
        let obs = std::mem::take(&mut self.cores[core]);
        for (addr, before) in obs.writes {
            let now = memory.read(addr);
            if now != before {
                error!("core {} unroll left {:#x}={} instead of {}", core, addr, now, before);
                panic!(
                    "value mismatch after unroll: core {} addr {:#x} restored {} logged {}",
                    core, addr, now, before
                );
            }
        }
    }

    pub fn end(&mut self, core: CoreId) {
        self.cores[core] = Observed::default();
    }
}
