use std::collections::{BTreeMap, HashSet};

use crate::htm::config::VersioningMode;
use crate::htm::memory::SharedMemory;
use crate::htm::types::Addr;

/// Old values captured before in-place writes. Only the first value seen
/// per address is kept; that is the pre-transaction value.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<(Addr, u64)>,
    logged: HashSet<Addr>,
}

impl UndoLog {
    pub fn record(&mut self, addr: Addr, old: u64) {
        if self.logged.insert(addr) {
            self.entries.push((addr, old));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unroll(&mut self, memory: &mut SharedMemory) {
        for (addr, old) in self.entries.drain(..).rev() {
            memory.write(addr, old);
        }
        self.logged.clear();
    }

    fn discard(&mut self) {
        self.entries.clear();
        self.logged.clear();
    }

    fn addrs(&self) -> impl Iterator<Item = Addr> + '_ {
        self.entries.iter().map(|(addr, _)| *addr)
    }
}

/// Speculative values held back from shared memory until commit.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    values: BTreeMap<Addr, u64>,
}

impl WriteBuffer {
    pub fn record(&mut self, addr: Addr, new: u64) {
        self.values.insert(addr, new);
    }

    pub fn get(&self, addr: Addr) -> Option<u64> {
        self.values.get(&addr).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-transaction speculative data: an undo log under eager versioning, a
/// write buffer under lazy versioning.
#[derive(Debug)]
pub enum VersionStore {
    Lazy(WriteBuffer),
    Eager(UndoLog),
}

impl VersionStore {
    pub fn new(mode: VersioningMode) -> Self {
        match mode {
            VersioningMode::Lazy => Self::Lazy(WriteBuffer::default()),
            VersioningMode::Eager => Self::Eager(UndoLog::default()),
        }
    }

    pub fn mode(&self) -> VersioningMode {
        match self {
            Self::Lazy(_) => VersioningMode::Lazy,
            Self::Eager(_) => VersioningMode::Eager,
        }
    }

    /// Eager only: remember the value about to be overwritten in place.
    pub fn record_old_value(&mut self, addr: Addr, old: u64) {
        match self {
            Self::Eager(log) => log.record(addr, old),
            Self::Lazy(_) => debug_assert!(false, "undo log entry under lazy versioning"),
        }
    }

    /// Lazy only: buffer a speculative value.
    pub fn record_new_value(&mut self, addr: Addr, new: u64) {
        match self {
            Self::Lazy(buffer) => buffer.record(addr, new),
            Self::Eager(_) => debug_assert!(false, "write buffer entry under eager versioning"),
        }
    }

    /// Value the owning transaction observes at `addr`, forwarding its own
    /// buffered writes.
    pub fn read(&self, addr: Addr, memory: &SharedMemory) -> u64 {
        match self {
            Self::Lazy(buffer) => buffer.get(addr).unwrap_or_else(|| memory.read(addr)),
            Self::Eager(_) => memory.read(addr),
        }
    }

    pub fn write(&mut self, addr: Addr, value: u64, memory: &mut SharedMemory) {
        match self.mode() {
            VersioningMode::Lazy => self.record_new_value(addr, value),
            VersioningMode::Eager => {
                self.record_old_value(addr, memory.read(addr));
                memory.write(addr, value);
            }
        }
    }

    /// Make the transaction's writes durable. Returns the written addresses.
    pub fn commit(&mut self, memory: &mut SharedMemory) -> Vec<Addr> {
        match self {
            Self::Lazy(buffer) => {
                let values = std::mem::take(&mut buffer.values);
                let addrs = values.keys().copied().collect();
                for (addr, value) in values {
                    memory.write(addr, value);
                }
                addrs
            }
            Self::Eager(log) => {
                let addrs = log.addrs().collect();
                log.discard();
                addrs
            }
        }
    }

    /// Restore every address this transaction touched to its
    /// pre-transaction value.
    pub fn abort(&mut self, memory: &mut SharedMemory) {
        match self {
            Self::Lazy(buffer) => buffer.values.clear(),
            Self::Eager(log) => log.unroll(memory),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Lazy(buffer) => buffer.is_empty(),
            Self::Eager(log) => log.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(values: &[(Addr, u64)]) -> SharedMemory {
        let mut mem = SharedMemory::new();
        for &(addr, value) in values {
            mem.write(addr, value);
        }
        mem
    }

    #[test]
    fn lazy_writes_invisible_until_commit() {
        let mut mem = memory_with(&[(0x10, 1)]);
        let mut store = VersionStore::new(VersioningMode::Lazy);
        store.write(0x10, 2, &mut mem);
        assert_eq!(mem.read(0x10), 1);
        assert_eq!(store.read(0x10, &mem), 2);
        assert_eq!(store.commit(&mut mem), vec![0x10]);
        assert_eq!(mem.read(0x10), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn lazy_abort_discards_buffer() {
        let mut mem = memory_with(&[(0x10, 1)]);
        let mut store = VersionStore::new(VersioningMode::Lazy);
        store.write(0x10, 5, &mut mem);
        store.abort(&mut mem);
        assert_eq!(mem.read(0x10), 1);
        assert_eq!(store.read(0x10, &mem), 1);
    }

    #[test]
    fn eager_writes_in_place() {
        let mut mem = memory_with(&[(0x10, 1)]);
        let mut store = VersionStore::new(VersioningMode::Eager);
        store.write(0x10, 9, &mut mem);
        assert_eq!(mem.read(0x10), 9);
        store.commit(&mut mem);
        assert_eq!(mem.read(0x10), 9);
    }

    #[test]
    fn eager_abort_restores_first_value_for_repeated_writes() {
        let mut mem = memory_with(&[(0x10, 1), (0x18, 4)]);
        let mut store = VersionStore::new(VersioningMode::Eager);
        store.write(0x10, 2, &mut mem);
        store.write(0x18, 5, &mut mem);
        store.write(0x10, 3, &mut mem);
        store.abort(&mut mem);
        assert_eq!(mem.read(0x10), 1);
        assert_eq!(mem.read(0x18), 4);
        assert!(store.is_empty());
    }

    #[test]
    fn lazy_last_write_wins() {
        let mut mem = SharedMemory::new();
        let mut store = VersionStore::new(VersioningMode::Lazy);
        store.record_new_value(0x20, 1);
        store.record_new_value(0x20, 2);
        store.commit(&mut mem);
        assert_eq!(mem.read(0x20), 2);
    }
}
