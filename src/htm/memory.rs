use std::collections::HashMap;

use crate::htm::types::Addr;

/// Globally visible memory, one 64-bit word per address. Anything never
/// written reads as zero.
#[derive(Debug, Default, Clone)]
pub struct SharedMemory {
    words: HashMap<Addr, u64>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, addr: Addr) -> u64 {
        self.words.get(&addr).copied().unwrap_or(0)
    }

    pub fn write(&mut self, addr: Addr, value: u64) {
        self.words.insert(addr, value);
    }

    /// Touch every word in `[base, base + bytes)` so later accesses find
    /// them already backed.
    pub fn prefault(&mut self, base: Addr, bytes: u64, stride: u64) {
        let stride = stride.max(1);
        let mut addr = base;
        while addr < base.saturating_add(bytes) {
            self.words.entry(addr).or_insert(0);
            addr = addr.saturating_add(stride);
        }
    }
}
