use std::collections::{BTreeMap, BTreeSet};

use crate::htm::cache::hash_u64;
use crate::htm::types::{AbortCause, LineAddr, SetKind};

/// Progress of a tracked load under precise tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Executed,
    Retired,
    /// Invalidated by a remote writer before retiring; must be reloaded.
    Stale,
}

/// Fixed-width bloom signature. Membership may over-approximate, never
/// under-approximate.
#[derive(Debug, Clone)]
pub struct Signature {
    words: Vec<u64>,
    bits: usize,
    hashes: usize,
    set_bits: usize,
}

impl Signature {
    pub fn new(bits: usize, hashes: usize) -> Self {
        assert!(bits.is_power_of_two(), "signature bits must be a power of two");
        assert!(hashes > 0, "signature needs at least one hash");
        Self {
            words: vec![0; bits.div_ceil(64)],
            bits,
            hashes,
            set_bits: 0,
        }
    }

    fn positions(&self, line: LineAddr) -> impl Iterator<Item = usize> + '_ {
        let mask = (self.bits - 1) as u64;
        (0..self.hashes as u64)
            .map(move |i| (hash_u64(line.wrapping_add(i.wrapping_mul(0x9e37_79b9_7f4a_7c15))) & mask) as usize)
    }

    pub fn insert(&mut self, line: LineAddr) {
        let positions: Vec<usize> = self.positions(line).collect();
        for pos in positions {
            let (word, bit) = (pos / 64, pos % 64);
            if self.words[word] & (1 << bit) == 0 {
                self.words[word] |= 1 << bit;
                self.set_bits += 1;
            }
        }
    }

    pub fn contains(&self, line: LineAddr) -> bool {
        self.positions(line)
            .all(|pos| self.words[pos / 64] & (1 << (pos % 64)) != 0)
    }

    /// Any shared bit counts as an overlap.
    pub fn intersects(&self, other: &Signature) -> bool {
        debug_assert_eq!(self.bits, other.bits);
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn fill_ratio(&self) -> f64 {
        self.set_bits as f64 / self.bits as f64
    }

    pub fn is_empty(&self) -> bool {
        self.set_bits == 0
    }
}

#[derive(Debug, Clone)]
pub enum ReadSet {
    Precise(BTreeMap<LineAddr, ReadState>),
    Imprecise(Signature),
}

impl ReadSet {
    pub fn contains(&self, line: LineAddr) -> bool {
        match self {
            Self::Precise(lines) => lines
                .get(&line)
                .is_some_and(|state| *state != ReadState::Stale),
            Self::Imprecise(sig) => sig.contains(line),
        }
    }

    pub fn intersects(&self, other: &ReadSet) -> bool {
        match (self, other) {
            (Self::Imprecise(a), Self::Imprecise(b)) => a.intersects(b),
            (Self::Precise(lines), other) | (other, Self::Precise(lines)) => lines
                .iter()
                .any(|(line, state)| *state != ReadState::Stale && other.contains(*line)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Precise(lines) => lines.is_empty(),
            Self::Imprecise(sig) => sig.is_empty(),
        }
    }
}

/// Read- and write-set of one transaction attempt. The write-set is always
/// exact; the read-set is exact or a signature depending on the run's
/// tracking mode. Every written line is also read-tracked.
#[derive(Debug, Clone)]
pub struct ReadWriteSet {
    read: ReadSet,
    write: BTreeSet<LineAddr>,
    saturation: f64,
}

impl ReadWriteSet {
    pub fn precise() -> Self {
        Self {
            read: ReadSet::Precise(BTreeMap::new()),
            write: BTreeSet::new(),
            saturation: 1.0,
        }
    }

    pub fn imprecise(bits: usize, hashes: usize, saturation: f64) -> Self {
        Self {
            read: ReadSet::Imprecise(Signature::new(bits, hashes)),
            write: BTreeSet::new(),
            saturation,
        }
    }

    /// Add `line` to the set of `kind`. Idempotent. A saturated signature
    /// reports a capacity abort.
    pub fn track(&mut self, line: LineAddr, kind: SetKind) -> Result<(), AbortCause> {
        if kind == SetKind::Write {
            self.write.insert(line);
        }
        match &mut self.read {
            ReadSet::Precise(lines) => {
                let entry = lines.entry(line).or_insert(ReadState::Executed);
                if kind == SetKind::Write || *entry == ReadState::Stale {
                    *entry = ReadState::Retired;
                }
                Ok(())
            }
            ReadSet::Imprecise(sig) => {
                sig.insert(line);
                if sig.fill_ratio() > self.saturation {
                    Err(AbortCause::ReadSetCapacity)
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn contains(&self, line: LineAddr, kind: SetKind) -> bool {
        match kind {
            SetKind::Write => self.write.contains(&line),
            SetKind::Read => self.read.contains(line),
        }
    }

    /// Strongest set holding `line`, if any.
    pub fn holds(&self, line: LineAddr) -> Option<SetKind> {
        if self.write.contains(&line) {
            Some(SetKind::Write)
        } else if self.read.contains(line) {
            Some(SetKind::Read)
        } else {
            None
        }
    }

    /// True if any address (or signature bit) overlaps between the two
    /// transactions' footprints.
    pub fn intersects(&self, other: &ReadWriteSet) -> bool {
        self.read.intersects(&other.read)
            || self.write.iter().any(|line| other.holds(*line).is_some())
            || other.write.iter().any(|line| self.holds(*line).is_some())
    }

    /// First of `self`'s written lines that `other` has read or written.
    pub fn write_overlap(&self, other: &ReadWriteSet) -> Option<(LineAddr, SetKind)> {
        self.write
            .iter()
            .find_map(|line| other.holds(*line).map(|kind| (*line, kind)))
    }

    pub fn read_state(&self, line: LineAddr) -> Option<ReadState> {
        match &self.read {
            ReadSet::Precise(lines) => lines.get(&line).copied(),
            ReadSet::Imprecise(_) => None,
        }
    }

    /// Flag a not-yet-retired load as stale. Only possible under precise
    /// tracking and only for lines the transaction has not written.
    pub fn mark_stale(&mut self, line: LineAddr) -> bool {
        if self.write.contains(&line) {
            return false;
        }
        match &mut self.read {
            ReadSet::Precise(lines) => match lines.get_mut(&line) {
                Some(state) if *state == ReadState::Executed => {
                    *state = ReadState::Stale;
                    true
                }
                _ => false,
            },
            ReadSet::Imprecise(_) => false,
        }
    }

    /// Retire every executed load. Returns the lines whose loads went stale
    /// in the meantime; those stay stale until tracked again.
    pub fn retire_loads(&mut self) -> Vec<LineAddr> {
        let mut stale = Vec::new();
        if let ReadSet::Precise(lines) = &mut self.read {
            for (line, state) in lines.iter_mut() {
                match state {
                    ReadState::Executed => *state = ReadState::Retired,
                    ReadState::Stale => stale.push(*line),
                    ReadState::Retired => {}
                }
            }
        }
        stale
    }

    pub fn is_empty(&self) -> bool {
        self.write.is_empty() && self.read.is_empty()
    }
}
