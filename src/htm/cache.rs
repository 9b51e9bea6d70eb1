use serde::Deserialize;

use crate::htm::evict::{EvictionPolicyGate, EvictionVerdict};
use crate::htm::types::{AbortCause, AccessKind, Addr, CacheLevel, LineAddr, SetKind};
use crate::sim::config::Config;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub line_bytes: u64,
    pub l0_sets: usize,
    pub l0_ways: usize,
    pub l1_sets: usize,
    pub l1_ways: usize,
    pub l2_sets: usize,
    pub l2_ways: usize,
}

impl Config for CacheConfig {}

impl Default for CacheConfig {
    fn default() -> Self {
        let s = Self {
            line_bytes: 64,
            l0_sets: 64,
            l0_ways: 4,
            l1_sets: 512,
            l1_ways: 4,
            l2_sets: 512,
            l2_ways: 8,
        };
        s.ensure_valid();
        s
    }
}

impl CacheConfig {
    pub fn ensure_valid(&self) {
        assert!(self.line_bytes > 0, "line_bytes must be > 0");
        assert!(self.l0_sets > 0, "l0_sets must be > 0");
        assert!(self.l1_sets > 0, "l1_sets must be > 0");
        assert!(self.l2_sets > 0, "l2_sets must be > 0");
        assert!(self.l0_ways > 0, "l0_ways must be > 0");
        assert!(self.l1_ways > 0, "l1_ways must be > 0");
        assert!(self.l2_ways > 0, "l2_ways must be > 0");
    }

    pub fn geometry(&self, level: CacheLevel) -> (usize, usize) {
        match level {
            CacheLevel::L0 => (self.l0_sets, self.l0_ways),
            CacheLevel::L1 => (self.l1_sets, self.l1_ways),
            CacheLevel::L2 => (self.l2_sets, self.l2_ways),
        }
    }

    pub fn line_addr(&self, addr: Addr) -> LineAddr {
        addr / self.line_bytes
    }
}

pub(crate) fn hash_u64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

/// Coherence state of a resident line. Absence from the array is Invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coherence {
    Shared,
    Exclusive,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxTag {
    Untouched,
    ReadTracked,
    WriteTracked,
}

impl TxTag {
    fn with(self, set: Option<SetKind>) -> Self {
        let other = match set {
            None => Self::Untouched,
            Some(SetKind::Read) => Self::ReadTracked,
            Some(SetKind::Write) => Self::WriteTracked,
        };
        self.max(other)
    }

    pub fn is_tracked(self) -> bool {
        self != Self::Untouched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLine {
    pub line: LineAddr,
    pub state: Coherence,
    pub tag: TxTag,
}

#[derive(Debug)]
pub(crate) struct TagArray {
    sets: usize,
    lines: Vec<Vec<Option<CacheLine>>>,
    lru: Vec<Vec<usize>>,
}

impl TagArray {
    pub(crate) fn new(sets: usize, ways: usize) -> Self {
        let sets = sets.max(1);
        let ways = ways.max(1);
        let mut lines = Vec::with_capacity(sets);
        let mut lru = Vec::with_capacity(sets);
        for _ in 0..sets {
            lines.push(vec![None; ways]);
            lru.push((0..ways).collect());
        }
        Self {
            sets,
            lines,
            lru,
        }
    }

    fn set_of(&self, line: LineAddr) -> usize {
        (line as usize) % self.sets
    }

    fn way_of(&self, line: LineAddr) -> Option<usize> {
        self.lines[self.set_of(line)]
            .iter()
            .position(|entry| entry.is_some_and(|e| e.line == line))
    }

    pub(crate) fn probe(&mut self, line: LineAddr) -> Option<&mut CacheLine> {
        let set_idx = self.set_of(line);
        let way = self.way_of(line)?;
        self.touch(set_idx, way);
        self.lines[set_idx][way].as_mut()
    }

    pub(crate) fn peek(&self, line: LineAddr) -> Option<&CacheLine> {
        let way = self.way_of(line)?;
        self.lines[self.set_of(line)][way].as_ref()
    }

    fn peek_mut(&mut self, line: LineAddr) -> Option<&mut CacheLine> {
        let way = self.way_of(line)?;
        let set_idx = self.set_of(line);
        self.lines[set_idx][way].as_mut()
    }

    /// Ways of the set `line` maps to, least recently used first.
    fn lru_order(&self, line: LineAddr) -> impl Iterator<Item = usize> + '_ {
        self.lru[self.set_of(line)].iter().rev().copied()
    }

    fn free_way(&self, line: LineAddr) -> Option<usize> {
        self.lines[self.set_of(line)].iter().position(|e| e.is_none())
    }

    fn entry(&self, line: LineAddr, way: usize) -> Option<&CacheLine> {
        self.lines[self.set_of(line)][way].as_ref()
    }

    fn install(&mut self, way: usize, new: CacheLine) -> Option<CacheLine> {
        let set_idx = self.set_of(new.line);
        let old = self.lines[set_idx][way].replace(new);
        self.touch(set_idx, way);
        old
    }

    pub(crate) fn remove(&mut self, line: LineAddr) -> Option<CacheLine> {
        let way = self.way_of(line)?;
        let set_idx = self.set_of(line);
        self.lines[set_idx][way].take()
    }

    fn retain(&mut self, mut keep: impl FnMut(&CacheLine) -> bool) {
        for set in self.lines.iter_mut() {
            for entry in set.iter_mut() {
                if entry.is_some_and(|e| !keep(&e)) {
                    *entry = None;
                }
            }
        }
    }

    fn for_each_mut(&mut self, mut f: impl FnMut(&mut CacheLine)) {
        for entry in self.lines.iter_mut().flatten().flatten() {
            f(entry);
        }
    }

    fn touch(&mut self, set_idx: usize, way: usize) {
        let order = &mut self.lru[set_idx];
        if let Some(pos) = order.iter().position(|&idx| idx == way) {
            order.remove(pos);
        }
        order.insert(0, way);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FillReport {
    /// Tagged lines the gate let go while making room.
    pub tracked_evictions: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoteReadEffect {
    pub downgraded: bool,
    /// Set when the owner lost a tagged L0 copy it was not allowed to lose.
    pub owner_abort: Option<AbortCause>,
}

/// One core's inclusive L0 ⊂ L1 ⊂ L2 tag hierarchy.
#[derive(Debug)]
pub struct CacheHierarchy {
    levels: [TagArray; 3],
    trans_aware_l0: bool,
}

impl CacheHierarchy {
    pub fn new(config: &CacheConfig, trans_aware_l0: bool) -> Self {
        let array = |level| {
            let (sets, ways) = config.geometry(level);
            TagArray::new(sets, ways)
        };
        Self {
            levels: [array(CacheLevel::L0), array(CacheLevel::L1), array(CacheLevel::L2)],
            trans_aware_l0,
        }
    }

    pub fn line(&self, level: CacheLevel, line: LineAddr) -> Option<&CacheLine> {
        self.levels[level.index()].peek(line)
    }

    pub fn contains(&self, line: LineAddr) -> bool {
        self.levels[CacheLevel::L2.index()].peek(line).is_some()
    }

    /// Bring `line` into every level for an access by this core. Fills go
    /// from L2 outward so inclusion holds at each step. `track` tags the
    /// line with the access's set; `exclusive` says no other core holds it.
    pub fn access(
        &mut self,
        line: LineAddr,
        kind: AccessKind,
        track: bool,
        exclusive: bool,
        gate: &EvictionPolicyGate,
    ) -> Result<FillReport, AbortCause> {
        let set = track.then(|| SetKind::from(kind));
        let mut state = match (kind, exclusive) {
            (AccessKind::Write, _) => Coherence::Modified,
            (AccessKind::Read, true) => Coherence::Exclusive,
            (AccessKind::Read, false) => Coherence::Shared,
        };
        let mut report = FillReport::default();
        let mut doomed = None;

        for level in [CacheLevel::L2, CacheLevel::L1, CacheLevel::L0] {
            if let Some(entry) = self.levels[level.index()].probe(line) {
                if kind.is_write() {
                    entry.state = Coherence::Modified;
                }
                entry.tag = entry.tag.with(set);
                state = entry.state;
                continue;
            }
            let (way, verdict) = self.choose_victim(level, line, gate)?;
            let fresh = CacheLine {
                line,
                state,
                tag: TxTag::Untouched.with(set),
            };
            if let Some(old) = self.levels[level.index()].install(way, fresh) {
                if old.tag.is_tracked() {
                    report.tracked_evictions += 1;
                }
                for shallower in CacheLevel::ALL.iter().filter(|l| **l < level) {
                    self.levels[shallower.index()].remove(old.line);
                }
                if verdict == EvictionVerdict::AllowButAbort {
                    doomed = Some(level.capacity_cause());
                }
            }
        }
        match doomed {
            Some(cause) => Err(cause),
            None => Ok(report),
        }
    }

    fn choose_victim(
        &self,
        level: CacheLevel,
        line: LineAddr,
        gate: &EvictionPolicyGate,
    ) -> Result<(usize, EvictionVerdict), AbortCause> {
        let array = &self.levels[level.index()];
        if let Some(way) = array.free_way(line) {
            return Ok((way, EvictionVerdict::Allow));
        }
        if level == CacheLevel::L0 && self.trans_aware_l0 {
            let untouched = array
                .lru_order(line)
                .find(|&way| array.entry(line, way).is_some_and(|e| !e.tag.is_tracked()));
            if let Some(way) = untouched {
                return Ok((way, EvictionVerdict::Allow));
            }
        }
        for way in array.lru_order(line) {
            let Some(victim) = array.entry(line, way) else {
                continue;
            };
            match gate.may_evict(victim, level) {
                EvictionVerdict::Deny => continue,
                verdict => return Ok((way, verdict)),
            }
        }
        Err(level.capacity_cause())
    }

    /// Another core issued a shared read for `line`. An E/M copy in L0 is
    /// downgraded in place when `downgrade` is set, otherwise invalidated.
    pub fn remote_read(
        &mut self,
        line: LineAddr,
        downgrade: bool,
        gate: &EvictionPolicyGate,
    ) -> RemoteReadEffect {
        let mut effect = RemoteReadEffect::default();
        let speculative = self
            .levels
            .iter()
            .any(|array| array.peek(line).is_some_and(|e| e.tag == TxTag::WriteTracked));
        if speculative {
            // buffered speculative data is never handed out
            return effect;
        }
        let l0 = &mut self.levels[CacheLevel::L0.index()];
        let owned = l0.peek(line).is_some_and(|e| e.state != Coherence::Shared);
        if owned && downgrade {
            effect.downgraded = true;
        } else if owned {
            if let Some(old) = l0.remove(line) {
                if gate.may_evict(&old, CacheLevel::L0) != EvictionVerdict::Allow {
                    effect.owner_abort = Some(CacheLevel::L0.capacity_cause());
                }
            }
        }
        for level in CacheLevel::ALL {
            if let Some(entry) = self.levels[level.index()].peek_mut(line) {
                entry.state = Coherence::Shared;
            }
        }
        effect
    }

    /// Another core's write became globally visible.
    pub fn remote_write(&mut self, line: LineAddr) {
        for array in self.levels.iter_mut() {
            array.remove(line);
        }
    }

    /// Drop every transactional tag; lines stay resident.
    pub fn clear_tags(&mut self) {
        for array in self.levels.iter_mut() {
            array.for_each_mut(|entry| entry.tag = TxTag::Untouched);
        }
    }

    /// Abort path: lines holding speculative data are invalidated, the rest
    /// lose their tags.
    pub fn discard_speculative(&mut self) {
        for array in self.levels.iter_mut() {
            array.retain(|entry| entry.tag != TxTag::WriteTracked);
        }
        self.clear_tags();
    }
}
