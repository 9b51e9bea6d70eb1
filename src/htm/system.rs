use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace, warn};
use smallvec::SmallVec;

use crate::htm::arbiter::CommitArbiter;
use crate::htm::cache::{CacheConfig, CacheHierarchy};
use crate::htm::checker::{IsolationChecker, ValueChecker};
use crate::htm::config::{ValidatedConfig, VersioningMode};
use crate::htm::detect::{Conflict, ConflictDetector, Phase};
use crate::htm::error::Abort;
use crate::htm::evict::EvictionPolicyGate;
use crate::htm::fallback::FallbackLock;
use crate::htm::memory::SharedMemory;
use crate::htm::resolve::{resolve, ConflictView, Decision};
use crate::htm::rwset::ReadWriteSet;
use crate::htm::stats::HtmStats;
use crate::htm::types::*;
use crate::htm::version::VersionStore;

/// One attempt of a transaction on one core.
#[derive(Debug)]
struct Transaction {
    id: TxnId,
    timestamp: Timestamp,
    state: TxnState,
    sets: ReadWriteSet,
    versions: VersionStore,
    possible_cycle: bool,
    last_load: Option<(Addr, u64)>,
    cause: Option<AbortCause>,
}

impl Transaction {
    fn new(id: TxnId, timestamp: Timestamp, config: &ValidatedConfig) -> Self {
        let sets = if config.precise_read_set_tracking {
            ReadWriteSet::precise()
        } else {
            ReadWriteSet::imprecise(
                config.signature_bits,
                config.signature_hashes,
                config.signature_saturation,
            )
        };
        Self {
            id,
            timestamp,
            state: TxnState::Active,
            sets,
            versions: VersionStore::new(config.versioning()),
            possible_cycle: false,
            last_load: None,
            cause: None,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, TxnState::Active | TxnState::Validating)
    }
}

#[derive(Debug)]
struct CoreSlot {
    txn: Option<Transaction>,
    caches: CacheHierarchy,
    stats: HtmStats,
}

#[derive(Debug)]
pub(crate) struct SystemState {
    memory: SharedMemory,
    cores: Vec<CoreSlot>,
    pub(crate) fallback: FallbackLock,
    arbiter: CommitArbiter,
    clock: Timestamp,
    next_txn: u64,
    isolation: Option<IsolationChecker>,
    values: Option<ValueChecker>,
}

impl SystemState {
    fn open_txn(&self, core: CoreId) -> Option<&Transaction> {
        self.cores[core].txn.as_ref().filter(|t| t.is_open())
    }

    fn open_txn_mut(&mut self, core: CoreId) -> Option<&mut Transaction> {
        self.cores[core].txn.as_mut().filter(|t| t.is_open())
    }

    fn open_sets(&self) -> impl Iterator<Item = (CoreId, &ReadWriteSet)> + '_ {
        self.cores
            .iter()
            .enumerate()
            .filter_map(|(core, slot)| {
                slot.txn
                    .as_ref()
                    .filter(|t| t.is_open())
                    .map(|t| (core, &t.sets))
            })
    }

    fn begin_checks(&mut self, core: CoreId) {
        if let Some(isolation) = self.isolation.as_mut() {
            isolation.begin(core);
        }
        if let Some(values) = self.values.as_mut() {
            values.begin(core);
        }
    }

    /// Error out if another core already aborted this core's transaction.
    fn check_doomed(&self, core: CoreId) -> Result<(), Abort> {
        match &self.cores[core].txn {
            Some(txn) if txn.is_open() => Ok(()),
            Some(txn) => Err(Abort::new(txn.cause.unwrap_or(AbortCause::Conflict))),
            None => panic!("core {} has no transaction", core),
        }
    }

    /// Unwind `victim`'s open transaction. Versions, cache tags and any
    /// commit-token request go in one step.
    pub(crate) fn abort_txn(&mut self, victim: CoreId, cause: AbortCause) {
        let SystemState {
            memory,
            cores,
            arbiter,
            isolation,
            values,
            ..
        } = self;
        let slot = &mut cores[victim];
        let Some(txn) = slot.txn.as_mut().filter(|t| t.is_open()) else {
            return;
        };
        txn.versions.abort(memory);
        if let Some(values) = values.as_mut() {
            match txn.versions.mode() {
                VersioningMode::Eager => values.check_unroll(victim, memory),
                VersioningMode::Lazy => values.end(victim),
            }
        }
        if let Some(isolation) = isolation.as_mut() {
            isolation.end(victim);
        }
        txn.state = TxnState::Aborted;
        txn.cause = Some(cause);
        slot.caches.discard_speculative();
        slot.stats.record_abort(cause);
        arbiter.release(victim);
        debug!("{} on core {} aborted: {}", txn.id, victim, cause);
    }

    /// A store became globally visible: drop every other core's copy.
    fn broadcast_store(&mut self, writer: CoreId, line: LineAddr) {
        for (core, slot) in self.cores.iter_mut().enumerate() {
            if core != writer {
                slot.caches.remote_write(line);
            }
        }
    }

    pub(crate) fn store_untracked(&mut self, core: CoreId, addr: Addr, line: LineAddr, value: u64) {
        self.memory.write(addr, value);
        self.broadcast_store(core, line);
    }

    fn publish(&mut self, core: CoreId, cache: &CacheConfig) {
        let SystemState {
            memory,
            cores,
            arbiter,
            isolation,
            values,
            ..
        } = self;
        let Some(txn) = cores[core].txn.as_mut() else {
            return;
        };
        if let Some(isolation) = isolation.as_mut() {
            isolation.check_commit(core);
            isolation.end(core);
        }
        if let Some(values) = values.as_mut() {
            values.check_publish(core, memory);
        }
        let mut lines: Vec<LineAddr> = txn
            .versions
            .commit(memory)
            .into_iter()
            .map(|addr| cache.line_addr(addr))
            .collect();
        txn.state = TxnState::Committed;
        let id = txn.id;
        lines.sort_unstable();
        lines.dedup();
        arbiter.release(core);
        cores[core].caches.clear_tags();
        cores[core].stats.record_commit();
        for line in &lines {
            self.broadcast_store(core, *line);
        }
        debug!("{} committed on core {}, {} lines published", id, core, lines.len());
    }
}

enum Settle {
    Proceed,
    Stall,
    AbortSelf,
}

/// Shared arbiter state for every simulated core. All decisions happen
/// under one mutex; stalled requesters, token waiters and fallback-lock
/// waiters park on `released`.
#[derive(Debug)]
pub struct HtmSystem {
    config: ValidatedConfig,
    cache_config: CacheConfig,
    detector: ConflictDetector,
    gate: EvictionPolicyGate,
    state: Mutex<SystemState>,
    released: Condvar,
}

impl HtmSystem {
    pub fn new(config: ValidatedConfig, cache_config: CacheConfig, num_cores: usize) -> Self {
        cache_config.ensure_valid();
        let cores = (0..num_cores)
            .map(|_| CoreSlot {
                txn: None,
                caches: CacheHierarchy::new(&cache_config, config.trans_aware_l0_replacements),
                stats: HtmStats::default(),
            })
            .collect();
        let state = SystemState {
            memory: SharedMemory::new(),
            cores,
            fallback: FallbackLock::new(config.fallback_lock_addr),
            arbiter: CommitArbiter::new(config.lazy_arbitration),
            clock: 0,
            next_txn: 0,
            isolation: config.isolation_checker.then(|| IsolationChecker::new(num_cores)),
            values: config.value_checker.then(|| ValueChecker::new(num_cores)),
        };
        Self {
            detector: ConflictDetector::new(config.detection()),
            gate: EvictionPolicyGate::new(&config),
            config,
            cache_config,
            state: Mutex::new(state),
            released: Condvar::new(),
        }
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn num_cores(&self) -> usize {
        self.lock().cores.len()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SystemState> {
        self.state.lock().expect("htm state poisoned")
    }

    pub(crate) fn wait<'a>(&'a self, st: MutexGuard<'a, SystemState>) -> MutexGuard<'a, SystemState> {
        let timeout = Duration::from_micros(self.config.stall_timeout_us.max(1));
        self.released
            .wait_timeout(st, timeout)
            .expect("htm state poisoned")
            .0
    }

    pub(crate) fn notify(&self) {
        self.released.notify_all();
    }

    pub(crate) fn line_of(&self, addr: Addr) -> LineAddr {
        self.cache_config.line_addr(addr)
    }

    fn cause_for(&self, line: LineAddr) -> AbortCause {
        if line == self.line_of(self.config.fallback_lock_addr) {
            AbortCause::FallbackLock
        } else {
            AbortCause::Conflict
        }
    }

    /// Begin timestamps; one per dynamic transaction, kept across retries.
    pub fn next_timestamp(&self) -> Timestamp {
        let mut st = self.lock();
        st.clock += 1;
        st.clock
    }

    /// Open a transaction on `core` and subscribe it to the fallback lock.
    pub fn begin(&self, core: CoreId, timestamp: Timestamp) -> Result<TxnId, Abort> {
        let mut st = self.lock();
        if let Some(txn) = &st.cores[core].txn {
            assert!(!txn.is_open(), "core {} is already inside {}", core, txn.id);
        }
        st.cores[core].txn = None;
        if self.config.disable_speculation {
            st.cores[core].stats.record_abort(AbortCause::SpeculationDisabled);
            return Err(Abort::new(AbortCause::SpeculationDisabled));
        }
        if st.fallback.is_held() {
            st.cores[core].stats.record_abort(AbortCause::FallbackLock);
            return Err(Abort::new(AbortCause::FallbackLock));
        }
        let id = TxnId(st.next_txn);
        st.next_txn += 1;
        st.cores[core].txn = Some(Transaction::new(id, timestamp, &self.config));
        st.begin_checks(core);
        trace!("{} begins on core {} at t={}", id, core, timestamp);

        let word = self.access(st, core, self.config.fallback_lock_addr, AccessKind::Read, 0, true)?;
        if word != 0 {
            return Err(self.abort(core, AbortCause::FallbackLock));
        }
        Ok(id)
    }

    pub fn read(&self, core: CoreId, addr: Addr) -> Result<u64, Abort> {
        let st = self.lock();
        self.access(st, core, addr, AccessKind::Read, 0, true)
    }

    pub fn write(&self, core: CoreId, addr: Addr, value: u64) -> Result<(), Abort> {
        let st = self.lock();
        self.access(st, core, addr, AccessKind::Write, value, true)
            .map(|_| ())
    }

    pub fn nontx_read(&self, core: CoreId, addr: Addr) -> u64 {
        let st = self.lock();
        debug_assert!(st.open_txn(core).is_none(), "core {} is transactional", core);
        match self.access(st, core, addr, AccessKind::Read, 0, false) {
            Ok(value) => value,
            Err(abort) => unreachable!("non-transactional read aborted: {}", abort),
        }
    }

    pub fn nontx_write(&self, core: CoreId, addr: Addr, value: u64) {
        let st = self.lock();
        debug_assert!(st.open_txn(core).is_none(), "core {} is transactional", core);
        if let Err(abort) = self.access(st, core, addr, AccessKind::Write, value, false) {
            unreachable!("non-transactional write aborted: {}", abort);
        }
    }

    pub fn commit(&self, core: CoreId) -> Result<(), Abort> {
        let mut st = self.lock();
        st.check_doomed(core)?;
        self.reload_stale(&mut st, core)?;
        if let Some(txn) = st.open_txn_mut(core) {
            txn.state = TxnState::Validating;
        }
        if self.detector.checks_commit() {
            st = self.validate(st, core)?;
        }
        st.publish(core, &self.cache_config);
        drop(st);
        self.notify();
        Ok(())
    }

    /// Abort this core's own transaction. Returns the cause that actually
    /// ended it, which differs from `cause` if another core got there first.
    pub fn abort(&self, core: CoreId, cause: AbortCause) -> Abort {
        let mut st = self.lock();
        let actual = match &st.cores[core].txn {
            Some(txn) if txn.is_open() => {
                st.abort_txn(core, cause);
                cause
            }
            Some(txn) => txn.cause.unwrap_or(cause),
            None => cause,
        };
        drop(st);
        self.notify();
        Abort::new(actual)
    }

    /// Return the core to idle. Yields the abort cause if the attempt
    /// ended in an abort.
    pub fn finish(&self, core: CoreId) -> Option<AbortCause> {
        let mut st = self.lock();
        if st.open_txn(core).is_some() {
            st.abort_txn(core, AbortCause::Explicit);
        }
        let txn = st.cores[core].txn.take()?;
        drop(st);
        self.notify();
        txn.cause
    }

    pub fn txn_state(&self, core: CoreId) -> TxnState {
        self.lock().cores[core]
            .txn
            .as_ref()
            .map_or(TxnState::Idle, |t| t.state)
    }

    pub fn is_tracked(&self, core: CoreId, addr: Addr, set: SetKind) -> bool {
        let line = self.line_of(addr);
        self.lock()
            .open_txn(core)
            .is_some_and(|t| t.sets.contains(line, set))
    }

    /// Committed contents of memory, bypassing detection.
    pub fn peek(&self, addr: Addr) -> u64 {
        self.lock().memory.read(addr)
    }

    pub fn prefault(&self, base: Addr, bytes: u64) {
        let stride = self.cache_config.line_bytes.min(8).max(1);
        self.lock().memory.prefault(base, bytes, stride);
    }

    pub fn stats(&self, core: CoreId) -> HtmStats {
        self.lock().cores[core].stats.clone()
    }

    pub fn total_stats(&self) -> HtmStats {
        let st = self.lock();
        let mut total = HtmStats::default();
        for slot in &st.cores {
            total += &slot.stats;
        }
        total
    }

    pub(crate) fn record_fallback(&self, core: CoreId) {
        self.lock().cores[core].stats.record_fallback();
    }

    fn access<'a>(
        &'a self,
        mut st: MutexGuard<'a, SystemState>,
        core: CoreId,
        addr: Addr,
        kind: AccessKind,
        value: u64,
        transactional: bool,
    ) -> Result<u64, Abort> {
        if transactional {
            st.check_doomed(core)?;
            self.reload_stale(&mut st, core)?;
        }
        let line = self.line_of(addr);
        let mut st = self.settle_access(st, core, addr, line, kind, transactional)?;
        self.perform(&mut st, core, addr, line, kind, value, transactional)
    }

    /// Run detection for an access and apply the resolver's decisions until
    /// the access may proceed. Nacked requesters park on the condvar; after
    /// `stall_limit` nacks the stall escalates.
    fn settle_access<'a>(
        &'a self,
        mut st: MutexGuard<'a, SystemState>,
        core: CoreId,
        addr: Addr,
        line: LineAddr,
        kind: AccessKind,
        transactional: bool,
    ) -> Result<MutexGuard<'a, SystemState>, Abort> {
        if !self.detector.checks_access(transactional) {
            return Ok(st);
        }
        if transactional {
            st.cores[core].stats.record_detector_invocation();
        }
        let mut nacks = 0;
        loop {
            if transactional {
                st.check_doomed(core)?;
            }
            let conflict = self
                .detector
                .check_access(core, addr, line, kind, st.open_sets());
            let Some(conflict) = conflict else {
                return Ok(st);
            };
            match self.settle(&mut st, &conflict) {
                Settle::Proceed => return Ok(st),
                Settle::AbortSelf => {
                    let cause = self.cause_for(line);
                    st.abort_txn(core, cause);
                    drop(st);
                    self.notify();
                    return Err(Abort::new(cause));
                }
                Settle::Stall => {
                    st.cores[core].stats.record_nack();
                    nacks += 1;
                    if nacks >= self.config.stall_limit {
                        st.cores[core].stats.record_stall_escalation();
                        warn!(
                            "core {} stalled {} times on line {:#x}, escalating",
                            core, nacks, line
                        );
                        let cause = self.cause_for(line);
                        if transactional {
                            st.abort_txn(core, cause);
                            drop(st);
                            self.notify();
                            return Err(Abort::new(cause));
                        }
                        for holder in conflict.holder_cores() {
                            st.abort_txn(holder, cause);
                        }
                        self.notify();
                        return Ok(st);
                    }
                    st = self.wait(st);
                }
            }
        }
    }

    /// Resolve one detected conflict holder by holder. Holders to abort are
    /// unwound before returning.
    fn settle(&self, st: &mut SystemState, conflict: &Conflict) -> Settle {
        let policy = self.config.conflict_resolution;
        let (requester_timestamp, requester_possible_cycle) = match st.open_txn(conflict.requester) {
            Some(txn) => (Some(txn.timestamp), txn.possible_cycle),
            None => (None, false),
        };
        let lock_line = self.line_of(self.config.fallback_lock_addr);
        let mut victims: SmallVec<[CoreId; 4]> = SmallVec::new();
        let mut stall = false;

        for holder in &conflict.holders {
            let Some(txn) = st.open_txn_mut(holder.core) else {
                continue;
            };
            if self.config.reload_if_stale
                && conflict.phase == Phase::Access
                && conflict.access.is_write()
                && holder.set == SetKind::Read
                && conflict.line != lock_line
                && txn.sets.mark_stale(conflict.line)
            {
                debug!("{} load of line {:#x} went stale", txn.id, conflict.line);
                if let Some(isolation) = st.isolation.as_mut() {
                    isolation.forget_read(holder.core, conflict.line);
                }
                continue;
            }
            let view = ConflictView {
                phase: conflict.phase,
                requester_core: conflict.requester,
                requester_timestamp,
                requester_writes: conflict.access.is_write(),
                requester_possible_cycle,
                holder_core: holder.core,
                holder_timestamp: txn.timestamp,
                holder_writes: holder.set == SetKind::Write,
            };
            let resolution = resolve(policy, &view);
            if resolution.holder_possible_cycle {
                txn.possible_cycle = true;
            }
            trace!(
                "core {} vs {} on line {:#x}: {:?}",
                conflict.requester,
                txn.id,
                conflict.line,
                resolution.decision
            );
            match resolution.decision {
                Decision::AbortHolder => victims.push(holder.core),
                Decision::AbortRequester => return Settle::AbortSelf,
                Decision::Nack => stall = true,
            }
        }

        if !victims.is_empty() {
            let cause = self.cause_for(conflict.line);
            for victim in victims {
                st.abort_txn(victim, cause);
            }
            self.notify();
        }
        if stall {
            Settle::Stall
        } else {
            Settle::Proceed
        }
    }

    /// Lazy detection: win the commit token, then check the write-set
    /// against every other open transaction.
    fn validate<'a>(
        &'a self,
        mut st: MutexGuard<'a, SystemState>,
        core: CoreId,
    ) -> Result<MutexGuard<'a, SystemState>, Abort> {
        while !st.arbiter.request(core) {
            st = self.wait(st);
            st.check_doomed(core)?;
        }
        st.cores[core].stats.record_detector_invocation();
        loop {
            st.check_doomed(core)?;
            let conflict = st.cores[core]
                .txn
                .as_ref()
                .and_then(|txn| self.detector.check_commit(core, &txn.sets, st.open_sets()));
            let Some(conflict) = conflict else {
                return Ok(st);
            };
            match self.settle(&mut st, &conflict) {
                Settle::Proceed => return Ok(st),
                Settle::AbortSelf => {
                    st.abort_txn(core, AbortCause::Conflict);
                    drop(st);
                    self.notify();
                    return Err(Abort::new(AbortCause::Conflict));
                }
                Settle::Stall => st = self.wait(st),
            }
        }
    }

    /// Retire outstanding loads. A load that went stale is reissued through
    /// detection; if the value moved underneath it the transaction aborts.
    fn reload_stale(&self, st: &mut SystemState, core: CoreId) -> Result<(), Abort> {
        let Some(txn) = st.open_txn_mut(core) else {
            return Ok(());
        };
        let stale = txn.sets.retire_loads();
        let Some((addr, seen)) = txn.last_load else {
            return Ok(());
        };
        let line = self.line_of(addr);
        if !stale.contains(&line) {
            return Ok(());
        }
        st.cores[core].stats.record_stale_reload();
        st.cores[core].stats.record_detector_invocation();
        if let Some(conflict) =
            self.detector
                .check_access(core, addr, line, AccessKind::Read, st.open_sets())
        {
            if let Settle::AbortSelf = self.settle(st, &conflict) {
                st.abort_txn(core, AbortCause::ConflictStale);
                self.notify();
                return Err(Abort::new(AbortCause::ConflictStale));
            }
        }
        let now = self.perform(st, core, addr, line, AccessKind::Read, 0, true)?;
        if now != seen {
            st.abort_txn(core, AbortCause::ConflictStale);
            self.notify();
            return Err(Abort::new(AbortCause::ConflictStale));
        }
        Ok(())
    }

    /// Carry out an access that detection let through: set tracking, cache
    /// fills, remote coherence effects, then the data itself.
    #[allow(clippy::too_many_arguments)]
    fn perform(
        &self,
        st: &mut SystemState,
        core: CoreId,
        addr: Addr,
        line: LineAddr,
        kind: AccessKind,
        value: u64,
        transactional: bool,
    ) -> Result<u64, Abort> {
        if transactional {
            st.check_doomed(core)?;
            if let Some(txn) = st.open_txn_mut(core) {
                if let Err(cause) = txn.sets.track(line, kind.into()) {
                    return Err(self.abort_locked(st, core, cause));
                }
            }
        }

        // Transactional loads are filled shared.
        let exclusive = !transactional
            && !st
                .cores
                .iter()
                .enumerate()
                .any(|(other, slot)| other != core && slot.caches.contains(line));
        match st.cores[core]
            .caches
            .access(line, kind, transactional, exclusive, &self.gate)
        {
            Ok(report) => st.cores[core]
                .stats
                .record_tracked_evictions(report.tracked_evictions),
            Err(cause) if transactional => return Err(self.abort_locked(st, core, cause)),
            Err(cause) => warn!("untracked fill on core {} reported {}", core, cause),
        }

        if kind == AccessKind::Read {
            let downgrade = self.config.l0_downgrade_on_l1_gets;
            for other in 0..st.cores.len() {
                if other == core {
                    continue;
                }
                let effect = st.cores[other].caches.remote_read(line, downgrade, &self.gate);
                if effect.downgraded {
                    st.cores[other].stats.record_l0_downgrade();
                }
                if let Some(cause) = effect.owner_abort {
                    st.abort_txn(other, cause);
                    self.notify();
                }
            }
        }

        if !transactional {
            return Ok(match kind {
                AccessKind::Read => st.memory.read(addr),
                AccessKind::Write => {
                    st.store_untracked(core, addr, line, value);
                    value
                }
            });
        }
        let SystemState {
            memory,
            cores,
            values,
            ..
        } = &mut *st;
        let Some(txn) = cores[core].txn.as_mut().filter(|t| t.is_open()) else {
            return Err(Abort::new(AbortCause::Conflict));
        };
        let result = match kind {
            AccessKind::Read => {
                let seen = txn.versions.read(addr, memory);
                txn.last_load = Some((addr, seen));
                if let Some(values) = values.as_mut() {
                    values.record_read(core, addr, seen);
                }
                seen
            }
            AccessKind::Write => {
                if let Some(values) = values.as_mut() {
                    values.record_write(core, addr, memory.read(addr));
                }
                txn.versions.write(addr, value, memory);
                value
            }
        };
        if kind.is_write() && txn.versions.mode() == VersioningMode::Eager {
            st.broadcast_store(core, line);
        }
        if let Some(isolation) = st.isolation.as_mut() {
            isolation.record(core, line, kind);
            if self.detector.checks_access(true) {
                isolation.check_access(core, line, kind);
            }
        }
        Ok(result)
    }

    fn abort_locked(&self, st: &mut SystemState, core: CoreId, cause: AbortCause) -> Abort {
        st.abort_txn(core, cause);
        self.notify();
        Abort::new(cause)
    }
}
