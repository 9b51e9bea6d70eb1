use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::Serialize;

use crate::htm::types::AbortCause;

#[derive(Debug, Clone, Default, Serialize)]
pub struct HtmStats {
    commits: u64,
    aborts: BTreeMap<AbortCause, u64>,
    fallbacks: u64,
    nacks: u64,
    stall_escalations: u64,
    stale_reloads: u64,
    detector_invocations: u64,
    l0_downgrades: u64,
    tracked_evictions: u64,
}

impl HtmStats {
    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn aborts(&self, cause: AbortCause) -> u64 {
        self.aborts.get(&cause).copied().unwrap_or(0)
    }

    pub fn total_aborts(&self) -> u64 {
        self.aborts.values().sum()
    }

    pub fn capacity_aborts(&self) -> u64 {
        self.aborts_where(AbortCause::is_capacity)
    }

    pub fn conflict_aborts(&self) -> u64 {
        self.aborts_where(AbortCause::is_conflict)
    }

    fn aborts_where(&self, pred: impl Fn(AbortCause) -> bool) -> u64 {
        self.aborts
            .iter()
            .filter(|(cause, _)| pred(**cause))
            .map(|(_, count)| count)
            .sum()
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    pub fn nacks(&self) -> u64 {
        self.nacks
    }

    pub fn stall_escalations(&self) -> u64 {
        self.stall_escalations
    }

    pub fn stale_reloads(&self) -> u64 {
        self.stale_reloads
    }

    pub fn detector_invocations(&self) -> u64 {
        self.detector_invocations
    }

    pub fn l0_downgrades(&self) -> u64 {
        self.l0_downgrades
    }

    pub fn tracked_evictions(&self) -> u64 {
        self.tracked_evictions
    }

    pub fn record_commit(&mut self) {
        self.commits = self.commits.saturating_add(1);
    }

    pub fn record_abort(&mut self, cause: AbortCause) {
        let count = self.aborts.entry(cause).or_insert(0);
        *count = count.saturating_add(1);
    }

    pub fn record_fallback(&mut self) {
        self.fallbacks = self.fallbacks.saturating_add(1);
    }

    pub fn record_nack(&mut self) {
        self.nacks = self.nacks.saturating_add(1);
    }

    pub fn record_stall_escalation(&mut self) {
        self.stall_escalations = self.stall_escalations.saturating_add(1);
    }

    pub fn record_stale_reload(&mut self) {
        self.stale_reloads = self.stale_reloads.saturating_add(1);
    }

    pub fn record_detector_invocation(&mut self) {
        self.detector_invocations = self.detector_invocations.saturating_add(1);
    }

    pub fn record_l0_downgrade(&mut self) {
        self.l0_downgrades = self.l0_downgrades.saturating_add(1);
    }

    pub fn record_tracked_evictions(&mut self, count: u32) {
        self.tracked_evictions = self.tracked_evictions.saturating_add(count as u64);
    }
}

impl AddAssign<&HtmStats> for HtmStats {
    fn add_assign(&mut self, other: &HtmStats) {
        self.commits = self.commits.saturating_add(other.commits);
        for (cause, count) in &other.aborts {
            let mine = self.aborts.entry(*cause).or_insert(0);
            *mine = mine.saturating_add(*count);
        }
        self.fallbacks = self.fallbacks.saturating_add(other.fallbacks);
        self.nacks = self.nacks.saturating_add(other.nacks);
        self.stall_escalations = self
            .stall_escalations
            .saturating_add(other.stall_escalations);
        self.stale_reloads = self.stale_reloads.saturating_add(other.stale_reloads);
        self.detector_invocations = self
            .detector_invocations
            .saturating_add(other.detector_invocations);
        self.l0_downgrades = self.l0_downgrades.saturating_add(other.l0_downgrades);
        self.tracked_evictions = self
            .tracked_evictions
            .saturating_add(other.tracked_evictions);
    }
}

impl AddAssign<HtmStats> for HtmStats {
    fn add_assign(&mut self, other: HtmStats) {
        *self += &other;
    }
}
