use std::cmp::Ordering;

use crate::htm::config::ConflictResolutionPolicy;
use crate::htm::detect::Phase;
use crate::htm::types::{CoreId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AbortHolder,
    AbortRequester,
    /// Stall the requester and retry the access later.
    Nack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub decision: Decision,
    /// The holder nacked an older requester and may be part of a cycle.
    pub holder_possible_cycle: bool,
}

impl Resolution {
    fn plain(decision: Decision) -> Self {
        Self {
            decision,
            holder_possible_cycle: false,
        }
    }
}

/// What the resolver needs to know about one requester/holder pair.
#[derive(Debug, Clone, Copy)]
pub struct ConflictView {
    pub phase: Phase,
    pub requester_core: CoreId,
    /// `None` for a non-transactional requester.
    pub requester_timestamp: Option<Timestamp>,
    pub requester_writes: bool,
    pub requester_possible_cycle: bool,
    pub holder_core: CoreId,
    pub holder_timestamp: Timestamp,
    pub holder_writes: bool,
}

impl ConflictView {
    /// Age order of the requester relative to the holder: earlier begin
    /// timestamp is older, ties go to the lower core id.
    fn requester_age(&self, requester_ts: Timestamp) -> Ordering {
        (requester_ts, self.requester_core).cmp(&(self.holder_timestamp, self.holder_core))
    }
}

pub fn resolve(policy: ConflictResolutionPolicy, view: &ConflictView) -> Resolution {
    use ConflictResolutionPolicy::*;

    match policy {
        RequesterWins => Resolution::plain(Decision::AbortHolder),
        // at commit the committer is the requester
        CommitterWins => Resolution::plain(Decision::AbortHolder),
        RequesterStallsCdaBase
        | RequesterStallsCdaBaseNtx
        | RequesterStallsCdaHybrid
        | RequesterStallsCdaHybridNtx => resolve_stalling(policy, view),
    }
}

fn resolve_stalling(policy: ConflictResolutionPolicy, view: &ConflictView) -> Resolution {
    let Some(requester_ts) = view.requester_timestamp else {
        return if policy.nacks_non_transactional() {
            Resolution::plain(Decision::Nack)
        } else {
            Resolution::plain(Decision::AbortHolder)
        };
    };
    let requester_older = view.requester_age(requester_ts) == Ordering::Less;

    if policy.is_hybrid() && requester_older && view.requester_writes && !view.holder_writes {
        return Resolution::plain(Decision::AbortHolder);
    }
    if requester_older {
        Resolution {
            decision: Decision::Nack,
            holder_possible_cycle: true,
        }
    } else if view.requester_possible_cycle {
        Resolution::plain(Decision::AbortRequester)
    } else {
        Resolution::plain(Decision::Nack)
    }
}
