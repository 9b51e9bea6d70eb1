use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::htm::cache::CacheConfig;
use crate::htm::config::{ConflictResolutionPolicy, HtmConfig};
use crate::htm::error::Abort;
use crate::htm::system::HtmSystem;
use crate::htm::types::{AbortCause, TxnState};

const A: u64 = 0x1000;
const B: u64 = 0x1040;

fn stalling(policy: ConflictResolutionPolicy, stall_limit: u32) -> Arc<HtmSystem> {
    let config = HtmConfig {
        conflict_resolution: policy,
        precise_read_set_tracking: true,
        stall_limit,
        stall_timeout_us: 100,
        ..HtmConfig::default()
    };
    Arc::new(HtmSystem::new(
        config.validate().unwrap(),
        CacheConfig::default(),
        2,
    ))
}

fn wait_for_nack(sys: &HtmSystem, core: usize) {
    while sys.stats(core).nacks() == 0 {
        thread::sleep(Duration::from_micros(50));
    }
}

#[test]
fn younger_requester_waits_for_older_writer() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaBase, 1_000_000);
    let (old, young) = (sys.next_timestamp(), sys.next_timestamp());
    sys.begin(0, old).unwrap();
    sys.write(0, A, 7).unwrap();
    sys.begin(1, young).unwrap();

    let reader = {
        let sys = Arc::clone(&sys);
        thread::spawn(move || sys.read(1, A))
    };
    wait_for_nack(&sys, 1);
    assert_eq!(sys.txn_state(0), TxnState::Active);
    assert_eq!(sys.txn_state(1), TxnState::Active);
    sys.commit(0).unwrap();

    assert_eq!(reader.join().unwrap(), Ok(7));
    sys.commit(1).unwrap();
    assert_eq!(sys.stats(1).stall_escalations(), 0);
}

#[test]
fn stall_escalates_after_limit() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaBase, 3);
    let (old, young) = (sys.next_timestamp(), sys.next_timestamp());
    sys.begin(0, old).unwrap();
    sys.write(0, A, 7).unwrap();
    sys.begin(1, young).unwrap();

    assert_eq!(sys.read(1, A), Err(Abort::new(AbortCause::Conflict)));
    assert_eq!(sys.stats(1).nacks(), 3);
    assert_eq!(sys.stats(1).stall_escalations(), 1);
    assert_eq!(sys.txn_state(0), TxnState::Active);
    sys.commit(0).unwrap();
}

#[test]
fn younger_requester_in_possible_cycle_aborts_itself() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaBase, 1_000_000);
    let (old, young) = (sys.next_timestamp(), sys.next_timestamp());
    sys.begin(0, old).unwrap();
    sys.begin(1, young).unwrap();
    sys.write(1, A, 1).unwrap();
    sys.write(0, B, 2).unwrap();

    // the older core stalls on A and marks the younger holder
    let older = {
        let sys = Arc::clone(&sys);
        thread::spawn(move || sys.read(0, A))
    };
    wait_for_nack(&sys, 0);

    // closing the cycle: the younger core now needs B
    assert_eq!(sys.read(1, B), Err(Abort::new(AbortCause::Conflict)));
    assert_eq!(older.join().unwrap(), Ok(0));
    sys.commit(0).unwrap();
    assert_eq!(sys.peek(B), 2);
    assert_eq!(sys.peek(A), 0);
}

#[test]
fn hybrid_lets_older_writer_abort_younger_reader() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaHybrid, 2);
    let (old, young) = (sys.next_timestamp(), sys.next_timestamp());
    sys.begin(0, old).unwrap();
    sys.begin(1, young).unwrap();
    sys.read(1, A).unwrap();

    sys.write(0, A, 3).unwrap();
    assert_eq!(sys.txn_state(1), TxnState::Aborted);
    assert_eq!(sys.stats(0).nacks(), 0);
}

#[test]
fn base_policy_stalls_older_writer_on_younger_reader() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaBase, 2);
    let (old, young) = (sys.next_timestamp(), sys.next_timestamp());
    sys.begin(0, old).unwrap();
    sys.begin(1, young).unwrap();
    sys.read(1, A).unwrap();

    assert_eq!(sys.write(0, A, 3), Err(Abort::new(AbortCause::Conflict)));
    assert_eq!(sys.stats(0).nacks(), 2);
    assert_eq!(sys.txn_state(1), TxnState::Active);
}

#[test]
fn non_transactional_writer_wins_unless_ntx_policy() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaBase, 2);
    let ts = sys.next_timestamp();
    sys.begin(0, ts).unwrap();
    sys.write(0, A, 1).unwrap();
    sys.nontx_write(1, A, 9);
    assert_eq!(sys.txn_state(0), TxnState::Aborted);
    assert_eq!(sys.stats(1).nacks(), 0);
    assert_eq!(sys.peek(A), 9);
}

#[test]
fn ntx_policy_stalls_non_transactional_writer() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaBaseNtx, 2);
    let ts = sys.next_timestamp();
    sys.begin(0, ts).unwrap();
    sys.write(0, A, 1).unwrap();
    sys.nontx_write(1, A, 9);
    assert_eq!(sys.stats(1).nacks(), 2);
    assert_eq!(sys.stats(1).stall_escalations(), 1);
    assert_eq!(sys.txn_state(0), TxnState::Aborted);
    assert_eq!(sys.peek(A), 9);
}

#[test]
fn ntx_policy_releases_writer_when_holder_commits() {
    let sys = stalling(ConflictResolutionPolicy::RequesterStallsCdaHybridNtx, 1_000_000);
    let ts = sys.next_timestamp();
    sys.begin(0, ts).unwrap();
    sys.write(0, A, 1).unwrap();

    let writer = {
        let sys = Arc::clone(&sys);
        thread::spawn(move || sys.nontx_write(1, A, 9))
    };
    wait_for_nack(&sys, 1);
    sys.commit(0).unwrap();
    writer.join().unwrap();
    assert_eq!(sys.peek(A), 9);
    assert_eq!(sys.stats(0).commits(), 1);
}
