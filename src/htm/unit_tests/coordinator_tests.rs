use std::sync::Arc;
use std::thread;

use crate::htm::cache::CacheConfig;
use crate::htm::config::{ConflictResolutionPolicy, HtmConfig};
use crate::htm::coordinator::{CommitCoordinator, TxnOutcome};
use crate::htm::error::Abort;
use crate::htm::system::HtmSystem;
use crate::htm::types::AbortCause;

const A: u64 = 0x1000;
const B: u64 = 0x1040;

fn quiet(config: HtmConfig) -> HtmConfig {
    HtmConfig {
        backoff: false,
        ..config
    }
}

fn system(config: HtmConfig, cores: usize) -> Arc<HtmSystem> {
    Arc::new(HtmSystem::new(
        quiet(config).validate().unwrap(),
        CacheConfig::default(),
        cores,
    ))
}

#[test]
fn retry_counter_grows_and_resets() {
    let sys = system(HtmConfig::default(), 1);
    let mut coord = CommitCoordinator::new(Arc::clone(&sys), 0);
    let mut seen = Vec::new();
    let outcome = coord
        .atomic(|tx| {
            seen.push(tx.retries());
            if tx.retries() < 3 {
                return tx.abort();
            }
            tx.write(A, 1)?;
            Ok(tx.retries())
        })
        .unwrap();
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert_eq!(outcome, TxnOutcome::Committed { value: 3, retries: 3 });
    assert_eq!(sys.stats(0).aborts(AbortCause::Explicit), 3);

    let outcome = coord.atomic(|tx| Ok(tx.retries())).unwrap();
    assert_eq!(outcome, TxnOutcome::Committed { value: 0, retries: 0 });
}

#[test]
fn conflicting_reader_forces_one_retry() {
    for lazy_vm in [true, false] {
        let sys = system(HtmConfig { lazy_vm, ..HtmConfig::default() }, 2);
        sys.nontx_write(0, A, 10);
        let mut coord = CommitCoordinator::new(Arc::clone(&sys), 0);
        let mut observed = None;
        let outcome = coord
            .atomic(|tx| {
                tx.write(A, 11)?;
                if tx.retries() == 0 {
                    // another core reads A while this attempt still owns it
                    let ts = sys.next_timestamp();
                    sys.begin(1, ts).unwrap();
                    observed = Some(sys.read(1, A).unwrap());
                    sys.commit(1).unwrap();
                    sys.finish(1);
                }
                tx.write(B, 1)
            })
            .unwrap();
        assert_eq!(observed, Some(10));
        assert_eq!(outcome, TxnOutcome::Committed { value: (), retries: 1 });
        assert_eq!((sys.peek(A), sys.peek(B)), (11, 1));
        assert_eq!(sys.stats(0).aborts(AbortCause::Conflict), 1);
    }
}

#[test]
fn exhausted_retries_fall_back_without_detection() {
    let config = HtmConfig {
        max_retries: 3,
        ..HtmConfig::default()
    };
    let sys = system(config, 2);
    let mut coord = CommitCoordinator::new(Arc::clone(&sys), 0);
    let outcome = coord
        .atomic(|tx| {
            let v = tx.read(A)?;
            if tx.is_speculative() {
                sys.nontx_write(1, A, v + 100);
            }
            tx.write(A, v + 1)?;
            Ok(v)
        })
        .unwrap();

    assert_eq!(outcome, TxnOutcome::FellBack { value: 300, aborts: 3 });
    assert_eq!(sys.peek(A), 301);
    let stats = sys.stats(0);
    // begin and the first read of each speculative attempt
    assert_eq!(stats.detector_invocations(), 6);
    assert_eq!(stats.aborts(AbortCause::Conflict), 3);
    assert_eq!(stats.fallbacks(), 1);
    assert_eq!(stats.commits(), 0);
    assert_eq!(sys.fallback_lock_holder(), None);
    assert_eq!(sys.peek(sys.config().fallback_lock_addr), 0);
}

#[test]
fn explicit_abort_in_fallback_reaches_caller() {
    let config = HtmConfig {
        max_retries: 2,
        ..HtmConfig::default()
    };
    let sys = system(config, 1);
    let mut coord = CommitCoordinator::new(Arc::clone(&sys), 0);
    let result: Result<TxnOutcome<()>, Abort> = coord.atomic(|tx| tx.abort());
    assert_eq!(result, Err(Abort::explicit()));
    assert_eq!(sys.fallback_lock_holder(), None);
    assert_eq!(sys.stats(0).fallbacks(), 0);
    assert_eq!(sys.stats(0).aborts(AbortCause::Explicit), 2);
}

#[test]
fn disabled_speculation_goes_straight_to_fallback() {
    let config = HtmConfig {
        disable_speculation: true,
        ..HtmConfig::default()
    };
    let sys = system(config, 1);
    let mut coord = CommitCoordinator::new(Arc::clone(&sys), 0);
    let mut runs = 0;
    let outcome = coord
        .atomic(|tx| {
            runs += 1;
            assert!(!tx.is_speculative());
            tx.write(A, 5)
        })
        .unwrap();
    assert_eq!(runs, 1);
    assert_eq!(outcome, TxnOutcome::FellBack { value: (), aborts: 1 });
    assert_eq!(sys.stats(0).aborts(AbortCause::SpeculationDisabled), 1);
    assert_eq!(sys.peek(A), 5);
}

#[test]
fn outcome_accessors() {
    let committed = TxnOutcome::Committed { value: 4, retries: 2 };
    assert_eq!(*committed.value(), 4);
    assert_eq!(committed.aborts(), 2);
    assert!(!committed.fell_back());
    let fell_back = TxnOutcome::FellBack { value: 4, aborts: 6 }.map(|v| v * 2);
    assert!(fell_back.fell_back());
    assert_eq!(fell_back.into_value(), 8);
}

fn hammer_counter(config: HtmConfig, cores: usize, per_core: u64) -> Arc<HtmSystem> {
    let sys = system(config, cores);
    thread::scope(|s| {
        for core in 0..cores {
            let sys = Arc::clone(&sys);
            s.spawn(move || {
                let mut coord = CommitCoordinator::new(sys, core);
                for _ in 0..per_core {
                    coord
                        .atomic(|tx| {
                            let v = tx.read(A)?;
                            tx.write(A, v + 1)
                        })
                        .unwrap();
                }
            });
        }
    });
    sys
}

#[test]
fn contended_counter_is_exact_under_each_policy() {
    let configs = [
        HtmConfig::default(),
        HtmConfig {
            lazy_vm: false,
            ..HtmConfig::default()
        },
        HtmConfig::preset("cfg1_l1rsetevict_pf_dwng_lazycd_token_cw").unwrap(),
        HtmConfig {
            conflict_resolution: ConflictResolutionPolicy::RequesterStallsCdaBase,
            ..HtmConfig::default()
        },
        HtmConfig::preset("cfg1_l1rsetevict_pf_dwng_precise_reqstalls").unwrap(),
    ];
    for config in configs {
        let sys = hammer_counter(config, 4, 50);
        assert_eq!(sys.peek(A), 200);
        let stats = sys.total_stats();
        assert_eq!(stats.commits() + stats.fallbacks(), 200);
    }
}
