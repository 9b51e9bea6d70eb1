use std::sync::Arc;
use std::thread;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::htm::cache::hash_u64;
use crate::htm::{Abort, CacheConfig, CommitCoordinator, HtmStats, HtmSystem, TxnOutcome, ValidatedConfig};
use crate::sim::config::{SimConfig, Workload};

/// What one core saw while running its share of the workload.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CoreReport {
    pub committed: u64,
    pub fell_back: u64,
    pub audits: u64,
    pub audit_mismatches: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub htm: String,
    pub workload: Workload,
    pub cores: Vec<CoreReport>,
    pub per_core_stats: Vec<HtmStats>,
    pub total: HtmStats,
    pub expected_sum: u64,
    pub final_sum: u64,
}

impl RunReport {
    pub fn invariant_holds(&self) -> bool {
        self.final_sum == self.expected_sum
            && self.cores.iter().all(|c| c.audit_mismatches == 0)
    }

    pub fn committed(&self) -> u64 {
        self.cores.iter().map(|c| c.committed).sum()
    }

    pub fn fell_back(&self) -> u64 {
        self.cores.iter().map(|c| c.fell_back).sum()
    }
}

pub struct HtmTop {
    pub sim: SimConfig,
    pub system: Arc<HtmSystem>,
}

impl HtmTop {
    pub fn new(sim: SimConfig, htm: ValidatedConfig, cache: CacheConfig) -> HtmTop {
        sim.ensure_valid();
        let system = Arc::new(HtmSystem::new(htm, cache, sim.cores));
        let top = HtmTop { sim, system };
        top.seed_memory();
        top
    }

    fn seed_memory(&self) {
        let sys = &self.system;
        if sys.config().heap_prefault {
            sys.prefault(self.sim.heap_base, self.sim.heap_bytes());
        }
        if self.sim.workload == Workload::Bank {
            for i in 0..self.sim.accounts {
                sys.nontx_write(0, self.sim.account_addr(i), self.sim.initial_balance);
            }
        }
    }

    fn expected_sum(&self) -> u64 {
        match self.sim.workload {
            Workload::Bank => self.sim.initial_balance * self.sim.accounts as u64,
            Workload::Counter => (self.sim.cores * self.sim.txns_per_core) as u64,
        }
    }

    fn final_sum(&self) -> u64 {
        match self.sim.workload {
            Workload::Bank => (0..self.sim.accounts)
                .map(|i| self.system.peek(self.sim.account_addr(i)))
                .sum(),
            Workload::Counter => self.system.peek(self.sim.account_addr(0)),
        }
    }

    /// Run every core on its own thread until each has finished
    /// `txns_per_core` transactions.
    pub fn run(&self) -> Result<RunReport, Abort> {
        info!(
            "running {:?} on {} cores with {}",
            self.sim.workload,
            self.sim.cores,
            self.system.config().describe()
        );
        let cores = thread::scope(|s| {
            let handles: Vec<_> = (0..self.sim.cores)
                .map(|core| s.spawn(move || self.run_core(core)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("core thread panicked"))
                .collect::<Result<Vec<_>, Abort>>()
        })?;

        let per_core_stats = (0..self.sim.cores).map(|c| self.system.stats(c)).collect();
        Ok(RunReport {
            htm: self.system.config().describe(),
            workload: self.sim.workload,
            cores,
            per_core_stats,
            total: self.system.total_stats(),
            expected_sum: self.expected_sum(),
            final_sum: self.final_sum(),
        })
    }

    fn run_core(&self, core: usize) -> Result<CoreReport, Abort> {
        let sim = &self.sim;
        let mut rng = StdRng::seed_from_u64(hash_u64(sim.seed ^ core as u64));
        let mut coord = CommitCoordinator::new(Arc::clone(&self.system), core);
        let mut report = CoreReport::default();

        for _ in 0..sim.txns_per_core {
            let outcome = match sim.workload {
                Workload::Counter => {
                    let addr = sim.account_addr(0);
                    coord.atomic(|tx| {
                        let v = tx.read(addr)?;
                        tx.write(addr, v + 1)
                    })?
                }
                Workload::Bank if rng.gen_bool(sim.audit_ratio) => {
                    let outcome = coord.atomic(|tx| {
                        let mut sum = 0;
                        for i in 0..sim.accounts {
                            sum += tx.read(sim.account_addr(i))?;
                        }
                        Ok(sum)
                    })?;
                    report.audits += 1;
                    if *outcome.value() != self.expected_sum() {
                        report.audit_mismatches += 1;
                    }
                    outcome.map(|_| ())
                }
                Workload::Bank => {
                    let from = rng.gen_range(0..sim.accounts);
                    let to = (from + rng.gen_range(1..sim.accounts)) % sim.accounts;
                    let amount = rng.gen_range(1..=sim.initial_balance / 4 + 1);
                    let (from, to) = (sim.account_addr(from), sim.account_addr(to));
                    coord.atomic(|tx| {
                        let a = tx.read(from)?;
                        let b = tx.read(to)?;
                        let moved = amount.min(a);
                        tx.write(from, a - moved)?;
                        tx.write(to, b + moved)
                    })?
                }
            };
            match outcome {
                TxnOutcome::Committed { .. } => report.committed += 1,
                TxnOutcome::FellBack { .. } => report.fell_back += 1,
            }
        }
        debug!("core {} done: {:?}", core, report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htm::config::PRESETS;
    use crate::htm::HtmConfig;

    fn small(workload: Workload) -> SimConfig {
        SimConfig {
            workload,
            cores: 4,
            txns_per_core: 100,
            accounts: 16,
            audit_ratio: 0.2,
            ..SimConfig::default()
        }
    }

    fn run(sim: SimConfig, htm: HtmConfig) -> RunReport {
        let top = HtmTop::new(sim, htm.validate().unwrap(), CacheConfig::default());
        top.run().unwrap()
    }

    #[test]
    fn bank_preserves_balance_under_every_preset() {
        for name in PRESETS {
            let report = run(small(Workload::Bank), HtmConfig::preset(name).unwrap());
            assert!(report.invariant_holds(), "{}: {:?}", name, report);
            assert_eq!(report.committed() + report.fell_back(), 400, "{}", name);
        }
    }

    #[test]
    fn counter_counts_every_transaction() {
        let report = run(small(Workload::Counter), HtmConfig::default());
        assert_eq!(report.final_sum, 400);
        assert_eq!(
            report.total.commits() + report.total.fallbacks(),
            400
        );
    }

    #[test]
    fn speculation_disabled_always_falls_back() {
        let htm = HtmConfig {
            disable_speculation: true,
            ..HtmConfig::default()
        };
        let report = run(small(Workload::Counter), htm);
        assert_eq!(report.fell_back(), 400);
        assert_eq!(report.total.commits(), 0);
        assert_eq!(report.final_sum, 400);
    }

    #[test]
    fn bank_passes_shadow_checks() {
        for name in ["cfg1_base", "cfg1_l1rsetevict_pf_dwng_lazycd_token_cw"] {
            let htm = HtmConfig {
                isolation_checker: true,
                value_checker: true,
                ..HtmConfig::preset(name).unwrap()
            };
            let report = run(small(Workload::Bank), htm);
            assert!(report.invariant_holds(), "{}: {:?}", name, report);
            assert!(report.htm.ends_with("IsoChk_ValChk"), "{}", report.htm);
        }
    }

    #[test]
    fn single_core_never_aborts_on_conflict() {
        let sim = SimConfig {
            cores: 1,
            ..small(Workload::Bank)
        };
        let report = run(sim, HtmConfig::default());
        assert_eq!(report.total.aborts(crate::htm::AbortCause::Conflict), 0);
        assert_eq!(report.committed(), 100);
        assert!(report.invariant_holds());
    }
}
