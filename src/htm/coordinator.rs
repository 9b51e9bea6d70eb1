use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::htm::cache::hash_u64;
use crate::htm::error::Abort;
use crate::htm::system::HtmSystem;
use crate::htm::types::{AbortCause, Addr, CoreId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome<R> {
    Committed { value: R, retries: u32 },
    /// Ran non-speculatively under the fallback lock after `aborts` failed
    /// attempts.
    FellBack { value: R, aborts: u32 },
}

impl<R> TxnOutcome<R> {
    pub fn value(&self) -> &R {
        match self {
            Self::Committed { value, .. } | Self::FellBack { value, .. } => value,
        }
    }

    pub fn into_value(self) -> R {
        match self {
            Self::Committed { value, .. } | Self::FellBack { value, .. } => value,
        }
    }

    pub fn aborts(&self) -> u32 {
        match self {
            Self::Committed { retries, .. } => *retries,
            Self::FellBack { aborts, .. } => *aborts,
        }
    }

    pub fn fell_back(&self) -> bool {
        matches!(self, Self::FellBack { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(R) -> U) -> TxnOutcome<U> {
        match self {
            Self::Committed { value, retries } => TxnOutcome::Committed {
                value: f(value),
                retries,
            },
            Self::FellBack { value, aborts } => TxnOutcome::FellBack {
                value: f(value),
                aborts,
            },
        }
    }
}

/// Handle a transaction body uses for its memory accesses. Speculative
/// attempts go through detection and versioning; the fallback run issues
/// plain non-transactional accesses.
pub struct Txn<'a> {
    system: &'a HtmSystem,
    core: CoreId,
    retries: u32,
    speculative: bool,
}

impl<'a> Txn<'a> {
    pub fn read(&mut self, addr: Addr) -> Result<u64, Abort> {
        if self.speculative {
            self.system.read(self.core, addr)
        } else {
            Ok(self.system.nontx_read(self.core, addr))
        }
    }

    pub fn write(&mut self, addr: Addr, value: u64) -> Result<(), Abort> {
        if self.speculative {
            self.system.write(self.core, addr, value)
        } else {
            self.system.nontx_write(self.core, addr, value);
            Ok(())
        }
    }

    /// Explicit abort; return it from the body with `?` or directly.
    pub fn abort<T>(&mut self) -> Result<T, Abort> {
        Err(Abort::explicit())
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    pub fn core(&self) -> CoreId {
        self.core
    }
}

/// Drives transactions for one core through begin, commit, retry and the
/// fallback path.
pub struct CommitCoordinator {
    system: Arc<HtmSystem>,
    core: CoreId,
    rng: StdRng,
}

impl CommitCoordinator {
    pub fn new(system: Arc<HtmSystem>, core: CoreId) -> Self {
        let seed = hash_u64(system.config().seed ^ (core as u64).wrapping_add(1));
        Self {
            system,
            core,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn system(&self) -> &Arc<HtmSystem> {
        &self.system
    }

    /// Run `body` atomically. It is re-executed from the top on every
    /// attempt. An explicit abort raised during the fallback run is
    /// returned to the caller.
    pub fn atomic<R, F>(&mut self, mut body: F) -> Result<TxnOutcome<R>, Abort>
    where
        F: FnMut(&mut Txn<'_>) -> Result<R, Abort>,
    {
        let max_retries = self.system.config().max_retries;
        let timestamp = self.system.next_timestamp();
        let mut retries = 0;

        while retries < max_retries {
            let cause = match self.attempt(timestamp, retries, &mut body) {
                Ok(value) => {
                    self.system.finish(self.core);
                    return Ok(TxnOutcome::Committed { value, retries });
                }
                Err(cause) => cause,
            };
            retries += 1;
            debug!("core {} attempt {} aborted: {}", self.core, retries, cause);
            match cause {
                AbortCause::SpeculationDisabled => break,
                AbortCause::FallbackLock => self.system.wait_fallback_free(),
                _ => {}
            }
            if retries < max_retries {
                self.backoff(retries);
            }
        }

        info!("core {} falls back after {} aborts", self.core, retries);
        self.system.acquire_fallback_lock(self.core);
        let mut txn = Txn {
            system: &self.system,
            core: self.core,
            retries,
            speculative: false,
        };
        let result = body(&mut txn);
        self.system.release_fallback_lock(self.core);
        let value = result?;
        self.system.record_fallback(self.core);
        Ok(TxnOutcome::FellBack {
            value,
            aborts: retries,
        })
    }

    fn attempt<R, F>(&self, timestamp: u64, retries: u32, body: &mut F) -> Result<R, AbortCause>
    where
        F: FnMut(&mut Txn<'_>) -> Result<R, Abort>,
    {
        let system = &*self.system;
        if let Err(abort) = system.begin(self.core, timestamp) {
            system.finish(self.core);
            return Err(abort.cause);
        }
        let mut txn = Txn {
            system,
            core: self.core,
            retries,
            speculative: true,
        };
        let result = body(&mut txn).and_then(|value| system.commit(self.core).map(|_| value));
        match result {
            Ok(value) => Ok(value),
            Err(abort) => {
                let cause = system.abort(self.core, abort.cause).cause;
                system.finish(self.core);
                Err(cause)
            }
        }
    }

    /// Randomized exponential backoff before the next attempt.
    fn backoff(&mut self, retries: u32) {
        let config = self.system.config();
        if !config.backoff || config.backoff_base_us == 0 {
            return;
        }
        let shift = retries.min(config.backoff_max_shift).min(32);
        let window = config.backoff_base_us.saturating_mul(1 << shift);
        let wait = self.rng.gen_range(0..=window);
        thread::sleep(Duration::from_micros(wait));
    }
}
