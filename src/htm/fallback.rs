use log::{debug, info};

use crate::htm::system::HtmSystem;
use crate::htm::types::{Addr, CoreId};

/// The single global lock taken by transactions that exhausted their
/// retries. Every transaction reads its word at begin, so taking the lock
/// conflicts with all of them.
#[derive(Debug)]
pub struct FallbackLock {
    addr: Addr,
    holder: Option<CoreId>,
    acquisitions: u64,
}

impl FallbackLock {
    pub fn new(addr: Addr) -> Self {
        Self {
            addr,
            holder: None,
            acquisitions: 0,
        }
    }

    pub fn holder(&self) -> Option<CoreId> {
        self.holder
    }

    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }
}

impl HtmSystem {
    /// Block until the fallback lock is free, take it, then store the lock
    /// word non-transactionally so subscribed transactions are knocked out.
    pub fn acquire_fallback_lock(&self, core: CoreId) {
        let mut st = self.lock();
        while st.fallback.is_held() {
            st = self.wait(st);
        }
        st.fallback.holder = Some(core);
        st.fallback.acquisitions += 1;
        let addr = st.fallback.addr;
        drop(st);
        debug!("core {} takes the fallback lock", core);
        self.nontx_write(core, addr, core as u64 + 1);
    }

    pub fn release_fallback_lock(&self, core: CoreId) {
        let mut st = self.lock();
        assert_eq!(
            st.fallback.holder,
            Some(core),
            "core {} releasing a fallback lock it does not hold",
            core
        );
        let addr = st.fallback.addr;
        let line = self.line_of(addr);
        st.store_untracked(core, addr, line, 0);
        st.fallback.holder = None;
        drop(st);
        self.notify();
        debug!("core {} releases the fallback lock", core);
    }

    pub fn fallback_lock_holder(&self) -> Option<CoreId> {
        self.lock().fallback.holder()
    }

    pub fn fallback_acquisitions(&self) -> u64 {
        self.lock().fallback.acquisitions()
    }

    /// Park until nobody holds the fallback lock.
    pub fn wait_fallback_free(&self) {
        let mut st = self.lock();
        if st.fallback.is_held() {
            info!("waiting for fallback lock held by core {:?}", st.fallback.holder());
        }
        while st.fallback.is_held() {
            st = self.wait(st);
        }
    }
}
