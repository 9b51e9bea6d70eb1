use std::collections::VecDeque;

use crate::htm::config::LazyArbitration;
use crate::htm::types::CoreId;

/// Serializes lazy-detection commits. `Magic` grants immediately (the
/// system mutex already orders commits); `Token` hands a single commit
/// token out in request order.
#[derive(Debug)]
pub struct CommitArbiter {
    mode: LazyArbitration,
    queue: VecDeque<CoreId>,
}

impl CommitArbiter {
    pub fn new(mode: LazyArbitration) -> Self {
        Self {
            mode,
            queue: VecDeque::new(),
        }
    }

    /// Ask for the commit token. Returns whether `core` holds it now;
    /// repeated requests keep the original queue position.
    pub fn request(&mut self, core: CoreId) -> bool {
        match self.mode {
            LazyArbitration::Magic => true,
            LazyArbitration::Token => {
                if !self.queue.contains(&core) {
                    self.queue.push_back(core);
                }
                self.queue.front() == Some(&core)
            }
        }
    }

    pub fn release(&mut self, core: CoreId) {
        self.queue.retain(|&c| c != core);
    }

}
