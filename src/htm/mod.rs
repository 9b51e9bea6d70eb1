pub mod arbiter;
pub mod cache;
pub mod checker;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod evict;
pub mod fallback;
pub mod memory;
pub mod resolve;
pub mod rwset;
pub mod stats;
pub mod system;
pub mod types;
pub mod version;

mod unit_tests;

pub use cache::CacheConfig;
pub use config::{ConflictResolutionPolicy, HtmConfig, LazyArbitration, ValidatedConfig};
pub use coordinator::{CommitCoordinator, Txn, TxnOutcome};
pub use error::{Abort, ConfigError};
pub use stats::HtmStats;
pub use system::HtmSystem;
pub use types::{AbortCause, AccessKind, Addr, CoreId, TxnId, TxnState};
