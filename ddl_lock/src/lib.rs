//! Distributed DDL interlock: a global-lock coordination protocol for a
//! multi-master, logically-replicated database cluster. See `SPEC_FULL.md`
//! at the workspace root for the full design.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod journal;
pub mod lock_state;
pub mod metrics;
pub mod protocol;
pub mod transport;
pub mod waiter_gate;

pub use config::Config;
pub use coordinator::{Coordinator, LockGuard};
pub use error::CoordinatorError;
pub use lock_state::LockKind;
