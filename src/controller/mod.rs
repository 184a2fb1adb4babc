//! Cluster reconciler
//!
//! The reconciler follows the controller pattern: read the record, decide
//! the single next transition from the current phase, act on the IaaS
//! provisioner and persist the result. Phase-specific work lives in
//! `phases`, the edge table in [`transitions`] and the keyed work queue in
//! [`scheduler`].

mod cluster;
mod phases;
pub mod scheduler;
pub mod transitions;

use std::time::Duration;

pub use cluster::{error_policy, reconcile, reconcile_key, Context, ContextBuilder};
pub use scheduler::Scheduler;

/// What the scheduler should do with a key after a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Reconcile again after the delay
    Requeue(Duration),
    /// Do nothing until the record changes
    AwaitChange,
}

impl Action {
    /// Reconcile again after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }

    /// Wait for the next change of the record
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Requeue delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Requeue(delay) => Some(*delay),
            Self::AwaitChange => None,
        }
    }
}
