//! Local state persistence for the agent.
//!
//! The runtime's container records are the source of truth for what a
//! container *is*. What it *should be doing* lives here instead: a small
//! SQLite table of desired status keyed by container ID. A container without
//! a row is not supervisor-managed and is left alone by reconciliation.

mod store;

pub use store::{DesiredState, DesiredStateStore, StoreError};
